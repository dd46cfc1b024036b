//! Single-producer/single-consumer queues backing asynchronous boundaries.
//!
//! One thread offers, one thread polls; which threads those are may change
//! over time (the drain right hands the consumer role around), but never two
//! at once. The queues publish slots with release/acquire ordering instead
//! of locking.

mod spsc_array;
mod spsc_linked_array;

pub use spsc_array::SpscArrayQueue;
pub use spsc_linked_array::SpscLinkedArrayQueue;

/// Common queue surface used by drain loops.
///
/// `offer` never blocks: a bounded queue that is genuinely full fails fast,
/// which callers treat as a backpressure protocol violation rather than a
/// recoverable condition.
pub trait Queue<T>: Send + Sync {
  fn offer(&self, value: T) -> bool;

  fn poll(&self) -> Option<T>;

  fn is_empty(&self) -> bool;

  /// Discards buffered values. Only legal with the consumer role held.
  fn clear(&self) {
    while self.poll().is_some() {}
  }
}

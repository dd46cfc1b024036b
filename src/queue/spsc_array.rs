//! Bounded SPSC ring buffer.

use std::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  sync::atomic::{AtomicUsize, Ordering},
};

use super::Queue;

/// Fixed-capacity single-producer/single-consumer queue.
///
/// Capacity is rounded up to the next power of two. The producer owns the
/// write index, the consumer owns the read index; each publishes its index
/// with a release store so the other side never observes a slot before the
/// write to it completed (and never reuses a slot before the read did).
pub struct SpscArrayQueue<T> {
  mask: usize,
  slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
  producer: AtomicUsize,
  consumer: AtomicUsize,
}

// Values move between the producer and consumer threads; the single-writer
// discipline per index is what the callers' drain right enforces.
unsafe impl<T: Send> Send for SpscArrayQueue<T> {}
unsafe impl<T: Send> Sync for SpscArrayQueue<T> {}

impl<T> SpscArrayQueue<T> {
  pub fn new(capacity: usize) -> Self {
    let capacity = capacity.max(2).next_power_of_two();
    let slots = (0..capacity)
      .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    SpscArrayQueue {
      mask: capacity - 1,
      slots,
      producer: AtomicUsize::new(0),
      consumer: AtomicUsize::new(0),
    }
  }

  pub fn capacity(&self) -> usize { self.mask + 1 }
}

impl<T: Send> Queue<T> for SpscArrayQueue<T> {
  fn offer(&self, value: T) -> bool {
    let tail = self.producer.load(Ordering::Relaxed);
    let head = self.consumer.load(Ordering::Acquire);
    if tail.wrapping_sub(head) > self.mask {
      return false;
    }
    unsafe {
      (*self.slots[tail & self.mask].get()).write(value);
    }
    self.producer.store(tail.wrapping_add(1), Ordering::Release);
    true
  }

  fn poll(&self) -> Option<T> {
    let head = self.consumer.load(Ordering::Relaxed);
    if head == self.producer.load(Ordering::Acquire) {
      return None;
    }
    let value =
      unsafe { (*self.slots[head & self.mask].get()).assume_init_read() };
    self.consumer.store(head.wrapping_add(1), Ordering::Release);
    Some(value)
  }

  fn is_empty(&self) -> bool {
    self.consumer.load(Ordering::Acquire)
      == self.producer.load(Ordering::Acquire)
  }
}

impl<T> Drop for SpscArrayQueue<T> {
  fn drop(&mut self) {
    let mut head = *self.consumer.get_mut();
    let tail = *self.producer.get_mut();
    while head != tail {
      unsafe {
        (*self.slots[head & self.mask].get()).assume_init_drop();
      }
      head = head.wrapping_add(1);
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn capacity_rounds_to_power_of_two() {
    assert_eq!(SpscArrayQueue::<i32>::new(100).capacity(), 128);
    assert_eq!(SpscArrayQueue::<i32>::new(128).capacity(), 128);
    assert_eq!(SpscArrayQueue::<i32>::new(1).capacity(), 2);
  }

  #[test]
  fn offer_fails_fast_when_full() {
    let q = SpscArrayQueue::new(2);
    assert!(q.offer(1));
    assert!(q.offer(2));
    assert!(!q.offer(3));
    assert_eq!(q.poll(), Some(1));
    assert!(q.offer(3));
    assert_eq!(q.poll(), Some(2));
    assert_eq!(q.poll(), Some(3));
    assert_eq!(q.poll(), None);
  }

  #[test]
  fn clear_leaves_the_queue_empty() {
    let q = SpscArrayQueue::new(8);
    for i in 0..5 {
      q.offer(i);
    }
    q.clear();
    assert!(q.is_empty());
    assert_eq!(q.poll(), None);
  }

  #[test]
  fn values_cross_threads_in_order() {
    let q = Arc::new(SpscArrayQueue::new(1024));
    let producer = {
      let q = q.clone();
      thread::spawn(move || {
        for i in 0..100_000u64 {
          while !q.offer(i) {
            thread::yield_now();
          }
        }
      })
    };
    let mut expected = 0u64;
    while expected < 100_000 {
      if let Some(v) = q.poll() {
        assert_eq!(v, expected);
        expected += 1;
      }
    }
    let _ = producer.join();
    assert!(q.is_empty());
  }

  #[test]
  fn drops_remaining_values() {
    let value = Arc::new(());
    {
      let q = SpscArrayQueue::new(4);
      q.offer(value.clone());
      q.offer(value.clone());
    }
    assert_eq!(Arc::strong_count(&value), 1);
  }
}

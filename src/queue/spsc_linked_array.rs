//! Growable SPSC queue made of linked fixed-size segments.

use std::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  ptr,
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use super::Queue;

struct Segment<T> {
  slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
  next: AtomicPtr<Segment<T>>,
}

impl<T> Segment<T> {
  fn alloc(capacity: usize) -> *mut Segment<T> {
    let slots = (0..capacity)
      .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
      .collect::<Vec<_>>()
      .into_boxed_slice();
    Box::into_raw(Box::new(Segment {
      slots,
      next: AtomicPtr::new(ptr::null_mut()),
    }))
  }
}

/// Unbounded single-producer/single-consumer queue.
///
/// A bounded ring that, on overflow, links a freshly allocated segment
/// instead of failing; used where prefetch cannot bound the number of
/// buffered items (group queues, unbounded concatenation). The producer
/// links a new segment *before* publishing the produced count, so a consumer
/// that observed the count always finds the link.
pub struct SpscLinkedArrayQueue<T> {
  seg_mask: usize,
  produced: AtomicUsize,
  consumed: AtomicUsize,
  /// Producer-owned cursor to the tail segment.
  tail: UnsafeCell<*mut Segment<T>>,
  /// Consumer-owned cursor to the head segment.
  head: UnsafeCell<*mut Segment<T>>,
}

unsafe impl<T: Send> Send for SpscLinkedArrayQueue<T> {}
unsafe impl<T: Send> Sync for SpscLinkedArrayQueue<T> {}

impl<T> SpscLinkedArrayQueue<T> {
  /// `segment_capacity` is rounded up to a power of two; it bounds only the
  /// allocation granularity, not the queue length.
  pub fn new(segment_capacity: usize) -> Self {
    let capacity = segment_capacity.max(2).next_power_of_two();
    let first = Segment::alloc(capacity);
    SpscLinkedArrayQueue {
      seg_mask: capacity - 1,
      produced: AtomicUsize::new(0),
      consumed: AtomicUsize::new(0),
      tail: UnsafeCell::new(first),
      head: UnsafeCell::new(first),
    }
  }
}

impl<T: Send> Queue<T> for SpscLinkedArrayQueue<T> {
  fn offer(&self, value: T) -> bool {
    let p = self.produced.load(Ordering::Relaxed);
    let offset = p & self.seg_mask;
    unsafe {
      let mut tail = *self.tail.get();
      if offset == 0 && p != 0 {
        let fresh = Segment::alloc(self.seg_mask + 1);
        (*tail).next.store(fresh, Ordering::Release);
        *self.tail.get() = fresh;
        tail = fresh;
      }
      (*(*tail).slots[offset].get()).write(value);
    }
    self.produced.store(p.wrapping_add(1), Ordering::Release);
    true
  }

  fn poll(&self) -> Option<T> {
    let c = self.consumed.load(Ordering::Relaxed);
    if c == self.produced.load(Ordering::Acquire) {
      return None;
    }
    let offset = c & self.seg_mask;
    unsafe {
      let mut head = *self.head.get();
      if offset == 0 && c != 0 {
        // The producer linked the next segment before publishing the count
        // we just observed, so the link is present.
        let next = (*head).next.load(Ordering::Acquire);
        debug_assert!(!next.is_null());
        drop(Box::from_raw(head));
        *self.head.get() = next;
        head = next;
      }
      let value = (*(*head).slots[offset].get()).assume_init_read();
      self.consumed.store(c.wrapping_add(1), Ordering::Release);
      Some(value)
    }
  }

  fn is_empty(&self) -> bool {
    self.consumed.load(Ordering::Acquire)
      == self.produced.load(Ordering::Acquire)
  }
}

impl<T> Drop for SpscLinkedArrayQueue<T> {
  fn drop(&mut self) {
    let mut c = *self.consumed.get_mut();
    let p = *self.produced.get_mut();
    unsafe {
      let mut head = *self.head.get();
      while c != p {
        let offset = c & self.seg_mask;
        if offset == 0 && c != 0 {
          let next = (*head).next.load(Ordering::Relaxed);
          drop(Box::from_raw(head));
          head = next;
        }
        (*(*head).slots[offset].get()).assume_init_drop();
        c = c.wrapping_add(1);
      }
      drop(Box::from_raw(head));
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn grows_past_the_segment_size() {
    let q = SpscLinkedArrayQueue::new(4);
    for i in 0..1000 {
      assert!(q.offer(i));
    }
    for i in 0..1000 {
      assert_eq!(q.poll(), Some(i));
    }
    assert_eq!(q.poll(), None);
    assert!(q.is_empty());
  }

  #[test]
  fn interleaved_offer_poll_across_boundaries() {
    let q = SpscLinkedArrayQueue::new(2);
    let mut next_in = 0;
    let mut next_out = 0;
    for round in 0..200 {
      for _ in 0..(round % 5) + 1 {
        q.offer(next_in);
        next_in += 1;
      }
      for _ in 0..(round % 3) + 1 {
        if let Some(v) = q.poll() {
          assert_eq!(v, next_out);
          next_out += 1;
        }
      }
    }
    while let Some(v) = q.poll() {
      assert_eq!(v, next_out);
      next_out += 1;
    }
    assert_eq!(next_in, next_out);
  }

  #[test]
  fn values_cross_threads_in_order() {
    let q = Arc::new(SpscLinkedArrayQueue::new(32));
    let producer = {
      let q = q.clone();
      thread::spawn(move || {
        for i in 0..100_000u64 {
          q.offer(i);
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
  fn drop_releases_segments_and_values() {
    let value = Arc::new(());
    {
      let q = SpscLinkedArrayQueue::new(2);
      for _ in 0..9 {
        q.offer(value.clone());
      }
      let _ = q.poll();
    }
    assert_eq!(Arc::strong_count(&value), 1);
  }
}

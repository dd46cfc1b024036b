//! Iterator-backed source.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc,
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
  error::FlowError,
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::Publisher,
  subscriber::Subscriber,
  subscription::{
    add_cap, produced, validate_demand, Subscription, Upstream, UNBOUNDED,
  },
};

/// Creates a publisher emitting every value of an iterator, then completing.
///
/// The iterable is cloned per subscription attempt, so subscribing twice
/// yields two independent sequences.
///
/// ```
/// use rxflow::prelude::*;
/// use std::sync::{Arc, Mutex};
///
/// let collected = Arc::new(Mutex::new(Vec::new()));
/// let sink = collected.clone();
/// source::from_iter(vec![1, 2, 3])
///   .subscribe(move |v| sink.lock().unwrap().push(v));
/// assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3]);
/// ```
pub fn from_iter<I>(iter: I) -> IterPublisher<I>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
{
  IterPublisher(iter)
}

#[derive(Clone)]
pub struct IterPublisher<I>(I);

impl<I> Publisher<I::Item> for IterPublisher<I>
where
  I: IntoIterator + Clone + Send + Sync + 'static,
  I::IntoIter: Send + 'static,
  I::Item: Send + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<I::Item>>) {
    let subscription = Arc::new(IterSubscription {
      downstream: subscriber.clone(),
      // The iterator is touched only with the drain right held; the lock is
      // never contended, it just gives the shared subscription interior
      // mutability.
      iter: Mutex::new(self.0.clone().into_iter().peekable()),
      requested: AtomicI64::new(0),
      cancelled: AtomicBool::new(false),
      fused: AtomicBool::new(false),
      error: OnceCell::new(),
    });
    subscriber.on_subscribe(Upstream::Fused(subscription));
  }
}

struct IterSubscription<I: Iterator> {
  downstream: Arc<dyn Subscriber<I::Item>>,
  iter: Mutex<std::iter::Peekable<I>>,
  requested: AtomicI64,
  cancelled: AtomicBool,
  fused: AtomicBool,
  error: OnceCell<FlowError>,
}

impl<I> IterSubscription<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static,
{
  fn halt(&self, err: FlowError) {
    if self.cancelled.load(Ordering::Acquire) {
      crate::error::on_error_dropped(err);
      return;
    }
    let _ = self.error.set(err);
    if add_cap(&self.requested, 1) == 0 {
      self.drain();
    }
  }

  fn complete(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.downstream.on_complete();
    }
  }

  fn take_error(&self) -> Option<FlowError> {
    self.error.get().map(|err| {
      self.cancelled.store(true, Ordering::Release);
      err.clone()
    })
  }

  fn next_value(&self) -> (Option<I::Item>, bool) {
    let mut iter = self.iter.lock();
    let value = iter.next();
    let exhausted = iter.peek().is_none();
    (value, exhausted)
  }

  fn drain(&self) {
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      if let Some(err) = self.take_error() {
        self.downstream.on_error(err);
        return;
      }
      let r = self.requested.load(Ordering::Acquire);
      let mut emitted = 0;
      while emitted < r || r == UNBOUNDED {
        if self.cancelled.load(Ordering::Acquire) {
          return;
        }
        if let Some(err) = self.take_error() {
          self.downstream.on_error(err);
          return;
        }
        let (value, exhausted) = self.next_value();
        match value {
          Some(v) => {
            self.downstream.on_next(v);
            emitted += 1;
          }
          None => {
            self.complete();
            return;
          }
        }
        if exhausted {
          self.complete();
          return;
        }
      }
      if produced(&self.requested, emitted) == 0 {
        return;
      }
    }
  }
}

impl<I> Subscription for IterSubscription<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static,
{
  fn request(&self, n: i64) {
    if self.fused.load(Ordering::Relaxed) {
      return;
    }
    match validate_demand(n) {
      Ok(n) => {
        if add_cap(&self.requested, n) == 0 {
          self.drain();
        }
      }
      Err(err) => self.halt(err),
    }
  }

  fn cancel(&self) { self.cancelled.store(true, Ordering::Release); }
}

impl<I> QueueSubscription<I::Item> for IterSubscription<I>
where
  I: Iterator + Send + 'static,
  I::Item: Send + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::SYNC) {
      self.fused.store(true, Ordering::Relaxed);
      FusionMode::SYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> PollResult<I::Item> { Ok(self.iter.lock().next()) }

  fn is_empty(&self) -> bool { self.iter.lock().peek().is_none() }

  fn clear(&self) {
    let mut iter = self.iter.lock();
    while iter.next().is_some() {}
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::test_support::TestSubscriber;

  #[test]
  fn emits_all_values_then_completes() {
    let ts =
      TestSubscriber::<i32>::with_request(crate::subscription::UNBOUNDED);
    from_iter(0..100).subscribe_raw(ts.clone());
    assert_eq!(ts.value_count(), 100);
    assert!(ts.is_completed());
  }

  #[test]
  fn bounded_demand_is_honored() {
    let ts = TestSubscriber::<i32>::with_request(2);
    from_iter(vec![1, 2, 3, 4]).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 2]);
    ts.request(10);
    assert_eq!(ts.values(), vec![1, 2, 3, 4]);
    assert!(ts.is_completed());
  }

  #[test]
  fn completes_exactly_at_exhaustion() {
    // Requesting exactly the length must complete without an extra request.
    let ts = TestSubscriber::<i32>::with_request(3);
    from_iter(vec![1, 2, 3]).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 2, 3]);
    assert!(ts.is_completed());
  }

  #[test]
  fn empty_iterator_completes() {
    let ts = TestSubscriber::<i32>::with_request(1);
    from_iter(Vec::<i32>::new()).subscribe_raw(ts.clone());
    assert!(ts.is_completed());
    assert!(ts.values().is_empty());
  }

  #[test]
  fn sync_fusion_drains_by_poll() {
    let ts = TestSubscriber::<i32>::with_fusion(FusionMode::ANY);
    from_iter(vec![5, 6, 7]).subscribe_raw(ts.clone());
    assert_eq!(ts.granted_mode(), FusionMode::SYNC);
    assert_eq!(ts.values(), vec![5, 6, 7]);
  }

  #[test]
  fn subscribing_twice_is_independent() {
    let publisher = from_iter(vec![1, 2]);
    let first = TestSubscriber::<i32>::with_request(10);
    publisher.subscribe_raw(first.clone());
    let second = TestSubscriber::<i32>::with_request(10);
    publisher.subscribe_raw(second.clone());
    assert_eq!(first.values(), second.values());
    assert_eq!(first.values(), vec![1, 2]);
  }
}

//! Integer range source.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc,
};

use once_cell::sync::OnceCell;

use crate::{
  error::FlowError,
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::Publisher,
  subscriber::Subscriber,
  subscription::{
    add_cap, produced, validate_demand, EmptySubscription, Subscription,
    Upstream, UNBOUNDED,
  },
};

/// Emits `count` consecutive integers starting at `start`, then completes.
///
/// ```
/// use rxflow::prelude::*;
/// use std::sync::{
///   atomic::{AtomicI64, Ordering},
///   Arc,
/// };
///
/// let sum = Arc::new(AtomicI64::new(0));
/// let s = sum.clone();
/// source::range(1, 5).subscribe(move |v| {
///   s.fetch_add(v, Ordering::Relaxed);
/// });
/// assert_eq!(sum.load(Ordering::Relaxed), 15);
/// ```
pub fn range(start: i64, count: usize) -> RangePublisher {
  RangePublisher { start, count }
}

#[derive(Clone)]
pub struct RangePublisher {
  start: i64,
  count: usize,
}

impl Publisher<i64> for RangePublisher {
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<i64>>) {
    if self.count == 0 {
      subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
      subscriber.on_complete();
      return;
    }
    let subscription = Arc::new(RangeSubscription {
      downstream: subscriber.clone(),
      index: AtomicI64::new(self.start),
      end: self.start + self.count as i64,
      requested: AtomicI64::new(0),
      cancelled: AtomicBool::new(false),
      fused: AtomicBool::new(false),
      error: OnceCell::new(),
    });
    subscriber.on_subscribe(Upstream::Fused(subscription));
  }
}

/// The values already exist, so the demand counter doubles as the drain
/// right: whoever moves it off zero emits until it returns to zero.
struct RangeSubscription {
  downstream: Arc<dyn Subscriber<i64>>,
  index: AtomicI64,
  end: i64,
  requested: AtomicI64,
  cancelled: AtomicBool,
  fused: AtomicBool,
  error: OnceCell<FlowError>,
}

impl RangeSubscription {
  fn halt(&self, err: FlowError) {
    if self.cancelled.load(Ordering::Acquire) {
      // Already terminal (or cancelled): the error has nowhere to go.
      crate::error::on_error_dropped(err);
      return;
    }
    let _ = self.error.set(err);
    if add_cap(&self.requested, 1) == 0 {
      self.drain();
    }
  }

  /// Terminal completion; the cancelled flag doubles as the terminal latch.
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

  fn drain(&self) {
    let mut index = self.index.load(Ordering::Relaxed);
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      if let Some(err) = self.take_error() {
        self.downstream.on_error(err);
        return;
      }
      let r = self.requested.load(Ordering::Acquire);
      if r == UNBOUNDED {
        self.fast_path(index);
        return;
      }
      let mut emitted = 0;
      while emitted < r && index < self.end {
        if self.cancelled.load(Ordering::Acquire) {
          return;
        }
        if let Some(err) = self.take_error() {
          self.downstream.on_error(err);
          return;
        }
        self.downstream.on_next(index);
        index += 1;
        emitted += 1;
      }
      if index == self.end {
        self.complete();
        return;
      }
      self.index.store(index, Ordering::Relaxed);
      if produced(&self.requested, emitted) == 0 {
        return;
      }
    }
  }

  fn fast_path(&self, mut index: i64) {
    while index < self.end {
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      if let Some(err) = self.take_error() {
        self.downstream.on_error(err);
        return;
      }
      self.downstream.on_next(index);
      index += 1;
    }
    self.complete();
  }
}

impl Subscription for RangeSubscription {
  fn request(&self, n: i64) {
    if self.fused.load(Ordering::Relaxed) {
      // Sync-fused consumers drain by poll and never need credit.
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

impl QueueSubscription<i64> for RangeSubscription {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::SYNC) {
      self.fused.store(true, Ordering::Relaxed);
      FusionMode::SYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> PollResult<i64> {
    let index = self.index.load(Ordering::Relaxed);
    if index == self.end {
      return Ok(None);
    }
    self.index.store(index + 1, Ordering::Relaxed);
    Ok(Some(index))
  }

  fn is_empty(&self) -> bool {
    self.index.load(Ordering::Relaxed) == self.end
  }

  fn clear(&self) { self.index.store(self.end, Ordering::Relaxed); }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::test_support::TestSubscriber;

  #[test]
  fn unbounded_request_emits_everything() {
    let ts = TestSubscriber::<i64>::with_request(crate::subscription::UNBOUNDED);
    range(1, 5).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 2, 3, 4, 5]);
    assert!(ts.is_completed());
  }

  #[test]
  fn demand_bounds_emission() {
    let ts = TestSubscriber::<i64>::with_request(0);
    range(0, 10).subscribe_raw(ts.clone());
    assert!(ts.values().is_empty());
    ts.request(3);
    assert_eq!(ts.values(), vec![0, 1, 2]);
    ts.request(2);
    assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
    assert!(!ts.is_terminated());
    ts.request(100);
    assert_eq!(ts.values().len(), 10);
    assert!(ts.is_completed());
  }

  #[test]
  fn empty_range_completes_immediately() {
    let ts = TestSubscriber::<i64>::with_request(0);
    range(7, 0).subscribe_raw(ts.clone());
    assert!(ts.is_completed());
  }

  #[test]
  fn negative_request_surfaces_as_error() {
    let ts = TestSubscriber::<i64>::with_request(0);
    range(0, 10).subscribe_raw(ts.clone());
    ts.request(-1);
    assert!(matches!(ts.error(), Some(FlowError::IllegalArgument(_))));
  }

  #[test]
  fn sync_fusion_drains_by_poll() {
    let ts = TestSubscriber::<i64>::with_fusion(FusionMode::ANY);
    range(0, 4).subscribe_raw(ts.clone());
    assert_eq!(ts.granted_mode(), FusionMode::SYNC);
    assert_eq!(ts.values(), vec![0, 1, 2, 3]);
    assert!(ts.is_completed());
  }

  #[test]
  fn cancel_stops_emission() {
    let ts = TestSubscriber::<i64>::with_request(2);
    range(0, 1000).subscribe_raw(ts.clone());
    ts.cancel();
    ts.request(1000);
    assert_eq!(ts.values(), vec![0, 1]);
    assert!(!ts.is_terminated());
  }
}

//! Periodic tick source.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc, Weak,
};

use crate::{
  error::FlowError,
  publisher::Publisher,
  scheduler::{Duration, Scheduler, Worker},
  subscriber::Subscriber,
  subscription::{
    add_cap, produced, validate_demand, Subscription, Upstream,
  },
};

/// Emits `0, 1, 2, ...` every `period` on a worker of `scheduler`.
///
/// A tick arriving while the subscriber has no outstanding demand surfaces
/// as `on_error`: a clock cannot be back-pressured, it can only fail.
pub fn interval<SD>(period: Duration, scheduler: SD) -> IntervalPublisher<SD>
where
  SD: Scheduler + 'static,
{
  IntervalPublisher { period, scheduler }
}

pub struct IntervalPublisher<SD> {
  period: Duration,
  scheduler: SD,
}

impl<SD> Publisher<i64> for IntervalPublisher<SD>
where
  SD: Scheduler + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<i64>>) {
    let subscription = Arc::new_cyclic(|weak: &Weak<IntervalSubscription>| {
      IntervalSubscription {
        self_ref: weak.clone(),
        downstream: subscriber.clone(),
        requested: AtomicI64::new(0),
        count: AtomicI64::new(0),
        cancelled: AtomicBool::new(false),
        period: self.period,
        worker: self.scheduler.create_worker(),
      }
    });
    subscriber.on_subscribe(Upstream::Plain(subscription.clone()));
    subscription.arm();
  }
}

struct IntervalSubscription {
  self_ref: Weak<IntervalSubscription>,
  downstream: Arc<dyn Subscriber<i64>>,
  requested: AtomicI64,
  count: AtomicI64,
  cancelled: AtomicBool,
  period: Duration,
  worker: Arc<dyn Worker>,
}

impl IntervalSubscription {
  fn arm(&self) {
    let Some(this) = self.self_ref.upgrade() else { return };
    self
      .worker
      .schedule_after(self.period, Box::new(move || this.tick()));
  }

  fn tick(&self) {
    if self.cancelled.load(Ordering::Acquire) {
      return;
    }
    let n = self.count.fetch_add(1, Ordering::Relaxed);
    if self.requested.load(Ordering::Acquire) > 0 {
      produced(&self.requested, 1);
      self.downstream.on_next(n);
      self.arm();
    } else {
      self.halt(FlowError::protocol(
        "could not emit tick due to lack of demand",
      ));
    }
  }

  fn halt(&self, err: FlowError) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.downstream.on_error(err);
      self.worker.shutdown();
    } else {
      crate::error::on_error_dropped(err);
    }
  }
}

impl Subscription for IntervalSubscription {
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(n) => {
        add_cap(&self.requested, n);
      }
      Err(err) => self.halt(err),
    }
  }

  fn cancel(&self) {
    if !self.cancelled.swap(true, Ordering::AcqRel) {
      self.worker.shutdown();
    }
  }
}

#[cfg(all(test, feature = "futures-scheduler"))]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::scheduler::ThreadPoolScheduler;
  use crate::test_support::TestSubscriber;
  use std::time::Instant;

  #[test]
  fn ticks_count_up() {
    let ts = TestSubscriber::<i64>::with_request(crate::subscription::UNBOUNDED);
    interval(Duration::from_millis(10), ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    let start = Instant::now();
    while ts.values().len() < 5 && start.elapsed() < Duration::from_secs(5) {
      std::thread::yield_now();
    }
    ts.cancel();
    let values = ts.values();
    assert!(values.len() >= 5);
    assert_eq!(values[..5], [0, 1, 2, 3, 4]);
  }

  #[test]
  fn tick_without_demand_errors() {
    let ts = TestSubscriber::<i64>::with_request(2);
    interval(Duration::from_millis(5), ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    assert_eq!(ts.values(), vec![0, 1]);
    assert!(matches!(ts.error(), Some(FlowError::Protocol(_))));
  }
}

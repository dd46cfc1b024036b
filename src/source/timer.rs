//! One-shot delayed source.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use crate::{
  error::FlowError,
  publisher::Publisher,
  scheduler::{Duration, Scheduler, Worker},
  subscriber::Subscriber,
  subscription::{validate_demand, Subscription, Upstream},
};

/// Emits `()` once after `delay` on a worker of `scheduler`, then completes.
///
/// A tick arriving while the subscriber has no outstanding demand is a
/// protocol-level failure and surfaces as `on_error`.
pub fn timer<SD>(delay: Duration, scheduler: SD) -> TimerPublisher<SD>
where
  SD: Scheduler + 'static,
{
  TimerPublisher { delay, scheduler }
}

pub struct TimerPublisher<SD> {
  delay: Duration,
  scheduler: SD,
}

impl<SD> Publisher<()> for TimerPublisher<SD>
where
  SD: Scheduler + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<()>>) {
    let worker = self.scheduler.create_worker();
    let subscription = Arc::new(TimerSubscription {
      downstream: subscriber.clone(),
      requested: AtomicBool::new(false),
      cancelled: AtomicBool::new(false),
      worker: worker.clone(),
    });
    subscriber.on_subscribe(Upstream::Plain(subscription.clone()));
    let fire = subscription.clone();
    worker.schedule_after(self.delay, Box::new(move || fire.fire()));
  }
}

struct TimerSubscription {
  downstream: Arc<dyn Subscriber<()>>,
  requested: AtomicBool,
  cancelled: AtomicBool,
  worker: Arc<dyn Worker>,
}

impl TimerSubscription {
  fn fire(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    if self.requested.load(Ordering::Acquire) {
      self.downstream.on_next(());
      self.downstream.on_complete();
    } else {
      self.downstream.on_error(FlowError::protocol(
        "timer fired without demand",
      ));
    }
    self.worker.shutdown();
  }
}

impl Subscription for TimerSubscription {
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(_) => self.requested.store(true, Ordering::Release),
      Err(err) => {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
          self.downstream.on_error(err);
          self.worker.shutdown();
        } else {
          crate::error::on_error_dropped(err);
        }
      }
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

  #[test]
  fn fires_once_after_the_delay() {
    let ts = TestSubscriber::<()>::with_request(1);
    timer(Duration::from_millis(20), ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    assert_eq!(ts.values().len(), 1);
    assert!(ts.is_completed());
  }

  #[test]
  fn firing_without_demand_errors() {
    let ts = TestSubscriber::<()>::with_request(0);
    timer(Duration::from_millis(10), ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    assert!(matches!(ts.error(), Some(FlowError::Protocol(_))));
  }

  #[test]
  fn cancel_suppresses_the_tick() {
    let ts = TestSubscriber::<()>::with_request(1);
    timer(Duration::from_millis(50), ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    ts.cancel();
    assert!(!ts.await_terminal(Duration::from_millis(200)));
    assert!(ts.values().is_empty());
  }
}

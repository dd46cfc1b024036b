//! Single-value source.

use std::sync::{
  atomic::{AtomicU8, Ordering},
  Arc,
};

use parking_lot::Mutex;

use crate::{
  error::FlowError,
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::{Publisher, Scalar},
  subscriber::Subscriber,
  subscription::{validate_demand, Subscription, Upstream},
};

/// Emits a single value, then completes.
///
/// ```
/// use rxflow::prelude::*;
/// use std::sync::{
///   atomic::{AtomicI64, Ordering},
///   Arc,
/// };
///
/// let got = Arc::new(AtomicI64::new(0));
/// let g = got.clone();
/// source::just(42).subscribe(move |v| g.store(v, Ordering::Relaxed));
/// assert_eq!(got.load(Ordering::Relaxed), 42);
/// ```
pub fn just<T>(value: T) -> JustPublisher<T>
where
  T: Clone + Send + Sync + 'static,
{
  JustPublisher { value }
}

#[derive(Clone)]
pub struct JustPublisher<T> {
  value: T,
}

impl<T> Publisher<T> for JustPublisher<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let subscription =
      Arc::new(ScalarSubscription::new(subscriber.clone(), self.value.clone()));
    subscriber.on_subscribe(Upstream::Fused(subscription));
  }

  fn try_scalar(&self) -> Option<Scalar<T>> {
    Some(Scalar::Value(self.value.clone()))
  }
}

const FRESH: u8 = 0;
const CONSUMED: u8 = 1;
const CANCELLED: u8 = 2;

/// Subscription of a source known to hold exactly one value. The first
/// positive request (or the first fused `poll`) takes it.
pub(crate) struct ScalarSubscription<T> {
  downstream: Arc<dyn Subscriber<T>>,
  value: Mutex<Option<T>>,
  state: AtomicU8,
  fused: std::sync::atomic::AtomicBool,
}

impl<T: Send + 'static> ScalarSubscription<T> {
  pub(crate) fn new(downstream: Arc<dyn Subscriber<T>>, value: T) -> Self {
    ScalarSubscription {
      downstream,
      value: Mutex::new(Some(value)),
      state: AtomicU8::new(FRESH),
      fused: std::sync::atomic::AtomicBool::new(false),
    }
  }

  fn transition(&self, to: u8) -> bool {
    self
      .state
      .compare_exchange(FRESH, to, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }
}

impl<T: Send + 'static> Subscription for ScalarSubscription<T> {
  fn request(&self, n: i64) {
    if self.fused.load(Ordering::Relaxed) {
      return;
    }
    match validate_demand(n) {
      Ok(_) => {
        if self.transition(CONSUMED) {
          let value = self.value.lock().take();
          if let Some(v) = value {
            self.downstream.on_next(v);
          }
          self.downstream.on_complete();
        }
      }
      Err(err) => {
        if self.transition(CANCELLED) {
          self.value.lock().take();
          self.downstream.on_error(err);
        } else {
          crate::error::on_error_dropped(err);
        }
      }
    }
  }

  fn cancel(&self) {
    if self.transition(CANCELLED) {
      self.value.lock().take();
    }
  }
}

impl<T: Send + 'static> QueueSubscription<T> for ScalarSubscription<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    if mode.contains(FusionMode::SYNC) {
      self.fused.store(true, Ordering::Relaxed);
      FusionMode::SYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> PollResult<T> {
    if self.transition(CONSUMED) {
      return Ok(self.value.lock().take());
    }
    Ok(None)
  }

  fn is_empty(&self) -> bool {
    self.state.load(Ordering::Acquire) != FRESH
  }

  fn clear(&self) { self.cancel(); }
}

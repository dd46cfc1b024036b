//! Predicate filtering, fusion-transparent.

use std::sync::{
  atomic::{AtomicBool, AtomicU8, Ordering},
  Arc, Weak,
};

use crate::{
  error::{catch_callback, FlowError},
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::Publisher,
  subscriber::Subscriber,
  subscription::{Subscription, Upstream, UpstreamCell},
};

#[derive(Clone)]
pub struct FilterOp<S, F> {
  pub(crate) source: S,
  pub(crate) predicate: F,
}

impl<T, S, F> Publisher<T> for FilterOp<S, F>
where
  T: Send + 'static,
  S: Publisher<T>,
  F: Fn(&T) -> bool + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let filter = Arc::new_cyclic(|weak: &Weak<FilterSubscriber<T, F>>| {
      FilterSubscriber {
        self_ref: weak.clone(),
        downstream: subscriber,
        predicate: self.predicate.clone(),
        upstream: UpstreamCell::new(),
        done: AtomicBool::new(false),
        mode: AtomicU8::new(0),
      }
    });
    self.source.subscribe_raw(filter);
  }
}

const MODE_NONE: u8 = 0;
const MODE_SYNC: u8 = 1;
const MODE_ASYNC: u8 = 2;

struct FilterSubscriber<T, F> {
  self_ref: Weak<FilterSubscriber<T, F>>,
  downstream: Arc<dyn Subscriber<T>>,
  predicate: F,
  upstream: UpstreamCell<T>,
  done: AtomicBool,
  /// Granted fusion kind: in `ASYNC` mode a value skipped during `poll`
  /// costs one credit that must be re-requested.
  mode: AtomicU8,
}

impl<T, F> Subscriber<T> for FilterSubscriber<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    let fused = matches!(upstream, Upstream::Fused(_));
    if !self.upstream.set(upstream) {
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    if fused {
      self.downstream.on_subscribe(Upstream::Fused(this));
    } else {
      self.downstream.on_subscribe(Upstream::Plain(this));
    }
  }

  fn on_next(&self, value: T) {
    if self.done.load(Ordering::Acquire) {
      return;
    }
    match catch_callback(|| (self.predicate)(&value)) {
      Ok(true) => self.downstream.on_next(value),
      Ok(false) => {
        // The skipped value consumed upstream credit the downstream never
        // saw; replenish so demand accounting stays balanced.
        drop(value);
        self.upstream.request(1);
      }
      Err(err) => {
        self.done.store(true, Ordering::Release);
        self.upstream.cancel();
        self.downstream.on_error(err);
      }
    }
  }

  fn on_queued(&self) { self.downstream.on_queued() }

  fn on_error(&self, error: FlowError) {
    if self.done.swap(true, Ordering::AcqRel) {
      crate::error::on_error_dropped(error);
      return;
    }
    self.downstream.on_error(error);
  }

  fn on_complete(&self) {
    if !self.done.swap(true, Ordering::AcqRel) {
      self.downstream.on_complete();
    }
  }
}

impl<T, F> Subscription for FilterSubscriber<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn request(&self, n: i64) { self.upstream.request(n) }

  fn cancel(&self) {
    self.done.store(true, Ordering::Release);
    self.upstream.cancel();
  }
}

impl<T, F> QueueSubscription<T> for FilterSubscriber<T, F>
where
  T: Send + 'static,
  F: Fn(&T) -> bool + Send + Sync + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    let granted = match self.upstream.get() {
      Some(up) => up.request_fusion(mode),
      None => FusionMode::NONE,
    };
    let kind = match granted.kind() {
      FusionMode::SYNC => MODE_SYNC,
      FusionMode::ASYNC => MODE_ASYNC,
      _ => MODE_NONE,
    };
    self.mode.store(kind, Ordering::Relaxed);
    granted
  }

  fn poll(&self) -> PollResult<T> {
    let Some(queue) = self.upstream.get().and_then(|up| up.fused()) else {
      return Ok(None);
    };
    loop {
      match queue.poll()? {
        None => return Ok(None),
        Some(value) => match catch_callback(|| (self.predicate)(&value)) {
          Ok(true) => return Ok(Some(value)),
          Ok(false) => {
            drop(value);
            if self.mode.load(Ordering::Relaxed) == MODE_ASYNC {
              queue.request(1);
            }
          }
          Err(err) => {
            queue.cancel();
            return Err(err);
          }
        },
      }
    }
  }

  fn is_empty(&self) -> bool {
    self
      .upstream
      .get()
      .and_then(|up| up.fused())
      .map_or(true, |queue| queue.is_empty())
  }

  fn clear(&self) {
    if let Some(queue) = self.upstream.get().and_then(|up| up.fused()) {
      queue.clear();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::test_support::TestSubscriber;

  use crate::subscription::UNBOUNDED;

  #[test]
  fn keeps_matching_values() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10)
      .filter(|v| v % 2 == 0)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 2, 4, 6, 8]);
    assert!(ts.is_completed());
  }

  #[test]
  fn bounded_demand_sees_replenishment() {
    // Two credits must yield two *matching* values even though four
    // upstream values are consumed along the way.
    let ts = TestSubscriber::<i64>::with_request(2);
    source::range(0, 10).filter(|v| v % 2 == 1).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 3]);
  }

  #[test]
  fn fused_chain_matches_plain_output() {
    let plain = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10).filter(|v| v % 3 == 0).subscribe_raw(plain.clone());

    let fused = TestSubscriber::<i64>::with_fusion(FusionMode::ANY);
    source::range(0, 10).filter(|v| v % 3 == 0).subscribe_raw(fused.clone());
    assert_eq!(fused.granted_mode(), FusionMode::SYNC);
    assert_eq!(plain.values(), fused.values());
  }

  #[test]
  fn predicate_panic_cancels_and_errors() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10)
      .filter(|v| if *v == 2 { panic!("bad predicate") } else { true })
      .subscribe_raw(ts.clone());
    assert!(matches!(ts.error(), Some(FlowError::Panic(_))));
  }
}

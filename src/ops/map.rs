//! Value transformation, fusion-transparent.

use std::sync::{
  atomic::{AtomicBool, Ordering},
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
pub struct MapOp<S, F> {
  pub(crate) source: S,
  pub(crate) f: F,
}

impl<T, R, S, F> Publisher<R> for MapOp<S, F>
where
  T: Send + 'static,
  R: Send + 'static,
  S: Publisher<T>,
  F: Fn(T) -> R + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<R>>) {
    let map = Arc::new_cyclic(|weak: &Weak<MapSubscriber<T, R, F>>| {
      MapSubscriber {
        self_ref: weak.clone(),
        downstream: subscriber,
        f: self.f.clone(),
        upstream: UpstreamCell::new(),
        done: AtomicBool::new(false),
      }
    });
    self.source.subscribe_raw(map);
  }
}

/// Sits between two stages and stays out of the way: fusion requests and
/// demand pass straight through, only values are touched.
struct MapSubscriber<T, R, F> {
  self_ref: Weak<MapSubscriber<T, R, F>>,
  downstream: Arc<dyn Subscriber<R>>,
  f: F,
  upstream: UpstreamCell<T>,
  done: AtomicBool,
}

impl<T, R, F> Subscriber<T> for MapSubscriber<T, R, F>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> R + Send + Sync + 'static,
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
    match catch_callback(|| (self.f)(value)) {
      Ok(mapped) => self.downstream.on_next(mapped),
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

impl<T, R, F> Subscription for MapSubscriber<T, R, F>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> R + Send + Sync + 'static,
{
  fn request(&self, n: i64) { self.upstream.request(n) }

  fn cancel(&self) {
    self.done.store(true, Ordering::Release);
    self.upstream.cancel();
  }
}

impl<T, R, F> QueueSubscription<R> for MapSubscriber<T, R, F>
where
  T: Send + 'static,
  R: Send + 'static,
  F: Fn(T) -> R + Send + Sync + 'static,
{
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    match self.upstream.get() {
      Some(up) => up.request_fusion(mode),
      None => FusionMode::NONE,
    }
  }

  fn poll(&self) -> PollResult<R> {
    let Some(queue) = self.upstream.get().and_then(|up| up.fused()) else {
      return Ok(None);
    };
    match queue.poll()? {
      Some(value) => match catch_callback(|| (self.f)(value)) {
        Ok(mapped) => Ok(Some(mapped)),
        Err(err) => {
          queue.cancel();
          Err(err)
        }
      },
      None => Ok(None),
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
  use bencher::{benchmark_group, Bencher};

  use crate::subscription::UNBOUNDED;

  #[test]
  fn maps_values() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(1, 5).map(|v| v * v).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 4, 9, 16, 25]);
    assert!(ts.is_completed());
  }

  #[test]
  fn type_changing_map() {
    let ts = TestSubscriber::<String>::with_request(UNBOUNDED);
    source::from_iter(vec!['a', 'b'])
      .map(|c| c.to_string())
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn fused_chain_matches_plain_output() {
    // Fusion must never alter observable output, only delivery mechanics.
    let plain = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 5).map(|v| v * 2).subscribe_raw(plain.clone());

    let fused = TestSubscriber::<i64>::with_fusion(FusionMode::ANY);
    source::range(0, 5).map(|v| v * 2).subscribe_raw(fused.clone());
    assert_eq!(fused.granted_mode(), FusionMode::SYNC);
    assert_eq!(plain.values(), fused.values());
  }

  #[test]
  fn mapper_panic_cancels_and_errors() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10)
      .map(|v| if v == 3 { panic!("bad value") } else { v })
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 1, 2]);
    assert!(matches!(ts.error(), Some(FlowError::Panic(_))));
  }

  #[test]
  fn bench() { do_bench(); }

  benchmark_group!(do_bench, bench_map);

  fn bench_map(b: &mut Bencher) { b.iter(maps_values); }

  #[test]
  fn demand_passes_through() {
    let ts = TestSubscriber::<i64>::with_request(2);
    source::range(0, 10).map(|v| v + 1).subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![1, 2]);
    ts.request(1);
    assert_eq!(ts.values(), vec![1, 2, 3]);
  }
}

//! Concurrent merge: maps outer values to inner publishers and interleaves
//! their emissions under one shared demand counter.

use std::{
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    Arc, Weak,
  },
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
  drain::{ErrorBag, WorkCounter},
  error::{catch_callback, FlowError},
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::{Publisher, Scalar},
  queue::{Queue, SpscArrayQueue, SpscLinkedArrayQueue},
  subscriber::Subscriber,
  subscription::{
    add_cap, produced, validate_demand, Subscription, Upstream, UpstreamCell,
    UNBOUNDED,
  },
};

pub struct FlatMapOp<S, F, P> {
  source: S,
  mapper: F,
  max_concurrency: usize,
  prefetch: usize,
  delay_error: bool,
  _marker: PhantomData<fn() -> P>,
}

impl<S: Clone, F: Clone, P> Clone for FlatMapOp<S, F, P> {
  fn clone(&self) -> Self {
    FlatMapOp {
      source: self.source.clone(),
      mapper: self.mapper.clone(),
      max_concurrency: self.max_concurrency,
      prefetch: self.prefetch,
      delay_error: self.delay_error,
      _marker: PhantomData,
    }
  }
}

impl<S, F, P> FlatMapOp<S, F, P> {
  pub(crate) fn new(
    source: S,
    mapper: F,
    max_concurrency: usize,
    prefetch: usize,
    delay_error: bool,
  ) -> Self {
    FlatMapOp {
      source,
      mapper,
      max_concurrency: max_concurrency.max(1),
      prefetch: prefetch.max(1),
      delay_error,
      _marker: PhantomData,
    }
  }
}

impl<T, R, S, F, P> Publisher<R> for FlatMapOp<S, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  S: Publisher<T>,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<R>>) {
    let main = Arc::new_cyclic(|weak: &Weak<FlatMapMain<T, R, F, P>>| {
      FlatMapMain {
        self_ref: weak.clone(),
        downstream: subscriber,
        mapper: self.mapper.clone(),
        max_concurrency: self.max_concurrency,
        prefetch: self.prefetch,
        delay_error: self.delay_error,
        upstream: UpstreamCell::new(),
        requested: AtomicI64::new(0),
        wip: WorkCounter::new(),
        cancelled: AtomicBool::new(false),
        abort: AtomicBool::new(false),
        done: AtomicBool::new(false),
        errors: ErrorBag::new(),
        scalar_queue: OnceCell::new(),
        inners: Mutex::new(SmallVec::new()),
        inner_ids: AtomicUsize::new(0),
      }
    });
    self.source.subscribe_raw(main);
  }
}

type InnerList<T, R, F, P> = SmallVec<[Arc<FlatMapInner<T, R, F, P>>; 4]>;

struct FlatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  self_ref: Weak<FlatMapMain<T, R, F, P>>,
  downstream: Arc<dyn Subscriber<R>>,
  mapper: F,
  max_concurrency: usize,
  prefetch: usize,
  delay_error: bool,
  upstream: UpstreamCell<T>,
  requested: AtomicI64,
  wip: WorkCounter,
  cancelled: AtomicBool,
  /// Force an error terminal even under the delay-error policy (protocol
  /// violations never wait).
  abort: AtomicBool,
  done: AtomicBool,
  errors: ErrorBag,
  /// Fast path for scalar inners; lazily allocated, fed only by the serial
  /// outer thread.
  scalar_queue: OnceCell<SpscLinkedArrayQueue<R>>,
  /// Tracked inner subscribers. The lock guards structural mutation only;
  /// the drain snapshots the list and iterates outside of it.
  inners: Mutex<InnerList<T, R, F, P>>,
  inner_ids: AtomicUsize,
}

impl<T, R, F, P> FlatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn scalar_queue(&self) -> &SpscLinkedArrayQueue<R> {
    self
      .scalar_queue
      .get_or_init(|| SpscLinkedArrayQueue::new(self.prefetch))
  }

  fn scalar_queue_empty(&self) -> bool {
    self.scalar_queue.get().map_or(true, |q| q.is_empty())
  }

  fn drain(&self) {
    if self.wip.enter() {
      self.drain_loop();
    }
  }

  /// Scalar fast path: with the drain right free, demand present and no
  /// queued values ahead of it, the value goes straight downstream.
  fn try_emit_scalar(&self, value: R) {
    if self.wip.try_enter() {
      if self.requested.load(Ordering::Acquire) != 0
        && self.scalar_queue_empty()
      {
        self.downstream.on_next(value);
        produced(&self.requested, 1);
        self.upstream.request(1);
      } else {
        self.scalar_queue().offer(value);
      }
      if self.wip.leave(1) != 0 {
        self.drain_loop();
      }
    } else {
      self.scalar_queue().offer(value);
      self.drain();
    }
  }

  /// Inner fast path, the push-mode twin of [`Self::try_emit_scalar`].
  fn try_emit_inner(&self, inner: &FlatMapInner<T, R, F, P>, value: R) {
    if self.wip.try_enter() {
      if self.requested.load(Ordering::Acquire) != 0
        && inner.queue_is_empty()
        && self.scalar_queue_empty()
      {
        self.downstream.on_next(value);
        produced(&self.requested, 1);
        inner.consumed_one();
      } else if !inner.offer(value) {
        self.overflow(inner);
      }
      if self.wip.leave(1) != 0 {
        self.drain_loop();
      }
    } else {
      if !inner.offer(value) {
        self.overflow(inner);
      }
      self.drain();
    }
  }

  fn overflow(&self, inner: &FlatMapInner<T, R, F, P>) {
    inner.fail_terminate();
    self.errors.add(FlowError::QueueOverflow);
    self.abort.store(true, Ordering::Release);
  }

  fn record_inner_error(&self, err: FlowError) {
    self.errors.add(err);
  }

  fn remove_inner(&self, id: usize) {
    self.inners.lock().retain(|inner| inner.id != id);
  }

  fn cancel_all(&self) {
    self.upstream.cancel();
    let inners = std::mem::take(&mut *self.inners.lock());
    for inner in inners {
      inner.fail_terminate();
    }
    if let Some(sq) = self.scalar_queue.get() {
      sq.clear();
    }
  }

  /// Cancellation / immediate-error gate run at every drain step. `true`
  /// ends the drain for good: the WIP counter stays parked so no further
  /// loop can start.
  fn check_kill(&self) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      self.cancel_all();
      return true;
    }
    if self.abort.load(Ordering::Acquire)
      || (!self.delay_error && self.errors.has_errors())
    {
      self.cancel_all();
      if let Some(err) = self.errors.terminate() {
        self.downstream.on_error(err);
      }
      return true;
    }
    false
  }

  /// Completion gate: the operator is finished only once the outer is done
  /// and no tracked inner or buffered value remains. Also where delayed
  /// errors finally surface.
  fn check_complete(&self) -> bool {
    if self.done.load(Ordering::Acquire)
      && self.inners.lock().is_empty()
      && self.scalar_queue_empty()
    {
      match self.errors.terminate() {
        Some(err) => self.downstream.on_error(err),
        None => self.downstream.on_complete(),
      }
      return true;
    }
    false
  }

  fn drain_loop(&self) {
    let mut missed = 1;
    loop {
      if self.check_kill() {
        return;
      }
      if self.check_complete() {
        return;
      }
      let mut r = self.requested.load(Ordering::Acquire);
      let mut e: i64 = 0;
      // Scalar queue first, then the tracked inners.
      if let Some(sq) = self.scalar_queue.get() {
        while e != r {
          if self.check_kill() {
            return;
          }
          match sq.poll() {
            Some(value) => {
              self.downstream.on_next(value);
              e += 1;
              self.upstream.request(1);
            }
            None => break,
          }
        }
      }
      let inners: InnerList<T, R, F, P> = self.inners.lock().clone();
      for inner in inners.iter() {
        if self.check_kill() {
          return;
        }
        loop {
          if e == r {
            r = self.requested.load(Ordering::Acquire);
            if e == r {
              break;
            }
          }
          match inner.poll() {
            Ok(Some(value)) => {
              self.downstream.on_next(value);
              e += 1;
              inner.consumed_one();
            }
            Ok(None) => break,
            Err(err) => {
              inner.fail_terminate();
              self.record_inner_error(err);
              break;
            }
          }
        }
        if inner.is_terminated() && inner.queue_is_empty() {
          self.remove_inner(inner.id);
          self.upstream.request(1);
        }
      }
      if e > 0 {
        produced(&self.requested, e);
      }
      if self.check_complete() {
        return;
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }

  fn inner_completed(&self) { self.drain(); }

  /// A tracked inner failed; the drain's removal pass hands its outer slot
  /// back, so no replenish happens here.
  fn inner_errored(&self, err: FlowError) {
    self.record_inner_error(err);
    self.drain();
  }

  /// A scalar probe failed: no inner was ever tracked, so the outer slot is
  /// replenished directly (when the error waits, the stream keeps going).
  fn scalar_failed(&self, err: FlowError) {
    self.record_inner_error(err);
    if self.delay_error {
      self.upstream.request(1);
    }
    self.drain();
  }
}

impl<T, R, F, P> Subscriber<T> for FlatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.upstream.set(upstream) {
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    self.downstream.on_subscribe(Upstream::Plain(this));
    let initial = if self.max_concurrency == usize::MAX {
      UNBOUNDED
    } else {
      self.max_concurrency as i64
    };
    self.upstream.request(initial);
  }

  fn on_next(&self, value: T) {
    if self.done.load(Ordering::Acquire)
      || self.cancelled.load(Ordering::Acquire)
    {
      return;
    }
    let publisher = match catch_callback(|| (self.mapper)(value)) {
      Ok(p) => p,
      Err(err) => {
        self.upstream.cancel();
        self.errors.add(err);
        self.done.store(true, Ordering::Release);
        self.drain();
        return;
      }
    };
    match publisher.try_scalar() {
      Some(Scalar::Value(v)) => self.try_emit_scalar(v),
      Some(Scalar::Empty) => self.upstream.request(1),
      Some(Scalar::Failed(err)) => self.scalar_failed(err),
      None => {
        let id = self.inner_ids.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(FlatMapInner {
          id,
          parent: self.self_ref.clone(),
          upstream: UpstreamCell::new(),
          queue: OnceCell::new(),
          done: AtomicBool::new(false),
          sync_fused: AtomicBool::new(false),
          prefetch: self.prefetch,
          limit: self.prefetch - (self.prefetch >> 2),
          consumed: AtomicI64::new(0),
        });
        self.inners.lock().push(inner.clone());
        if self.cancelled.load(Ordering::Acquire) {
          self.remove_inner(id);
          return;
        }
        publisher.subscribe_raw(inner);
      }
    }
  }

  fn on_error(&self, error: FlowError) {
    if self.done.swap(true, Ordering::AcqRel) {
      crate::error::on_error_dropped(error);
      return;
    }
    self.errors.add(error);
    self.drain();
  }

  fn on_complete(&self) {
    if !self.done.swap(true, Ordering::AcqRel) {
      self.drain();
    }
  }
}

impl<T, R, F, P> Subscription for FlatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(n) => {
        add_cap(&self.requested, n);
        self.drain();
      }
      Err(err) => {
        self.errors.add(err);
        self.abort.store(true, Ordering::Release);
        self.drain();
      }
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.cancel();
    if self.wip.enter() {
      self.cancel_all();
    }
  }
}

enum InnerQueue<R: Send + 'static> {
  Own(SpscArrayQueue<R>),
  Fused(Arc<dyn QueueSubscription<R>>),
}

struct FlatMapInner<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  id: usize,
  parent: Weak<FlatMapMain<T, R, F, P>>,
  upstream: UpstreamCell<R>,
  queue: OnceCell<InnerQueue<R>>,
  done: AtomicBool,
  sync_fused: AtomicBool,
  prefetch: usize,
  limit: usize,
  /// Values drained since the last replenish; only the drain thread
  /// touches it.
  consumed: AtomicI64,
}

impl<T, R, F, P> FlatMapInner<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn poll(&self) -> PollResult<R> {
    match self.queue.get() {
      None => Ok(None),
      Some(InnerQueue::Own(q)) => Ok(q.poll()),
      Some(InnerQueue::Fused(q)) => q.poll(),
    }
  }

  fn offer(&self, value: R) -> bool {
    match self.queue.get() {
      Some(InnerQueue::Own(q)) => q.offer(value),
      // A fused inner never pushes values; anything else is an upstream
      // contract breach.
      _ => false,
    }
  }

  fn queue_is_empty(&self) -> bool {
    match self.queue.get() {
      None => true,
      Some(InnerQueue::Own(q)) => q.is_empty(),
      Some(InnerQueue::Fused(q)) => q.is_empty(),
    }
  }

  fn is_terminated(&self) -> bool { self.done.load(Ordering::Acquire) }

  fn consumed_one(&self) {
    if self.sync_fused.load(Ordering::Relaxed) {
      return;
    }
    let consumed = self.consumed.load(Ordering::Relaxed) + 1;
    if consumed == self.limit as i64 {
      self.consumed.store(0, Ordering::Relaxed);
      self.upstream.request(consumed);
    } else {
      self.consumed.store(consumed, Ordering::Relaxed);
    }
  }

  /// Cancels the inner upstream and empties its queue; used on overflow,
  /// poll failure and operator-wide aborts.
  fn fail_terminate(&self) {
    self.done.store(true, Ordering::Release);
    self.upstream.cancel();
    match self.queue.get() {
      Some(InnerQueue::Own(q)) => q.clear(),
      Some(InnerQueue::Fused(q)) => q.clear(),
      None => {}
    }
  }
}

impl<T, R, F, P> Subscriber<R> for FlatMapInner<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<R>) {
    let granted = upstream.request_fusion(FusionMode::ANY).kind();
    let fused_queue = upstream.fused().cloned();
    if !self.upstream.set(upstream) {
      return;
    }
    match granted {
      FusionMode::SYNC => {
        if let Some(q) = fused_queue {
          let _ = self.queue.set(InnerQueue::Fused(q));
        }
        self.sync_fused.store(true, Ordering::Relaxed);
        self.done.store(true, Ordering::Release);
        if let Some(parent) = self.parent.upgrade() {
          parent.drain();
        }
      }
      FusionMode::ASYNC => {
        if let Some(q) = fused_queue {
          let _ = self.queue.set(InnerQueue::Fused(q));
        }
        self.upstream.request(self.prefetch as i64);
      }
      _ => {
        let _ = self
          .queue
          .set(InnerQueue::Own(SpscArrayQueue::new(self.prefetch)));
        self.upstream.request(self.prefetch as i64);
      }
    }
  }

  fn on_next(&self, value: R) {
    if self.done.load(Ordering::Acquire) {
      return;
    }
    if let Some(parent) = self.parent.upgrade() {
      parent.try_emit_inner(self, value);
    }
  }

  fn on_queued(&self) {
    if let Some(parent) = self.parent.upgrade() {
      parent.drain();
    }
  }

  fn on_error(&self, error: FlowError) {
    if self.done.swap(true, Ordering::AcqRel) {
      crate::error::on_error_dropped(error);
      return;
    }
    if let Some(parent) = self.parent.upgrade() {
      parent.inner_errored(error);
    }
  }

  fn on_complete(&self) {
    if !self.done.swap(true, Ordering::AcqRel) {
      if let Some(parent) = self.parent.upgrade() {
        parent.inner_completed();
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::test_support::TestSubscriber;
  use bencher::{benchmark_group, Bencher};

  #[test]
  fn interleaves_inner_values() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10)
      .flat_map(|v| source::range(v, 3), 2)
      .subscribe_raw(ts.clone());
    // 10 inners of 3 values each; global order is unspecified.
    assert_eq!(ts.value_count(), 30);
    assert!(ts.is_completed());
  }

  #[test]
  fn values_within_one_inner_stay_ordered() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 4)
      .flat_map(|v| source::range(v * 10, 3), 2)
      .subscribe_raw(ts.clone());
    let collected = ts.values();
    for base in [0, 10, 20, 30] {
      let inner: Vec<_> =
        collected.iter().copied().filter(|v| v / 10 == base / 10).collect();
      assert_eq!(inner, vec![base, base + 1, base + 2]);
    }
  }

  #[test]
  fn scalar_inners_skip_subscription() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 5)
      .flat_map(|v| source::just(v * 2), 8)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 2, 4, 6, 8]);
  }

  #[test]
  fn empty_inners_replenish_the_outer() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 100)
      .flat_map(
        |v| {
          if v % 2 == 0 {
            source::just(v).boxed()
          } else {
            source::empty().boxed()
          }
        },
        1,
      )
      .subscribe_raw(ts.clone());
    assert_eq!(ts.value_count(), 50);
    assert!(ts.is_completed());
  }

  #[test]
  fn respects_downstream_demand() {
    let ts = TestSubscriber::<i64>::with_request(5);
    source::range(0, 4)
      .flat_map(|v| source::range(v * 10, 3), 4)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.value_count(), 5);
    assert!(!ts.is_terminated());
    ts.request(100);
    assert_eq!(ts.value_count(), 12);
    assert!(ts.is_completed());
  }

  #[test]
  fn immediate_error_cancels_everything() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 10)
      .flat_map(
        |v| {
          if v == 2 {
            source::fail(FlowError::message("inner died")).boxed()
          } else {
            source::range(v * 10, 2).boxed()
          }
        },
        1,
      )
      .subscribe_raw(ts.clone());
    assert!(matches!(ts.error(), Some(FlowError::Message(_))));
    // Inners 0 and 1 finished before the failure; nothing after it.
    assert_eq!(ts.values(), vec![0, 1, 10, 11]);
  }

  #[test]
  fn delayed_errors_surface_after_all_inners() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 5)
      .flat_map_with(
        |v| {
          if v == 2 {
            source::fail(FlowError::message("inner died")).boxed()
          } else {
            source::just(v).boxed()
          }
        },
        1,
        16,
        true,
      )
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 1, 3, 4]);
    assert!(matches!(ts.error(), Some(FlowError::Message(_))));
  }

  #[test]
  fn flatten_merges_a_stream_of_publishers() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::from_iter(vec![
      source::range(0, 2).boxed(),
      source::range(10, 2).boxed(),
    ])
    .flatten(2)
    .subscribe_raw(ts.clone());
    let mut collected = ts.values();
    collected.sort();
    assert_eq!(collected, vec![0, 1, 10, 11]);
  }

  #[test]
  fn bench() { do_bench(); }

  benchmark_group!(do_bench, bench_flat_map);

  fn bench_flat_map(b: &mut Bencher) { b.iter(interleaves_inner_values); }

  #[test]
  fn mapper_panic_fails_the_stream() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 5)
      .flat_map(
        |v: i64| -> crate::source::RangePublisher {
          if v == 1 {
            panic!("mapper exploded")
          }
          source::range(v, 1)
        },
        1,
      )
      .subscribe_raw(ts.clone());
    assert!(matches!(ts.error(), Some(FlowError::Panic(_))));
  }

  #[test]
  fn cancellation_reaches_active_inners() {
    let ts = TestSubscriber::<i64>::with_request(2);
    source::range(0, 4)
      .flat_map(|v| source::range(v * 100, 50), 2)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.value_count(), 2);
    ts.cancel();
    ts.request(1000);
    assert_eq!(ts.value_count(), 2);
    assert!(!ts.is_terminated());
  }
}

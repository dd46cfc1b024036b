//! Sequential merge: one inner publisher at a time, with three error
//! policies.

use std::{
  marker::PhantomData,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    Arc, Weak,
  },
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
  drain::{half_next, half_terminate, ErrorBag, WorkCounter},
  error::{catch_callback, FlowError},
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::Publisher,
  queue::{Queue, SpscArrayQueue},
  subscriber::Subscriber,
  subscription::{Subscription, Upstream, UpstreamCell, UNBOUNDED},
};

/// When errors are allowed to interrupt the concatenation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorMode {
  /// Any inner or outer error cancels everything and propagates at once; a
  /// half-serializer keeps a racing value and error from both arriving.
  Immediate,
  /// An inner error aborts at once, but an outer error waits until the
  /// currently active inner finished.
  Boundary,
  /// All errors are held back and surfaced as one aggregate after the whole
  /// sequence would otherwise have completed.
  End,
}

pub struct ConcatMapOp<S, F, P> {
  source: S,
  mapper: F,
  prefetch: usize,
  mode: ErrorMode,
  _marker: PhantomData<fn() -> P>,
}

impl<S: Clone, F: Clone, P> Clone for ConcatMapOp<S, F, P> {
  fn clone(&self) -> Self {
    ConcatMapOp {
      source: self.source.clone(),
      mapper: self.mapper.clone(),
      prefetch: self.prefetch,
      mode: self.mode,
      _marker: PhantomData,
    }
  }
}

impl<S, F, P> ConcatMapOp<S, F, P> {
  pub(crate) fn new(
    source: S,
    mapper: F,
    prefetch: usize,
    mode: ErrorMode,
  ) -> Self {
    ConcatMapOp {
      source,
      mapper,
      prefetch: prefetch.max(1),
      mode,
      _marker: PhantomData,
    }
  }
}

impl<T, R, S, F, P> Publisher<R> for ConcatMapOp<S, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  S: Publisher<T>,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<R>>) {
    let main = Arc::new_cyclic(|weak: &Weak<ConcatMapMain<T, R, F, P>>| {
      ConcatMapMain {
        self_ref: weak.clone(),
        downstream: subscriber,
        mapper: self.mapper.clone(),
        prefetch: self.prefetch,
        limit: self.prefetch - (self.prefetch >> 2),
        mode: self.mode,
        upstream: UpstreamCell::new(),
        queue: OnceCell::new(),
        source_mode: AtomicU8::new(SRC_NONE),
        active: AtomicBool::new(false),
        done: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        abort: AtomicBool::new(false),
        errors: ErrorBag::new(),
        guard: WorkCounter::new(),
        wip: WorkCounter::new(),
        consumed: AtomicI64::new(0),
        arbiter: InnerArbiter::new(),
        inner: OnceCell::new(),
      }
    });
    let inner = Arc::new(ConcatMapInner { parent: Arc::downgrade(&main) });
    let _ = main.inner.set(inner);
    self.source.subscribe_raw(main);
  }
}

const SRC_NONE: u8 = 0;
const SRC_SYNC: u8 = 1;
const SRC_ASYNC: u8 = 2;

enum OuterQueue<T> {
  Own(SpscArrayQueue<T>),
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T: Send + 'static> OuterQueue<T> {
  fn poll(&self) -> PollResult<T> {
    match self {
      OuterQueue::Own(q) => Ok(q.poll()),
      OuterQueue::Fused(q) => q.poll(),
    }
  }

  fn clear(&self) {
    match self {
      OuterQueue::Own(q) => q.clear(),
      OuterQueue::Fused(q) => q.clear(),
    }
  }
}

/// Demand arbiter across the succession of inner subscriptions: downstream
/// credit outlives any single inner, so the remaining balance is forwarded
/// to each newly arriving one.
struct InnerArbiter<R> {
  state: Mutex<ArbiterState<R>>,
}

struct ArbiterState<R> {
  requested: i64,
  current: Option<Upstream<R>>,
  cancelled: bool,
}

impl<R> InnerArbiter<R> {
  fn new() -> Self {
    InnerArbiter {
      state: Mutex::new(ArbiterState {
        requested: 0,
        current: None,
        cancelled: false,
      }),
    }
  }

  /// Adds downstream demand and forwards it to the active inner, if any.
  /// The forward happens outside the lock: a synchronous source may emit
  /// (and call `produced_one`) before `request` returns.
  fn request(&self, n: i64) {
    let target = {
      let mut state = self.state.lock();
      state.requested = if state.requested == UNBOUNDED {
        UNBOUNDED
      } else {
        state.requested.saturating_add(n)
      };
      state.current.clone()
    };
    if let Some(up) = target {
      up.request(n);
    }
  }

  /// Switches to a freshly subscribed inner, handing it the outstanding
  /// balance.
  fn set(&self, upstream: Upstream<R>) {
    let remaining = {
      let mut state = self.state.lock();
      if state.cancelled {
        None
      } else {
        state.current = Some(upstream.clone());
        Some(state.requested)
      }
    };
    match remaining {
      None => upstream.cancel(),
      Some(r) if r > 0 => upstream.request(r),
      Some(_) => {}
    }
  }

  fn produced_one(&self) {
    let mut state = self.state.lock();
    if state.requested != UNBOUNDED && state.requested > 0 {
      state.requested -= 1;
    }
  }

  fn cancel(&self) {
    let current = {
      let mut state = self.state.lock();
      state.cancelled = true;
      state.current.take()
    };
    if let Some(up) = current {
      up.cancel();
    }
  }
}

struct ConcatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  self_ref: Weak<ConcatMapMain<T, R, F, P>>,
  downstream: Arc<dyn Subscriber<R>>,
  mapper: F,
  prefetch: usize,
  limit: usize,
  mode: ErrorMode,
  upstream: UpstreamCell<T>,
  queue: OnceCell<OuterQueue<T>>,
  source_mode: AtomicU8,
  /// An inner publisher is in flight; the pump stalls until it terminates.
  active: AtomicBool,
  done: AtomicBool,
  cancelled: AtomicBool,
  /// Stop pumping and terminate with the accumulated errors now, whatever
  /// the error mode says about deferral.
  abort: AtomicBool,
  errors: ErrorBag,
  /// Half-serializer counter shared by value emission and terminals.
  guard: WorkCounter,
  wip: WorkCounter,
  consumed: AtomicI64,
  arbiter: InnerArbiter<R>,
  inner: OnceCell<Arc<ConcatMapInner<T, R, F, P>>>,
}

impl<T, R, F, P> ConcatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn drain(&self) {
    if self.wip.enter() {
      self.drain_loop();
    }
  }

  fn clear_queue(&self) {
    if let Some(queue) = self.queue.get() {
      queue.clear();
    }
  }

  fn terminate_now(&self) {
    self.upstream.cancel();
    self.arbiter.cancel();
    self.clear_queue();
    half_terminate(&self.guard, &self.errors, &*self.downstream);
  }

  fn outer_consumed(&self) {
    if self.source_mode.load(Ordering::Acquire) == SRC_SYNC {
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

  fn drain_loop(&self) {
    let mut missed = 1;
    loop {
      'work: loop {
        if self.cancelled.load(Ordering::Acquire) {
          self.clear_queue();
          return;
        }
        if self.abort.load(Ordering::Acquire) {
          self.terminate_now();
          return;
        }
        if self.active.load(Ordering::Acquire) {
          break 'work;
        }
        let done = self.done.load(Ordering::Acquire);
        // Boundary (and Immediate, defensively): a deferred error fires as
        // soon as no inner is active, dropping still-queued outer values.
        if done
          && self.mode != ErrorMode::End
          && self.errors.has_errors()
        {
          self.terminate_now();
          return;
        }
        let Some(queue) = self.queue.get() else { break 'work };
        let next = match queue.poll() {
          Ok(v) => v,
          Err(err) => {
            self.errors.add(err);
            self.terminate_now();
            return;
          }
        };
        let Some(value) = next else {
          if done {
            half_terminate(&self.guard, &self.errors, &*self.downstream);
            return;
          }
          break 'work;
        };
        self.outer_consumed();
        let publisher = match catch_callback(|| (self.mapper)(value)) {
          Ok(p) => p,
          Err(err) => {
            self.errors.add(err);
            self.terminate_now();
            return;
          }
        };
        self.active.store(true, Ordering::Release);
        let Some(inner) = self.inner.get() else { return };
        publisher.subscribe_raw(inner.clone());
        // The inner may have completed synchronously, flipping `active`
        // back and bumping the WIP counter; fall through to the re-check.
        break 'work;
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }

  fn inner_next(&self, value: R) {
    if half_next(&self.guard, &self.errors, &*self.downstream, value) {
      self.arbiter.produced_one();
    }
  }

  fn inner_complete(&self) {
    self.active.store(false, Ordering::Release);
    self.drain();
  }

  fn inner_error(&self, err: FlowError) {
    match self.mode {
      ErrorMode::Immediate | ErrorMode::Boundary => {
        self.errors.add(err);
        self.abort.store(true, Ordering::Release);
        self.active.store(false, Ordering::Release);
        self.drain();
      }
      ErrorMode::End => {
        self.errors.add(err);
        self.active.store(false, Ordering::Release);
        self.drain();
      }
    }
  }
}

impl<T, R, F, P> Subscriber<T> for ConcatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    let granted = upstream.request_fusion(FusionMode::ANY).kind();
    let fused_queue = upstream.fused().cloned();
    if !self.upstream.set(upstream) {
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    match granted {
      FusionMode::SYNC => {
        self.source_mode.store(SRC_SYNC, Ordering::Release);
        if let Some(q) = fused_queue {
          let _ = self.queue.set(OuterQueue::Fused(q));
        }
        self.done.store(true, Ordering::Release);
        self.downstream.on_subscribe(Upstream::Plain(this));
        // Nothing will push; the pump has to start itself.
        self.drain();
      }
      FusionMode::ASYNC => {
        self.source_mode.store(SRC_ASYNC, Ordering::Release);
        if let Some(q) = fused_queue {
          let _ = self.queue.set(OuterQueue::Fused(q));
        }
        self.downstream.on_subscribe(Upstream::Plain(this));
        self.upstream.request(self.prefetch as i64);
      }
      _ => {
        let _ = self
          .queue
          .set(OuterQueue::Own(SpscArrayQueue::new(self.prefetch)));
        self.downstream.on_subscribe(Upstream::Plain(this));
        self.upstream.request(self.prefetch as i64);
      }
    }
  }

  fn on_next(&self, value: T) {
    if self.source_mode.load(Ordering::Acquire) == SRC_ASYNC {
      self.drain();
      return;
    }
    if self.done.load(Ordering::Acquire)
      || self.cancelled.load(Ordering::Acquire)
    {
      return;
    }
    let accepted = match self.queue.get() {
      Some(OuterQueue::Own(q)) => q.offer(value),
      _ => false,
    };
    if !accepted {
      self.upstream.cancel();
      self.errors.add(FlowError::QueueOverflow);
      self.abort.store(true, Ordering::Release);
    }
    self.drain();
  }

  fn on_queued(&self) { self.drain(); }

  fn on_error(&self, error: FlowError) {
    if self.done.swap(true, Ordering::AcqRel) {
      crate::error::on_error_dropped(error);
      return;
    }
    self.errors.add(error);
    if self.mode == ErrorMode::Immediate {
      self.abort.store(true, Ordering::Release);
    }
    self.drain();
  }

  fn on_complete(&self) {
    if !self.done.swap(true, Ordering::AcqRel) {
      self.drain();
    }
  }
}

impl<T, R, F, P> Subscription for ConcatMapMain<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn request(&self, n: i64) {
    if n > 0 {
      self.arbiter.request(n);
      self.drain();
    } else {
      self.errors.add(FlowError::bad_request(n));
      self.abort.store(true, Ordering::Release);
      self.drain();
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.cancel();
    self.arbiter.cancel();
    if self.wip.enter() {
      self.clear_queue();
    }
  }
}

/// The one inner subscriber, re-subscribed to each successive inner
/// publisher. Serial by construction: a new inner only starts after the
/// previous one terminated.
struct ConcatMapInner<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  parent: Weak<ConcatMapMain<T, R, F, P>>,
}

impl<T, R, F, P> Subscriber<R> for ConcatMapInner<T, R, F, P>
where
  T: Send + 'static,
  R: Send + 'static,
  P: Publisher<R> + 'static,
  F: Fn(T) -> P + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<R>) {
    if let Some(parent) = self.parent.upgrade() {
      parent.arbiter.set(upstream);
    } else {
      upstream.cancel();
    }
  }

  fn on_next(&self, value: R) {
    if let Some(parent) = self.parent.upgrade() {
      parent.inner_next(value);
    }
  }

  fn on_error(&self, error: FlowError) {
    if let Some(parent) = self.parent.upgrade() {
      parent.inner_error(error);
    }
  }

  fn on_complete(&self) {
    if let Some(parent) = self.parent.upgrade() {
      parent.inner_complete();
    }
  }
}

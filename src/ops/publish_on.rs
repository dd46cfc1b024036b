//! Moves signal delivery onto a scheduler worker.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
  Arc, Weak,
};

use once_cell::sync::OnceCell;

use crate::{
  drain::WorkCounter,
  error::FlowError,
  fusion::{FusionMode, PollResult, QueueSubscription},
  publisher::Publisher,
  queue::{Queue, SpscArrayQueue},
  scheduler::{Scheduler, Worker},
  subscriber::Subscriber,
  subscription::{
    add_cap, validate_demand, Subscription, Upstream, UpstreamCell, UNBOUNDED,
  },
};

#[derive(Clone)]
pub struct PublishOnOp<S, SD> {
  pub(crate) source: S,
  pub(crate) scheduler: SD,
  pub(crate) prefetch: usize,
}

impl<T, S, SD> Publisher<T> for PublishOnOp<S, SD>
where
  T: Send + 'static,
  S: Publisher<T>,
  SD: Scheduler + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let prefetch = self.prefetch.max(1);
    let worker = self.scheduler.create_worker();
    let sub = Arc::new_cyclic(|weak: &Weak<PublishOnSubscriber<T>>| {
      PublishOnSubscriber {
        self_ref: weak.clone(),
        downstream: subscriber,
        worker,
        prefetch,
        limit: prefetch - (prefetch >> 2),
        upstream: UpstreamCell::new(),
        queue: OnceCell::new(),
        source_mode: AtomicU8::new(SRC_NONE),
        out_fused: AtomicBool::new(false),
        requested: AtomicI64::new(0),
        emitted: AtomicI64::new(0),
        polled: AtomicI64::new(0),
        wip: WorkCounter::new(),
        cancelled: AtomicBool::new(false),
        done: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
        error: OnceCell::new(),
      }
    });
    self.source.subscribe_raw(sub);
  }
}

const SRC_NONE: u8 = 0;
const SRC_SYNC: u8 = 1;
const SRC_ASYNC: u8 = 2;

enum SourceQueue<T> {
  Own(SpscArrayQueue<T>),
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T: Send + 'static> SourceQueue<T> {
  fn poll(&self) -> PollResult<T> {
    match self {
      SourceQueue::Own(q) => Ok(q.poll()),
      SourceQueue::Fused(q) => q.poll(),
    }
  }

  fn is_empty(&self) -> bool {
    match self {
      SourceQueue::Own(q) => q.is_empty(),
      SourceQueue::Fused(q) => q.is_empty(),
    }
  }

  fn clear(&self) {
    match self {
      SourceQueue::Own(q) => q.clear(),
      SourceQueue::Fused(q) => q.clear(),
    }
  }
}

/// The drain runs on the worker; producers and the downstream only flip
/// state and bump the WIP counter. All three drain strategies re-read
/// `done`/`error`/`cancelled` and the queue on every pass.
struct PublishOnSubscriber<T> {
  self_ref: Weak<PublishOnSubscriber<T>>,
  downstream: Arc<dyn Subscriber<T>>,
  worker: Arc<dyn Worker>,
  prefetch: usize,
  limit: usize,
  upstream: UpstreamCell<T>,
  queue: OnceCell<SourceQueue<T>>,
  source_mode: AtomicU8,
  out_fused: AtomicBool,
  requested: AtomicI64,
  /// Emissions since the last upstream replenish; drain-side only.
  emitted: AtomicI64,
  /// Like `emitted`, for the downstream-driven `poll` path.
  polled: AtomicI64,
  wip: WorkCounter,
  cancelled: AtomicBool,
  /// Upstream reached its end (or, in sync-fused mode, was prefilled).
  done: AtomicBool,
  /// The downstream got its terminal signal; later errors are dropped.
  terminated: AtomicBool,
  error: OnceCell<FlowError>,
}

impl<T: Send + 'static> PublishOnSubscriber<T> {
  fn queue(&self) -> Option<&SourceQueue<T>> { self.queue.get() }

  fn fail(&self, err: FlowError) {
    if self.terminated.load(Ordering::Acquire)
      || self.cancelled.load(Ordering::Acquire)
    {
      crate::error::on_error_dropped(err);
      return;
    }
    if let Err(late) = self.error.set(err) {
      // First error wins; this one has nowhere to go.
      crate::error::on_error_dropped(late);
      return;
    }
    self.done.store(true, Ordering::Release);
    self.schedule_drain();
  }

  fn schedule_drain(&self) {
    if self.wip.enter() {
      let Some(this) = self.self_ref.upgrade() else { return };
      self.worker.schedule(Box::new(move || this.drain()));
    }
  }

  fn drain(&self) {
    if self.out_fused.load(Ordering::Acquire) {
      self.drain_output();
    } else if self.source_mode.load(Ordering::Acquire) == SRC_SYNC {
      self.drain_sync();
    } else {
      self.drain_async();
    }
  }

  fn terminate_error(&self, err: FlowError) {
    self.terminated.store(true, Ordering::Release);
    if let Some(queue) = self.queue() {
      queue.clear();
    }
    self.downstream.on_error(err);
    self.worker.shutdown();
  }

  fn terminate_complete(&self) {
    self.terminated.store(true, Ordering::Release);
    self.downstream.on_complete();
    self.worker.shutdown();
  }

  /// Terminal check shared by the push-driven drains. `true` means the
  /// drain is over and the WIP counter stays parked.
  fn check_terminated(&self, done: bool, empty: bool) -> bool {
    if self.cancelled.load(Ordering::Acquire) {
      if let Some(queue) = self.queue() {
        queue.clear();
      }
      return true;
    }
    if done {
      if let Some(err) = self.error.get() {
        self.terminate_error(err.clone());
        return true;
      }
      if empty {
        self.terminate_complete();
        return true;
      }
    }
    false
  }

  fn drain_sync(&self) {
    let mut missed = 1;
    loop {
      let Some(queue) = self.queue() else { return };
      let r = self.requested.load(Ordering::Acquire);
      let mut e: i64 = 0;
      while e != r {
        if self.cancelled.load(Ordering::Acquire) {
          queue.clear();
          return;
        }
        if let Some(err) = self.error.get() {
          self.terminate_error(err.clone());
          return;
        }
        match queue.poll() {
          Err(err) => {
            self.terminate_error(err);
            return;
          }
          Ok(None) => {
            self.terminate_complete();
            return;
          }
          Ok(Some(value)) => {
            self.downstream.on_next(value);
            e += 1;
          }
        }
      }
      if self.cancelled.load(Ordering::Acquire) {
        queue.clear();
        return;
      }
      if let Some(err) = self.error.get() {
        self.terminate_error(err.clone());
        return;
      }
      if queue.is_empty() {
        self.terminate_complete();
        return;
      }
      if e > 0 {
        crate::subscription::produced(&self.requested, e);
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }

  fn drain_async(&self) {
    let mut missed = 1;
    let mut e = self.emitted.load(Ordering::Relaxed);
    loop {
      let Some(queue) = self.queue() else { return };
      let mut r = self.requested.load(Ordering::Acquire);
      while e != r {
        let done = self.done.load(Ordering::Acquire);
        let value = match queue.poll() {
          Err(err) => {
            self.upstream.cancel();
            self.terminate_error(err);
            return;
          }
          Ok(v) => v,
        };
        let empty = value.is_none();
        if self.check_terminated(done, empty) {
          return;
        }
        let Some(value) = value else { break };
        self.downstream.on_next(value);
        e += 1;
        if e == self.limit as i64 {
          // Deduct in replenish-sized batches instead of per value.
          if r != UNBOUNDED {
            r = crate::subscription::produced(&self.requested, e);
          }
          self.upstream.request(e);
          e = 0;
        }
      }
      if e == r
        && self.check_terminated(
          self.done.load(Ordering::Acquire),
          queue.is_empty(),
        )
      {
        return;
      }
      self.emitted.store(e, Ordering::Relaxed);
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }

  fn drain_output(&self) {
    let mut missed = 1;
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        return;
      }
      let done = self.done.load(Ordering::Acquire);
      self.downstream.on_queued();
      if done {
        self.terminated.store(true, Ordering::Release);
        match self.error.get() {
          Some(err) => self.downstream.on_error(err.clone()),
          None => self.downstream.on_complete(),
        }
        self.worker.shutdown();
        return;
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }
}

impl<T: Send + 'static> Subscriber<T> for PublishOnSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    let granted = upstream
      .request_fusion(FusionMode::ANY | FusionMode::BOUNDARY)
      .kind();
    let fused_queue = upstream.fused().cloned();
    if !self.upstream.set(upstream) {
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    match granted {
      FusionMode::SYNC => {
        self.source_mode.store(SRC_SYNC, Ordering::Release);
        self.done.store(true, Ordering::Release);
        if let Some(q) = fused_queue {
          let _ = self.queue.set(SourceQueue::Fused(q));
        }
        self.downstream.on_subscribe(Upstream::Fused(this));
      }
      FusionMode::ASYNC => {
        self.source_mode.store(SRC_ASYNC, Ordering::Release);
        if let Some(q) = fused_queue {
          let _ = self.queue.set(SourceQueue::Fused(q));
        }
        self.downstream.on_subscribe(Upstream::Fused(this));
        self.upstream.request(self.prefetch as i64);
      }
      _ => {
        let _ = self
          .queue
          .set(SourceQueue::Own(SpscArrayQueue::new(self.prefetch)));
        self.downstream.on_subscribe(Upstream::Fused(this));
        self.upstream.request(self.prefetch as i64);
      }
    }
  }

  fn on_next(&self, value: T) {
    if self.source_mode.load(Ordering::Acquire) == SRC_ASYNC {
      // Async-fused upstreams may still signal through on_next; it only
      // means "the shared queue has data".
      self.schedule_drain();
      return;
    }
    if self.done.load(Ordering::Acquire)
      || self.cancelled.load(Ordering::Acquire)
    {
      return;
    }
    let accepted = match self.queue() {
      Some(SourceQueue::Own(q)) => q.offer(value),
      _ => false,
    };
    if !accepted {
      self.upstream.cancel();
      self.fail(FlowError::QueueOverflow);
      return;
    }
    self.schedule_drain();
  }

  fn on_queued(&self) { self.schedule_drain(); }

  fn on_error(&self, error: FlowError) { self.fail(error); }

  fn on_complete(&self) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    self.schedule_drain();
  }
}

impl<T: Send + 'static> Subscription for PublishOnSubscriber<T> {
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(n) => {
        add_cap(&self.requested, n);
        self.schedule_drain();
      }
      Err(err) => {
        self.upstream.cancel();
        self.fail(err);
      }
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.cancel();
    self.worker.shutdown();
    if self.wip.enter() {
      if let Some(queue) = self.queue() {
        queue.clear();
      }
    }
  }
}

impl<T: Send + 'static> QueueSubscription<T> for PublishOnSubscriber<T> {
  fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    // Never SYNC across the boundary: a sync grant would run the producer's
    // values on the consumer's thread.
    if mode.contains(FusionMode::ASYNC) {
      self.out_fused.store(true, Ordering::Release);
      FusionMode::ASYNC
    } else {
      FusionMode::NONE
    }
  }

  fn poll(&self) -> PollResult<T> {
    let Some(queue) = self.queue() else { return Ok(None) };
    let value = queue.poll()?;
    if value.is_some()
      && self.source_mode.load(Ordering::Acquire) != SRC_SYNC
    {
      let polled = self.polled.load(Ordering::Relaxed) + 1;
      if polled == self.limit as i64 {
        self.polled.store(0, Ordering::Relaxed);
        self.upstream.request(polled);
      } else {
        self.polled.store(polled, Ordering::Relaxed);
      }
    }
    Ok(value)
  }

  fn is_empty(&self) -> bool {
    self.queue().map_or(true, |queue| queue.is_empty())
  }

  fn clear(&self) {
    if let Some(queue) = self.queue() {
      queue.clear();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::scheduler::ImmediateScheduler;
  #[cfg(feature = "futures-scheduler")]
  use crate::scheduler::ThreadPoolScheduler;
  use crate::test_support::TestSubscriber;
  #[cfg(feature = "futures-scheduler")]
  use std::time::Duration;

  #[cfg(feature = "futures-scheduler")]
  #[test]
  fn delivers_everything_in_order() {
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 500)
      .publish_on(ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    assert_eq!(ts.values(), (0..500).collect::<Vec<_>>());
    assert!(ts.is_completed());
    assert!(ts.violations().is_empty());
  }

  #[cfg(feature = "futures-scheduler")]
  #[test]
  fn emission_moves_off_the_caller_thread() {
    let caller = std::thread::current().id();
    let ts = TestSubscriber::<std::thread::ThreadId>::with_request(UNBOUNDED);
    source::range(0, 3)
      .publish_on(ThreadPoolScheduler::new())
      .map(|_| std::thread::current().id())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    let ids = ts.values();
    assert_eq!(ids.len(), 3);
    for id in ids {
      assert_ne!(id, caller);
    }
  }

  #[test]
  fn bounded_demand_is_respected_across_the_boundary() {
    let ts = TestSubscriber::<i64>::with_request(3);
    source::range(0, 100)
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 1, 2]);
    assert!(!ts.is_terminated());
    ts.request(2);
    assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn never_grants_sync_fusion() {
    let ts = TestSubscriber::<i64>::with_fusion(FusionMode::SYNC);
    source::range(0, 5)
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.granted_mode(), FusionMode::NONE);
  }

  #[test]
  fn grants_async_fusion_downstream() {
    let ts = TestSubscriber::<i64>::with_fusion(
      FusionMode::ASYNC | FusionMode::BOUNDARY,
    );
    source::range(0, 5)
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.granted_mode(), FusionMode::ASYNC);
    assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
    assert!(ts.is_completed());
  }

  #[cfg(feature = "futures-scheduler")]
  #[test]
  fn chained_boundaries_use_async_fusion() {
    // The second publish_on negotiates ASYNC|BOUNDARY with the first and
    // shares its queue instead of double-buffering.
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    source::range(0, 200)
      .publish_on(ThreadPoolScheduler::new())
      .publish_on(ThreadPoolScheduler::new())
      .subscribe_raw(ts.clone());
    assert!(ts.await_terminal(Duration::from_secs(5)));
    assert_eq!(ts.values(), (0..200).collect::<Vec<_>>());
    assert!(ts.violations().is_empty());
  }

  #[test]
  fn upstream_error_preempts_buffered_values() {
    let ts = TestSubscriber::<i64>::with_request(0);
    source::fail::<i64>(FlowError::message("boom"))
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    assert!(matches!(ts.error(), Some(FlowError::Message(_))));
  }

  #[test]
  fn cancel_stops_delivery_and_clears() {
    let ts = TestSubscriber::<i64>::with_request(1);
    source::range(0, 100)
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0]);
    ts.cancel();
    ts.cancel();
    ts.request(50);
    assert_eq!(ts.values(), vec![0]);
    assert!(!ts.is_terminated());
  }

  #[test]
  fn bad_request_surfaces_downstream() {
    let ts = TestSubscriber::<i64>::with_request(0);
    source::range(0, 10)
      .publish_on(ImmediateScheduler)
      .subscribe_raw(ts.clone());
    ts.request(0);
    assert!(matches!(ts.error(), Some(FlowError::IllegalArgument(_))));
  }
}

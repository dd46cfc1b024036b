//! Keyed partitioning into independently subscribable sub-streams.

use std::{
  collections::HashMap,
  hash::Hash,
  sync::{
    atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    Arc, Weak,
  },
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
  drain::WorkCounter,
  error::{catch_callback, FlowError},
  publisher::Publisher,
  queue::{Queue, SpscLinkedArrayQueue},
  subscriber::Subscriber,
  subscription::{
    add_cap, produced, validate_demand, EmptySubscription, Subscription,
    Upstream, UpstreamCell,
  },
};

#[derive(Clone)]
pub struct GroupByOp<S, F> {
  pub(crate) source: S,
  pub(crate) key_fn: F,
  pub(crate) prefetch: usize,
}

impl<T, K, S, F> Publisher<GroupedPublisher<K, T>> for GroupByOp<S, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  S: Publisher<T>,
  F: Fn(&T) -> K + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(
    &self,
    subscriber: Arc<dyn Subscriber<GroupedPublisher<K, T>>>,
  ) {
    let main = Arc::new_cyclic(|weak: &Weak<GroupByMain<T, K, F>>| {
      GroupByMain {
        self_ref: weak.clone(),
        downstream: subscriber,
        key_fn: self.key_fn.clone(),
        prefetch: self.prefetch.max(1),
        upstream: UpstreamCell::new(),
        groups: Mutex::new(HashMap::new()),
        groups_active: AtomicUsize::new(0),
        group_queue: SpscLinkedArrayQueue::new(16),
        requested: AtomicI64::new(0),
        wip: WorkCounter::new(),
        done: AtomicBool::new(false),
        cancelled: AtomicBool::new(false),
        error: OnceCell::new(),
      }
    });
    self.source.subscribe_raw(main);
  }
}

/// One partition of a grouped stream. Subscribable exactly once; a group
/// that is never subscribed holds its values and back-pressures the outer
/// stream, bounded by the operator's prefetch (a documented trade-off, not
/// a leak).
pub struct GroupedPublisher<K, T>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
{
  key: K,
  state: Arc<GroupState<T, K>>,
}

impl<K, T> GroupedPublisher<K, T>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
{
  pub fn key(&self) -> &K { &self.key }
}

impl<K, T> Clone for GroupedPublisher<K, T>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
{
  fn clone(&self) -> Self {
    GroupedPublisher { key: self.key.clone(), state: self.state.clone() }
  }
}

impl<K, T> Publisher<T> for GroupedPublisher<K, T>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    self.state.subscribe(subscriber);
  }
}

/// What a group needs from the operator that owns it, with the operator's
/// other type parameters erased.
trait GroupParent<K>: Send + Sync {
  /// `n` values left a group queue; the outer upstream earns that credit
  /// back.
  fn replenish(&self, n: i64);

  /// The group delivered its terminal signal or was cancelled.
  fn group_finished(&self, key: &K);
}

struct GroupByMain<T, K, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  self_ref: Weak<GroupByMain<T, K, F>>,
  downstream: Arc<dyn Subscriber<GroupedPublisher<K, T>>>,
  key_fn: F,
  prefetch: usize,
  upstream: UpstreamCell<T>,
  /// Key to group-state mapping. The coarse lock covers lookup-or-insert
  /// and removal only, never value delivery.
  groups: Mutex<HashMap<K, Arc<GroupState<T, K>>>>,
  groups_active: AtomicUsize,
  /// Newly created groups waiting for downstream demand.
  group_queue: SpscLinkedArrayQueue<GroupedPublisher<K, T>>,
  requested: AtomicI64,
  wip: WorkCounter,
  done: AtomicBool,
  cancelled: AtomicBool,
  error: OnceCell<FlowError>,
}

impl<T, K, F> GroupByMain<T, K, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  fn drain(&self) {
    if self.wip.enter() {
      self.drain_loop();
    }
  }

  fn drain_loop(&self) {
    let mut missed = 1;
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        self.group_queue.clear();
        return;
      }
      let r = self.requested.load(Ordering::Acquire);
      let mut e: i64 = 0;
      while e != r {
        if self.cancelled.load(Ordering::Acquire) {
          self.group_queue.clear();
          return;
        }
        match self.group_queue.poll() {
          Some(group) => {
            self.downstream.on_next(group);
            e += 1;
          }
          None => break,
        }
      }
      if e > 0 {
        produced(&self.requested, e);
      }
      if self.done.load(Ordering::Acquire)
        && self.group_queue.is_empty()
        && self.groups_active.load(Ordering::Acquire) == 0
      {
        match self.error.get() {
          Some(err) => self.downstream.on_error(err.clone()),
          None => self.downstream.on_complete(),
        }
        return;
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }

  fn group_snapshot(&self) -> Vec<Arc<GroupState<T, K>>> {
    self.groups.lock().values().cloned().collect()
  }

  fn halt(&self, err: FlowError) {
    if self.done.swap(true, Ordering::AcqRel) {
      crate::error::on_error_dropped(err);
      return;
    }
    let _ = self.error.set(err.clone());
    for group in self.group_snapshot() {
      group.terminate_error(err.clone());
    }
    self.drain();
  }
}

impl<T, K, F> GroupParent<K> for GroupByMain<T, K, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  fn replenish(&self, n: i64) {
    if n > 0 {
      self.upstream.request(n);
    }
  }

  fn group_finished(&self, key: &K) {
    self.groups.lock().remove(key);
    let previous = self.groups_active.fetch_sub(1, Ordering::AcqRel);
    if previous == 1 && self.cancelled.load(Ordering::Acquire) {
      self.upstream.cancel();
    }
    self.drain();
  }
}

impl<T, K, F> Subscriber<T> for GroupByMain<T, K, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.upstream.set(upstream) {
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    self.downstream.on_subscribe(Upstream::Plain(this));
    self.upstream.request(self.prefetch as i64);
  }

  fn on_next(&self, value: T) {
    if self.done.load(Ordering::Acquire) {
      return;
    }
    let key = match catch_callback(|| (self.key_fn)(&value)) {
      Ok(key) => key,
      Err(err) => {
        self.upstream.cancel();
        self.halt(err);
        return;
      }
    };
    let existing = self.groups.lock().get(&key).cloned();
    match existing {
      Some(group) => group.push(value),
      None => {
        if self.cancelled.load(Ordering::Acquire) {
          // The main subscriber is gone and nobody can ever see this
          // group; drop the value but keep the upstream moving.
          self.replenish(1);
          return;
        }
        let parent: Weak<dyn GroupParent<K>> = self.self_ref.clone();
        let group = GroupState::new(key.clone(), parent, self.prefetch);
        self.groups.lock().insert(key.clone(), group.clone());
        self.groups_active.fetch_add(1, Ordering::AcqRel);
        group.push(value);
        self
          .group_queue
          .offer(GroupedPublisher { key, state: group });
        self.drain();
      }
    }
  }

  fn on_error(&self, error: FlowError) { self.halt(error) }

  fn on_complete(&self) {
    if self.done.swap(true, Ordering::AcqRel) {
      return;
    }
    for group in self.group_snapshot() {
      group.terminate_complete();
    }
    self.drain();
  }
}

impl<T, K, F> Subscription for GroupByMain<T, K, F>
where
  T: Send + 'static,
  K: Eq + Hash + Clone + Send + Sync + 'static,
  F: Fn(&T) -> K + Send + Sync + 'static,
{
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(n) => {
        add_cap(&self.requested, n);
        self.drain();
      }
      Err(err) => {
        self.upstream.cancel();
        self.halt(err);
      }
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    // Live groups keep the upstream open; it is only cancelled once the
    // last of them finishes.
    if self.groups_active.load(Ordering::Acquire) == 0 {
      self.upstream.cancel();
    }
    self.drain();
  }
}

struct GroupState<T, K>
where
  T: Send + 'static,
  K: Send + Sync + 'static,
{
  key: K,
  parent: Weak<dyn GroupParent<K>>,
  self_ref: Weak<GroupState<T, K>>,
  queue: SpscLinkedArrayQueue<T>,
  subscriber: OnceCell<Arc<dyn Subscriber<T>>>,
  subscribed_once: AtomicBool,
  requested: AtomicI64,
  wip: WorkCounter,
  done: AtomicBool,
  error: OnceCell<FlowError>,
  abort: OnceCell<FlowError>,
  cancelled: AtomicBool,
  finished: AtomicBool,
}

impl<T, K> GroupState<T, K>
where
  T: Send + 'static,
  K: Send + Sync + 'static,
{
  fn new(
    key: K,
    parent: Weak<dyn GroupParent<K>>,
    prefetch: usize,
  ) -> Arc<Self> {
    Arc::new_cyclic(|weak| GroupState {
      key,
      parent,
      self_ref: weak.clone(),
      queue: SpscLinkedArrayQueue::new(prefetch),
      subscriber: OnceCell::new(),
      subscribed_once: AtomicBool::new(false),
      requested: AtomicI64::new(0),
      wip: WorkCounter::new(),
      done: AtomicBool::new(false),
      error: OnceCell::new(),
      abort: OnceCell::new(),
      cancelled: AtomicBool::new(false),
      finished: AtomicBool::new(false),
    })
  }

  fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
    if self.subscribed_once.swap(true, Ordering::AcqRel) {
      subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
      subscriber.on_error(FlowError::protocol(
        "a group supports a single subscriber",
      ));
      return;
    }
    let Some(this) = self.self_ref.upgrade() else { return };
    let _ = self.subscriber.set(subscriber.clone());
    subscriber.on_subscribe(Upstream::Plain(this));
    self.drain();
  }

  fn push(&self, value: T) {
    if self.cancelled.load(Ordering::Acquire)
      || self.finished.load(Ordering::Acquire)
    {
      // Nobody will consume it; hand the credit straight back.
      if let Some(parent) = self.parent.upgrade() {
        parent.replenish(1);
      }
      return;
    }
    self.queue.offer(value);
    self.drain();
  }

  fn terminate_complete(&self) {
    self.done.store(true, Ordering::Release);
    self.drain();
  }

  fn terminate_error(&self, err: FlowError) {
    if self.finished.load(Ordering::Acquire) {
      crate::error::on_error_dropped(err);
      return;
    }
    let _ = self.error.set(err);
    self.done.store(true, Ordering::Release);
    self.drain();
  }

  fn finish(&self) {
    if !self.finished.swap(true, Ordering::AcqRel) {
      if let Some(parent) = self.parent.upgrade() {
        parent.group_finished(&self.key);
      }
    }
  }

  fn clear_and_replenish(&self) {
    let mut cleared = 0;
    while self.queue.poll().is_some() {
      cleared += 1;
    }
    if cleared > 0 {
      if let Some(parent) = self.parent.upgrade() {
        parent.replenish(cleared);
      }
    }
  }

  fn drain(&self) {
    if self.wip.enter() {
      self.drain_loop();
    }
  }

  fn drain_loop(&self) {
    let mut missed = 1;
    loop {
      if self.cancelled.load(Ordering::Acquire) {
        self.clear_and_replenish();
        return;
      }
      let Some(subscriber) = self.subscriber.get() else {
        // No consumer yet; an empty finished group can still retire so the
        // outer operator is not held hostage by it.
        if self.done.load(Ordering::Acquire) && self.queue.is_empty() {
          self.finish();
        }
        missed = self.wip.leave(missed);
        if missed == 0 {
          return;
        }
        continue;
      };
      if let Some(err) = self.abort.get() {
        self.clear_and_replenish();
        subscriber.on_error(err.clone());
        self.finish();
        return;
      }
      let r = self.requested.load(Ordering::Acquire);
      let mut e: i64 = 0;
      while e != r {
        if self.cancelled.load(Ordering::Acquire) {
          self.clear_and_replenish();
          return;
        }
        match self.queue.poll() {
          Some(value) => {
            subscriber.on_next(value);
            e += 1;
          }
          None => break,
        }
      }
      if e > 0 {
        produced(&self.requested, e);
        if let Some(parent) = self.parent.upgrade() {
          parent.replenish(e);
        }
      }
      if self.done.load(Ordering::Acquire) && self.queue.is_empty() {
        match self.error.get() {
          Some(err) => subscriber.on_error(err.clone()),
          None => subscriber.on_complete(),
        }
        self.finish();
        return;
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }
}

impl<T, K> Subscription for GroupState<T, K>
where
  T: Send + 'static,
  K: Send + Sync + 'static,
{
  fn request(&self, n: i64) {
    match validate_demand(n) {
      Ok(n) => {
        add_cap(&self.requested, n);
        self.drain();
      }
      Err(err) => {
        let _ = self.abort.set(err);
        self.drain();
      }
    }
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    // Detach from the key map first: replenishing below restarts the
    // upstream, and values for this key must land in a fresh group rather
    // than this dead one.
    self.finish();
    if self.wip.enter() {
      self.clear_and_replenish();
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;
  use crate::subscription::UNBOUNDED;
  use crate::test_support::TestSubscriber;

  #[test]
  fn splits_by_parity() {
    let evens = Arc::new(Mutex::new(Vec::new()));
    let odds = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(AtomicBool::new(false));
    let e = evens.clone();
    let o = odds.clone();
    let c = completed.clone();
    source::range(0, 6).group_by(|v| v % 2).subscribe_all(
      move |group| {
        let sink = if *group.key() == 0 { e.clone() } else { o.clone() };
        group.subscribe(move |v| sink.lock().push(v));
      },
      |_| {},
      move || c.store(true, Ordering::Relaxed),
    );
    assert_eq!(&*evens.lock(), &[0, 2, 4]);
    assert_eq!(&*odds.lock(), &[1, 3, 5]);
    assert!(completed.load(Ordering::Relaxed));
  }

  #[test]
  fn emits_one_group_per_key() {
    let group_count = Arc::new(AtomicUsize::new(0));
    let c = group_count.clone();
    source::range(0, 100)
      .group_by(|v| v % 3)
      .subscribe(move |_group| {
        c.fetch_add(1, Ordering::Relaxed);
      });
    // Groups that are never consumed back-pressure the outer stream, but
    // three keys show up well within the default prefetch.
    assert_eq!(group_count.load(Ordering::Relaxed), 3);
  }

  #[test]
  fn groups_allow_only_one_subscriber() {
    let second_error = Arc::new(Mutex::new(None));
    let err = second_error.clone();
    source::range(0, 4).group_by(|v| v % 2).subscribe(move |group| {
      group.subscribe(|_| {});
      let err = err.clone();
      group.subscribe_all(
        |_| {},
        move |e| *err.lock() = Some(e),
        || {},
      );
    });
    assert!(matches!(
      &*second_error.lock(),
      Some(FlowError::Protocol(_))
    ));
  }

  #[test]
  fn unconsumed_group_backpressures_the_outer() {
    // Key 0 shows up first and is never consumed: its values pile up in
    // the group queue, eating the outer prefetch. The outer stalls instead
    // of buffering without bound.
    let delivered = Arc::new(AtomicUsize::new(0));
    let d = delivered.clone();
    source::range(0, 1000)
      .group_by_with(|v| v % 2, 8)
      .subscribe(move |group| {
        if *group.key() == 1 {
          let d = d.clone();
          group.subscribe(move |_| {
            d.fetch_add(1, Ordering::Relaxed);
          });
        }
      });
    let seen = delivered.load(Ordering::Relaxed);
    assert!(seen < 1000 / 2);
    assert!(seen > 0);
  }

  #[test]
  fn outer_completion_waits_for_group_consumption() {
    // The group is consumed only after the source finished; outer
    // completion must wait for that drain.
    let pending: Arc<Mutex<Vec<GroupedPublisher<i64, i64>>>> =
      Arc::new(Mutex::new(Vec::new()));
    let p = pending.clone();
    let completed = Arc::new(AtomicBool::new(false));
    let c = completed.clone();
    source::range(0, 4).group_by(|_| 0i64).subscribe_all(
      move |group| p.lock().push(group),
      |_| {},
      move || c.store(true, Ordering::Relaxed),
    );
    assert!(!completed.load(Ordering::Relaxed));
    let group = pending.lock().pop().expect("one group was emitted");
    let ts = TestSubscriber::<i64>::with_request(UNBOUNDED);
    group.subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 1, 2, 3]);
    assert!(ts.is_completed());
    assert!(completed.load(Ordering::Relaxed));
  }

  #[test]
  fn upstream_error_reaches_groups_and_outer() {
    let group_error = Arc::new(Mutex::new(None));
    let outer_error = Arc::new(Mutex::new(None));
    let ge = group_error.clone();
    let oe = outer_error.clone();
    source::range(0, 3)
      .concat_map(|v| {
        if v == 2 {
          source::fail::<i64>(FlowError::message("source died")).boxed()
        } else {
          source::just(v).boxed()
        }
      })
      .group_by(|_| 0i64)
      .subscribe_all(
        move |group| {
          let ge = ge.clone();
          group.subscribe_all(|_| {}, move |e| *ge.lock() = Some(e), || {});
        },
        move |e| *oe.lock() = Some(e),
        || {},
      );
    assert!(matches!(&*group_error.lock(), Some(FlowError::Message(_))));
    assert!(matches!(&*outer_error.lock(), Some(FlowError::Message(_))));
  }

  #[test]
  fn cancelling_a_group_replenishes_and_detaches() {
    let groups: Arc<Mutex<Vec<GroupedPublisher<i64, i64>>>> =
      Arc::new(Mutex::new(Vec::new()));
    let g = groups.clone();
    let completed = Arc::new(AtomicBool::new(false));
    let c = completed.clone();
    source::range(0, 50).group_by_with(|_| 0i64, 8).subscribe_all(
      move |group| g.lock().push(group),
      |_| {},
      move || c.store(true, Ordering::Relaxed),
    );
    let first = groups.lock()[0].clone();
    let ts = TestSubscriber::<i64>::with_request(2);
    first.subscribe_raw(ts.clone());
    assert_eq!(ts.values(), vec![0, 1]);
    ts.cancel();
    // The cancelled group handed its buffered credit back, so the outer
    // kept running; the same key re-materializes as a fresh group.
    let second = groups
      .lock()
      .get(1)
      .cloned()
      .expect("a fresh group for the reused key");
    let ts2 = TestSubscriber::<i64>::with_request(UNBOUNDED);
    second.subscribe_raw(ts2.clone());
    assert!(ts2.is_completed());
    assert!(ts2.value_count() > 0);
    assert!(completed.load(Ordering::Relaxed));
  }

  #[test]
  fn bad_request_on_the_outer_errors() {
    let ts =
      TestSubscriber::<GroupedPublisher<i64, i64>>::with_request(0);
    source::range(0, 4).group_by(|v| v % 2).subscribe_raw(ts.clone());
    ts.request(-2);
    assert!(matches!(ts.error(), Some(FlowError::IllegalArgument(_))));
  }
}

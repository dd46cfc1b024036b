//! Publisher trait and the combinator surface.

use std::sync::Arc;

use crate::{
  error::FlowError,
  ops::{
    concat_map::{ConcatMapOp, ErrorMode},
    filter::FilterOp,
    flat_map::FlatMapOp,
    group_by::GroupByOp,
    map::MapOp,
    publish_on::PublishOnOp,
    subscribe_on::SubscribeOnOp,
  },
  scheduler::Scheduler,
  subscriber::{LambdaSubscriber, Subscriber, SubscriptionHandle},
};

/// Default queue capacity / prefetch amount for buffering operators.
pub const DEFAULT_PREFETCH: usize = 128;

/// Answer of the scalar capability probe: a publisher known in advance to
/// produce at most one synchronously available value.
pub enum Scalar<T> {
  /// The source is known to be empty.
  Empty,
  /// The source's single value.
  Value(T),
  /// Producing the value failed (e.g. a `from_fn` callback panicked).
  Failed(FlowError),
}

/// A capability to accept one Subscriber per subscription attempt and emit
/// signals only after being asked.
///
/// Publishers are stateless with respect to their subscribers: multiple
/// subscription attempts are legal and independent.
pub trait Publisher<T: Send + 'static>: Send + Sync {
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>);

  /// Scalar probe: sources backed by a single synchronously available value
  /// answer here, letting merge operators emit that value without ever
  /// allocating an inner subscriber.
  fn try_scalar(&self) -> Option<Scalar<T>> { None }
}

/// A type-erased publisher, cheap to clone and reusable.
pub type BoxPublisher<T> = Arc<dyn Publisher<T>>;

impl<T, P> Publisher<T> for Arc<P>
where
  T: Send + 'static,
  P: Publisher<T> + ?Sized,
{
  #[inline]
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    (**self).subscribe_raw(subscriber)
  }

  #[inline]
  fn try_scalar(&self) -> Option<Scalar<T>> { (**self).try_scalar() }
}

/// Combinators over any [`Publisher`].
pub trait PublisherExt<T: Send + 'static>: Publisher<T> {
  /// Transforms every value with `f`.
  fn map<R, F>(self, f: F) -> MapOp<Self, F>
  where
    Self: Sized,
    R: Send + 'static,
    F: Fn(T) -> R + Clone + Send + Sync + 'static,
  {
    MapOp { source: self, f }
  }

  /// Keeps only values matching `predicate`.
  fn filter<F>(self, predicate: F) -> FilterOp<Self, F>
  where
    Self: Sized,
    F: Fn(&T) -> bool + Clone + Send + Sync + 'static,
  {
    FilterOp { source: self, predicate }
  }

  /// Maps every value to an inner publisher and merges up to
  /// `max_concurrency` of them, interleaving their values.
  fn flat_map<R, P, F>(
    self,
    f: F,
    max_concurrency: usize,
  ) -> FlatMapOp<Self, F, P>
  where
    Self: Sized,
    R: Send + 'static,
    P: Publisher<R> + 'static,
    F: Fn(T) -> P + Clone + Send + Sync + 'static,
  {
    self.flat_map_with(f, max_concurrency, DEFAULT_PREFETCH, false)
  }

  /// [`flat_map`](PublisherExt::flat_map) with explicit per-inner prefetch
  /// and error-delay policy (`delay_error: true` surfaces errors only after
  /// all inners finished).
  fn flat_map_with<R, P, F>(
    self,
    f: F,
    max_concurrency: usize,
    prefetch: usize,
    delay_error: bool,
  ) -> FlatMapOp<Self, F, P>
  where
    Self: Sized,
    R: Send + 'static,
    P: Publisher<R> + 'static,
    F: Fn(T) -> P + Clone + Send + Sync + 'static,
  {
    FlatMapOp::new(self, f, max_concurrency, prefetch, delay_error)
  }

  /// Merges a stream of publishers, up to `max_concurrency` at a time.
  fn flatten<R>(self, max_concurrency: usize) -> FlatMapOp<Self, fn(T) -> T, T>
  where
    Self: Sized,
    R: Send + 'static,
    T: Publisher<R> + 'static,
  {
    self.flat_map(std::convert::identity as fn(T) -> T, max_concurrency)
  }

  /// Maps every value to an inner publisher and concatenates them: only one
  /// inner is ever active, the next outer value is not mapped until the
  /// current inner completes. Errors propagate immediately.
  fn concat_map<R, P, F>(self, f: F) -> ConcatMapOp<Self, F, P>
  where
    Self: Sized,
    R: Send + 'static,
    P: Publisher<R> + 'static,
    F: Fn(T) -> P + Clone + Send + Sync + 'static,
  {
    self.concat_map_with(f, DEFAULT_PREFETCH, ErrorMode::Immediate)
  }

  /// [`concat_map`](PublisherExt::concat_map) with explicit outer prefetch
  /// and error policy.
  fn concat_map_with<R, P, F>(
    self,
    f: F,
    prefetch: usize,
    mode: ErrorMode,
  ) -> ConcatMapOp<Self, F, P>
  where
    Self: Sized,
    R: Send + 'static,
    P: Publisher<R> + 'static,
    F: Fn(T) -> P + Clone + Send + Sync + 'static,
  {
    ConcatMapOp::new(self, f, prefetch, mode)
  }

  /// Concatenates a stream of publishers in order.
  fn concat<R>(self) -> ConcatMapOp<Self, fn(T) -> T, T>
  where
    Self: Sized,
    R: Send + 'static,
    T: Publisher<R> + 'static,
  {
    self.concat_map(std::convert::identity as fn(T) -> T)
  }

  /// Partitions values by `key_fn` into independently subscribable groups.
  fn group_by<K, F>(self, key_fn: F) -> GroupByOp<Self, F>
  where
    Self: Sized,
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Clone + Send + Sync + 'static,
  {
    self.group_by_with(key_fn, DEFAULT_PREFETCH)
  }

  /// [`group_by`](PublisherExt::group_by) with an explicit upstream
  /// prefetch, which also bounds how much an unconsumed group may buffer.
  fn group_by_with<K, F>(self, key_fn: F, prefetch: usize) -> GroupByOp<Self, F>
  where
    Self: Sized,
    K: Eq + std::hash::Hash + Clone + Send + Sync + 'static,
    F: Fn(&T) -> K + Clone + Send + Sync + 'static,
  {
    GroupByOp { source: self, key_fn, prefetch }
  }

  /// Moves downstream signal delivery onto a worker of `scheduler`.
  fn publish_on<SD>(self, scheduler: SD) -> PublishOnOp<Self, SD>
  where
    Self: Sized,
    SD: Scheduler + 'static,
  {
    self.publish_on_with(scheduler, DEFAULT_PREFETCH)
  }

  /// [`publish_on`](PublisherExt::publish_on) with an explicit prefetch.
  fn publish_on_with<SD>(
    self,
    scheduler: SD,
    prefetch: usize,
  ) -> PublishOnOp<Self, SD>
  where
    Self: Sized,
    SD: Scheduler + 'static,
  {
    PublishOnOp { source: self, scheduler, prefetch }
  }

  /// Runs the act of subscribing (and all upstream `request` calls) on a
  /// worker of `scheduler`.
  fn subscribe_on<SD>(self, scheduler: SD) -> SubscribeOnOp<Self, SD>
  where
    Self: Sized,
    SD: Scheduler + 'static,
  {
    SubscribeOnOp { source: self, scheduler }
  }

  /// Erases the concrete publisher type.
  fn boxed(self) -> BoxPublisher<T>
  where
    Self: Sized + 'static,
  {
    Arc::new(self)
  }

  /// Subscribes with a per-value closure and unbounded demand. Errors end up
  /// at the dropped-error hook; use
  /// [`subscribe_all`](PublisherExt::subscribe_all) to handle them.
  fn subscribe<N>(&self, next: N) -> SubscriptionHandle
  where
    N: FnMut(T) + Send + 'static,
  {
    self.subscribe_all(next, crate::error::on_error_dropped, || {})
  }

  /// Subscribes with value, error and completion closures and unbounded
  /// demand.
  fn subscribe_all<N, E, C>(
    &self,
    next: N,
    error: E,
    complete: C,
  ) -> SubscriptionHandle
  where
    N: FnMut(T) + Send + 'static,
    E: FnOnce(FlowError) + Send + 'static,
    C: FnOnce() + Send + 'static,
  {
    let subscriber = Arc::new(LambdaSubscriber::new(next, error, complete));
    self.subscribe_raw(subscriber.clone());
    SubscriptionHandle::new(subscriber)
  }
}

impl<T: Send + 'static, P: Publisher<T>> PublisherExt<T> for P {}

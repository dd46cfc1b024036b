//! Subscriber trait and the closure-based subscriber behind `subscribe`.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use parking_lot::Mutex;

use crate::{
  error::{self, FlowError},
  subscription::{Subscription, Upstream, UpstreamCell, UNBOUNDED},
};

/// The consumer side of a stream.
///
/// Receives, in strict order, at most one `on_subscribe`, then zero or more
/// `on_next`, then exactly one terminal signal (`on_complete` xor
/// `on_error`). All methods take `&self`: signals may be delivered from any
/// thread, and the implementations here use atomics or queues internally
/// rather than exclusive references.
pub trait Subscriber<T>: Send + Sync {
  fn on_subscribe(&self, upstream: Upstream<T>);

  fn on_next(&self, value: T);

  /// Drain hint from an `Async`-fused upstream: a value was parked in the
  /// shared queue and can be pulled with `poll` instead of being pushed.
  /// Only ever delivered after this subscriber negotiated `ASYNC` fusion,
  /// so the default is a no-op.
  fn on_queued(&self) {}

  fn on_error(&self, error: FlowError);

  fn on_complete(&self);
}

/// Handle returned by the `subscribe` family, used to cancel from outside
/// the stream.
#[derive(Clone)]
pub struct SubscriptionHandle(Arc<dyn Subscription>);

impl SubscriptionHandle {
  pub(crate) fn new(subscription: Arc<dyn Subscription>) -> Self {
    SubscriptionHandle(subscription)
  }

  #[inline]
  pub fn request(&self, n: i64) { self.0.request(n) }

  #[inline]
  pub fn cancel(&self) { self.0.cancel() }

  /// Activates RAII behavior: `cancel` runs as soon as the returned guard
  /// goes out of scope.
  ///
  /// **Attention:** if you don't assign the return value to a variable, the
  /// subscription is cancelled immediately, which is probably not what you
  /// want.
  pub fn cancel_when_dropped(self) -> SubscriptionGuard {
    SubscriptionGuard(self)
  }
}

/// An RAII "scoped subscription": dropping the guard cancels it.
#[must_use]
pub struct SubscriptionGuard(SubscriptionHandle);

impl Drop for SubscriptionGuard {
  #[inline]
  fn drop(&mut self) { self.0.cancel() }
}

/// Closure adapter behind the `subscribe` family: `next` runs per value,
/// the terminal callbacks once. Requests unbounded demand on subscribe.
pub(crate) struct LambdaSubscriber<T, N, E, C> {
  upstream: UpstreamCell<T>,
  terminated: AtomicBool,
  next: Mutex<N>,
  error: Mutex<Option<E>>,
  complete: Mutex<Option<C>>,
}

impl<T, N, E, C> LambdaSubscriber<T, N, E, C>
where
  N: FnMut(T),
  E: FnOnce(FlowError),
  C: FnOnce(),
{
  pub(crate) fn new(next: N, error: E, complete: C) -> Self {
    LambdaSubscriber {
      upstream: UpstreamCell::new(),
      terminated: AtomicBool::new(false),
      next: Mutex::new(next),
      error: Mutex::new(Some(error)),
      complete: Mutex::new(Some(complete)),
    }
  }

  fn enter_terminal(&self) -> bool {
    self
      .terminated
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }
}

impl<T, N, E, C> Subscriber<T> for LambdaSubscriber<T, N, E, C>
where
  T: Send + 'static,
  N: FnMut(T) + Send + 'static,
  E: FnOnce(FlowError) + Send + 'static,
  C: FnOnce() + Send + 'static,
{
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if self.upstream.set(upstream) {
      self.upstream.request(UNBOUNDED);
    }
  }

  fn on_next(&self, value: T) {
    if self.terminated.load(Ordering::Acquire) {
      return;
    }
    (self.next.lock())(value);
  }

  fn on_error(&self, err: FlowError) {
    if self.enter_terminal() {
      match self.error.lock().take() {
        Some(f) => f(err),
        None => error::on_error_dropped(err),
      }
    } else {
      error::on_error_dropped(err);
    }
  }

  fn on_complete(&self) {
    if self.enter_terminal() {
      if let Some(f) = self.complete.lock().take() {
        f();
      }
    }
  }
}

impl<T, N, E, C> Subscription for LambdaSubscriber<T, N, E, C>
where
  T: Send + 'static,
  N: FnMut(T) + Send + 'static,
  E: FnOnce(FlowError) + Send + 'static,
  C: FnOnce() + Send + 'static,
{
  fn request(&self, n: i64) { self.upstream.request(n) }

  fn cancel(&self) {
    self.terminated.store(true, Ordering::Release);
    self.upstream.cancel();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::subscription::EmptySubscription;

  #[test]
  fn lambda_stops_after_terminal() {
    let hits = Arc::new(Mutex::new(Vec::new()));
    let h = hits.clone();
    let sub = LambdaSubscriber::new(
      move |v: i32| h.lock().push(v),
      |_err| {},
      || {},
    );
    sub.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
    sub.on_next(1);
    sub.on_complete();
    sub.on_next(2);
    assert_eq!(&*hits.lock(), &[1]);
  }

  #[test]
  fn lambda_error_fires_once() {
    let errors = Arc::new(Mutex::new(0));
    let e = errors.clone();
    let sub = LambdaSubscriber::new(
      |_: i32| {},
      move |_err| *e.lock() += 1,
      || {},
    );
    sub.on_error(FlowError::message("first"));
    sub.on_error(FlowError::message("second"));
    assert_eq!(*errors.lock(), 1);
  }
}

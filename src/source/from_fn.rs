//! Callable source: computes at most one value at subscribe time.

use std::sync::Arc;

use crate::{
  error::catch_callback,
  publisher::{Publisher, Scalar},
  subscriber::Subscriber,
  subscription::{EmptySubscription, Upstream},
};

use super::just::ScalarSubscription;

/// Invokes `f` once per subscriber; `Some(v)` emits the value then
/// completes, `None` just completes. A panicking `f` becomes an `on_error`.
///
/// The merge operators use the same callable through the scalar probe to
/// skip inner subscriptions entirely.
pub fn from_fn<T, F>(f: F) -> FromFnPublisher<F>
where
  T: Send + 'static,
  F: Fn() -> Option<T> + Send + Sync + 'static,
{
  FromFnPublisher(f)
}

#[derive(Clone)]
pub struct FromFnPublisher<F>(F);

impl<T, F> Publisher<T> for FromFnPublisher<F>
where
  T: Send + 'static,
  F: Fn() -> Option<T> + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    match catch_callback(&self.0) {
      Ok(Some(value)) => {
        let subscription =
          Arc::new(ScalarSubscription::new(subscriber.clone(), value));
        subscriber.on_subscribe(Upstream::Fused(subscription));
      }
      Ok(None) => {
        subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
        subscriber.on_complete();
      }
      Err(err) => {
        subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
        subscriber.on_error(err);
      }
    }
  }

  fn try_scalar(&self) -> Option<Scalar<T>> {
    Some(match catch_callback(&self.0) {
      Ok(Some(value)) => Scalar::Value(value),
      Ok(None) => Scalar::Empty,
      Err(err) => Scalar::Failed(err),
    })
  }
}

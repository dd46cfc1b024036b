//! Publisher factory invoked per subscriber.

use std::sync::Arc;

use crate::{
  error::catch_callback,
  publisher::Publisher,
  subscriber::Subscriber,
  subscription::{EmptySubscription, Upstream},
};

/// Defers choosing the actual publisher until subscribe time: `factory` runs
/// once per subscriber.
pub fn defer<T, P, F>(factory: F) -> DeferPublisher<F>
where
  T: Send + 'static,
  P: Publisher<T>,
  F: Fn() -> P + Send + Sync + 'static,
{
  DeferPublisher(factory)
}

#[derive(Clone)]
pub struct DeferPublisher<F>(F);

impl<T, P, F> Publisher<T> for DeferPublisher<F>
where
  T: Send + 'static,
  P: Publisher<T>,
  F: Fn() -> P + Send + Sync + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    match catch_callback(&self.0) {
      Ok(publisher) => publisher.subscribe_raw(subscriber),
      Err(err) => {
        subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
        subscriber.on_error(err);
      }
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::error::FlowError;
  use crate::prelude::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[test]
  fn factory_runs_per_subscription() {
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let publisher = defer(move || {
      c.fetch_add(1, Ordering::Relaxed);
      source::range(0, 3)
    });
    publisher.subscribe(|_| {});
    publisher.subscribe(|_| {});
    assert_eq!(calls.load(Ordering::Relaxed), 2);
  }

  #[test]
  fn factory_panic_becomes_on_error() {
    let ts = crate::test_support::TestSubscriber::<i64>::with_request(1);
    defer(|| -> crate::source::RangePublisher { panic!("factory died") })
      .subscribe_raw(ts.clone());
    assert!(matches!(ts.error(), Some(FlowError::Panic(_))));
  }
}

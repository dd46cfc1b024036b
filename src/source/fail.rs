//! Source erroring immediately.

use std::{marker::PhantomData, sync::Arc};

use crate::{
  error::FlowError,
  publisher::{Publisher, Scalar},
  subscriber::Subscriber,
  subscription::{EmptySubscription, Upstream},
};

/// Emits nothing and delivers `error` immediately.
///
/// ```
/// use rxflow::prelude::*;
/// use std::sync::{Arc, Mutex};
///
/// let seen = Arc::new(Mutex::new(None));
/// let sink = seen.clone();
/// source::fail::<i32>(FlowError::message("boom")).subscribe_all(
///   |_| {},
///   move |e| *sink.lock().unwrap() = Some(e),
///   || {},
/// );
/// assert!(seen.lock().unwrap().is_some());
/// ```
pub fn fail<T: Send + 'static>(error: FlowError) -> FailPublisher<T> {
  FailPublisher { error, _marker: PhantomData }
}

pub struct FailPublisher<T> {
  error: FlowError,
  _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for FailPublisher<T> {
  fn clone(&self) -> Self {
    FailPublisher { error: self.error.clone(), _marker: PhantomData }
  }
}

impl<T: Send + 'static> Publisher<T> for FailPublisher<T> {
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
    subscriber.on_error(self.error.clone());
  }

  fn try_scalar(&self) -> Option<Scalar<T>> {
    Some(Scalar::Failed(self.error.clone()))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::prelude::*;

  #[test]
  fn delivers_the_error_and_nothing_else() {
    let ts = crate::test_support::TestSubscriber::<i32>::with_request(1);
    fail::<i32>(FlowError::message("boom")).subscribe_raw(ts.clone());
    assert_eq!(ts.value_count(), 0);
    assert!(!ts.is_completed());
    assert!(matches!(ts.error(), Some(FlowError::Message(_))));
  }
}

//! Source completing immediately.

use std::{marker::PhantomData, sync::Arc};

use crate::{
  publisher::{Publisher, Scalar},
  subscriber::Subscriber,
  subscription::{EmptySubscription, Upstream},
};

/// Emits nothing and completes immediately.
pub fn empty<T: Send + 'static>() -> EmptyPublisher<T> {
  EmptyPublisher(PhantomData)
}

pub struct EmptyPublisher<T>(PhantomData<fn() -> T>);

impl<T> Clone for EmptyPublisher<T> {
  fn clone(&self) -> Self { EmptyPublisher(PhantomData) }
}

impl<T: Send + 'static> Publisher<T> for EmptyPublisher<T> {
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    subscriber.on_subscribe(Upstream::Plain(Arc::new(EmptySubscription)));
    subscriber.on_complete();
  }

  fn try_scalar(&self) -> Option<Scalar<T>> { Some(Scalar::Empty) }
}

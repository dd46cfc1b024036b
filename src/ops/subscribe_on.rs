//! Runs subscription and demand signaling on a scheduler worker.

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use crate::{
  error::FlowError,
  publisher::Publisher,
  scheduler::{Scheduler, Worker},
  subscriber::Subscriber,
  subscription::{Subscription, Upstream, UpstreamCell},
};

#[derive(Clone)]
pub struct SubscribeOnOp<S, SD> {
  pub(crate) source: S,
  pub(crate) scheduler: SD,
}

impl<T, S, SD> Publisher<T> for SubscribeOnOp<S, SD>
where
  T: Send + 'static,
  S: Publisher<T> + Clone + 'static,
  SD: Scheduler + 'static,
{
  fn subscribe_raw(&self, subscriber: Arc<dyn Subscriber<T>>) {
    let worker = self.scheduler.create_worker();
    let sub = Arc::new(SubscribeOnSubscriber {
      downstream: subscriber.clone(),
      upstream: Arc::new(UpstreamCell::new()),
      worker: worker.clone(),
      cancelled: AtomicBool::new(false),
    });
    // The downstream gets its subscription right away; demand is parked in
    // the cell until the worker performed the actual subscribe.
    subscriber.on_subscribe(Upstream::Plain(sub.clone()));
    let source = self.source.clone();
    worker.schedule(Box::new(move || {
      source.subscribe_raw(sub);
    }));
  }
}

struct SubscribeOnSubscriber<T> {
  downstream: Arc<dyn Subscriber<T>>,
  upstream: Arc<UpstreamCell<T>>,
  worker: Arc<dyn Worker>,
  cancelled: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    self.upstream.set(upstream);
  }

  fn on_next(&self, value: T) {
    if !self.cancelled.load(Ordering::Acquire) {
      self.downstream.on_next(value);
    }
  }

  fn on_error(&self, error: FlowError) {
    if self.cancelled.load(Ordering::Acquire) {
      crate::error::on_error_dropped(error);
      return;
    }
    self.downstream.on_error(error);
    self.worker.shutdown();
  }

  fn on_complete(&self) {
    if !self.cancelled.load(Ordering::Acquire) {
      self.downstream.on_complete();
      self.worker.shutdown();
    }
  }
}

impl<T: Send + 'static> Subscription for SubscribeOnSubscriber<T> {
  fn request(&self, n: i64) {
    if self.cancelled.load(Ordering::Acquire) {
      return;
    }
    // Demand hops onto the worker so it is ordered after the subscribe
    // task and never runs concurrently with it.
    let cell = self.upstream.clone();
    self.worker.schedule(Box::new(move || cell.request(n)));
  }

  fn cancel(&self) {
    if self.cancelled.swap(true, Ordering::AcqRel) {
      return;
    }
    self.upstream.cancel();
    self.worker.shutdown();
  }
}

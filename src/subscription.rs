//! The demand/cancellation channel between a Subscriber and its upstream.
//!
//! Demand is signed 64-bit credit, saturating at [`UNBOUNDED`]. Both the
//! credit counter and the cancellation flag are racy by contract: `request`
//! and `cancel` may arrive from any thread, concurrently with delivery, so
//! every accounting helper here is a compare-and-swap loop over an atomic.

use std::sync::{
  atomic::{AtomicBool, AtomicI64, Ordering},
  Arc,
};

use once_cell::sync::OnceCell;

use crate::{
  error::{self, FlowError},
  fusion::{FusionMode, QueueSubscription},
};

/// The control channel owned jointly by an operator and its upstream.
///
/// `request` adds demand credit; `cancel` is idempotent and, once observed,
/// suppresses all further signal delivery. Cancellation races with in-flight
/// emission and must be safe either way: the upstream need not stop
/// instantaneously, but no delivery after the cancel may become visible to
/// the subscriber.
pub trait Subscription: Send + Sync {
  /// Adds `n` credit to this subscription. `n <= 0` is a caller error and
  /// surfaces as an `on_error` with [`FlowError::IllegalArgument`], never as
  /// a panic.
  fn request(&self, n: i64);

  /// Stops the upstream from delivering further signals. Idempotent and
  /// thread-safe.
  fn cancel(&self);
}

/// Demand credit meaning "no further bookkeeping needed".
pub const UNBOUNDED: i64 = i64::MAX;

/// Adds `n` to a demand counter, saturating at [`UNBOUNDED`]. Returns the
/// counter value before the addition.
pub fn add_cap(requested: &AtomicI64, n: i64) -> i64 {
  let mut current = requested.load(Ordering::Relaxed);
  loop {
    if current == UNBOUNDED {
      return UNBOUNDED;
    }
    let next = current.saturating_add(n);
    match requested.compare_exchange_weak(
      current,
      next,
      Ordering::AcqRel,
      Ordering::Relaxed,
    ) {
      Ok(_) => return current,
      Err(actual) => current = actual,
    }
  }
}

/// Deducts `n` delivered values from a demand counter, unless unbounded.
/// Returns the remaining credit.
pub fn produced(requested: &AtomicI64, n: i64) -> i64 {
  let mut current = requested.load(Ordering::Relaxed);
  loop {
    if current == UNBOUNDED {
      return UNBOUNDED;
    }
    let next = match current.checked_sub(n) {
      Some(next) if next >= 0 => next,
      _ => {
        tracing::debug!(credit = current, produced = n, "demand underflow");
        0
      }
    };
    match requested.compare_exchange_weak(
      current,
      next,
      Ordering::AcqRel,
      Ordering::Relaxed,
    ) {
      Ok(_) => return next,
      Err(actual) => current = actual,
    }
  }
}

/// Checks a caller-supplied request amount.
pub fn validate_demand(n: i64) -> Result<i64, FlowError> {
  if n > 0 { Ok(n) } else { Err(FlowError::bad_request(n)) }
}

/// The capability view of an upstream handed to `on_subscribe`.
///
/// A subscriber probes fusion support exactly once, by matching this enum at
/// subscribe time; there is no runtime downcasting anywhere else.
pub enum Upstream<T> {
  /// Push-only upstream.
  Plain(Arc<dyn Subscription>),
  /// Queue-backed upstream supporting fusion negotiation.
  Fused(Arc<dyn QueueSubscription<T>>),
}

impl<T> Clone for Upstream<T> {
  fn clone(&self) -> Self {
    match self {
      Upstream::Plain(s) => Upstream::Plain(s.clone()),
      Upstream::Fused(q) => Upstream::Fused(q.clone()),
    }
  }
}

impl<T> Upstream<T> {
  #[inline]
  pub fn request(&self, n: i64) {
    match self {
      Upstream::Plain(s) => s.request(n),
      Upstream::Fused(q) => q.request(n),
    }
  }

  #[inline]
  pub fn cancel(&self) {
    match self {
      Upstream::Plain(s) => s.cancel(),
      Upstream::Fused(q) => q.cancel(),
    }
  }

  /// Negotiates a fusion mode; a push-only upstream always answers
  /// [`FusionMode::NONE`].
  pub fn request_fusion(&self, mode: FusionMode) -> FusionMode {
    match self {
      Upstream::Plain(_) => FusionMode::NONE,
      Upstream::Fused(q) => q.request_fusion(mode),
    }
  }

  /// The queue view of this upstream, when it has one.
  pub fn fused(&self) -> Option<&Arc<dyn QueueSubscription<T>>> {
    match self {
      Upstream::Plain(_) => None,
      Upstream::Fused(q) => Some(q),
    }
  }
}

/// Single-assignment upstream holder used by operator subscribers.
///
/// Demand requested before the upstream arrives is parked in `pending` and
/// flushed on `set`; a second `set` is the double-`on_subscribe` protocol
/// violation and the newcomer is cancelled.
pub struct UpstreamCell<T> {
  slot: OnceCell<Upstream<T>>,
  pending: AtomicI64,
  cancelled: AtomicBool,
}

impl<T> Default for UpstreamCell<T> {
  fn default() -> Self { Self::new() }
}

impl<T> UpstreamCell<T> {
  pub fn new() -> Self {
    UpstreamCell {
      slot: OnceCell::new(),
      pending: AtomicI64::new(0),
      cancelled: AtomicBool::new(false),
    }
  }

  /// Installs the upstream. Returns `false` if one was already installed;
  /// the newcomer has been cancelled in that case.
  pub fn set(&self, upstream: Upstream<T>) -> bool {
    if let Err(newcomer) = self.slot.set(upstream) {
      tracing::warn!("second on_subscribe rejected");
      newcomer.cancel();
      return false;
    }
    if self.cancelled.load(Ordering::Acquire) {
      if let Some(up) = self.slot.get() {
        up.cancel();
      }
      return true;
    }
    let parked = self.pending.swap(0, Ordering::AcqRel);
    if parked > 0 {
      if let Some(up) = self.slot.get() {
        up.request(parked);
      }
    }
    true
  }

  pub fn get(&self) -> Option<&Upstream<T>> { self.slot.get() }

  /// Forwards demand, or parks it until the upstream arrives. Non-positive
  /// amounts are forwarded unparked so the upstream can raise the protocol
  /// error.
  pub fn request(&self, n: i64) {
    if n <= 0 {
      match self.slot.get() {
        Some(up) => up.request(n),
        None => error::on_error_dropped(FlowError::bad_request(n)),
      }
      return;
    }
    match self.slot.get() {
      Some(up) => up.request(n),
      None => {
        add_cap(&self.pending, n);
        // set() may have flushed between the load and the add; re-check so
        // the parked credit cannot be stranded.
        if let Some(up) = self.slot.get() {
          let parked = self.pending.swap(0, Ordering::AcqRel);
          if parked > 0 {
            up.request(parked);
          }
        }
      }
    }
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Release);
    if let Some(up) = self.slot.get() {
      up.cancel();
    }
  }

  pub fn is_cancelled(&self) -> bool { self.cancelled.load(Ordering::Acquire) }
}

/// Subscription of sources that terminate during `subscribe`, before any
/// demand can matter (`empty`, `fail`).
pub struct EmptySubscription;

impl Subscription for EmptySubscription {
  fn request(&self, n: i64) {
    // The stream is already terminal; a bad request still must not vanish.
    if let Err(err) = validate_demand(n) {
      error::on_error_dropped(err);
    }
  }

  fn cancel(&self) {}
}

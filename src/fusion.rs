//! Operator-fusion negotiation.
//!
//! Fusion lets adjacent stages skip intermediate buffering: a consumer asks
//! its upstream subscription for a mode, and the upstream grants the best
//! mode it supports intersected with the request. `SYNC` means the source
//! already holds every value and the consumer may drain it with `poll` alone;
//! `ASYNC` means the upstream is queue-backed and the consumer pulls via
//! `poll` while still issuing `request` for refills.

use std::{
  fmt,
  ops::{BitAnd, BitOr},
};

use crate::{error::FlowError, subscription::Subscription};

/// Outcome of pulling from a fused subscription: a value, emptiness (final in
/// `SYNC` mode, momentary in `ASYNC`), or a failure raised by a fused stage's
/// user callback.
pub type PollResult<T> = Result<Option<T>, FlowError>;

/// Bit set describing a fusion request or grant.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FusionMode(u8);

impl FusionMode {
  /// No fusion: plain push delivery.
  pub const NONE: Self = FusionMode(0);
  /// The source holds all values already; draining is synchronous and never
  /// needs `request`.
  pub const SYNC: Self = FusionMode(1);
  /// The source is queue-backed; the consumer pulls via `poll` and keeps
  /// requesting for refill.
  pub const ASYNC: Self = FusionMode(1 << 1);
  /// Either fusion kind is acceptable.
  pub const ANY: Self = FusionMode(1 | 1 << 1);
  /// Modifier: the requester crosses an execution-context boundary, so a
  /// `SYNC` grant must not travel through it.
  pub const BOUNDARY: Self = FusionMode(1 << 2);

  #[inline]
  pub fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

  #[inline]
  pub fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

  #[inline]
  pub fn is_none(self) -> bool { !self.intersects(Self::ANY) }

  /// The fusion kind with modifiers stripped.
  #[inline]
  pub fn kind(self) -> Self { self & Self::ANY }
}

impl BitOr for FusionMode {
  type Output = FusionMode;
  #[inline]
  fn bitor(self, rhs: Self) -> Self { FusionMode(self.0 | rhs.0) }
}

impl BitAnd for FusionMode {
  type Output = FusionMode;
  #[inline]
  fn bitand(self, rhs: Self) -> Self { FusionMode(self.0 & rhs.0) }
}

impl fmt::Debug for FusionMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let kind = match self.kind() {
      Self::SYNC => "Sync",
      Self::ASYNC => "Async",
      Self::ANY => "Any",
      _ => "None",
    };
    if self.contains(Self::BOUNDARY) {
      write!(f, "{kind}|Boundary")
    } else {
      write!(f, "{kind}")
    }
  }
}

/// The queue view of a subscription.
///
/// A subscription exposing this capability lets its subscriber pull buffered
/// values instead of waiting for pushes. `clear` is only ever called by the
/// thread currently holding the drain right, which is what makes it safe to
/// race with a `cancel` from elsewhere.
pub trait QueueSubscription<T>: Subscription {
  /// Negotiates a fusion mode; the grant is the best the upstream supports
  /// intersected with `mode`, or [`FusionMode::NONE`].
  fn request_fusion(&self, mode: FusionMode) -> FusionMode;

  /// Pulls the next buffered value. In `SYNC` mode `Ok(None)` is final; in
  /// `ASYNC` mode it only means "momentarily empty".
  fn poll(&self) -> PollResult<T>;

  fn is_empty(&self) -> bool;

  /// Discards everything still buffered. Must be called with the drain right
  /// held.
  fn clear(&self);
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn mode_algebra() {
    assert!(FusionMode::ANY.contains(FusionMode::SYNC));
    assert!(FusionMode::ANY.contains(FusionMode::ASYNC));
    assert!(!FusionMode::SYNC.contains(FusionMode::ASYNC));
    assert!((FusionMode::ASYNC | FusionMode::BOUNDARY)
      .contains(FusionMode::BOUNDARY));
    assert_eq!(
      (FusionMode::ASYNC | FusionMode::BOUNDARY).kind(),
      FusionMode::ASYNC
    );
    assert!(FusionMode::BOUNDARY.is_none());
    assert!(!FusionMode::NONE.intersects(FusionMode::ANY));
  }

  #[test]
  fn debug_names_the_boundary() {
    let mode = FusionMode::ASYNC | FusionMode::BOUNDARY;
    assert_eq!(format!("{mode:?}"), "Async|Boundary");
    assert_eq!(format!("{:?}", FusionMode::NONE), "None");
  }
}

//! Terminal error values and the process-wide dropped-error hook.
//!
//! A stream terminates with at most one [`FlowError`]. Errors that arrive
//! after the terminal signal have nowhere legal to go and are routed through
//! [`on_error_dropped`] instead of being silently discarded.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// The terminal error signal of a stream.
///
/// Cloneable on purpose: merge operators fan a single terminal signal out to
/// many inner consumers, so every payload is `Arc`ed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum FlowError {
  /// A caller broke the backpressure protocol with a bad argument, e.g. a
  /// non-positive `request`.
  #[error("illegal argument: {0}")]
  IllegalArgument(Arc<str>),

  /// A Publisher/Subscriber contract rule was violated, e.g. a second
  /// `on_subscribe` on the same subscriber.
  #[error("protocol violation: {0}")]
  Protocol(Arc<str>),

  /// An internal queue rejected a value it was sized to hold: the upstream
  /// produced more than it was allowed to.
  #[error("queue overflow: upstream produced more than requested")]
  QueueOverflow,

  /// A user callback (mapper, predicate, key function) panicked.
  #[error("callback panicked: {0}")]
  Panic(Arc<str>),

  /// Several errors accumulated under a delay-error policy.
  #[error("{} errors occurred", .0.len())]
  Composite(Arc<[FlowError]>),

  /// A plain message error, mostly produced by [`crate::source::fail`].
  #[error("{0}")]
  Message(Arc<str>),

  /// Any other error routed into a stream.
  #[error("{0}")]
  Other(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl FlowError {
  pub fn message(msg: impl Into<String>) -> Self {
    FlowError::Message(msg.into().into())
  }

  pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
    FlowError::Other(Arc::new(err))
  }

  pub(crate) fn bad_request(n: i64) -> Self {
    FlowError::IllegalArgument(
      format!("request amount must be positive, got {n}").into(),
    )
  }

  pub(crate) fn protocol(msg: &str) -> Self { FlowError::Protocol(msg.into()) }

  /// Collapses an accumulated error list into one terminal value; a single
  /// cause stays as-is instead of being wrapped.
  pub fn composite(mut errors: Vec<FlowError>) -> Self {
    if errors.len() == 1 {
      errors.pop().unwrap_or(FlowError::Message("".into()))
    } else {
      FlowError::Composite(errors.into())
    }
  }

  /// The individual causes of this error; a non-composite error is its own
  /// single cause.
  pub fn causes(&self) -> &[FlowError] {
    match self {
      FlowError::Composite(causes) => causes,
      _ => std::slice::from_ref(self),
    }
  }
}

/// Runs a user callback, converting a panic into [`FlowError::Panic`].
///
/// The closure is asserted unwind-safe: the engine never touches a callback
/// again after it panicked, so no broken invariant can be observed.
pub(crate) fn catch_callback<R>(
  f: impl FnOnce() -> R,
) -> Result<R, FlowError> {
  std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(
    |payload| {
      let msg = payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
      FlowError::Panic(msg.into())
    },
  )
}

type DropHook = Box<dyn Fn(&FlowError) + Send + Sync>;

static DROPPED_HOOK: Lazy<RwLock<Option<DropHook>>> =
  Lazy::new(|| RwLock::new(None));

/// Routes an error that can no longer legally reach its subscriber.
///
/// Called by operators when an error arrives after the stream already hit a
/// terminal state. Without a hook installed the error is logged.
pub fn on_error_dropped(err: FlowError) {
  let hook = DROPPED_HOOK.read();
  match &*hook {
    Some(f) => f(&err),
    None => {
      tracing::warn!(error = %err, "terminal error dropped after stream end")
    }
  }
}

/// Installs a process-wide hook receiving every dropped error.
pub fn set_dropped_error_hook(
  hook: impl Fn(&FlowError) + Send + Sync + 'static,
) {
  *DROPPED_HOOK.write() = Some(Box::new(hook));
}

/// Removes the hook installed by [`set_dropped_error_hook`].
pub fn reset_dropped_error_hook() { *DROPPED_HOOK.write() = None; }

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn composite_flattens_single_cause() {
    let err = FlowError::composite(vec![FlowError::message("boom")]);
    assert!(matches!(err, FlowError::Message(_)));
    assert_eq!(err.causes().len(), 1);
  }

  #[test]
  fn composite_keeps_all_causes() {
    let err = FlowError::composite(vec![
      FlowError::message("first"),
      FlowError::message("second"),
    ]);
    assert_eq!(err.causes().len(), 2);
    assert_eq!(err.to_string(), "2 errors occurred");
  }

  #[test]
  fn catch_callback_translates_panics() {
    let err = catch_callback(|| -> i32 { panic!("mapper blew up") })
      .expect_err("panic must surface as an error");
    match err {
      FlowError::Panic(msg) => assert_eq!(&*msg, "mapper blew up"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn bad_request_mentions_the_amount() {
    let err = FlowError::bad_request(-3);
    assert!(err.to_string().contains("-3"));
  }
}

//! Test instrumentation: a scriptable, recording subscriber.
//!
//! Public on purpose, like the factory surface itself: downstream crates
//! testing their own operators need the same instrument this crate's tests
//! use.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{
  error::FlowError,
  fusion::FusionMode,
  subscriber::Subscriber,
  subscription::{Upstream, UpstreamCell, UNBOUNDED},
};

/// Records every signal it receives, drives demand on command, and checks
/// the ordering rules of the subscriber contract as it goes.
pub struct TestSubscriber<T> {
  upstream: UpstreamCell<T>,
  initial_request: i64,
  fusion_request: FusionMode,
  granted: Mutex<FusionMode>,
  state: Mutex<Recorded<T>>,
  cond: Condvar,
}

struct Recorded<T> {
  values: Vec<T>,
  error: Option<FlowError>,
  completed: bool,
  violations: Vec<String>,
}

impl<T> Default for Recorded<T> {
  fn default() -> Self {
    Recorded {
      values: Vec::new(),
      error: None,
      completed: false,
      violations: Vec::new(),
    }
  }
}

impl<T: Send + 'static> TestSubscriber<T> {
  /// A subscriber issuing `initial` demand at `on_subscribe` (0 = none).
  pub fn with_request(initial: i64) -> Arc<Self> {
    Arc::new(TestSubscriber {
      upstream: UpstreamCell::new(),
      initial_request: initial,
      fusion_request: FusionMode::NONE,
      granted: Mutex::new(FusionMode::NONE),
      state: Mutex::new(Recorded::default()),
      cond: Condvar::new(),
    })
  }

  /// A subscriber negotiating `mode` fusion at `on_subscribe`. A `SYNC`
  /// grant is drained on the spot; otherwise unbounded demand is issued.
  pub fn with_fusion(mode: FusionMode) -> Arc<Self> {
    Self::with_fusion_request(mode, UNBOUNDED)
  }

  /// Fusion negotiation with explicit initial demand for the non-`SYNC`
  /// outcomes.
  pub fn with_fusion_request(mode: FusionMode, initial: i64) -> Arc<Self> {
    Arc::new(TestSubscriber {
      upstream: UpstreamCell::new(),
      initial_request: initial,
      fusion_request: mode,
      granted: Mutex::new(FusionMode::NONE),
      state: Mutex::new(Recorded::default()),
      cond: Condvar::new(),
    })
  }

  pub fn request(&self, n: i64) { self.upstream.request(n) }

  pub fn cancel(&self) { self.upstream.cancel() }

  pub fn error(&self) -> Option<FlowError> { self.state.lock().error.clone() }

  pub fn is_completed(&self) -> bool { self.state.lock().completed }

  pub fn is_terminated(&self) -> bool {
    let state = self.state.lock();
    state.completed || state.error.is_some()
  }

  /// Contract violations observed so far (signal after terminal, double
  /// terminal). Clean runs return an empty list.
  pub fn violations(&self) -> Vec<String> {
    self.state.lock().violations.clone()
  }

  pub fn value_count(&self) -> usize { self.state.lock().values.len() }

  /// The fusion mode the upstream granted at subscribe time.
  pub fn granted_mode(&self) -> FusionMode { *self.granted.lock() }

  /// Blocks until a terminal signal arrives. Returns `false` on timeout.
  pub fn await_terminal(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut state = self.state.lock();
    while !(state.completed || state.error.is_some()) {
      if self.cond.wait_until(&mut state, deadline).timed_out() {
        return state.completed || state.error.is_some();
      }
    }
    true
  }

  /// Blocks until at least `n` values arrived. Returns `false` on timeout.
  pub fn await_count(&self, n: usize, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let mut state = self.state.lock();
    while state.values.len() < n {
      if self.cond.wait_until(&mut state, deadline).timed_out() {
        return state.values.len() >= n;
      }
    }
    true
  }

  fn record_terminal(
    &self,
    state: &mut Recorded<T>,
    apply: impl FnOnce(&mut Recorded<T>),
  ) {
    if state.completed || state.error.is_some() {
      state.violations.push("second terminal signal".into());
      return;
    }
    apply(state);
  }

  fn drain_sync(&self) {
    let Some(upstream) = self.upstream.get().cloned() else { return };
    let Some(queue) = upstream.fused().cloned() else { return };
    loop {
      match queue.poll() {
        Ok(Some(value)) => {
          let mut state = self.state.lock();
          state.values.push(value);
        }
        Ok(None) => {
          let mut state = self.state.lock();
          self.record_terminal(&mut state, |s| s.completed = true);
          break;
        }
        Err(err) => {
          let mut state = self.state.lock();
          self.record_terminal(&mut state, |s| s.error = Some(err));
          break;
        }
      }
    }
    self.cond.notify_all();
  }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
  pub fn values(&self) -> Vec<T> { self.state.lock().values.clone() }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
  fn on_subscribe(&self, upstream: Upstream<T>) {
    if !self.fusion_request.is_none() {
      let granted = upstream.request_fusion(self.fusion_request);
      *self.granted.lock() = granted;
      if !self.upstream.set(upstream) {
        return;
      }
      if granted == FusionMode::SYNC {
        self.drain_sync();
        return;
      }
    } else if !self.upstream.set(upstream) {
      return;
    }
    if self.initial_request > 0 {
      self.upstream.request(self.initial_request);
    }
  }

  fn on_next(&self, value: T) {
    let mut state = self.state.lock();
    if state.completed || state.error.is_some() {
      state.violations.push("on_next after terminal".into());
      return;
    }
    state.values.push(value);
    drop(state);
    self.cond.notify_all();
  }

  fn on_queued(&self) {
    // Async-fused delivery: pull whatever the shared queue holds.
    let Some(upstream) = self.upstream.get().cloned() else { return };
    let Some(queue) = upstream.fused().cloned() else { return };
    loop {
      match queue.poll() {
        Ok(Some(value)) => {
          self.state.lock().values.push(value);
        }
        Ok(None) => break,
        Err(err) => {
          let mut state = self.state.lock();
          self.record_terminal(&mut state, |s| s.error = Some(err));
          break;
        }
      }
    }
    self.cond.notify_all();
  }

  fn on_error(&self, error: FlowError) {
    let mut state = self.state.lock();
    self.record_terminal(&mut state, |s| s.error = Some(error));
    drop(state);
    self.cond.notify_all();
  }

  fn on_complete(&self) {
    let mut state = self.state.lock();
    self.record_terminal(&mut state, |s| s.completed = true);
    drop(state);
    self.cond.notify_all();
  }
}

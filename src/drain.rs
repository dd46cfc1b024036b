//! The queue-drain concurrency primitive.
//!
//! Every buffering operator serializes its emission through one
//! work-in-progress counter: whoever moves it from 0 owns the drain loop,
//! everyone else merely records that more work exists. The counter, not a
//! lock, is what makes the loop linearizable — a thread that fails to take
//! the drain right has still made its work visible, so the active drainer
//! (or the next one) observes it before exiting.
//!
//! Drain loops built on [`WorkCounter`] must re-read all shared state
//! (`done`, errors, cancellation, queue contents) fresh on every iteration;
//! caching any of it across iterations reintroduces the missed-signal race
//! the counter exists to close.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
  error::{self, FlowError},
  subscriber::Subscriber,
};

/// Work-in-progress counter: 0 = idle, N = one active drainer with N-1
/// missed wake-ups queued behind it.
#[derive(Default)]
pub struct WorkCounter(AtomicUsize);

impl WorkCounter {
  pub fn new() -> Self { Self::default() }

  /// Attempts to become the sole drainer without recording a missed wake-up
  /// on failure. Used by fast paths that fall back to a queue.
  #[inline]
  pub fn try_enter(&self) -> bool {
    self
      .0
      .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// Records work. Returns `true` when the caller became the sole drainer;
  /// `false` means an active drainer will pick the work up on its re-check.
  #[inline]
  pub fn enter(&self) -> bool { self.0.fetch_add(1, Ordering::AcqRel) == 0 }

  /// Retires `missed` observed units of work. A non-zero return means more
  /// work arrived while the loop was finishing and it must run again,
  /// passing the returned value as its next `missed`.
  #[inline]
  pub fn leave(&self, missed: usize) -> usize {
    self.0.fetch_sub(missed, Ordering::AcqRel) - missed
  }

  #[inline]
  pub fn current(&self) -> usize { self.0.load(Ordering::Acquire) }
}

/// Terminal-error accumulator supporting both first-error-wins and
/// accumulate-then-aggregate policies.
///
/// The tiny lock guards structural mutation only and is never held across a
/// user callback or an emission; demand and WIP stay lock-free.
#[derive(Default)]
pub struct ErrorBag {
  inner: Mutex<BagState>,
}

#[derive(Default)]
struct BagState {
  errors: SmallVec<[FlowError; 1]>,
  terminated: bool,
}

impl ErrorBag {
  pub fn new() -> Self { Self::default() }

  /// Records an error. Returns `false` — and routes the error to the
  /// dropped-error hook — when the bag already terminated.
  pub fn add(&self, err: FlowError) -> bool {
    {
      let mut state = self.inner.lock();
      if !state.terminated {
        state.errors.push(err);
        return true;
      }
    }
    error::on_error_dropped(err);
    false
  }

  pub fn has_errors(&self) -> bool { !self.inner.lock().errors.is_empty() }

  pub fn is_terminated(&self) -> bool { self.inner.lock().terminated }

  /// Marks the bag terminal and takes the accumulated aggregate, if any.
  /// Later `add` calls go to the dropped-error hook.
  pub fn terminate(&self) -> Option<FlowError> {
    let mut state = self.inner.lock();
    state.terminated = true;
    if state.errors.is_empty() {
      None
    } else {
      Some(FlowError::composite(state.errors.drain(..).collect()))
    }
  }
}

/// Half-serializer: merges one serial `on_next` source with terminal signals
/// that may fire from other threads, so a racing value and error can never
/// both reach the downstream.
///
/// The value side must already be serial (a single emitting thread at a
/// time); only the terminal side may race it.
pub fn half_next<T>(
  wip: &WorkCounter,
  errors: &ErrorBag,
  downstream: &dyn Subscriber<T>,
  value: T,
) -> bool {
  if wip.try_enter() {
    downstream.on_next(value);
    if wip.leave(1) != 0 {
      // A terminal signal arrived while we were emitting.
      half_emit_terminal(errors, downstream);
      return false;
    }
    true
  } else {
    // A terminal signal is being delivered; the value has nowhere to go.
    false
  }
}

/// Delivers the bag's terminal signal unless an in-flight `half_next` owns
/// the counter, in which case that call delivers it on its way out.
pub fn half_terminate<T>(
  wip: &WorkCounter,
  errors: &ErrorBag,
  downstream: &dyn Subscriber<T>,
) {
  if wip.enter() {
    half_emit_terminal(errors, downstream);
  }
}

fn half_emit_terminal<T>(errors: &ErrorBag, downstream: &dyn Subscriber<T>) {
  match errors.terminate() {
    Some(err) => downstream.on_error(err),
    None => downstream.on_complete(),
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
  };
  use std::thread;

  use crate::subscription::Upstream;

  #[test]
  fn enter_leave_round_trip() {
    let wip = WorkCounter::new();
    assert!(wip.enter());
    assert!(!wip.enter());
    assert!(!wip.enter());
    // Drainer retires its own unit, sees two missed wake-ups.
    let remaining = wip.leave(1);
    assert_eq!(remaining, 2);
    assert_eq!(wip.leave(remaining), 0);
    assert!(wip.try_enter());
  }

  #[test]
  fn every_failed_enter_is_observed() {
    // N threads hammer enter(); a single drainer must retire exactly N
    // units in total, never exiting early.
    let wip = Arc::new(WorkCounter::new());
    let drained = Arc::new(AtomicUsize::new(0));
    let threads: Vec<_> = (0..8)
      .map(|_| {
        let wip = wip.clone();
        let drained = drained.clone();
        thread::spawn(move || {
          for _ in 0..1000 {
            if wip.enter() {
              let mut missed = 1;
              loop {
                drained.fetch_add(missed, Ordering::Relaxed);
                missed = wip.leave(missed);
                if missed == 0 {
                  break;
                }
              }
            }
          }
        })
      })
      .collect();
    for t in threads {
      let _ = t.join();
    }
    assert_eq!(drained.load(Ordering::Relaxed), 8 * 1000);
    assert_eq!(wip.current(), 0);
  }

  #[test]
  fn bag_aggregates_in_order() {
    let bag = ErrorBag::new();
    assert!(bag.add(FlowError::message("a")));
    assert!(bag.add(FlowError::message("b")));
    let err = bag.terminate().expect("two errors were added");
    assert_eq!(err.causes().len(), 2);
    // Terminated bag drops later errors instead of surfacing them twice.
    assert!(!bag.add(FlowError::message("late")));
    assert!(bag.terminate().is_none());
  }

  struct Recording {
    nexts: AtomicUsize,
    errored: AtomicBool,
    completed: AtomicBool,
  }

  impl Recording {
    fn new() -> Self {
      Recording {
        nexts: AtomicUsize::new(0),
        errored: AtomicBool::new(false),
        completed: AtomicBool::new(false),
      }
    }
  }

  impl Subscriber<i32> for Recording {
    fn on_subscribe(&self, _: Upstream<i32>) {}

    fn on_next(&self, _: i32) {
      self.nexts.fetch_add(1, Ordering::Relaxed);
    }

    fn on_error(&self, _: FlowError) {
      assert!(!self.completed.load(Ordering::Relaxed));
      self.errored.store(true, Ordering::Relaxed);
    }

    fn on_complete(&self) {
      assert!(!self.errored.load(Ordering::Relaxed));
      self.completed.store(true, Ordering::Relaxed);
    }
  }

  #[test]
  fn half_serializer_basics() {
    let wip = WorkCounter::new();
    let bag = ErrorBag::new();
    let down = Recording::new();
    assert!(half_next(&wip, &bag, &down, 1));
    assert!(half_next(&wip, &bag, &down, 2));
    bag.add(FlowError::message("boom"));
    half_terminate(&wip, &bag, &down);
    assert_eq!(down.nexts.load(Ordering::Relaxed), 2);
    assert!(down.errored.load(Ordering::Relaxed));
    // The terminal already fired; another value is silently refused.
    assert!(!half_next(&wip, &bag, &down, 3));
  }

  #[test]
  fn half_complete_without_errors() {
    let wip = WorkCounter::new();
    let bag = ErrorBag::new();
    let down = Recording::new();
    half_terminate(&wip, &bag, &down);
    assert!(down.completed.load(Ordering::Relaxed));
  }
}

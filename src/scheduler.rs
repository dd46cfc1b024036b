//! The execution-boundary collaborator consumed by time-shifting operators.
//!
//! A [`Scheduler`] hands out [`Worker`]s; tasks submitted to one worker run
//! strictly in submission order and never concurrently with each other. The
//! engine itself creates no threads — all asynchrony comes from here (or
//! from the caller's own threads).

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

pub use std::time::{Duration, Instant};

mod immediate;
pub use immediate::ImmediateScheduler;

#[cfg(feature = "futures-scheduler")]
mod thread_pool;
#[cfg(feature = "futures-scheduler")]
pub use thread_pool::ThreadPoolScheduler;

/// A unit of work handed to a worker.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cancellation handle for a scheduled task. Cancelling before the task ran
/// suppresses it; cancelling afterwards is a no-op.
#[derive(Clone, Default)]
pub struct ScheduleHandle(Arc<AtomicBool>);

impl ScheduleHandle {
  pub fn new() -> Self { Self::default() }

  /// A handle born cancelled, returned when a worker refuses work after
  /// shutdown.
  pub(crate) fn cancelled() -> Self {
    let handle = Self::new();
    handle.cancel();
    handle
  }

  #[inline]
  pub fn cancel(&self) { self.0.store(true, Ordering::Release) }

  #[inline]
  pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::Acquire) }
}

/// Serial execution resource: FIFO, never concurrent with itself.
pub trait Worker: Send + Sync {
  fn schedule(&self, task: Task) -> ScheduleHandle;

  /// Runs `task` after `delay`, still serialized with the worker's other
  /// tasks.
  #[cfg(feature = "timer")]
  fn schedule_after(&self, delay: Duration, task: Task) -> ScheduleHandle;

  /// Stops accepting work and discards tasks not yet started.
  fn shutdown(&self);
}

/// Factory of [`Worker`]s. Any conforming implementation — thread-pool
/// backed, single-threaded, inline — may be substituted.
pub trait Scheduler: Send + Sync {
  fn create_worker(&self) -> Arc<dyn Worker>;
}

impl<S: Scheduler + ?Sized> Scheduler for Arc<S> {
  #[inline]
  fn create_worker(&self) -> Arc<dyn Worker> { (**self).create_worker() }
}

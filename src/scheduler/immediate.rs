//! Inline scheduler executing on the caller's thread.

use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;

use super::{ScheduleHandle, Scheduler, Task, Worker};
use crate::drain::WorkCounter;

/// Runs every task on the thread that scheduled it.
///
/// Re-entrant `schedule` calls are trampolined through the worker's queue
/// instead of recursing, so the FIFO/non-concurrent worker contract still
/// holds: a task scheduling another task returns first, then the new task
/// runs.
#[derive(Clone, Copy, Default)]
pub struct ImmediateScheduler;

impl ImmediateScheduler {
  pub fn new() -> Self { ImmediateScheduler }
}

impl Scheduler for ImmediateScheduler {
  fn create_worker(&self) -> Arc<dyn Worker> {
    Arc::new(ImmediateWorker::default())
  }
}

#[derive(Default)]
struct ImmediateWorker {
  queue: Mutex<VecDeque<(Task, ScheduleHandle)>>,
  wip: WorkCounter,
  shutdown: std::sync::atomic::AtomicBool,
}

impl ImmediateWorker {
  fn is_shut_down(&self) -> bool {
    self.shutdown.load(std::sync::atomic::Ordering::Acquire)
  }

  fn run_loop(&self) {
    let mut missed = 1;
    loop {
      loop {
        let entry = self.queue.lock().pop_front();
        match entry {
          Some((task, handle)) => {
            if !handle.is_cancelled() && !self.is_shut_down() {
              task();
            }
          }
          None => break,
        }
      }
      missed = self.wip.leave(missed);
      if missed == 0 {
        return;
      }
    }
  }
}

impl Worker for ImmediateWorker {
  fn schedule(&self, task: Task) -> ScheduleHandle {
    if self.is_shut_down() {
      return ScheduleHandle::cancelled();
    }
    let handle = ScheduleHandle::new();
    self.queue.lock().push_back((task, handle.clone()));
    if self.wip.enter() {
      self.run_loop();
    }
    handle
  }

  #[cfg(feature = "timer")]
  fn schedule_after(
    &self,
    delay: super::Duration,
    task: Task,
  ) -> ScheduleHandle {
    // Inline semantics: the caller's thread is the only execution resource
    // there is, so a delay parks it.
    std::thread::sleep(delay);
    self.schedule(task)
  }

  fn shutdown(&self) {
    self
      .shutdown
      .store(true, std::sync::atomic::Ordering::Release);
    self.queue.lock().clear();
  }
}

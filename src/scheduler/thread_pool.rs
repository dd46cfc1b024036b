//! Thread-pool scheduler backed by the `futures` executor.

use std::{
  collections::VecDeque,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
  },
};

use futures::{executor::ThreadPool, future};
use parking_lot::Mutex;

use super::{ScheduleHandle, Scheduler, Task, Worker};
use crate::drain::WorkCounter;

/// Scheduler whose workers share one `futures` thread pool.
///
/// Each worker keeps its own task queue and serializes it with the same
/// work-in-progress counter the operators drain with: the first task to
/// arrive spawns a pool job that drains the queue, later arrivals just
/// enqueue. That gives the strict FIFO/non-concurrent worker contract on top
/// of an unordered pool.
#[derive(Clone)]
pub struct ThreadPoolScheduler {
  pool: ThreadPool,
}

impl ThreadPoolScheduler {
  pub fn new() -> Self {
    ThreadPoolScheduler {
      pool: ThreadPool::new().expect("failed to build thread pool"),
    }
  }

  pub fn with_pool(pool: ThreadPool) -> Self { ThreadPoolScheduler { pool } }
}

impl Default for ThreadPoolScheduler {
  fn default() -> Self { Self::new() }
}

impl Scheduler for ThreadPoolScheduler {
  fn create_worker(&self) -> Arc<dyn Worker> {
    Arc::new_cyclic(|weak: &Weak<PoolWorker>| PoolWorker {
      self_ref: weak.clone(),
      pool: self.pool.clone(),
      queue: Mutex::new(VecDeque::new()),
      wip: WorkCounter::new(),
      shutdown: AtomicBool::new(false),
    })
  }
}

struct PoolWorker {
  self_ref: Weak<PoolWorker>,
  pool: ThreadPool,
  queue: Mutex<VecDeque<(Task, ScheduleHandle)>>,
  wip: WorkCounter,
  shutdown: AtomicBool,
}

impl PoolWorker {
  fn is_shut_down(&self) -> bool { self.shutdown.load(Ordering::Acquire) }

  fn enqueue(&self, task: Task, handle: &ScheduleHandle) {
    self.queue.lock().push_back((task, handle.clone()));
    if self.wip.enter() {
      if let Some(this) = self.self_ref.upgrade() {
        self
          .pool
          .spawn_ok(future::lazy(move |_| this.run_loop()));
      }
    }
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

impl Worker for PoolWorker {
  fn schedule(&self, task: Task) -> ScheduleHandle {
    if self.is_shut_down() {
      return ScheduleHandle::cancelled();
    }
    let handle = ScheduleHandle::new();
    self.enqueue(task, &handle);
    handle
  }

  #[cfg(feature = "timer")]
  fn schedule_after(
    &self,
    delay: super::Duration,
    task: Task,
  ) -> ScheduleHandle {
    if self.is_shut_down() {
      return ScheduleHandle::cancelled();
    }
    let handle = ScheduleHandle::new();
    let this = self.self_ref.clone();
    let task_handle = handle.clone();
    self.pool.spawn_ok(async move {
      futures_time::task::sleep(delay.into()).await;
      if task_handle.is_cancelled() {
        return;
      }
      if let Some(worker) = this.upgrade() {
        if !worker.is_shut_down() {
          worker.enqueue(task, &task_handle);
        }
      }
    });
    handle
  }

  fn shutdown(&self) {
    self.shutdown.store(true, Ordering::Release);
    self.queue.lock().clear();
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::time::{Duration, Instant};

  fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
      if cond() {
        return true;
      }
      std::thread::yield_now();
    }
    cond()
  }

  #[test]
  fn worker_runs_tasks_in_submission_order() {
    let scheduler = ThreadPoolScheduler::new();
    let worker = scheduler.create_worker();
    let log = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
      let l = log.clone();
      worker.schedule(Box::new(move || l.lock().push(i)));
    }
    assert!(wait_until(Duration::from_secs(5), || log.lock().len() == 100));
    assert_eq!(&*log.lock(), &(0..100).collect::<Vec<_>>());
  }

  #[test]
  fn workers_are_independent() {
    let scheduler = ThreadPoolScheduler::new();
    let a = scheduler.create_worker();
    let b = scheduler.create_worker();
    let hits = Arc::new(Mutex::new(0));
    for _ in 0..10 {
      let h = hits.clone();
      a.schedule(Box::new(move || *h.lock() += 1));
      let h = hits.clone();
      b.schedule(Box::new(move || *h.lock() += 1));
    }
    assert!(wait_until(Duration::from_secs(5), || *hits.lock() == 20));
  }

  #[test]
  fn cancelled_handle_suppresses_the_task() {
    let scheduler = ThreadPoolScheduler::new();
    let worker = scheduler.create_worker();
    let gate = Arc::new(Mutex::new(()));
    let ran = Arc::new(AtomicBool::new(false));
    // Hold the worker busy so the second task is still queued when we
    // cancel it.
    let guard = gate.lock();
    let g = gate.clone();
    worker.schedule(Box::new(move || {
      let _hold = g.lock();
    }));
    let r = ran.clone();
    let handle = worker.schedule(Box::new(move || {
      r.store(true, Ordering::Relaxed);
    }));
    handle.cancel();
    drop(guard);
    std::thread::sleep(Duration::from_millis(100));
    assert!(!ran.load(Ordering::Relaxed));
  }

  #[cfg(feature = "timer")]
  #[test]
  fn delayed_task_fires_after_the_delay() {
    let scheduler = ThreadPoolScheduler::new();
    let worker = scheduler.create_worker();
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    let start = Instant::now();
    worker.schedule_after(
      Duration::from_millis(50),
      Box::new(move || f.store(true, Ordering::Relaxed)),
    );
    assert!(!fired.load(Ordering::Relaxed));
    assert!(wait_until(Duration::from_secs(5), || fired
      .load(Ordering::Relaxed)));
    assert!(start.elapsed() >= Duration::from_millis(50));
  }

  #[test]
  fn shutdown_rejects_new_work() {
    let scheduler = ThreadPoolScheduler::new();
    let worker = scheduler.create_worker();
    worker.shutdown();
    let handle = worker.schedule(Box::new(|| panic!("must not run")));
    assert!(handle.is_cancelled());
  }
}

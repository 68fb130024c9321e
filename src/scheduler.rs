//! The scheduler: a fixed pool of workers, round-robin placement, and the
//! fence barrier a frame driver uses to know a batch has retired.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Builder;
use crate::error::{Error, Result};
use crate::task::{Task, TaskState};
use crate::worker::{Shared, Worker, WorkerSnapshot};
use crate::{Schedule, Wait};

/// Owns the worker pool.
///
/// A typical frame clears the fences, pushes the frame's tasks, and waits
/// for the fence before moving on:
///
/// ```
/// use framepool::{task, Scheduler, TaskState};
///
/// let sched = Scheduler::builder().worker_threads(2).build().unwrap();
///
/// sched.clear_fences();
/// let load = task("load script", || {}).start(&sched).unwrap();
/// let run = task("run script", || {}).after(&load).start(&sched).unwrap();
/// sched.wait_for_fence();
///
/// assert!(load.has_state(TaskState::Completed));
/// assert!(run.has_state(TaskState::Completed));
/// ```
pub struct Scheduler {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
    max_push_attempts: Option<usize>,
}

impl Scheduler {
    /// Start a scheduler with one worker per logical core.
    pub fn new() -> Result<Scheduler> {
        Builder::new().build()
    }

    /// A builder for a custom configuration.
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn start(builder: &Builder) -> Result<Scheduler> {
        let count = builder.worker_threads.unwrap_or_else(num_cpus::get);
        if count == 0 {
            return Err(Error::NoWorkers);
        }
        debug!("starting {} workers", count);

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let shared = Shared::new(id, builder.worker_config());
            match Worker::spawn(shared, (builder.thread_name)(id), builder.thread_stack_size) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    error!("could not start worker {}: {}", id, err);
                    for worker in &workers {
                        worker.stop();
                    }
                    for worker in &mut workers {
                        worker.join();
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Scheduler {
            workers,
            cursor: AtomicUsize::new(0),
            max_push_attempts: builder.max_push_attempts,
        })
    }

    /// Hand `task` to a worker, returning the worker's index.
    ///
    /// Workers are tried in round-robin order and the cursor advances on
    /// every attempt, so a busy worker is skipped rather than waited on. The
    /// caller yields between failed attempts. Unless `max_push_attempts` was
    /// configured this only returns once the task is placed.
    pub fn push_task(&self, task: &Task) -> Result<usize> {
        if !task.claim() {
            return Err(Error::AlreadyQueued {
                task: task.id(),
                worker: task.thread_affinity(),
            });
        }
        let state = task.state();
        if state != TaskState::Clear {
            task.evict();
            return Err(Error::NotClear {
                task: task.id(),
                state,
            });
        }

        let mut attempts = 0;
        loop {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            attempts += 1;
            if self.workers[index].shared().try_push(task) {
                return Ok(index);
            }
            trace!("worker {} busy, {} moves on", index, task);

            if let Some(max) = self.max_push_attempts {
                if attempts >= max {
                    task.evict();
                    warn!("gave up placing {} after {} attempts", task, attempts);
                    return Err(Error::PlacementStarved {
                        task: task.id(),
                        attempts,
                    });
                }
            }
            thread::yield_now();
        }
    }

    /// Lower every worker's fence, starting a new synchronization phase.
    pub fn clear_fences(&self) {
        for worker in &self.workers {
            let shared = worker.shared();
            if !shared.clear_fence() {
                debug!(
                    "worker {} fence was already down with {} task(s) queued",
                    shared.id(),
                    shared.len()
                );
            }
        }
        trace!("fences cleared");
    }

    /// True when every worker has raised its fence and has nothing queued.
    pub fn is_fenced(&self) -> bool {
        self.workers.iter().all(|worker| worker.shared().is_fenced())
    }

    /// Block until every worker is fenced.
    ///
    /// Never returns if a task stays blocked, for example on a dependency
    /// cycle. Use [`Scheduler::wait_for_fence_timeout`] to bound the wait.
    pub fn wait_for_fence(&self) {
        let mut tries: u64 = 0;
        while !self.is_fenced() {
            tries += 1;
            thread::yield_now();
        }
        trace!("all fences hit after {} polls", tries);
    }

    /// Like [`Scheduler::wait_for_fence`] but gives up after `timeout`.
    /// Returns whether the fence was reached.
    pub fn wait_for_fence_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_fenced() {
                return true;
            }
            if Instant::now() >= deadline {
                debug!("fence not reached within {:?}", timeout);
                return false;
            }
            thread::yield_now();
        }
    }

    /// Number of workers, fixed at construction.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Tasks still resident in any worker queue.
    pub fn pending_tasks(&self) -> usize {
        self.workers.iter().map(|worker| worker.shared().len()).sum()
    }

    /// Per-worker view of fences and queued tasks.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .iter()
            .map(|worker| worker.shared().snapshot())
            .collect()
    }

    /// Stop the workers and join their threads, using the selected wait mode.
    pub fn shutdown(mut self, wait: Wait) -> Result<()> {
        self.stop(wait)
    }

    fn stop(&mut self, wait: Wait) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }
        debug!("shutting down {} workers, {:?}", self.workers.len(), wait);

        if wait == Wait::Pending {
            self.clear_fences();
            self.wait_for_fence();
        }

        for worker in &self.workers {
            worker.stop();
        }
        let panicked = self
            .workers
            .iter_mut()
            .map(Worker::join)
            .filter(|joined| !joined)
            .count();

        for worker in self.workers.drain(..) {
            let left = worker.shared().drain(wait == Wait::Active);
            if left > 0 {
                debug!("worker {} dropped {} task(s)", worker.shared().id(), left);
            }
        }

        if panicked > 0 {
            Err(Error::WorkerPanicked(panicked))
        } else {
            Ok(())
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop(Wait::None) {
            error!("scheduler shutdown: {}", err);
        }
    }
}

impl Schedule for Scheduler {
    fn push_task(&self, task: &Task) -> Result<usize> {
        Scheduler::push_task(self, task)
    }
}

#![deny(missing_docs)]

//! A per-frame task scheduler with dependency tracking.
//!
//! Subsystems build [`Task`]s, optionally wire them with
//! [`Task::depends_on`], and push them onto a [`Scheduler`]. The scheduler
//! owns one worker thread per core; each worker drains a private queue,
//! executing ready tasks inline and deferring blocked ones. The frame driver
//! brackets a batch with [`Scheduler::clear_fences`] and
//! [`Scheduler::wait_for_fence`] to know the whole batch has retired.

#[macro_use]
extern crate log;
extern crate num_cpus;
extern crate parking_lot;

mod config;
mod error;
mod scheduler;
mod task;
#[cfg(test)]
mod testing;
mod work;
mod worker;

pub use config::{Builder, Idle};
pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use task::{task, Task, TaskBuilder, TaskId, TaskState, TaskSummary};
pub use work::{Progress, Resume, Work, WorkError};
pub use worker::WorkerSnapshot;

/// Wait mode for the scheduler shutdown.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum Wait {
    /// Stop after the current pass and abandon queued tasks as they are.
    None,
    /// Stop after the current pass and expire every unfinished queued task,
    /// releasing its dependents.
    Active,
    /// Wait for every queue to drain, then stop.
    Pending,
}

/// Abstract representation of the scheduler, allowing tasks to be enqueued
/// without knowing the pool behind it.
pub trait Schedule {
    /// Hand `task` to a worker. Returns the index of the accepting worker.
    fn push_task(&self, task: &Task) -> Result<usize>;
}

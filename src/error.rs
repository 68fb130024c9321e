use std::io;

use crate::task::{TaskId, TaskState};

/// Errors returned by the scheduler and by task wiring.
///
/// Failures inside a task's own work are not reported here; they move the
/// task to [`TaskState::Failed`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A task was asked to depend on itself.
    #[error("task {0} cannot depend on itself")]
    SelfDependency(TaskId),

    /// The task has to be reset with `clear_state` before it can be wired or
    /// queued again.
    #[error("task {task} is {state}, call clear_state before reusing it")]
    NotClear {
        /// The offending task.
        task: TaskId,
        /// The state it was found in.
        state: TaskState,
    },

    /// The task is already resident in a worker queue.
    #[error("task {task} is already queued on worker {worker:?}")]
    AlreadyQueued {
        /// The offending task.
        task: TaskId,
        /// The worker owning it, when known.
        worker: Option<usize>,
    },

    /// The task is still owned by a worker and cannot be reset.
    #[error("task {0} is still owned by a worker")]
    InFlight(TaskId),

    /// Adding the edge would close a dependency cycle.
    #[error("task {task} depending on {other} would create a cycle")]
    Cycle {
        /// The task that would wait.
        task: TaskId,
        /// The task it would wait for.
        other: TaskId,
    },

    /// No worker accepted the task within the configured attempt bound.
    #[error("task {task} could not be placed after {attempts} attempts")]
    PlacementStarved {
        /// The task that was not placed.
        task: TaskId,
        /// How many workers were tried.
        attempts: usize,
    },

    /// The scheduler was configured without workers.
    #[error("a scheduler needs at least one worker thread")]
    NoWorkers,

    /// The operating system refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// Worker threads panicked outside of task containment.
    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

/// Result alias used throughout the crate.
pub type Result<T> = ::std::result::Result<T, Error>;

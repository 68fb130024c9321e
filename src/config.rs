use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::scheduler::Scheduler;
use crate::worker::WorkerConfig;

pub(crate) type ThreadNameFn = Arc<dyn Fn(usize) -> String + Send + Sync + 'static>;

fn default_thread_name_fn() -> ThreadNameFn {
    Arc::new(|id| format!("framepool-worker-{}", id))
}

/// How a worker waits after a pass that made no progress.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Idle {
    /// Yield the OS thread after every idle pass.
    #[default]
    Yield,
    /// Yield for a while, then sleep with a growing delay.
    Backoff {
        /// Longest sleep between two idle passes.
        max: Duration,
    },
}

/// Configures and starts a [`Scheduler`].
pub struct Builder {
    /// Defaults to one worker per logical core.
    pub(crate) worker_threads: Option<usize>,

    pub(crate) thread_name: ThreadNameFn,

    pub(crate) thread_stack_size: Option<usize>,

    pub(crate) idle: Idle,

    pub(crate) starvation_threshold: Option<u32>,

    /// Unbounded when `None`.
    pub(crate) max_push_attempts: Option<usize>,

    pub(crate) gated: bool,
}

impl Builder {
    /// A builder with the default configuration.
    pub fn new() -> Builder {
        Builder {
            worker_threads: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            idle: Idle::default(),
            starvation_threshold: None,
            max_push_attempts: None,
            gated: false,
        }
    }

    /// Sets the number of workers. The pool is never resized afterwards.
    pub fn worker_threads(&mut self, val: usize) -> &mut Self {
        self.worker_threads = Some(val);
        self
    }

    /// Sets the name prefix of worker threads; the worker index is appended.
    ///
    /// The default name is "framepool-worker-{N}".
    pub fn thread_name(&mut self, val: impl Into<String>) -> &mut Self {
        let val = val.into();
        self.thread_name = Arc::new(move |id| format!("{}-{}", val, id));
        self
    }

    /// Sets a function naming each worker thread from its index.
    pub fn thread_name_fn<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(usize) -> String + Send + Sync + 'static,
    {
        self.thread_name = Arc::new(f);
        self
    }

    /// Sets the stack size (in bytes) for worker threads.
    pub fn thread_stack_size(&mut self, val: usize) -> &mut Self {
        self.thread_stack_size = Some(val);
        self
    }

    /// Sets what a worker does after a pass that made no progress.
    pub fn idle(&mut self, val: Idle) -> &mut Self {
        self.idle = val;
        self
    }

    /// Warn once when a task has been deferred `val` times.
    pub fn starvation_threshold(&mut self, val: u32) -> &mut Self {
        self.starvation_threshold = Some(val);
        self
    }

    /// Give up placing a task after `val` round-robin attempts.
    ///
    /// # Panics
    ///
    /// This function will panic if 0 is passed as an argument.
    pub fn max_push_attempts(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "max_push_attempts must be greater than 0");
        self.max_push_attempts = Some(val);
        self
    }

    /// In gated mode a worker with a raised fence leaves its queue alone
    /// until `clear_fences` is called, so a whole frame can be submitted
    /// before any of it runs.
    pub fn gated(&mut self, val: bool) -> &mut Self {
        self.gated = val;
        self
    }

    /// Start the workers.
    pub fn build(&mut self) -> Result<Scheduler> {
        Scheduler::start(self)
    }

    pub(crate) fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            idle: self.idle,
            starvation_threshold: self.starvation_threshold,
            gated: self.gated,
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

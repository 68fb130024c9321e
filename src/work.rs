use std::error::Error;

/// Error type a piece of work may fail with.
pub type WorkError = Box<dyn Error + Send + Sync>;

/// What a task reports after one call to [`Work::execute`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The work is done, dependents may run.
    Completed,
    /// The work wants another pass. The task stays active and is executed
    /// again on its worker's next scan.
    Yield,
}

/// The work a task performs on its worker thread.
///
/// `execute` runs inline on the worker, so it must not block: every other
/// task on the same worker waits behind it.
pub trait Work: Send {
    /// Run the work. Returning an error, or panicking, fails the task.
    fn execute(&mut self) -> Result<Progress, WorkError>;

    /// Report that the work outlived its usefulness. Checked by the owning
    /// worker before every execution.
    fn has_expired(&self) -> bool {
        false
    }
}

impl<F> Work for F
where
    F: FnMut() + Send,
{
    fn execute(&mut self) -> Result<Progress, WorkError> {
        (self)();
        Ok(Progress::Completed)
    }
}

/// Adapts a step-wise closure into [`Work`].
///
/// ```
/// use framepool::{Progress, Resume, TaskBuilder, WorkError};
///
/// let mut left = 3;
/// let countdown = TaskBuilder::new("countdown", Resume(move || -> Result<Progress, WorkError> {
///     left -= 1;
///     Ok(if left == 0 { Progress::Completed } else { Progress::Yield })
/// }))
/// .build();
/// # drop(countdown);
/// ```
pub struct Resume<F>(pub F);

impl<F> Work for Resume<F>
where
    F: FnMut() -> Result<Progress, WorkError> + Send,
{
    fn execute(&mut self) -> Result<Progress, WorkError> {
        (self.0)()
    }
}

//! Tasks: units of work with a small state machine and dependency edges.
//!
//! Edges are kept in both directions. A task lists what it waits for, and
//! every task it waits for lists it as a dependent, so that a finished task
//! can release everything queued behind it. Both lists hold weak handles;
//! the worker queues are what keep a submitted task alive.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::work::{Progress, Work};
use crate::Schedule;

const NO_WORKER: usize = usize::MAX;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> TaskId {
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a task is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Fresh or reset, not owned by any worker.
    Clear,
    /// Handed to a worker, not examined yet.
    Queued,
    /// Examined and found blocked on a dependency.
    Waiting,
    /// Being executed, or asked to be executed again.
    Active,
    /// Finished successfully.
    Completed,
    /// Forced out before finishing, either on request or because it
    /// outlived its lifetime.
    Expired,
    /// The work returned an error or panicked.
    Failed,
}

impl TaskState {
    /// True for the states that end a submission.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Expired | TaskState::Failed
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            TaskState::Clear => "Clear",
            TaskState::Queued => "Queued",
            TaskState::Waiting => "Waiting",
            TaskState::Active => "Active",
            TaskState::Completed => "Completed",
            TaskState::Expired => "Expired",
            TaskState::Failed => "Failed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Edge {
    id: TaskId,
    task: Weak<Inner>,
}

#[derive(Default)]
struct Dependents {
    tasks: Vec<Weak<Inner>>,
    /// Set once the dependents were notified. Late edges are not recorded.
    released: bool,
}

struct Inner {
    id: TaskId,
    name: String,
    lifetime: Option<Duration>,
    state: Mutex<TaskState>,
    affinity: AtomicUsize,
    deferrals: AtomicU32,
    /// True while the task sits in a worker queue.
    resident: AtomicBool,
    expire_requested: AtomicBool,
    queued_at: Mutex<Option<Instant>>,
    failure: Mutex<Option<String>>,
    waiting_for: Mutex<Vec<Edge>>,
    waiting_for_me: Mutex<Dependents>,
    work: Mutex<Box<dyn Work>>,
}

/// Handle to a unit of submitted work.
///
/// Cloning is cheap and yields another handle to the same task; equality is
/// identity.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    fn new(name: String, work: Box<dyn Work>, lifetime: Option<Duration>) -> Task {
        Task {
            inner: Arc::new(Inner {
                id: TaskId::next(),
                name,
                lifetime,
                state: Mutex::new(TaskState::Clear),
                affinity: AtomicUsize::new(NO_WORKER),
                deferrals: AtomicU32::new(0),
                resident: AtomicBool::new(false),
                expire_requested: AtomicBool::new(false),
                queued_at: Mutex::new(None),
                failure: Mutex::new(None),
                waiting_for: Mutex::new(Vec::new()),
                waiting_for_me: Mutex::new(Dependents::default()),
                work: Mutex::new(work),
            }),
        }
    }

    /// The task's identifier.
    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    /// The name given at construction.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    pub fn state(&self) -> TaskState {
        *self.inner.state.lock()
    }

    /// Shorthand for `self.state() == state`.
    pub fn has_state(&self, state: TaskState) -> bool {
        self.state() == state
    }

    /// The worker that owns this task, if it was ever queued since the last
    /// reset.
    pub fn thread_affinity(&self) -> Option<usize> {
        match self.inner.affinity.load(Ordering::Acquire) {
            NO_WORKER => None,
            worker => Some(worker),
        }
    }

    /// How many scans found this task blocked or asking for another pass.
    pub fn deferral_count(&self) -> u32 {
        self.inner.deferrals.load(Ordering::Acquire)
    }

    /// The error message recorded when the task failed.
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// How long the task may stay unfinished once queued.
    pub fn lifetime(&self) -> Option<Duration> {
        self.inner.lifetime
    }

    /// Make this task wait for `other` to finish or expire.
    ///
    /// Must be called while this task is `Clear`. Cycles are not detected;
    /// tasks on a cycle wait forever. See [`Task::depends_on_checked`].
    pub fn depends_on(&self, other: &Task) -> Result<()> {
        if self == other {
            return Err(Error::SelfDependency(self.id()));
        }
        let state = self.state();
        if state != TaskState::Clear {
            return Err(Error::NotClear {
                task: self.id(),
                state,
            });
        }
        self.link(other);
        Ok(())
    }

    /// Like [`Task::depends_on`], but refuses edges that would close a cycle.
    pub fn depends_on_checked(&self, other: &Task) -> Result<()> {
        if self == other {
            return Err(Error::SelfDependency(self.id()));
        }
        if other.reaches(self) {
            return Err(Error::Cycle {
                task: self.id(),
                other: other.id(),
            });
        }
        self.depends_on(other)
    }

    /// Drop `other` from the tasks this one waits for. Called by `other`
    /// when it finishes.
    pub fn clear_dependency(&self, other: &Task) {
        let mut waiting_for = self.inner.waiting_for.lock();
        match waiting_for.iter().position(|edge| edge.id == other.id()) {
            Some(index) => {
                waiting_for.remove(index);
                trace!("{} no longer waits for {}", self, other);
            }
            None => error!(
                "{} was not waiting for {}, dependency edges are out of sync",
                self, other
            ),
        }
    }

    /// Release every task waiting for this one.
    pub fn notify_dependents(&self) {
        let dependents = {
            let mut dependents = self.inner.waiting_for_me.lock();
            dependents.released = true;
            mem::take(&mut dependents.tasks)
        };
        for inner in dependents.iter().filter_map(Weak::upgrade) {
            let dependent = Task { inner };
            trace!("{} releases {}", self, dependent);
            dependent.clear_dependency(self);
        }
    }

    /// True while any dependency is outstanding.
    ///
    /// Edges to tasks that no longer exist are dropped here: a task that was
    /// discarded without being queued can never release anyone.
    pub fn is_waiting_for_dependencies(&self) -> bool {
        let mut waiting_for = self.inner.waiting_for.lock();
        waiting_for.retain(|edge| {
            let live = edge.task.strong_count() > 0;
            if !live {
                debug!("{} drops its edge to vanished task {}", self, edge.id);
            }
            live
        });
        !waiting_for.is_empty()
    }

    /// The tasks this one still waits for.
    pub fn dependencies(&self) -> Vec<TaskId> {
        self.inner
            .waiting_for
            .lock()
            .iter()
            .map(|edge| edge.id)
            .collect()
    }

    /// The tasks still waiting for this one.
    pub fn dependents(&self) -> Vec<TaskId> {
        self.inner
            .waiting_for_me
            .lock()
            .tasks
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| inner.id)
            .collect()
    }

    /// Reset the task so it can be wired and queued again.
    ///
    /// Fails while a worker still holds the task. Dependents that are still
    /// waiting are released rather than left stranded.
    pub fn clear_state(&self) -> Result<()> {
        if self.is_resident() {
            return Err(Error::InFlight(self.id()));
        }
        self.abandon_dependencies();
        if !self.inner.waiting_for_me.lock().tasks.is_empty() {
            debug!("{} reset while others still wait for it", self);
            self.notify_dependents();
        }
        self.inner.waiting_for_me.lock().released = false;

        self.inner.affinity.store(NO_WORKER, Ordering::Release);
        self.inner.deferrals.store(0, Ordering::Release);
        self.inner.expire_requested.store(false, Ordering::Release);
        *self.inner.queued_at.lock() = None;
        *self.inner.failure.lock() = None;
        self.set_state(TaskState::Clear);
        Ok(())
    }

    /// Ask the owning worker to expire this task on its next scan.
    pub fn expire(&self) {
        debug!("{} asked to expire", self);
        self.inner.expire_requested.store(true, Ordering::Release);
    }

    fn reaches(&self, target: &Task) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(task) = stack.pop() {
            if task == *target {
                return true;
            }
            if seen.insert(task.id()) {
                stack.extend(task.upstream());
            }
        }
        false
    }

    fn upstream(&self) -> Vec<Task> {
        self.inner
            .waiting_for
            .lock()
            .iter()
            .filter_map(|edge| edge.task.upgrade())
            .map(|inner| Task { inner })
            .collect()
    }

    // Only one edge lock is held at a time. The edge is recorded on our side
    // first so a concurrent notification from `other` always finds it.
    fn link(&self, other: &Task) {
        {
            let mut waiting_for = self.inner.waiting_for.lock();
            if waiting_for.iter().any(|edge| edge.id == other.id()) {
                return;
            }
            waiting_for.push(Edge {
                id: other.id(),
                task: Arc::downgrade(&other.inner),
            });
        }

        let released = {
            let mut dependents = other.inner.waiting_for_me.lock();
            if !dependents.released {
                dependents.tasks.push(Arc::downgrade(&self.inner));
            }
            dependents.released
        };

        if released {
            self.inner
                .waiting_for
                .lock()
                .retain(|edge| edge.id != other.id());
            trace!("{} already released its dependents, {} need not wait", other, self);
        } else {
            trace!("{} depends on {}", self, other);
        }
    }

    fn abandon_dependencies(&self) {
        let edges = mem::take(&mut *self.inner.waiting_for.lock());
        for dependency in edges.iter().filter_map(|edge| edge.task.upgrade()) {
            dependency
                .waiting_for_me
                .lock()
                .tasks
                .retain(|weak| !ptr::eq(weak.as_ptr(), Arc::as_ptr(&self.inner)));
        }
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.inner.state.lock() = state;
    }

    pub(crate) fn is_resident(&self) -> bool {
        self.inner.resident.load(Ordering::Acquire)
    }

    /// Mark the task as resident. Fails if it already is.
    pub(crate) fn claim(&self) -> bool {
        self.inner
            .resident
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn evict(&self) {
        self.inner.resident.store(false, Ordering::Release);
    }

    pub(crate) fn enqueue(&self, worker: usize) {
        self.inner.affinity.store(worker, Ordering::Release);
        *self.inner.queued_at.lock() = Some(Instant::now());
        self.set_state(TaskState::Queued);
    }

    /// Whether the task should be expired. `Err` carries the message of a
    /// panic raised by the work's own expiry check.
    pub(crate) fn has_expired(&self) -> ::std::result::Result<bool, String> {
        if self.inner.expire_requested.load(Ordering::Acquire) {
            return Ok(true);
        }
        if let (Some(lifetime), Some(queued_at)) =
            (self.inner.lifetime, *self.inner.queued_at.lock())
        {
            if queued_at.elapsed() >= lifetime {
                return Ok(true);
            }
        }
        let work = self.inner.work.lock();
        panic::catch_unwind(AssertUnwindSafe(|| work.has_expired()))
            .map_err(|payload| panic_message(payload.as_ref()))
    }

    /// Count a pass on which the task did not finish. Returns the new count.
    pub(crate) fn defer(&self, state: TaskState) -> u32 {
        self.set_state(state);
        self.inner.deferrals.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Run the work once, containing errors and panics.
    pub(crate) fn execute(&self) -> ::std::result::Result<Progress, String> {
        self.set_state(TaskState::Active);
        let mut work = self.inner.work.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| work.execute())) {
            Ok(Ok(progress)) => Ok(progress),
            Ok(Err(err)) => Err(err.to_string()),
            Err(payload) => Err(panic_message(payload.as_ref())),
        }
    }

    // Dependents are released before the terminal state is published, so an
    // observer that sees the terminal state also sees them unblocked.

    pub(crate) fn complete(&self) {
        self.notify_dependents();
        self.set_state(TaskState::Completed);
    }

    pub(crate) fn fail(&self, reason: String) {
        *self.inner.failure.lock() = Some(reason);
        self.abandon_dependencies();
        self.notify_dependents();
        self.set_state(TaskState::Failed);
    }

    pub(crate) fn force_expire(&self) {
        self.abandon_dependencies();
        self.notify_dependents();
        self.set_state(TaskState::Expired);
    }

    pub(crate) fn summary(&self) -> TaskSummary {
        TaskSummary {
            id: self.id(),
            name: self.inner.name.clone(),
            state: self.state(),
            deferrals: self.deferral_count(),
            waiting_for: self.dependencies(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_owned()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({})", self.inner.name, self.inner.id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("worker", &self.thread_affinity())
            .field("deferrals", &self.deferral_count())
            .finish()
    }
}

/// Point-in-time view of a queued task, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskSummary {
    /// Task identifier.
    pub id: TaskId,
    /// Task name.
    pub name: String,
    /// State at the time of the snapshot.
    pub state: TaskState,
    /// Deferral count at the time of the snapshot.
    pub deferrals: u32,
    /// Outstanding dependencies.
    pub waiting_for: Vec<TaskId>,
}

impl fmt::Display for TaskSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}({}) {} deferred {} times",
            self.name, self.id, self.state, self.deferrals
        )?;
        for id in &self.waiting_for {
            write!(f, "\n\t--> {}", id)?;
        }
        Ok(())
    }
}

/// A structure to help build a task.
pub struct TaskBuilder {
    name: String,
    work: Box<dyn Work>,
    after: Vec<Task>,
    lifetime: Option<Duration>,
}

impl TaskBuilder {
    /// Create a builder around `work`.
    pub fn new<W>(name: impl Into<String>, work: W) -> TaskBuilder
    where
        W: Work + 'static,
    {
        TaskBuilder {
            name: name.into(),
            work: Box::new(work),
            after: Vec::new(),
            lifetime: None,
        }
    }

    /// Run the task only after `task` finished or expired.
    pub fn after(mut self, task: &Task) -> TaskBuilder {
        self.after.push(task.clone());
        self
    }

    /// Expire the task if it is still unfinished `lifetime` after being
    /// queued.
    pub fn lifetime(mut self, lifetime: Duration) -> TaskBuilder {
        self.lifetime = Some(lifetime);
        self
    }

    /// Create the task and wire its dependencies.
    pub fn build(self) -> Task {
        let TaskBuilder {
            name,
            work,
            after,
            lifetime,
        } = self;

        let task = Task::new(name, work, lifetime);
        for dependency in &after {
            task.link(dependency);
        }
        task
    }

    /// Create the task and push it onto `sched`.
    pub fn start<S>(self, sched: &S) -> Result<Task>
    where
        S: Schedule + ?Sized,
    {
        let task = self.build();
        sched.push_task(&task)?;
        Ok(task)
    }
}

/// Helper to build a task from a closure.
pub fn task<F>(name: impl Into<String>, f: F) -> TaskBuilder
where
    F: FnMut() + Send + 'static,
{
    TaskBuilder::new(name, f)
}

//! Worker threads. Each worker owns a private queue and scans it in a loop:
//! retire finished tasks, expire stale ones, defer blocked ones and execute
//! the rest inline. The queue lock is only held to copy the queue and to
//! erase retired tasks, never while a task runs or its edges are touched.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::Idle;
use crate::task::{Task, TaskState, TaskSummary};
use crate::work::Progress;

/// Idle passes spent yielding before `Idle::Backoff` starts sleeping.
const SPIN_PASSES: u32 = 256;

const BACKOFF_STEP: Duration = Duration::from_micros(5);

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WorkerConfig {
    pub(crate) idle: Idle,
    pub(crate) starvation_threshold: Option<u32>,
    pub(crate) gated: bool,
}

/// Point-in-time view of one worker, for diagnostics.
#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    /// Worker index.
    pub worker: usize,
    /// Whether the fence flag was raised.
    pub fence: bool,
    /// Queued tasks in queue order.
    pub tasks: Vec<TaskSummary>,
}

enum Step {
    Retire,
    Ran,
    Deferred,
}

pub(crate) struct Shared {
    id: usize,
    queue: Mutex<Vec<Task>>,
    /// Queue length, readable without the lock.
    queued: AtomicUsize,
    running: AtomicBool,
    fence: AtomicBool,
    cfg: WorkerConfig,
}

impl Shared {
    pub(crate) fn new(id: usize, cfg: WorkerConfig) -> Shared {
        Shared {
            id,
            queue: Mutex::new(Vec::new()),
            queued: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            fence: AtomicBool::new(true),
            cfg,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Append `task` unless someone else holds the queue. Never blocks.
    pub(crate) fn try_push(&self, task: &Task) -> bool {
        let mut queue = match self.queue.try_lock() {
            Some(queue) => queue,
            None => return false,
        };
        task.enqueue(self.id);
        queue.push(task.clone());
        self.queued.store(queue.len(), Ordering::Release);
        trace!("worker {} accepted {}", self.id, task);
        true
    }

    /// Lower the fence. Returns whether it was raised.
    pub(crate) fn clear_fence(&self) -> bool {
        self.fence.swap(false, Ordering::AcqRel)
    }

    /// Fence raised and nothing left in the queue.
    pub(crate) fn is_fenced(&self) -> bool {
        self.fence.load(Ordering::Acquire) && self.queued.load(Ordering::Acquire) == 0
    }

    fn raise_fence(&self) {
        if !self.fence.swap(true, Ordering::AcqRel) {
            trace!("worker {} drained its queue, fence raised", self.id);
        }
    }

    /// One pass over the queue. Returns whether any task ran or retired.
    pub(crate) fn scan(&self, pass: &mut Vec<Task>, retired: &mut Vec<Task>) -> bool {
        if self.cfg.gated && self.fence.load(Ordering::Acquire) {
            return false;
        }
        if self.queued.load(Ordering::Acquire) == 0 {
            self.raise_fence();
            return false;
        }

        pass.extend(self.queue.lock().iter().cloned());

        let mut progressed = false;
        for task in pass.drain(..) {
            match self.step(&task) {
                Step::Retire => {
                    retired.push(task);
                    progressed = true;
                }
                Step::Ran => progressed = true,
                Step::Deferred => {}
            }
        }

        if retired.is_empty() {
            return progressed;
        }

        let mut queue = self.queue.lock();
        queue.retain(|task| !retired.contains(task));
        for task in retired.drain(..) {
            trace!("worker {} retired {} as {}", self.id, task, task.state());
            task.evict();
        }
        self.queued.store(queue.len(), Ordering::Release);
        if queue.is_empty() {
            self.raise_fence();
        }
        true
    }

    fn step(&self, task: &Task) -> Step {
        let state = task.state();
        if state.is_terminal() {
            task.notify_dependents();
            return Step::Retire;
        }

        match task.has_expired() {
            Ok(false) => {}
            Ok(true) => {
                warn!("worker {}: {} expired while {}", self.id, task, state);
                task.force_expire();
                return Step::Retire;
            }
            Err(reason) => {
                warn!("worker {}: {} failed its expiry check: {}", self.id, task, reason);
                task.fail(reason);
                return Step::Retire;
            }
        }

        if task.is_waiting_for_dependencies() {
            let deferrals = task.defer(TaskState::Waiting);
            trace!("worker {}: {} is waiting", self.id, task);
            self.check_starvation(task, deferrals);
            return Step::Deferred;
        }

        trace!("worker {} executing {}", self.id, task);
        match task.execute() {
            Ok(Progress::Completed) => {
                task.complete();
                Step::Retire
            }
            Ok(Progress::Yield) => {
                let deferrals = task.defer(TaskState::Active);
                self.check_starvation(task, deferrals);
                Step::Ran
            }
            Err(reason) => {
                warn!("worker {}: {} failed: {}", self.id, task, reason);
                task.fail(reason);
                Step::Retire
            }
        }
    }

    fn check_starvation(&self, task: &Task, deferrals: u32) {
        if Some(deferrals) == self.cfg.starvation_threshold {
            warn!(
                "worker {}: {} deferred {} times, still waiting for {:?}",
                self.id,
                task,
                deferrals,
                task.dependencies()
            );
        }
    }

    /// Empty the queue after the loop stopped. With `cancel`, unfinished
    /// tasks are expired so their dependents are released; otherwise they are
    /// left in whatever state they were in.
    pub(crate) fn drain(&self, cancel: bool) -> usize {
        let tasks = mem::take(&mut *self.queue.lock());
        self.queued.store(0, Ordering::Release);
        for task in &tasks {
            if cancel && !task.state().is_terminal() {
                debug!("worker {} cancels {}", self.id, task);
                task.force_expire();
            }
            task.evict();
        }
        self.raise_fence();
        tasks.len()
    }

    pub(crate) fn snapshot(&self) -> WorkerSnapshot {
        let tasks = self.queue.lock().clone();
        WorkerSnapshot {
            worker: self.id,
            fence: self.fence.load(Ordering::Acquire),
            tasks: tasks.iter().map(Task::summary).collect(),
        }
    }

    #[cfg(test)]
    pub(crate) fn lock_queue(&self) -> parking_lot::MutexGuard<Vec<Task>> {
        self.queue.lock()
    }
}

/// A worker thread and the state it shares with the scheduler.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(
        shared: Shared,
        name: String,
        stack_size: Option<usize>,
    ) -> io::Result<Worker> {
        let shared = Arc::new(shared);
        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = stack_size {
            builder = builder.stack_size(stack_size);
        }

        let back = shared.clone();
        let thread = builder.spawn(move || work(&back))?;

        Ok(Worker {
            shared,
            thread: Some(thread),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_thread(shared: Shared, thread: thread::JoinHandle<()>) -> Worker {
        Worker {
            shared: Arc::new(shared),
            thread: Some(thread),
        }
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    /// The loop exits after its current pass.
    pub(crate) fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    /// Wait for the thread to exit. Returns false if it panicked.
    pub(crate) fn join(&mut self) -> bool {
        match self.thread.take().map(thread::JoinHandle::join) {
            Some(Err(_)) => {
                warn!("worker {} panicked", self.shared.id);
                false
            }
            _ => true,
        }
    }
}

#[inline(never)]
fn work(shared: &Shared) {
    debug!("worker {} started", shared.id);

    let mut pass = Vec::new();
    let mut retired = Vec::new();
    let mut idle = Backoff::new(shared.cfg.idle);

    while shared.running.load(Ordering::Acquire) {
        if shared.scan(&mut pass, &mut retired) {
            idle.reset();
        } else {
            idle.pause();
        }
    }

    debug!("worker {} stopped with {} task(s) queued", shared.id, shared.len());
}

struct Backoff {
    idle: Idle,
    passes: u32,
    delay: Duration,
}

impl Backoff {
    fn new(idle: Idle) -> Backoff {
        Backoff {
            idle,
            passes: 0,
            delay: Duration::ZERO,
        }
    }

    fn reset(&mut self) {
        self.passes = 0;
        self.delay = Duration::ZERO;
    }

    fn pause(&mut self) {
        match self.idle {
            Idle::Yield => thread::yield_now(),
            Idle::Backoff { max } => {
                self.passes = self.passes.saturating_add(1);
                if self.passes <= SPIN_PASSES {
                    thread::yield_now();
                } else {
                    self.delay = (self.delay + BACKOFF_STEP).min(max);
                    thread::sleep(self.delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::task;
    use crate::testing::{capture_logs, captured};
    use crate::work::{Resume, Work, WorkError};
    use crate::TaskBuilder;
    use std::sync::atomic::AtomicU32;

    fn worker(id: usize) -> Shared {
        Shared::new(id, WorkerConfig::default())
    }

    fn run(worker: &Shared) -> bool {
        worker.scan(&mut Vec::new(), &mut Vec::new())
    }

    #[test]
    fn push_stamps_owner_and_state() {
        let w = worker(5);
        let t = task("t", || {}).build();
        assert!(w.try_push(&t));

        assert_eq!(t.thread_affinity(), Some(5));
        assert!(t.has_state(TaskState::Queued));
        assert_eq!(w.len(), 1);
        assert!(!w.is_fenced());
    }

    #[test]
    fn push_fails_while_queue_is_held() {
        let w = worker(0);
        let t = task("t", || {}).build();
        let guard = w.lock_queue();
        assert!(!w.try_push(&t));
        drop(guard);

        assert!(t.has_state(TaskState::Clear));
        assert_eq!(t.thread_affinity(), None);
        assert!(w.try_push(&t));
    }

    #[test]
    fn finished_task_is_erased_and_fence_raised() {
        let w = worker(0);
        w.clear_fence();
        let t = task("t", || {}).build();
        assert!(t.claim());
        assert!(w.try_push(&t));

        assert!(run(&w));
        assert!(t.has_state(TaskState::Completed));
        assert_eq!(w.len(), 0);
        assert!(w.is_fenced());
        assert!(!t.is_resident());
    }

    #[test]
    fn empty_queue_raises_fence() {
        let w = worker(0);
        assert!(w.clear_fence());
        assert!(!w.is_fenced());
        assert!(!run(&w));
        assert!(w.is_fenced());
    }

    #[test]
    fn dependency_on_another_worker_is_honoured() {
        let w0 = worker(0);
        let w1 = worker(1);
        let b = task("b", || {}).build();
        let a = task("a", || {}).after(&b).build();
        assert!(w0.try_push(&a));
        assert!(w1.try_push(&b));

        assert!(!run(&w0));
        assert!(a.has_state(TaskState::Waiting));
        assert_eq!(a.deferral_count(), 1);

        assert!(run(&w1));
        assert!(b.has_state(TaskState::Completed));
        assert!(!a.is_waiting_for_dependencies());

        assert!(run(&w0));
        assert!(a.has_state(TaskState::Completed));
        assert_eq!(a.deferral_count(), 1);
    }

    #[test]
    fn blocked_task_does_not_run() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let w = worker(0);
        let b = task("b", || {}).build();
        let a = task("a", move || flag.store(true, Ordering::SeqCst))
            .after(&b)
            .build();
        assert!(w.try_push(&a));

        for expected in 1..4 {
            run(&w);
            assert_eq!(a.deferral_count(), expected);
        }
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn yielding_task_runs_again_next_pass() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let t = TaskBuilder::new(
            "two-step",
            Resume(move || -> Result<Progress, WorkError> {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Progress::Yield)
                } else {
                    Ok(Progress::Completed)
                }
            }),
        )
        .build();
        let w = worker(0);
        assert!(w.try_push(&t));

        assert!(run(&w));
        assert!(t.has_state(TaskState::Active));
        assert_eq!(t.deferral_count(), 1);
        assert_eq!(w.len(), 1);

        assert!(run(&w));
        assert!(t.has_state(TaskState::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_task_releases_dependents() {
        let w = worker(0);
        let broken = task("broken", || panic!("no input device")).build();
        let after = task("after", || {}).after(&broken).build();
        assert!(w.try_push(&broken));
        assert!(w.try_push(&after));

        run(&w);
        run(&w);

        assert!(broken.has_state(TaskState::Failed));
        assert_eq!(broken.failure().as_deref(), Some("no input device"));
        assert!(after.has_state(TaskState::Completed));
        assert_eq!(w.len(), 0);
    }

    struct BadExpiry;

    impl Work for BadExpiry {
        fn execute(&mut self) -> Result<Progress, WorkError> {
            Ok(Progress::Completed)
        }

        fn has_expired(&self) -> bool {
            panic!("expiry check blew up")
        }
    }

    #[test]
    fn panicking_expiry_check_fails_only_that_task() {
        let w = worker(0);
        w.clear_fence();
        let bad = TaskBuilder::new("bad", BadExpiry).build();
        let after_bad = task("after-bad", || {}).after(&bad).build();
        let good = task("good", || {}).build();
        for t in [&bad, &after_bad, &good] {
            assert!(t.claim());
            assert!(w.try_push(t));
        }

        assert!(run(&w));
        assert!(bad.has_state(TaskState::Failed));
        assert_eq!(bad.failure().as_deref(), Some("expiry check blew up"));
        assert!(after_bad.has_state(TaskState::Completed));
        assert!(good.has_state(TaskState::Completed));
        assert_eq!(w.len(), 0);
        assert!(w.is_fenced());
    }

    #[test]
    fn starvation_is_reported_once() {
        capture_logs();
        let w = Shared::new(
            0,
            WorkerConfig {
                starvation_threshold: Some(3),
                ..WorkerConfig::default()
            },
        );
        let upstream = task("upstream", || {}).build();
        let starving = task("starving", || {}).after(&upstream).build();
        assert!(w.try_push(&starving));

        for _ in 0..6 {
            run(&w);
        }
        assert_eq!(starving.deferral_count(), 6);
        let needle = format!("{} deferred", starving);
        let lines = captured(&needle);
        assert_eq!(lines.len(), 1, "{:?}", lines);
        assert!(lines[0].contains("deferred 3 times"));
        assert!(lines[0].contains(&format!("{:?}", [upstream.id()])));
    }

    #[test]
    fn backoff_spins_then_sleeps_longer_up_to_max() {
        let mut idle = Backoff::new(Idle::Backoff {
            max: Duration::from_micros(12),
        });
        for _ in 0..SPIN_PASSES {
            idle.pause();
        }
        assert_eq!(idle.delay, Duration::ZERO);

        idle.pause();
        assert_eq!(idle.delay, BACKOFF_STEP);
        idle.pause();
        assert_eq!(idle.delay, BACKOFF_STEP * 2);
        idle.pause();
        assert_eq!(idle.delay, Duration::from_micros(12));
        idle.pause();
        assert_eq!(idle.delay, Duration::from_micros(12));

        idle.reset();
        assert_eq!(idle.passes, 0);
        assert_eq!(idle.delay, Duration::ZERO);
    }

    #[test]
    fn yield_idle_never_sleeps() {
        let mut idle = Backoff::new(Idle::Yield);
        for _ in 0..SPIN_PASSES * 2 {
            idle.pause();
        }
        assert_eq!(idle.delay, Duration::ZERO);
    }

    #[test]
    fn expired_task_never_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let w = worker(0);
        let t = task("t", move || flag.store(true, Ordering::SeqCst)).build();
        let after = task("after", || {}).after(&t).build();
        t.expire();
        assert!(w.try_push(&t));

        assert!(run(&w));
        assert!(t.has_state(TaskState::Expired));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!after.is_waiting_for_dependencies());
    }

    #[test]
    fn gated_worker_waits_for_its_fence_to_drop() {
        let w = Shared::new(
            0,
            WorkerConfig {
                gated: true,
                ..WorkerConfig::default()
            },
        );
        let t = task("t", || {}).build();
        assert!(w.try_push(&t));

        assert!(!run(&w));
        assert!(t.has_state(TaskState::Queued));

        assert!(w.clear_fence());
        assert!(run(&w));
        assert!(t.has_state(TaskState::Completed));
        assert!(w.is_fenced());
    }

    #[test]
    fn drain_cancels_unfinished_tasks() {
        let w = worker(0);
        let upstream = task("upstream", || {}).build();
        let blocked = task("blocked", || {}).after(&upstream).build();
        let downstream = task("downstream", || {}).after(&blocked).build();
        assert!(blocked.claim());
        assert!(w.try_push(&blocked));
        run(&w);
        assert!(blocked.has_state(TaskState::Waiting));

        assert_eq!(w.drain(true), 1);
        assert!(blocked.has_state(TaskState::Expired));
        assert!(!blocked.is_resident());
        assert!(upstream.dependents().is_empty());
        assert!(!downstream.is_waiting_for_dependencies());
        assert!(w.is_fenced());
    }

    #[test]
    fn drain_without_cancel_leaves_state_alone() {
        let w = worker(0);
        let t = task("t", || {}).build();
        assert!(w.try_push(&t));
        assert_eq!(w.drain(false), 1);
        assert!(t.has_state(TaskState::Queued));
        t.clear_state().unwrap();
    }

    #[test]
    fn snapshot_lists_queue_in_order() {
        let w = worker(2);
        let first = task("first", || {}).build();
        let second = task("second", || {}).after(&first).build();
        assert!(w.try_push(&first));
        assert!(w.try_push(&second));

        let snapshot = w.snapshot();
        assert_eq!(snapshot.worker, 2);
        let names: Vec<_> = snapshot.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(snapshot.tasks[1].waiting_for, vec![first.id()]);
    }
}

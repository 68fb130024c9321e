extern crate framepool;

use std::time::Instant;

use framepool::{task, Scheduler, Task, Wait};

const LENGTH: usize = 10_000;

fn run(wait: Wait) {
    let sched = Scheduler::new().unwrap();
    let started = Instant::now();

    sched.clear_fences();
    let mut last: Option<Task> = None;
    for i in 0..LENGTH {
        let mut builder = task(format!("link{}", i), || {});
        if let Some(prev) = &last {
            builder = builder.after(prev);
        }
        last = Some(builder.start(&sched).unwrap());
    }
    sched.shutdown(wait).unwrap();

    println!(
        "{:?}: {} tasks in {:?}, last is {:?}",
        wait,
        LENGTH,
        started.elapsed(),
        last.map(|t| t.state())
    );
}

fn main() {
    run(Wait::Pending);
    run(Wait::Active);
}

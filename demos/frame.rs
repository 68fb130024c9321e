extern crate framepool;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use framepool::{task, Scheduler, Task, TaskState, Wait};

const FRAMES: usize = 5;

fn main() {
    let sched = Scheduler::builder()
        .thread_name("frame")
        .starvation_threshold(10_000)
        .build()
        .unwrap();
    let ticks = Arc::new(AtomicU64::new(0));

    let stage = |name: &str| -> Task {
        let ticks = ticks.clone();
        let label = name.to_owned();
        task(name, move || {
            let tick = ticks.fetch_add(1, Ordering::SeqCst);
            println!("  {:<10} tick {}", label, tick);
        })
        .build()
    };

    let input = stage("input");
    let scripts = stage("scripts");
    let physics = stage("physics");
    let audio = stage("audio");
    let render = stage("render");

    for frame in 0..FRAMES {
        let started = Instant::now();
        for t in [&input, &scripts, &physics, &audio, &render] {
            t.clear_state().unwrap();
        }
        scripts.depends_on(&input).unwrap();
        physics.depends_on(&scripts).unwrap();
        render.depends_on(&physics).unwrap();
        render.depends_on(&audio).unwrap();

        println!("frame {}", frame);
        sched.clear_fences();
        for t in [&render, &physics, &audio, &scripts, &input] {
            sched.push_task(t).unwrap();
        }
        sched.wait_for_fence();

        assert!(render.has_state(TaskState::Completed));
        println!("  done in {:?}", started.elapsed());
    }

    sched.shutdown(Wait::Pending).unwrap();
}

//! Log capture shared by the unit tests. Only one logger can be installed
//! per process, so every test module goes through this one.

use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

struct Capture(Mutex<Vec<String>>);

impl Log for Capture {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.0.lock().push(format!("{}", record.args()));
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture(Mutex::new(Vec::new()));

/// Install the capturing logger. Call before the code under test logs.
pub(crate) fn capture_logs() {
    if log::set_logger(&CAPTURE).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Every captured line containing `needle`.
pub(crate) fn captured(needle: &str) -> Vec<String> {
    CAPTURE
        .0
        .lock()
        .iter()
        .filter(|line| line.contains(needle))
        .cloned()
        .collect()
}

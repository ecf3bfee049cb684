use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_scheduler::{DeferredWriter, Scheduler};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn recording_writer(delay: Duration) -> (DeferredWriter<&'static str>, Arc<Mutex<Vec<&'static str>>>) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&writes);
    let writer = DeferredWriter::new(Scheduler::default(), delay, move |key: &&'static str| {
        log.lock().push(*key);
    });
    (writer, writes)
}

#[test]
fn a_burst_of_marks_is_written_once() {
    let (writer, writes) = recording_writer(Duration::from_millis(40));
    for _ in 0..5 {
        writer.mark("app");
    }
    writer.mark("lib");

    assert!(wait_until(|| writes.lock().len() == 2));
    std::thread::sleep(Duration::from_millis(100));
    let mut written = writes.lock().clone();
    written.sort();
    assert_eq!(written, vec!["app", "lib"]);
    assert!(!writer.is_pending(&"app"));
}

#[test]
fn cancelled_write_never_runs() {
    let (writer, writes) = recording_writer(Duration::from_millis(200));
    writer.mark("app");
    assert!(writer.is_pending(&"app"));
    assert!(writer.cancel(&"app"));
    assert!(!writer.cancel(&"app"));

    std::thread::sleep(Duration::from_millis(300));
    assert!(writes.lock().is_empty());
}

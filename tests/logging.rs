mod common;

use log::{Level, LevelFilter, Log, Metadata, Record};


/// Logger keeping every record in memory
struct CaptureLogger {
    records: spin::Mutex<Vec<(Level, String)>>,
}

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        self.records.lock().push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger { records: spin::Mutex::new(Vec::new()) };

fn logged(level: Level, needle: &str) -> bool {
    LOGGER.records
          .lock()
          .iter()
          .any(|(lvl, message)| *lvl == level && message.contains(needle))
}

// Everything happens in a single test, as the logger is process-wide
#[test]
fn heap_events_are_logged() {
    log::set_logger(&LOGGER).expect("Failed to set logger");
    log::set_max_level(LevelFilter::Trace);

    let heap = common::heap(64);
    assert!(logged(Level::Debug, "heap initialized with 64 pages of 4096 bytes"));

    let ptr = heap.allocate(100);
    assert!(logged(Level::Debug, "heap grown by 16 pages"));
    assert!(logged(Level::Trace, "allocation #0: 100 bytes"));

    // Dumping a busy heap logs its accounting
    heap.dump();
    assert!(logged(Level::Info, "heap statistics:"));
    assert!(logged(Level::Info, "system memory allocated: 65536 bytes in 1 blocks"));
    assert!(logged(Level::Info, "arena pages free: 48 of 64"));

    unsafe {
        heap.free(ptr.as_ptr());
        heap.free(ptr.as_ptr());
    }
    assert!(logged(Level::Debug, "heap shrunk by 16 pages"));
    assert!(logged(Level::Error, "freed twice"));

    let _ = heap.allocate(0);
    assert!(logged(Level::Warn, "zero-sized allocation"));
    heap.dump();
    assert!(logged(Level::Info, "errors: 1"));
}

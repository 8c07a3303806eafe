// In-memory ring logger for the HAL.
//
// Keeps the most recent records in a bounded buffer so they can be read
// back without a console (early boot, tests).

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

const MAX_LOG_ENTRIES: usize = 64;

/// One captured record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// Bounded ring of log records. Oldest records are overwritten.
pub struct RingLogger {
    entries: Mutex<VecDeque<LogEntry>>,
    total: AtomicUsize,
}

impl RingLogger {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the buffered records, oldest first.
    pub fn records(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Records accepted since start, including overwritten ones.
    pub fn count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl Default for RingLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = LogEntry {
            level: record.level(),
            target: String::from(record.target()),
            message: format!("{}", record.args()),
        };
        let mut entries = self.entries.lock();
        if entries.len() == MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(entry);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger::new();

/// Install the ring logger as the global `log` backend.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// The global ring logger.
pub fn logger() -> &'static RingLogger {
    &LOGGER
}

/// Buffered records of the global logger.
pub fn records() -> Vec<LogEntry> {
    LOGGER.records()
}

/// Records accepted by the global logger.
pub fn count() -> usize {
    LOGGER.count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(logger: &RingLogger, level: Level, msg: &str) {
        logger.log(
            &Record::builder()
                .level(level)
                .target("vxge::test")
                .args(format_args!("{}", msg))
                .build(),
        );
    }

    #[test]
    fn test_ring_overwrites_oldest() {
        log::set_max_level(LevelFilter::Trace);
        let logger = RingLogger::new();
        for i in 0..MAX_LOG_ENTRIES + 3 {
            record(&logger, Level::Info, &format!("msg {}", i));
        }
        let records = logger.records();
        assert_eq!(records.len(), MAX_LOG_ENTRIES);
        assert_eq!(records[0].message, "msg 3");
        assert_eq!(records[0].target, "vxge::test");
        assert_eq!(logger.count(), MAX_LOG_ENTRIES + 3);
    }

    #[test]
    fn test_clear() {
        log::set_max_level(LevelFilter::Trace);
        let logger = RingLogger::new();
        record(&logger, Level::Warn, "x");
        logger.clear();
        assert!(logger.records().is_empty());
        assert_eq!(logger.count(), 1);
    }
}

//! Structured, category-filterable logging with an installable sink.
//!
//! The engine never talks to `log`/`tracing` directly from its internals; instead
//! every subsystem goes through the free functions here, which fan out to a single
//! installed [`LogSink`]. This keeps the core decoupled from whatever logging
//! framework the embedding application prefers, while still giving it breadcrumb
//! categories it can filter on independently of plain level filtering.

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Installs a new sink, replacing any previously installed one. `None` disables logging.
pub fn install_sink(sink: Option<Arc<dyn LogSink>>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
    LOGGER.install_sink(sink, min_level, breadcrumbs);
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

/// Host-provided log destination. Implementations must be cheap and non-blocking;
/// the engine may call this from any of its internal threads.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, category: BreadcrumbFlags, message: &str);
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BreadcrumbFlags: u32 {
        const SESSION   = 0b0000_0001;
        const TCP       = 0b0000_0010;
        const UDP       = 0b0000_0100;
        const MUX       = 0b0000_1000;
        const TRANSPORT = 0b0001_0000;
        const PROXY     = 0b0010_0000;
        const ENGINE    = 0b0100_0000;
        const ALL       = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct LogSinkInner {
    sink: Arc<dyn LogSink>,
    min_level: LogLevel,
    breadcrumbs: BreadcrumbFlags,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
}

impl LogManager {
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    fn install_sink(&self, sink: Option<Arc<dyn LogSink>>, min_level: LogLevel, breadcrumbs: BreadcrumbFlags) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| LogSinkInner {
            sink,
            min_level,
            breadcrumbs,
        });
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let guard = self.sink.lock();
        let Some(inner) = guard.as_ref() else { return };
        if breadcrumbs.is_empty() {
            if level > inner.min_level {
                return;
            }
        } else if !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }
        inner.sink.log(level, breadcrumbs, &message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        count: AtomicUsize,
    }

    impl LogSink for Counting {
        fn log(&self, _level: LogLevel, _category: BreadcrumbFlags, _message: &str) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn breadcrumb_filtered_by_mask() {
        let sink = Arc::new(Counting {
            count: AtomicUsize::new(0),
        });
        install_sink(Some(sink.clone()), LogLevel::Debug, BreadcrumbFlags::TCP);
        breadcrumb(BreadcrumbFlags::UDP, "should be filtered out");
        breadcrumb(BreadcrumbFlags::TCP, "should pass");
        assert_eq!(sink.count.load(Ordering::SeqCst), 1);
        install_sink(None, LogLevel::Debug, BreadcrumbFlags::ALL);
    }
}

use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt::Write as _;
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

/// A log destination supplied by the embedder. This crate does not depend on
/// `tracing`; an embedder that wants it can implement `LogSink` with a thin
/// `tracing::event!` shim.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: &str);
}

pub fn install_sink(sink: Option<Arc<dyn LogSink>>, level: LogLevel) {
    LOGGER.install_sink(sink, level);
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const FLOW  = 0b0000_0001;
        const NAT   = 0b0000_0010;
        const STATS = 0b0000_0100;
        const UID   = 0b0000_1000;
        const DNS   = 0b0001_0000;
        const ALL   = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

struct SinkSlot {
    sink: Arc<dyn LogSink>,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<SinkSlot>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[fd-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Arc<dyn LogSink>>, level: LogLevel) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| SinkSlot {
            sink,
            breadcrumbs: BreadcrumbFlags::empty(),
            min_level: level,
        });
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(slot) = self.sink.lock().as_mut() {
            slot.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
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
        let Some(slot) = guard.as_ref() else { return };
        if level > slot.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !slot.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let mut formatted = String::new();
        if breadcrumbs.is_empty() {
            let _ = write!(formatted, "{} [{}] {}", self.prefix, level.as_str(), message);
        } else {
            let _ = write!(
                formatted,
                "{} [{}] [{}] {}",
                self.prefix,
                level.as_str(),
                label_for(breadcrumbs),
                message
            );
        }
        slot.sink.log(level, breadcrumbs, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::NAT) {
        "NAT"
    } else if flags.contains(BreadcrumbFlags::STATS) {
        "STATS"
    } else if flags.contains(BreadcrumbFlags::UID) {
        "UID"
    } else if flags.contains(BreadcrumbFlags::DNS) {
        "DNS"
    } else {
        "LOG"
    }
}

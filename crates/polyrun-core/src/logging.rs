//! Logging capability injected into the dispatcher and sandbox backends
//!
//! Engine components never reach for a process-wide logger directly. They are
//! handed an `Arc<dyn EngineLogger>` at construction; `LogFacade` forwards to
//! the `log` crate for binaries, `MemoryLogger` keeps records in memory.

use log::Level;
use std::sync::{Arc, Mutex};

pub trait EngineLogger: Send + Sync {
    fn record(&self, level: Level, component: &'static str, message: &str);

    fn debug(&self, component: &'static str, message: &str) {
        self.record(Level::Debug, component, message);
    }

    fn info(&self, component: &'static str, message: &str) {
        self.record(Level::Info, component, message);
    }

    fn warn(&self, component: &'static str, message: &str) {
        self.record(Level::Warn, component, message);
    }

    fn error(&self, component: &'static str, message: &str) {
        self.record(Level::Error, component, message);
    }
}

/// Forwards records to whatever `log` implementation the host process installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

impl EngineLogger for LogFacade {
    fn record(&self, level: Level, component: &'static str, message: &str) {
        log::log!(target: component, level, "{}", message);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub component: &'static str,
    pub message: String,
}

/// Keeps every record in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn warnings(&self) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == Level::Warn)
            .collect()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.level == level && entry.message.contains(needle))
    }
}

impl EngineLogger for MemoryLogger {
    fn record(&self, level: Level, component: &'static str, message: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                level,
                component,
                message: message.to_string(),
            });
        }
    }
}

/// Component targets used by the engine.
pub mod component {
    pub const DISPATCHER: &str = "polyrun::dispatcher";
    pub const WORKSPACE: &str = "polyrun::workspace";
    pub const DOCKER: &str = "polyrun::sandbox::docker";
    pub const STANDARD: &str = "polyrun::sandbox::standard";
    pub const HARDENED: &str = "polyrun::sandbox::hardened";
}

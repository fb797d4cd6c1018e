//! Per-context logger bindings.
//!
//! Every context node references a [`Logger`], normally shared with its
//! parent.  A level override on a node copies the logger (sink and format
//! come along by value) and scopes the new level to that node and its later
//! descendants — ancestors and siblings keep the logger they already hold.
//! Emission goes through [`tracing`], gated by the logger's level.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::Level;

/// Minimum severity a [`Logger`] emits.
///
/// Ordered from most to least severe, so `LogLevel::Error < LogLevel::Trace`
/// and a record is emitted when its level is `<=` the logger's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Emit errors only.
    Error,
    /// Emit warnings and errors.
    Warn,
    /// Emit informational records and above.
    Info,
    /// Emit debug records and above.
    Debug,
    /// Emit everything.
    Trace,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

impl From<LogLevel> for Level {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Where a logger's records are routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSink {
    /// Standard error (the default).
    Stderr,
    /// Standard output.
    Stdout,
    /// Discard all records.
    Null,
}

/// How a logger's records are formatted by the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Human-readable single-line records (the default).
    Full,
    /// Compact single-line records.
    Compact,
    /// JSON records.
    Json,
}

/// Logging configuration attached to a context node.
///
/// A `Logger` is immutable; level overrides produce a copy via
/// [`Logger::with_level`], carrying the sink and format over by value.
/// Copies made later never retroactively affect copies made earlier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logger {
    level: LogLevel,
    sink: LogSink,
    format: LogFormat,
}

impl Logger {
    /// Create a logger with the given level and default sink/format.
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            sink: LogSink::Stderr,
            format: LogFormat::Full,
        }
    }

    /// The minimum severity this logger emits.
    pub fn level(&self) -> LogLevel {
        self.level
    }

    /// The sink this logger routes records to.
    pub fn sink(&self) -> LogSink {
        self.sink
    }

    /// The record format this logger requests.
    pub fn format(&self) -> LogFormat {
        self.format
    }

    /// Copy this logger with a different level; sink and format carry over.
    pub fn with_level(&self, level: LogLevel) -> Self {
        Self {
            level,
            sink: self.sink,
            format: self.format,
        }
    }

    /// Whether a record at `level` would be emitted.
    pub fn enabled(&self, level: LogLevel) -> bool {
        self.sink != LogSink::Null && level <= self.level
    }

    /// Emit a record at `level` if the logger's threshold allows it.
    pub fn log(&self, level: LogLevel, msg: &str) {
        if !self.enabled(level) {
            return;
        }
        match level {
            LogLevel::Error => tracing::error!(target: "libstor", "{msg}"),
            LogLevel::Warn => tracing::warn!(target: "libstor", "{msg}"),
            LogLevel::Info => tracing::info!(target: "libstor", "{msg}"),
            LogLevel::Debug => tracing::debug!(target: "libstor", "{msg}"),
            LogLevel::Trace => tracing::trace!(target: "libstor", "{msg}"),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(LogLevel::Error < LogLevel::Trace);
        let logger = Logger::new(LogLevel::Info);
        assert!(logger.enabled(LogLevel::Error));
        assert!(logger.enabled(LogLevel::Info));
        assert!(!logger.enabled(LogLevel::Debug));
    }

    #[test]
    fn with_level_copies_sink_and_format() {
        let parent = Logger::default();
        let child = parent.with_level(LogLevel::Trace);
        assert_eq!(child.level(), LogLevel::Trace);
        assert_eq!(child.sink(), parent.sink());
        assert_eq!(child.format(), parent.format());
        // The original is untouched.
        assert_eq!(parent.level(), LogLevel::Info);
    }

    #[test]
    fn null_sink_disables_emission() {
        let logger = Logger {
            level: LogLevel::Trace,
            sink: LogSink::Null,
            format: LogFormat::Full,
        };
        assert!(!logger.enabled(LogLevel::Error));
    }

    #[test]
    fn level_parsing() {
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("TRACE".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}

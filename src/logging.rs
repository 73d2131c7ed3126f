//! Console logging for the measurement engine
//!
//! A small structured logger in the same spirit as the rest of the output
//! layer: level filtering, optional color, timestamps. Log lines go to
//! stderr so they never interleave with result output on stdout.

use crate::error::{AppError, Result};
use chrono::Utc;
use colored::Colorize;
use serde::{Deserialize, Serialize};

/// Log level enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Detailed information for debugging
    Debug = 0,
    /// General application information
    Info = 1,
    /// Potentially harmful situations
    Warn = 2,
    /// Error events the run can survive
    Error = 3,
}

impl LogLevel {
    /// Get log level name as string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(AppError::parse(format!("Invalid log level: {}", s))),
        }
    }
}

/// Console logger with level filtering and optional color
#[derive(Debug, Clone)]
pub struct Logger {
    /// Minimum log level to output
    min_level: LogLevel,
    /// Whether to use colored output
    use_color: bool,
}

impl Logger {
    /// Create a new logger
    pub fn new(min_level: LogLevel, use_color: bool) -> Self {
        Self { min_level, use_color }
    }

    /// Logger derived from verbose/debug flags: debug wins over verbose
    pub fn from_flags(verbose: bool, debug: bool, use_color: bool) -> Self {
        let min_level = if debug {
            LogLevel::Debug
        } else if verbose {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        Self::new(min_level, use_color)
    }

    /// Whether a message at `level` would be emitted
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    /// Emit a log line for `component` at `level`
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if !self.enabled(level) {
            return;
        }
        eprintln!("{}", self.format_line(level, component, message));
    }

    /// Debug-level shorthand
    pub fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, component, message);
    }

    /// Info-level shorthand
    pub fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, component, message);
    }

    /// Warn-level shorthand
    pub fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, component, message);
    }

    /// Error-level shorthand
    pub fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, component, message);
    }

    fn format_line(&self, level: LogLevel, component: &str, message: &str) -> String {
        let timestamp = Utc::now().format("%H:%M:%S%.3f");
        if self.use_color {
            let tag = match level {
                LogLevel::Debug => level.as_str().cyan(),
                LogLevel::Info => level.as_str().green(),
                LogLevel::Warn => level.as_str().yellow(),
                LogLevel::Error => level.as_str().red().bold(),
            };
            format!("[{}] [{}] {}: {}", timestamp, tag, component.bold(), message)
        } else {
            format!("[{}] [{}] {}: {}", timestamp, level.as_str(), component, message)
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogLevel::Warn, true)
    }
}

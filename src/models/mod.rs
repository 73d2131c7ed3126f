//! Data models for configuration, progress and results

pub mod config;
pub mod result;

pub use config::Config;
pub use result::{MetricReading, ProgressSnapshot, TestResult};

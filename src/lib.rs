//! Speedmeter
//!
//! A client-driven network throughput and latency measurement engine: it
//! measures download speed, upload speed, round-trip latency and jitter
//! against remote HTTP endpoints using multiple parallel streams, adaptive
//! test duration and speed-stabilization detection. The engine consumes
//! opaque target URLs and emits numeric results and progress events; it
//! owns no storage, authentication or presentation.

pub mod cli;
pub mod client;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod stabilize;
pub mod stats;
pub mod types;

// Re-export commonly used types
pub use client::{HttpBackend, TransferBackend};
pub use error::{AppError, Result};
pub use models::{Config, MetricReading, ProgressSnapshot, TestResult};
pub use orchestrator::{SpeedTest, TestRun};
pub use stabilize::StabilityDetector;
pub use types::{Phase, SpeedScale, TransferDirection};

/// Application version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
pub const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default configuration values
pub mod defaults {
    /// Default phase order string accepted by the CLI
    pub const DEFAULT_ORDER: &str = "pdu";
    pub const DEFAULT_TIME_DL_MAX_SECS: u64 = 15;
    pub const DEFAULT_TIME_UL_MAX_SECS: u64 = 15;
    pub const DEFAULT_TIME_PING_MAX_SECS: u64 = 10;
    pub const DEFAULT_PING_COUNT: u32 = 10;
    pub const DEFAULT_STREAMS_DL: u32 = 6;
    pub const DEFAULT_STREAMS_UL: u32 = 3;
    /// Relative speed change below which a phase is considered stable
    pub const DEFAULT_STABLE_THRESHOLD: f64 = 0.05;
    pub const DEFAULT_MIN_STABLE_SECS: f64 = 2.0;
    /// Fraction of worst ping samples discarded before aggregation
    pub const DEFAULT_PING_TRIM_FRACTION: f64 = 0.2;
    pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
    pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 200;
    pub const DEFAULT_UPLOAD_PAYLOAD_BYTES: usize = 20 * 1024 * 1024;
}

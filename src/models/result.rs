//! Result and progress data models

use crate::types::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// One reported metric value, distinguishing "measured 0" from "never
/// measured".
///
/// A phase that produced no successful sample before its budget expired
/// degrades to `Unmeasured` so consumers can render "N/A" instead of a
/// fabricated zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum MetricReading {
    /// No successful sample was collected
    Unmeasured,
    /// Measured value (ms for latency metrics, speed units for throughput)
    Measured(f64),
}

impl MetricReading {
    /// Whether a real measurement backs this reading
    pub fn is_measured(&self) -> bool {
        matches!(self, MetricReading::Measured(_))
    }

    /// The measured value, if any
    pub fn value(&self) -> Option<f64> {
        match self {
            MetricReading::Measured(v) => Some(*v),
            MetricReading::Unmeasured => None,
        }
    }

    /// The measured value, or 0.0 when unmeasured
    pub fn value_or_zero(&self) -> f64 {
        self.value().unwrap_or(0.0)
    }
}

impl Default for MetricReading {
    fn default() -> Self {
        MetricReading::Unmeasured
    }
}

impl fmt::Display for MetricReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricReading::Unmeasured => write!(f, "N/A"),
            MetricReading::Measured(v) => write!(f, "{:.2}", v),
        }
    }
}

/// Point-in-time view of a running (or finished) test, emitted through the
/// update event at a bounded cadence and returned by result queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Current lifecycle phase
    pub phase: Phase,
    /// Latest ping reading (ms, bias applied)
    pub ping: MetricReading,
    /// Latest jitter reading (ms, bias applied)
    pub jitter: MetricReading,
    /// Latest download reading (configured speed unit, bias applied)
    pub download: MetricReading,
    /// Latest upload reading (configured speed unit, bias applied)
    pub upload: MetricReading,
    /// Ping phase progress fraction [0, 1]
    pub ping_progress: f64,
    /// Download phase progress fraction [0, 1]
    pub download_progress: f64,
    /// Upload phase progress fraction [0, 1]
    pub upload_progress: f64,
}

/// Final (or latest-partial) record of one measurement run.
///
/// Produced once at termination and immutable afterwards; querying a live
/// run yields a consistent partial snapshot with the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Correlation ID for this run
    pub run_id: Uuid,
    /// Round-trip latency (ms)
    pub ping: MetricReading,
    /// Latency jitter (ms)
    pub jitter: MetricReading,
    /// Download throughput (configured speed unit)
    pub download: MetricReading,
    /// Upload throughput (configured speed unit)
    pub upload: MetricReading,
    /// Total bytes received across all download streams
    pub download_bytes: u64,
    /// Total bytes sent across all upload streams
    pub upload_bytes: u64,
    /// Wall-clock duration of the download phase, milliseconds
    pub download_elapsed_ms: f64,
    /// Wall-clock duration of the upload phase, milliseconds
    pub upload_elapsed_ms: f64,
    /// Number of latency samples retained after outlier trimming
    pub ping_samples: usize,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether the run was terminated by an explicit abort
    pub aborted: bool,
}

impl TestResult {
    /// Create an empty result for a run that has just started
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            ping: MetricReading::Unmeasured,
            jitter: MetricReading::Unmeasured,
            download: MetricReading::Unmeasured,
            upload: MetricReading::Unmeasured,
            download_bytes: 0,
            upload_bytes: 0,
            download_elapsed_ms: 0.0,
            upload_elapsed_ms: 0.0,
            ping_samples: 0,
            started_at: Utc::now(),
            completed_at: None,
            aborted: false,
        }
    }

    /// Whether the run reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Whether every scheduled metric came back measured
    pub fn all_measured(&self) -> bool {
        self.ping.is_measured()
            && self.jitter.is_measured()
            && self.download.is_measured()
            && self.upload.is_measured()
    }
}

//! Type definitions and aliases

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use crate::error::{AppError, Result};

/// Lifecycle phase of a measurement run.
///
/// `Ping`, `Download` and `Upload` are the schedulable measurement phases
/// that may appear in a configuration's `test_order`; `Waiting`, `Finished`
/// and `Aborted` only ever occur as the run's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run constructed but not started
    Waiting,
    /// Round-trip latency probing
    Ping,
    /// Download throughput measurement
    Download,
    /// Upload throughput measurement
    Upload,
    /// Run completed all configured phases
    Finished,
    /// Run terminated by an explicit abort
    Aborted,
}

impl Phase {
    /// Get a human-readable name for this phase
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Waiting => "waiting",
            Phase::Ping => "ping",
            Phase::Download => "download",
            Phase::Upload => "upload",
            Phase::Finished => "finished",
            Phase::Aborted => "aborted",
        }
    }

    /// Whether this phase can appear in a `test_order` sequence
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Phase::Ping | Phase::Download | Phase::Upload)
    }

    /// Whether the run is over (no further state changes)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Finished | Phase::Aborted)
    }

    /// Parse a single order character (`p`/`d`/`u`, case-insensitive)
    pub fn from_order_char(c: char) -> Option<Self> {
        match c.to_ascii_lowercase() {
            'p' => Some(Phase::Ping),
            'd' => Some(Phase::Download),
            'u' => Some(Phase::Upload),
            _ => None,
        }
    }
}

/// Direction of a throughput transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Data flows from the target endpoint to this client
    Download,
    /// Data flows from this client to the target endpoint
    Upload,
}

impl TransferDirection {
    /// The lifecycle phase this direction belongs to
    pub fn phase(&self) -> Phase {
        match self {
            TransferDirection::Download => Phase::Download,
            TransferDirection::Upload => Phase::Upload,
        }
    }
}

/// Unit basis for reported throughput.
///
/// The output unit is user-visible, so the divisor is configuration rather
/// than a constant: decimal megabits (1e6) by default, or mebibits
/// (1024*1024) when binary units are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedScale {
    /// Decimal megabits: 1 Mbps = 1_000_000 bits/s
    Decimal,
    /// Binary mebibits: 1 Mibps = 1_048_576 bits/s
    Binary,
}

impl SpeedScale {
    /// Bits-per-second divisor for one reported unit
    pub fn divisor(&self) -> f64 {
        match self {
            SpeedScale::Decimal => 1_000_000.0,
            SpeedScale::Binary => 1024.0 * 1024.0,
        }
    }

    /// Unit label for display
    pub fn label(&self) -> &'static str {
        match self {
            SpeedScale::Decimal => "Mbps",
            SpeedScale::Binary => "Mibps",
        }
    }
}

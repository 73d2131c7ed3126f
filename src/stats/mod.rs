//! Statistical helpers for latency aggregation and throughput conversion

use crate::types::SpeedScale;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Arithmetic mean, `None` for an empty slice
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}

/// Trimmed retention: drop the worst `ceil(fraction * n)` samples (the
/// largest values), capped so at least one sample is always retained.
///
/// Arrival order of the retained samples is preserved, which matters for
/// the jitter pass: jitter is defined over consecutive retained samples in
/// the order they were observed, not in sorted order. Ties are broken by
/// dropping later arrivals first.
pub fn trim_worst(samples: &[f64], fraction: f64) -> Vec<f64> {
    if samples.is_empty() {
        return Vec::new();
    }
    let n = samples.len();
    let drop_count = ((fraction * n as f64).ceil() as usize).min(n - 1);
    if drop_count == 0 {
        return samples.to_vec();
    }

    // Indices of the drop_count largest values
    let mut by_value: Vec<usize> = (0..n).collect();
    by_value.sort_by(|&a, &b| {
        samples[b]
            .partial_cmp(&samples[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.cmp(&a))
    });
    let mut dropped = vec![false; n];
    for &idx in by_value.iter().take(drop_count) {
        dropped[idx] = true;
    }

    samples
        .iter()
        .enumerate()
        .filter(|(i, _)| !dropped[*i])
        .map(|(_, &v)| v)
        .collect()
}

/// Mean absolute difference between consecutive samples.
///
/// Returns `None` for fewer than two samples; this is the user-facing
/// jitter definition (average consecutive delta, not overall stddev).
pub fn consecutive_jitter(samples: &[f64]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = samples
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).abs())
        .collect();
    mean(&deltas)
}

/// Aggregated latency statistics over a set of raw probe samples
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Mean round-trip of retained samples, bias applied (ms)
    pub avg_ms: f64,
    /// Mean consecutive delta over retained samples, bias applied (ms);
    /// `None` when fewer than two samples were retained
    pub jitter_ms: Option<f64>,
    /// Number of samples retained after trimming
    pub retained: usize,
}

/// Aggregate raw round-trip samples into latency statistics.
///
/// Applies the trimmed-retention outlier policy, then the configured
/// multiplicative bias factors. Returns `None` when `samples` is empty so
/// callers can report "not measured" instead of a fabricated 0 ms.
pub fn aggregate_latency(
    samples: &[f64],
    trim_fraction: f64,
    ping_bias: f64,
    jitter_bias: f64,
) -> Option<LatencyStats> {
    let retained = trim_worst(samples, trim_fraction);
    let avg = mean(&retained)?;
    let jitter = consecutive_jitter(&retained);
    Some(LatencyStats {
        avg_ms: avg * ping_bias,
        jitter_ms: jitter.map(|j| j * jitter_bias),
        retained: retained.len(),
    })
}

/// Convert a byte count over an elapsed duration into the configured
/// throughput unit: `(bytes * 8) / (elapsed_secs * divisor)`.
///
/// Returns 0.0 for a zero elapsed time rather than infinity.
pub fn throughput_mbps(bytes: u64, elapsed: Duration, scale: SpeedScale) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64 * 8.0) / (secs * scale.divisor())
}

/// One point of the rolling throughput signal observed during a phase
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    /// Milliseconds since the phase started
    pub at_ms: f64,
    /// Throughput at that instant, in the configured unit
    pub mbps: f64,
}

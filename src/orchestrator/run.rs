//! Mutable state of one measurement run
//!
//! A `TestRun` is created at start, mutated only by the orchestrator's
//! event loop (single-writer discipline; concurrent transfer tasks report
//! through channels, they never touch this struct), and frozen into a
//! `TestResult` at termination.
//!
//! Every mutation is guarded by the phase generation and the per-phase
//! completed flag: a late event from a transfer that outlived its phase is
//! dropped instead of corrupting counters that already fed a final value.

use crate::models::result::{MetricReading, ProgressSnapshot, TestResult};
use crate::stats::{throughput_mbps, LatencyStats, SpeedSample};
use crate::types::{Phase, SpeedScale, TransferDirection};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Cap on the retained rolling throughput signal
const SPEED_SAMPLE_CAP: usize = 512;

/// Live state of one run; see module docs for the ownership rules
#[derive(Debug, Clone)]
pub struct TestRun {
    run_id: Uuid,
    state: Phase,
    generation: u64,
    ping_completed: bool,
    download_completed: bool,
    upload_completed: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    download_bytes: u64,
    upload_bytes: u64,
    download_elapsed: Duration,
    upload_elapsed: Duration,
    ping_progress: f64,
    download_progress: f64,
    upload_progress: f64,
    ping: MetricReading,
    jitter: MetricReading,
    download: MetricReading,
    upload: MetricReading,
    ping_samples: usize,
    speed_samples: Vec<SpeedSample>,
    download_errors: u32,
    upload_errors: u32,
    ping_failures: u32,
    aborted: bool,
}

impl TestRun {
    /// Fresh state for a run that is about to start
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: Phase::Waiting,
            generation: 0,
            ping_completed: false,
            download_completed: false,
            upload_completed: false,
            started_at: Utc::now(),
            completed_at: None,
            download_bytes: 0,
            upload_bytes: 0,
            download_elapsed: Duration::ZERO,
            upload_elapsed: Duration::ZERO,
            ping_progress: 0.0,
            download_progress: 0.0,
            upload_progress: 0.0,
            ping: MetricReading::Unmeasured,
            jitter: MetricReading::Unmeasured,
            download: MetricReading::Unmeasured,
            upload: MetricReading::Unmeasured,
            ping_samples: 0,
            speed_samples: Vec::new(),
            download_errors: 0,
            upload_errors: 0,
            ping_failures: 0,
            aborted: false,
        }
    }

    /// Current lifecycle phase
    pub fn state(&self) -> Phase {
        self.state
    }

    /// Whether `phase` already holds its permanent completed flag
    pub fn is_completed(&self, phase: Phase) -> bool {
        match phase {
            Phase::Ping => self.ping_completed,
            Phase::Download => self.download_completed,
            Phase::Upload => self.upload_completed,
            _ => false,
        }
    }

    /// Accumulated byte total for a transfer direction
    pub fn transfer_bytes(&self, direction: TransferDirection) -> u64 {
        match direction {
            TransferDirection::Download => self.download_bytes,
            TransferDirection::Upload => self.upload_bytes,
        }
    }

    /// Transfer error count for a direction
    pub fn transfer_errors(&self, direction: TransferDirection) -> u32 {
        match direction {
            TransferDirection::Download => self.download_errors,
            TransferDirection::Upload => self.upload_errors,
        }
    }

    /// Enter a measurement phase; returns the generation tag that every
    /// event of this phase must carry to be accepted
    pub fn begin_phase(&mut self, phase: Phase) -> u64 {
        self.state = phase;
        self.generation += 1;
        self.generation
    }

    /// An event is applied only if it belongs to the live generation of a
    /// not-yet-completed phase that is still current.
    fn accepts(&self, phase: Phase, generation: u64) -> bool {
        self.state == phase && self.generation == generation && !self.is_completed(phase)
    }

    /// Apply a byte-progress delta from a transfer stream.
    /// Returns whether the event was accepted.
    pub fn apply_bytes(
        &mut self,
        direction: TransferDirection,
        generation: u64,
        delta: u64,
    ) -> bool {
        if !self.accepts(direction.phase(), generation) {
            return false;
        }
        match direction {
            TransferDirection::Download => self.download_bytes += delta,
            TransferDirection::Upload => self.upload_bytes += delta,
        }
        true
    }

    /// Count a failed transfer attempt
    pub fn record_transfer_error(&mut self, direction: TransferDirection, generation: u64) -> bool {
        if !self.accepts(direction.phase(), generation) {
            return false;
        }
        match direction {
            TransferDirection::Download => self.download_errors += 1,
            TransferDirection::Upload => self.upload_errors += 1,
        }
        true
    }

    /// Count a failed latency probe
    pub fn record_ping_failure(&mut self, generation: u64) -> bool {
        if !self.accepts(Phase::Ping, generation) {
            return false;
        }
        self.ping_failures += 1;
        true
    }

    /// Update the live throughput reading and the rolling speed signal
    pub fn set_throughput(
        &mut self,
        direction: TransferDirection,
        generation: u64,
        value: f64,
        elapsed: Duration,
    ) -> bool {
        if !self.accepts(direction.phase(), generation) {
            return false;
        }
        let reading = MetricReading::Measured(value);
        match direction {
            TransferDirection::Download => {
                self.download = reading;
                self.download_elapsed = elapsed;
            }
            TransferDirection::Upload => {
                self.upload = reading;
                self.upload_elapsed = elapsed;
            }
        }
        if self.speed_samples.len() >= SPEED_SAMPLE_CAP {
            self.speed_samples.remove(0);
        }
        self.speed_samples.push(SpeedSample {
            at_ms: elapsed.as_secs_f64() * 1000.0,
            mbps: value,
        });
        true
    }

    /// Update the live latency readings from an aggregate over the
    /// samples collected so far
    pub fn set_latency(&mut self, generation: u64, stats: &LatencyStats) -> bool {
        if !self.accepts(Phase::Ping, generation) {
            return false;
        }
        self.ping = MetricReading::Measured(stats.avg_ms);
        self.jitter = match stats.jitter_ms {
            Some(jitter) => MetricReading::Measured(jitter),
            None => MetricReading::Unmeasured,
        };
        self.ping_samples = stats.retained;
        true
    }

    /// Update a phase's progress fraction (clamped to [0, 1])
    pub fn set_phase_progress(&mut self, phase: Phase, generation: u64, fraction: f64) -> bool {
        if !self.accepts(phase, generation) {
            return false;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        match phase {
            Phase::Ping => self.ping_progress = fraction,
            Phase::Download => self.download_progress = fraction,
            Phase::Upload => self.upload_progress = fraction,
            _ => return false,
        }
        true
    }

    /// Seal a throughput phase: compute the final reading from the exact
    /// byte total and elapsed time, then set the permanent completed flag.
    /// A phase that moved no bytes degrades to `Unmeasured`.
    pub fn complete_transfer_phase(
        &mut self,
        direction: TransferDirection,
        generation: u64,
        elapsed: Duration,
        scale: SpeedScale,
        bias: f64,
    ) -> bool {
        if !self.accepts(direction.phase(), generation) {
            return false;
        }
        let bytes = self.transfer_bytes(direction);
        let reading = if bytes > 0 {
            MetricReading::Measured(throughput_mbps(bytes, elapsed, scale) * bias)
        } else {
            MetricReading::Unmeasured
        };
        match direction {
            TransferDirection::Download => {
                self.download = reading;
                self.download_elapsed = elapsed;
                self.download_progress = 1.0;
                self.download_completed = true;
            }
            TransferDirection::Upload => {
                self.upload = reading;
                self.upload_elapsed = elapsed;
                self.upload_progress = 1.0;
                self.upload_completed = true;
            }
        }
        self.speed_samples.clear();
        true
    }

    /// Seal the ping phase. `stats` is `None` when every probe failed, in
    /// which case both latency readings stay `Unmeasured`.
    pub fn complete_ping_phase(&mut self, generation: u64, stats: Option<&LatencyStats>) -> bool {
        if !self.accepts(Phase::Ping, generation) {
            return false;
        }
        if let Some(stats) = stats {
            self.ping = MetricReading::Measured(stats.avg_ms);
            self.jitter = match stats.jitter_ms {
                Some(jitter) => MetricReading::Measured(jitter),
                None => MetricReading::Unmeasured,
            };
            self.ping_samples = stats.retained;
        } else {
            self.ping = MetricReading::Unmeasured;
            self.jitter = MetricReading::Unmeasured;
            self.ping_samples = 0;
        }
        self.ping_progress = 1.0;
        self.ping_completed = true;
        true
    }

    /// Point-in-time view for update events and live queries
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.state,
            ping: self.ping,
            jitter: self.jitter,
            download: self.download,
            upload: self.upload,
            ping_progress: self.ping_progress,
            download_progress: self.download_progress,
            upload_progress: self.upload_progress,
        }
    }

    /// Build the result record from the current state
    pub fn result(&self) -> TestResult {
        TestResult {
            run_id: self.run_id,
            ping: self.ping,
            jitter: self.jitter,
            download: self.download,
            upload: self.upload,
            download_bytes: self.download_bytes,
            upload_bytes: self.upload_bytes,
            download_elapsed_ms: self.download_elapsed.as_secs_f64() * 1000.0,
            upload_elapsed_ms: self.upload_elapsed.as_secs_f64() * 1000.0,
            ping_samples: self.ping_samples,
            started_at: self.started_at,
            completed_at: self.completed_at,
            aborted: self.aborted,
        }
    }

    /// Transition to the terminal state and freeze the result
    pub fn finalize(&mut self, aborted: bool) -> TestResult {
        self.state = if aborted { Phase::Aborted } else { Phase::Finished };
        self.aborted = aborted;
        self.completed_at = Some(Utc::now());
        self.result()
    }
}

//! Test configuration data model and validation

use crate::defaults;
use crate::types::{AppError, Phase, Result, SpeedScale};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Immutable configuration for one measurement run.
///
/// URLs are opaque: whatever resolution or proxying they need is the
/// caller's business, the engine only issues requests against them. A URL
/// is required only for the phases that actually appear in `test_order`.
///
/// Bias factors are multiplicative corrections applied to the raw metric
/// before reporting. They default to 1.0 and exist because deployments
/// tune them empirically against reference meters; treat them as knobs,
/// not derived constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Download endpoint URL (GET, arbitrary-size body)
    #[serde(default)]
    pub download_url: Option<String>,

    /// Upload endpoint URL (POST, body discarded server-side)
    #[serde(default)]
    pub upload_url: Option<String>,

    /// Latency probe endpoint URL (near-zero-byte response)
    #[serde(default)]
    pub ping_url: Option<String>,

    /// Public-address lookup endpoint URL. Not a measurement phase: the
    /// lookup runs on demand, outside the state machine.
    #[serde(default)]
    pub ip_lookup_url: Option<String>,

    /// Phase execution order
    #[serde(default = "default_test_order")]
    pub test_order: Vec<Phase>,

    /// Hard wall-clock budget for the download phase, seconds
    #[serde(default = "default_time_dl_max_secs")]
    pub time_dl_max_secs: u64,

    /// Hard wall-clock budget for the upload phase, seconds
    #[serde(default = "default_time_ul_max_secs")]
    pub time_ul_max_secs: u64,

    /// Hard wall-clock budget for the ping phase, seconds
    #[serde(default = "default_time_ping_max_secs")]
    pub time_ping_max_secs: u64,

    /// Number of latency probes to issue (sequentially)
    #[serde(default = "default_count_ping")]
    pub count_ping: u32,

    /// Concurrent download streams
    #[serde(default = "default_streams_dl")]
    pub streams_dl: u32,

    /// Concurrent upload streams
    #[serde(default = "default_streams_ul")]
    pub streams_ul: u32,

    /// Relative-change threshold for speed stabilization (fractional)
    #[serde(default = "default_stable_threshold")]
    pub stable_threshold: f64,

    /// How long the speed must hold inside the threshold, seconds
    #[serde(default = "default_min_stable_secs")]
    pub min_stable_secs: f64,

    /// Fraction of worst ping samples discarded before aggregation
    #[serde(default = "default_ping_trim_fraction")]
    pub ping_trim_fraction: f64,

    /// Multiplicative correction for reported ping
    #[serde(default = "default_bias")]
    pub ping_bias: f64,

    /// Multiplicative correction for reported jitter
    #[serde(default = "default_bias")]
    pub jitter_bias: f64,

    /// Multiplicative correction for reported download speed
    #[serde(default = "default_bias")]
    pub download_bias: f64,

    /// Multiplicative correction for reported upload speed
    #[serde(default = "default_bias")]
    pub upload_bias: f64,

    /// Keep retrying failed transfers/probes within the phase budget
    #[serde(default = "default_tolerate_errors")]
    pub tolerate_errors: bool,

    /// Report throughput in mebibits (1024*1024) instead of megabits (1e6)
    #[serde(default)]
    pub binary_units: bool,

    /// Timeout for one individual transfer/probe request, seconds.
    /// Distinct from (and much shorter than) the phase budgets, so a
    /// single hung connection cannot starve a phase.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Progress snapshot emission cadence, milliseconds
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,

    /// Size of the upload payload generated once per upload phase
    #[serde(default = "default_upload_payload_bytes")]
    pub upload_payload_bytes: usize,
}

fn default_test_order() -> Vec<Phase> {
    vec![Phase::Ping, Phase::Download, Phase::Upload]
}

fn default_time_dl_max_secs() -> u64 {
    defaults::DEFAULT_TIME_DL_MAX_SECS
}

fn default_time_ul_max_secs() -> u64 {
    defaults::DEFAULT_TIME_UL_MAX_SECS
}

fn default_time_ping_max_secs() -> u64 {
    defaults::DEFAULT_TIME_PING_MAX_SECS
}

fn default_count_ping() -> u32 {
    defaults::DEFAULT_PING_COUNT
}

fn default_streams_dl() -> u32 {
    defaults::DEFAULT_STREAMS_DL
}

fn default_streams_ul() -> u32 {
    defaults::DEFAULT_STREAMS_UL
}

fn default_stable_threshold() -> f64 {
    defaults::DEFAULT_STABLE_THRESHOLD
}

fn default_min_stable_secs() -> f64 {
    defaults::DEFAULT_MIN_STABLE_SECS
}

fn default_ping_trim_fraction() -> f64 {
    defaults::DEFAULT_PING_TRIM_FRACTION
}

fn default_bias() -> f64 {
    1.0
}

fn default_tolerate_errors() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    defaults::DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_update_interval_ms() -> u64 {
    defaults::DEFAULT_UPDATE_INTERVAL_MS
}

fn default_upload_payload_bytes() -> usize {
    defaults::DEFAULT_UPLOAD_PAYLOAD_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_url: None,
            upload_url: None,
            ping_url: None,
            ip_lookup_url: None,
            test_order: default_test_order(),
            time_dl_max_secs: default_time_dl_max_secs(),
            time_ul_max_secs: default_time_ul_max_secs(),
            time_ping_max_secs: default_time_ping_max_secs(),
            count_ping: default_count_ping(),
            streams_dl: default_streams_dl(),
            streams_ul: default_streams_ul(),
            stable_threshold: default_stable_threshold(),
            min_stable_secs: default_min_stable_secs(),
            ping_trim_fraction: default_ping_trim_fraction(),
            ping_bias: default_bias(),
            jitter_bias: default_bias(),
            download_bias: default_bias(),
            upload_bias: default_bias(),
            tolerate_errors: default_tolerate_errors(),
            binary_units: false,
            request_timeout_secs: default_request_timeout_secs(),
            update_interval_ms: default_update_interval_ms(),
            upload_payload_bytes: default_upload_payload_bytes(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a compact order string like `"pdu"` into a phase sequence
    pub fn parse_order(order: &str) -> Result<Vec<Phase>> {
        let mut phases = Vec::with_capacity(order.len());
        for c in order.chars() {
            match Phase::from_order_char(c) {
                Some(phase) => phases.push(phase),
                None => {
                    return Err(AppError::config(format!(
                        "Invalid phase character '{}' in order '{}' (expected p, d or u)",
                        c, order
                    )))
                }
            }
        }
        Ok(phases)
    }

    /// Download phase budget as Duration
    pub fn time_dl_max(&self) -> Duration {
        Duration::from_secs(self.time_dl_max_secs)
    }

    /// Upload phase budget as Duration
    pub fn time_ul_max(&self) -> Duration {
        Duration::from_secs(self.time_ul_max_secs)
    }

    /// Ping phase budget as Duration
    pub fn time_ping_max(&self) -> Duration {
        Duration::from_secs(self.time_ping_max_secs)
    }

    /// Minimum stable duration as Duration
    pub fn min_stable(&self) -> Duration {
        Duration::from_secs_f64(self.min_stable_secs)
    }

    /// Per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Snapshot emission interval as Duration
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Throughput unit basis selected by `binary_units`
    pub fn speed_scale(&self) -> SpeedScale {
        if self.binary_units {
            SpeedScale::Binary
        } else {
            SpeedScale::Decimal
        }
    }

    /// Validate the configuration and return any errors.
    ///
    /// Violations here are fatal at construction; the orchestrator refuses
    /// to start a run with an invalid configuration.
    pub fn validate(&self) -> Result<()> {
        if self.test_order.is_empty() {
            return Err(AppError::config("Test order cannot be empty"));
        }
        for phase in &self.test_order {
            if !phase.is_schedulable() {
                return Err(AppError::config(format!(
                    "Phase '{}' cannot appear in test order",
                    phase.name()
                )));
            }
        }

        // URLs are required (and must parse) for the phases actually scheduled
        if self.test_order.contains(&Phase::Download) {
            Self::validate_url("download", self.download_url.as_deref())?;
        }
        if self.test_order.contains(&Phase::Upload) {
            Self::validate_url("upload", self.upload_url.as_deref())?;
        }
        if self.test_order.contains(&Phase::Ping) {
            Self::validate_url("ping", self.ping_url.as_deref())?;
        }
        // Optional, but must parse when present
        if self.ip_lookup_url.is_some() {
            Self::validate_url("ip lookup", self.ip_lookup_url.as_deref())?;
        }

        if self.streams_dl == 0 || self.streams_ul == 0 {
            return Err(AppError::config("Stream counts must be at least 1"));
        }
        if self.time_dl_max_secs == 0 || self.time_ul_max_secs == 0 || self.time_ping_max_secs == 0
        {
            return Err(AppError::config("Phase durations must be greater than 0"));
        }
        if self.count_ping == 0 {
            return Err(AppError::config("Ping count must be at least 1"));
        }
        if self.request_timeout_secs == 0 {
            return Err(AppError::config("Request timeout must be greater than 0"));
        }
        if self.update_interval_ms == 0 {
            return Err(AppError::config("Update interval must be greater than 0"));
        }
        if self.upload_payload_bytes == 0 {
            return Err(AppError::config("Upload payload size must be greater than 0"));
        }

        if !(self.stable_threshold > 0.0 && self.stable_threshold < 1.0) {
            return Err(AppError::config(
                "Stabilization threshold must be between 0 and 1 (exclusive)",
            ));
        }
        if self.min_stable_secs <= 0.0 {
            return Err(AppError::config("Minimum stable duration must be greater than 0"));
        }
        if !(0.0..1.0).contains(&self.ping_trim_fraction) {
            return Err(AppError::config("Ping trim fraction must be in [0, 1)"));
        }

        for (name, bias) in [
            ("ping_bias", self.ping_bias),
            ("jitter_bias", self.jitter_bias),
            ("download_bias", self.download_bias),
            ("upload_bias", self.upload_bias),
        ] {
            if !(bias.is_finite() && bias > 0.0) {
                return Err(AppError::config(format!(
                    "{} must be a positive finite number, got {}",
                    name, bias
                )));
            }
        }

        Ok(())
    }

    fn validate_url(label: &str, url: Option<&str>) -> Result<()> {
        let url = url.ok_or_else(|| {
            AppError::config(format!("Missing {} URL for a phase present in test order", label))
        })?;
        if url.is_empty() {
            return Err(AppError::config(format!("{} URL cannot be empty", label)));
        }
        url::Url::parse(url)
            .map_err(|e| AppError::config(format!("Invalid {} URL '{}': {}", label, url, e)))?;
        Ok(())
    }

    /// Merge environment variables into this configuration
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("SPM_DOWNLOAD_URL") {
            self.download_url = Some(url);
        }
        if let Ok(url) = std::env::var("SPM_UPLOAD_URL") {
            self.upload_url = Some(url);
        }
        if let Ok(url) = std::env::var("SPM_PING_URL") {
            self.ping_url = Some(url);
        }
        if let Ok(url) = std::env::var("SPM_IP_URL") {
            self.ip_lookup_url = Some(url);
        }
        if let Ok(order) = std::env::var("SPM_TEST_ORDER") {
            self.test_order = Self::parse_order(&order)?;
        }
        if let Ok(streams) = std::env::var("SPM_STREAMS_DL") {
            self.streams_dl = streams
                .parse()
                .map_err(|e| AppError::config(format!("Invalid SPM_STREAMS_DL '{}': {}", streams, e)))?;
        }
        if let Ok(streams) = std::env::var("SPM_STREAMS_UL") {
            self.streams_ul = streams
                .parse()
                .map_err(|e| AppError::config(format!("Invalid SPM_STREAMS_UL '{}': {}", streams, e)))?;
        }
        Ok(())
    }
}

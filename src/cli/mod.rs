//! Command-line interface

use crate::error::{AppError, Result};
use crate::models::config::Config;
use clap::Parser;

/// Client-driven network speed test: latency, jitter, download and upload
#[derive(Parser, Debug, Clone)]
#[command(name = "spm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Download endpoint URL
    #[arg(long, env = "SPM_DOWNLOAD_URL")]
    pub download_url: Option<String>,

    /// Upload endpoint URL
    #[arg(long, env = "SPM_UPLOAD_URL")]
    pub upload_url: Option<String>,

    /// Latency probe endpoint URL
    #[arg(long, env = "SPM_PING_URL")]
    pub ping_url: Option<String>,

    /// Public-address lookup endpoint URL
    #[arg(long, env = "SPM_IP_URL")]
    pub ip_url: Option<String>,

    /// Phase order: p=ping, d=download, u=upload
    #[arg(short, long, default_value = crate::defaults::DEFAULT_ORDER)]
    pub order: String,

    /// Per-phase budget in seconds for the throughput phases
    #[arg(short = 't', long)]
    pub duration: Option<u64>,

    /// Number of latency probes
    #[arg(long)]
    pub pings: Option<u32>,

    /// Concurrent download streams
    #[arg(long)]
    pub download_streams: Option<u32>,

    /// Concurrent upload streams
    #[arg(long)]
    pub upload_streams: Option<u32>,

    /// Report throughput in mebibits (1024*1024) instead of megabits (1e6)
    #[arg(long)]
    pub binary_units: bool,

    /// Stop a phase on the first transfer error instead of retrying
    #[arg(long)]
    pub fail_fast: bool,

    /// Print the final result as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Force colored output
    #[arg(long)]
    pub color: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Enable verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Validate CLI arguments for conflicts and requirements
    pub fn validate(&self) -> Result<()> {
        if self.color && self.no_color {
            return Err(AppError::config("Cannot specify both --color and --no-color"));
        }
        Ok(())
    }

    /// Check if colors should be enabled
    pub fn use_colors(&self) -> bool {
        if self.color {
            true
        } else if self.no_color {
            false
        } else {
            supports_color()
        }
    }

    /// Assemble the engine configuration: environment first, then flags
    pub fn into_config(self) -> Result<Config> {
        let mut config = Config::default();
        config.merge_from_env()?;

        config.test_order = Config::parse_order(&self.order)?;
        if self.download_url.is_some() {
            config.download_url = self.download_url;
        }
        if self.upload_url.is_some() {
            config.upload_url = self.upload_url;
        }
        if self.ping_url.is_some() {
            config.ping_url = self.ping_url;
        }
        if self.ip_url.is_some() {
            config.ip_lookup_url = self.ip_url;
        }
        if let Some(secs) = self.duration {
            config.time_dl_max_secs = secs;
            config.time_ul_max_secs = secs;
        }
        if let Some(pings) = self.pings {
            config.count_ping = pings;
        }
        if let Some(streams) = self.download_streams {
            config.streams_dl = streams;
        }
        if let Some(streams) = self.upload_streams {
            config.streams_ul = streams;
        }
        config.binary_units = self.binary_units;
        if self.fail_fast {
            config.tolerate_errors = false;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Automatic color detection honoring NO_COLOR and dumb terminals
fn supports_color() -> bool {
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }
    match std::env::var("TERM") {
        Ok(term) => term != "dumb",
        Err(_) => true,
    }
}

//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Load-analyzer tick interval
    pub analyzer_interval_ms: u64,
    /// Dispatch-loop poll interval
    pub dispatch_interval_ms: u64,
    pub health_check_interval_secs: u64,
    pub health_check_initial_delay_secs: u64,

    /// Running-mean checker: drain-time floor below which an idle model is
    /// scaled down (0 disables empty-queue scale-down)
    pub min_threshold_secs: f64,
    /// Running-mean checker: drain-time ceiling above which a model is
    /// scaled up
    pub max_threshold_secs: f64,
    /// Sliding-window size for per-item latency samples
    pub latency_window: usize,

    /// Keep a bound stateful session's instance alive this long without a
    /// dispatch before scaling it down
    pub idle_keep_secs: u64,
    /// A locked instance with neither a send nor a receive inside this
    /// window is considered dead
    pub connection_idle_timeout_secs: u64,

    /// Maximum share of the backend's instance budget any single model may
    /// hold, in percent
    pub max_model_percent: f64,
    /// Cool-down after a fatal instance fault before the model is eligible
    /// for a fresh scale-up
    pub cooldown_secs: u64,

    /// Retriable-failure budget per batch before it is failed outright
    pub max_batch_retries: u32,
    /// Capacity of the per-instance channels to the compute unit
    pub channel_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            analyzer_interval_ms: default_analyzer_interval_ms(),
            dispatch_interval_ms: default_dispatch_interval_ms(),
            health_check_interval_secs: default_health_check_interval(),
            health_check_initial_delay_secs: default_health_check_initial_delay(),
            min_threshold_secs: default_min_threshold(),
            max_threshold_secs: default_max_threshold(),
            latency_window: default_latency_window(),
            idle_keep_secs: default_idle_keep(),
            connection_idle_timeout_secs: default_connection_idle_timeout(),
            max_model_percent: default_max_model_percent(),
            cooldown_secs: default_cooldown(),
            max_batch_retries: default_max_batch_retries(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(interval) = std::env::var("SCHEDULER_ANALYZER_INTERVAL_MS") {
            config.analyzer_interval_ms = interval
                .parse()
                .context("Invalid SCHEDULER_ANALYZER_INTERVAL_MS value")?;
        }
        if let Ok(interval) = std::env::var("SCHEDULER_HEALTH_CHECK_INTERVAL") {
            config.health_check_interval_secs = interval
                .parse()
                .context("Invalid SCHEDULER_HEALTH_CHECK_INTERVAL value")?;
        }
        if let Ok(percent) = std::env::var("SCHEDULER_MAX_MODEL_PERCENT") {
            config.max_model_percent = percent
                .parse()
                .context("Invalid SCHEDULER_MAX_MODEL_PERCENT value")?;
        }
        if let Ok(cooldown) = std::env::var("SCHEDULER_COOLDOWN_SECS") {
            config.cooldown_secs = cooldown
                .parse()
                .context("Invalid SCHEDULER_COOLDOWN_SECS value")?;
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.analyzer_interval_ms == 0 {
            anyhow::bail!("analyzer_interval_ms must be > 0");
        }
        if self.dispatch_interval_ms == 0 {
            anyhow::bail!("dispatch_interval_ms must be > 0");
        }
        if self.min_threshold_secs < 0.0 {
            anyhow::bail!(
                "min_threshold_secs must be >= 0 (got {})",
                self.min_threshold_secs
            );
        }
        if self.max_threshold_secs <= self.min_threshold_secs {
            anyhow::bail!(
                "max_threshold_secs ({}) must exceed min_threshold_secs ({})",
                self.max_threshold_secs,
                self.min_threshold_secs
            );
        }
        if self.latency_window == 0 {
            anyhow::bail!("latency_window must be > 0");
        }
        if self.max_model_percent <= 0.0 || self.max_model_percent > 100.0 {
            anyhow::bail!(
                "max_model_percent must be in (0, 100] (got {})",
                self.max_model_percent
            );
        }
        if self.channel_capacity == 0 {
            anyhow::bail!("channel_capacity must be > 0");
        }

        Ok(())
    }
}

// Default functions
fn default_analyzer_interval_ms() -> u64 {
    1000
}
fn default_dispatch_interval_ms() -> u64 {
    50
}
fn default_health_check_interval() -> u64 {
    30
}
fn default_health_check_initial_delay() -> u64 {
    10
}
fn default_min_threshold() -> f64 {
    1.0
}
fn default_max_threshold() -> f64 {
    10.0
}
fn default_latency_window() -> usize {
    64
}
fn default_idle_keep() -> u64 {
    300
}
fn default_connection_idle_timeout() -> u64 {
    120
}
fn default_max_model_percent() -> f64 {
    50.0
}
fn default_cooldown() -> u64 {
    60
}
fn default_max_batch_retries() -> u32 {
    3
}
fn default_channel_capacity() -> usize {
    32
}

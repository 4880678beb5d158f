//! Pool configuration.
//!
//! Mirrors every option in the facade's configuration table, nested into
//! per-component structs with `#[serde(default = ...)]` on each field so
//! a partial TOML document is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub autoscaler: AutoscalerConfig,

    #[serde(default)]
    pub event: EventConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            autoscaler: AutoscalerConfig::default(),
            event: EventConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn development() -> Self {
        Self {
            worker: WorkerConfig {
                min_pool_size: 1,
                max_pool_size: 2,
                max_attempts: 2,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 20,
                ..Default::default()
            },
            ..Self::default()
        }
    }

    pub fn production() -> Self {
        Self {
            worker: WorkerConfig {
                min_pool_size: 4,
                max_pool_size: 32,
                max_attempts: 5,
                ..Default::default()
            },
            queue: QueueConfig {
                capacity: 320,
                ..Default::default()
            },
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: std::sync::Arc::new(e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.min_pool_size == 0 {
            return Err(ConfigError::Invalid("min_pool_size must be >= 1".into()));
        }
        if self.worker.max_pool_size < self.worker.min_pool_size {
            return Err(ConfigError::Invalid(
                "max_pool_size must be >= min_pool_size".into(),
            ));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be >= 1".into()));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be >= 1".into()));
        }
        if self.autoscaler.scale_up_threshold <= 0.0 {
            return Err(ConfigError::Invalid(
                "scale_up_threshold must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.autoscaler.scale_down_idle_ratio) {
            return Err(ConfigError::Invalid(
                "scale_down_idle_ratio must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_cancel_poll_interval_ms")]
    pub cancel_poll_interval_ms: u64,

    #[serde(default = "default_progress_min_interval_ms")]
    pub progress_min_interval_ms: u64,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_pool_size: default_min_pool_size(),
            max_pool_size: default_max_pool_size(),
            max_attempts: default_max_attempts(),
            cancel_poll_interval_ms: default_cancel_poll_interval_ms(),
            progress_min_interval_ms: default_progress_min_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_backoff_secs")]
    pub base_backoff_secs: u64,

    #[serde(default = "default_retry_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: default_retry_base_backoff_secs(),
            max_backoff_secs: default_retry_max_backoff_secs(),
        }
    }
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs(self.base_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    #[serde(default = "default_autoscale_tick_interval_secs")]
    pub tick_interval_secs: u64,

    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: f64,

    #[serde(default = "default_scale_up_step_ratio")]
    pub scale_up_step_ratio: f64,

    #[serde(default = "default_scale_up_cooldown_secs")]
    pub scale_up_cooldown_secs: u64,

    #[serde(default = "default_scale_down_idle_ratio")]
    pub scale_down_idle_ratio: f64,

    #[serde(default = "default_scale_down_observation_secs")]
    pub scale_down_observation_secs: u64,

    #[serde(default = "default_scale_down_step")]
    pub scale_down_step: usize,

    #[serde(default = "default_scale_down_cooldown_secs")]
    pub scale_down_cooldown_secs: u64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_autoscale_tick_interval_secs(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_up_step_ratio: default_scale_up_step_ratio(),
            scale_up_cooldown_secs: default_scale_up_cooldown_secs(),
            scale_down_idle_ratio: default_scale_down_idle_ratio(),
            scale_down_observation_secs: default_scale_down_observation_secs(),
            scale_down_step: default_scale_down_step(),
            scale_down_cooldown_secs: default_scale_down_cooldown_secs(),
        }
    }
}

impl AutoscalerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn scale_up_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_up_cooldown_secs)
    }

    pub fn scale_down_observation(&self) -> Duration {
        Duration::from_secs(self.scale_down_observation_secs)
    }

    pub fn scale_down_cooldown(&self) -> Duration {
        Duration::from_secs(self.scale_down_cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    #[serde(default = "default_terminal_publish_retries")]
    pub terminal_publish_retries: u32,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            terminal_publish_retries: default_terminal_publish_retries(),
        }
    }
}

fn default_min_pool_size() -> usize {
    1
}
fn default_max_pool_size() -> usize {
    8
}
fn default_max_attempts() -> u32 {
    3
}
fn default_cancel_poll_interval_ms() -> u64 {
    500
}
fn default_progress_min_interval_ms() -> u64 {
    1000
}
fn default_shutdown_grace_secs() -> u64 {
    30
}
fn default_queue_capacity() -> usize {
    80
}
fn default_retry_base_backoff_secs() -> u64 {
    1
}
fn default_retry_max_backoff_secs() -> u64 {
    60
}
fn default_autoscale_tick_interval_secs() -> u64 {
    5
}
fn default_scale_up_threshold() -> f64 {
    2.0
}
fn default_scale_up_step_ratio() -> f64 {
    0.5
}
fn default_scale_up_cooldown_secs() -> u64 {
    10
}
fn default_scale_down_idle_ratio() -> f64 {
    0.5
}
fn default_scale_down_observation_secs() -> u64 {
    60
}
fn default_scale_down_step() -> usize {
    1
}
fn default_scale_down_cooldown_secs() -> u64 {
    60
}
fn default_terminal_publish_retries() -> u32 {
    3
}

//! vqueue.toml configuration parser.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::types::validate_queue_name;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VqueueConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub defaults: ScalingDefaults,
    #[serde(default, rename = "queue")]
    pub queues: Vec<QueueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Capacity of every physical queue the backend creates.
    #[serde(default = "default_max_size_megabytes")]
    pub max_size_megabytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDefaults {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub threshold: Option<f64>,
    pub poll_interval: Option<String>,
}

/// Fully-resolved settings for one virtual queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub name: String,
    pub threshold: f64,
    pub poll_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_size_megabytes: default_max_size_megabytes(),
        }
    }
}

impl Default for ScalingDefaults {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/vqueue")
}

fn default_max_size_megabytes() -> u64 {
    1024
}

fn default_threshold() -> f64 {
    0.8
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

impl VqueueConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: VqueueConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every value a running agent would depend on.
    pub fn validate(&self) -> QueueResult<()> {
        if self.backend.max_size_megabytes == 0 {
            return Err(QueueError::Configuration(
                "backend.max_size_megabytes must be positive".into(),
            ));
        }
        validate_threshold(self.defaults.threshold)?;
        parse_duration(&self.defaults.poll_interval)?;

        let mut seen = HashSet::new();
        for queue in &self.queues {
            validate_queue_name(&queue.name)
                .map_err(|e| QueueError::Configuration(e.to_string()))?;
            if !seen.insert(queue.name.as_str()) {
                return Err(QueueError::Configuration(format!(
                    "duplicate queue {:?}",
                    queue.name
                )));
            }
        }
        self.queue_settings().map(|_| ())
    }

    /// Resolve per-queue settings, applying defaults where a queue does not
    /// override them.
    pub fn queue_settings(&self) -> QueueResult<Vec<QueueSettings>> {
        self.queues
            .iter()
            .map(|q| {
                let threshold = validate_threshold(q.threshold.unwrap_or(self.defaults.threshold))?;
                let interval = q
                    .poll_interval
                    .as_deref()
                    .unwrap_or(&self.defaults.poll_interval);
                Ok(QueueSettings {
                    name: q.name.clone(),
                    threshold,
                    poll_interval: parse_duration(interval)?,
                })
            })
            .collect()
    }
}

/// A scale-out threshold must lie in `(0, 1]`.
pub fn validate_threshold(threshold: f64) -> QueueResult<f64> {
    if threshold.is_finite() && threshold > 0.0 && threshold <= 1.0 {
        Ok(threshold)
    } else {
        Err(QueueError::Configuration(format!(
            "threshold {threshold} must be in (0, 1]"
        )))
    }
}

/// Parse a duration like "500ms", "30s", "5m". A bare number is seconds.
pub fn parse_duration(s: &str) -> QueueResult<Duration> {
    let s = s.trim();
    let invalid = || QueueError::Configuration(format!("invalid duration {s:?}"));

    let duration = if let Some(ms) = s.strip_suffix("ms") {
        Duration::from_millis(ms.parse::<u64>().map_err(|_| invalid())?)
    } else if let Some(secs) = s.strip_suffix('s') {
        Duration::from_secs(secs.parse::<u64>().map_err(|_| invalid())?)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().map_err(|_| invalid())?;
        Duration::from_secs(mins.checked_mul(60).ok_or_else(invalid)?)
    } else {
        Duration::from_secs(s.parse::<u64>().map_err(|_| invalid())?)
    };

    if duration.is_zero() {
        return Err(QueueError::Configuration(format!(
            "duration {s:?} must be positive"
        )));
    }
    Ok(duration)
}

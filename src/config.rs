//! Serde-backed scheduler configuration.

use crate::error::ConfigError;
use crate::job::JobDefinition;

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_WORKERS: usize = 5;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

fn default_max_workers() -> usize {
  DEFAULT_MAX_WORKERS
}

fn default_shutdown_grace_secs() -> u64 {
  DEFAULT_SHUTDOWN_GRACE_SECS
}

/// Scheduler settings plus the declared job list.
///
/// ```json
/// {
///   "maxWorkers": 5,
///   "shutdownGraceSecs": 30,
///   "shared": { "proxy": "http://proxy.local:3128" },
///   "jobs": [
///     {
///       "name": "PostalCodes",
///       "description": "Fetch postal codes",
///       "normalScheduleCron": "0 0 3 * * ?",
///       "failureScheduleCron": "0 0 */1 * * ?",
///       "maxRetries": 1,
///       "payload": { "sourceUrl": "https://example.org/postal-codes.csv" }
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
  #[serde(default = "default_max_workers")]
  pub max_workers: usize,
  #[serde(default = "default_shutdown_grace_secs")]
  pub shutdown_grace_secs: u64,
  /// Blob handed to every job body (proxy settings and similar).
  #[serde(default)]
  pub shared: Value,
  #[serde(default)]
  pub jobs: Vec<JobDefinition>,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      max_workers: DEFAULT_MAX_WORKERS,
      shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
      shared: Value::Null,
      jobs: Vec::new(),
    }
  }
}

impl SchedulerConfig {
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&json)
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_secs(self.shutdown_grace_secs)
  }

  /// Structural checks only; schedules and payloads are checked by
  /// `JobScheduler::initialize` against the registry.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_workers == 0 {
      return Err(ConfigError::Invalid("maxWorkers must be greater than zero".into()));
    }
    if let Some(job) = self.jobs.iter().find(|job| job.name.trim().is_empty()) {
      return Err(ConfigError::Invalid(format!(
        "job with description '{}' has an empty name",
        job.description
      )));
    }
    Ok(())
  }
}

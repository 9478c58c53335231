use crate::job::{JobKey, TriggerKey};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while building a scheduler with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("Maximum worker count (`max_workers`) must be greater than zero")]
  ZeroMaxWorkers,
  #[error("A schedule store must be supplied before building the scheduler")]
  MissingStore,
}

/// A cron expression could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid cron expression '{expression}': {reason}")]
pub struct CronError {
  pub expression: String,
  pub reason: String,
}

/// Errors raised by a `ScheduleStore` implementation.
///
/// Any of these surfacing from a reconcile pass is fatal to initialization.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("store I/O failed for {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("store document could not be (de)serialized: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("job {0} already exists in the store")]
  JobAlreadyExists(JobKey),
  #[error("trigger {0} already exists in the store")]
  TriggerAlreadyExists(TriggerKey),
  #[error("store unavailable: {0}")]
  Unavailable(String),
}

/// Errors that prevent the scheduler from initializing (or re-initializing on reload).
#[derive(Error, Debug)]
pub enum InitError {
  #[error("Scheduler has already been initialized.")]
  AlreadyInitialized,
  #[error("Scheduler has not been initialized; call `initialize` first.")]
  NotInitialized,
  #[error("Job '{0}' is declared but no job body is registered under that name.")]
  UnknownJobType(String),
  #[error("Job '{0}' is declared more than once.")]
  DuplicateJob(String),
  #[error("Job '{job}' has an invalid schedule: {source}")]
  InvalidSchedule {
    job: String,
    #[source]
    source: CronError,
  },
  #[error("Job '{job}' payload does not bind to {payload_type}: {reason}")]
  PayloadBinding {
    job: String,
    payload_type: &'static str,
    reason: String,
  },
  #[error("Schedule store failure during reconciliation: {0}")]
  Store(#[from] StoreError),
}

/// Errors returned synchronously to callers of operator actions
/// (force-run, pause, resume, restart, start, ...).
#[derive(Error, Debug)]
pub enum OperatorError {
  #[error("Scheduler has not been initialized.")]
  NotInitialized,
  #[error("Scheduler is not running.")]
  NotRunning,
  #[error("Scheduler is already running.")]
  AlreadyRunning,
  #[error("Scheduler is degraded after a failed shutdown and needs operator attention.")]
  Degraded,
  #[error("Job '{0}' is not scheduled.")]
  JobNotScheduled(String),
  #[error("Job key {0} not found.")]
  JobKeyNotFound(JobKey),
  #[error("Trigger {0} not found.")]
  TriggerNotFound(TriggerKey),
  #[error("Job '{0}' is already running.")]
  JobAlreadyRunning(String),
  #[error("Scheduler coordinator is shut down.")]
  SchedulerShutdown,
  #[error("Scheduler coordinator did not respond.")]
  ResponseFailed,
  #[error(transparent)]
  Init(#[from] InitError),
  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors related to stopping the scheduler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Timed out after {0:?} waiting for in-flight jobs to finish.")]
  Timeout(Duration),
  #[error("A worker or coordinator task panicked during the shutdown process.")]
  TaskPanic,
}

/// Errors loading a `SchedulerConfig`.
#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),
  #[error("invalid config: {0}")]
  Invalid(String),
}

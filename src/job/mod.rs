#[cfg(feature = "job_context")]
pub mod context;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::TriggerState;

// --- Public Type Aliases ---

/// Unique identifier of a single fire (regular or forced) of a trigger.
/// Uses UUID v4.
pub type FireInstanceId = Uuid;

pub type MaxRetries = u32;

/// Type alias for the simple numeric ID assigned to worker tasks for logging.
pub(crate) type WorkerId = usize;

/// Error type returned by job bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a job body resolves to. `Err` is recorded as a failed execution.
pub type JobResult = Result<(), BoxError>;

/// The function type that job bodies are erased to.
///
/// Built by [`JobRegistry::register`](crate::registry::JobRegistry::register);
/// panics inside the returned future are caught by the worker and treated as failures.
pub type BoxedJobFn = Box<
  dyn Fn(JobInvocation) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'static>>
    + Send
    + Sync
    + 'static,
>;

// --- Keys ---

/// Store key of a persisted job record, derived as `"<Name>Job"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
  pub fn for_job(name: &str) -> Self {
    Self(format!("{name}Job"))
  }

  /// Wraps a raw key as found in the store.
  pub fn new(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for JobKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Store key of a persisted trigger record, derived as `"<Name>Trigger"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerKey(String);

impl TriggerKey {
  pub fn for_job(name: &str) -> Self {
    Self(format!("{name}Trigger"))
  }

  pub fn new(raw: impl Into<String>) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TriggerKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// --- Declared configuration ---

/// A declared job, loaded once from configuration.
///
/// The serialized field names follow the declared-configuration format:
/// `{name, description, normalScheduleCron, failureScheduleCron, maxRetries, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
  /// Unique job name. Must match a name registered in the `JobRegistry`.
  pub name: String,
  #[serde(default)]
  pub description: String,
  /// Cron expression used while the job is healthy.
  #[serde(rename = "normalScheduleCron")]
  pub normal_schedule: String,
  /// Cron expression used once failures accumulate (or while paused).
  #[serde(rename = "failureScheduleCron")]
  pub failure_schedule: String,
  #[serde(default)]
  pub max_retries: MaxRetries,
  /// Opaque, job-type-specific configuration.
  #[serde(default)]
  pub payload: Value,
}

impl JobDefinition {
  pub fn new(
    name: &str,
    normal_schedule: &str,
    failure_schedule: &str,
    max_retries: MaxRetries,
  ) -> Self {
    Self {
      name: name.to_string(),
      description: String::new(),
      normal_schedule: normal_schedule.to_string(),
      failure_schedule: failure_schedule.to_string(),
      max_retries,
      payload: Value::Null,
    }
  }

  pub fn with_description(mut self, description: &str) -> Self {
    self.description = description.to_string();
    self
  }

  pub fn with_payload(mut self, payload: Value) -> Self {
    self.payload = payload;
    self
  }

  pub fn job_key(&self) -> JobKey {
    JobKey::for_job(&self.name)
  }

  pub fn trigger_key(&self) -> TriggerKey {
    TriggerKey::for_job(&self.name)
  }

  pub fn scheduling_config(&self) -> SchedulingConfig {
    SchedulingConfig {
      normal_schedule: self.normal_schedule.clone(),
      failure_schedule: self.failure_schedule.clone(),
      max_retries: self.max_retries,
    }
  }
}

/// The scheduling fields of a definition, as snapshotted into the job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingConfig {
  pub normal_schedule: String,
  pub failure_schedule: String,
  pub max_retries: MaxRetries,
}

/// Persisted copy of a job payload, tagged with the payload type it was registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
  pub payload_type: String,
  pub value: Value,
}

// --- Execution ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
  /// Fired by the trigger's cron schedule.
  Regular,
  /// Fired out-of-band by an operator.
  Forced,
}

impl fmt::Display for ExecutionType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ExecutionType::Regular => f.write_str("Regular"),
      ExecutionType::Forced => f.write_str("Forced"),
    }
  }
}

/// What a job body receives when it runs.
#[derive(Debug, Clone)]
pub struct JobInvocation {
  pub job_name: String,
  /// The persisted job data (a copy of the declared payload).
  pub job_data: Value,
  pub is_forced: bool,
  /// Shared configuration supplied to the builder (proxy settings and similar).
  pub shared: Arc<Value>,
}

/// Result of a single execution, as reported to the schedule state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOutcome {
  Success,
  Failure { error: String },
}

impl ExecutionOutcome {
  pub fn is_success(&self) -> bool {
    matches!(self, ExecutionOutcome::Success)
  }

  pub fn status(&self) -> &'static str {
    match self {
      ExecutionOutcome::Success => "Success",
      ExecutionOutcome::Failure { .. } => "Failure",
    }
  }
}

// --- Public Snapshot Structs for Querying ---

/// One row of `JobScheduler::list_jobs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
  pub name: String,
  /// The currently active cron expression (normal or failure schedule).
  pub cron_expression: String,
  pub state: TriggerState,
  pub last_fire_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  pub regular_schedule: String,
  pub failure_schedule: String,
  pub retry_limit: MaxRetries,
  pub failure_count: u32,
}

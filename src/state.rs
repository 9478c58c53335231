//! Schedule state machine.
//!
//! Decides which cron expression is active for a job, and how execution
//! outcomes move the consecutive-failure counter. Trigger state transitions
//! (pause, resume, fire admission and release) are defined here too; the store
//! applies them atomically.

use crate::job::{ExecutionOutcome, ExecutionType};
use crate::store::{JobRecord, LastOutcome, TriggerState};

use chrono::{DateTime, Utc};

impl TriggerState {
  pub fn is_blocked(self) -> bool {
    matches!(self, TriggerState::Blocked | TriggerState::PausedBlocked)
  }

  pub fn is_paused(self) -> bool {
    matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
  }

  pub(crate) fn paused(self) -> Self {
    match self {
      TriggerState::Normal => TriggerState::Paused,
      TriggerState::Blocked => TriggerState::PausedBlocked,
      other => other,
    }
  }

  pub(crate) fn resumed(self) -> Self {
    match self {
      TriggerState::Paused => TriggerState::Normal,
      TriggerState::PausedBlocked => TriggerState::Blocked,
      other => other,
    }
  }

  pub(crate) fn blocked(self) -> Self {
    match self {
      TriggerState::Normal => TriggerState::Blocked,
      TriggerState::Paused => TriggerState::PausedBlocked,
      other => other,
    }
  }

  pub(crate) fn released(self) -> Self {
    match self {
      TriggerState::Blocked => TriggerState::Normal,
      TriggerState::PausedBlocked => TriggerState::Paused,
      other => other,
    }
  }
}

/// Which of the two declared schedules is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveSchedule {
  Normal,
  Failure,
}

/// Derives the active schedule from the failure counter and the trigger state.
///
/// The failure schedule applies while failures are outstanding or the trigger
/// is paused.
pub fn active_schedule(consecutive_failures: u32, state: TriggerState) -> ActiveSchedule {
  if consecutive_failures > 0 || state.is_paused() {
    ActiveSchedule::Failure
  } else {
    ActiveSchedule::Normal
  }
}

/// The cron expression a job's trigger should carry right now.
pub fn derive_active_cron(job: &JobRecord, state: TriggerState) -> &str {
  match active_schedule(job.consecutive_failures, state) {
    ActiveSchedule::Normal => &job.scheduling.normal_schedule,
    ActiveSchedule::Failure => &job.scheduling.failure_schedule,
  }
}

/// Result of applying an execution outcome to a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutcomeTransition {
  pub consecutive_failures: u32,
  /// The failure count has passed `max_retries`. Scheduling continues on the
  /// failure schedule; this only drives logging and metrics.
  pub exceeded_retries: bool,
}

/// Updates the failure counter and last outcome of `job`.
pub fn apply_outcome(
  job: &mut JobRecord,
  outcome: &ExecutionOutcome,
  execution_type: ExecutionType,
  finished_at: DateTime<Utc>,
) -> OutcomeTransition {
  job.consecutive_failures = if outcome.is_success() {
    0
  } else {
    job.consecutive_failures.saturating_add(1)
  };
  job.last_outcome = Some(LastOutcome {
    finished_at,
    execution_type,
    outcome: outcome.clone(),
  });

  OutcomeTransition {
    consecutive_failures: job.consecutive_failures,
    exceeded_retries: job.consecutive_failures > job.scheduling.max_retries,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{JobData, JobKey, SchedulingConfig};
  use serde_json::Value;

  fn record(max_retries: u32) -> JobRecord {
    JobRecord {
      key: JobKey::for_job("PostalCodes"),
      description: String::new(),
      scheduling: SchedulingConfig {
        normal_schedule: "0 0 3 * * ?".into(),
        failure_schedule: "0 0 */1 * * ?".into(),
        max_retries,
      },
      job_data: JobData {
        payload_type: "unit".into(),
        value: Value::Null,
      },
      consecutive_failures: 0,
      created_at: Utc::now(),
      last_outcome: None,
    }
  }

  fn failure() -> ExecutionOutcome {
    ExecutionOutcome::Failure {
      error: "boom".into(),
    }
  }

  #[test]
  fn failure_switches_to_failure_schedule_and_success_switches_back() {
    let mut job = record(3);
    assert_eq!(derive_active_cron(&job, TriggerState::Normal), "0 0 3 * * ?");

    let t = apply_outcome(&mut job, &failure(), ExecutionType::Regular, Utc::now());
    assert_eq!(t.consecutive_failures, 1);
    assert!(!t.exceeded_retries);
    assert_eq!(derive_active_cron(&job, TriggerState::Normal), "0 0 */1 * * ?");

    let t = apply_outcome(&mut job, &ExecutionOutcome::Success, ExecutionType::Regular, Utc::now());
    assert_eq!(t.consecutive_failures, 0);
    assert_eq!(derive_active_cron(&job, TriggerState::Normal), "0 0 3 * * ?");
  }

  #[test]
  fn retries_exceeded_only_after_max() {
    let mut job = record(1);
    assert!(!apply_outcome(&mut job, &failure(), ExecutionType::Regular, Utc::now()).exceeded_retries);
    assert!(apply_outcome(&mut job, &failure(), ExecutionType::Regular, Utc::now()).exceeded_retries);
    assert_eq!(derive_active_cron(&job, TriggerState::Normal), "0 0 */1 * * ?");
  }

  #[test]
  fn paused_trigger_derives_failure_schedule() {
    let job = record(3);
    assert_eq!(derive_active_cron(&job, TriggerState::Paused), "0 0 */1 * * ?");
    assert_eq!(derive_active_cron(&job, TriggerState::PausedBlocked), "0 0 */1 * * ?");
  }

  #[test]
  fn state_transitions() {
    assert_eq!(TriggerState::Normal.paused(), TriggerState::Paused);
    assert_eq!(TriggerState::Blocked.paused(), TriggerState::PausedBlocked);
    assert_eq!(TriggerState::PausedBlocked.released(), TriggerState::Paused);
    assert_eq!(TriggerState::PausedBlocked.resumed(), TriggerState::Blocked);
    assert_eq!(TriggerState::Paused.blocked(), TriggerState::PausedBlocked);
    assert_eq!(TriggerState::Complete.resumed(), TriggerState::Complete);
    assert_eq!(TriggerState::Error.paused(), TriggerState::Error);
  }
}

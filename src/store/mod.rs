//! Persistent schedule store - the boundary the scheduler core runs on.
//!
//! This module defines the `ScheduleStore` trait, the persisted record types,
//! and two implementations:
//! - `MemoryStore`: in-process, for tests and ephemeral deployments
//! - `JsonFileStore`: a single JSON document rewritten atomically on every mutation
//!
//! Every trait method is individually atomic. The store is the single source of
//! truth; the coordinator and reconciler never cache records across calls.

mod json;
mod memory;

pub use json::JsonFileStore;
pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::job::{
  ExecutionOutcome, ExecutionType, FireInstanceId, JobData, JobKey, SchedulingConfig, TriggerKey,
};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fire state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerState {
  /// Scheduled and eligible to fire on its cron expression.
  Normal,
  /// Not eligible to fire; the cron expression is frozen.
  Paused,
  /// A fire is in flight.
  Blocked,
  /// Paused while a fire was in flight.
  PausedBlocked,
  Complete,
  Error,
}

/// Schedule type of a persisted trigger. Only `Cron` triggers are produced by
/// this crate; anything else found in the store is replaced on reconcile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerKind {
  Cron,
  Simple { repeat_interval_secs: u64 },
}

/// What to do with fire times missed while the scheduler was not running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MisfirePolicy {
  /// Fire once as soon as possible, then proceed from the next regular time;
  /// any further missed fires are skipped.
  FireAndProceed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
  pub key: TriggerKey,
  pub job_key: Option<JobKey>,
  pub kind: TriggerKind,
  /// Currently active expression: the normal or the failure schedule.
  pub cron_expression: String,
  pub state: TriggerState,
  pub previous_fire_time: Option<DateTime<Utc>>,
  pub next_fire_time: Option<DateTime<Utc>>,
  pub start_time: DateTime<Utc>,
  pub misfire_policy: MisfirePolicy,
  pub time_zone: String,
  /// Set while `Blocked`/`PausedBlocked`.
  pub fire_instance: Option<FireInstanceId>,
}

impl TriggerRecord {
  /// A fresh cron trigger in the `Normal` state.
  pub fn cron(
    key: TriggerKey,
    job_key: JobKey,
    cron_expression: &str,
    start_time: DateTime<Utc>,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> Self {
    Self {
      key,
      job_key: Some(job_key),
      kind: TriggerKind::Cron,
      cron_expression: cron_expression.to_string(),
      state: TriggerState::Normal,
      previous_fire_time: None,
      next_fire_time,
      start_time,
      misfire_policy: MisfirePolicy::FireAndProceed,
      time_zone: "UTC".to_string(),
      fire_instance: None,
    }
  }
}

/// The most recent execution of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOutcome {
  pub finished_at: DateTime<Utc>,
  pub execution_type: ExecutionType,
  pub outcome: ExecutionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
  pub key: JobKey,
  /// Copy of the declared description at creation time.
  pub description: String,
  pub scheduling: SchedulingConfig,
  pub job_data: JobData,
  pub consecutive_failures: u32,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub last_outcome: Option<LastOutcome>,
}

/// Kind of fire requested from [`ScheduleStore::begin_fire`].
pub enum FireRequest<'a> {
  /// A cron fire. Admitted only for a `Normal` trigger that is due at `now`.
  /// `next_fire` computes the new `next_fire_time` from the admitted trigger.
  Regular {
    now: DateTime<Utc>,
    next_fire: &'a (dyn Fn(&TriggerRecord) -> Option<DateTime<Utc>> + Sync),
  },
  /// An out-of-band fire. Admitted for `Normal` and `Paused` triggers; fire
  /// times are left untouched.
  Forced,
}

/// Result of a fire admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireAdmission {
  /// The trigger is now blocked for this fire.
  Admitted(TriggerRecord),
  /// Another fire of this trigger is still in flight.
  InFlight,
  NotEligible(TriggerState),
  /// Not due yet; carries the stored next fire time.
  NotDue(Option<DateTime<Utc>>),
  Missing,
}

/// Trait for schedule store backends.
///
/// Implementations must be thread-safe and must serialize concurrent access
/// themselves.
pub trait ScheduleStore: Send + Sync {
  fn get_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, StoreError>;

  fn get_job(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError>;

  /// All triggers whose `job_key` is `job_key`.
  fn triggers_of_job(&self, job_key: &JobKey) -> Result<Vec<TriggerRecord>, StoreError>;

  fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StoreError>;

  fn job_keys(&self) -> Result<Vec<JobKey>, StoreError>;

  /// Stores a new job together with its trigger. Fails if either key exists.
  fn schedule_job(&self, job: JobRecord, trigger: TriggerRecord) -> Result<(), StoreError>;

  /// Inserts or replaces a job record.
  fn store_job(&self, job: JobRecord) -> Result<(), StoreError>;

  /// Inserts or replaces a trigger record.
  fn store_trigger(&self, trigger: TriggerRecord) -> Result<(), StoreError>;

  /// Removes a trigger. Returns whether it existed.
  fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, StoreError>;

  /// Removes a job and every trigger pointing at it. Returns whether the job existed.
  fn delete_job(&self, key: &JobKey) -> Result<bool, StoreError>;

  /// Replaces the active cron expression and next fire time in place.
  /// Key, job reference and state are kept. Returns whether the trigger existed.
  fn reschedule_job(
    &self,
    key: &TriggerKey,
    cron_expression: &str,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError>;

  fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

  fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;

  fn pause_all(&self) -> Result<(), StoreError>;

  fn resume_all(&self) -> Result<(), StoreError>;

  /// Atomically admits a fire, marking the trigger blocked for `instance`.
  fn begin_fire(
    &self,
    key: &TriggerKey,
    instance: FireInstanceId,
    request: FireRequest<'_>,
  ) -> Result<FireAdmission, StoreError>;

  /// Releases the block held by `instance` (any instance when `None`).
  /// Returns the released trigger, or `None` if the trigger is gone or is
  /// held by a different fire.
  fn release_fire(
    &self,
    key: &TriggerKey,
    instance: Option<FireInstanceId>,
  ) -> Result<Option<TriggerRecord>, StoreError>;

  fn trigger_state(&self, key: &TriggerKey) -> Result<Option<TriggerState>, StoreError> {
    Ok(self.get_trigger(key)?.map(|t| t.state))
  }
}

/// Plain contents of a store. Also the on-disk document body of `JsonFileStore`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
  pub jobs: BTreeMap<JobKey, JobRecord>,
  pub triggers: BTreeMap<TriggerKey, TriggerRecord>,
}

impl StoreSnapshot {
  fn schedule_job(&mut self, job: JobRecord, trigger: TriggerRecord) -> Result<(), StoreError> {
    if self.jobs.contains_key(&job.key) {
      return Err(StoreError::JobAlreadyExists(job.key));
    }
    if self.triggers.contains_key(&trigger.key) {
      return Err(StoreError::TriggerAlreadyExists(trigger.key));
    }
    self.jobs.insert(job.key.clone(), job);
    self.triggers.insert(trigger.key.clone(), trigger);
    Ok(())
  }

  fn triggers_of_job(&self, job_key: &JobKey) -> Vec<TriggerRecord> {
    self
      .triggers
      .values()
      .filter(|t| t.job_key.as_ref() == Some(job_key))
      .cloned()
      .collect()
  }

  fn delete_job(&mut self, key: &JobKey) -> bool {
    self.triggers.retain(|_, t| t.job_key.as_ref() != Some(key));
    self.jobs.remove(key).is_some()
  }

  fn reschedule_job(
    &mut self,
    key: &TriggerKey,
    cron_expression: &str,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> bool {
    match self.triggers.get_mut(key) {
      Some(trigger) => {
        trigger.cron_expression = cron_expression.to_string();
        trigger.next_fire_time = next_fire_time;
        true
      }
      None => false,
    }
  }

  fn update_state(&mut self, key: &TriggerKey, f: impl Fn(TriggerState) -> TriggerState) -> bool {
    match self.triggers.get_mut(key) {
      Some(trigger) => {
        trigger.state = f(trigger.state);
        true
      }
      None => false,
    }
  }

  fn update_all_states(&mut self, f: impl Fn(TriggerState) -> TriggerState) {
    for trigger in self.triggers.values_mut() {
      trigger.state = f(trigger.state);
    }
  }

  fn begin_fire(
    &mut self,
    key: &TriggerKey,
    instance: FireInstanceId,
    request: FireRequest<'_>,
  ) -> FireAdmission {
    let Some(trigger) = self.triggers.get_mut(key) else {
      return FireAdmission::Missing;
    };
    if trigger.state.is_blocked() {
      return FireAdmission::InFlight;
    }
    match request {
      FireRequest::Regular { now, next_fire } => {
        if trigger.state != TriggerState::Normal {
          return FireAdmission::NotEligible(trigger.state);
        }
        match trigger.next_fire_time {
          Some(due) if due <= now => {}
          other => return FireAdmission::NotDue(other),
        }
        trigger.previous_fire_time = Some(now);
        trigger.next_fire_time = next_fire(trigger);
      }
      FireRequest::Forced => {
        if !matches!(trigger.state, TriggerState::Normal | TriggerState::Paused) {
          return FireAdmission::NotEligible(trigger.state);
        }
      }
    }
    trigger.state = trigger.state.blocked();
    trigger.fire_instance = Some(instance);
    FireAdmission::Admitted(trigger.clone())
  }

  fn release_fire(
    &mut self,
    key: &TriggerKey,
    instance: Option<FireInstanceId>,
  ) -> Option<TriggerRecord> {
    let trigger = self.triggers.get_mut(key)?;
    if let Some(instance) = instance {
      if trigger.fire_instance != Some(instance) {
        return None;
      }
    }
    trigger.state = trigger.state.released();
    trigger.fire_instance = None;
    Some(trigger.clone())
  }
}

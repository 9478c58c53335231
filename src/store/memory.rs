use super::{
  FireAdmission, FireRequest, JobRecord, ScheduleStore, StoreSnapshot, TriggerRecord,
};
use crate::error::StoreError;
use crate::job::{FireInstanceId, JobKey, TriggerKey};
use crate::store::TriggerState;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// In-memory store. Never fails.
#[derive(Debug, Default)]
pub struct MemoryStore {
  state: RwLock<StoreSnapshot>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
    Self {
      state: RwLock::new(snapshot),
    }
  }

  /// Copies the full contents of the store.
  pub fn snapshot(&self) -> StoreSnapshot {
    self.state.read().clone()
  }

  pub(crate) fn replace(&self, snapshot: StoreSnapshot) {
    *self.state.write() = snapshot;
  }
}

impl ScheduleStore for MemoryStore {
  fn get_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, StoreError> {
    Ok(self.state.read().triggers.get(key).cloned())
  }

  fn get_job(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
    Ok(self.state.read().jobs.get(key).cloned())
  }

  fn triggers_of_job(&self, job_key: &JobKey) -> Result<Vec<TriggerRecord>, StoreError> {
    Ok(self.state.read().triggers_of_job(job_key))
  }

  fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StoreError> {
    Ok(self.state.read().triggers.keys().cloned().collect())
  }

  fn job_keys(&self) -> Result<Vec<JobKey>, StoreError> {
    Ok(self.state.read().jobs.keys().cloned().collect())
  }

  fn schedule_job(&self, job: JobRecord, trigger: TriggerRecord) -> Result<(), StoreError> {
    self.state.write().schedule_job(job, trigger)
  }

  fn store_job(&self, job: JobRecord) -> Result<(), StoreError> {
    self.state.write().jobs.insert(job.key.clone(), job);
    Ok(())
  }

  fn store_trigger(&self, trigger: TriggerRecord) -> Result<(), StoreError> {
    self
      .state
      .write()
      .triggers
      .insert(trigger.key.clone(), trigger);
    Ok(())
  }

  fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    Ok(self.state.write().triggers.remove(key).is_some())
  }

  fn delete_job(&self, key: &JobKey) -> Result<bool, StoreError> {
    Ok(self.state.write().delete_job(key))
  }

  fn reschedule_job(
    &self,
    key: &TriggerKey,
    cron_expression: &str,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError> {
    Ok(
      self
        .state
        .write()
        .reschedule_job(key, cron_expression, next_fire_time),
    )
  }

  fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    Ok(self.state.write().update_state(key, TriggerState::paused))
  }

  fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    Ok(self.state.write().update_state(key, TriggerState::resumed))
  }

  fn pause_all(&self) -> Result<(), StoreError> {
    self.state.write().update_all_states(TriggerState::paused);
    Ok(())
  }

  fn resume_all(&self) -> Result<(), StoreError> {
    self.state.write().update_all_states(TriggerState::resumed);
    Ok(())
  }

  fn begin_fire(
    &self,
    key: &TriggerKey,
    instance: FireInstanceId,
    request: FireRequest<'_>,
  ) -> Result<FireAdmission, StoreError> {
    Ok(self.state.write().begin_fire(key, instance, request))
  }

  fn release_fire(
    &self,
    key: &TriggerKey,
    instance: Option<FireInstanceId>,
  ) -> Result<Option<TriggerRecord>, StoreError> {
    Ok(self.state.write().release_fire(key, instance))
  }
}

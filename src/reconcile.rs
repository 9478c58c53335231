//! Reconciliation of declared jobs against persisted schedule state.
//!
//! For each declared job the reconciler either keeps the persisted job/trigger
//! pair, replaces it, or creates it; a cleanup pass then removes everything
//! that is no longer declared. Running it twice in a row without fires in
//! between leaves the store exactly as one run does.

use crate::calendar::{Clock, CronExpression};
use crate::error::InitError;
use crate::job::{JobData, JobDefinition, JobKey, TriggerKey};
use crate::metrics::SchedulerMetrics;
use crate::state::derive_active_cron;
use crate::store::{JobRecord, ScheduleStore, TriggerKind, TriggerRecord};

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

/// Declared job name → key of the trigger that owns it.
pub type TriggerIndex = BTreeMap<String, TriggerKey>;

/// A declared definition together with the payload type its registered body binds.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredJob {
  pub definition: JobDefinition,
  pub payload_type: String,
}

impl DeclaredJob {
  pub fn new(definition: JobDefinition, payload_type: impl Into<String>) -> Self {
    Self {
      definition,
      payload_type: payload_type.into(),
    }
  }

  pub fn name(&self) -> &str {
    &self.definition.name
  }

  fn job_data(&self) -> JobData {
    JobData {
      payload_type: self.payload_type.clone(),
      value: self.definition.payload.clone(),
    }
  }
}

/// Why a persisted pair was replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
  /// Job record present without its trigger.
  OrphanedJob,
  /// Trigger present without its job record.
  OrphanedTrigger,
  NotCronTrigger,
  MissingJobKey,
  JobKeyMismatch { found: JobKey },
  /// The trigger was left in flight; it has been unblocked.
  Blocked,
  /// Several triggers pointed at the job; all were unscheduled.
  MultipleTriggers(usize),
  /// The job's only trigger is not the expected one, or it has none.
  TriggerNotOwned,
  DescriptionChanged,
  SchedulingChanged,
  JobDataChanged,
}

impl fmt::Display for InvalidReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InvalidReason::OrphanedJob => f.write_str("job record exists without a trigger"),
      InvalidReason::OrphanedTrigger => f.write_str("trigger exists without a job record"),
      InvalidReason::NotCronTrigger => f.write_str("trigger is not a cron trigger"),
      InvalidReason::MissingJobKey => f.write_str("trigger has no job key"),
      InvalidReason::JobKeyMismatch { found } => {
        write!(f, "trigger points at job key {found}")
      }
      InvalidReason::Blocked => f.write_str("trigger was blocked"),
      InvalidReason::MultipleTriggers(n) => write!(f, "{n} triggers point at the job"),
      InvalidReason::TriggerNotOwned => f.write_str("job is not owned by the expected trigger"),
      InvalidReason::DescriptionChanged => f.write_str("description differs from declaration"),
      InvalidReason::SchedulingChanged => {
        f.write_str("scheduling config differs from declaration")
      }
      InvalidReason::JobDataChanged => f.write_str("job data differs from declared payload"),
    }
  }
}

/// Outcome of validating a persisted pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
  Valid,
  Invalid(InvalidReason),
}

/// What the reconciler did for one declared job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
  Created,
  Recreated(InvalidReason),
  Kept,
  /// Kept, with the active cron expression switched.
  Rescheduled { from: String, to: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// One entry per declared job, in declaration order.
  pub actions: Vec<(String, ReconcileAction)>,
  pub removed_triggers: Vec<TriggerKey>,
  pub removed_jobs: Vec<JobKey>,
}

impl ReconcileReport {
  pub fn action(&self, name: &str) -> Option<&ReconcileAction> {
    self
      .actions
      .iter()
      .find(|(n, _)| n == name)
      .map(|(_, action)| action)
  }

  /// True when the pass changed nothing in the store.
  pub fn is_noop(&self) -> bool {
    self.removed_triggers.is_empty()
      && self.removed_jobs.is_empty()
      && self
        .actions
        .iter()
        .all(|(_, action)| *action == ReconcileAction::Kept)
  }
}

pub struct Reconciler {
  store: Arc<dyn ScheduleStore>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
}

impl Reconciler {
  pub fn new(
    store: Arc<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    metrics: SchedulerMetrics,
  ) -> Self {
    Self {
      store,
      clock,
      metrics,
    }
  }

  /// Runs a full pass over `declared`, then the cleanup pass.
  ///
  /// Only store failures (and a declared cron that does not parse) are
  /// returned as errors; every anomaly is repaired in place.
  pub fn reconcile(
    &self,
    declared: &[DeclaredJob],
  ) -> Result<(TriggerIndex, ReconcileReport), InitError> {
    SchedulerMetrics::incr(&self.metrics.reconcile_runs);
    let mut index = TriggerIndex::new();
    let mut report = ReconcileReport::default();

    for job in declared {
      let action = self.reconcile_job(job)?;
      index.insert(job.name().to_string(), job.definition.trigger_key());
      report.actions.push((job.name().to_string(), action));
    }

    self.cleanup(&index, &mut report)?;

    info!(
      declared = declared.len(),
      removed_triggers = report.removed_triggers.len(),
      removed_jobs = report.removed_jobs.len(),
      "Reconciliation complete."
    );
    Ok((index, report))
  }

  fn reconcile_job(&self, declared: &DeclaredJob) -> Result<ReconcileAction, InitError> {
    let name = declared.name();
    let job_key = declared.definition.job_key();
    let trigger_key = declared.definition.trigger_key();

    let job = self.store.get_job(&job_key)?;
    let trigger = self.store.get_trigger(&trigger_key)?;

    let (job, trigger) = match (job, trigger) {
      (None, None) => {
        self.create(declared)?;
        info!(job_type = %name, reason = "no persisted schedule", "Created job and trigger.");
        SchedulerMetrics::incr(&self.metrics.reconcile_created);
        return Ok(ReconcileAction::Created);
      }
      (Some(_), None) => {
        self.store.delete_job(&job_key)?;
        return self.recreate(declared, InvalidReason::OrphanedJob);
      }
      (None, Some(_)) => {
        self.store.unschedule_job(&trigger_key)?;
        return self.recreate(declared, InvalidReason::OrphanedTrigger);
      }
      (Some(job), Some(trigger)) => (job, trigger),
    };

    match self.validate(declared, &job, &trigger)? {
      Validation::Invalid(reason) => {
        self.store.unschedule_job(&trigger_key)?;
        self.store.delete_job(&job_key)?;
        self.recreate(declared, reason)
      }
      Validation::Valid => {
        let active = derive_active_cron(&job, trigger.state);
        if active == trigger.cron_expression {
          debug!(job_type = %name, "Persisted schedule is valid; kept.");
          return Ok(ReconcileAction::Kept);
        }
        let next = parse_cron(name, active)?.next_after(self.clock.now());
        self.store.reschedule_job(&trigger_key, active, next)?;
        info!(
          job_type = %name,
          from = %trigger.cron_expression,
          to = %active,
          failure_count = job.consecutive_failures,
          "Active cron expression differs from derived schedule; rescheduled."
        );
        SchedulerMetrics::incr(&self.metrics.reconcile_rescheduled);
        Ok(ReconcileAction::Rescheduled {
          from: trigger.cron_expression,
          to: active.to_string(),
        })
      }
    }
  }

  /// Checks a persisted pair against its declaration.
  ///
  /// A blocked trigger is unblocked and triggers sharing the job are
  /// unscheduled as part of the check.
  pub fn validate(
    &self,
    declared: &DeclaredJob,
    job: &JobRecord,
    trigger: &TriggerRecord,
  ) -> Result<Validation, InitError> {
    let expected_job_key = declared.definition.job_key();
    let invalid = |reason| Ok(Validation::Invalid(reason));

    if trigger.kind != TriggerKind::Cron {
      return invalid(InvalidReason::NotCronTrigger);
    }
    let Some(trigger_job_key) = &trigger.job_key else {
      return invalid(InvalidReason::MissingJobKey);
    };
    if *trigger_job_key != expected_job_key {
      return invalid(InvalidReason::JobKeyMismatch {
        found: trigger_job_key.clone(),
      });
    }
    if trigger.state.is_blocked() {
      self.store.release_fire(&trigger.key, None)?;
      return invalid(InvalidReason::Blocked);
    }

    let owners = self.store.triggers_of_job(&expected_job_key)?;
    if owners.len() > 1 {
      for owner in &owners {
        self.store.unschedule_job(&owner.key)?;
      }
      return invalid(InvalidReason::MultipleTriggers(owners.len()));
    }
    if owners.first().map(|t| &t.key) != Some(&trigger.key) {
      return invalid(InvalidReason::TriggerNotOwned);
    }

    if job.description != declared.definition.description {
      return invalid(InvalidReason::DescriptionChanged);
    }
    if job.scheduling != declared.definition.scheduling_config() {
      return invalid(InvalidReason::SchedulingChanged);
    }
    if job.job_data != declared.job_data() {
      return invalid(InvalidReason::JobDataChanged);
    }
    Ok(Validation::Valid)
  }

  fn recreate(
    &self,
    declared: &DeclaredJob,
    reason: InvalidReason,
  ) -> Result<ReconcileAction, InitError> {
    self.create(declared)?;
    info!(job_type = %declared.name(), %reason, "Recreated job and trigger.");
    SchedulerMetrics::incr(&self.metrics.reconcile_recreated);
    Ok(ReconcileAction::Recreated(reason))
  }

  /// Creates a fresh job/trigger pair on the normal schedule.
  pub fn create(&self, declared: &DeclaredJob) -> Result<(), InitError> {
    let definition = &declared.definition;
    let now = self.clock.now();
    let next = parse_cron(&definition.name, &definition.normal_schedule)?.next_after(now);

    let job = JobRecord {
      key: definition.job_key(),
      description: definition.description.clone(),
      scheduling: definition.scheduling_config(),
      job_data: declared.job_data(),
      consecutive_failures: 0,
      created_at: now,
      last_outcome: None,
    };
    let trigger = TriggerRecord::cron(
      definition.trigger_key(),
      definition.job_key(),
      &definition.normal_schedule,
      now,
      next,
    );
    self.store.schedule_job(job, trigger)?;
    Ok(())
  }

  fn cleanup(&self, index: &TriggerIndex, report: &mut ReconcileReport) -> Result<(), InitError> {
    let owned: BTreeSet<&TriggerKey> = index.values().collect();

    for key in self.store.trigger_keys()? {
      if owned.contains(&key) {
        continue;
      }
      if self.store.unschedule_job(&key)? {
        info!(trigger = %key, reason = "not declared", "Unscheduled trigger.");
        SchedulerMetrics::incr(&self.metrics.reconcile_deleted);
        report.removed_triggers.push(key);
      }
    }

    for key in self.store.job_keys()? {
      if !self.store.triggers_of_job(&key)?.is_empty() {
        continue;
      }
      if self.store.delete_job(&key)? {
        info!(job = %key, reason = "no surviving trigger", "Deleted job.");
        SchedulerMetrics::incr(&self.metrics.reconcile_deleted);
        report.removed_jobs.push(key);
      }
    }
    Ok(())
  }
}

fn parse_cron(job: &str, expression: &str) -> Result<CronExpression, InitError> {
  CronExpression::parse(expression).map_err(|source| InitError::InvalidSchedule {
    job: job.to_string(),
    source,
  })
}

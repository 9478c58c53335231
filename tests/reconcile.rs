//! tests/reconcile.rs
//! Reconciliation of declared jobs against persisted schedule state.

mod common;

use crate::common::{
  at, declared, job_record, manual_clock, postal_codes_definition, setup_tracing,
  taxonomy_definition, t0, trigger_record, POSTAL_CODES, TAXONOMY,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cronwarden::metrics::SchedulerMetrics;
use cronwarden::store::{FireAdmission, FireRequest, MisfirePolicy, TriggerKind};
use cronwarden::{
  DeclaredJob, FireInstanceId, InvalidReason, JobKey, JobRecord, ManualClock, MemoryStore,
  ReconcileAction, ReconcileReport, Reconciler, ScheduleStore, StoreError, StoreSnapshot,
  TriggerKey, TriggerRecord, TriggerState,
};
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

const NORMAL: &str = "0 0 3 * * ?";
const FAILURE: &str = "0 0 */1 * * ?";

fn reconciler(store: Arc<dyn ScheduleStore>, clock: &ManualClock) -> Reconciler {
  Reconciler::new(store, Arc::new(clock.clone()), SchedulerMetrics::new())
}

fn both_declared() -> Vec<DeclaredJob> {
  vec![
    declared(postal_codes_definition()),
    declared(taxonomy_definition()),
  ]
}

/// A store holding the pairs created for both declared jobs, after `mutate`
/// has been applied to its contents.
fn seeded_store(mutate: impl FnOnce(&mut StoreSnapshot)) -> Arc<MemoryStore> {
  let clock = manual_clock();
  let store = Arc::new(MemoryStore::new());
  reconciler(store.clone(), &clock)
    .reconcile(&both_declared())
    .expect("seed reconcile");
  let mut contents = store.snapshot();
  mutate(&mut contents);
  Arc::new(MemoryStore::from_snapshot(contents))
}

fn reconcile_seeded(
  mutate: impl FnOnce(&mut StoreSnapshot),
  declared_jobs: &[DeclaredJob],
) -> (ReconcileReport, Arc<MemoryStore>) {
  let store = seeded_store(mutate);
  let clock = manual_clock();
  let (_, report) = reconciler(store.clone(), &clock)
    .reconcile(declared_jobs)
    .expect("reconcile");
  (report, store)
}

fn postal_trigger(contents: &mut StoreSnapshot) -> &mut TriggerRecord {
  contents
    .triggers
    .get_mut(&TriggerKey::for_job(POSTAL_CODES))
    .expect("postal codes trigger seeded")
}

fn postal_job(contents: &mut StoreSnapshot) -> &mut JobRecord {
  contents
    .jobs
    .get_mut(&JobKey::for_job(POSTAL_CODES))
    .expect("postal codes job seeded")
}

/// The postal codes pair is freshly created on the normal schedule.
fn assert_fresh_postal_pair(store: &dyn ScheduleStore) {
  let job = job_record(store, POSTAL_CODES).expect("job recreated");
  let trigger = trigger_record(store, POSTAL_CODES).expect("trigger recreated");
  assert_eq!(job.consecutive_failures, 0);
  assert!(job.last_outcome.is_none());
  assert_eq!(trigger.cron_expression, NORMAL);
  assert_eq!(trigger.state, TriggerState::Normal);
  assert_eq!(trigger.kind, TriggerKind::Cron);
  assert_eq!(trigger.job_key, Some(JobKey::for_job(POSTAL_CODES)));
  assert_eq!(trigger.fire_instance, None);
  assert_eq!(trigger.next_fire_time, Some(at(3, 0)));
  assert_eq!(
    store
      .triggers_of_job(&JobKey::for_job(POSTAL_CODES))
      .unwrap()
      .len(),
    1
  );
}

fn recreated_for(report: &ReconcileReport, reason: InvalidReason) {
  assert_eq!(
    report.action(POSTAL_CODES),
    Some(&ReconcileAction::Recreated(reason))
  );
  assert_eq!(report.action(TAXONOMY), Some(&ReconcileAction::Kept));
}

// --- Creation and idempotence ---

#[test]
fn empty_store_creates_one_pair_per_declared_job() {
  setup_tracing();
  let clock = manual_clock();
  let store = Arc::new(MemoryStore::new());

  let (index, report) = reconciler(store.clone(), &clock)
    .reconcile(&[declared(postal_codes_definition())])
    .unwrap();

  assert_eq!(report.action(POSTAL_CODES), Some(&ReconcileAction::Created));
  assert_eq!(
    index.get(POSTAL_CODES),
    Some(&TriggerKey::new("PostalCodesTrigger"))
  );

  let contents = store.snapshot();
  assert_eq!(contents.jobs.len(), 1);
  assert_eq!(contents.triggers.len(), 1);

  let job = job_record(&*store, POSTAL_CODES).unwrap();
  assert_eq!(job.key, JobKey::new("PostalCodesJob"));
  assert_eq!(job.description, "Fetch postal codes");
  assert_eq!(job.scheduling, postal_codes_definition().scheduling_config());
  assert_eq!(
    job.job_data.value,
    json!({ "sourceUrl": "https://example.org/postal-codes.csv" })
  );
  assert!(job.job_data.payload_type.ends_with("PostalCodesPayload"));
  assert_eq!(job.consecutive_failures, 0);
  assert_eq!(job.created_at, t0());

  let trigger = trigger_record(&*store, POSTAL_CODES).unwrap();
  assert_eq!(trigger.cron_expression, NORMAL);
  assert_eq!(trigger.start_time, t0());
  assert_eq!(trigger.next_fire_time, Some(at(3, 0)));
  assert_eq!(trigger.previous_fire_time, None);
  assert_eq!(trigger.misfire_policy, MisfirePolicy::FireAndProceed);
  assert_eq!(trigger.time_zone, "UTC");
  assert_eq!(
    store.trigger_state(&trigger.key).unwrap(),
    Some(TriggerState::Normal)
  );
}

#[test]
fn second_pass_without_fires_changes_nothing() {
  setup_tracing();
  let clock = manual_clock();
  let store = Arc::new(MemoryStore::new());
  let reconciler = reconciler(store.clone(), &clock);

  let (first_index, first) = reconciler.reconcile(&both_declared()).unwrap();
  assert!(!first.is_noop());
  let after_first = store.snapshot();

  clock.advance(chrono::Duration::minutes(5));
  let (second_index, second) = reconciler.reconcile(&both_declared()).unwrap();

  assert!(second.is_noop(), "second pass reported {second:?}");
  assert_eq!(first_index, second_index);
  assert_eq!(store.snapshot(), after_first);
}

#[test]
fn reconcile_repairs_are_idempotent() {
  setup_tracing();
  // A messy store: a blocked trigger, a stale description and an undeclared pair.
  let store = seeded_store(|contents| {
    postal_trigger(contents).state = TriggerState::Blocked;
    postal_trigger(contents).fire_instance = Some(Uuid::new_v4());
    contents
      .jobs
      .get_mut(&JobKey::for_job(TAXONOMY))
      .unwrap()
      .description = "outdated".into();
  });
  let clock = manual_clock();
  let reconciler = reconciler(store.clone(), &clock);
  let declared_jobs = vec![declared(postal_codes_definition())];

  let (_, first) = reconciler.reconcile(&declared_jobs).unwrap();
  assert!(!first.is_noop());
  let repaired = store.snapshot();

  let (_, second) = reconciler.reconcile(&declared_jobs).unwrap();
  assert!(second.is_noop());
  assert_eq!(store.snapshot(), repaired);
}

// --- Orphans ---

#[test]
fn orphaned_job_is_deleted_and_recreated() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| {
      contents.triggers.remove(&TriggerKey::for_job(POSTAL_CODES));
      postal_job(contents).consecutive_failures = 4;
    },
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::OrphanedJob);
  assert_fresh_postal_pair(&*store);
}

#[test]
fn orphaned_trigger_is_unscheduled_and_recreated() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| {
      contents.jobs.remove(&JobKey::for_job(POSTAL_CODES));
      postal_trigger(contents).cron_expression = FAILURE.into();
    },
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::OrphanedTrigger);
  assert_fresh_postal_pair(&*store);
}

// --- Validation rules ---

#[test]
fn non_cron_trigger_is_replaced() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| {
      postal_trigger(contents).kind = TriggerKind::Simple {
        repeat_interval_secs: 60,
      }
    },
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::NotCronTrigger);
  assert_fresh_postal_pair(&*store);
}

#[test]
fn trigger_without_job_key_is_replaced() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| postal_trigger(contents).job_key = None,
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::MissingJobKey);
  assert_fresh_postal_pair(&*store);
}

#[test]
fn trigger_pointing_at_another_job_is_replaced() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| postal_trigger(contents).job_key = Some(JobKey::new("AddressesJob")),
    &both_declared(),
  );
  recreated_for(
    &report,
    InvalidReason::JobKeyMismatch {
      found: JobKey::new("AddressesJob"),
    },
  );
  assert_fresh_postal_pair(&*store);
}

#[test]
fn blocked_trigger_is_unblocked_and_replaced() {
  setup_tracing();
  for stuck in [TriggerState::Blocked, TriggerState::PausedBlocked] {
    let (report, store) = reconcile_seeded(
      |contents| {
        let trigger = postal_trigger(contents);
        trigger.state = stuck;
        trigger.fire_instance = Some(Uuid::new_v4());
      },
      &both_declared(),
    );
    recreated_for(&report, InvalidReason::Blocked);
    assert_fresh_postal_pair(&*store);
  }
}

#[test]
fn second_trigger_on_the_job_unschedules_all_of_them() {
  setup_tracing();
  let legacy = TriggerKey::new("PostalCodesLegacyTrigger");
  let (report, store) = reconcile_seeded(
    |contents| {
      let mut extra = postal_trigger(contents).clone();
      extra.key = legacy.clone();
      contents.triggers.insert(legacy.clone(), extra);
    },
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::MultipleTriggers(2));
  assert!(store.get_trigger(&legacy).unwrap().is_none());
  assert_fresh_postal_pair(&*store);
}

#[test]
fn changed_description_replaces_the_pair() {
  setup_tracing();
  let mut changed = postal_codes_definition();
  changed.description = "Fetch postal codes (v2 feed)".into();
  let (report, store) = reconcile_seeded(
    |_| {},
    &[declared(changed), declared(taxonomy_definition())],
  );
  recreated_for(&report, InvalidReason::DescriptionChanged);
  assert_eq!(
    job_record(&*store, POSTAL_CODES).unwrap().description,
    "Fetch postal codes (v2 feed)"
  );
}

#[test]
fn changed_scheduling_fields_replace_the_pair() {
  setup_tracing();
  let mut more_retries = postal_codes_definition();
  more_retries.max_retries = 5;
  let mut new_cadence = postal_codes_definition();
  new_cadence.normal_schedule = "0 0 4 * * ?".into();

  for definition in [more_retries, new_cadence] {
    let expected = definition.scheduling_config();
    let (report, store) = reconcile_seeded(
      |_| {},
      &[declared(definition), declared(taxonomy_definition())],
    );
    recreated_for(&report, InvalidReason::SchedulingChanged);
    let job = job_record(&*store, POSTAL_CODES).unwrap();
    assert_eq!(job.scheduling, expected);
    assert_eq!(
      trigger_record(&*store, POSTAL_CODES).unwrap().cron_expression,
      expected.normal_schedule
    );
  }
}

#[test]
fn changed_payload_value_replaces_the_pair() {
  setup_tracing();
  let changed = postal_codes_definition()
    .with_payload(json!({ "sourceUrl": "https://mirror.example.org/postal-codes.csv" }));
  let (report, store) = reconcile_seeded(
    |_| {},
    &[declared(changed), declared(taxonomy_definition())],
  );
  recreated_for(&report, InvalidReason::JobDataChanged);
  assert_eq!(
    job_record(&*store, POSTAL_CODES).unwrap().job_data.value["sourceUrl"],
    "https://mirror.example.org/postal-codes.csv"
  );
}

#[test]
fn changed_payload_type_replaces_the_pair() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| postal_job(contents).job_data.payload_type = "legacy::PostalCodeFeed".into(),
    &both_declared(),
  );
  recreated_for(&report, InvalidReason::JobDataChanged);
  assert_fresh_postal_pair(&*store);
}

/// Delegates to a `MemoryStore`, except that the first `triggers_of_job` call
/// answers with a canned list.
struct MisreportingStore {
  inner: MemoryStore,
  first_answer: Mutex<Option<Vec<TriggerRecord>>>,
}

impl ScheduleStore for MisreportingStore {
  fn get_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, StoreError> {
    self.inner.get_trigger(key)
  }
  fn get_job(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
    self.inner.get_job(key)
  }
  fn triggers_of_job(&self, job_key: &JobKey) -> Result<Vec<TriggerRecord>, StoreError> {
    match self.first_answer.lock().take() {
      Some(canned) => Ok(canned),
      None => self.inner.triggers_of_job(job_key),
    }
  }
  fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StoreError> {
    self.inner.trigger_keys()
  }
  fn job_keys(&self) -> Result<Vec<JobKey>, StoreError> {
    self.inner.job_keys()
  }
  fn schedule_job(&self, job: JobRecord, trigger: TriggerRecord) -> Result<(), StoreError> {
    self.inner.schedule_job(job, trigger)
  }
  fn store_job(&self, job: JobRecord) -> Result<(), StoreError> {
    self.inner.store_job(job)
  }
  fn store_trigger(&self, trigger: TriggerRecord) -> Result<(), StoreError> {
    self.inner.store_trigger(trigger)
  }
  fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.inner.unschedule_job(key)
  }
  fn delete_job(&self, key: &JobKey) -> Result<bool, StoreError> {
    self.inner.delete_job(key)
  }
  fn reschedule_job(
    &self,
    key: &TriggerKey,
    cron_expression: &str,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError> {
    self.inner.reschedule_job(key, cron_expression, next_fire_time)
  }
  fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.inner.pause_trigger(key)
  }
  fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.inner.resume_trigger(key)
  }
  fn pause_all(&self) -> Result<(), StoreError> {
    self.inner.pause_all()
  }
  fn resume_all(&self) -> Result<(), StoreError> {
    self.inner.resume_all()
  }
  fn begin_fire(
    &self,
    key: &TriggerKey,
    instance: FireInstanceId,
    request: FireRequest<'_>,
  ) -> Result<FireAdmission, StoreError> {
    self.inner.begin_fire(key, instance, request)
  }
  fn release_fire(
    &self,
    key: &TriggerKey,
    instance: Option<FireInstanceId>,
  ) -> Result<Option<TriggerRecord>, StoreError> {
    self.inner.release_fire(key, instance)
  }
}

#[test]
fn job_not_owned_by_the_validated_trigger_is_replaced() {
  setup_tracing();
  let seeded = seeded_store(|contents| {
    contents.triggers.remove(&TriggerKey::for_job(TAXONOMY));
    contents.jobs.remove(&JobKey::for_job(TAXONOMY));
  });
  let mut stranger = trigger_record(&*seeded, POSTAL_CODES).unwrap();
  stranger.key = TriggerKey::new("SomeoneElsesTrigger");

  for canned in [vec![stranger], Vec::new()] {
    let store = Arc::new(MisreportingStore {
      inner: MemoryStore::from_snapshot(seeded.snapshot()),
      first_answer: Mutex::new(Some(canned)),
    });
    let (_, report) = reconciler(store.clone(), &manual_clock())
      .reconcile(&[declared(postal_codes_definition())])
      .unwrap();

    assert_eq!(
      report.action(POSTAL_CODES),
      Some(&ReconcileAction::Recreated(InvalidReason::TriggerNotOwned))
    );
    assert_fresh_postal_pair(&*store);
  }
}

// --- Active schedule check on valid pairs ---

#[test]
fn failing_job_is_rescheduled_in_place_onto_the_failure_schedule() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| {
      postal_job(contents).consecutive_failures = 2;
      postal_trigger(contents).previous_fire_time = Some(t0());
    },
    &both_declared(),
  );

  assert_eq!(
    report.action(POSTAL_CODES),
    Some(&ReconcileAction::Rescheduled {
      from: NORMAL.into(),
      to: FAILURE.into(),
    })
  );
  let trigger = trigger_record(&*store, POSTAL_CODES).unwrap();
  assert_eq!(trigger.cron_expression, FAILURE);
  assert_eq!(trigger.next_fire_time, Some(at(1, 0)));
  // Identity and bookkeeping survive the reschedule.
  assert_eq!(trigger.previous_fire_time, Some(t0()));
  assert_eq!(trigger.state, TriggerState::Normal);
  assert_eq!(job_record(&*store, POSTAL_CODES).unwrap().consecutive_failures, 2);
}

#[test]
fn paused_trigger_is_kept_paused_on_the_failure_schedule() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| postal_trigger(contents).state = TriggerState::Paused,
    &both_declared(),
  );

  assert!(matches!(
    report.action(POSTAL_CODES),
    Some(ReconcileAction::Rescheduled { .. })
  ));
  let trigger = trigger_record(&*store, POSTAL_CODES).unwrap();
  assert_eq!(trigger.cron_expression, FAILURE);
  assert_eq!(trigger.state, TriggerState::Paused);
}

#[test]
fn recovered_job_returns_to_the_normal_schedule() {
  setup_tracing();
  let (report, store) = reconcile_seeded(
    |contents| postal_trigger(contents).cron_expression = FAILURE.into(),
    &both_declared(),
  );

  assert_eq!(
    report.action(POSTAL_CODES),
    Some(&ReconcileAction::Rescheduled {
      from: FAILURE.into(),
      to: NORMAL.into(),
    })
  );
  assert_eq!(
    trigger_record(&*store, POSTAL_CODES).unwrap().cron_expression,
    NORMAL
  );
}

// --- Cleanup and ownership ---

#[test]
fn undeclared_pairs_and_stray_jobs_are_removed() {
  setup_tracing();
  let stray = JobKey::new("ObsoleteExportJob");
  let (report, store) = reconcile_seeded(
    |contents| {
      let mut job = contents.jobs[&JobKey::for_job(POSTAL_CODES)].clone();
      job.key = stray.clone();
      contents.jobs.insert(stray.clone(), job);
    },
    &[declared(postal_codes_definition())],
  );

  assert_eq!(report.removed_triggers, vec![TriggerKey::for_job(TAXONOMY)]);
  assert_eq!(report.removed_jobs.len(), 2);
  assert!(report.removed_jobs.contains(&JobKey::for_job(TAXONOMY)));
  assert!(report.removed_jobs.contains(&stray));

  let contents = store.snapshot();
  assert_eq!(
    contents.jobs.keys().cloned().collect::<Vec<_>>(),
    vec![JobKey::for_job(POSTAL_CODES)]
  );
  assert_eq!(
    contents.triggers.keys().cloned().collect::<Vec<_>>(),
    vec![TriggerKey::for_job(POSTAL_CODES)]
  );
}

#[test]
fn every_declared_job_ends_with_exactly_one_owning_trigger() {
  setup_tracing();
  let store = seeded_store(|contents| {
    // Two triggers for taxonomy, none for postal codes.
    contents.triggers.remove(&TriggerKey::for_job(POSTAL_CODES));
    let mut extra = contents.triggers[&TriggerKey::for_job(TAXONOMY)].clone();
    extra.key = TriggerKey::new("TaxonomyNightlyTrigger");
    contents.triggers.insert(extra.key.clone(), extra);
  });
  let (index, _) = reconciler(store.clone(), &manual_clock())
    .reconcile(&both_declared())
    .unwrap();

  for name in [POSTAL_CODES, TAXONOMY] {
    let owners = store.triggers_of_job(&JobKey::for_job(name)).unwrap();
    assert_eq!(owners.len(), 1, "{name} has {} triggers", owners.len());
    assert_eq!(Some(&owners[0].key), index.get(name));
  }
  assert_eq!(store.snapshot().triggers.len(), 2);
}

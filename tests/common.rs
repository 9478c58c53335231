//! tests/common.rs
//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use cronwarden::{
  DeclaredJob, JobDefinition, JobInvocation, JobKey, JobRecord, JobRegistry, JobResult,
  JobScheduler, ManualClock, MemoryStore, ScheduleStore, TriggerKey, TriggerRecord,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::fmt::TestWriter;

pub const POSTAL_CODES: &str = "PostalCodes";
pub const TAXONOMY: &str = "Taxonomy";

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // try_init: several tests in one binary call this
  let _ = tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_writer(TestWriter::new())
    .with_test_writer()
    .try_init();
}

/// 2024-01-01T00:00:00Z, the start of every manual clock in these tests.
pub fn t0() -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `t0` plus the given hours and minutes.
pub fn at(hours: i64, minutes: i64) -> DateTime<Utc> {
  t0() + ChronoDuration::hours(hours) + ChronoDuration::minutes(minutes)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostalCodesPayload {
  pub source_url: String,
}

#[derive(Debug, Deserialize)]
pub struct TaxonomyPayload {
  pub vocabulary: String,
}

pub fn postal_codes_definition() -> JobDefinition {
  JobDefinition::new(POSTAL_CODES, "0 0 3 * * ?", "0 0 */1 * * ?", 1)
    .with_description("Fetch postal codes")
    .with_payload(json!({ "sourceUrl": "https://example.org/postal-codes.csv" }))
}

pub fn taxonomy_definition() -> JobDefinition {
  JobDefinition::new(TAXONOMY, "0 30 4 * * ?", "0 */15 * * * ?", 3)
    .with_description("Refresh species taxonomy")
    .with_payload(json!({ "vocabulary": "species" }))
}

/// Declared form used when driving the reconciler directly.
pub fn declared(definition: JobDefinition) -> DeclaredJob {
  let payload_type = match definition.name.as_str() {
    POSTAL_CODES => std::any::type_name::<PostalCodesPayload>(),
    TAXONOMY => std::any::type_name::<TaxonomyPayload>(),
    _ => std::any::type_name::<serde_json::Value>(),
  };
  DeclaredJob::new(definition, payload_type)
}

/// Observable, steerable job body.
#[derive(Debug, Clone, Default)]
pub struct JobProbe {
  pub runs: Arc<AtomicUsize>,
  pub forced_runs: Arc<AtomicUsize>,
  pub started: Arc<AtomicUsize>,
  pub fail: Arc<AtomicBool>,
  pub panic: Arc<AtomicBool>,
  pub delay_ms: Arc<AtomicU64>,
}

impl JobProbe {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn failing() -> Self {
    let probe = Self::new();
    probe.set_failing(true);
    probe
  }

  pub fn set_failing(&self, fail: bool) {
    self.fail.store(fail, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: StdDuration) {
    self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
  }

  pub fn runs(&self) -> usize {
    self.runs.load(Ordering::SeqCst)
  }

  pub fn started(&self) -> usize {
    self.started.load(Ordering::SeqCst)
  }

  /// Registers this probe as the body of `name`, binding payloads to `P`.
  pub fn register<P>(&self, registry: &mut JobRegistry, name: &str)
  where
    P: DeserializeOwned + Send + 'static,
  {
    let probe = self.clone();
    registry.register(name, move |_payload: P, inv: JobInvocation| {
      let probe = probe.clone();
      async move { probe.run(inv.is_forced).await }
    });
  }

  async fn run(&self, forced: bool) -> JobResult {
    self.started.fetch_add(1, Ordering::SeqCst);
    let delay = self.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
      tokio::time::sleep(StdDuration::from_millis(delay)).await;
    }
    let count = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
    if forced {
      self.forced_runs.fetch_add(1, Ordering::SeqCst);
    }
    tracing::debug!(count, forced, "Probe job executing");

    if self.panic.load(Ordering::SeqCst) {
      panic!("probe job forced panic");
    }
    if self.fail.load(Ordering::SeqCst) {
      return Err("upstream returned 503".into());
    }
    Ok(())
  }
}

/// Registry with `PostalCodes` and `Taxonomy` bodies backed by the given probes.
pub fn registry(postal_codes: &JobProbe, taxonomy: &JobProbe) -> JobRegistry {
  let mut registry = JobRegistry::new();
  postal_codes.register::<PostalCodesPayload>(&mut registry, POSTAL_CODES);
  taxonomy.register::<TaxonomyPayload>(&mut registry, TAXONOMY);
  registry
}

pub fn manual_clock() -> ManualClock {
  ManualClock::new(t0())
}

// Builds a scheduler over `store` with a manual clock and a short idle sleep,
// so that advancing the clock is noticed quickly.
pub fn build_scheduler(
  store: Arc<dyn ScheduleStore>,
  registry: JobRegistry,
  clock: &ManualClock,
  max_workers: usize,
) -> JobScheduler {
  JobScheduler::builder()
    .max_workers(max_workers)
    .store(store)
    .registry(registry)
    .clock(Arc::new(clock.clone()))
    .max_idle_sleep(StdDuration::from_millis(10))
    .shutdown_grace(StdDuration::from_secs(5))
    .build()
    .expect("scheduler builds")
}

pub fn memory_store() -> Arc<MemoryStore> {
  Arc::new(MemoryStore::new())
}

pub fn job_record(store: &dyn ScheduleStore, name: &str) -> Option<JobRecord> {
  store.get_job(&JobKey::for_job(name)).expect("store read")
}

pub fn trigger_record(store: &dyn ScheduleStore, name: &str) -> Option<TriggerRecord> {
  store.get_trigger(&TriggerKey::for_job(name)).expect("store read")
}

pub fn failure_count(store: &dyn ScheduleStore, name: &str) -> u32 {
  job_record(store, name).map_or(0, |job| job.consecutive_failures)
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_for(timeout: StdDuration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = tokio::time::Instant::now() + timeout;
  loop {
    if condition() {
      return true;
    }
    if tokio::time::Instant::now() >= deadline {
      return false;
    }
    tokio::time::sleep(StdDuration::from_millis(10)).await;
  }
}

/// Waits until the outcome of a fire that finished at `finished_at` has been
/// applied to `name` and its trigger runs on `cron`, unblocked.
pub async fn wait_for_outcome(
  store: &dyn ScheduleStore,
  name: &str,
  finished_at: DateTime<Utc>,
  cron: &str,
) -> bool {
  wait_for(StdDuration::from_secs(5), || {
    let applied = job_record(store, name)
      .and_then(|job| job.last_outcome)
      .is_some_and(|last| last.finished_at == finished_at);
    applied
      && trigger_record(store, name)
        .is_some_and(|t| !t.state.is_blocked() && t.cron_expression == cron)
  })
  .await
}

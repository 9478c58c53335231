//! demos/postal_codes.rs
//!
//! Runs the `PostalCodes` job over a `JsonFileStore`: a forced run that fails
//! moves the job onto its failure schedule, the next one recovers. Run it
//! twice to see the persisted schedule being kept on the second start.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use cronwarden::{
  JobDefinition, JobInvocation, JobRegistry, JobResult, JobScheduler, JsonFileStore,
  OperatorError,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostalCodes {
  source_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // --- Setup Tracing ---
  let filter = tracing_subscriber::EnvFilter::try_new("warn,cronwarden=info,postal_codes=info")
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();

  // --- Store ---
  let path = std::env::temp_dir().join("cronwarden-demo").join("schedule.json");
  info!(path = %path.display(), "Opening schedule store.");
  let store = Arc::new(JsonFileStore::open(&path)?);

  // --- Job Body ---
  // Fails on its first call, then succeeds.
  let calls = Arc::new(AtomicUsize::new(0));
  let mut registry = JobRegistry::new();
  {
    let calls = calls.clone();
    registry.register("PostalCodes", move |payload: PostalCodes, inv: JobInvocation| {
      let calls = calls.clone();
      async move {
        let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
        info!(call, forced = inv.is_forced, url = %payload.source_url, "Fetching postal codes...");
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        let result: JobResult = if call == 1 {
          Err("upstream returned 503".into())
        } else {
          Ok(())
        };
        result
      }
    });
  }

  // --- Build Scheduler ---
  let scheduler = JobScheduler::builder()
    .max_workers(2)
    .store(store)
    .registry(registry)
    .shutdown_grace(StdDuration::from_secs(5))
    .build()?;

  let declared = vec![JobDefinition::new("PostalCodes", "0 0 3 * * ?", "0 0 */1 * * ?", 1)
    .with_description("Fetch postal codes")
    .with_payload(json!({ "sourceUrl": "https://example.org/postal-codes.csv" }))];

  let report = scheduler.initialize(declared).await?;
  info!(?report, "Reconciled declared jobs.");
  scheduler.start().await?;

  // --- Force Runs ---
  scheduler.force_run("PostalCodes").await?;
  // A second request while the first is running is refused.
  match scheduler.force_run("PostalCodes").await {
    Err(OperatorError::JobAlreadyRunning(name)) => info!(%name, "Refused overlapping run."),
    other => warn!(?other, "Unexpected force-run result."),
  }
  tokio::time::sleep(StdDuration::from_millis(500)).await;
  print_jobs(&scheduler).await?;

  scheduler.force_run("PostalCodes").await?;
  tokio::time::sleep(StdDuration::from_millis(500)).await;
  print_jobs(&scheduler).await?;

  // --- Shutdown ---
  scheduler.stop().await?;
  info!(metrics = ?scheduler.metrics_snapshot(), "Scheduler stopped.");
  Ok(())
}

async fn print_jobs(scheduler: &JobScheduler) -> Result<(), OperatorError> {
  for job in scheduler.list_jobs().await? {
    println!(
      "{:<12} cron={:<16} state={:?} failures={}/{} next={:?}",
      job.name,
      job.cron_expression,
      job.state,
      job.failure_count,
      job.retry_limit,
      job.next_fire_time,
    );
  }
  Ok(())
}

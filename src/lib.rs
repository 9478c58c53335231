//! cronwarden: a persistent, self-reconciling cron job scheduler
//!
//! Runs a fixed set of declared maintenance jobs on cron schedules against a
//! persistent store of job and trigger records. On startup (and on reload) the
//! declared jobs are reconciled with what the store already holds, so the
//! schedule survives restarts without duplicating or orphaning anything.
//!
//! # Features
//!
//! - Declared jobs with a normal and a failure cron schedule (UTC, seconds-first
//!   six or seven field expressions; `?` is accepted as "any").
//! - Deterministic, idempotent reconciliation: keep, replace or create each
//!   persisted job/trigger pair, then remove everything no longer declared.
//! - Failure-driven rescheduling: failures switch a job onto its failure
//!   schedule until the next success.
//! - Never two overlapping executions of the same job.
//! - Fire-and-proceed misfire handling: a fire missed while the process was
//!   down runs once on restart, any further missed fires are skipped.
//! - Bounded worker pool with panic capture and structured `tracing` events.
//! - Operator surface: list, force-run, pause/resume, restart, reload.
//! - `MemoryStore` and `JsonFileStore` backends behind the `ScheduleStore` trait.
//! - Built-in metrics (`MetricsSnapshot`).
//! - Optional task-local job context (`JobContext`, `job_context` feature).
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use cronwarden::{JobDefinition, JobInvocation, JobRegistry, JobScheduler, JsonFileStore};
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct PostalCodes {
//!     source_url: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut registry = JobRegistry::new();
//!     registry.register("PostalCodes", |payload: PostalCodes, inv: JobInvocation| async move {
//!         println!("fetching {} (forced: {})", payload.source_url, inv.is_forced);
//!         Ok(())
//!     });
//!
//!     let scheduler = JobScheduler::builder()
//!         .max_workers(5)
//!         .store(Arc::new(JsonFileStore::open("schedule.json")?))
//!         .registry(registry)
//!         .build()?;
//!
//!     let declared = vec![JobDefinition::new("PostalCodes", "0 0 3 * * ?", "0 0 */1 * * ?", 1)
//!         .with_payload(json!({ "sourceUrl": "https://example.org/postal-codes.csv" }))];
//!
//!     scheduler.initialize(declared).await?;
//!     scheduler.start().await?;
//!
//!     for job in scheduler.list_jobs().await? {
//!         println!("{} next fires at {:?}", job.name, job.next_fire_time);
//!     }
//!
//!     scheduler.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Use the [`SchedulerBuilder`] (or [`SchedulerBuilder::from_config`] with a
//! [`SchedulerConfig`]) to set `max_workers`, `shutdown_grace`, the store, the
//! registry, the clock and the shared configuration blob.
//!
//! # Observability
//!
//! The crate emits `tracing` events with `job_type`, `execution_type` and
//! `result_status` fields per execution, and one info event per
//! reconciliation decision. It never installs a subscriber.

pub mod calendar;
mod command;
pub mod config;
mod coordinator;
pub mod error;
pub mod job;
pub mod metrics;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod worker;

// --- Public Re-exports ---

pub use scheduler::{JobScheduler, SchedulerBuilder, SchedulerStatus};

pub use error::{
  BuildError, ConfigError, CronError, InitError, OperatorError, ShutdownError, StoreError,
};

pub use job::{
  BoxError, ExecutionOutcome, ExecutionType, FireInstanceId, JobDefinition, JobInfo,
  JobInvocation, JobKey, JobResult, TriggerKey,
};
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};

pub use calendar::{Clock, CronExpression, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use metrics::MetricsSnapshot;
pub use reconcile::{
  DeclaredJob, InvalidReason, ReconcileAction, ReconcileReport, Reconciler, TriggerIndex, Validation,
};
pub use registry::JobRegistry;
pub use store::{
  JobRecord, JsonFileStore, MemoryStore, ScheduleStore, StoreSnapshot, TriggerRecord,
  TriggerState,
};
pub use worker::JobExecutor;

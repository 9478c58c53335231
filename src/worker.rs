use crate::command::{Dispatch, WorkerOutcome};
use crate::job::{ExecutionOutcome, ExecutionType, FireInstanceId, JobInvocation, JobKey, WorkerId};
use crate::metrics::SchedulerMetrics;
use crate::registry::JobRegistry;
use crate::store::ScheduleStore;

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Instrument};

/// Runs job bodies and turns their result into an `ExecutionOutcome`.
///
/// Errors and panics from the body both become `Failure`. Every execution
/// emits one structured log event carrying `job_type`, `execution_type` and
/// `result_status`.
#[derive(Debug, Clone)]
pub struct JobExecutor {
  registry: Arc<JobRegistry>,
  shared: Arc<Value>,
  metrics: SchedulerMetrics,
}

impl JobExecutor {
  pub fn new(registry: Arc<JobRegistry>, shared: Arc<Value>, metrics: SchedulerMetrics) -> Self {
    Self {
      registry,
      shared,
      metrics,
    }
  }

  pub async fn execute(
    &self,
    job_name: &str,
    job_data: Value,
    execution_type: ExecutionType,
    fire_instance: FireInstanceId,
  ) -> ExecutionOutcome {
    let started = Instant::now();
    let outcome = self
      .run_body(job_name, job_data, execution_type, fire_instance)
      .await;
    let duration = started.elapsed();
    self.metrics.execution_duration.record(duration);

    match &outcome {
      ExecutionOutcome::Success => {
        SchedulerMetrics::incr(&self.metrics.executions_succeeded);
        info!(
          job_type = %job_name,
          execution_type = %execution_type,
          result_status = outcome.status(),
          duration_ms = duration.as_millis() as u64,
          "Job execution finished."
        );
      }
      ExecutionOutcome::Failure { error } => {
        SchedulerMetrics::incr(&self.metrics.executions_failed);
        error!(
          job_type = %job_name,
          execution_type = %execution_type,
          result_status = outcome.status(),
          duration_ms = duration.as_millis() as u64,
          error = %error,
          "Job execution failed."
        );
      }
    }
    outcome
  }

  /// Runs the body on its own task so a panic is contained.
  async fn run_body(
    &self,
    job_name: &str,
    job_data: Value,
    execution_type: ExecutionType,
    fire_instance: FireInstanceId,
  ) -> ExecutionOutcome {
    let Some(job) = self.registry.get(job_name) else {
      return ExecutionOutcome::Failure {
        error: format!("no job body registered for '{job_name}'"),
      };
    };

    let invocation = JobInvocation {
      job_name: job_name.to_string(),
      job_data,
      is_forced: execution_type == ExecutionType::Forced,
      shared: self.shared.clone(),
    };

    #[cfg(feature = "job_context")]
    let task = {
      let context = JobContext {
        job_name: job_name.to_string(),
        fire_instance,
        execution_type,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, async move { job.invoke(invocation).await }))
    };
    #[cfg(not(feature = "job_context"))]
    let task = {
      let _ = fire_instance;
      tokio::spawn(async move { job.invoke(invocation).await })
    };

    match task.await {
      Ok(Ok(())) => ExecutionOutcome::Success,
      Ok(Err(e)) => ExecutionOutcome::Failure {
        error: e.to_string(),
      },
      Err(join_error) if join_error.is_panic() => {
        SchedulerMetrics::incr(&self.metrics.executions_panicked);
        let payload = join_error.into_panic();
        let detail = payload
          .downcast_ref::<&str>()
          .map(|s| s.to_string())
          .or_else(|| payload.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "non-string panic payload".to_string());
        ExecutionOutcome::Failure {
          error: format!("job body panicked: {detail}"),
        }
      }
      Err(_) => {
        warn!(job_type = %job_name, "Job task was cancelled during execution.");
        ExecutionOutcome::Failure {
          error: "job task cancelled".to_string(),
        }
      }
    }
  }
}

/// A worker task: receives admitted fires from the coordinator, loads the
/// job's persisted data, executes it and reports back.
pub(crate) struct Worker {
  id: WorkerId,
  store: Arc<dyn ScheduleStore>,
  executor: JobExecutor,
  metrics: SchedulerMetrics,
  worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
  job_dispatch_rx: async_channel::Receiver<Dispatch>,
  active_workers_counter: Arc<AtomicUsize>,
}

impl Worker {
  pub fn new(
    id: WorkerId,
    store: Arc<dyn ScheduleStore>,
    executor: JobExecutor,
    metrics: SchedulerMetrics,
    worker_outcome_tx: mpsc::Sender<WorkerOutcome>,
    job_dispatch_rx: async_channel::Receiver<Dispatch>,
    active_workers_counter: Arc<AtomicUsize>,
  ) -> Self {
    Self {
      id,
      store,
      executor,
      metrics,
      worker_outcome_tx,
      job_dispatch_rx,
      active_workers_counter,
    }
  }

  /// Runs until the coordinator closes the dispatch channel.
  pub async fn run(&mut self) {
    debug!(worker_id = self.id, "Worker started.");

    while let Ok(dispatch) = self.job_dispatch_rx.recv().await {
      let span = tracing::span!(
        tracing::Level::INFO,
        "job_exec",
        worker_id = self.id,
        job_type = dispatch.job_name.as_str(),
        fire_instance = %dispatch.fire_instance,
        execution_type = %dispatch.execution_type,
      );
      self.handle_dispatch(dispatch).instrument(span).await;
    }

    debug!(worker_id = self.id, "Dispatch channel closed; worker exiting.");
  }

  async fn handle_dispatch(&self, dispatch: Dispatch) {
    let outcome = match self.store.get_job(&JobKey::for_job(&dispatch.job_name)) {
      Ok(Some(job)) => {
        self
          .executor
          .execute(
            &dispatch.job_name,
            job.job_data.value,
            dispatch.execution_type,
            dispatch.fire_instance,
          )
          .await
      }
      Ok(None) => {
        warn!("Job record missing for dispatched fire.");
        ExecutionOutcome::Failure {
          error: "job record not found".to_string(),
        }
      }
      Err(e) => {
        error!(error = %e, "Failed to load job record for dispatched fire.");
        ExecutionOutcome::Failure {
          error: format!("job record could not be loaded: {e}"),
        }
      }
    };

    if self
      .worker_outcome_tx
      .send(WorkerOutcome { dispatch, outcome })
      .await
      .is_err()
    {
      warn!("Failed to report job outcome; coordinator is gone.");
    }

    // Decremented only after the outcome is queued, so the coordinator never
    // sees an idle pool with an unreported outcome outstanding.
    let prev = self
      .active_workers_counter
      .fetch_sub(1, AtomicOrdering::Relaxed);
    SchedulerMetrics::set(
      &self.metrics.workers_active_current,
      prev.saturating_sub(1),
    );
  }
}

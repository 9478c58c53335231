use crate::calendar::{Clock, CronExpression, SystemClock};
use crate::command::{CoordinatorCommand, Dispatch, WorkerOutcome};
use crate::config::{SchedulerConfig, DEFAULT_MAX_WORKERS, DEFAULT_SHUTDOWN_GRACE_SECS};
use crate::coordinator::{Coordinator, CoordinatorState};
use crate::error::{BuildError, InitError, OperatorError, ShutdownError};
use crate::job::{FireInstanceId, JobDefinition, JobInfo, JobKey, TriggerKey};
use crate::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::reconcile::{DeclaredJob, ReconcileReport, Reconciler, TriggerIndex};
use crate::registry::JobRegistry;
use crate::store::ScheduleStore;
use crate::worker::{JobExecutor, Worker};

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const DEFAULT_CHANNEL_BOUND: usize = 128;
const DEFAULT_MAX_IDLE_SLEEP: Duration = Duration::from_secs(60);

/// Lifecycle state of a `JobScheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerStatus {
  /// `initialize` has not completed.
  Uninitialized,
  /// Reconciled and ready to start.
  Stopped,
  Running,
  /// A stop timed out with jobs still in flight. `stop` may be called again.
  Degraded,
}

/// Builder for a [`JobScheduler`].
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use cronwarden::{JobRegistry, JobScheduler, MemoryStore};
///
/// # fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let scheduler = JobScheduler::builder()
///     .max_workers(4)
///     .store(Arc::new(MemoryStore::new()))
///     .registry(JobRegistry::new())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SchedulerBuilder {
  max_workers: usize,
  shutdown_grace: Duration,
  command_buffer_size: usize,
  max_idle_sleep: Duration,
  store: Option<Arc<dyn ScheduleStore>>,
  registry: JobRegistry,
  clock: Arc<dyn Clock>,
  shared: Value,
}

impl Default for SchedulerBuilder {
  fn default() -> Self {
    Self {
      max_workers: DEFAULT_MAX_WORKERS,
      shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
      command_buffer_size: DEFAULT_CHANNEL_BOUND,
      max_idle_sleep: DEFAULT_MAX_IDLE_SLEEP,
      store: None,
      registry: JobRegistry::new(),
      clock: Arc::new(SystemClock),
      shared: Value::Null,
    }
  }
}

impl fmt::Debug for SchedulerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SchedulerBuilder")
      .field("max_workers", &self.max_workers)
      .field("shutdown_grace", &self.shutdown_grace)
      .field("command_buffer_size", &self.command_buffer_size)
      .field("max_idle_sleep", &self.max_idle_sleep)
      .field("has_store", &self.store.is_some())
      .field("clock", &self.clock)
      .finish_non_exhaustive()
  }
}

impl SchedulerBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Seeds worker count, shutdown grace and shared config from `config`.
  pub fn from_config(config: &SchedulerConfig) -> Self {
    Self::new()
      .max_workers(config.max_workers)
      .shutdown_grace(config.shutdown_grace())
      .shared_config(config.shared.clone())
  }

  /// Maximum number of concurrent executions. Defaults to 5.
  pub fn max_workers(mut self, count: usize) -> Self {
    self.max_workers = count;
    self
  }

  /// How long `stop` waits for in-flight executions. Defaults to 30 seconds.
  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.shutdown_grace = grace;
    self
  }

  pub fn command_buffer_size(mut self, size: usize) -> Self {
    self.command_buffer_size = size.max(1);
    self
  }

  /// Upper bound on how long the coordinator sleeps between clock checks.
  pub fn max_idle_sleep(mut self, sleep: Duration) -> Self {
    self.max_idle_sleep = sleep;
    self
  }

  /// The schedule store (required).
  pub fn store(mut self, store: Arc<dyn ScheduleStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn registry(mut self, registry: JobRegistry) -> Self {
    self.registry = registry;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Configuration blob handed to every job body.
  pub fn shared_config(mut self, shared: Value) -> Self {
    self.shared = shared;
    self
  }

  pub fn build(self) -> Result<JobScheduler, BuildError> {
    if self.max_workers == 0 {
      return Err(BuildError::ZeroMaxWorkers);
    }
    let store = self.store.ok_or(BuildError::MissingStore)?;

    Ok(JobScheduler {
      store,
      registry: Arc::new(self.registry),
      clock: self.clock,
      metrics: SchedulerMetrics::new(),
      shared: Arc::new(self.shared),
      settings: Settings {
        max_workers: self.max_workers,
        shutdown_grace: self.shutdown_grace,
        command_buffer_size: self.command_buffer_size,
        max_idle_sleep: self.max_idle_sleep,
      },
      controller: Mutex::new(Controller {
        status: SchedulerStatus::Uninitialized,
        declared: Vec::new(),
        index: TriggerIndex::new(),
        runtime: None,
        shutdown_waiter: None,
      }),
    })
  }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
  max_workers: usize,
  shutdown_grace: Duration,
  command_buffer_size: usize,
  max_idle_sleep: Duration,
}

/// Channels and task handles of a running scheduler.
struct Runtime {
  cmd_tx: mpsc::Sender<CoordinatorCommand>,
  shutdown_tx: watch::Sender<bool>,
  coordinator_handle: JoinHandle<()>,
  worker_handles: Vec<JoinHandle<()>>,
}

impl Runtime {
  async fn request<T>(
    &self,
    make: impl FnOnce(oneshot::Sender<T>) -> CoordinatorCommand,
  ) -> Result<T, OperatorError> {
    let (responder, response_rx) = oneshot::channel();
    self
      .cmd_tx
      .send(make(responder))
      .await
      .map_err(|_| OperatorError::SchedulerShutdown)?;
    response_rx.await.map_err(|_| OperatorError::ResponseFailed)
  }

  async fn refresh(&self, index: &TriggerIndex) -> Result<(), OperatorError> {
    let index = index.clone();
    self
      .request(|responder| CoordinatorCommand::Refresh { index, responder })
      .await
  }

  async fn set_standby(&self, standby: bool) -> Result<(), OperatorError> {
    self
      .request(|responder| CoordinatorCommand::SetStandby { standby, responder })
      .await
  }
}

/// Mutable scheduler context. Only touched under the controller mutex.
struct Controller {
  status: SchedulerStatus,
  declared: Vec<DeclaredJob>,
  index: TriggerIndex,
  /// Present exactly while `Running`.
  runtime: Option<Runtime>,
  /// Join of the tasks of a stop that timed out.
  shutdown_waiter: Option<JoinHandle<Result<(), ShutdownError>>>,
}

impl Controller {
  fn ensure_initialized(&self) -> Result<(), OperatorError> {
    match self.status {
      SchedulerStatus::Uninitialized => Err(OperatorError::NotInitialized),
      _ => Ok(()),
    }
  }

  fn trigger_key(&self, job_name: &str) -> Result<TriggerKey, OperatorError> {
    self.ensure_initialized()?;
    self
      .index
      .get(job_name)
      .cloned()
      .ok_or_else(|| OperatorError::JobNotScheduled(job_name.to_string()))
  }

  fn running(&self) -> Result<&Runtime, OperatorError> {
    match (self.status, &self.runtime) {
      (SchedulerStatus::Running, Some(runtime)) => Ok(runtime),
      (SchedulerStatus::Degraded, _) => Err(OperatorError::Degraded),
      _ => Err(OperatorError::NotRunning),
    }
  }

  async fn refresh_if_running(&self) -> Result<(), OperatorError> {
    match &self.runtime {
      Some(runtime) => runtime.refresh(&self.index).await,
      None => Ok(()),
    }
  }
}

/// Cron-driven maintenance job scheduler over a persistent schedule store.
///
/// Create with [`JobScheduler::builder()`], then call
/// [`initialize`](JobScheduler::initialize) with the declared jobs and
/// [`start`](JobScheduler::start). All operator entry points are serialized.
pub struct JobScheduler {
  store: Arc<dyn ScheduleStore>,
  registry: Arc<JobRegistry>,
  clock: Arc<dyn Clock>,
  metrics: SchedulerMetrics,
  shared: Arc<Value>,
  settings: Settings,
  controller: Mutex<Controller>,
}

impl fmt::Debug for JobScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobScheduler")
      .field("settings", &self.settings)
      .field("registry", &self.registry)
      .finish_non_exhaustive()
  }
}

impl JobScheduler {
  pub fn builder() -> SchedulerBuilder {
    SchedulerBuilder::new()
  }

  fn reconciler(&self) -> Reconciler {
    Reconciler::new(self.store.clone(), self.clock.clone(), self.metrics.clone())
  }

  /// Checks a declared job against the registry: known name, unique, both
  /// schedules parse, payload binds to the registered type.
  fn declare_one(
    &self,
    definition: JobDefinition,
    seen: &mut HashSet<String>,
  ) -> Result<DeclaredJob, InitError> {
    let name = definition.name.clone();
    let registered = self
      .registry
      .get(&name)
      .ok_or_else(|| InitError::UnknownJobType(name.clone()))?;
    if !seen.insert(name.clone()) {
      return Err(InitError::DuplicateJob(name));
    }
    for expression in [&definition.normal_schedule, &definition.failure_schedule] {
      CronExpression::parse(expression).map_err(|source| InitError::InvalidSchedule {
        job: name.clone(),
        source,
      })?;
    }
    registered
      .bind(&definition.payload)
      .map_err(|reason| InitError::PayloadBinding {
        job: name.clone(),
        payload_type: registered.payload_type(),
        reason,
      })?;
    Ok(DeclaredJob::new(definition, registered.payload_type()))
  }

  fn declare(&self, definitions: Vec<JobDefinition>) -> Result<Vec<DeclaredJob>, InitError> {
    let mut seen = HashSet::new();
    definitions
      .into_iter()
      .map(|definition| self.declare_one(definition, &mut seen))
      .collect()
  }

  /// Validates the declared jobs and reconciles them against the store.
  ///
  /// Any error leaves the scheduler uninitialized.
  pub async fn initialize(
    &self,
    definitions: Vec<JobDefinition>,
  ) -> Result<ReconcileReport, InitError> {
    let mut ctl = self.controller.lock().await;
    if ctl.status != SchedulerStatus::Uninitialized {
      return Err(InitError::AlreadyInitialized);
    }

    let declared = self.declare(definitions)?;
    let (index, report) = self.reconciler().reconcile(&declared)?;

    info!(jobs = declared.len(), "Scheduler initialized.");
    ctl.declared = declared;
    ctl.index = index;
    ctl.status = SchedulerStatus::Stopped;
    Ok(report)
  }

  /// Replaces the declared job list and reconciles again.
  ///
  /// Regular firing is halted for the duration of the pass when running. A
  /// job whose body is still executing keeps that fire: its re-created
  /// trigger stays blocked until the body finishes.
  pub async fn reload(
    &self,
    definitions: Vec<JobDefinition>,
  ) -> Result<ReconcileReport, OperatorError> {
    let mut ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;
    let declared = self.declare(definitions)?;

    if let Some(runtime) = &ctl.runtime {
      runtime.set_standby(true).await?;
    }
    let result = self.reconciler().reconcile(&declared);
    if let Ok((index, _)) = &result {
      ctl.index = index.clone();
      ctl.declared = declared;
    }
    if let Some(runtime) = &ctl.runtime {
      runtime.refresh(&ctl.index).await?;
      runtime.set_standby(false).await?;
    }

    let (_, report) = result?;
    info!(jobs = ctl.declared.len(), "Declared jobs reloaded.");
    Ok(report)
  }

  /// Spawns the coordinator and the worker pool.
  pub async fn start(&self) -> Result<(), OperatorError> {
    let mut ctl = self.controller.lock().await;
    match ctl.status {
      SchedulerStatus::Uninitialized => return Err(OperatorError::NotInitialized),
      SchedulerStatus::Running => return Err(OperatorError::AlreadyRunning),
      SchedulerStatus::Degraded => return Err(OperatorError::Degraded),
      SchedulerStatus::Stopped => {}
    }

    let max_workers = self.settings.max_workers;
    let active_workers_counter = Arc::new(AtomicUsize::new(0));
    let (cmd_tx, cmd_rx) = mpsc::channel::<CoordinatorCommand>(self.settings.command_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (job_dispatch_tx, job_dispatch_rx) = async_channel::bounded::<Dispatch>(max_workers);
    let (worker_outcome_tx, worker_outcome_rx) =
      mpsc::channel::<WorkerOutcome>(self.settings.command_buffer_size);

    let coordinator_state = CoordinatorState {
      store: self.store.clone(),
      clock: self.clock.clone(),
      index: ctl.index.clone(),
      cmd_rx,
      shutdown_rx,
      worker_outcome_rx,
      job_dispatch_tx,
      metrics: self.metrics.clone(),
      active_workers_counter: active_workers_counter.clone(),
      max_workers,
      max_idle_sleep: self.settings.max_idle_sleep,
    };
    let coordinator_handle = tokio::spawn(async move {
      let mut coordinator = Coordinator::new(coordinator_state);
      coordinator.run().await;
    });

    let executor = JobExecutor::new(
      self.registry.clone(),
      self.shared.clone(),
      self.metrics.clone(),
    );
    let mut worker_handles = Vec::with_capacity(max_workers);
    for worker_id in 0..max_workers {
      let mut worker = Worker::new(
        worker_id,
        self.store.clone(),
        executor.clone(),
        self.metrics.clone(),
        worker_outcome_tx.clone(),
        job_dispatch_rx.clone(),
        active_workers_counter.clone(),
      );
      worker_handles.push(tokio::spawn(async move { worker.run().await }));
    }

    ctl.runtime = Some(Runtime {
      cmd_tx,
      shutdown_tx,
      coordinator_handle,
      worker_handles,
    });
    ctl.status = SchedulerStatus::Running;
    info!(max_workers, "Scheduler started.");
    Ok(())
  }

  /// Stops firing and waits up to the shutdown grace period for in-flight
  /// executions. A no-op when not running.
  ///
  /// # Errors
  ///
  /// - [`ShutdownError::Timeout`]: executions were still running after the
  ///   grace period; the scheduler is left `Degraded`.
  /// - [`ShutdownError::TaskPanic`]: the coordinator or a worker panicked.
  pub async fn stop(&self) -> Result<(), ShutdownError> {
    let mut ctl = self.controller.lock().await;
    let mut waiter = match (ctl.status, ctl.runtime.take(), ctl.shutdown_waiter.take()) {
      (SchedulerStatus::Running, Some(runtime), _) => {
        info!("Stopping scheduler...");
        if runtime.shutdown_tx.send(true).is_err() {
          warn!("Coordinator already gone when sending shutdown signal.");
        }
        let mut handles = runtime.worker_handles;
        handles.push(runtime.coordinator_handle);
        tokio::spawn(async move {
          try_join_all(handles).await.map(|_| ()).map_err(|e| {
            error!(error = ?e, "A scheduler task panicked during shutdown.");
            ShutdownError::TaskPanic
          })
        })
      }
      (SchedulerStatus::Degraded, _, Some(waiter)) => waiter,
      _ => return Ok(()),
    };

    let grace = self.settings.shutdown_grace;
    match tokio::time::timeout(grace, &mut waiter).await {
      Ok(joined) => {
        ctl.status = SchedulerStatus::Stopped;
        match joined {
          Ok(Ok(())) => {
            info!("Scheduler stopped.");
            Ok(())
          }
          Ok(Err(e)) => Err(e),
          Err(_) => Err(ShutdownError::TaskPanic),
        }
      }
      Err(_) => {
        error!(
          ?grace,
          "Shutdown timed out with executions still in flight; scheduler is degraded."
        );
        ctl.shutdown_waiter = Some(waiter);
        ctl.status = SchedulerStatus::Degraded;
        Err(ShutdownError::Timeout(grace))
      }
    }
  }

  pub async fn status(&self) -> SchedulerStatus {
    self.controller.lock().await.status
  }

  /// Current job name → trigger key index.
  pub async fn trigger_index(&self) -> TriggerIndex {
    self.controller.lock().await.index.clone()
  }

  /// One row per scheduled job, read from the store.
  pub async fn list_jobs(&self) -> Result<Vec<JobInfo>, OperatorError> {
    let ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;

    let mut jobs = Vec::with_capacity(ctl.index.len());
    for (name, key) in &ctl.index {
      let Some(trigger) = self.store.get_trigger(key)? else {
        warn!(job_type = %name, trigger = %key, "Indexed trigger missing from store.");
        continue;
      };
      let Some(job) = self.store.get_job(&JobKey::for_job(name))? else {
        warn!(job_type = %name, "Indexed job missing from store.");
        continue;
      };
      jobs.push(JobInfo {
        name: name.clone(),
        cron_expression: trigger.cron_expression,
        state: trigger.state,
        last_fire_time: trigger.previous_fire_time,
        next_fire_time: trigger.next_fire_time,
        regular_schedule: job.scheduling.normal_schedule,
        failure_schedule: job.scheduling.failure_schedule,
        retry_limit: job.scheduling.max_retries,
        failure_count: job.consecutive_failures,
      });
    }
    Ok(jobs)
  }

  /// Fires a job immediately, outside its schedule. The regular next fire
  /// time is not changed.
  ///
  /// Returns once the fire is admitted, with its fire instance id.
  ///
  /// # Errors
  ///
  /// - [`OperatorError::JobNotScheduled`]: unknown job name.
  /// - [`OperatorError::JobAlreadyRunning`]: a fire of the job is in flight.
  /// - [`OperatorError::NotRunning`]: the scheduler is not started.
  pub async fn force_run(&self, job_name: &str) -> Result<FireInstanceId, OperatorError> {
    let ctl = self.controller.lock().await;
    let trigger_key = ctl.trigger_key(job_name)?;
    let runtime = ctl.running()?;
    let job_name = job_name.to_string();
    runtime
      .request(|responder| CoordinatorCommand::ForceRun {
        trigger_key,
        job_name,
        responder,
      })
      .await?
  }

  /// Pauses a job's trigger. The active cron expression is left as is.
  pub async fn pause(&self, job_name: &str) -> Result<(), OperatorError> {
    let ctl = self.controller.lock().await;
    let key = ctl.trigger_key(job_name)?;
    if !self.store.pause_trigger(&key)? {
      return Err(OperatorError::TriggerNotFound(key));
    }
    info!(job_type = %job_name, "Job paused.");
    ctl.refresh_if_running().await
  }

  /// Resumes a paused job. With `use_regular_schedule`, the active cron
  /// expression is first reset to the normal schedule.
  pub async fn resume(
    &self,
    job_name: &str,
    use_regular_schedule: bool,
  ) -> Result<(), OperatorError> {
    let ctl = self.controller.lock().await;
    let key = ctl.trigger_key(job_name)?;
    if self.store.get_trigger(&key)?.is_none() {
      return Err(OperatorError::TriggerNotFound(key));
    }

    if use_regular_schedule {
      let job_key = JobKey::for_job(job_name);
      let job = self
        .store
        .get_job(&job_key)?
        .ok_or(OperatorError::JobKeyNotFound(job_key))?;
      let normal = &job.scheduling.normal_schedule;
      let cron = CronExpression::parse(normal).map_err(|source| InitError::InvalidSchedule {
        job: job_name.to_string(),
        source,
      })?;
      self
        .store
        .reschedule_job(&key, normal, cron.next_after(self.clock.now()))?;
    }

    if !self.store.resume_trigger(&key)? {
      return Err(OperatorError::TriggerNotFound(key));
    }
    info!(job_type = %job_name, use_regular_schedule, "Job resumed.");
    ctl.refresh_if_running().await
  }

  pub async fn pause_all(&self) -> Result<(), OperatorError> {
    let ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;
    self.store.pause_all()?;
    info!("All triggers paused.");
    ctl.refresh_if_running().await
  }

  pub async fn resume_all(&self) -> Result<(), OperatorError> {
    let ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;
    self.store.resume_all()?;
    info!("All triggers resumed.");
    ctl.refresh_if_running().await
  }

  /// Deletes a job's pair and re-creates it from its current declaration.
  pub async fn restart_job(&self, job_name: &str) -> Result<(), OperatorError> {
    let mut ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;
    let declared = ctl
      .declared
      .iter()
      .find(|job| job.name() == job_name)
      .cloned()
      .ok_or_else(|| OperatorError::JobNotScheduled(job_name.to_string()))?;

    let trigger_key = declared.definition.trigger_key();
    self.store.unschedule_job(&trigger_key)?;
    self.store.delete_job(&declared.definition.job_key())?;
    self.reconciler().create(&declared)?;
    ctl.index.insert(job_name.to_string(), trigger_key);

    info!(job_type = %job_name, "Job restarted.");
    ctl.refresh_if_running().await
  }

  /// Tears down every scheduled pair and rebuilds the schedule from the
  /// declared jobs, with regular firing halted throughout. Every trigger is
  /// resumed afterwards.
  pub async fn restart_all(&self) -> Result<ReconcileReport, OperatorError> {
    let mut ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;

    if let Some(runtime) = &ctl.runtime {
      runtime.set_standby(true).await?;
    }
    let result = self.rebuild_all(&mut ctl);
    if let Some(runtime) = &ctl.runtime {
      runtime.refresh(&ctl.index).await?;
      runtime.set_standby(false).await?;
    }

    let report = result?;
    info!(jobs = ctl.index.len(), "All jobs restarted.");
    Ok(report)
  }

  fn rebuild_all(&self, ctl: &mut Controller) -> Result<ReconcileReport, OperatorError> {
    for (name, key) in std::mem::take(&mut ctl.index) {
      self.store.unschedule_job(&key)?;
      self.store.delete_job(&JobKey::for_job(&name))?;
    }

    let reconciler = self.reconciler();
    reconciler.reconcile(&ctl.declared)?;
    let (index, report) = reconciler.reconcile(&ctl.declared)?;
    ctl.index = index;

    self.store.resume_all()?;
    Ok(report)
  }

  /// Replaces (or adds) the declared definition of a job. The persisted pair
  /// follows at the next `restart_job`, `restart_all` or `reload`.
  pub async fn set_definition(&self, definition: JobDefinition) -> Result<(), OperatorError> {
    let mut ctl = self.controller.lock().await;
    ctl.ensure_initialized()?;
    let declared = self.declare_one(definition, &mut HashSet::new())?;

    match ctl
      .declared
      .iter_mut()
      .find(|job| job.name() == declared.name())
    {
      Some(existing) => *existing = declared,
      None => ctl.declared.push(declared),
    }
    Ok(())
  }

  pub fn metrics_snapshot(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}

use crate::calendar::{next_fire_after, Clock};
use crate::command::{CoordinatorCommand, Dispatch, WorkerOutcome};
use crate::error::OperatorError;
use crate::job::{ExecutionOutcome, ExecutionType, FireInstanceId, JobKey, TriggerKey};
use crate::metrics::SchedulerMetrics;
use crate::reconcile::TriggerIndex;
use crate::state::{apply_outcome, derive_active_cron};
use crate::store::{FireAdmission, FireRequest, ScheduleStore, TriggerRecord, TriggerState};

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use priority_queue::PriorityQueue;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Sleep used while waiting for in-flight jobs during shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
/// Delay before retrying a trigger whose admission hit a store error.
const STORE_RETRY_SECS: i64 = 1;

/// Everything the coordinator task owns.
pub(crate) struct CoordinatorState {
  // Shared with the reconciler and the operator API
  pub store: Arc<dyn ScheduleStore>,
  pub clock: Arc<dyn Clock>,
  /// Initial trigger set; taken over by `Coordinator::new`.
  pub index: TriggerIndex,
  // Receivers
  pub cmd_rx: mpsc::Receiver<CoordinatorCommand>,
  /// `true` once `stop` has been requested.
  pub shutdown_rx: watch::Receiver<bool>,
  pub worker_outcome_rx: mpsc::Receiver<WorkerOutcome>,
  // Sender (multi-consumer: every worker pulls from the same channel)
  pub job_dispatch_tx: async_channel::Sender<Dispatch>,
  // Metrics & Counters
  pub metrics: SchedulerMetrics,
  /// Incremented here on dispatch, decremented by the worker when it is done.
  pub active_workers_counter: Arc<AtomicUsize>,
  pub max_workers: usize,
  /// Upper bound on any single wait.
  pub max_idle_sleep: Duration,
}

/// The single coordinating loop: fires due triggers, hands admitted fires to
/// free workers and applies execution outcomes to the store.
///
/// The fire queue mirrors the stored `next_fire_time` of every `Normal`
/// trigger in the index. It is only a cache; admission is always decided by
/// the store.
pub(crate) struct Coordinator {
  state: CoordinatorState,
  /// Reverse of the trigger index: trigger key to job name.
  names: HashMap<TriggerKey, String>,
  /// Earliest stored next fire time first. Keyed, so requeueing a trigger
  /// replaces its entry instead of duplicating it.
  queue: PriorityQueue<TriggerKey, Reverse<DateTime<Utc>>>,
  /// Admitted fires waiting for a free worker.
  pending: VecDeque<Dispatch>,
  /// Every admitted fire that has not reported an outcome yet, by job name.
  /// Outlives the trigger it was admitted on: a reload or restart may
  /// replace the trigger while the body is still running.
  in_flight: HashMap<String, Dispatch>,
  /// Regular firing halted while the operator rebuilds the schedule.
  /// Forced runs and outcomes are still handled.
  standby: bool,
  shutting_down: bool,
  /// The scheduler handle is gone; stop polling the command channel.
  cmd_closed: bool,
}

impl Coordinator {
  pub fn new(state: CoordinatorState) -> Self {
    let mut coordinator = Self {
      state,
      names: HashMap::new(),
      queue: PriorityQueue::new(),
      pending: VecDeque::new(),
      in_flight: HashMap::new(),
      standby: false,
      shutting_down: false,
      cmd_closed: false,
    };
    let index = std::mem::take(&mut coordinator.state.index);
    coordinator.refresh(index);
    coordinator
  }

  pub async fn run(&mut self) {
    info!(triggers = self.queue.len(), "Coordinator started.");

    loop {
      self.update_gauge_metrics();
      let sleep_duration = self.calculate_sleep();

      // Shutdown, then operator commands, then worker outcomes, then the timer.
      tokio::select! {
        biased;

        Ok(()) = self.state.shutdown_rx.changed(), if !self.shutting_down => {
          if *self.state.shutdown_rx.borrow() {
            info!("Coordinator received shutdown signal.");
            self.begin_shutdown();
          }
        }

        maybe_cmd = self.state.cmd_rx.recv(), if !self.cmd_closed => {
          match maybe_cmd {
            Some(cmd) => self.handle_command(cmd),
            None => {
              self.cmd_closed = true;
              if !self.shutting_down {
                warn!("Command channel closed (scheduler handle dropped). Shutting down.");
                self.begin_shutdown();
              }
            }
          }
        }

        Some(outcome) = self.state.worker_outcome_rx.recv() => {
          self.handle_worker_outcome(outcome);
        }

        _ = sleep(sleep_duration) => {
          trace!("Coordinator timer fired.");
        }
      }

      if self.shutting_down {
        if self.active_workers() == 0 {
          // Workers queue their outcome before going idle.
          while let Ok(outcome) = self.state.worker_outcome_rx.try_recv() {
            self.handle_worker_outcome(outcome);
          }
          info!("All workers idle. Coordinator exiting.");
          break;
        }
        trace!(
          active_workers = self.active_workers(),
          "Shutdown: waiting for active workers."
        );
        continue;
      }

      // Admission is decided by the store; the queue only says when to ask.
      self.fire_due_triggers();
      self.dispatch_pending().await;
    }

    self.state.job_dispatch_tx.close();
    info!("Coordinator task shutting down.");
  }

  fn active_workers(&self) -> usize {
    self.state.active_workers_counter.load(AtomicOrdering::Relaxed)
  }

  fn free_slots(&self) -> usize {
    self
      .state
      .max_workers
      .saturating_sub(self.active_workers())
      .saturating_sub(self.pending.len())
  }

  fn update_gauge_metrics(&self) {
    SchedulerMetrics::set(&self.state.metrics.triggers_queued_current, self.queue.len());
    SchedulerMetrics::set(
      &self.state.metrics.workers_active_current,
      self.active_workers(),
    );
  }

  fn calculate_sleep(&self) -> Duration {
    if self.shutting_down {
      return SHUTDOWN_POLL;
    }
    if self.standby || self.free_slots() == 0 {
      // Woken by a worker outcome or a command.
      return self.state.max_idle_sleep;
    }
    match self.queue.peek() {
      Some((_, Reverse(next))) => {
        let until = *next - self.state.clock.now();
        until
          .to_std()
          .unwrap_or(Duration::ZERO)
          .min(self.state.max_idle_sleep)
      }
      None => self.state.max_idle_sleep,
    }
  }

  fn begin_shutdown(&mut self) {
    self.shutting_down = true;
    self.queue.clear();
    for dispatch in self.pending.drain(..) {
      self.in_flight.remove(&dispatch.job_name);
      match self
        .state
        .store
        .release_fire(&dispatch.trigger_key, Some(dispatch.fire_instance))
      {
        Ok(_) => {
          debug!(job_type = %dispatch.job_name, "Released undispatched fire on shutdown.")
        }
        Err(e) => {
          error!(job_type = %dispatch.job_name, error = %e, "Failed to release undispatched fire.")
        }
      }
    }
  }

  fn handle_command(&mut self, cmd: CoordinatorCommand) {
    match cmd {
      CoordinatorCommand::ForceRun {
        trigger_key,
        job_name,
        responder,
      } => {
        let result = self.force_run(trigger_key, job_name);
        let _ = responder.send(result);
      }
      CoordinatorCommand::Refresh { index, responder } => {
        self.refresh(index);
        let _ = responder.send(());
      }
      CoordinatorCommand::SetStandby { standby, responder } => {
        if self.standby != standby {
          info!(standby, "Regular firing standby changed.");
        }
        self.standby = standby;
        let _ = responder.send(());
      }
    }
  }

  fn force_run(
    &mut self,
    trigger_key: TriggerKey,
    job_name: String,
  ) -> Result<FireInstanceId, OperatorError> {
    if self.shutting_down {
      return Err(OperatorError::SchedulerShutdown);
    }
    if self.in_flight.contains_key(&job_name) {
      SchedulerMetrics::incr(&self.state.metrics.fires_refused_in_flight);
      return Err(OperatorError::JobAlreadyRunning(job_name));
    }
    let instance = Uuid::new_v4();
    match self
      .state
      .store
      .begin_fire(&trigger_key, instance, FireRequest::Forced)?
    {
      FireAdmission::Admitted(_) => {
        SchedulerMetrics::incr(&self.state.metrics.fires_forced);
        info!(job_type = %job_name, fire_instance = %instance, "Forced fire admitted.");
        self.admit(Dispatch {
          trigger_key,
          job_name,
          fire_instance: instance,
          execution_type: ExecutionType::Forced,
          admitted_at: self.state.clock.now(),
        });
        Ok(instance)
      }
      FireAdmission::InFlight => {
        SchedulerMetrics::incr(&self.state.metrics.fires_refused_in_flight);
        Err(OperatorError::JobAlreadyRunning(job_name))
      }
      FireAdmission::Missing => Err(OperatorError::TriggerNotFound(trigger_key)),
      FireAdmission::NotEligible(state) => {
        warn!(job_type = %job_name, ?state, "Forced fire refused for trigger state.");
        Err(OperatorError::JobNotScheduled(job_name))
      }
      FireAdmission::NotDue(_) => Err(OperatorError::JobNotScheduled(job_name)),
    }
  }

  fn admit(&mut self, dispatch: Dispatch) {
    self.in_flight.insert(dispatch.job_name.clone(), dispatch.clone());
    self.pending.push_back(dispatch);
  }

  /// Replaces the trigger set and reloads next fire times from the store.
  fn refresh(&mut self, index: TriggerIndex) {
    self.names = index
      .into_iter()
      .map(|(name, key)| (key, name))
      .collect();
    self.reattach_in_flight();
    self.queue.clear();
    let keys: Vec<TriggerKey> = self.names.keys().cloned().collect();
    for key in keys {
      self.requeue(&key);
    }
    debug!(
      triggers = self.names.len(),
      queued = self.queue.len(),
      "Fire queue refreshed."
    );
  }

  /// Blocks triggers re-created while a fire of their job was running, on
  /// behalf of that fire. Its outcome then releases the new trigger as usual.
  fn reattach_in_flight(&self) {
    let store = &self.state.store;
    for dispatch in self.in_flight.values() {
      let job_type = dispatch.job_name.as_str();
      match store.get_trigger(&dispatch.trigger_key) {
        Ok(Some(trigger)) if trigger.fire_instance.is_none() => {
          match store.begin_fire(&trigger.key, dispatch.fire_instance, FireRequest::Forced) {
            Ok(FireAdmission::Admitted(_)) => info!(
              job_type,
              fire_instance = %dispatch.fire_instance,
              "Re-created trigger blocked for the running fire."
            ),
            Ok(admission) => warn!(
              job_type,
              ?admission,
              "Re-created trigger could not be blocked for the running fire."
            ),
            Err(e) => error!(job_type, error = %e, "Failed to block re-created trigger."),
          }
        }
        // Still held by this fire, or gone with an undeclared job.
        Ok(_) => {}
        Err(e) => error!(job_type, error = %e, "Failed to read trigger of a running fire."),
      }
    }
  }

  /// Queues `key` at its stored next fire time if it can fire regularly.
  fn requeue(&mut self, key: &TriggerKey) {
    match self.state.store.get_trigger(key) {
      Ok(Some(trigger)) => self.queue_trigger(&trigger),
      Ok(None) => {
        self.queue.remove(key);
      }
      Err(e) => {
        error!(trigger = %key, error = %e, "Failed to read trigger; retrying later.");
        self
          .queue
          .push(key.clone(), Reverse(self.state.clock.now() + chrono::Duration::seconds(STORE_RETRY_SECS)));
      }
    }
  }

  fn queue_trigger(&mut self, trigger: &TriggerRecord) {
    match (trigger.state, trigger.next_fire_time) {
      (TriggerState::Normal, Some(next)) if self.names.contains_key(&trigger.key) => {
        self.queue.push(trigger.key.clone(), Reverse(next));
      }
      _ => {
        self.queue.remove(&trigger.key);
      }
    }
  }

  /// Admits every due trigger that a free worker can take.
  fn fire_due_triggers(&mut self) {
    if self.standby {
      return;
    }
    let now = self.state.clock.now();

    while self.free_slots() > 0 {
      match self.queue.peek() {
        Some((_, Reverse(due))) if *due <= now => {}
        _ => break,
      }
      let Some((key, Reverse(due))) = self.queue.pop() else {
        break;
      };
      let Some(job_name) = self.names.get(&key).cloned() else {
        continue;
      };
      if self.in_flight.contains_key(&job_name) {
        // Requeued when the in-flight fire completes.
        SchedulerMetrics::incr(&self.state.metrics.fires_refused_in_flight);
        debug!(job_type = %job_name, "Job still running on a replaced trigger; skipped.");
        continue;
      }

      let instance = Uuid::new_v4();
      let next_fire = |trigger: &TriggerRecord| match next_fire_after(&trigger.cron_expression, now) {
        Ok(next) => next,
        Err(e) => {
          error!(trigger = %trigger.key, error = %e, "Stored cron expression does not parse.");
          None
        }
      };
      let request = FireRequest::Regular {
        now,
        next_fire: &next_fire,
      };

      match self.state.store.begin_fire(&key, instance, request) {
        Ok(FireAdmission::Admitted(trigger)) => {
          SchedulerMetrics::incr(&self.state.metrics.fires_regular);
          info!(
            job_type = %job_name,
            fire_instance = %instance,
            scheduled_for = %due,
            next_fire_time = ?trigger.next_fire_time,
            "Trigger fired."
          );
          self.admit(Dispatch {
            trigger_key: key,
            job_name,
            fire_instance: instance,
            execution_type: ExecutionType::Regular,
            admitted_at: now,
          });
        }
        Ok(FireAdmission::InFlight) => {
          // Requeued when the in-flight fire completes.
          SchedulerMetrics::incr(&self.state.metrics.fires_refused_in_flight);
          debug!(job_type = %job_name, "Trigger due while a fire is in flight; skipped.");
        }
        Ok(FireAdmission::NotDue(Some(next))) => {
          self.queue.push(key, Reverse(next));
        }
        Ok(FireAdmission::NotDue(None)) | Ok(FireAdmission::Missing) => {
          debug!(job_type = %job_name, "Trigger has no next fire; dropped from queue.");
        }
        Ok(FireAdmission::NotEligible(state)) => {
          debug!(job_type = %job_name, ?state, "Trigger not eligible to fire; dropped from queue.");
        }
        Err(e) => {
          error!(job_type = %job_name, error = %e, "Fire admission failed; retrying later.");
          self.queue.push(key, Reverse(now + chrono::Duration::seconds(STORE_RETRY_SECS)));
        }
      }
    }
  }

  async fn dispatch_pending(&mut self) {
    while self.active_workers() < self.state.max_workers {
      let Some(dispatch) = self.pending.pop_front() else {
        break;
      };
      let prev = self
        .state
        .active_workers_counter
        .fetch_add(1, AtomicOrdering::Relaxed);
      SchedulerMetrics::set(&self.state.metrics.workers_active_current, prev + 1);

      trace!(job_type = %dispatch.job_name, "Dispatching fire to workers.");
      if let Err(e) = self.state.job_dispatch_tx.send(dispatch).await {
        let dispatch = e.into_inner();
        error!(job_type = %dispatch.job_name, "Dispatch channel closed; fire released.");
        self.in_flight.remove(&dispatch.job_name);
        let prev = self
          .state
          .active_workers_counter
          .fetch_sub(1, AtomicOrdering::Relaxed);
        SchedulerMetrics::set(
          &self.state.metrics.workers_active_current,
          prev.saturating_sub(1),
        );
        if let Err(e) = self
          .state
          .store
          .release_fire(&dispatch.trigger_key, Some(dispatch.fire_instance))
        {
          error!(job_type = %dispatch.job_name, error = %e, "Failed to release fire.");
        }
        break;
      }
    }
  }

  /// The trigger that replaced the one `dispatch` was admitted on, provided no
  /// other fire holds it.
  fn replacement_trigger(&self, dispatch: &Dispatch) -> Option<TriggerRecord> {
    let job_type = dispatch.job_name.as_str();
    match self.state.store.get_trigger(&dispatch.trigger_key) {
      Ok(Some(trigger)) if trigger.fire_instance.is_none() => {
        info!(
          job_type,
          fire_instance = %dispatch.fire_instance,
          "Trigger was replaced while the fire was in flight; outcome applied to the new one."
        );
        Some(trigger)
      }
      Ok(_) => {
        info!(
          job_type,
          fire_instance = %dispatch.fire_instance,
          "Trigger is gone or held by another fire; outcome discarded."
        );
        None
      }
      Err(e) => {
        error!(job_type, error = %e, "Failed to read trigger; outcome not recorded.");
        None
      }
    }
  }

  /// Applies an execution outcome: failure counter, release of the block and,
  /// after a regular fire, the switch between normal and failure schedules.
  fn handle_worker_outcome(&mut self, outcome: WorkerOutcome) {
    let WorkerOutcome { dispatch, outcome } = outcome;
    let name = dispatch.job_name.as_str();
    let store = self.state.store.clone();
    if self.in_flight.get(name).map(|d| d.fire_instance) == Some(dispatch.fire_instance) {
      self.in_flight.remove(name);
    }

    let released = match store.release_fire(&dispatch.trigger_key, Some(dispatch.fire_instance)) {
      Ok(Some(trigger)) => trigger,
      // Replaced before the refresh could block the new trigger.
      Ok(None) => match self.replacement_trigger(&dispatch) {
        Some(trigger) => trigger,
        None => return,
      },
      Err(e) => {
        error!(job_type = %name, error = %e, "Failed to release fire; outcome not recorded.");
        return;
      }
    };

    let job_key = JobKey::for_job(name);
    let mut job = match store.get_job(&job_key) {
      Ok(Some(job)) => job,
      Ok(None) => {
        warn!(job_type = %name, "Job record missing when applying outcome.");
        self.requeue(&dispatch.trigger_key);
        return;
      }
      Err(e) => {
        error!(job_type = %name, error = %e, "Failed to load job record for outcome.");
        self.requeue(&dispatch.trigger_key);
        return;
      }
    };

    // Failure counter and last outcome first, then the cadence derived from them.
    let now = self.state.clock.now();
    let transition = apply_outcome(&mut job, &outcome, dispatch.execution_type, now);
    if let ExecutionOutcome::Failure { error } = &outcome {
      if transition.exceeded_retries {
        SchedulerMetrics::incr(&self.state.metrics.executions_over_retry_limit);
        error!(
          job_type = %name,
          failure_count = transition.consecutive_failures,
          max_retries = job.scheduling.max_retries,
          error = %error,
          "Job is persistently failing; staying on the failure schedule."
        );
      }
    }

    let active = derive_active_cron(&job, released.state).to_string();
    if let Err(e) = store.store_job(job) {
      error!(job_type = %name, error = %e, "Failed to persist job outcome.");
    }

    // Only a regular completion is a rescheduling point. A forced run leaves
    // the cadence to the next regular completion or reconcile.
    if dispatch.execution_type == ExecutionType::Regular && active != released.cron_expression {
      match next_fire_after(&active, now) {
        Ok(next) => match store.reschedule_job(&released.key, &active, next) {
          Ok(_) => info!(
            job_type = %name,
            from = %released.cron_expression,
            to = %active,
            failure_count = transition.consecutive_failures,
            "Switched active cron expression."
          ),
          Err(e) => error!(job_type = %name, error = %e, "Failed to reschedule trigger."),
        },
        Err(e) => error!(job_type = %name, error = %e, "Derived cron expression does not parse."),
      }
    }

    // Back in the queue at its (possibly new) next fire time; an overdue
    // time fires on the next loop iteration.
    self.requeue(&dispatch.trigger_key);
  }
}

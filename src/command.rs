use crate::error::OperatorError;
use crate::job::{ExecutionOutcome, ExecutionType, FireInstanceId, TriggerKey};
use crate::reconcile::TriggerIndex;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

/// Commands sent from the `JobScheduler` handle to the coordinator task.
#[derive(Debug)]
pub(crate) enum CoordinatorCommand {
  /// Admit an out-of-band fire of a trigger and queue it for a worker.
  ForceRun {
    trigger_key: TriggerKey,
    job_name: String,
    /// Receives the fire instance on admission.
    responder: oneshot::Sender<Result<FireInstanceId, OperatorError>>,
  },
  /// Replace the trigger set and rebuild the fire queue from the store.
  Refresh {
    index: TriggerIndex,
    responder: oneshot::Sender<()>,
  },
  /// Halt (`true`) or resume (`false`) regular firing. Forced runs are unaffected.
  SetStandby {
    standby: bool,
    responder: oneshot::Sender<()>,
  },
}

/// An admitted fire, handed from the coordinator to a worker.
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
  pub trigger_key: TriggerKey,
  pub job_name: String,
  pub fire_instance: FireInstanceId,
  pub execution_type: ExecutionType,
  pub admitted_at: DateTime<Utc>,
}

/// Sent from a worker back to the coordinator after an execution.
#[derive(Debug)]
pub(crate) struct WorkerOutcome {
  pub dispatch: Dispatch,
  pub outcome: ExecutionOutcome,
}

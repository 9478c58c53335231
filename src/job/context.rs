use super::{ExecutionType, FireInstanceId};

/// Contextual information available to a running job body via task-locals.
/// Accessible inside a registered body using `try_get_current_job_context()`
/// or the `job_context!()` macro when the `job_context` feature is enabled.
#[derive(Clone, Debug)]
pub struct JobContext {
  /// The declared name of the job being executed.
  pub job_name: String,
  /// The unique ID of this fire.
  pub fire_instance: FireInstanceId,
  pub execution_type: ExecutionType,
}

tokio::task_local! {
    /// Provides access to the current `JobContext` within a job's execution scope.
    /// Set by the worker if the `job_context` feature is enabled.
    pub static CURRENT_JOB_CONTEXT: JobContext;
}

/// Attempts to retrieve the current `JobContext` for the executing job.
///
/// Returns `None` when called outside a job body run by a worker.
pub fn try_get_current_job_context() -> Option<JobContext> {
  CURRENT_JOB_CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

/// Retrieves the current `JobContext`, panicking if called outside a
/// worker-managed job task.
///
/// # Panics
/// Panics if the `CURRENT_JOB_CONTEXT` task local has not been set.
#[macro_export]
macro_rules! job_context {
  () => {
    $crate::job::context::CURRENT_JOB_CONTEXT.with(|ctx| ctx.clone())
  };
}

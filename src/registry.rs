//! Static table of job bodies, looked up by declared job name.

use crate::job::{BoxError, BoxedJobFn, JobInvocation, JobResult};

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// A registered job type: the erased body and the payload type it binds.
pub struct RegisteredJob {
  body: BoxedJobFn,
  payload_type: &'static str,
  check_binding: fn(&Value) -> Result<(), String>,
}

impl RegisteredJob {
  pub fn payload_type(&self) -> &'static str {
    self.payload_type
  }

  /// Checks that `payload` deserializes into the registered payload type.
  pub fn bind(&self, payload: &Value) -> Result<(), String> {
    (self.check_binding)(payload)
  }

  pub(crate) fn invoke(
    &self,
    invocation: JobInvocation,
  ) -> Pin<Box<dyn Future<Output = JobResult> + Send + 'static>> {
    (self.body)(invocation)
  }
}

impl fmt::Debug for RegisteredJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RegisteredJob")
      .field("payload_type", &self.payload_type)
      .finish_non_exhaustive()
  }
}

fn check_binding<P: DeserializeOwned>(payload: &Value) -> Result<(), String> {
  P::deserialize(payload)
    .map(|_| ())
    .map_err(|e| e.to_string())
}

/// Maps job names to job bodies. Built once at startup, before `initialize`.
///
/// ```
/// use cronwarden::{JobInvocation, JobRegistry};
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct PostalCodesPayload {
///   source_url: String,
/// }
///
/// let mut registry = JobRegistry::new();
/// registry.register("PostalCodes", |payload: PostalCodesPayload, _inv: JobInvocation| async move {
///   let _ = payload.source_url;
///   Ok(())
/// });
/// assert!(registry.contains("PostalCodes"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
  jobs: HashMap<String, Arc<RegisteredJob>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers `body` under `name`. The job's persisted payload is
  /// deserialized into `P` before each run; a payload that does not bind is
  /// recorded as a failed execution. Re-registering a name replaces the body.
  pub fn register<P, F, Fut>(&mut self, name: &str, body: F) -> &mut Self
  where
    P: DeserializeOwned + Send + 'static,
    F: Fn(P, JobInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
  {
    let erased: BoxedJobFn = Box::new(move |invocation: JobInvocation| {
      let fut: Pin<Box<dyn Future<Output = JobResult> + Send + 'static>> =
        match P::deserialize(&invocation.job_data) {
          Ok(payload) => Box::pin(body(payload, invocation)),
          Err(e) => {
            let err: BoxError =
              format!("payload does not bind to {}: {}", type_name::<P>(), e).into();
            Box::pin(std::future::ready(Err(err)))
          }
        };
      fut
    });

    self.jobs.insert(
      name.to_string(),
      Arc::new(RegisteredJob {
        body: erased,
        payload_type: type_name::<P>(),
        check_binding: check_binding::<P>,
      }),
    );
    self
  }

  pub fn get(&self, name: &str) -> Option<Arc<RegisteredJob>> {
    self.jobs.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.jobs.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.jobs.keys().map(String::as_str)
  }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

// --- Execution Duration ---

/// Count and sum of execution durations.
///
/// No buckets and no percentiles: enough for a mean over the lifetime of the
/// scheduler. The two atomics are updated independently, so a snapshot taken
/// mid-record may see the count without the sum.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize, // microseconds
}

impl SimpleHistogram {
  /// Adds one observation.
  pub fn record(&self, duration: Duration) {
    self.count.fetch_add(1, Ordering::Relaxed);
    // Saturates at usize::MAX micros for absurdly long bodies.
    self.sum_micros.fetch_add(
      duration.as_micros().try_into().unwrap_or(usize::MAX),
      Ordering::Relaxed,
    );
  }

  /// Number of recorded executions.
  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Total of all recorded durations, in microseconds.
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }
}

// --- Scheduler Metrics ---

/// Shared scheduler counters.
///
/// Cloned into the coordinator, the workers and the reconciler; clones share
/// the underlying atomics. All loads and stores are `Relaxed`: counters are
/// independent of each other and of the store.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Fires (counters) ---
  /// Cron fires admitted by the store, including misfire catch-ups.
  pub fires_regular: Arc<AtomicUsize>,
  /// Out-of-band fires admitted through `force_run`.
  pub fires_forced: Arc<AtomicUsize>,
  /// Admission attempts refused because the job was already in flight.
  /// Counts both refused forced runs and regular fires that came due while
  /// an earlier fire was still executing.
  pub fires_refused_in_flight: Arc<AtomicUsize>,

  // --- Executions (counters) ---
  pub executions_succeeded: Arc<AtomicUsize>,
  /// Body errors, panics, unbindable payloads and unknown job names.
  pub executions_failed: Arc<AtomicUsize>,
  /// Executions whose body panicked. Also counted in `executions_failed`.
  pub executions_panicked: Arc<AtomicUsize>,
  /// Failures recorded while the failure count exceeded `max_retries`.
  /// The job keeps firing on its failure schedule regardless.
  pub executions_over_retry_limit: Arc<AtomicUsize>,

  // --- Reconciliation (counters) ---
  /// Full passes, including both passes of a restart-all.
  pub reconcile_runs: Arc<AtomicUsize>,
  /// Pairs created where nothing was persisted.
  pub reconcile_created: Arc<AtomicUsize>,
  /// Pairs deleted and re-created: orphans and failed validations.
  pub reconcile_recreated: Arc<AtomicUsize>,
  /// Valid pairs whose active cron expression was switched in place.
  pub reconcile_rescheduled: Arc<AtomicUsize>,
  /// Triggers and jobs removed by the cleanup pass.
  pub reconcile_deleted: Arc<AtomicUsize>,

  // --- Gauges ---
  // Overwritten by the coordinator on every loop iteration.
  /// Triggers currently waiting in the fire queue.
  pub triggers_queued_current: Arc<AtomicUsize>,
  /// Workers currently running a job body.
  pub workers_active_current: Arc<AtomicUsize>,

  // --- Histograms ---
  /// Wall-clock duration of job bodies, regular and forced alike.
  pub execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn set(gauge: &AtomicUsize, value: usize) {
    gauge.store(value, Ordering::Relaxed);
  }

  /// Point-in-time copy of every counter.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      fires_regular: self.fires_regular.load(order),
      fires_forced: self.fires_forced.load(order),
      fires_refused_in_flight: self.fires_refused_in_flight.load(order),
      executions_succeeded: self.executions_succeeded.load(order),
      executions_failed: self.executions_failed.load(order),
      executions_panicked: self.executions_panicked.load(order),
      executions_over_retry_limit: self.executions_over_retry_limit.load(order),
      reconcile_runs: self.reconcile_runs.load(order),
      reconcile_created: self.reconcile_created.load(order),
      reconcile_recreated: self.reconcile_recreated.load(order),
      reconcile_rescheduled: self.reconcile_rescheduled.load(order),
      reconcile_deleted: self.reconcile_deleted.load(order),
      triggers_queued_current: self.triggers_queued_current.load(order),
      workers_active_current: self.workers_active_current.load(order),
      execution_duration_count: self.execution_duration.get_count(),
      execution_duration_sum_micros: self.execution_duration.get_sum_micros(),
    }
  }
}

// --- Snapshot ---

/// A snapshot of the scheduler's metrics at a specific point in time.
///
/// Field meanings match [`SchedulerMetrics`]; the histogram is flattened into
/// `execution_duration_count` and `execution_duration_sum_micros`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
  pub fires_regular: usize,
  pub fires_forced: usize,
  pub fires_refused_in_flight: usize,
  pub executions_succeeded: usize,
  pub executions_failed: usize,
  pub executions_panicked: usize,
  pub executions_over_retry_limit: usize,
  pub reconcile_runs: usize,
  pub reconcile_created: usize,
  pub reconcile_recreated: usize,
  pub reconcile_rescheduled: usize,
  pub reconcile_deleted: usize,
  pub triggers_queued_current: usize,
  pub workers_active_current: usize,
  pub execution_duration_count: usize,
  pub execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Mean execution duration, or `None` if nothing has completed yet.
  pub fn mean_execution_duration(&self) -> Option<Duration> {
    if self.execution_duration_count == 0 {
      None
    } else {
      let mean = self.execution_duration_sum_micros as f64 / self.execution_duration_count as f64;
      Some(Duration::from_micros(mean as u64))
    }
  }
}

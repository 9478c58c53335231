//! Clock and cron calendar.
//!
//! All schedules are evaluated in UTC. Expressions use the six or seven field
//! form of the `cron` crate (seconds first). The Quartz "no specific value"
//! marker `?` is accepted and treated as `*`.

use crate::error::CronError;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ::cron::Schedule;
use parking_lot::Mutex;

/// A parsed cron expression that remembers the text it was declared with.
#[derive(Clone, Debug)]
pub struct CronExpression {
  source: String,
  schedule: Schedule,
}

impl CronExpression {
  pub fn parse(expression: &str) -> Result<Self, CronError> {
    let normalized = expression.trim().replace('?', "*");
    let schedule = Schedule::from_str(&normalized).map_err(|e| CronError {
      expression: expression.to_string(),
      reason: e.to_string(),
    })?;
    Ok(Self {
      source: expression.to_string(),
      schedule,
    })
  }

  /// The expression as declared (before `?` normalization).
  pub fn as_str(&self) -> &str {
    &self.source
  }

  /// First fire time strictly after `after`, or `None` if the expression never fires again.
  pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    self.schedule.after(&after).next()
  }
}

impl PartialEq for CronExpression {
  fn eq(&self, other: &Self) -> bool {
    self.source == other.source
  }
}

impl Eq for CronExpression {}

impl fmt::Display for CronExpression {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.source)
  }
}

/// Parses `expression` and returns its first fire time after `after`.
pub fn next_fire_after(
  expression: &str,
  after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, CronError> {
  Ok(CronExpression::parse(expression)?.next_after(after))
}

/// Source of "now" for the scheduler.
pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    *self.now.lock() = now;
  }

  pub fn advance(&self, by: ChronoDuration) {
    let mut guard = self.now.lock();
    *guard = *guard + by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

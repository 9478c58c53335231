//! JSON file store.
//!
//! Keeps the records in a `MemoryStore` and rewrites the whole document after
//! every mutation, via a temp file and a rename.

use super::{
  FireAdmission, FireRequest, JobRecord, MemoryStore, ScheduleStore, StoreSnapshot, TriggerRecord,
};
use crate::error::StoreError;
use crate::job::{FireInstanceId, JobKey, TriggerKey};

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// File format version for migration support
const FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreDocument {
  version: u32,
  modified_at: DateTime<Utc>,
  #[serde(flatten)]
  contents: StoreSnapshot,
}

#[derive(Debug)]
pub struct JsonFileStore {
  path: PathBuf,
  temp_path: PathBuf,
  inner: MemoryStore,
  /// Serializes mutate-then-persist sequences.
  write_lock: Mutex<()>,
}

impl JsonFileStore {
  /// Opens the store at `path`, loading existing contents if the file exists.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
    let path = path.as_ref().to_path_buf();
    let temp_path = path.with_extension("json.tmp");

    let contents = if path.exists() {
      let file = File::open(&path).map_err(|source| StoreError::Io {
        path: path.clone(),
        source,
      })?;
      let document: StoreDocument = serde_json::from_reader(BufReader::new(file))?;
      if document.version != FILE_VERSION {
        return Err(StoreError::Unavailable(format!(
          "unsupported store file version {} in {}",
          document.version,
          path.display()
        )));
      }
      info!(
        path = %path.display(),
        jobs = document.contents.jobs.len(),
        triggers = document.contents.triggers.len(),
        "Loaded schedule store."
      );
      document.contents
    } else {
      debug!(path = %path.display(), "No store file yet; starting empty.");
      StoreSnapshot::default()
    };

    Ok(Self {
      path,
      temp_path,
      inner: MemoryStore::from_snapshot(contents),
      write_lock: Mutex::new(()),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn snapshot(&self) -> StoreSnapshot {
    self.inner.snapshot()
  }

  fn persist(&self, contents: StoreSnapshot) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
      path: self.temp_path.clone(),
      source,
    };

    if let Some(parent) = self.path.parent() {
      if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).map_err(io_err)?;
      }
    }

    let document = StoreDocument {
      version: FILE_VERSION,
      modified_at: Utc::now(),
      contents,
    };
    let file = File::create(&self.temp_path).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &document)?;
    writer.flush().map_err(io_err)?;
    writer.get_ref().sync_all().map_err(io_err)?;

    fs::rename(&self.temp_path, &self.path).map_err(|source| StoreError::Io {
      path: self.path.clone(),
      source,
    })
  }

  /// Applies `op` and persists the result. The in-memory contents are rolled
  /// back if the write fails.
  fn mutate<R>(
    &self,
    op: impl FnOnce(&MemoryStore) -> Result<R, StoreError>,
  ) -> Result<R, StoreError> {
    let _guard = self.write_lock.lock();
    let before = self.inner.snapshot();
    let result = op(&self.inner)?;
    let after = self.inner.snapshot();
    if after == before {
      return Ok(result);
    }
    if let Err(e) = self.persist(after) {
      self.inner.replace(before);
      return Err(e);
    }
    Ok(result)
  }
}

impl ScheduleStore for JsonFileStore {
  fn get_trigger(&self, key: &TriggerKey) -> Result<Option<TriggerRecord>, StoreError> {
    self.inner.get_trigger(key)
  }

  fn get_job(&self, key: &JobKey) -> Result<Option<JobRecord>, StoreError> {
    self.inner.get_job(key)
  }

  fn triggers_of_job(&self, job_key: &JobKey) -> Result<Vec<TriggerRecord>, StoreError> {
    self.inner.triggers_of_job(job_key)
  }

  fn trigger_keys(&self) -> Result<Vec<TriggerKey>, StoreError> {
    self.inner.trigger_keys()
  }

  fn job_keys(&self) -> Result<Vec<JobKey>, StoreError> {
    self.inner.job_keys()
  }

  fn schedule_job(&self, job: JobRecord, trigger: TriggerRecord) -> Result<(), StoreError> {
    self.mutate(|s| s.schedule_job(job, trigger))
  }

  fn store_job(&self, job: JobRecord) -> Result<(), StoreError> {
    self.mutate(|s| s.store_job(job))
  }

  fn store_trigger(&self, trigger: TriggerRecord) -> Result<(), StoreError> {
    self.mutate(|s| s.store_trigger(trigger))
  }

  fn unschedule_job(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.mutate(|s| s.unschedule_job(key))
  }

  fn delete_job(&self, key: &JobKey) -> Result<bool, StoreError> {
    self.mutate(|s| s.delete_job(key))
  }

  fn reschedule_job(
    &self,
    key: &TriggerKey,
    cron_expression: &str,
    next_fire_time: Option<DateTime<Utc>>,
  ) -> Result<bool, StoreError> {
    self.mutate(|s| s.reschedule_job(key, cron_expression, next_fire_time))
  }

  fn pause_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.mutate(|s| s.pause_trigger(key))
  }

  fn resume_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
    self.mutate(|s| s.resume_trigger(key))
  }

  fn pause_all(&self) -> Result<(), StoreError> {
    self.mutate(|s| s.pause_all())
  }

  fn resume_all(&self) -> Result<(), StoreError> {
    self.mutate(|s| s.resume_all())
  }

  fn begin_fire(
    &self,
    key: &TriggerKey,
    instance: FireInstanceId,
    request: FireRequest<'_>,
  ) -> Result<FireAdmission, StoreError> {
    self.mutate(|s| s.begin_fire(key, instance, request))
  }

  fn release_fire(
    &self,
    key: &TriggerKey,
    instance: Option<FireInstanceId>,
  ) -> Result<Option<TriggerRecord>, StoreError> {
    self.mutate(|s| s.release_fire(key, instance))
  }
}

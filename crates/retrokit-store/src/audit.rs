//! Append-only audit trail.
//!
//! Every mutation decision is recorded as one JSON object per line. Recording
//! never fails from the caller's point of view: a record that cannot be written
//! is counted and dropped.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use retrokit_security::{ValidatedPath, ValidationError, ValidationObserver};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub status: AuditStatus,
    pub component: String,
    pub context: Value,
}

#[derive(Debug)]
struct AuditSink {
    path: PathBuf,
    max_bytes: u64,
    backup_count: u32,
}

#[derive(Debug)]
pub struct AuditLog {
    sink: Option<Mutex<AuditSink>>,
    dropped: AtomicU64,
}

impl AuditLog {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backup_count: u32) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self {
            sink: Some(Mutex::new(AuditSink {
                path,
                max_bytes: max_bytes.max(1),
                backup_count,
            })),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|sink| sink.lock().path.clone())
    }

    /// Number of records that could not be written.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn record(&self, event_type: &str, status: AuditStatus, component: &str, context: Value) {
        let Some(sink) = &self.sink else {
            return;
        };

        let event = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event_type: event_type.to_string(),
            status,
            component: component.to_string(),
            context,
        };

        let sink = sink.lock();
        if let Err(err) = sink.append(&event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                path = %sink.path.display(),
                event_type,
                error = %err,
                "dropped audit record"
            );
        }
    }
}

impl AuditSink {
    fn append(&self, event: &AuditEvent) -> io::Result<()> {
        let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
        line.push(b'\n');

        let current_len = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err),
        };
        if current_len > 0 && current_len + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()
    }

    fn rotate(&self) -> io::Result<()> {
        if self.backup_count == 0 {
            return remove_if_exists(&self.path);
        }

        remove_if_exists(&rotated_path(&self.path, self.backup_count))?;
        for index in (1..self.backup_count).rev() {
            let from = rotated_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))
    }
}

pub(crate) fn rotated_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

impl ValidationObserver for AuditLog {
    fn observe(&self, raw: &str, outcome: Result<&ValidatedPath, &ValidationError>) {
        match outcome {
            Ok(path) => self.record(
                "path_validation",
                AuditStatus::Success,
                "path_validator",
                json!({ "input": raw, "resolved": path.to_string() }),
            ),
            Err(err) => self.record(
                "path_validation",
                AuditStatus::Failure,
                "path_validator",
                json!({
                    "input": raw,
                    "layer": err.layer().as_str(),
                    "detail": err.detail(),
                }),
            ),
        }
    }
}

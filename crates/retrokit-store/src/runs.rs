use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::atomic::persist_atomically;
use crate::{BackupError, StateLayout, OWNER_ONLY_MODE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Applying,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applying => "applying",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: u32,
    pub run_id: String,
    pub operation: String,
    pub project_root: PathBuf,
    pub status: RunStatus,
    pub started_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    /// An existing file was copied aside.
    Backup,
    /// The path did not exist before the step; rollback removes it.
    Absent,
    Restored,
    Discarded,
    CleanedUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub step: String,
    pub kind: JournalKind,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub recorded_at: String,
}

/// UTC timestamp with microseconds, e.g. `20261015T093000.123456Z`.
pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

pub(crate) fn create_run_dir(layout: &StateLayout, project_key: &str) -> Result<String, BackupError> {
    let parent = layout.project_backups_dir(project_key);
    fs::create_dir_all(&parent)
        .map_err(BackupError::io(format!("failed to create {}", parent.display())))?;

    loop {
        let run_id = new_run_id();
        let dir = layout.run_dir(project_key, &run_id);
        match fs::create_dir(&dir) {
            Ok(()) => {
                restrict_dir(&dir)?;
                return Ok(run_id);
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(BackupError::Io {
                    context: format!("failed to create run dir {}", dir.display()),
                    source: err,
                })
            }
        }
    }
}

#[cfg(unix)]
pub(crate) fn restrict_dir(dir: &Path) -> Result<(), BackupError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .map_err(BackupError::io(format!("failed to restrict {}", dir.display())))
}

#[cfg(not(unix))]
pub(crate) fn restrict_dir(_dir: &Path) -> Result<(), BackupError> {
    Ok(())
}

pub(crate) fn write_run_metadata(
    layout: &StateLayout,
    project_key: &str,
    metadata: &RunMetadata,
) -> Result<PathBuf, BackupError> {
    let path = layout.run_metadata_path(project_key, &metadata.run_id);
    let mut payload = serde_json::to_vec_pretty(metadata).map_err(|source| BackupError::Encoding {
        context: format!("failed to encode run metadata {}", metadata.run_id),
        source,
    })?;
    payload.push(b'\n');
    persist_atomically(&path, &payload, Some(OWNER_ONLY_MODE))
        .map_err(BackupError::io(format!("failed to write run metadata {}", path.display())))?;
    Ok(path)
}

pub fn read_run_metadata(
    layout: &StateLayout,
    project_key: &str,
    run_id: &str,
) -> Result<Option<RunMetadata>, BackupError> {
    let path = layout.run_metadata_path(project_key, run_id);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(BackupError::Io {
                context: format!("failed to read run metadata {}", path.display()),
                source,
            })
        }
    };
    let metadata = serde_json::from_slice(&raw).map_err(|source| BackupError::Encoding {
        context: format!("failed parsing run metadata {}", path.display()),
        source,
    })?;
    Ok(Some(metadata))
}

pub(crate) fn update_run_status(
    layout: &StateLayout,
    project_key: &str,
    run_id: &str,
    status: RunStatus,
) -> Result<(), BackupError> {
    let mut metadata = read_run_metadata(layout, project_key, run_id)?.ok_or_else(|| {
        BackupError::UnknownRun {
            run_id: run_id.to_string(),
        }
    })?;
    metadata.status = status;
    write_run_metadata(layout, project_key, &metadata)?;
    Ok(())
}

pub(crate) fn append_journal_entry(
    layout: &StateLayout,
    project_key: &str,
    run_id: &str,
    entry: &JournalEntry,
) -> Result<(), BackupError> {
    let path = layout.run_journal_path(project_key, run_id);
    let mut line = serde_json::to_vec(entry).map_err(|source| BackupError::Encoding {
        context: format!("failed to encode journal entry {}", entry.seq),
        source,
    })?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(BackupError::io(format!("failed to open run journal {}", path.display())))?;
    file.write_all(&line)
        .and_then(|()| file.sync_data())
        .map_err(BackupError::io(format!("failed to append run journal {}", path.display())))
}

pub fn read_journal(
    layout: &StateLayout,
    project_key: &str,
    run_id: &str,
) -> Result<Vec<JournalEntry>, BackupError> {
    let path = layout.run_journal_path(project_key, run_id);
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::Io {
                context: format!("failed to open run journal {}", path.display()),
                source,
            })
        }
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(BackupError::io(format!(
            "failed to read run journal {}",
            path.display()
        )))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line).map_err(|source| BackupError::Encoding {
            context: format!("invalid run journal line {} in {}", index + 1, path.display()),
            source,
        })?;
        entries.push(entry);
    }
    entries.sort_by_key(|entry: &JournalEntry| entry.seq);
    Ok(entries)
}

pub fn list_runs(layout: &StateLayout, project_key: &str) -> Result<Vec<RunMetadata>, BackupError> {
    let dir = layout.project_backups_dir(project_key);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::Io {
                context: format!("failed to read {}", dir.display()),
                source,
            })
        }
    };

    let mut runs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(BackupError::io(format!("failed to read {}", dir.display())))?;
        if !entry.file_type().map(|kind| kind.is_dir()).unwrap_or(false) {
            continue;
        }
        let Some(run_id) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        if let Some(metadata) = read_run_metadata(layout, project_key, &run_id)? {
            runs.push(metadata);
        }
    }
    runs.sort_by(|a, b| a.run_id.cmp(&b.run_id));
    Ok(runs)
}

pub(crate) fn claim_active_run(
    layout: &StateLayout,
    project_key: &str,
    run_id: &str,
) -> Result<(), BackupError> {
    let path = layout.active_run_path(project_key);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(BackupError::io(format!("failed to create {}", parent.display())))?;
    }

    loop {
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                return file
                    .write_all(format!("{run_id}\n").as_bytes())
                    .and_then(|()| file.flush())
                    .map_err(BackupError::io(format!(
                        "failed to write active run marker {}",
                        path.display()
                    )));
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                let Some(active) = read_active_run(layout, project_key)? else {
                    clear_active_run(layout, project_key)?;
                    continue;
                };
                if active == run_id {
                    return Ok(());
                }
                match read_run_metadata(layout, project_key, &active)? {
                    Some(metadata) if metadata.status.is_finished() => {
                        clear_active_run(layout, project_key)?;
                    }
                    Some(metadata) => {
                        return Err(BackupError::RunInProgress {
                            run_id: active,
                            status: metadata.status.as_str().to_string(),
                        });
                    }
                    None => {
                        return Err(BackupError::RunInProgress {
                            run_id: active,
                            status: "metadata_missing".to_string(),
                        });
                    }
                }
            }
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to claim active run marker {}", path.display()),
                    source,
                });
            }
        }
    }
}

pub(crate) fn read_active_run(
    layout: &StateLayout,
    project_key: &str,
) -> Result<Option<String>, BackupError> {
    let path = layout.active_run_path(project_key);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(BackupError::Io {
                context: format!("failed to read active run marker {}", path.display()),
                source,
            })
        }
    };
    let run_id = raw.trim();
    if run_id.is_empty() {
        return Ok(None);
    }
    Ok(Some(run_id.to_string()))
}

pub(crate) fn clear_active_run(layout: &StateLayout, project_key: &str) -> Result<(), BackupError> {
    let path = layout.active_run_path(project_key);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BackupError::Io {
            context: format!("failed to clear active run marker {}", path.display()),
            source,
        }),
    }
}

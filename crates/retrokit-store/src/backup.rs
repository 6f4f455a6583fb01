use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use retrokit_security::{sha256_hex, verify_sha256, PathValidator, ValidatedPath};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::atomic::{mode_of, persist_atomically};
use crate::runs::{
    append_journal_entry, claim_active_run, clear_active_run, create_run_dir, read_journal,
    read_run_metadata, restrict_dir, update_run_status, write_run_metadata, JournalEntry,
    JournalKind, RunMetadata, RunStatus,
};
use crate::{
    list_runs, project_key, write_atomic_with_mode, AuditLog, AuditStatus, BackupError,
    StateLayout, OWNER_ONLY_MODE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub created_at: String,
    pub permission_mode: u32,
    pub sha256: String,
    pub run_id: String,
}

/// Owns the backups of one run against one project.
///
/// Holding a manager means holding the project's active-run marker; call
/// [`BackupManager::finish`] to release it.
///
/// Project paths are checked against the caller's validator only. The backup
/// store is an allowed root for backup copies and nothing else.
#[derive(Debug)]
pub struct BackupManager {
    layout: StateLayout,
    project_key: String,
    project_root: PathBuf,
    validator: PathValidator,
    store_validator: PathValidator,
    audit: Arc<AuditLog>,
    run_id: String,
    next_seq: u64,
}

impl BackupManager {
    /// Starts a fresh run and claims the project's active-run marker.
    pub fn begin(
        layout: &StateLayout,
        validator: &PathValidator,
        audit: Arc<AuditLog>,
        operation: &str,
    ) -> Result<Self, BackupError> {
        let (project_root, key, store_validator) = prepare(layout, validator)?;
        let run_id = create_run_dir(layout, &key)?;
        claim_active_run(layout, &key, &run_id).inspect_err(|_| {
            let _ = fs::remove_dir_all(layout.run_dir(&key, &run_id));
        })?;

        let metadata = RunMetadata {
            version: 1,
            run_id: run_id.clone(),
            operation: operation.to_string(),
            project_root: project_root.clone(),
            status: RunStatus::Applying,
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        if let Err(err) = write_run_metadata(layout, &key, &metadata) {
            let _ = clear_active_run(layout, &key);
            let _ = fs::remove_dir_all(layout.run_dir(&key, &run_id));
            return Err(err);
        }

        audit.record(
            "run_started",
            AuditStatus::Success,
            "backup_manager",
            json!({ "run_id": run_id, "operation": operation, "project_root": project_root.display().to_string() }),
        );
        info!(run_id = %run_id, operation, "backup run started");

        Ok(Self {
            layout: layout.clone(),
            project_key: key,
            project_root,
            validator: validator.clone(),
            store_validator,
            audit,
            run_id,
            next_seq: 1,
        })
    }

    /// Reopens a recorded run, e.g. to roll it back from a later process.
    pub fn resume(
        layout: &StateLayout,
        validator: &PathValidator,
        audit: Arc<AuditLog>,
        run_id: &str,
    ) -> Result<Self, BackupError> {
        let (project_root, key, store_validator) = prepare(layout, validator)?;
        if read_run_metadata(layout, &key, run_id)?.is_none() {
            return Err(BackupError::UnknownRun {
                run_id: run_id.to_string(),
            });
        }
        claim_active_run(layout, &key, run_id)?;
        let next_seq = read_journal(layout, &key, run_id)?
            .last()
            .map(|entry| entry.seq + 1)
            .unwrap_or(1);

        Ok(Self {
            layout: layout.clone(),
            project_key: key,
            project_root,
            validator: validator.clone(),
            store_validator,
            audit,
            run_id: run_id.to_string(),
            next_seq,
        })
    }

    /// Runs recorded for the validator's project, oldest first.
    pub fn runs(
        layout: &StateLayout,
        validator: &PathValidator,
    ) -> Result<Vec<RunMetadata>, BackupError> {
        list_runs(layout, &project_key(validator.project_root()))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// The project-only validator every step mutation goes through.
    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    pub fn journal(&self) -> Result<Vec<JournalEntry>, BackupError> {
        read_journal(&self.layout, &self.project_key, &self.run_id)
    }

    pub fn create_backup(&mut self, path: &ValidatedPath, step: &str) -> Result<Backup, BackupError> {
        let result = self.copy_aside(path, step);
        match &result {
            Ok(backup) => self.audit.record(
                "backup_created",
                AuditStatus::Success,
                "backup_manager",
                json!({
                    "run_id": self.run_id,
                    "step": step,
                    "source": backup.source_path.display().to_string(),
                    "backup": backup.backup_path.display().to_string(),
                }),
            ),
            Err(err) => self.audit.record(
                "backup_created",
                AuditStatus::Failure,
                "backup_manager",
                json!({ "run_id": self.run_id, "step": step, "source": path.to_string(), "error": err.to_string() }),
            ),
        }
        result
    }

    fn copy_aside(&mut self, path: &ValidatedPath, step: &str) -> Result<Backup, BackupError> {
        let metadata = fs::symlink_metadata(path.as_path())
            .map_err(BackupError::io(format!("failed to stat {path}")))?;
        if metadata.file_type().is_symlink() {
            return Err(BackupError::SymlinkSubstituted {
                path: path.as_path().to_path_buf(),
            });
        }
        if !metadata.is_file() {
            return Err(BackupError::NotARegularFile {
                path: path.as_path().to_path_buf(),
            });
        }

        let content =
            fs::read(path.as_path()).map_err(BackupError::io(format!("failed to read {path}")))?;
        let digest = sha256_hex(&content);
        let seq = self.next_seq;

        let backup_path = self
            .layout
            .run_files_dir(&self.project_key, &self.run_id)
            .join(format!("{seq:04}"))
            .join(self.relative_name(path.as_path()));
        let backup_parent = backup_path.parent().ok_or_else(|| BackupError::NotARegularFile {
            path: backup_path.clone(),
        })?;
        fs::create_dir_all(backup_parent)
            .map_err(BackupError::io(format!("failed to create {}", backup_parent.display())))?;
        restrict_dir(backup_parent)?;
        persist_atomically(&backup_path, &content, Some(OWNER_ONLY_MODE))
            .map_err(BackupError::io(format!("failed to write backup {}", backup_path.display())))?;

        // The copy is checked again after the write; a swapped-in symlink fails here.
        let checked = self
            .store_validator
            .validate_path(&backup_path)
            .map_err(|err| BackupError::from_revalidation(err, backup_path.clone()))?;
        let written = fs::symlink_metadata(checked.as_path())
            .map_err(BackupError::io(format!("failed to stat {checked}")))?;
        if !written.is_file() {
            return Err(BackupError::SymlinkSubstituted { path: backup_path });
        }

        let backup = Backup {
            source_path: path.as_path().to_path_buf(),
            backup_path: checked.as_path().to_path_buf(),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            permission_mode: mode_of(&metadata),
            sha256: digest,
            run_id: self.run_id.clone(),
        };
        self.journal_entry(JournalEntry {
            seq,
            step: step.to_string(),
            kind: JournalKind::Backup,
            source: backup.source_path.clone(),
            backup: Some(backup.backup_path.clone()),
            permission_mode: Some(backup.permission_mode),
            sha256: Some(backup.sha256.clone()),
            recorded_at: backup.created_at.clone(),
        })?;
        debug!(source = %backup.source_path.display(), backup = %backup.backup_path.display(), "backup created");
        Ok(backup)
    }

    /// Records that `path` did not exist before `step`, so rollback removes it.
    pub fn record_absent(&mut self, path: &ValidatedPath, step: &str) -> Result<(), BackupError> {
        let seq = self.next_seq;
        self.journal_entry(JournalEntry {
            seq,
            step: step.to_string(),
            kind: JournalKind::Absent,
            source: path.as_path().to_path_buf(),
            backup: None,
            permission_mode: None,
            sha256: None,
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }

    pub fn restore(&mut self, backup: &Backup) -> Result<(), BackupError> {
        let result = self.restore_checked(backup);
        let (status, error) = match &result {
            Ok(()) => (AuditStatus::Success, None),
            Err(err) => (AuditStatus::Failure, Some(err.to_string())),
        };
        self.audit.record(
            "backup_restored",
            status,
            "backup_manager",
            json!({
                "run_id": self.run_id,
                "source": backup.source_path.display().to_string(),
                "backup": backup.backup_path.display().to_string(),
                "error": error,
            }),
        );
        result
    }

    fn restore_checked(&mut self, backup: &Backup) -> Result<(), BackupError> {
        let (target, content) = self.inspect(backup)?;
        if let Some(parent) = target.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(BackupError::io(format!("failed to recreate {}", parent.display())))?;
            }
        }
        write_atomic_with_mode(&target, &content, backup.permission_mode)
            .map_err(BackupError::io(format!("failed to restore {target}")))?;

        let seq = self.next_seq;
        self.journal_entry(JournalEntry {
            seq,
            step: "restore".to_string(),
            kind: JournalKind::Restored,
            source: backup.source_path.clone(),
            backup: Some(backup.backup_path.clone()),
            permission_mode: Some(backup.permission_mode),
            sha256: Some(backup.sha256.clone()),
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        })?;
        info!(target = %target, "restored from backup");
        Ok(())
    }

    /// Every check `restore` makes, without writing. Returns the target and verified content.
    fn inspect(&self, backup: &Backup) -> Result<(ValidatedPath, Vec<u8>), BackupError> {
        let target = self
            .validator
            .validate_path(&backup.source_path)
            .map_err(|err| BackupError::from_revalidation(err, backup.source_path.clone()))?;
        let stored = self
            .store_validator
            .validate_path(&backup.backup_path)
            .map_err(|err| BackupError::from_revalidation(err, backup.backup_path.clone()))?;

        let stored_meta = fs::symlink_metadata(stored.as_path())
            .map_err(BackupError::io(format!("failed to stat backup {stored}")))?;
        if !stored_meta.is_file() {
            return Err(BackupError::NotARegularFile {
                path: stored.as_path().to_path_buf(),
            });
        }
        match fs::symlink_metadata(target.as_path()) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(BackupError::SymlinkSubstituted {
                    path: target.as_path().to_path_buf(),
                })
            }
            Ok(meta) if !meta.is_file() => {
                return Err(BackupError::NotARegularFile {
                    path: target.as_path().to_path_buf(),
                })
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to stat restore target {target}"),
                    source,
                })
            }
        }

        let content = fs::read(stored.as_path())
            .map_err(BackupError::io(format!("failed to read backup {stored}")))?;
        if !verify_sha256(&content, &backup.sha256) {
            return Err(BackupError::ChecksumMismatch {
                path: stored.as_path().to_path_buf(),
                expected: backup.sha256.clone(),
                actual: sha256_hex(&content),
            });
        }
        Ok((target, content))
    }

    /// Removes a path recorded as absent. Non-empty directories are left in place.
    pub fn discard_created(&mut self, path: &Path) -> Result<(), BackupError> {
        let checked = self
            .validator
            .validate_path(path)
            .map_err(|err| BackupError::from_revalidation(err, path.to_path_buf()))?;
        let removed = match fs::symlink_metadata(checked.as_path()) {
            Ok(meta) if meta.is_dir() => match fs::remove_dir(checked.as_path()) {
                Ok(()) => true,
                Err(err) => {
                    warn!(path = %checked, error = %err, "created directory not empty; leaving it in place");
                    false
                }
            },
            Ok(_) => {
                fs::remove_file(checked.as_path())
                    .map_err(BackupError::io(format!("failed to remove {checked}")))?;
                true
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to stat {checked}"),
                    source,
                })
            }
        };

        if removed {
            let seq = self.next_seq;
            self.journal_entry(JournalEntry {
                seq,
                step: "rollback".to_string(),
                kind: JournalKind::Discarded,
                source: checked.as_path().to_path_buf(),
                backup: None,
                permission_mode: None,
                sha256: None,
                recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            })?;
            self.audit.record(
                "created_path_removed",
                AuditStatus::Success,
                "backup_manager",
                json!({ "run_id": self.run_id, "path": checked.to_string() }),
            );
        }
        Ok(())
    }

    /// Deletes one backup copy. Only ever called after verified success.
    pub fn cleanup(&mut self, backup: &Backup) -> Result<(), BackupError> {
        let stored = self
            .store_validator
            .validate_path(&backup.backup_path)
            .map_err(|err| BackupError::from_revalidation(err, backup.backup_path.clone()))?;
        let backups_dir = self.layout.project_backups_dir(&self.project_key);
        let canonical_backups = fs::canonicalize(&backups_dir)
            .map_err(BackupError::io(format!("failed to resolve {}", backups_dir.display())))?;
        if !stored.as_path().starts_with(&canonical_backups) {
            return Err(BackupError::NotARegularFile {
                path: stored.as_path().to_path_buf(),
            });
        }
        match fs::remove_file(stored.as_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to remove backup {stored}"),
                    source,
                })
            }
        }

        let seq = self.next_seq;
        self.journal_entry(JournalEntry {
            seq,
            step: "cleanup".to_string(),
            kind: JournalKind::CleanedUp,
            source: backup.source_path.clone(),
            backup: Some(backup.backup_path.clone()),
            permission_mode: None,
            sha256: None,
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        })?;
        self.audit.record(
            "backup_cleaned",
            AuditStatus::Success,
            "backup_manager",
            json!({ "run_id": self.run_id, "backup": backup.backup_path.display().to_string() }),
        );
        Ok(())
    }

    /// Backups recorded in this run's journal that have not been cleaned up.
    pub fn recorded_backups(&self) -> Result<Vec<Backup>, BackupError> {
        let journal = self.journal()?;
        let cleaned = journal
            .iter()
            .filter(|entry| entry.kind == JournalKind::CleanedUp)
            .filter_map(|entry| entry.backup.clone())
            .collect::<Vec<_>>();
        Ok(journal
            .into_iter()
            .filter(|entry| entry.kind == JournalKind::Backup)
            .filter_map(|entry| {
                let backup_path = entry.backup?;
                if cleaned.contains(&backup_path) {
                    return None;
                }
                Some(Backup {
                    source_path: entry.source,
                    backup_path,
                    created_at: entry.recorded_at,
                    permission_mode: entry.permission_mode.unwrap_or(OWNER_ONLY_MODE),
                    sha256: entry.sha256.unwrap_or_default(),
                    run_id: self.run_id.clone(),
                })
            })
            .collect())
    }

    /// Checks that the whole run can be replayed without writing anything.
    ///
    /// Fails if any copy was cleaned up, is missing, or no longer matches its
    /// checksum, or if any recorded path no longer validates. Returns the
    /// number of changes a replay would undo.
    pub fn check_restorable(&self) -> Result<usize, BackupError> {
        Ok(self.replay_plan()?.len())
    }

    /// Replays the whole run backwards: created paths are removed and backups restored.
    ///
    /// Nothing is written and the run status is left alone unless every entry
    /// passes [`BackupManager::check_restorable`] first.
    pub fn restore_run(&mut self) -> Result<usize, BackupError> {
        let plan = self.replay_plan()?;
        update_run_status(&self.layout, &self.project_key, &self.run_id, RunStatus::RollingBack)?;
        let mut replayed = 0;
        for entry in plan {
            match entry {
                Replay::Restore(backup) => self.restore(&backup)?,
                Replay::Discard(path) => self.discard_created(&path)?,
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Journal entries to undo, newest first, each already checked.
    fn replay_plan(&self) -> Result<Vec<Replay>, BackupError> {
        let journal = self.journal()?;
        let cleaned = journal
            .iter()
            .filter(|entry| entry.kind == JournalKind::CleanedUp)
            .filter_map(|entry| entry.backup.as_ref())
            .collect::<Vec<_>>();

        let mut plan = Vec::new();
        for entry in journal.iter().rev() {
            match entry.kind {
                JournalKind::Backup => {
                    let Some(backup_path) = entry.backup.clone() else {
                        continue;
                    };
                    if cleaned.contains(&&backup_path) {
                        return Err(BackupError::BackupsCleaned {
                            run_id: self.run_id.clone(),
                            path: backup_path,
                        });
                    }
                    let backup = Backup {
                        source_path: entry.source.clone(),
                        backup_path,
                        created_at: entry.recorded_at.clone(),
                        permission_mode: entry.permission_mode.unwrap_or(OWNER_ONLY_MODE),
                        sha256: entry.sha256.clone().unwrap_or_default(),
                        run_id: self.run_id.clone(),
                    };
                    self.inspect(&backup)?;
                    plan.push(Replay::Restore(backup));
                }
                JournalKind::Absent => {
                    self.validator
                        .validate_path(&entry.source)
                        .map_err(|err| BackupError::from_revalidation(err, entry.source.clone()))?;
                    plan.push(Replay::Discard(entry.source.clone()));
                }
                JournalKind::Restored | JournalKind::Discarded | JournalKind::CleanedUp => {}
            }
        }
        Ok(plan)
    }

    /// Removes every backup copy of this run; metadata and journal stay for the record.
    pub fn cleanup_run(&mut self) -> Result<usize, BackupError> {
        let backups = self.recorded_backups()?;
        let count = backups.len();
        for backup in &backups {
            self.cleanup(backup)?;
        }
        Ok(count)
    }

    /// Records the run's final status and releases the active-run marker.
    pub fn finish(self, status: RunStatus) -> Result<(), BackupError> {
        update_run_status(&self.layout, &self.project_key, &self.run_id, status)?;
        clear_active_run(&self.layout, &self.project_key)?;
        self.audit.record(
            "run_finished",
            if matches!(status, RunStatus::Committed) {
                AuditStatus::Success
            } else {
                AuditStatus::Failure
            },
            "backup_manager",
            json!({ "run_id": self.run_id, "status": status.as_str() }),
        );
        info!(run_id = %self.run_id, status = status.as_str(), "backup run finished");
        Ok(())
    }

    /// Releases the active-run marker and leaves the recorded status as it is.
    pub fn release(self) -> Result<(), BackupError> {
        clear_active_run(&self.layout, &self.project_key)
    }

    fn journal_entry(&mut self, entry: JournalEntry) -> Result<(), BackupError> {
        append_journal_entry(&self.layout, &self.project_key, &self.run_id, &entry)?;
        self.next_seq = entry.seq + 1;
        Ok(())
    }

    fn relative_name(&self, source: &Path) -> PathBuf {
        match source.strip_prefix(&self.project_root) {
            Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
            _ => {
                let name = source
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string());
                let digest = sha256_hex(source.to_string_lossy().as_bytes());
                PathBuf::from("external").join(format!("{}-{name}", &digest[..12]))
            }
        }
    }
}

enum Replay {
    Restore(Backup),
    Discard(PathBuf),
}

fn prepare(
    layout: &StateLayout,
    validator: &PathValidator,
) -> Result<(PathBuf, String, PathValidator), BackupError> {
    let project_root = validator.project_root().to_path_buf();
    let key = project_key(&project_root);
    let backups_dir = layout.project_backups_dir(&key);
    fs::create_dir_all(&backups_dir)
        .map_err(BackupError::io(format!("failed to create {}", backups_dir.display())))?;
    restrict_dir(&backups_dir)?;

    let canonical_backups = fs::canonicalize(&backups_dir)
        .map_err(BackupError::io(format!("failed to resolve {}", backups_dir.display())))?;
    if canonical_backups.starts_with(&project_root) {
        return Err(BackupError::BackupRootInsideProject {
            backup_root: canonical_backups,
            project_root,
        });
    }

    let mut scoped = validator.clone();
    scoped
        .add_root(&canonical_backups)
        .map_err(BackupError::io(format!("failed to allow {}", canonical_backups.display())))?;
    Ok((project_root, key, scoped))
}

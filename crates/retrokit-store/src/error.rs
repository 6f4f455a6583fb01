use std::io;
use std::path::PathBuf;

use retrokit_security::{ValidationError, ValidationLayer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(
        "backup rejected (reason=symlink_substituted path={}): the path became a symlink after it was checked; replace it with a real file and rerun",
        path.display()
    )]
    SymlinkSubstituted { path: PathBuf },
    #[error("backup rejected (reason=not_regular_file path={})", path.display())]
    NotARegularFile { path: PathBuf },
    #[error(
        "backup rejected (reason=checksum_mismatch path={} expected={expected} actual={actual}); the backup was modified and will not be restored",
        path.display()
    )]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error(
        "backup root {} is inside the project tree {}; choose a state root outside the project",
        backup_root.display(),
        project_root.display()
    )]
    BackupRootInsideProject {
        backup_root: PathBuf,
        project_root: PathBuf,
    },
    #[error(
        "run {run_id} is in progress (reason=active_run status={status}); if no other retrokit process is running, roll it back with `retrokit rollback {run_id}`"
    )]
    RunInProgress { run_id: String, status: String },
    #[error(
        "run {run_id} cannot be rolled back (reason=backups_cleaned path={}): its backup copies were removed; nothing was restored",
        path.display()
    )]
    BackupsCleaned { run_id: String, path: PathBuf },
    #[error("no backup run '{run_id}' recorded for this project")]
    UnknownRun { run_id: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("{context}: {source}")]
    Encoding {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BackupError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }

    /// Symlink rejections on re-validation mean something was swapped after the first check.
    pub(crate) fn from_revalidation(err: ValidationError, path: PathBuf) -> Self {
        if err.layer() == ValidationLayer::SymlinkRejected {
            Self::SymlinkSubstituted { path }
        } else {
            Self::Validation(err)
        }
    }
}

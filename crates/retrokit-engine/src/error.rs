use std::io;
use std::path::PathBuf;

use retrokit_core::ConfigError;
use retrokit_planner::PlanError;
use retrokit_security::ValidationError;
use retrokit_store::BackupError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("step '{step}' failed verification: {detail}")]
    Verification { step: String, detail: String },
    #[error("refusing to overwrite {} (reason=conflict): {detail}", path.display())]
    Conflict { path: PathBuf, detail: String },
}

impl StepError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(
        "another run ({run_id}, status={status}) is active for this project; wait for it or run `retrokit rollback {run_id}`"
    )]
    ActiveRun { run_id: String, status: String },
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Backup(BackupError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl From<BackupError> for RunError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::RunInProgress { run_id, status } => Self::ActiveRun { run_id, status },
            other => Self::Backup(other),
        }
    }
}

impl RunError {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

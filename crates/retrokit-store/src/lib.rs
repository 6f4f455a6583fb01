mod atomic;
mod audit;
mod backup;
mod error;
mod layout;
mod runs;

pub use atomic::{write_atomic, write_atomic_with_mode, DEFAULT_FILE_MODE, OWNER_ONLY_MODE};
pub use audit::{AuditEvent, AuditLog, AuditStatus};
pub use backup::{Backup, BackupManager};
pub use error::BackupError;
pub use layout::{default_state_root, project_key, StateLayout, STATE_ROOT_ENV};
pub use runs::{
    list_runs, new_run_id, read_journal, read_run_metadata, JournalEntry, JournalKind,
    RunMetadata, RunStatus,
};

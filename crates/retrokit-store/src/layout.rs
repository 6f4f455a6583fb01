use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use retrokit_security::sha256_hex;

pub const STATE_ROOT_ENV: &str = "RETROKIT_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings_path(&self) -> PathBuf {
        self.root.join("settings.toml")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.logs_dir().join("audit.jsonl")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn project_backups_dir(&self, project_key: &str) -> PathBuf {
        self.backups_dir().join(project_key)
    }

    pub fn active_run_path(&self, project_key: &str) -> PathBuf {
        self.project_backups_dir(project_key).join("active")
    }

    pub fn run_dir(&self, project_key: &str, run_id: &str) -> PathBuf {
        self.project_backups_dir(project_key).join(run_id)
    }

    pub fn run_metadata_path(&self, project_key: &str, run_id: &str) -> PathBuf {
        self.run_dir(project_key, run_id).join("run.json")
    }

    pub fn run_journal_path(&self, project_key: &str, run_id: &str) -> PathBuf {
        self.run_dir(project_key, run_id).join("journal.jsonl")
    }

    pub fn run_files_dir(&self, project_key: &str, run_id: &str) -> PathBuf {
        self.run_dir(project_key, run_id).join("files")
    }

    pub fn ensure_base_dirs(&self) -> io::Result<()> {
        for dir in [self.root.clone(), self.logs_dir(), self.backups_dir()] {
            fs::create_dir_all(&dir).map_err(|err| {
                io::Error::new(err.kind(), format!("failed to create {}: {err}", dir.display()))
            })?;
        }
        Ok(())
    }
}

/// Stable directory name for a project's backups, derived from its canonical root.
pub fn project_key(canonical_root: &Path) -> String {
    let digest = sha256_hex(canonical_root.to_string_lossy().as_bytes());
    digest[..16].to_string()
}

pub fn default_state_root() -> io::Result<PathBuf> {
    if let Some(explicit) = std::env::var_os(STATE_ROOT_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(explicit));
    }

    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA").map_err(|_| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "LOCALAPPDATA is not set; cannot resolve Windows state root",
            )
        })?;
        return Ok(PathBuf::from(app_data).join("Retrokit"));
    }

    let home = std::env::var("HOME").map_err(|_| {
        io::Error::new(
            io::ErrorKind::NotFound,
            "HOME is not set; cannot resolve state root",
        )
    })?;
    Ok(PathBuf::from(home).join(".retrokit"))
}

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use retrokit_security::{PathValidator, ValidatedPath};
use retrokit_store::{write_atomic, Backup, BackupManager};
use tracing::debug;

use crate::StepError;

/// State of one path before a step touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Snapshot {
    Saved(Backup),
    Absent(PathBuf),
}

/// The only way a step mutates the project.
///
/// Every path is validated, every first touch is snapshotted, and every file
/// write is atomic. Rolling a step back replays its snapshots in reverse.
pub struct ApplyContext<'a> {
    step_id: &'a str,
    backups: &'a mut BackupManager,
    snapshots: &'a mut Vec<Snapshot>,
    touched: &'a mut BTreeSet<PathBuf>,
}

impl<'a> ApplyContext<'a> {
    pub(crate) fn new(
        step_id: &'a str,
        backups: &'a mut BackupManager,
        snapshots: &'a mut Vec<Snapshot>,
        touched: &'a mut BTreeSet<PathBuf>,
    ) -> Self {
        Self {
            step_id,
            backups,
            snapshots,
            touched,
        }
    }

    pub fn step_id(&self) -> &str {
        self.step_id
    }

    pub fn resolve(&self, raw: &str) -> Result<ValidatedPath, StepError> {
        Ok(self.backups.validator().validate(raw)?)
    }

    pub fn read_to_string(&self, raw: &str) -> Result<Option<String>, StepError> {
        let path = self.resolve(raw)?;
        read_optional(&path)
    }

    pub fn exists(&self, raw: &str) -> Result<bool, StepError> {
        let path = self.resolve(raw)?;
        Ok(fs::symlink_metadata(path.as_path()).is_ok())
    }

    pub fn write(&mut self, raw: &str, content: &[u8]) -> Result<(), StepError> {
        let path = self.resolve(raw)?;
        self.ensure_parent(&path)?;
        snapshot(self.backups, self.snapshots, self.touched, self.step_id, &path)?;
        write_atomic(&path, content).map_err(StepError::io(format!("failed to write {path}")))?;
        debug!(step = self.step_id, path = %path, "file written");
        Ok(())
    }

    /// Appends the lines that are not already present, keeping existing content.
    pub fn ensure_lines(&mut self, raw: &str, lines: &[String]) -> Result<usize, StepError> {
        let path = self.resolve(raw)?;
        let mut content = read_optional(&path)?.unwrap_or_default();
        let present = content.lines().map(str::trim).collect::<BTreeSet<_>>();
        let missing = lines
            .iter()
            .filter(|line| !present.contains(line.trim()))
            .cloned()
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return Ok(0);
        }

        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        for line in &missing {
            content.push_str(line);
            content.push('\n');
        }
        self.write(raw, content.as_bytes())?;
        Ok(missing.len())
    }

    pub fn create_dir(&mut self, raw: &str) -> Result<(), StepError> {
        let path = self.resolve(raw)?;
        match fs::symlink_metadata(path.as_path()) {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(StepError::Conflict {
                    path: path.as_path().to_path_buf(),
                    detail: "a non-directory already exists here".to_string(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StepError::Io {
                    context: format!("failed to stat {path}"),
                    source,
                })
            }
        }
        self.ensure_parent(&path)?;
        self.make_dir(&path)
    }

    /// Moves a file by writing the destination atomically, then removing the source.
    pub fn move_file(&mut self, from: &str, to: &str) -> Result<(), StepError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        if fs::symlink_metadata(target.as_path()).is_ok() {
            return Err(StepError::Conflict {
                path: target.as_path().to_path_buf(),
                detail: format!("destination already exists; merge it with {from} by hand"),
            });
        }

        snapshot(self.backups, self.snapshots, self.touched, self.step_id, &source)?;
        let content = fs::read(source.as_path())
            .map_err(StepError::io(format!("failed to read {source}")))?;
        self.write(to, &content)?;
        fs::remove_file(source.as_path())
            .map_err(StepError::io(format!("failed to remove {source}")))?;
        debug!(step = self.step_id, from = %source, to = %target, "file moved");
        Ok(())
    }

    pub fn remove(&mut self, raw: &str) -> Result<bool, StepError> {
        let path = self.resolve(raw)?;
        match fs::symlink_metadata(path.as_path()) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => {
                return Err(StepError::Conflict {
                    path: path.as_path().to_path_buf(),
                    detail: "only regular files can be removed".to_string(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(StepError::Io {
                    context: format!("failed to stat {path}"),
                    source,
                })
            }
        }
        snapshot(self.backups, self.snapshots, self.touched, self.step_id, &path)?;
        fs::remove_file(path.as_path()).map_err(StepError::io(format!("failed to remove {path}")))?;
        Ok(true)
    }

    fn ensure_parent(&mut self, path: &ValidatedPath) -> Result<(), StepError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let mut missing = Vec::new();
        for ancestor in parent.ancestors() {
            if fs::symlink_metadata(ancestor).is_ok() {
                break;
            }
            missing.push(ancestor.to_path_buf());
        }
        for dir in missing.into_iter().rev() {
            let checked = self.backups.validator().validate_path(&dir)?;
            self.make_dir(&checked)?;
        }
        Ok(())
    }

    fn make_dir(&mut self, path: &ValidatedPath) -> Result<(), StepError> {
        snapshot(self.backups, self.snapshots, self.touched, self.step_id, path)?;
        fs::create_dir(path.as_path()).map_err(StepError::io(format!("failed to create {path}")))?;
        debug!(step = self.step_id, path = %path, "directory created");
        Ok(())
    }
}

/// Records the current state of `path` the first time a step touches it.
pub(crate) fn snapshot(
    backups: &mut BackupManager,
    snapshots: &mut Vec<Snapshot>,
    touched: &mut BTreeSet<PathBuf>,
    step_id: &str,
    path: &ValidatedPath,
) -> Result<(), StepError> {
    if !touched.insert(path.as_path().to_path_buf()) {
        return Ok(());
    }
    match fs::symlink_metadata(path.as_path()) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            let backup = backups.create_backup(path, step_id)?;
            snapshots.push(Snapshot::Saved(backup));
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            // Missing ancestors go first so rollback removes the path before its parents.
            let mut missing = Vec::new();
            for ancestor in path.as_path().ancestors().skip(1) {
                if fs::symlink_metadata(ancestor).is_ok() {
                    break;
                }
                missing.push(ancestor.to_path_buf());
            }
            for dir in missing.into_iter().rev() {
                if touched.insert(dir.clone()) {
                    let checked = backups.validator().validate_path(&dir)?;
                    backups.record_absent(&checked, step_id)?;
                    snapshots.push(Snapshot::Absent(dir));
                }
            }
            backups.record_absent(path, step_id)?;
            snapshots.push(Snapshot::Absent(path.as_path().to_path_buf()));
            Ok(())
        }
        Err(source) => Err(StepError::Io {
            context: format!("failed to stat {path}"),
            source,
        }),
    }
}

fn read_optional(path: &ValidatedPath) -> Result<Option<String>, StepError> {
    match fs::read_to_string(path.as_path()) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StepError::Io {
            context: format!("failed to read {path}"),
            source,
        }),
    }
}

/// Read-only view handed to [`crate::StepOperation::verify`].
pub struct VerifyContext<'a> {
    validator: &'a PathValidator,
}

impl<'a> VerifyContext<'a> {
    pub fn new(validator: &'a PathValidator) -> Self {
        Self { validator }
    }

    pub fn resolve(&self, raw: &str) -> Result<ValidatedPath, StepError> {
        Ok(self.validator.validate(raw)?)
    }

    pub fn read_to_string(&self, raw: &str) -> Result<Option<String>, StepError> {
        read_optional(&self.resolve(raw)?)
    }

    pub fn is_dir(&self, raw: &str) -> Result<bool, StepError> {
        let path = self.resolve(raw)?;
        Ok(kind_of(path.as_path()).is_some_and(|meta| meta.is_dir()))
    }

    pub fn is_file(&self, raw: &str) -> Result<bool, StepError> {
        let path = self.resolve(raw)?;
        Ok(kind_of(path.as_path()).is_some_and(|meta| meta.is_file()))
    }

    pub fn exists(&self, raw: &str) -> Result<bool, StepError> {
        let path = self.resolve(raw)?;
        Ok(kind_of(path.as_path()).is_some())
    }
}

fn kind_of(path: &Path) -> Option<fs::Metadata> {
    fs::symlink_metadata(path).ok()
}

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use retrokit_core::{ProjectConfig, TargetStandard};
use serde::Serialize;
use tracing::debug;

use crate::RunError;

const SKIPPED_DIRS: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules", ".venv"];

const ECOSYSTEM_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "rust"),
    ("package.json", "node"),
    ("pyproject.toml", "python"),
    ("setup.py", "python"),
    ("go.mod", "go"),
    ("pom.xml", "java"),
    ("build.gradle", "java"),
    ("Gemfile", "ruby"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ConfigState {
    Missing,
    Invalid(String),
    Loaded(ProjectConfig),
}

/// Read-only description of a project tree. Paths are relative and `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectScan {
    pub project_name: String,
    pub files: BTreeSet<String>,
    pub directories: BTreeSet<String>,
    pub symlinks: BTreeSet<String>,
    pub ecosystems: BTreeSet<String>,
    /// Lines of the standard's ignore file, trimmed.
    pub ignore_entries: BTreeSet<String>,
    pub config: ConfigState,
    pub truncated: bool,
}

impl ProjectScan {
    pub fn has_file(&self, path: &str) -> bool {
        self.files.contains(path)
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.directories.contains(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.has_file(path) || self.has_dir(path) || self.symlinks.contains(path)
    }
}

pub(crate) fn scan_project(
    root: &Path,
    standard: &TargetStandard,
    max_depth: usize,
) -> Result<ProjectScan, RunError> {
    let mut scan = ProjectScan {
        project_name: root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".to_string()),
        files: BTreeSet::new(),
        directories: BTreeSet::new(),
        symlinks: BTreeSet::new(),
        ecosystems: BTreeSet::new(),
        ignore_entries: BTreeSet::new(),
        config: ConfigState::Missing,
        truncated: false,
    };
    walk(root, "", 1, max_depth, &mut scan)?;

    for (marker, ecosystem) in ECOSYSTEM_MARKERS {
        if scan.files.contains(*marker) {
            scan.ecosystems.insert((*ecosystem).to_string());
        }
    }

    if let Some(rule) = &standard.ignore {
        if scan.files.contains(&rule.path) {
            let path = root.join(&rule.path);
            let bytes = fs::read(&path)
                .map_err(RunError::io(format!("failed to read {}", path.display())))?;
            scan.ignore_entries = String::from_utf8_lossy(&bytes)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToOwned::to_owned)
                .collect();
        }
    }

    if scan.files.contains(&standard.config_path) {
        scan.config = read_config(&root.join(&standard.config_path));
        if let ConfigState::Loaded(config) = &scan.config {
            scan.project_name = config.project_name.clone();
        }
    }

    debug!(
        files = scan.files.len(),
        directories = scan.directories.len(),
        ecosystems = ?scan.ecosystems,
        "project scanned"
    );
    Ok(scan)
}

pub(crate) fn read_config(path: &Path) -> ConfigState {
    match ProjectConfig::load(path) {
        Ok(config) => ConfigState::Loaded(config),
        Err(err) => ConfigState::Invalid(err.to_string()),
    }
}

fn walk(
    dir: &Path,
    prefix: &str,
    depth: usize,
    max_depth: usize,
    scan: &mut ProjectScan,
) -> Result<(), RunError> {
    let entries = fs::read_dir(dir).map_err(RunError::io(format!("failed to read {}", dir.display())))?;
    let mut children = Vec::new();
    for entry in entries {
        let entry = entry.map_err(RunError::io(format!("failed to read {}", dir.display())))?;
        children.push(entry);
    }
    children.sort_by_key(|entry| entry.file_name());

    for entry in children {
        let Some(name) = entry.file_name().to_str().map(ToOwned::to_owned) else {
            continue;
        };
        let relative = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(source) => {
                return Err(RunError::Io {
                    context: format!("failed to stat {}", entry.path().display()),
                    source,
                })
            }
        };

        if file_type.is_symlink() {
            scan.symlinks.insert(relative);
        } else if file_type.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_str()) {
                continue;
            }
            scan.directories.insert(relative.clone());
            if depth < max_depth {
                walk(&entry.path(), &relative, depth + 1, max_depth, scan)?;
            } else {
                scan.truncated = true;
            }
        } else if file_type.is_file() {
            scan.files.insert(relative);
        }
    }
    Ok(())
}

//! Whitelist validation for untrusted path strings.
//!
//! A [`PathValidator`] runs four gates in order and stops at the first
//! failure: string checks, symlink rejection, canonicalization, and whitelist
//! membership. The only way to obtain a [`ValidatedPath`] is through
//! [`PathValidator::validate`].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

pub const MAX_PATH_BYTES: usize = 4096;

#[cfg(unix)]
const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/usr", "/bin", "/sbin", "/boot", "/dev", "/proc", "/sys", "/lib", "/lib32",
    "/lib64", "/var/lib",
];

#[cfg(windows)]
const SYSTEM_DIRS: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
    "C:\\ProgramData",
];

#[cfg(not(any(unix, windows)))]
const SYSTEM_DIRS: &[&str] = &[];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidatorMode {
    #[default]
    Strict,
    /// Adds the system temp directory to the allowed roots.
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationLayer {
    MalformedInput,
    PathTraversal,
    SymlinkRejected,
    OutsideWhitelist,
}

impl ValidationLayer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed_input",
            Self::PathTraversal => "path_traversal",
            Self::SymlinkRejected => "symlink_rejected",
            Self::OutsideWhitelist => "outside_whitelist",
        }
    }

    pub fn remediation(self) -> &'static str {
        match self {
            Self::MalformedInput => {
                "pass a non-empty path without control characters and rerun"
            }
            Self::PathTraversal => {
                "remove '..' segments and address the file from the project root"
            }
            Self::SymlinkRejected => {
                "path resolves to a symlink; replace it with a real file and rerun"
            }
            Self::OutsideWhitelist => {
                "only paths inside the project root (or the backup root) may be touched"
            }
        }
    }
}

impl fmt::Display for ValidationLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("path rejected (reason={layer} input={input:?}): {detail}; {}", .layer.remediation())]
pub struct ValidationError {
    layer: ValidationLayer,
    input: String,
    detail: String,
}

impl ValidationError {
    fn new(layer: ValidationLayer, input: &str, detail: impl Into<String>) -> Self {
        Self {
            layer,
            input: input.to_string(),
            detail: detail.into(),
        }
    }

    pub fn layer(&self) -> ValidationLayer {
        self.layer
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn remediation(&self) -> &'static str {
        self.layer.remediation()
    }
}

/// Absolute, symlink-free path that lies inside one of the validator's roots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValidatedPath {
    path: PathBuf,
    original: String,
}

impl ValidatedPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The raw input this path was validated from. For messages only.
    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn parent(&self) -> Option<&Path> {
        self.path.parent()
    }

    pub fn display(&self) -> std::path::Display<'_> {
        self.path.display()
    }
}

impl AsRef<Path> for ValidatedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for ValidatedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Receives the outcome of every validation call.
pub trait ValidationObserver: Send + Sync {
    fn observe(&self, raw: &str, outcome: Result<&ValidatedPath, &ValidationError>);
}

#[derive(Debug, Clone)]
struct AllowedRoot {
    written: PathBuf,
    canonical: PathBuf,
}

#[derive(Clone)]
pub struct PathValidator {
    roots: Vec<AllowedRoot>,
    temp_root: Option<AllowedRoot>,
    mode: ValidatorMode,
    observer: Option<Arc<dyn ValidationObserver>>,
}

impl fmt::Debug for PathValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathValidator")
            .field("roots", &self.roots)
            .field("temp_root", &self.temp_root)
            .field("mode", &self.mode)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl PathValidator {
    /// The first root is the project root; relative input resolves against it.
    pub fn new<I, P>(roots: I, mode: ValidatorMode) -> io::Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut validator = Self {
            roots: Vec::new(),
            temp_root: None,
            mode,
            observer: None,
        };
        for root in roots {
            validator.add_root(root.as_ref())?;
        }
        if validator.roots.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path validator requires at least one allowed root",
            ));
        }

        if mode == ValidatorMode::Test {
            let temp = std::env::temp_dir();
            if let Ok(canonical) = fs::canonicalize(&temp) {
                validator.temp_root = Some(AllowedRoot {
                    written: lexical_normalize(&temp),
                    canonical,
                });
            }
        }

        Ok(validator)
    }

    pub fn with_observer(mut self, observer: Arc<dyn ValidationObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn add_root(&mut self, root: &Path) -> io::Result<()> {
        let written = if root.is_absolute() {
            lexical_normalize(root)
        } else {
            lexical_normalize(&std::env::current_dir()?.join(root))
        };
        let canonical = fs::canonicalize(&written).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("failed to resolve allowed root {}: {err}", written.display()),
            )
        })?;
        if !canonical.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("allowed root is not a directory: {}", canonical.display()),
            ));
        }
        self.roots.push(AllowedRoot { written, canonical });
        Ok(())
    }

    pub fn mode(&self) -> ValidatorMode {
        self.mode
    }

    pub fn project_root(&self) -> &Path {
        &self.roots[0].canonical
    }

    fn all_roots(&self) -> impl Iterator<Item = &AllowedRoot> {
        self.roots.iter().chain(self.temp_root.iter())
    }

    pub fn validate(&self, raw: &str) -> Result<ValidatedPath, ValidationError> {
        let outcome = self.run_gates(raw);
        match &outcome {
            Ok(path) => debug!(input = raw, resolved = %path, "path accepted"),
            Err(err) => debug!(input = raw, layer = %err.layer(), detail = err.detail(), "path rejected"),
        }
        if let Some(observer) = &self.observer {
            observer.observe(raw, outcome.as_ref());
        }
        outcome
    }

    pub fn validate_path(&self, path: &Path) -> Result<ValidatedPath, ValidationError> {
        match path.to_str() {
            Some(raw) => self.validate(raw),
            None => {
                let lossy = path.to_string_lossy();
                let err = ValidationError::new(
                    ValidationLayer::MalformedInput,
                    &lossy,
                    "path is not valid UTF-8",
                );
                if let Some(observer) = &self.observer {
                    observer.observe(&lossy, Err(&err));
                }
                Err(err)
            }
        }
    }

    fn run_gates(&self, raw: &str) -> Result<ValidatedPath, ValidationError> {
        check_string(raw)?;

        let candidate = Path::new(raw);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.project_root().join(candidate)
        };
        let rebased = self.rebase_onto_canonical_root(&lexical_normalize(&absolute));

        reject_symlink_components(&rebased, raw)?;
        let canonical = canonicalize_existing_prefix(&rebased, raw)?;
        self.check_whitelist(&canonical, raw)?;

        Ok(ValidatedPath {
            path: canonical,
            original: raw.to_string(),
        })
    }

    fn rebase_onto_canonical_root(&self, path: &Path) -> PathBuf {
        for root in self.all_roots() {
            if root.written == root.canonical {
                continue;
            }
            if let Ok(rest) = path.strip_prefix(&root.written) {
                return root.canonical.join(rest);
            }
        }
        path.to_path_buf()
    }

    fn check_whitelist(&self, canonical: &Path, raw: &str) -> Result<(), ValidationError> {
        if canonical.parent().is_none() {
            return Err(ValidationError::new(
                ValidationLayer::OutsideWhitelist,
                raw,
                "filesystem root is never writable",
            ));
        }
        if let Some(system_dir) = SYSTEM_DIRS
            .iter()
            .find(|dir| canonical.starts_with(Path::new(dir)))
        {
            return Err(ValidationError::new(
                ValidationLayer::OutsideWhitelist,
                raw,
                format!("{} is inside system directory {system_dir}", canonical.display()),
            ));
        }
        if self
            .all_roots()
            .any(|root| canonical.starts_with(&root.canonical))
        {
            return Ok(());
        }

        let roots = self
            .all_roots()
            .map(|root| root.canonical.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ValidationError::new(
            ValidationLayer::OutsideWhitelist,
            raw,
            format!("{} is not inside any allowed root ({roots})", canonical.display()),
        ))
    }
}

fn check_string(raw: &str) -> Result<(), ValidationError> {
    if raw.trim().is_empty() {
        return Err(ValidationError::new(
            ValidationLayer::MalformedInput,
            raw,
            "path is empty",
        ));
    }
    if raw.len() > MAX_PATH_BYTES {
        return Err(ValidationError::new(
            ValidationLayer::MalformedInput,
            truncated(raw, 64),
            format!("path is {} bytes, limit is {MAX_PATH_BYTES}", raw.len()),
        ));
    }
    if raw.contains('\0') {
        return Err(ValidationError::new(
            ValidationLayer::MalformedInput,
            &raw.replace('\0', "\\0"),
            "path contains a NUL byte",
        ));
    }
    if raw.chars().any(char::is_control) {
        return Err(ValidationError::new(
            ValidationLayer::MalformedInput,
            &raw.escape_default().to_string(),
            "path contains control characters",
        ));
    }
    if raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ValidationError::new(
            ValidationLayer::PathTraversal,
            raw,
            "path contains a '..' segment",
        ));
    }
    Ok(())
}

fn truncated(raw: &str, max: usize) -> &str {
    let mut end = max.min(raw.len());
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

fn reject_symlink_components(path: &Path, raw: &str) -> Result<(), ValidationError> {
    let mut current = PathBuf::new();
    for component in path.components() {
        current.push(component);
        if matches!(component, Component::RootDir | Component::Prefix(_)) {
            continue;
        }
        match fs::symlink_metadata(&current) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                return Err(ValidationError::new(
                    ValidationLayer::SymlinkRejected,
                    raw,
                    format!("{} is a symlink", current.display()),
                ));
            }
            Ok(metadata) => {
                if !metadata.is_dir() && current.as_path() != path {
                    return Err(ValidationError::new(
                        ValidationLayer::MalformedInput,
                        raw,
                        format!("{} is not a directory", current.display()),
                    ));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => break,
            Err(err) => {
                return Err(ValidationError::new(
                    ValidationLayer::MalformedInput,
                    raw,
                    format!("cannot inspect {}: {err}", current.display()),
                ));
            }
        }
    }
    Ok(())
}

fn canonicalize_existing_prefix(path: &Path, raw: &str) -> Result<PathBuf, ValidationError> {
    let mut existing = path.to_path_buf();
    let mut missing = Vec::new();
    while fs::symlink_metadata(&existing).is_err() {
        let Some(name) = existing.file_name().map(ToOwned::to_owned) else {
            break;
        };
        missing.push(name);
        if !existing.pop() {
            break;
        }
    }

    let mut canonical = fs::canonicalize(&existing).map_err(|err| {
        ValidationError::new(
            ValidationLayer::MalformedInput,
            raw,
            format!("cannot canonicalize {}: {err}", existing.display()),
        )
    })?;
    for name in missing.into_iter().rev() {
        canonical.push(name);
    }
    Ok(canonical)
}

fn lexical_normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|component| !matches!(component, Component::CurDir))
        .collect()
}

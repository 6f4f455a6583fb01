use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ExecutionMode};

pub const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub audit_max_bytes: u64,
    pub audit_backup_count: u32,
    /// Allows the system temp directory as an extra root. Never inferred.
    pub test_mode: bool,
    pub scan_depth: usize,
    pub default_mode: ExecutionMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            audit_max_bytes: 5 * 1024 * 1024,
            audit_backup_count: 5,
            test_mode: false,
            scan_depth: 6,
            default_mode: ExecutionMode::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(input).map_err(|source| ConfigError::Parse {
            what: "settings",
            source,
        })?;
        if settings.audit_max_bytes < 1024 {
            return Err(ConfigError::Invalid {
                what: "settings",
                reason: format!(
                    "audit_max_bytes must be at least 1024, got {}",
                    settings.audit_max_bytes
                ),
            });
        }
        if settings.scan_depth == 0 {
            return Err(ConfigError::Invalid {
                what: "settings",
                reason: "scan_depth must be at least 1".to_string(),
            });
        }
        Ok(settings)
    }

    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_toml_str(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

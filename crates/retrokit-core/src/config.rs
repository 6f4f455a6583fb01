use std::path::Path;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const PROJECT_CONFIG_FILE: &str = "retrokit.toml";

/// Per-project configuration written into the project root by a retrofit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub standard_version: Version,
    pub project_name: String,
    #[serde(default)]
    pub ecosystems: Vec<String>,
    #[serde(default = "default_docs_dir")]
    pub docs_dir: String,
    #[serde(default = "default_tests_dir")]
    pub tests_dir: String,
}

fn default_docs_dir() -> String {
    "docs".to_string()
}

fn default_tests_dir() -> String {
    "tests".to_string()
}

impl ProjectConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).map_err(|source| ConfigError::Parse {
            what: "project config",
            source,
        })?;
        if config.project_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                what: "project config",
                reason: "project_name must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize {
            what: "project config",
            source,
        })
    }

    pub fn is_behind(&self, target: &Version) -> bool {
        self.standard_version < *target
    }
}

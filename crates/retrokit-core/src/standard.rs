use std::collections::BTreeSet;
use std::path::{Component, Path};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Effort, Impact, PROJECT_CONFIG_FILE};

const BUILTIN_STANDARD: &str = r#"
version = "1.0.0"
directories = ["docs", "docs/adr", "tests"]

[[files]]
path = "README.md"
template = """
# {project_name}

Describe what this project does and how to build it.
"""
impact = "medium"
effort = "small"

[[files]]
path = "CHANGELOG.md"
template = """
# Changelog

## Unreleased
"""
impact = "low"
effort = "trivial"

[[files]]
path = "docs/adr/0000-record-architecture-decisions.md"
template = """
# 0. Record architecture decisions

We record significant decisions for {project_name} in this directory.
"""
impact = "low"
effort = "trivial"

[[relocations]]
from = "ARCHITECTURE.md"
to = "docs/ARCHITECTURE.md"
impact = "medium"
effort = "small"

[[relocations]]
from = "CONTRIBUTING.txt"
to = "docs/CONTRIBUTING.md"
impact = "low"
effort = "small"

[ignore]
path = ".gitignore"
entries = [".retrokit/", "*.orig"]
"#;

/// Layout and configuration a retrofitted project is expected to converge on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetStandard {
    pub version: Version,
    #[serde(default)]
    pub directories: Vec<String>,
    #[serde(default)]
    pub files: Vec<StandardFile>,
    #[serde(default)]
    pub relocations: Vec<Relocation>,
    pub ignore: Option<IgnoreRule>,
    #[serde(default = "default_config_path")]
    pub config_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StandardFile {
    pub path: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub effort: Effort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relocation {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub effort: Effort,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IgnoreRule {
    pub path: String,
    #[serde(default)]
    pub entries: Vec<String>,
}

fn default_config_path() -> String {
    PROJECT_CONFIG_FILE.to_string()
}

impl TargetStandard {
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_toml_str(BUILTIN_STANDARD)
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let standard: Self = toml::from_str(input).map_err(|source| ConfigError::Parse {
            what: "target standard",
            source,
        })?;
        standard.validate()?;
        Ok(standard)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn render_template(template: &str, project_name: &str) -> String {
        template.replace("{project_name}", project_name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut declared = BTreeSet::new();

        for dir in &self.directories {
            validate_relative(dir, "standard directory")?;
        }
        for file in &self.files {
            validate_relative(&file.path, "standard file")?;
            if !declared.insert(file.path.as_str()) {
                return Err(invalid(format!("duplicate file declaration '{}'", file.path)));
            }
        }
        for relocation in &self.relocations {
            validate_relative(&relocation.from, "relocation source")?;
            validate_relative(&relocation.to, "relocation destination")?;
            if relocation.from == relocation.to {
                return Err(invalid(format!(
                    "relocation '{}' moves a file onto itself",
                    relocation.from
                )));
            }
            if !declared.insert(relocation.to.as_str()) {
                return Err(invalid(format!(
                    "relocation destination '{}' is already declared",
                    relocation.to
                )));
            }
        }
        if let Some(ignore) = &self.ignore {
            validate_relative(&ignore.path, "ignore file")?;
            if ignore.entries.iter().any(|entry| entry.contains('\n')) {
                return Err(invalid("ignore entries must be single lines".to_string()));
            }
        }
        validate_relative(&self.config_path, "config path")?;
        Ok(())
    }
}

fn invalid(reason: String) -> ConfigError {
    ConfigError::Invalid {
        what: "target standard",
        reason,
    }
}

fn validate_relative(value: &str, what: &str) -> Result<(), ConfigError> {
    let path = Path::new(value);
    if value.trim().is_empty() {
        return Err(invalid(format!("{what} must not be empty")));
    }
    if path.is_absolute() {
        return Err(invalid(format!("{what} must be relative: {value}")));
    }
    if path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir))
    {
        return Err(invalid(format!("{what} must stay inside the project: {value}")));
    }
    Ok(())
}

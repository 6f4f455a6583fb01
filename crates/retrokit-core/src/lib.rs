mod config;
mod error;
mod settings;
mod standard;
mod vocabulary;

pub use config::{ProjectConfig, PROJECT_CONFIG_FILE};
pub use error::ConfigError;
pub use settings::{Settings, SETTINGS_FILE};
pub use standard::{IgnoreRule, Relocation, StandardFile, TargetStandard};
pub use vocabulary::{Effort, ExecutionMode, Impact};

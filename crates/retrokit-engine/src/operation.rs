use std::fmt::Debug;
use std::sync::Arc;

use retrokit_planner::{MigrationPlan, MigrationStep};
use serde::Serialize;

use crate::{ApplyContext, StepError, VerifyContext};

pub type Step = MigrationStep<Arc<dyn StepOperation>>;
pub type Plan = MigrationPlan<Arc<dyn StepOperation>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Passed,
    Failed(String),
    /// The step cannot check itself; someone else has to.
    External,
}

pub trait StepOperation: Debug + Send + Sync {
    /// Project-relative paths the step will touch. Snapshotted before `apply`.
    fn targets(&self) -> Vec<String>;

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), StepError>;

    fn verify(&self, _ctx: &VerifyContext<'_>) -> Result<VerifyOutcome, StepError> {
        Ok(VerifyOutcome::External)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    CreateOnly,
    Replace,
}

/// The file changes a retrofit is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FileAction {
    CreateDir {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
        mode: WriteMode,
    },
    EnsureLines {
        path: String,
        lines: Vec<String>,
    },
    MoveFile {
        from: String,
        to: String,
    },
    RemoveFile {
        path: String,
    },
}

impl FileAction {
    pub fn into_operation(self) -> Arc<dyn StepOperation> {
        Arc::new(self)
    }
}

impl StepOperation for FileAction {
    fn targets(&self) -> Vec<String> {
        match self {
            Self::CreateDir { path }
            | Self::WriteFile { path, .. }
            | Self::EnsureLines { path, .. }
            | Self::RemoveFile { path } => vec![path.clone()],
            Self::MoveFile { from, to } => vec![from.clone(), to.clone()],
        }
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), StepError> {
        match self {
            Self::CreateDir { path } => ctx.create_dir(path),
            Self::WriteFile {
                path,
                content,
                mode,
            } => {
                if *mode == WriteMode::CreateOnly && ctx.exists(path)? {
                    return Ok(());
                }
                ctx.write(path, content.as_bytes())
            }
            Self::EnsureLines { path, lines } => ctx.ensure_lines(path, lines).map(|_| ()),
            Self::MoveFile { from, to } => ctx.move_file(from, to),
            Self::RemoveFile { path } => ctx.remove(path).map(|_| ()),
        }
    }

    fn verify(&self, ctx: &VerifyContext<'_>) -> Result<VerifyOutcome, StepError> {
        let outcome = match self {
            Self::CreateDir { path } => expect(ctx.is_dir(path)?, || format!("{path} is not a directory")),
            Self::WriteFile {
                path,
                content,
                mode: WriteMode::Replace,
            } => match ctx.read_to_string(path)? {
                Some(actual) if actual == *content => VerifyOutcome::Passed,
                Some(_) => VerifyOutcome::Failed(format!("{path} does not hold the expected content")),
                None => VerifyOutcome::Failed(format!("{path} is missing")),
            },
            Self::WriteFile { path, .. } => expect(ctx.is_file(path)?, || format!("{path} is missing")),
            Self::EnsureLines { path, lines } => {
                let content = ctx.read_to_string(path)?.unwrap_or_default();
                let present = content.lines().map(str::trim).collect::<Vec<_>>();
                let missing = lines
                    .iter()
                    .filter(|line| !present.contains(&line.trim()))
                    .cloned()
                    .collect::<Vec<_>>();
                expect(missing.is_empty(), || {
                    format!("{path} is missing entries: {}", missing.join(", "))
                })
            }
            Self::MoveFile { from, to } => {
                if !ctx.is_file(to)? {
                    VerifyOutcome::Failed(format!("{to} is missing"))
                } else if ctx.exists(from)? {
                    VerifyOutcome::Failed(format!("{from} still exists"))
                } else {
                    VerifyOutcome::Passed
                }
            }
            Self::RemoveFile { path } => expect(!ctx.exists(path)?, || format!("{path} still exists")),
        };
        Ok(outcome)
    }
}

fn expect(condition: bool, detail: impl FnOnce() -> String) -> VerifyOutcome {
    if condition {
        VerifyOutcome::Passed
    } else {
        VerifyOutcome::Failed(detail())
    }
}

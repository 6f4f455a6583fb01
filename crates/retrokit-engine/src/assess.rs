use std::collections::BTreeSet;

use retrokit_core::{Effort, Impact, ProjectConfig, TargetStandard};
use retrokit_planner::MigrationStep;
use semver::Version;
use serde::Serialize;

use crate::scan::{ConfigState, ProjectScan};
use crate::{FileAction, Step, WriteMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GapKind {
    MissingDirectory { path: String },
    MissingFile { path: String, template: String },
    MisplacedFile { from: String, to: String },
    MissingIgnoreEntries { path: String, entries: Vec<String> },
    ConfigDrift { path: String, found: Option<Version>, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Gap {
    pub kind: GapKind,
    pub impact: Impact,
    pub effort: Effort,
}

impl Gap {
    pub fn step_id(&self) -> String {
        match &self.kind {
            GapKind::MissingDirectory { path } => format!("dir:{path}"),
            GapKind::MissingFile { path, .. } => format!("file:{path}"),
            GapKind::MisplacedFile { to, .. } => format!("move:{to}"),
            GapKind::MissingIgnoreEntries { path, .. } => format!("ignore:{path}"),
            GapKind::ConfigDrift { .. } => "config".to_string(),
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            GapKind::MissingDirectory { path } => format!("create directory {path}"),
            GapKind::MissingFile { path, .. } => format!("create {path}"),
            GapKind::MisplacedFile { from, to } => format!("move {from} to {to}"),
            GapKind::MissingIgnoreEntries { path, entries } => {
                format!("add {} to {path}", entries.join(", "))
            }
            GapKind::ConfigDrift { path, reason, .. } => format!("write {path} ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assessment {
    pub target_version: Version,
    pub gaps: Vec<Gap>,
    pub draft_config: ProjectConfig,
}

impl Assessment {
    pub fn is_conformant(&self) -> bool {
        self.gaps.is_empty()
    }
}

pub(crate) fn assess(scan: &ProjectScan, standard: &TargetStandard) -> Assessment {
    let mut gaps = Vec::new();

    let mut directories = standard.directories.iter().cloned().collect::<BTreeSet<_>>();
    for file in &standard.files {
        directories.extend(parent_dirs(&file.path));
    }
    for relocation in &standard.relocations {
        directories.extend(parent_dirs(&relocation.to));
    }
    for path in directories {
        if !scan.exists(&path) {
            gaps.push(Gap {
                kind: GapKind::MissingDirectory { path },
                impact: Impact::Low,
                effort: Effort::Trivial,
            });
        }
    }

    for relocation in &standard.relocations {
        if scan.has_file(&relocation.from) && !scan.exists(&relocation.to) {
            gaps.push(Gap {
                kind: GapKind::MisplacedFile {
                    from: relocation.from.clone(),
                    to: relocation.to.clone(),
                },
                impact: relocation.impact,
                effort: relocation.effort,
            });
        }
    }

    for file in &standard.files {
        if !scan.exists(&file.path) {
            gaps.push(Gap {
                kind: GapKind::MissingFile {
                    path: file.path.clone(),
                    template: TargetStandard::render_template(&file.template, &scan.project_name),
                },
                impact: file.impact,
                effort: file.effort,
            });
        }
    }

    if let Some(rule) = &standard.ignore {
        let missing = rule
            .entries
            .iter()
            .filter(|entry| !scan.ignore_entries.contains(entry.trim()))
            .cloned()
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            gaps.push(Gap {
                kind: GapKind::MissingIgnoreEntries {
                    path: rule.path.clone(),
                    entries: missing,
                },
                impact: Impact::Low,
                effort: Effort::Trivial,
            });
        }
    }

    let draft_config = draft_config(scan, standard);
    let drift = match &scan.config {
        ConfigState::Missing => Some((None, "config missing".to_string())),
        ConfigState::Invalid(detail) => Some((None, format!("config unreadable: {detail}"))),
        ConfigState::Loaded(config) if config.is_behind(&standard.version) => Some((
            Some(config.standard_version.clone()),
            format!(
                "standard_version {} is behind {}",
                config.standard_version, standard.version
            ),
        )),
        ConfigState::Loaded(_) => None,
    };
    if let Some((found, reason)) = drift {
        gaps.push(Gap {
            kind: GapKind::ConfigDrift {
                path: standard.config_path.clone(),
                found,
                reason,
            },
            impact: Impact::High,
            effort: Effort::Small,
        });
    }

    Assessment {
        target_version: standard.version.clone(),
        gaps,
        draft_config,
    }
}

fn draft_config(scan: &ProjectScan, standard: &TargetStandard) -> ProjectConfig {
    match &scan.config {
        ConfigState::Loaded(existing) => ProjectConfig {
            standard_version: standard.version.clone(),
            ecosystems: merge(&existing.ecosystems, &scan.ecosystems),
            ..existing.clone()
        },
        _ => ProjectConfig {
            standard_version: standard.version.clone(),
            project_name: scan.project_name.clone(),
            ecosystems: scan.ecosystems.iter().cloned().collect(),
            docs_dir: "docs".to_string(),
            tests_dir: "tests".to_string(),
        },
    }
}

fn merge(existing: &[String], detected: &BTreeSet<String>) -> Vec<String> {
    let mut merged = existing.iter().cloned().collect::<BTreeSet<_>>();
    merged.extend(detected.iter().cloned());
    merged.into_iter().collect()
}

/// Every proper ancestor directory of a relative path, outermost first.
fn parent_dirs(path: &str) -> Vec<String> {
    let segments = path.split('/').collect::<Vec<_>>();
    (1..segments.len())
        .map(|end| segments[..end].join("/"))
        .collect()
}

/// Turns gaps into planner steps. A step depends on the steps creating its parent dirs.
pub(crate) fn steps_for(assessment: &Assessment) -> Result<Vec<Step>, retrokit_core::ConfigError> {
    let created_dirs = assessment
        .gaps
        .iter()
        .filter_map(|gap| match &gap.kind {
            GapKind::MissingDirectory { path } => Some(path.clone()),
            _ => None,
        })
        .collect::<BTreeSet<_>>();

    let mut steps = Vec::with_capacity(assessment.gaps.len());
    for gap in &assessment.gaps {
        let (action, anchor) = match &gap.kind {
            GapKind::MissingDirectory { path } => (FileAction::CreateDir { path: path.clone() }, path),
            GapKind::MissingFile { path, template } => (
                FileAction::WriteFile {
                    path: path.clone(),
                    content: template.clone(),
                    mode: WriteMode::CreateOnly,
                },
                path,
            ),
            GapKind::MisplacedFile { from, to } => (
                FileAction::MoveFile {
                    from: from.clone(),
                    to: to.clone(),
                },
                to,
            ),
            GapKind::MissingIgnoreEntries { path, entries } => (
                FileAction::EnsureLines {
                    path: path.clone(),
                    lines: entries.clone(),
                },
                path,
            ),
            GapKind::ConfigDrift { path, .. } => (
                FileAction::WriteFile {
                    path: path.clone(),
                    content: assessment.draft_config.to_toml_string()?,
                    mode: WriteMode::Replace,
                },
                path,
            ),
        };

        let mut step = MigrationStep::new(gap.step_id(), gap.describe(), action.into_operation())
            .with_impact(gap.impact)
            .with_effort(gap.effort);
        if let Some(parent) = parent_dirs(anchor).pop() {
            if created_dirs.contains(&parent) {
                step = step.depends_on(format!("dir:{parent}"));
            }
        }
        steps.push(step);
    }
    Ok(steps)
}

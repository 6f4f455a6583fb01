use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use retrokit_core::{ExecutionMode, Settings, TargetStandard};
use retrokit_planner::plan;
use retrokit_security::{PathValidator, ValidatorMode};
use retrokit_store::{AuditLog, AuditStatus, BackupManager, RunMetadata, RunStatus, StateLayout};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::assess::{assess, steps_for};
use crate::scan::{read_config, scan_project, ConfigState};
use crate::{
    Assessment, Check, ExecutionResult, Plan, ProjectScan, RunError, Step, StepExecutor, StepState,
    VerificationReport,
};

/// Asked before each step in [`ExecutionMode::StepByStep`]. `false` halts the run.
pub trait Confirm {
    fn confirm(&mut self, step: &Step) -> bool;
}

impl<F> Confirm for F
where
    F: FnMut(&Step) -> bool,
{
    fn confirm(&mut self, step: &Step) -> bool {
        self(step)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub run_id: Option<String>,
    pub mode: ExecutionMode,
    pub results: Vec<ExecutionResult>,
    /// A confirmation was declined; later steps were not run.
    pub halted: bool,
    pub failed: bool,
}

impl RunOutcome {
    pub fn external_steps(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|result| result.external_verification && result.state == StepState::Applied)
            .map(|result| result.step_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    pub run_id: String,
    pub replayed: usize,
}

/// analyze -> assess -> plan -> execute -> verify for one project root.
#[derive(Debug)]
pub struct RetrofitPipeline {
    root: PathBuf,
    layout: StateLayout,
    settings: Settings,
    standard: TargetStandard,
    validator: PathValidator,
    audit: Arc<AuditLog>,
}

impl RetrofitPipeline {
    pub fn new(
        project_root: &Path,
        layout: StateLayout,
        settings: Settings,
        standard: TargetStandard,
        audit: Arc<AuditLog>,
    ) -> Result<Self, RunError> {
        let mode = if settings.test_mode {
            ValidatorMode::Test
        } else {
            ValidatorMode::Strict
        };
        let validator = PathValidator::new([project_root], mode)
            .map_err(RunError::io(format!(
                "failed to open project root {}",
                project_root.display()
            )))?
            .with_observer(audit.clone());
        let root = validator.project_root().to_path_buf();

        Ok(Self {
            root,
            layout,
            settings,
            standard,
            validator,
            audit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn standard(&self) -> &TargetStandard {
        &self.standard
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    pub fn analyze(&self) -> Result<ProjectScan, RunError> {
        let scan = scan_project(&self.root, &self.standard, self.settings.scan_depth)?;
        self.audit.record(
            "project_analyzed",
            AuditStatus::Success,
            "retrofit_pipeline",
            json!({
                "root": self.root.display().to_string(),
                "files": scan.files.len(),
                "directories": scan.directories.len(),
                "ecosystems": scan.ecosystems,
            }),
        );
        Ok(scan)
    }

    pub fn assess(&self, scan: &ProjectScan) -> Assessment {
        let assessment = assess(scan, &self.standard);
        self.audit.record(
            "project_assessed",
            AuditStatus::Success,
            "retrofit_pipeline",
            json!({
                "target_version": assessment.target_version.to_string(),
                "gaps": assessment.gaps.len(),
            }),
        );
        assessment
    }

    pub fn plan(&self, assessment: &Assessment) -> Result<Plan, RunError> {
        self.plan_steps(steps_for(assessment)?)
    }

    /// Plans caller-supplied steps; any [`crate::StepOperation`] can take part.
    pub fn plan_steps(&self, steps: Vec<Step>) -> Result<Plan, RunError> {
        let result = plan(steps);
        let (status, context) = match &result {
            Ok(plan) => (AuditStatus::Success, json!({ "order": plan.ids() })),
            Err(err) => (AuditStatus::Failure, json!({ "error": err.to_string() })),
        };
        self.audit
            .record("plan_built", status, "migration_planner", context);
        Ok(result?)
    }

    pub fn execute(
        &self,
        plan: &Plan,
        mode: ExecutionMode,
        confirm: &mut dyn Confirm,
    ) -> Result<RunOutcome, RunError> {
        let mut outcome = RunOutcome {
            run_id: None,
            mode,
            results: Vec::with_capacity(plan.len()),
            halted: false,
            failed: false,
        };

        if !mode.mutates() {
            outcome.results = plan.steps().iter().map(ExecutionResult::pending).collect();
            self.audit.record(
                "run_planned",
                AuditStatus::Success,
                "retrofit_pipeline",
                json!({ "mode": mode.as_str(), "steps": plan.ids() }),
            );
            return Ok(outcome);
        }

        let backups = BackupManager::begin(&self.layout, &self.validator, self.audit.clone(), "retrofit")?;
        let mut executor = StepExecutor::new(backups, self.audit.clone());
        outcome.run_id = Some(executor.run_id().to_string());
        info!(run_id = executor.run_id(), mode = mode.as_str(), steps = plan.len(), "run started");

        let mut rollback_failed = false;
        for (index, step) in plan.steps().iter().enumerate() {
            if mode == ExecutionMode::StepByStep && !confirm.confirm(step) {
                outcome.halted = true;
                outcome
                    .results
                    .extend(plan.steps()[index..].iter().map(ExecutionResult::pending));
                info!(step = %step.id, "run halted before step");
                break;
            }

            let result = executor.execute(step);
            let failed = result.failed();
            outcome.results.push(result);
            if failed {
                outcome.failed = true;
                rollback_failed = !self.roll_back_applied(&mut executor, &mut outcome.results);
                outcome
                    .results
                    .extend(plan.steps()[index + 1..].iter().map(ExecutionResult::pending));
                break;
            }
        }

        let status = match (outcome.failed, rollback_failed) {
            (false, _) => RunStatus::Committed,
            (true, false) => RunStatus::RolledBack,
            (true, true) => RunStatus::Failed,
        };
        executor.finish(status)?;
        Ok(outcome)
    }

    /// Undoes every step still `Applied` (awaiting external verification), newest first.
    fn roll_back_applied(&self, executor: &mut StepExecutor, results: &mut [ExecutionResult]) -> bool {
        let mut clean = results
            .last()
            .is_none_or(|result| result.state == StepState::RolledBack);
        for result in results.iter_mut().rev() {
            if result.state != StepState::Applied {
                continue;
            }
            warn!(step = %result.step_id, "rolling back applied step after a later failure");
            match executor.rollback(&result.step_id) {
                Ok(()) => {}
                Err(err) => {
                    clean = false;
                    result.error = Some(format!("rollback incomplete: {err}"));
                }
            }
            result.state = executor.state(&result.step_id);
        }
        clean
    }

    pub fn verify(&self, outcome: Option<&RunOutcome>) -> Result<VerificationReport, RunError> {
        let mut checks = Vec::new();
        let standard = &self.standard;

        let mut directories = standard.directories.clone();
        directories.sort();
        for dir in &directories {
            let presence = self.presence(dir);
            checks.push(Check::new(
                format!("dir:{dir}"),
                presence == Presence::Dir,
                presence.describe("directory"),
            ));
        }
        for file in &standard.files {
            let presence = self.presence(&file.path);
            checks.push(Check::new(
                format!("file:{}", file.path),
                presence == Presence::File,
                presence.describe("file"),
            ));
        }
        for relocation in &standard.relocations {
            let source = self.presence(&relocation.from);
            let target = self.presence(&relocation.to);
            // A project that never had the source file has nothing to relocate.
            let (passed, detail) = match (&source, &target) {
                (Presence::Missing, Presence::File) => (true, "relocated".to_string()),
                (Presence::Missing, Presence::Missing) => (true, "not present".to_string()),
                (Presence::Rejected(reason), _) | (_, Presence::Rejected(reason)) => (false, reason.clone()),
                _ => (
                    false,
                    format!("{} should live at {}", relocation.from, relocation.to),
                ),
            };
            checks.push(Check::new(format!("relocation:{}", relocation.to), passed, detail));
        }
        if let Some(rule) = &standard.ignore {
            let (passed, detail) = match self.read_optional(&rule.path) {
                Ok(content) => {
                    let content = content.unwrap_or_default();
                    let present = content.lines().map(str::trim).collect::<Vec<_>>();
                    let missing = rule
                        .entries
                        .iter()
                        .filter(|entry| !present.contains(&entry.trim()))
                        .cloned()
                        .collect::<Vec<_>>();
                    if missing.is_empty() {
                        (true, "all entries present".to_string())
                    } else {
                        (false, format!("missing {}", missing.join(", ")))
                    }
                }
                Err(reason) => (false, reason),
            };
            checks.push(Check::new(format!("ignore:{}", rule.path), passed, detail));
        }

        let config = match self.presence(&standard.config_path) {
            Presence::File => read_config(&self.root.join(&standard.config_path)),
            Presence::Missing => ConfigState::Missing,
            Presence::Dir => ConfigState::Invalid("config path is a directory".to_string()),
            Presence::Rejected(reason) => ConfigState::Invalid(reason),
        };
        match &config {
            ConfigState::Loaded(config) => {
                checks.push(Check::new("config:parses", true, "parsed"));
                let behind = config.is_behind(&standard.version);
                checks.push(Check::new(
                    "config:standard_version",
                    !behind,
                    format!("found {}, target {}", config.standard_version, standard.version),
                ));
            }
            ConfigState::Missing => {
                checks.push(Check::new("config:parses", false, "config missing"));
                checks.push(Check::new("config:standard_version", false, "config missing"));
            }
            ConfigState::Invalid(detail) => {
                checks.push(Check::new("config:parses", false, detail.clone()));
                checks.push(Check::new("config:standard_version", false, "config unreadable"));
            }
        }

        if let Some(outcome) = outcome {
            let failed = outcome
                .results
                .iter()
                .filter(|result| result.failed())
                .map(|result| result.step_id.clone())
                .collect::<Vec<_>>();
            checks.push(Check::new(
                "execution:no_failed_steps",
                failed.is_empty(),
                if failed.is_empty() {
                    "no step failed".to_string()
                } else {
                    format!("failed: {}", failed.join(", "))
                },
            ));
        }

        let mut report = VerificationReport::from_checks(checks);
        if let Some(outcome) = outcome {
            report.external_verification = outcome.external_steps();
        }
        self.audit.record(
            "project_verified",
            if report.is_ready() {
                AuditStatus::Success
            } else {
                AuditStatus::Failure
            },
            "retrofit_pipeline",
            json!({ "readiness_score": report.readiness_score, "blockers": report.blockers }),
        );
        Ok(report)
    }

    /// Replays a recorded run backwards, restoring every file it touched.
    pub fn rollback(&self, run_id: &str) -> Result<RollbackSummary, RunError> {
        let mut backups = BackupManager::resume(&self.layout, &self.validator, self.audit.clone(), run_id)?;
        if let Err(err) = backups.check_restorable() {
            warn!(run_id, error = %err, "run cannot be rolled back; nothing was changed");
            backups.release()?;
            return Err(err.into());
        }
        let replayed = match backups.restore_run() {
            Ok(replayed) => replayed,
            Err(err) => {
                backups.finish(RunStatus::Failed)?;
                return Err(err.into());
            }
        };
        backups.finish(RunStatus::RolledBack)?;
        info!(run_id, replayed, "run rolled back");
        Ok(RollbackSummary {
            run_id: run_id.to_string(),
            replayed,
        })
    }

    pub fn runs(&self) -> Result<Vec<RunMetadata>, RunError> {
        Ok(BackupManager::runs(&self.layout, &self.validator)?)
    }

    /// Deletes the backup copies of a finished run.
    pub fn clean_run(&self, run_id: &str) -> Result<usize, RunError> {
        let mut backups = BackupManager::resume(&self.layout, &self.validator, self.audit.clone(), run_id)?;
        let removed = backups.cleanup_run();
        backups.release()?;
        Ok(removed?)
    }

    fn presence(&self, raw: &str) -> Presence {
        let path = match self.validator.validate(raw) {
            Ok(path) => path,
            Err(err) => return Presence::Rejected(err.to_string()),
        };
        match fs::symlink_metadata(path.as_path()) {
            Ok(meta) if meta.is_dir() => Presence::Dir,
            Ok(meta) if meta.is_file() => Presence::File,
            Ok(_) => Presence::Rejected(format!("{path} is not a regular file or directory")),
            Err(_) => Presence::Missing,
        }
    }

    fn read_optional(&self, raw: &str) -> Result<Option<String>, String> {
        match self.presence(raw) {
            Presence::Missing => Ok(None),
            Presence::File => fs::read_to_string(self.root.join(raw))
                .map(Some)
                .map_err(|err| format!("failed to read {raw}: {err}")),
            Presence::Dir => Err(format!("{raw} is a directory")),
            Presence::Rejected(reason) => Err(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Presence {
    Missing,
    Dir,
    File,
    Rejected(String),
}

impl Presence {
    fn describe(&self, expected: &str) -> String {
        match self {
            Self::Missing => format!("missing {expected}"),
            Self::Dir if expected == "directory" => "present".to_string(),
            Self::File if expected == "file" => "present".to_string(),
            Self::Dir => format!("expected a {expected}, found a directory"),
            Self::File => format!("expected a {expected}, found a file"),
            Self::Rejected(reason) => reason.clone(),
        }
    }
}

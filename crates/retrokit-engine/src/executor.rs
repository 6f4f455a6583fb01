use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use retrokit_store::{AuditLog, AuditStatus, Backup, BackupError, BackupManager, RunStatus};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::context::{snapshot, Snapshot};
use crate::{ApplyContext, Step, StepError, VerifyContext, VerifyOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Applied,
    Verified,
    Failed,
    RolledBack,
}

impl StepState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// `Applied -> RolledBack` covers steps undone because a later step failed.
    fn can_become(self, next: StepState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Applied)
                | (Self::Pending, Self::Failed)
                | (Self::Applied, Self::Verified)
                | (Self::Applied, Self::Failed)
                | (Self::Applied, Self::RolledBack)
                | (Self::Failed, Self::RolledBack)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub step_id: String,
    pub description: String,
    pub state: StepState,
    pub applied: bool,
    pub verified: bool,
    pub external_verification: bool,
    pub error: Option<String>,
    pub backups: Vec<Backup>,
}

impl ExecutionResult {
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            description: step.description.clone(),
            state: StepState::Pending,
            applied: false,
            verified: false,
            external_verification: false,
            error: None,
            backups: Vec::new(),
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Default)]
struct StepRecord {
    state: Option<StepState>,
    snapshots: Vec<Snapshot>,
    touched: BTreeSet<PathBuf>,
}

/// Drives steps through `Pending -> Applied -> Verified` and undoes them on failure.
#[derive(Debug)]
pub struct StepExecutor {
    backups: BackupManager,
    audit: Arc<AuditLog>,
    records: BTreeMap<String, StepRecord>,
}

impl StepExecutor {
    pub fn new(backups: BackupManager, audit: Arc<AuditLog>) -> Self {
        Self {
            backups,
            audit,
            records: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        self.backups.run_id()
    }

    pub fn state(&self, step_id: &str) -> StepState {
        self.records
            .get(step_id)
            .and_then(|record| record.state)
            .unwrap_or(StepState::Pending)
    }

    pub fn execute(&mut self, step: &Step) -> ExecutionResult {
        let mut result = ExecutionResult::pending(step);
        if self.state(&step.id) != StepState::Pending {
            result.state = self.state(&step.id);
            result.error = Some(format!("step '{}' was already executed in this run", step.id));
            return result;
        }
        self.records.insert(step.id.clone(), StepRecord::default());

        if let Err(err) = self.apply(step) {
            self.transition(&step.id, StepState::Failed, Some(&err.to_string()));
            result.error = Some(err.to_string());
            self.finish_failed(step, &mut result);
            return result;
        }
        self.transition(&step.id, StepState::Applied, None);
        result.applied = true;

        let verified = step
            .operation
            .verify(&VerifyContext::new(self.backups.validator()));
        match verified {
            Ok(VerifyOutcome::Passed) => {
                self.transition(&step.id, StepState::Verified, None);
                result.verified = true;
            }
            Ok(VerifyOutcome::External) => {
                result.external_verification = true;
                info!(step = %step.id, "step needs external verification");
            }
            Ok(VerifyOutcome::Failed(detail)) => {
                let err = StepError::Verification {
                    step: step.id.clone(),
                    detail,
                };
                self.transition(&step.id, StepState::Failed, Some(&err.to_string()));
                result.error = Some(err.to_string());
                self.finish_failed(step, &mut result);
                return result;
            }
            Err(err) => {
                self.transition(&step.id, StepState::Failed, Some(&err.to_string()));
                result.error = Some(err.to_string());
                self.finish_failed(step, &mut result);
                return result;
            }
        }

        result.state = self.state(&step.id);
        result.backups = self.backups_of(&step.id);
        result
    }

    /// Undoes a step that is `Failed`, or `Applied` and waiting on external verification.
    pub fn rollback(&mut self, step_id: &str) -> Result<(), StepError> {
        let state = self.state(step_id);
        if !state.can_become(StepState::RolledBack) {
            return Ok(());
        }

        let snapshots = self
            .records
            .get(step_id)
            .map(|record| record.snapshots.clone())
            .unwrap_or_default();
        let mut first_error = None;
        for snapshot in snapshots.iter().rev() {
            let outcome = match snapshot {
                Snapshot::Saved(backup) => self.backups.restore(backup),
                Snapshot::Absent(path) => self.backups.discard_created(path),
            };
            if let Err(err) = outcome {
                warn!(step = step_id, error = %err, "rollback could not undo a change");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => {
                self.audit.record(
                    "step_rollback",
                    AuditStatus::Failure,
                    "step_executor",
                    json!({ "run_id": self.run_id(), "step": step_id, "error": err.to_string() }),
                );
                Err(err.into())
            }
            None => {
                self.transition(step_id, StepState::RolledBack, None);
                Ok(())
            }
        }
    }

    pub fn backups_of(&self, step_id: &str) -> Vec<Backup> {
        self.records
            .get(step_id)
            .map(|record| {
                record
                    .snapshots
                    .iter()
                    .filter_map(|snapshot| match snapshot {
                        Snapshot::Saved(backup) => Some(backup.clone()),
                        Snapshot::Absent(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ends the run and releases the project's active-run marker.
    pub fn finish(self, status: RunStatus) -> Result<String, BackupError> {
        let run_id = self.backups.run_id().to_string();
        self.backups.finish(status)?;
        Ok(run_id)
    }

    fn apply(&mut self, step: &Step) -> Result<(), StepError> {
        let record = self.records.entry(step.id.clone()).or_default();
        for raw in step.operation.targets() {
            let path = self.backups.validator().validate(&raw)?;
            snapshot(
                &mut self.backups,
                &mut record.snapshots,
                &mut record.touched,
                &step.id,
                &path,
            )?;
        }

        let mut ctx = ApplyContext::new(
            &step.id,
            &mut self.backups,
            &mut record.snapshots,
            &mut record.touched,
        );
        step.operation.apply(&mut ctx)
    }

    fn finish_failed(&mut self, step: &Step, result: &mut ExecutionResult) {
        if let Err(err) = self.rollback(&step.id) {
            result.error = Some(format!(
                "{}; rollback incomplete: {err}",
                result.error.take().unwrap_or_default()
            ));
        }
        result.state = self.state(&step.id);
        result.backups = self.backups_of(&step.id);
    }

    fn transition(&mut self, step_id: &str, next: StepState, error: Option<&str>) {
        let record = self.records.entry(step_id.to_string()).or_default();
        let current = record.state.unwrap_or(StepState::Pending);
        if !current.can_become(next) {
            warn!(
                step = step_id,
                from = current.as_str(),
                to = next.as_str(),
                "ignoring invalid step transition"
            );
            return;
        }
        record.state = Some(next);

        let status = match next {
            StepState::Failed => AuditStatus::Failure,
            _ => AuditStatus::Success,
        };
        self.audit.record(
            "step_transition",
            status,
            "step_executor",
            json!({
                "run_id": self.backups.run_id(),
                "step": step_id,
                "from": current.as_str(),
                "to": next.as_str(),
                "error": error,
            }),
        );
        match next {
            StepState::Failed | StepState::RolledBack => {
                warn!(step = step_id, from = current.as_str(), to = next.as_str(), "step transition")
            }
            _ => info!(step = step_id, from = current.as_str(), to = next.as_str(), "step transition"),
        }
    }
}

mod assess;
mod context;
mod error;
mod executor;
mod operation;
mod pipeline;
mod report;
mod scan;

pub use assess::{Assessment, Gap, GapKind};
pub use context::{ApplyContext, VerifyContext};
pub use error::{RunError, StepError};
pub use executor::{ExecutionResult, StepExecutor, StepState};
pub use operation::{FileAction, Plan, Step, StepOperation, VerifyOutcome, WriteMode};
pub use pipeline::{Confirm, RetrofitPipeline, RollbackSummary, RunOutcome};
pub use report::{readiness_score, Check, VerificationReport};
pub use scan::{ConfigState, ProjectScan};

#[cfg(test)]
mod tests;

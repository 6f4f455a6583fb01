use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("dependency cycle detected involving: {}", involved.join(", "))]
    Cycle { involved: Vec<String> },
    #[error("duplicate migration step '{id}'")]
    DuplicateStep { id: String },
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
}

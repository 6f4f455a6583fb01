use std::collections::BTreeSet;

use retrokit_core::{Effort, Impact};

/// One unit of migration work. `Op` is whatever the executor runs for it.
#[derive(Debug, Clone)]
pub struct MigrationStep<Op> {
    pub id: String,
    pub description: String,
    pub dependencies: BTreeSet<String>,
    pub effort: Effort,
    pub impact: Impact,
    pub operation: Op,
}

impl<Op> MigrationStep<Op> {
    pub fn new(id: impl Into<String>, description: impl Into<String>, operation: Op) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: BTreeSet::new(),
            effort: Effort::default(),
            impact: Impact::default(),
            operation,
        }
    }

    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    pub fn with_impact(mut self, impact: Impact) -> Self {
        self.impact = impact;
        self
    }
}

/// Steps in execution order. Only [`crate::plan`] builds one.
#[derive(Debug, Clone)]
pub struct MigrationPlan<Op> {
    steps: Vec<MigrationStep<Op>>,
}

impl<Op> MigrationPlan<Op> {
    pub(crate) fn from_ordered(steps: Vec<MigrationStep<Op>>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[MigrationStep<Op>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.id.as_str()).collect()
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&MigrationStep<Op>> {
        self.steps.iter().find(|step| step.id == id)
    }
}

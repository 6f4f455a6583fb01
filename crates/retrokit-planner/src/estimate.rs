use std::collections::BTreeMap;

use retrokit_core::Impact;
use serde::Serialize;

use crate::MigrationPlan;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanEstimate {
    pub total_effort_points: u32,
    pub highest_impact: Option<Impact>,
    pub by_impact: BTreeMap<Impact, usize>,
}

pub fn estimate<Op>(plan: &MigrationPlan<Op>) -> PlanEstimate {
    let mut summary = PlanEstimate::default();
    for step in plan.steps() {
        summary.total_effort_points += step.effort.points();
        *summary.by_impact.entry(step.impact).or_default() += 1;
    }
    summary.highest_impact = summary.by_impact.keys().next_back().copied();
    summary
}

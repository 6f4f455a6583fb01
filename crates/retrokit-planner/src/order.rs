use std::collections::{BTreeSet, HashMap};

use retrokit_core::{Effort, Impact};
use tracing::debug;

use crate::{MigrationPlan, MigrationStep, PlanError};

/// Orders `steps` so every step follows its dependencies.
///
/// Among steps that are ready at the same time the lowest impact goes first,
/// then the lowest effort, then the id. Nothing is returned for an invalid graph.
pub fn plan<Op>(steps: Vec<MigrationStep<Op>>) -> Result<MigrationPlan<Op>, PlanError> {
    let order = topo_order(&steps)?;

    let mut slots = steps.into_iter().map(Some).collect::<Vec<_>>();
    let ordered = order
        .into_iter()
        .filter_map(|index| slots[index].take())
        .collect::<Vec<_>>();

    debug!(
        steps = ordered.len(),
        order = ?ordered.iter().map(|step| step.id.as_str()).collect::<Vec<_>>(),
        "migration plan ordered"
    );
    Ok(MigrationPlan::from_ordered(ordered))
}

fn topo_order<Op>(steps: &[MigrationStep<Op>]) -> Result<Vec<usize>, PlanError> {
    let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(steps.len());
    for (index, step) in steps.iter().enumerate() {
        if index_of.insert(step.id.as_str(), index).is_some() {
            return Err(PlanError::DuplicateStep {
                id: step.id.clone(),
            });
        }
    }

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    let mut in_degree: Vec<usize> = vec![0; steps.len()];
    for (index, step) in steps.iter().enumerate() {
        for dependency in &step.dependencies {
            let Some(&parent) = index_of.get(dependency.as_str()) else {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            };
            dependents[parent].push(index);
            in_degree[index] += 1;
        }
    }

    let mut ready: BTreeSet<(Impact, Effort, &str, usize)> = in_degree
        .iter()
        .enumerate()
        .filter_map(|(index, degree)| (*degree == 0).then(|| ready_key(steps, index)))
        .collect();
    let mut ordered = Vec::with_capacity(steps.len());

    while let Some((_, _, _, next)) = ready.pop_first() {
        ordered.push(next);
        for &child in &dependents[next] {
            in_degree[child] = in_degree[child].saturating_sub(1);
            if in_degree[child] == 0 {
                ready.insert(ready_key(steps, child));
            }
        }
    }

    if ordered.len() != steps.len() {
        let mut involved = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(index, _)| steps[index].id.clone())
            .collect::<Vec<_>>();
        involved.sort();
        return Err(PlanError::Cycle { involved });
    }

    Ok(ordered)
}

fn ready_key<Op>(steps: &[MigrationStep<Op>], index: usize) -> (Impact, Effort, &str, usize) {
    let step = &steps[index];
    (step.impact, step.effort, step.id.as_str(), index)
}

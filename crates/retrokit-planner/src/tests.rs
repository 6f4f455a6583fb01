use proptest::prelude::*;
use retrokit_core::{Effort, Impact};

use super::*;

fn step(id: &str) -> MigrationStep<()> {
    MigrationStep::new(id, format!("step {id}"), ())
}

#[test]
fn places_shared_dependency_first() {
    let steps = vec![
        step("b").depends_on("a"),
        step("c").depends_on("a"),
        step("a"),
    ];

    let plan = plan(steps).expect("plan must build");
    let ids = plan.ids();
    assert_eq!(ids[0], "a");
    assert_eq!(ids.len(), 3);
    assert!(ids.contains(&"b") && ids.contains(&"c"));
}

#[test]
fn ready_steps_are_ordered_by_impact_then_effort_then_id() {
    let steps = vec![
        step("docs").with_impact(Impact::High).with_effort(Effort::Trivial),
        step("readme").with_impact(Impact::Low).with_effort(Effort::Medium),
        step("ignore").with_impact(Impact::Low).with_effort(Effort::Trivial),
        step("changelog").with_impact(Impact::Low).with_effort(Effort::Trivial),
    ];

    let plan = plan(steps).expect("plan must build");
    assert_eq!(plan.ids(), vec!["changelog", "ignore", "readme", "docs"]);
}

#[test]
fn dependencies_override_tie_breaking() {
    let steps = vec![
        step("config").with_impact(Impact::Critical),
        step("readme")
            .with_impact(Impact::Low)
            .depends_on("config"),
        step("tests-dir").with_impact(Impact::Medium),
    ];

    let plan = plan(steps).expect("plan must build");
    assert_eq!(plan.ids(), vec!["tests-dir", "config", "readme"]);
    assert_eq!(plan.position("readme"), Some(2));
    assert!(plan.get("missing").is_none());
}

#[test]
fn cycle_is_reported_without_a_plan() {
    let steps = vec![
        step("a").depends_on("c"),
        step("b").depends_on("a"),
        step("c").depends_on("b"),
        step("d"),
    ];

    let err = plan(steps).expect_err("cycle must fail");
    assert_eq!(
        err,
        PlanError::Cycle {
            involved: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        }
    );
    assert_eq!(err.to_string(), "dependency cycle detected involving: a, b, c");
}

#[test]
fn self_dependency_is_a_cycle() {
    let err = plan(vec![step("a").depends_on("a")]).expect_err("must fail");
    assert!(matches!(err, PlanError::Cycle { .. }));
}

#[test]
fn rejects_duplicate_ids_and_unknown_dependencies() {
    let err = plan(vec![step("a"), step("a")]).expect_err("duplicate must fail");
    assert_eq!(err, PlanError::DuplicateStep { id: "a".to_string() });

    let err = plan(vec![step("a").depends_on("ghost")]).expect_err("unknown must fail");
    assert_eq!(
        err,
        PlanError::UnknownDependency {
            step: "a".to_string(),
            dependency: "ghost".to_string(),
        }
    );
}

#[test]
fn empty_input_yields_empty_plan() {
    let plan = plan(Vec::<MigrationStep<()>>::new()).expect("empty plan");
    assert!(plan.is_empty());
    assert_eq!(estimate(&plan), PlanEstimate::default());
}

#[test]
fn estimate_sums_effort_and_groups_impact() {
    let steps = vec![
        step("a").with_effort(Effort::Large).with_impact(Impact::High),
        step("b").with_effort(Effort::Trivial).with_impact(Impact::Low),
        step("c").with_effort(Effort::Medium).with_impact(Impact::Low),
    ];
    let plan = plan(steps).expect("plan must build");

    let summary = estimate(&plan);
    assert_eq!(summary.total_effort_points, 8 + 1 + 5);
    assert_eq!(summary.highest_impact, Some(Impact::High));
    assert_eq!(summary.by_impact.get(&Impact::Low), Some(&2));
    assert_eq!(summary.by_impact.get(&Impact::High), Some(&1));
}

fn impact_strategy() -> impl Strategy<Value = Impact> {
    prop_oneof![
        Just(Impact::Low),
        Just(Impact::Medium),
        Just(Impact::High),
        Just(Impact::Critical),
    ]
}

fn effort_strategy() -> impl Strategy<Value = Effort> {
    prop_oneof![
        Just(Effort::Trivial),
        Just(Effort::Small),
        Just(Effort::Medium),
        Just(Effort::Large),
    ]
}

// Edges only point from a later index to an earlier one, so the graph is acyclic.
fn acyclic_steps() -> impl Strategy<Value = Vec<MigrationStep<()>>> {
    prop::collection::vec(
        (
            impact_strategy(),
            effort_strategy(),
            prop::collection::vec(any::<prop::sample::Index>(), 0..4),
        ),
        1..24,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(index, (impact, effort, picks))| {
                let mut next = step(&format!("s{index:02}"))
                    .with_impact(impact)
                    .with_effort(effort);
                if index > 0 {
                    for pick in picks {
                        next = next.depends_on(format!("s{:02}", pick.index(index)));
                    }
                }
                next
            })
            .rev()
            .collect()
    })
}

proptest! {
    #[test]
    fn plan_never_orders_a_step_before_its_dependencies(steps in acyclic_steps()) {
        let count = steps.len();
        let plan = plan(steps).expect("acyclic input must plan");
        prop_assert_eq!(plan.len(), count);
        for (position, step) in plan.steps().iter().enumerate() {
            for dependency in &step.dependencies {
                let dep_position = plan.position(dependency).expect("dependency must be planned");
                prop_assert!(dep_position < position);
            }
        }
    }
}

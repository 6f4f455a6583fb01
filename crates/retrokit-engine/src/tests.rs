use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use retrokit_core::{Effort, ExecutionMode, Impact, Settings, TargetStandard};
use retrokit_planner::MigrationStep;
use retrokit_store::{AuditLog, BackupManager, RunStatus, StateLayout};

use super::*;

struct Fixture {
    _project: tempfile::TempDir,
    _state: tempfile::TempDir,
    root: PathBuf,
    layout: StateLayout,
    audit: Arc<AuditLog>,
}

fn fixture() -> Fixture {
    let project = tempfile::tempdir().expect("must create temp project");
    let state = tempfile::tempdir().expect("must create temp state");
    let root = fs::canonicalize(project.path()).expect("must canonicalize project");
    let layout = StateLayout::new(state.path());
    layout.ensure_base_dirs().expect("must create state dirs");
    let audit = Arc::new(AuditLog::open(layout.audit_log_path(), 1024 * 1024, 2));
    Fixture {
        _project: project,
        _state: state,
        root,
        layout,
        audit,
    }
}

fn pipeline(fx: &Fixture, standard: TargetStandard) -> RetrofitPipeline {
    RetrofitPipeline::new(
        &fx.root,
        fx.layout.clone(),
        Settings::default(),
        standard,
        fx.audit.clone(),
    )
    .expect("pipeline must build")
}

fn bare_standard() -> TargetStandard {
    TargetStandard::from_toml_str("version = \"1.0.0\"\n").expect("standard must parse")
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent");
    }
    fs::write(path, content).expect("must write fixture file");
}

fn read(root: &Path, relative: &str) -> String {
    fs::read_to_string(root.join(relative)).expect("must read file")
}

#[derive(Debug)]
struct Scripted {
    path: String,
    content: String,
    verdict: VerifyOutcome,
}

impl StepOperation for Scripted {
    fn targets(&self) -> Vec<String> {
        vec![self.path.clone()]
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), StepError> {
        ctx.write(&self.path, self.content.as_bytes())
    }

    fn verify(&self, _ctx: &VerifyContext<'_>) -> Result<VerifyOutcome, StepError> {
        Ok(self.verdict.clone())
    }
}

#[derive(Debug)]
struct HalfDone {
    written: String,
    escape: String,
}

impl StepOperation for HalfDone {
    fn targets(&self) -> Vec<String> {
        Vec::new()
    }

    fn apply(&self, ctx: &mut ApplyContext<'_>) -> Result<(), StepError> {
        ctx.write(&self.written, b"partial")?;
        ctx.write(&self.escape, b"never")
    }
}

fn scripted(id: &str, path: &str, content: &str, verdict: VerifyOutcome) -> Step {
    MigrationStep::new(
        id,
        format!("write {path}"),
        Arc::new(Scripted {
            path: path.to_string(),
            content: content.to_string(),
            verdict,
        }) as Arc<dyn StepOperation>,
    )
}

fn always(_: &Step) -> bool {
    true
}

#[test]
fn failed_verification_rolls_back_only_that_step() {
    let fx = fixture();
    write(&fx.root, "retrokit.toml", "standard_version = \"1.0.0\"\nproject_name = \"demo\"\n");
    write(&fx.root, "b.txt", "b-original");
    let pipeline = pipeline(&fx, bare_standard());

    let plan = pipeline
        .plan_steps(vec![
            scripted("a", "a.txt", "a-new", VerifyOutcome::Passed),
            scripted("b", "b.txt", "b-new", VerifyOutcome::Failed("checksum off".to_string()))
                .depends_on("a"),
        ])
        .expect("plan must build");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run must complete");

    assert!(outcome.failed);
    let a = &outcome.results[0];
    assert_eq!(a.state, StepState::Verified);
    assert!(a.applied && a.verified);
    let b = &outcome.results[1];
    assert_eq!(b.state, StepState::RolledBack);
    assert!(b.applied && !b.verified);
    assert!(b.error.as_deref().is_some_and(|err| err.contains("checksum off")));
    assert_eq!(b.backups.len(), 1);

    assert_eq!(read(&fx.root, "a.txt"), "a-new");
    assert_eq!(read(&fx.root, "b.txt"), "b-original");

    let report = pipeline.verify(Some(&outcome)).expect("verify");
    assert_eq!(report.checks.len(), 3);
    assert_eq!(report.blockers.len(), 1);
    assert!(report.blockers[0].starts_with("execution:no_failed_steps"));
    assert_eq!(report.readiness_score, 66.7);

    let run_id = outcome.run_id.expect("mutating run must have an id");
    let runs = pipeline.runs().expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, run_id);
    assert_eq!(runs[0].status, RunStatus::RolledBack);
}

#[test]
fn externally_verified_steps_are_rolled_back_when_a_later_step_fails() {
    let fx = fixture();
    write(&fx.root, "notes.md", "before");
    let pipeline = pipeline(&fx, bare_standard());

    let plan = pipeline
        .plan_steps(vec![
            scripted("notes", "notes.md", "after", VerifyOutcome::External),
            scripted("fresh", "fresh/new.md", "new", VerifyOutcome::Passed).depends_on("notes"),
            scripted("broken", "broken.md", "x", VerifyOutcome::Failed("bad".to_string()))
                .depends_on("fresh"),
        ])
        .expect("plan must build");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run must complete");

    let states = outcome
        .results
        .iter()
        .map(|result| (result.step_id.as_str(), result.state))
        .collect::<Vec<_>>();
    assert_eq!(
        states,
        vec![
            ("notes", StepState::RolledBack),
            ("fresh", StepState::Verified),
            ("broken", StepState::RolledBack),
        ]
    );
    assert_eq!(read(&fx.root, "notes.md"), "before");
    assert_eq!(read(&fx.root, "fresh/new.md"), "new");
    assert!(!fx.root.join("broken.md").exists());
    assert!(outcome.external_steps().is_empty());
}

#[test]
fn external_verification_leaves_step_applied_on_success() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let plan = pipeline
        .plan_steps(vec![scripted("hook", "hook.sh", "#!/bin/sh\n", VerifyOutcome::External)])
        .expect("plan");

    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run");
    assert!(!outcome.failed);
    assert_eq!(outcome.results[0].state, StepState::Applied);
    assert_eq!(outcome.external_steps(), vec!["hook".to_string()]);

    let report = pipeline.verify(Some(&outcome)).expect("verify");
    assert_eq!(report.external_verification, vec!["hook".to_string()]);
}

#[test]
fn apply_failure_undoes_partial_writes_and_skips_the_rest() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let half = MigrationStep::new(
        "half",
        "writes then escapes",
        Arc::new(HalfDone {
            written: "docs/partial.md".to_string(),
            escape: "../outside.md".to_string(),
        }) as Arc<dyn StepOperation>,
    )
    .with_impact(Impact::Low);
    let later = scripted("later", "later.md", "later", VerifyOutcome::Passed)
        .with_impact(Impact::High);

    let plan = pipeline.plan_steps(vec![later, half]).expect("plan");
    assert_eq!(plan.ids(), vec!["half", "later"]);
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run");

    let half = &outcome.results[0];
    assert_eq!(half.state, StepState::RolledBack);
    assert!(!half.applied);
    assert!(half
        .error
        .as_deref()
        .is_some_and(|err| err.contains("reason=path_traversal")));
    assert!(!fx.root.join("docs").exists());
    assert_eq!(outcome.results[1].state, StepState::Pending);
    assert!(!fx.root.join("later.md").exists());
}

#[test]
fn dry_run_touches_nothing() {
    let fx = fixture();
    write(&fx.root, "ARCHITECTURE.md", "# Architecture\n");
    let pipeline = pipeline(&fx, TargetStandard::builtin().expect("builtin"));

    let scan = pipeline.analyze().expect("analyze");
    let assessment = pipeline.assess(&scan);
    let plan = pipeline.plan(&assessment).expect("plan");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::DryRun, &mut always)
        .expect("dry run");

    assert!(outcome.run_id.is_none());
    assert_eq!(outcome.results.len(), plan.len());
    assert!(outcome
        .results
        .iter()
        .all(|result| result.state == StepState::Pending && !result.applied));
    let entries = fs::read_dir(&fx.root).expect("read root").count();
    assert_eq!(entries, 1);
    assert!(pipeline.runs().expect("runs").is_empty());
}

#[test]
fn declined_confirmation_halts_between_steps() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let plan = pipeline
        .plan_steps(vec![
            scripted("one", "one.md", "1", VerifyOutcome::Passed).with_effort(Effort::Trivial),
            scripted("two", "two.md", "2", VerifyOutcome::Passed).with_effort(Effort::Large),
        ])
        .expect("plan");

    let mut asked = Vec::new();
    let mut confirm = |step: &Step| {
        asked.push(step.id.clone());
        step.id == "one"
    };
    let outcome = pipeline
        .execute(&plan, ExecutionMode::StepByStep, &mut confirm)
        .expect("run");

    assert_eq!(asked, vec!["one".to_string(), "two".to_string()]);
    assert!(outcome.halted);
    assert!(!outcome.failed);
    assert_eq!(outcome.results[0].state, StepState::Verified);
    assert_eq!(outcome.results[1].state, StepState::Pending);
    assert!(fx.root.join("one.md").exists());
    assert!(!fx.root.join("two.md").exists());
}

#[test]
fn assessment_finds_every_gap_kind() {
    let fx = fixture();
    write(&fx.root, "Cargo.toml", "[package]\nname = \"demo\"\n");
    write(&fx.root, "ARCHITECTURE.md", "# Architecture\n");
    write(&fx.root, "README.md", "# demo\n");
    write(&fx.root, ".gitignore", "target/\n*.orig\n");
    write(&fx.root, "docs/notes.md", "notes\n");
    write(
        &fx.root,
        "retrokit.toml",
        "standard_version = \"0.9.0\"\nproject_name = \"demo\"\n",
    );
    let pipeline = pipeline(&fx, TargetStandard::builtin().expect("builtin"));

    let scan = pipeline.analyze().expect("analyze");
    assert!(scan.ecosystems.contains("rust"));
    assert_eq!(scan.project_name, "demo");
    assert!(scan.has_dir("docs"));

    let assessment = pipeline.assess(&scan);
    let kinds = assessment
        .gaps
        .iter()
        .map(|gap| gap.kind.clone())
        .collect::<Vec<_>>();

    assert!(kinds.contains(&GapKind::MissingDirectory {
        path: "docs/adr".to_string()
    }));
    assert!(!kinds.contains(&GapKind::MissingDirectory {
        path: "docs".to_string()
    }));
    assert!(kinds.contains(&GapKind::MisplacedFile {
        from: "ARCHITECTURE.md".to_string(),
        to: "docs/ARCHITECTURE.md".to_string(),
    }));
    assert!(kinds.contains(&GapKind::MissingIgnoreEntries {
        path: ".gitignore".to_string(),
        entries: vec![".retrokit/".to_string()],
    }));
    assert!(kinds.iter().any(|kind| matches!(
        kind,
        GapKind::MissingFile { path, .. } if path == "CHANGELOG.md"
    )));
    assert!(!kinds.iter().any(|kind| matches!(
        kind,
        GapKind::MissingFile { path, .. } if path == "README.md"
    )));
    assert!(kinds.iter().any(|kind| matches!(
        kind,
        GapKind::ConfigDrift { found: Some(found), .. } if found.to_string() == "0.9.0"
    )));
    assert_eq!(assessment.draft_config.standard_version.to_string(), "1.0.0");
    assert_eq!(assessment.draft_config.ecosystems, vec!["rust".to_string()]);

    let plan = pipeline.plan(&assessment).expect("plan");
    let adr_dir = plan.position("dir:docs/adr").expect("adr dir step");
    let adr_file = plan
        .position("file:docs/adr/0000-record-architecture-decisions.md")
        .expect("adr file step");
    assert!(adr_dir < adr_file);
}

#[test]
fn auto_retrofit_converges_and_rolls_back_by_run_id() {
    let fx = fixture();
    write(&fx.root, "ARCHITECTURE.md", "# Architecture\n");
    write(&fx.root, ".gitignore", "target/");
    write(&fx.root, "src/main.rs", "fn main() {}\n");
    let pipeline = pipeline(&fx, TargetStandard::builtin().expect("builtin"));

    let before = pipeline.verify(None).expect("verify before");
    assert!(before.readiness_score < 100.0);
    assert!(!before.is_ready());

    let scan = pipeline.analyze().expect("analyze");
    let assessment = pipeline.assess(&scan);
    let plan = pipeline.plan(&assessment).expect("plan");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run");
    assert!(!outcome.failed, "results: {:?}", outcome.results);
    assert!(outcome
        .results
        .iter()
        .all(|result| result.state == StepState::Verified));

    assert_eq!(read(&fx.root, "docs/ARCHITECTURE.md"), "# Architecture\n");
    assert!(!fx.root.join("ARCHITECTURE.md").exists());
    assert_eq!(read(&fx.root, ".gitignore"), "target/\n.retrokit/\n*.orig\n");
    let readme = read(&fx.root, "README.md");
    assert!(readme.starts_with(&format!(
        "# {}",
        fx.root.file_name().expect("name").to_string_lossy()
    )));

    let after = pipeline.verify(Some(&outcome)).expect("verify after");
    assert_eq!(after.readiness_score, 100.0, "blockers: {:?}", after.blockers);
    assert!(after.is_ready());

    let rerun = pipeline.assess(&pipeline.analyze().expect("analyze"));
    assert!(rerun.is_conformant(), "gaps: {:?}", rerun.gaps);

    let run_id = outcome.run_id.expect("run id");
    let summary = pipeline.rollback(&run_id).expect("rollback");
    assert_eq!(summary.run_id, run_id);
    assert!(summary.replayed > 0);

    assert_eq!(read(&fx.root, "ARCHITECTURE.md"), "# Architecture\n");
    assert_eq!(read(&fx.root, ".gitignore"), "target/");
    assert!(!fx.root.join("docs").exists());
    assert!(!fx.root.join("README.md").exists());
    assert!(!fx.root.join("retrokit.toml").exists());
    assert_eq!(read(&fx.root, "src/main.rs"), "fn main() {}\n");

    let runs = pipeline.runs().expect("runs");
    assert_eq!(runs[0].status, RunStatus::RolledBack);
    assert!(pipeline.clean_run(&run_id).expect("clean") > 0);
}

#[test]
fn concurrent_run_is_refused() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let holder = BackupManager::begin(&fx.layout, pipeline.validator(), fx.audit.clone(), "other")
        .expect("first run");

    let plan = pipeline
        .plan_steps(vec![scripted("a", "a.md", "a", VerifyOutcome::Passed)])
        .expect("plan");
    let err = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect_err("second run must be refused");
    assert!(matches!(err, RunError::ActiveRun { ref run_id, .. } if run_id == holder.run_id()));
    assert!(!fx.root.join("a.md").exists());

    holder.finish(RunStatus::Committed).expect("finish");
}

#[test]
fn cyclic_steps_never_reach_execution() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let err = pipeline
        .plan_steps(vec![
            scripted("a", "a.md", "a", VerifyOutcome::Passed).depends_on("b"),
            scripted("b", "b.md", "b", VerifyOutcome::Passed).depends_on("a"),
        ])
        .expect_err("cycle must fail");
    assert!(matches!(err, RunError::Plan(retrokit_planner::PlanError::Cycle { .. })));
    assert!(pipeline.runs().expect("runs").is_empty());
}

#[test]
fn readiness_score_is_monotonic_and_exact_at_the_top() {
    assert_eq!(readiness_score(&[]), 100.0);

    let total = 7;
    let mut previous = -1.0;
    for passed in 0..=total {
        let checks = (0..total)
            .map(|index| Check::new(format!("check-{index}"), index < passed, ""))
            .collect::<Vec<_>>();
        let score = readiness_score(&checks);
        assert!(score >= previous);
        assert_eq!(score == 100.0, passed == total);
        previous = score;
    }

    let nearly = (0..1000)
        .map(|index| Check::new(format!("check-{index}"), index > 0, ""))
        .collect::<Vec<_>>();
    assert_eq!(readiness_score(&nearly), 99.9);
}

#[test]
fn file_actions_verify_their_postconditions() {
    let fx = fixture();
    write(&fx.root, ".gitignore", "a\n");
    let validator = retrokit_security::PathValidator::new(
        [fx.root.as_path()],
        retrokit_security::ValidatorMode::Strict,
    )
    .expect("validator");
    let ctx = VerifyContext::new(&validator);

    let lines = FileAction::EnsureLines {
        path: ".gitignore".to_string(),
        lines: vec!["a".to_string(), "b".to_string()],
    };
    assert_eq!(
        lines.verify(&ctx).expect("verify"),
        VerifyOutcome::Failed(".gitignore is missing entries: b".to_string())
    );

    let dir = FileAction::CreateDir {
        path: "docs".to_string(),
    };
    assert!(matches!(dir.verify(&ctx).expect("verify"), VerifyOutcome::Failed(_)));
    fs::create_dir(fx.root.join("docs")).expect("mkdir");
    assert_eq!(dir.verify(&ctx).expect("verify"), VerifyOutcome::Passed);

    let removed = FileAction::RemoveFile {
        path: "gone.md".to_string(),
    };
    assert_eq!(removed.verify(&ctx).expect("verify"), VerifyOutcome::Passed);
    assert_eq!(
        FileAction::MoveFile {
            from: "a".to_string(),
            to: "b".to_string()
        }
        .targets(),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[test]
fn steps_cannot_write_into_the_backup_store() {
    let fx = fixture();
    let pipeline = pipeline(&fx, bare_standard());
    let store = fx.layout.project_backups_dir(&retrokit_store::project_key(&fx.root));
    fs::create_dir_all(&store).expect("must create backup store");
    let planted = store.join("planted.txt");

    let step = MigrationStep::new(
        "plant",
        "write into the backup store",
        FileAction::WriteFile {
            path: planted.to_string_lossy().into_owned(),
            content: "forged\n".to_string(),
            mode: WriteMode::CreateOnly,
        }
        .into_operation(),
    );
    let plan = pipeline.plan_steps(vec![step]).expect("plan must build");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run must complete");

    assert!(outcome.failed);
    let result = &outcome.results[0];
    assert_eq!(result.state, StepState::RolledBack);
    let error = result.error.as_deref().expect("step must carry its error");
    assert!(error.contains("reason=outside_whitelist"), "{error}");
    assert!(!planted.exists());
}

#[test]
fn rollback_of_a_cleaned_run_changes_nothing() {
    let fx = fixture();
    write(&fx.root, "a.txt", "orig\n");
    let pipeline = pipeline(&fx, bare_standard());

    let plan = pipeline
        .plan_steps(vec![
            scripted("a", "a.txt", "new\n", VerifyOutcome::Passed),
            scripted("b", "b.txt", "created\n", VerifyOutcome::Passed),
        ])
        .expect("plan must build");
    let outcome = pipeline
        .execute(&plan, ExecutionMode::Auto, &mut always)
        .expect("run must complete");
    assert!(!outcome.failed);
    let run_id = outcome.run_id.expect("auto runs record a run id");

    assert_eq!(pipeline.clean_run(&run_id).expect("must clean"), 1);
    let err = pipeline.rollback(&run_id).expect_err("cleaned run must not roll back");
    assert!(err.to_string().contains("reason=backups_cleaned"), "{err}");

    assert_eq!(read(&fx.root, "a.txt"), "new\n");
    assert_eq!(read(&fx.root, "b.txt"), "created\n");
    let runs = pipeline.runs().expect("must list runs");
    assert_eq!(runs[0].status, RunStatus::Committed);

    // The marker was released, so a new run can start.
    let holder = BackupManager::begin(&fx.layout, pipeline.validator(), fx.audit.clone(), "next")
        .expect("project must not stay locked");
    holder.finish(RunStatus::Committed).expect("finish");
}

#[test]
fn undecodable_ignore_file_does_not_abort_analysis() {
    let fx = fixture();
    write(&fx.root, "retrokit.toml", "standard_version = \"1.0.0\"\nproject_name = \"demo\"\n");
    fs::write(fx.root.join(".gitignore"), b"target/\n\xff\xfe\n*.orig\n").expect("must write");
    let standard = TargetStandard::from_toml_str(
        "version = \"1.0.0\"\n[ignore]\npath = \".gitignore\"\nentries = [\"*.orig\"]\n",
    )
    .expect("standard must parse");
    let pipeline = pipeline(&fx, standard);

    let scan = pipeline.analyze().expect("analysis must succeed");
    assert!(scan.ignore_entries.contains("target/"));
    assert!(scan.ignore_entries.contains("*.orig"));
    assert!(pipeline.assess(&scan).is_conformant());
}

use std::fs;
use std::io::Cursor;
use std::path::Path;

use clap::Parser;
use retrokit_engine::{Check, StepState, VerificationReport};
use retrokit_planner::estimate;

use super::*;
use crate::completion::write_completions;
use crate::flows::{
    build_plan, load_settings, load_standard, open_pipeline, resolve_state_root, retrofit,
    PlanView, PromptConfirm,
};
use crate::render::{
    format_plan_lines, format_report_lines, format_result_line, format_runs_lines,
    render_section_header, render_status_line, resolve_output_style, OutputStyle,
};
use retrokit_engine::{Confirm, Step};
use retrokit_store::StateLayout;

struct Workspace {
    _project: tempfile::TempDir,
    _state: tempfile::TempDir,
    global: GlobalArgs,
}

fn workspace() -> Workspace {
    let project = tempfile::tempdir().expect("must create temp project");
    let state = tempfile::tempdir().expect("must create temp state");
    let global = GlobalArgs {
        project: project.path().to_path_buf(),
        state_root: Some(state.path().to_path_buf()),
        settings: None,
        standard: None,
        json: false,
        verbose: false,
    };
    Workspace {
        _project: project,
        _state: state,
        global,
    }
}

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("must create parent");
    }
    fs::write(path, content).expect("must write fixture file");
}

fn always(_: &Step) -> bool {
    true
}

#[test]
fn cli_parses_run_with_mode_and_global_flags() {
    let cli = Cli::try_parse_from([
        "retrokit",
        "run",
        "--mode",
        "step-by-step",
        "--project",
        "/tmp/demo",
        "--json",
    ])
    .expect("must parse");
    assert!(cli.global.json);
    assert_eq!(cli.global.project, Path::new("/tmp/demo"));
    match cli.command {
        Commands::Run { mode, yes } => {
            assert_eq!(mode, Some(retrokit_core::ExecutionMode::StepByStep));
            assert!(!yes);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_rejects_unknown_mode() {
    let err = Cli::try_parse_from(["retrokit", "run", "--mode", "yolo"])
        .expect_err("unknown mode must be rejected");
    assert!(err.to_string().contains("yolo"));
}

#[test]
fn cli_parses_backups_clean() {
    let cli = Cli::try_parse_from(["retrokit", "backups", "clean", "20261015T120000.000001Z"])
        .expect("must parse");
    match cli.command {
        Commands::Backups(BackupsCommand::Clean { run_id }) => {
            assert_eq!(run_id, "20261015T120000.000001Z")
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn cli_definition_is_consistent() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}

#[test]
fn completions_name_the_binary() {
    let mut out = Vec::new();
    write_completions(clap_complete::Shell::Bash, &mut out).expect("must write completions");
    let script = String::from_utf8(out).expect("completion script must be utf-8");
    assert!(script.contains("retrokit"));
}

#[test]
fn explicit_state_root_wins() {
    let state = tempfile::tempdir().expect("must create temp state");
    let resolved = resolve_state_root(Some(state.path())).expect("must resolve");
    assert_eq!(resolved, state.path());
}

#[test]
fn missing_settings_file_yields_defaults() {
    let state = tempfile::tempdir().expect("must create temp state");
    let layout = StateLayout::new(state.path());
    let settings = load_settings(&layout, None).expect("must load");
    assert_eq!(settings, retrokit_core::Settings::default());
}

#[test]
fn invalid_settings_file_names_the_path() {
    let state = tempfile::tempdir().expect("must create temp state");
    let path = state.path().join("custom.toml");
    fs::write(&path, "scan_depth = 0\n").expect("must write settings");
    let layout = StateLayout::new(state.path());
    let err = load_settings(&layout, Some(&path)).expect_err("zero depth must fail");
    let rendered = format!("{err:#}");
    assert!(rendered.contains("custom.toml"), "{rendered}");
    assert!(rendered.contains("scan_depth"), "{rendered}");
}

#[test]
fn missing_standard_file_is_reported() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let path = dir.path().join("absent.toml");
    let err = load_standard(Some(&path)).expect_err("missing standard must fail");
    assert!(format!("{err:#}").contains("absent.toml"));
    assert!(load_standard(None).is_ok());
}

#[test]
fn dry_run_reports_plan_without_writing() {
    let ws = workspace();
    write(&ws.global.project, "ARCHITECTURE.md", "# Architecture\n");
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");

    let summary = retrofit(&pipeline, retrokit_core::ExecutionMode::DryRun, &mut always)
        .expect("dry run must succeed");
    assert!(summary.outcome.run_id.is_none());
    assert!(summary.report.is_none());
    assert!(!summary.outcome.results.is_empty());
    assert!(summary
        .outcome
        .results
        .iter()
        .all(|result| result.state == StepState::Pending));
    assert!(ws.global.project.join("ARCHITECTURE.md").exists());
    assert!(!ws.global.project.join("docs").exists());
}

#[test]
fn auto_run_reaches_full_readiness_and_lists_the_run() {
    let ws = workspace();
    write(&ws.global.project, "CONTRIBUTING.txt", "be kind\n");
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");

    let summary = retrofit(&pipeline, retrokit_core::ExecutionMode::Auto, &mut always)
        .expect("auto run must succeed");
    assert!(!summary.outcome.failed);
    let report = summary.report.expect("mutating runs are verified");
    assert_eq!(report.readiness_score, 100.0, "blockers: {:?}", report.blockers);
    assert_eq!(
        fs::read_to_string(ws.global.project.join("docs/CONTRIBUTING.md")).expect("must read"),
        "be kind\n"
    );

    let run_id = summary.outcome.run_id.expect("auto runs record a run id");
    let runs = pipeline.runs().expect("must list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, run_id);
    assert_eq!(runs[0].status, retrokit_store::RunStatus::Committed);

    let rollback = pipeline.rollback(&run_id).expect("must roll back");
    assert!(rollback.replayed > 0);
    assert!(ws.global.project.join("CONTRIBUTING.txt").exists());
    assert!(!ws.global.project.join("docs").exists());
}

#[test]
fn prompt_declining_halts_the_run() {
    let ws = workspace();
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");
    let mut prompts = Vec::new();
    let mut confirm = PromptConfirm::new(Cursor::new("y\nn\n"), &mut prompts);

    let summary = retrofit(&pipeline, retrokit_core::ExecutionMode::StepByStep, &mut confirm)
        .expect("step-by-step run must succeed");
    drop(confirm);

    assert!(summary.outcome.halted);
    assert!(!summary.outcome.failed);
    assert_ne!(summary.outcome.results[0].state, StepState::Pending);
    assert!(summary.outcome.results[1..]
        .iter()
        .all(|result| result.state == StepState::Pending));
    let transcript = String::from_utf8(prompts).expect("prompts must be utf-8");
    assert_eq!(transcript.matches("[y/N]").count(), 2);
}

#[test]
fn prompt_treats_end_of_input_as_no() {
    let ws = workspace();
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");
    let plan = build_plan(&pipeline).expect("must plan");
    let step = plan.steps().first().expect("builtin standard yields steps");

    let mut confirm = PromptConfirm::new(Cursor::new(""), Vec::new());
    assert!(!confirm.confirm(step));
    let mut confirm = PromptConfirm::new(Cursor::new("YES\n"), Vec::new());
    assert!(confirm.confirm(step));
}

#[test]
fn plan_view_and_lines_follow_plan_order() {
    let ws = workspace();
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");
    let plan = build_plan(&pipeline).expect("must plan");
    let summary = estimate(&plan);

    let view = PlanView::new(&plan, &summary);
    let ids = view.steps.iter().map(|step| step.id).collect::<Vec<_>>();
    assert_eq!(ids, plan.ids());

    let lines = format_plan_lines(&plan, &summary);
    assert_eq!(lines.len(), plan.len() + 1);
    assert!(lines[0].starts_with("  1. "));
    assert!(lines
        .last()
        .expect("summary line")
        .contains(&format!("{} effort point(s)", summary.total_effort_points)));

    let json = serde_json::to_value(&view).expect("plan view must serialize");
    assert_eq!(json["steps"].as_array().map(Vec::len), Some(plan.len()));
}

#[test]
fn resolve_output_style_uses_rich_when_stdout_is_tty() {
    assert_eq!(resolve_output_style(true, true), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
}

#[test]
fn resolve_output_style_uses_plain_when_stdout_is_not_tty() {
    assert_eq!(resolve_output_style(false, true), OutputStyle::Plain);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "docs: directory exists"),
        "docs: directory exists"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "docs: directory exists"),
        "[OK] docs: directory exists"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "fail", "README.md: missing"),
        "[FAIL] README.md: missing"
    );
}

#[test]
fn section_headers_only_in_rich_mode() {
    assert_eq!(render_section_header(OutputStyle::Plain, "plan"), None);
    let header = render_section_header(OutputStyle::Rich, "plan").expect("rich header");
    assert!(header.contains("== plan =="));
}

#[test]
fn report_lines_end_with_readiness() {
    let report = VerificationReport::from_checks(vec![
        Check::new("dir:docs", true, "directory exists"),
        Check::new("file:README.md", true, "file exists"),
        Check::new("file:CHANGELOG.md", false, "file is missing"),
    ]);
    let lines = format_report_lines(&report, OutputStyle::Plain);
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[2], "file:CHANGELOG.md: file is missing");
    assert_eq!(lines[3], "readiness 66.7% (2/3 checks passed)");
}

#[test]
fn result_line_marks_external_verification() {
    let ws = workspace();
    let (pipeline, _) = open_pipeline(&ws.global).expect("must open pipeline");
    let plan = build_plan(&pipeline).expect("must plan");
    let step = plan.steps().first().expect("builtin standard yields steps");

    let mut result = retrokit_engine::ExecutionResult::pending(step);
    assert!(format_result_line(&result, OutputStyle::Rich).starts_with("[SKIP]"));

    result.state = StepState::Applied;
    result.applied = true;
    result.external_verification = true;
    let line = format_result_line(&result, OutputStyle::Rich);
    assert_eq!(line, format!("[WARN] {}: applied, verify manually", step.id));
}

#[test]
fn runs_lines_handle_empty_history() {
    assert_eq!(
        format_runs_lines(&[]),
        vec!["no runs recorded for this project".to_string()]
    );
}

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use retrokit_core::{Effort, ExecutionMode, Impact, Settings, TargetStandard};
use retrokit_engine::{Confirm, Plan, RetrofitPipeline, RunOutcome, Step, VerificationReport};
use retrokit_planner::{estimate, PlanEstimate};
use retrokit_store::{default_state_root, AuditLog, StateLayout};
use serde::Serialize;
use tracing::{debug, info};

use crate::completion::write_completions;
use crate::render::{
    current_output_style, format_assessment_lines, format_outcome_lines, format_plan_lines,
    format_report_lines, format_runs_lines, format_scan_lines, print_lines, render_status_line,
    start_spinner, OutputStyle,
};
use crate::{BackupsCommand, Cli, Commands, GlobalArgs};

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = io::stdout().lock();
        return write_completions(shell, &mut stdout);
    }

    let global = cli.global;
    let (pipeline, settings) = open_pipeline(&global)?;
    let style = current_output_style();
    let json = global.json;

    match cli.command {
        Commands::Analyze => {
            let scan = pipeline.analyze()?;
            emit(json, &scan, || print_lines(style, "analysis", &format_scan_lines(&scan)))?;
        }
        Commands::Assess => {
            let scan = pipeline.analyze()?;
            let assessment = pipeline.assess(&scan);
            emit(json, &assessment, || {
                print_lines(style, "assessment", &format_assessment_lines(&assessment, style))
            })?;
        }
        Commands::Plan => {
            let plan = build_plan(&pipeline)?;
            let summary = estimate(&plan);
            emit(json, &PlanView::new(&plan, &summary), || {
                print_lines(style, "plan", &format_plan_lines(&plan, &summary))
            })?;
        }
        Commands::Run { mode, yes } => {
            let mode = mode.unwrap_or(settings.default_mode);
            let mut confirm: Box<dyn Confirm> = if yes {
                Box::new(|_: &Step| true)
            } else {
                Box::new(PromptConfirm::new(io::stdin().lock(), io::stderr()))
            };
            let spinner = match mode {
                ExecutionMode::Auto => start_spinner(style, "retrofitting"),
                _ => None,
            };
            let summary = retrofit(&pipeline, mode, confirm.as_mut());
            if let Some(spinner) = spinner {
                spinner.finish_and_clear();
            }
            let summary = summary?;

            emit(json, &summary, || {
                print_lines(style, "run", &format_outcome_lines(&summary.outcome, style));
                if let Some(report) = &summary.report {
                    print_lines(style, "verification", &format_report_lines(report, style));
                }
            })?;
            if summary.outcome.failed {
                bail!("retrofit run failed; see the step errors above");
            }
        }
        Commands::Verify => {
            let report = pipeline.verify(None)?;
            emit(json, &report, || {
                print_lines(style, "verification", &format_report_lines(&report, style))
            })?;
        }
        Commands::Rollback { run_id } => {
            let summary = pipeline
                .rollback(&run_id)
                .with_context(|| format!("failed to roll back run {run_id}"))?;
            emit(json, &summary, || {
                println!(
                    "{}",
                    render_status_line(
                        style,
                        "ok",
                        &format!(
                            "rolled back run {} ({} change(s) undone)",
                            summary.run_id, summary.replayed
                        ),
                    )
                )
            })?;
        }
        Commands::Backups(BackupsCommand::List) => {
            let runs = pipeline.runs()?;
            emit(json, &runs, || print_lines(style, "runs", &format_runs_lines(&runs)))?;
        }
        Commands::Backups(BackupsCommand::Clean { run_id }) => {
            let removed = pipeline
                .clean_run(&run_id)
                .with_context(|| format!("failed to clean backups of run {run_id}"))?;
            emit(json, &serde_json::json!({ "run_id": run_id, "removed": removed }), || {
                println!(
                    "{}",
                    render_status_line(
                        style,
                        "ok",
                        &format!("removed {removed} backup file(s) of run {run_id}")
                    )
                )
            })?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce()) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string_pretty(value).context("failed to serialize output as JSON")?;
        println!("{rendered}");
    } else {
        human();
    }
    Ok(())
}

/// `--state-root` wins over `RETROKIT_HOME`, which wins over the home-directory default.
pub(crate) fn resolve_state_root(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => default_state_root().context("failed to resolve retrokit state root"),
    }
}

pub(crate) fn load_settings(layout: &StateLayout, explicit: Option<&Path>) -> Result<Settings> {
    let path = explicit.map_or_else(|| layout.settings_path(), Path::to_path_buf);
    Settings::load(&path).with_context(|| format!("failed to load settings from {}", path.display()))
}

pub(crate) fn load_standard(explicit: Option<&Path>) -> Result<TargetStandard> {
    match explicit {
        Some(path) => TargetStandard::load(path)
            .with_context(|| format!("failed to load target standard {}", path.display())),
        None => TargetStandard::builtin().context("built-in target standard is invalid"),
    }
}

pub(crate) fn open_pipeline(global: &GlobalArgs) -> Result<(RetrofitPipeline, Settings)> {
    let layout = StateLayout::new(resolve_state_root(global.state_root.as_deref())?);
    layout
        .ensure_base_dirs()
        .with_context(|| format!("failed to prepare state root {}", layout.root().display()))?;
    let settings = load_settings(&layout, global.settings.as_deref())?;
    let standard = load_standard(global.standard.as_deref())?;
    let audit = Arc::new(AuditLog::open(
        layout.audit_log_path(),
        settings.audit_max_bytes,
        settings.audit_backup_count,
    ));
    debug!(state_root = %layout.root().display(), "state layout resolved");

    let pipeline = RetrofitPipeline::new(&global.project, layout, settings.clone(), standard, audit)
        .with_context(|| format!("failed to open project {}", global.project.display()))?;
    Ok((pipeline, settings))
}

pub(crate) fn build_plan(pipeline: &RetrofitPipeline) -> Result<Plan> {
    let scan = pipeline.analyze()?;
    let assessment = pipeline.assess(&scan);
    Ok(pipeline.plan(&assessment)?)
}

#[derive(Debug, Serialize)]
pub(crate) struct RetrofitSummary {
    pub(crate) outcome: RunOutcome,
    /// Absent for dry runs.
    pub(crate) report: Option<VerificationReport>,
}

/// Runs every stage in order against the pipeline's project.
pub(crate) fn retrofit(
    pipeline: &RetrofitPipeline,
    mode: ExecutionMode,
    confirm: &mut dyn Confirm,
) -> Result<RetrofitSummary> {
    let plan = build_plan(pipeline)?;
    info!(mode = mode.as_str(), steps = plan.len(), "retrofit plan ready");
    let outcome = pipeline.execute(&plan, mode, confirm)?;
    let report = if mode.mutates() {
        Some(pipeline.verify(Some(&outcome))?)
    } else {
        None
    };
    Ok(RetrofitSummary { outcome, report })
}

#[derive(Debug, Serialize)]
pub(crate) struct PlannedStep<'a> {
    pub(crate) id: &'a str,
    pub(crate) description: &'a str,
    pub(crate) dependencies: Vec<&'a str>,
    pub(crate) impact: Impact,
    pub(crate) effort: Effort,
}

#[derive(Debug, Serialize)]
pub(crate) struct PlanView<'a> {
    pub(crate) steps: Vec<PlannedStep<'a>>,
    pub(crate) estimate: &'a PlanEstimate,
}

impl<'a> PlanView<'a> {
    pub(crate) fn new(plan: &'a Plan, estimate: &'a PlanEstimate) -> Self {
        let steps = plan
            .steps()
            .iter()
            .map(|step| PlannedStep {
                id: &step.id,
                description: &step.description,
                dependencies: step.dependencies.iter().map(String::as_str).collect(),
                impact: step.impact,
                effort: step.effort,
            })
            .collect();
        Self { steps, estimate }
    }
}

/// Asks on `output` before each step; anything but `y`/`yes` declines, as does end of input.
pub(crate) struct PromptConfirm<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> PromptConfirm<R, W> {
    pub(crate) fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> Confirm for PromptConfirm<R, W> {
    fn confirm(&mut self, step: &Step) -> bool {
        let prompt = format!(
            "{}\napply step {} (impact={} effort={})? [y/N] ",
            render_status_line(OutputStyle::Rich, "step", &step.description),
            step.id,
            step.impact,
            step.effort
        );
        if self.output.write_all(prompt.as_bytes()).is_err() || self.output.flush().is_err() {
            return false;
        }

        let mut answer = String::new();
        match self.input.read_line(&mut answer) {
            Ok(0) | Err(_) => false,
            Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        }
    }
}

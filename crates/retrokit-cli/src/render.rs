use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use retrokit_engine::{
    Assessment, ConfigState, ExecutionResult, Plan, ProjectScan, RunOutcome, StepState,
    VerificationReport,
};
use retrokit_planner::PlanEstimate;
use retrokit_store::RunMetadata;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(std::io::stdout().is_terminal(), std::io::stderr().is_terminal())
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "fail" => "[FAIL]",
                "skip" => "[SKIP]",
                "step" => "[STEP]",
                _ => "[INFO]",
            };
            format!("{badge} {message}")
        }
    }
}

/// `None` in plain mode so piped output stays line-oriented.
pub(crate) fn render_section_header(style: OutputStyle, title: &str) -> Option<String> {
    match style {
        OutputStyle::Plain => None,
        OutputStyle::Rich => Some(colorize(section_style(), &format!("== {title} =="))),
    }
}

pub(crate) fn print_lines(style: OutputStyle, title: &str, lines: &[String]) {
    if let Some(header) = render_section_header(style, title) {
        println!();
        println!("{header}");
    }
    for line in lines {
        println!("{line}");
    }
}

pub(crate) fn format_scan_lines(scan: &ProjectScan) -> Vec<String> {
    let mut lines = vec![
        format!("project: {}", scan.project_name),
        format!("directories: {}", scan.directories.len()),
        format!("files: {}", scan.files.len()),
    ];
    if !scan.ecosystems.is_empty() {
        lines.push(format!(
            "ecosystems: {}",
            scan.ecosystems.iter().cloned().collect::<Vec<_>>().join(", ")
        ));
    }
    if !scan.symlinks.is_empty() {
        lines.push(format!("symlinks skipped: {}", scan.symlinks.len()));
    }
    lines.push(match &scan.config {
        ConfigState::Missing => "config: missing".to_string(),
        ConfigState::Invalid(reason) => format!("config: invalid ({reason})"),
        ConfigState::Loaded(config) => format!("config: standard {}", config.standard_version),
    });
    if scan.truncated {
        lines.push("scan stopped at the configured depth; deeper entries were not inspected".to_string());
    }
    lines
}

pub(crate) fn format_assessment_lines(assessment: &Assessment, style: OutputStyle) -> Vec<String> {
    if assessment.is_conformant() {
        return vec![render_status_line(
            style,
            "ok",
            &format!("project already conforms to standard {}", assessment.target_version),
        )];
    }

    let mut lines = assessment
        .gaps
        .iter()
        .map(|gap| {
            render_status_line(
                style,
                "warn",
                &format!(
                    "{} (impact={} effort={})",
                    gap.describe(),
                    gap.impact,
                    gap.effort
                ),
            )
        })
        .collect::<Vec<_>>();
    lines.push(format!(
        "{} gap(s) against standard {}",
        assessment.gaps.len(),
        assessment.target_version
    ));
    lines
}

pub(crate) fn format_plan_lines(plan: &Plan, estimate: &PlanEstimate) -> Vec<String> {
    let mut lines = plan
        .steps()
        .iter()
        .enumerate()
        .map(|(index, step)| {
            let mut line = format!(
                "{:>3}. {} [{}] impact={} effort={}",
                index + 1,
                step.description,
                step.id,
                step.impact,
                step.effort
            );
            if !step.dependencies.is_empty() {
                let deps = step.dependencies.iter().cloned().collect::<Vec<_>>();
                line.push_str(&format!(" after {}", deps.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>();
    let highest = estimate
        .highest_impact
        .map_or_else(|| "none".to_string(), |impact| impact.to_string());
    lines.push(format!(
        "{} step(s), {} effort point(s), highest impact {highest}",
        plan.len(),
        estimate.total_effort_points
    ));
    lines
}

pub(crate) fn format_result_line(result: &ExecutionResult, style: OutputStyle) -> String {
    let (status, label) = match result.state {
        StepState::Verified => ("ok", "verified"),
        StepState::Applied if result.external_verification => ("warn", "applied, verify manually"),
        StepState::Applied => ("ok", "applied"),
        StepState::Pending => ("skip", "not run"),
        StepState::Failed => ("fail", "failed"),
        StepState::RolledBack => ("fail", "rolled back"),
    };
    let mut message = format!("{}: {label}", result.step_id);
    if let Some(error) = &result.error {
        message.push_str(&format!(" ({error})"));
    }
    render_status_line(style, status, &message)
}

pub(crate) fn format_outcome_lines(outcome: &RunOutcome, style: OutputStyle) -> Vec<String> {
    let mut lines = outcome
        .results
        .iter()
        .map(|result| format_result_line(result, style))
        .collect::<Vec<_>>();

    let summary = match (&outcome.run_id, outcome.failed, outcome.halted) {
        (None, _, _) => render_status_line(
            style,
            "info",
            &format!("dry run: {} step(s) would be applied", outcome.results.len()),
        ),
        (Some(run_id), true, _) => render_status_line(
            style,
            "fail",
            &format!("run {run_id} failed; applied changes were rolled back"),
        ),
        (Some(run_id), false, true) => render_status_line(
            style,
            "warn",
            &format!("run {run_id} halted; undo it with `retrokit rollback {run_id}`"),
        ),
        (Some(run_id), false, false) => render_status_line(
            style,
            "ok",
            &format!("run {run_id} committed; undo it with `retrokit rollback {run_id}`"),
        ),
    };
    lines.push(summary);
    lines
}

pub(crate) fn format_report_lines(report: &VerificationReport, style: OutputStyle) -> Vec<String> {
    let mut lines = report
        .checks
        .iter()
        .map(|check| {
            let status = if check.passed { "ok" } else { "fail" };
            render_status_line(style, status, &format!("{}: {}", check.name, check.detail))
        })
        .collect::<Vec<_>>();
    for step in &report.external_verification {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("{step}: needs external verification"),
        ));
    }

    let score = format!(
        "readiness {:.1}% ({}/{} checks passed)",
        report.readiness_score,
        report.passed(),
        report.checks.len()
    );
    lines.push(match style {
        OutputStyle::Plain => score,
        OutputStyle::Rich => colorize(score_style(report.is_ready()), &score),
    });
    lines
}

pub(crate) fn format_runs_lines(runs: &[RunMetadata]) -> Vec<String> {
    if runs.is_empty() {
        return vec!["no runs recorded for this project".to_string()];
    }
    runs.iter()
        .map(|run| {
            format!(
                "{} {} {} {}",
                run.run_id,
                run.status.as_str(),
                run.operation,
                run.started_at
            )
        })
        .collect()
}

/// Spinner on stderr while a mutating run is in flight; absent in plain mode.
pub(crate) fn start_spinner(style: OutputStyle, label: &str) -> Option<ProgressBar> {
    if style != OutputStyle::Rich {
        return None;
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed}") {
        spinner.set_style(template.tick_chars("-\\|/ "));
    }
    spinner.set_message(colorize(progress_label_style(), label));
    spinner.enable_steady_tick(Duration::from_millis(80));
    Some(spinner)
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn score_style(ready: bool) -> Style {
    let color = if ready {
        AnsiColor::BrightGreen
    } else {
        AnsiColor::BrightYellow
    };
    Style::new().fg_color(Some(color.into())).effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

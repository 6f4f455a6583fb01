use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use retrokit_core::ExecutionMode;

mod completion;
mod flows;
mod logging;
mod render;

#[derive(Parser, Debug)]
#[command(name = "retrokit")]
#[command(version, about = "Retrofit existing projects onto a target layout, safely", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    /// Project to operate on.
    #[arg(long, short = 'C', global = true, default_value = ".")]
    project: PathBuf,
    /// Where backups, logs and settings live. Defaults to $RETROKIT_HOME, then ~/.retrokit.
    #[arg(long, global = true)]
    state_root: Option<PathBuf>,
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    /// Target standard TOML; the built-in standard is used otherwise.
    #[arg(long, global = true)]
    standard: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Describe the project tree without changing it.
    Analyze,
    /// List the gaps between the project and the target standard.
    Assess,
    /// Show the ordered migration plan.
    Plan,
    /// Apply the plan.
    Run {
        /// dry-run, step-by-step or auto. Defaults to the settings file.
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Answer yes to every step-by-step prompt.
        #[arg(long)]
        yes: bool,
    },
    /// Score the project against the target standard.
    Verify,
    /// Restore everything a recorded run changed.
    Rollback { run_id: String },
    #[command(subcommand)]
    Backups(BackupsCommand),
    Completions { shell: Shell },
}

#[derive(Subcommand, Debug)]
enum BackupsCommand {
    List,
    /// Delete the backup copies of a finished run.
    Clean { run_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.global.verbose);
    flows::run_cli(cli)
}

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use provisio_installer::ApplicationContext;
use tracing_subscriber::EnvFilter;

mod commands;
mod completion;
mod render;

use commands::{run_apply, run_history, run_rollback, run_status, run_uninstall};
use completion::write_completions_script;

#[derive(Parser, Debug)]
#[command(name = "provisio")]
#[command(about = "Transactional, content-addressed environment provisioning", long_about = None)]
struct Cli {
    /// Environment home holding provisioned content and `.provisio/` state
    #[arg(long, global = true, env = "PROVISIO_HOME")]
    home: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply an environment instruction document
    Apply {
        document: PathBuf,
        /// Expanded package tree: `<source>/<unit>/home/...`
        #[arg(long)]
        source: PathBuf,
    },
    /// Undo the newest environment record
    Rollback,
    /// Remove every file a unit owns
    Uninstall { unit: String },
    /// List environment records, newest first
    History,
    /// Show installed units, or one unit in detail
    Status { unit: Option<String> },
    /// Print a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum CliCompletionShell {
    Bash,
    Zsh,
    Fish,
    Powershell,
}

impl From<CliCompletionShell> for Shell {
    fn from(value: CliCompletionShell) -> Self {
        match value {
            CliCompletionShell::Bash => Shell::Bash,
            CliCompletionShell::Zsh => Shell::Zsh,
            CliCompletionShell::Fish => Shell::Fish,
            CliCompletionShell::Powershell => Shell::PowerShell,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = cli.command {
        let mut stdout = std::io::stdout();
        return write_completions_script(shell, &mut stdout);
    }

    let home = resolve_home(cli.home)?;
    let mut context = ApplicationContext::open(&home)
        .with_context(|| format!("failed to open environment at {}", home.display()))?;

    match cli.command {
        Commands::Apply { document, source } => run_apply(&mut context, &document, &source),
        Commands::Rollback => run_rollback(&mut context),
        Commands::Uninstall { unit } => run_uninstall(&mut context, &unit),
        Commands::History => run_history(&context),
        Commands::Status { unit } => run_status(&context, unit.as_deref()),
        Commands::Completions { .. } => Ok(()),
    }
}

fn resolve_home(home: Option<PathBuf>) -> Result<PathBuf> {
    match home {
        Some(home) => Ok(home),
        None => std::env::current_dir().context("failed to resolve current directory"),
    }
}

#[cfg(test)]
mod tests;

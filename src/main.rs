//! taskloom - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskloom::plan::Plan;
use taskloom::util::config::{self, LoomConfig};
use taskloom::util::logger::{self, LogLevel};
use taskloom::{Loom, TaskState, NAME, VERSION};

/// Run command plans on a dependency-aware task scheduler
#[derive(Parser, Debug)]
#[command(name = "taskloom")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.config/taskloom/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Maximum concurrently running tasks
    #[arg(long, value_name = "N", global = true)]
    max_threads: Option<usize>,

    /// Enable verbose output (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every task of a plan file
    Run {
        /// Plan file
        #[arg(value_name = "PLAN")]
        plan: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

/// Resolve configuration: CLI flags, then environment, then file, then defaults.
fn effective_config(args: &Args) -> Result<LoomConfig> {
    let loaded = match &args.config {
        Some(path) => config::load_config_file(path),
        None => config::load_user_config(),
    };
    let mut config = loaded.context("Failed to load configuration")?.apply_env();
    if let Some(max_threads) = args.max_threads {
        config.max_threads = max_threads;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_from_env(match args.verbose {
        0 => LogLevel::Warn,
        n => LogLevel::from_verbosity(n),
    });

    let config = effective_config(&args)?;
    tracing::debug!(?config, "effective configuration");

    match &args.command {
        Commands::Run { plan } => {
            let plan = Plan::load(plan)
                .with_context(|| format!("Failed to load plan: {}", plan.display()))?;
            let mut loom = Loom::with_config(config).context("Failed to start worker pool")?;
            let report = plan.run(&mut loom)?;

            for outcome in &report.outcomes {
                println!("{}", outcome);
            }
            if args.verbose > 0 {
                eprintln!("{:?}", report.stats);
            }
            if !report.succeeded() {
                let unfinished = report
                    .outcomes
                    .iter()
                    .filter(|o| o.state != TaskState::Completed)
                    .count();
                anyhow::bail!(
                    "{} of {} tasks did not complete",
                    unfinished,
                    report.outcomes.len()
                );
            }
        },
        Commands::Config => {
            print!("{}", config::render_config(&config)?);
        },
    }

    Ok(())
}

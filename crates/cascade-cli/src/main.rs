//! Cascade CLI - run demo universes of the cascade reactive engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cascade_engine::{Scheduler, TokioScheduler};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;

mod config;
mod demo;

use config::Config;
use demo::Scenario;

/// Cascade CLI - drive a universe of observers to a fixed point.
#[derive(Parser, Debug)]
#[command(
    name = "cascade",
    author,
    version,
    about = "Cascade: run demo universes of the reactive engine",
    long_about = None
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Config file to use instead of the one in the platform config dir.
    #[arg(short, long, global = true, env = "CASCADE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a demo universe, drive a few actions and report the final state.
    Run {
        #[arg(short, long, value_enum, default_value = "chain")]
        scenario: Scenario,

        /// Print the final state as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration.
    Config {
        /// Only print the config file location.
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .init();

    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { scenario, json } => {
            let scheduler: Arc<dyn Scheduler> =
                Arc::new(TokioScheduler::new(&tokio::runtime::Handle::current()));
            let size = config.size;
            let engine = config.engine.clone();
            // The universe API blocks; keep it off the async workers.
            let outcome = tokio::task::spawn_blocking(move || demo::run(scenario, size, &engine, scheduler))
                .await
                .context("scenario task panicked")??;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.json)?);
            } else {
                println!(
                    "{scenario:?}: settled after {} actions, {} objects",
                    outcome.actions, outcome.objects
                );
            }
        }
        Commands::Config { path } => {
            if path {
                match Config::config_file_path() {
                    Some(p) => println!("{}", p.display()),
                    None => println!("(no config directory on this platform)"),
                }
            } else {
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

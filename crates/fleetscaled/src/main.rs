//! fleetscaled — metrics-driven fleet autoscaler daemon.
//!
//! Continuously monitors external metrics and reconciles the number of
//! created/started machines of one or more apps toward the configured
//! bound expressions.
//!
//! # Usage
//!
//! ```text
//! fleetscaled serve --config fleetscale.toml
//! fleetscaled eval  --config fleetscale.toml
//! ```

mod config;
mod eval;
mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "fleetscaled", about = "Metrics-driven fleet autoscaler", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscaler server process.
    Serve {
        /// Path to the TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Collect metrics once and print the evaluated machine counts.
    Eval {
        /// Path to the TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => {
            let config = Config::load(config.as_deref())?;
            init_tracing(config.verbose);
            serve::run(config).await
        }
        Command::Eval { config } => {
            let config = Config::load(config.as_deref())?;
            init_tracing(config.verbose);
            eval::run(config).await
        }
        Command::Version => {
            println!("fleetscaled {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.parse().expect("valid default filter")),
        )
        .init();
}

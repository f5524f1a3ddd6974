//! stringhub — detector string hub core.
//!
//! Merges many per-module streams into one globally time-ordered output per
//! stream kind while RAPCal keeps module clocks mapped onto detector UTC.
//! Run `stringhub --help` for usage.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod replay;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    // Load config (except for `init` which doesn't need it)
    let config = match &cli.command {
        Commands::Init => None,
        _ => Some(config::HubConfig::load(&cli.config)?),
    };

    match cli.command {
        Commands::Init => {
            let example = config::HubConfig::default_example();
            print!("{}", toml::to_string_pretty(&example)?);
        }
        Commands::Replay { output } => {
            replay::run(config.as_ref().unwrap(), output)?;
        }
    }

    Ok(())
}

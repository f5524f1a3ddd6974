//! CLI definitions for stringhub.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "stringhub",
    version,
    about = "Detector string hub core\n\nMerge per-module hit, monitoring, supernova and time-calibration streams into globally time-ordered outputs while RAPCal keeps module clocks mapped onto UTC.",
    long_about = None
)]
pub struct Cli {
    /// Path to hub.toml config file
    #[clap(long, short, default_value = "hub.toml")]
    pub config: PathBuf,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive the full dispatch layer with synthetic module streams and
    /// report per-engine statistics
    Replay {
        /// Write JSON report to this file (default: stdout)
        #[clap(long)]
        output: Option<PathBuf>,
    },

    /// Print an example hub.toml to stdout
    Init,
}

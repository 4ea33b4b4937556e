//! Command-line arguments of `meshd`.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Network service manager control plane.
#[derive(Parser, Debug)]
#[command(name = "meshd", version, disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// JSON configuration file; environment overrides apply on top.
    #[arg(long, global = true, value_name = "FILE")]
    pub(crate) config: Option<PathBuf>,
    /// Deadline of each scenario step, in seconds.
    #[arg(long, global = true, default_value_t = 60)]
    pub(crate) step_timeout_secs: u64,
    #[command(subcommand)]
    pub(crate) command: Command,
}

impl Cli {
    pub(crate) fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Prints the effective configuration as JSON.
    Config,
    /// Runs a scenario against in-process managers.
    Run {
        /// Scenario file (JSON).
        #[arg(long, value_name = "FILE")]
        scenario: PathBuf,
    },
}

//! `meshd`: network service manager composition root.
//!
//! Responsibilities:
//!
//! 1. **Load configuration**: an optional JSON file, then environment
//!    overrides, then validation.
//! 2. **Wire observability**: see [`telemetry`].
//! 3. **Run**: `config` prints the effective configuration; `run` assembles
//!    in-process managers from a scenario file and executes its steps.

mod args;
mod scenario;
mod telemetry;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use mesh::MeshConfig;

use crate::args::{Cli, Command};
use crate::scenario::{Scenario, ScenarioMesh};

fn load_config(path: Option<&Path>) -> anyhow::Result<MeshConfig> {
    let mut config = match path {
        Some(path) => {
            let document = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            MeshConfig::from_json(&document)?
        }
        None => MeshConfig::default(),
    };
    config.apply_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

async fn run_scenario(path: &Path, config: &MeshConfig, cli: &Cli) -> anyhow::Result<bool> {
    let document =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let scenario: Scenario = serde_json::from_str(&document)
        .with_context(|| format!("parsing scenario {}", path.display()))?;
    tracing::info!(
        managers = scenario.managers.len(),
        endpoints = scenario.endpoints.len(),
        steps = scenario.steps.len(),
        "starting scenario"
    );

    let mesh = ScenarioMesh::build(&scenario, config)?;
    let reports = mesh.run(&scenario.steps, cli.step_timeout()).await;
    let mut all_ok = true;
    for report in &reports {
        all_ok &= report.ok;
        println!("{}", serde_json::to_string(report)?);
    }
    Ok(all_ok)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    match &cli.command {
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { scenario } => {
            let all_ok = run_scenario(scenario, &config, &cli).await?;
            Ok(if all_ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let telemetry = telemetry::init()?;
    let result = run(cli).await;
    if let Err(e) = &result {
        tracing::error!(error = %format!("{e:#}"), "meshd failed");
    }
    telemetry.shutdown();
    result
}

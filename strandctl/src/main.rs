//! `strandctl`: exercise the Strand orchestration core from the command line.

mod demo;
mod show;

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use strand_config::ConfigLoader;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::demo::Scenario;

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "strandctl", version)]
#[command(
    about = "Run cache-then-network scenarios and inspect configuration"
)]
struct Cli {
    /// Configuration file (TOML or JSON). Falls back to $STRAND_CONFIG_PATH
    /// and the default locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scenario against simulated local and remote sources
    Demo(DemoArgs),
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone)]
struct DemoArgs {
    #[arg(value_enum)]
    scenario: Scenario,

    /// Print the recorded state history as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Simulated remote latency, e.g. `50ms` or `1s`
    #[arg(
        long,
        default_value = "50ms",
        value_parser = humantime::parse_duration
    )]
    latency: Duration,
}

/// Inspect the effective configuration
#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the configuration after files, .env and overrides are applied
    Show {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,strand::executor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    let load = loader.load().context("failed to load configuration")?;

    match cli.command {
        Command::Demo(args) => {
            let report = demo::run(args.scenario, args.latency, &load.config)
                .await
                .with_context(|| {
                    format!("scenario '{}' failed", args.scenario)
                })?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
        Command::Config(ConfigCommand::Show { json }) => {
            println!("{}", show::render(&load, json)?);
        }
    }

    Ok(())
}

//! spotwardend — the spotwarden daemon.
//!
//! Assembles the spotwarden subsystems in one process:
//! - State store (redb)
//! - Simulated provider, oracle and workload agent (from a world file)
//! - Decision cycles per protected workload
//! - Interruption signal routing and replica failover
//! - Operator REST API
//!
//! # Usage
//!
//! ```text
//! spotwardend run --config spotwarden.toml --world world.json
//! spotwardend evaluate --config spotwarden.toml --input frozen.json
//! spotwardend check-config --config spotwarden.toml
//! ```

mod daemon;
mod evaluate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use spotwarden_core::SpotwardenConfig;

#[derive(Parser)]
#[command(name = "spotwardend", about = "Spot instance cost optimizer and interruption defense")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane and the API server until Ctrl-C.
    Run {
        /// Path to spotwarden.toml.
        #[arg(long)]
        config: PathBuf,

        /// Simulated provider world (JSON).
        #[arg(long)]
        world: PathBuf,

        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Evaluate frozen inputs once and print the decision as JSON.
    Evaluate {
        #[arg(long)]
        config: PathBuf,

        /// Decision input (JSON) with optional forecasts.
        #[arg(long)]
        input: PathBuf,
    },
    /// Parse and validate a config file.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,spotwarden=debug,spotwardend=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            world,
            log_format,
        } => {
            init_tracing(log_format);
            daemon::run(&config, &world).await
        }
        Command::Evaluate { config, input } => {
            init_tracing(LogFormat::Text);
            let config = SpotwardenConfig::from_file(&config)?;
            let input = evaluate::EvaluateInput::from_json_file(&input)?;
            let decision = evaluate::evaluate(&config.engine, &input);
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::CheckConfig { config } => {
            init_tracing(LogFormat::Text);
            let parsed = SpotwardenConfig::from_file(&config)?;
            info!(
                path = %config.display(),
                workloads = parsed.daemon.workloads.len(),
                dry_run = parsed.engine.dry_run_mode,
                "config ok"
            );
            println!("config ok");
            Ok(())
        }
    }
}

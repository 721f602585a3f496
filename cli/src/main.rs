// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # autocoder Orchestrator CLI
//!
//! The `autocoder` binary hosts the sub-agent orchestrator: the container
//! lifecycle manager, the agent message bus and the task coordinator.
//!
//! ## Commands
//!
//! - `autocoder run [--task FILE]...` - Run the orchestrator in the foreground
//! - `autocoder config show|validate|generate` - Configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use autocoder_core::domain::node_config::NodeConfigManifest;
use autocoder_orchestrator::commands::{self, ConfigCommand};
use autocoder_orchestrator::daemon;

/// autocoder - sandboxed sub-agent orchestration
#[derive(Parser)]
#[command(name = "autocoder")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "AUTOCODER_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, env = "AUTOCODER_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator until Ctrl+C or SIGTERM
    #[command(name = "run")]
    Run {
        /// Task request files (YAML or JSON) to enqueue at startup
        #[arg(long = "task", value_name = "FILE")]
        tasks: Vec<PathBuf>,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { tasks }) => {
            let config = NodeConfigManifest::load_or_default(cli.config).context("Failed to load configuration")?;
            let logging = config
                .spec
                .observability
                .as_ref()
                .and_then(|o| o.logging.clone())
                .unwrap_or_default();
            let level = cli.log_level.unwrap_or(logging.level);
            init_logging(&level, &logging.format)?;
            daemon::run_orchestrator(config, tasks).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "text")?;
            commands::config::handle_command(command, cli.config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }

    Ok(())
}

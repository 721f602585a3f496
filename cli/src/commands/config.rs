// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use autocoder_core::domain::agent::AgentRole;
use autocoder_core::domain::node_config::NodeConfigManifest;

const MINIMAL_TEMPLATE: &str = include_str!("../../templates/config-minimal.yaml");
const EXAMPLES_TEMPLATE: &str = include_str!("../../templates/config-with-examples.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./autocoder-config.yaml)
        #[arg(short, long, default_value = "./autocoder-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. AUTOCODER_CONFIG_PATH: {}",
            std::env::var("AUTOCODER_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./autocoder-config.yaml");
        println!("  4. ~/.autocoder/config.yaml");
        println!("  5. /etc/autocoder/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    println!("{}", "Backend:".bold());
    println!("  Kind: {:?}", spec.backend.kind);
    println!("  Network: {}", spec.backend.network);
    println!("  Build context: {}", spec.backend.build_context.display());
    for role in AgentRole::SUB_AGENT_ROLES {
        if let Some(image) = spec.backend.images.for_role(role) {
            println!("    {} -> {} ({})", role.to_string().bold(), image.image, image.dockerfile);
        }
    }
    println!();

    println!("{}", "Lifecycle:".bold());
    println!("  Port base: {}", spec.lifecycle.port_base);
    println!("  Health check interval: {}s", spec.lifecycle.health_check_interval_secs);
    println!("  Readiness timeout: {}s", spec.lifecycle.readiness_timeout_secs);
    println!("  Graceful stop timeout: {}s", spec.lifecycle.graceful_stop_timeout_secs);
    println!("  Default task timeout: {}s", spec.lifecycle.default_task_timeout_secs);
    println!();

    println!("{}", "Agent bus:".bold());
    println!("  Listen: {}", spec.bus.bind_addr());
    if let Some(url) = &spec.bus.advertised_url {
        println!("  Advertised URL: {}", url);
    }
    println!(
        "  Liveness: ping every {}s, evict after {}s",
        spec.bus.liveness_interval_secs, spec.bus.ping_timeout_secs
    );
    println!("  Offline queue capacity: {}", spec.bus.offline_queue_capacity);
    println!(
        "  Signature verification: {}",
        if spec.bus.public_key.is_some() {
            "ed25519".green()
        } else {
            "length heuristic".yellow()
        }
    );
    println!();

    println!("{}", "Coordinator:".bold());
    println!("  Dispatch interval: {}s", spec.coordinator.dispatch_interval_secs);
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples { EXAMPLES_TEMPLATE } else { MINIMAL_TEMPLATE };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autocoder_core::domain::node_config::BackendKind;

    #[test]
    fn test_templates_parse_and_validate() {
        for template in [MINIMAL_TEMPLATE, EXAMPLES_TEMPLATE] {
            let manifest = NodeConfigManifest::from_yaml_str(template).unwrap();
            manifest.validate().unwrap();
            assert_eq!(manifest.spec.backend.kind, BackendKind::Docker);
            assert_eq!(manifest.spec.bus.port, 8080);
        }
    }

    #[tokio::test]
    async fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("autocoder-config.yaml");

        generate(output.clone(), true).await.unwrap();
        validate(Some(output.clone())).await.unwrap();

        let manifest = NodeConfigManifest::from_yaml_file(&output).unwrap();
        assert!(manifest.spec.bus.public_key.is_none());
        assert_eq!(manifest.spec.lifecycle.default_task_timeout_secs, 3600);
    }
}

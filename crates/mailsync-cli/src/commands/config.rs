//! Config command - View and validate mailsync configuration
//!
//! Provides the `mailsync config` CLI command which:
//! 1. Shows the effective configuration (YAML or JSON)
//! 2. Validates the configuration file and reports errors
//! 3. Prints the configuration file location

use std::path::Path;

use anyhow::{Context, Result};
use clap::Subcommand;
use mailsync_core::config::Config;
use tracing::info;

use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration
    Show,
    /// Validate the configuration file
    Validate,
    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => execute_show(config_path, format),
            ConfigCommand::Validate => execute_validate(config_path, format),
            ConfigCommand::Path => execute_path(config_path, format),
        }
    }
}

fn execute_show(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);
    let config = Config::load_or_default(config_path);

    info!(config_path = %config_path.display(), "Showing configuration");

    if format == OutputFormat::Json {
        let json =
            serde_json::to_value(&config).context("Failed to serialize configuration to JSON")?;
        formatter.print_json(&json);
        return Ok(());
    }

    let source = if config_path.exists() {
        config_path.display().to_string()
    } else {
        "defaults".to_string()
    };
    formatter.success(&format!("Configuration ({source})"));
    formatter.info("");
    let yaml =
        serde_yaml::to_string(&config).context("Failed to serialize configuration to YAML")?;
    for line in yaml.lines() {
        formatter.info(line);
    }
    Ok(())
}

fn execute_validate(config_path: &Path, format: OutputFormat) -> Result<()> {
    let formatter = get_formatter(format);

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            let message = if config_path.exists() {
                format!("Failed to parse configuration: {e}")
            } else {
                "Configuration file not found. Using defaults.".to_string()
            };
            if format == OutputFormat::Json {
                formatter.print_json(&serde_json::json!({
                    "valid": false,
                    "config_path": config_path.display().to_string(),
                    "errors": [message],
                }));
            } else {
                formatter.error(&message);
                formatter.info(&format!("File: {}", config_path.display()));
            }
            return Ok(());
        }
    };

    info!(config_path = %config_path.display(), "Validating configuration");
    let errors = config.validate();

    if format == OutputFormat::Json {
        let error_strings: Vec<String> = errors.iter().map(ToString::to_string).collect();
        formatter.print_json(&serde_json::json!({
            "valid": errors.is_empty(),
            "config_path": config_path.display().to_string(),
            "errors": error_strings,
        }));
    } else if errors.is_empty() {
        formatter.success("Configuration is valid");
        formatter.info(&format!("File: {}", config_path.display()));
    } else {
        formatter.error(&format!(
            "Configuration has {} error{}:",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        ));
        formatter.info(&format!("File: {}", config_path.display()));
        formatter.info("");
        for error in &errors {
            formatter.info(&format!("  {} - {}", error.field, error.message));
        }
    }
    Ok(())
}

fn execute_path(config_path: &Path, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        get_formatter(format).print_json(&serde_json::json!({
            "config_path": config_path.display().to_string(),
            "exists": config_path.exists(),
        }));
    } else {
        println!("{}", config_path.display());
    }
    Ok(())
}

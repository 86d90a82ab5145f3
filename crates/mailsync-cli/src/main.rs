//! mailsync CLI - Inspect the state persisted by the sync scheduler
//!
//! Provides commands for:
//! - Viewing and validating configuration
//! - Listing accounts known to the local store
//! - Showing folder backfill progress
//! - Listing outbox entries, including failed ones

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{
    accounts::AccountsCommand, config::ConfigCommand, folders::FoldersCommand,
    outbox::OutboxCommand,
};
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(name = "mailsync", version, about = "Inspect local mail sync state")]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// View and validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// List accounts present in the local store
    Accounts(AccountsCommand),
    /// Show folder sync progress of an account
    Folders(FoldersCommand),
    /// List queued uploads of an account
    Outbox(OutboxCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Human
    };
    let config_path = cli
        .config
        .unwrap_or_else(mailsync_core::config::Config::default_path);

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&config_path, format).await,
        Commands::Accounts(cmd) => cmd.execute(&config_path, format).await,
        Commands::Folders(cmd) => cmd.execute(&config_path, format).await,
        Commands::Outbox(cmd) => cmd.execute(&config_path, format).await,
    }
}

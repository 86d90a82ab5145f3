//! Accounts command - List accounts present in the local store

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;

use super::open_store;
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct AccountsCommand {}

impl AccountsCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let Some(store) = open_store(config_path).await? else {
            formatter.error("No database found. Nothing has been synced yet.");
            return Ok(());
        };

        let accounts = store
            .known_accounts()
            .await
            .context("Failed to list accounts")?;

        if format == OutputFormat::Json {
            let ids: Vec<String> = accounts.iter().map(ToString::to_string).collect();
            formatter.print_json(&serde_json::json!({ "accounts": ids }));
        } else if accounts.is_empty() {
            formatter.info("No accounts in the local store");
        } else {
            formatter.success(&format!("{} account(s)", accounts.len()));
            for account in &accounts {
                formatter.info(&account.to_string());
            }
        }
        Ok(())
    }
}

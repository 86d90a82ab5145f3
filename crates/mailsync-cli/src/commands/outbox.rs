//! Outbox command - List queued uploads of an account

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use mailsync_core::{
    domain::{newtypes::AccountId, PendingAction},
    ports::ISyncStore,
};

use super::open_store;
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct OutboxCommand {
    /// Account to inspect
    #[arg(long)]
    pub account: AccountId,

    /// Only show entries that exhausted their upload attempts
    #[arg(long)]
    pub failed: bool,
}

impl OutboxCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let Some(store) = open_store(config_path).await? else {
            formatter.error("No database found. Nothing has been synced yet.");
            return Ok(());
        };

        let actions: Vec<PendingAction> = store
            .pending_actions(&self.account)
            .await
            .context("Failed to load outbox")?
            .into_iter()
            .filter(|a| !self.failed || a.failed)
            .collect();

        if format == OutputFormat::Json {
            let value = serde_json::to_value(&actions).context("Failed to serialize outbox")?;
            formatter.print_json(&serde_json::json!({
                "account": self.account.to_string(),
                "entries": value,
            }));
            return Ok(());
        }

        if actions.is_empty() {
            formatter.info(if self.failed {
                "No failed outbox entries"
            } else {
                "Outbox is empty"
            });
            return Ok(());
        }

        formatter.success(&format!("{} outbox entr{}", actions.len(), if actions.len() == 1 { "y" } else { "ies" }));
        for action in &actions {
            formatter.info(&describe(action));
        }
        Ok(())
    }
}

fn describe(action: &PendingAction) -> String {
    let mut line = format!(
        "{} {:<12} {:<24} attempts={}",
        action.created_at.format("%Y-%m-%d %H:%M:%S"),
        action.kind.name(),
        action.target_id,
        action.attempt_count
    );
    if action.failed {
        line.push_str(" FAILED");
    }
    if let Some(error) = &action.last_error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

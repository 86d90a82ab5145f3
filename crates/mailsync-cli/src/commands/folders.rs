//! Folders command - Show folder backfill progress
//!
//! For every folder of the account prints its role and where its header
//! backfill stands: not started, in progress (a cursor is pending) or
//! complete, with the time of the last full pass.

use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use clap::Args;
use mailsync_core::{
    domain::{newtypes::AccountId, Folder, FolderSyncState},
    ports::ISyncStore,
};

use super::open_store;
use crate::output::{get_formatter, OutputFormat};

#[derive(Debug, Args)]
pub struct FoldersCommand {
    /// Account to inspect
    #[arg(long)]
    pub account: AccountId,
}

/// Backfill progress of one folder
fn progress(state: Option<&FolderSyncState>) -> &'static str {
    match state {
        None => "not_started",
        Some(s) if s.is_backfill_complete() => "complete",
        Some(_) => "in_progress",
    }
}

impl FoldersCommand {
    pub async fn execute(&self, config_path: &Path, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);

        let Some(store) = open_store(config_path).await? else {
            formatter.error("No database found. Nothing has been synced yet.");
            return Ok(());
        };

        let folders = store
            .folders(&self.account)
            .await
            .context("Failed to load folders")?;
        let states: HashMap<_, _> = store
            .folder_states(&self.account)
            .await
            .context("Failed to load folder sync states")?
            .into_iter()
            .map(|s| (s.folder_id.clone(), s))
            .collect();

        if format == OutputFormat::Json {
            let rows: Vec<_> = folders
                .iter()
                .map(|f| folder_json(f, states.get(&f.id)))
                .collect();
            formatter.print_json(&serde_json::json!({
                "account": self.account.to_string(),
                "folders": rows,
            }));
            return Ok(());
        }

        if folders.is_empty() {
            formatter.info(&format!("No folders stored for account {}", self.account));
            return Ok(());
        }

        formatter.success(&format!("Folders of {}", self.account));
        for folder in &folders {
            let state = states.get(&folder.id);
            let mut line = format!(
                "{:<32} {:<8} {}",
                folder.name,
                folder.role.as_str(),
                progress(state)
            );
            if let Some(at) = state.and_then(|s| s.last_full_sync_at) {
                line.push_str(&format!(" (last full sync {})", at.format("%Y-%m-%d %H:%M")));
            }
            formatter.info(&line);
        }
        Ok(())
    }
}

fn folder_json(folder: &Folder, state: Option<&FolderSyncState>) -> serde_json::Value {
    serde_json::json!({
        "id": folder.id.as_str(),
        "name": folder.name,
        "role": folder.role.as_str(),
        "progress": progress(state),
        "next_page_token": state.and_then(|s| s.next_page_token.as_ref()).map(|t| t.as_str()),
        "last_full_sync_at": state.and_then(|s| s.last_full_sync_at).map(|t| t.to_rfc3339()),
    })
}

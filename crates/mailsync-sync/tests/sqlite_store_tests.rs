//! End-to-end scheduler tests over the SQLite sync store
//!
//! These run on the real clock: the SQLite driver works on its own thread,
//! which a paused tokio clock would skip ahead of.

mod common;

use std::sync::Arc;

use common::*;
use mailsync_cache::{DatabasePool, SqliteSyncStore};
use mailsync_core::{
    domain::{newtypes::AccountId, PendingActionKind, ProviderError, SyncJob},
    ports::{ISyncStore, ManualClock, SyncCommit},
};
use mailsync_sync::{JobOutcome, RestoreSummary, SyncController};

struct SqliteHarness {
    controller: SyncController,
    store: Arc<SqliteSyncStore>,
    provider: Arc<ScriptedProvider>,
    account: AccountId,
}

impl SqliteHarness {
    async fn new() -> Self {
        let pool = DatabasePool::in_memory().await.unwrap();
        let store = Arc::new(SqliteSyncStore::new(pool.pool().clone()));
        Self::over(store, AccountId::new())
    }

    /// A fresh controller over an existing store, as after a restart
    fn over(store: Arc<SqliteSyncStore>, account: AccountId) -> Self {
        let provider = Arc::new(ScriptedProvider::default());
        let controller = SyncController::with_clock(
            &test_config(),
            store.clone(),
            Arc::new(FakeTokens::default()),
            Arc::new(ManualClock::new(t0())),
        );
        controller.register_account(account, provider.clone());
        Self {
            controller,
            store,
            provider,
            account,
        }
    }

    async fn drain(&self) {
        while self.controller.try_dispatch_next().await.is_some() {}
    }
}

#[tokio::test]
async fn test_backfill_persists_headers_and_cursor() {
    let h = SqliteHarness::new().await;
    h.provider.set_pages(h.account, "INBOX", 3, 2);

    h.controller
        .submit(SyncJob::fetch_headers(h.account, folder_id("INBOX"), None))
        .unwrap();
    h.drain().await;

    let stored = h
        .store
        .messages_in_folder(&h.account, &folder_id("INBOX"))
        .await
        .unwrap();
    assert_eq!(stored.len(), 6);
    let state = h
        .store
        .folder_state(&h.account, &folder_id("INBOX"))
        .await
        .unwrap()
        .unwrap();
    assert!(state.is_backfill_complete());
    assert_eq!(state.last_full_sync_at, Some(t0()));
}

#[tokio::test]
async fn test_interrupted_work_resumes_after_restart() {
    let first = SqliteHarness::new().await;
    let account = first.account;
    first.provider.set_pages(account, "INBOX", 3, 1);
    first
        .store
        .commit(SyncCommit::new(t0()).insert_messages(vec![header(account, "INBOX", "m1")]))
        .await
        .unwrap();

    // One page lands, then the upload and the rest of the backfill are cut off
    first
        .controller
        .submit(SyncJob::fetch_headers(account, folder_id("INBOX"), None))
        .unwrap();
    first.controller.try_dispatch_next().await.unwrap();
    let action_id = first
        .controller
        .record_local_action(account, PendingActionKind::MarkRead, message_id("m1"))
        .await
        .unwrap();
    assert!(first.store.message(&account, &message_id("m1")).await.unwrap().unwrap().is_read);

    let second = SqliteHarness::over(first.store.clone(), account);
    second.provider.set_pages(account, "INBOX", 3, 1);
    drop(first);

    let summary = second.controller.restore(&account).await.unwrap();
    assert_eq!(
        summary,
        RestoreSummary {
            uploads: 1,
            backfills: 1
        }
    );

    second.drain().await;

    assert_eq!(
        second.provider.calls(),
        vec![
            Call::Apply(action_id),
            Call::Headers {
                folder: "INBOX".into(),
                token: Some("p1".into())
            },
            Call::Headers {
                folder: "INBOX".into(),
                token: Some("p2".into())
            },
        ]
    );
    assert!(second.store.pending_actions(&account).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_upload_survives_in_store() {
    let h = SqliteHarness::new().await;
    let action_id = h
        .controller
        .record_local_action(h.account, PendingActionKind::Send, message_id("draft"))
        .await
        .unwrap();
    h.provider
        .fail_next(ProviderError::Permanent("recipient rejected".into()));

    let report = h.controller.try_dispatch_next().await.unwrap();
    assert!(matches!(report.outcome, JobOutcome::Retrying { .. }));

    let stored = h.store.pending_action(&action_id).await.unwrap().unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(
        stored.last_error.as_deref(),
        Some("Permanent failure: recipient rejected")
    );
    assert!(!stored.failed);
}

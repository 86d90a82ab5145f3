//! Integration tests for the polling lifecycle manager
//!
//! The manager is driven signal by signal against a real controller, the
//! in-memory store and a recording host. Time runs on a paused tokio clock.

mod common;

use std::{sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::*;
use mailsync_core::domain::{newtypes::AccountId, FolderRole, SyncJob};
use mailsync_sync::{LifecycleSignal, PollingManager, PollingState};

struct PollingHarness {
    h: Harness,
    host: Arc<FakeHost>,
    preferences: Arc<FakePreferences>,
}

impl PollingHarness {
    fn new() -> Self {
        Self {
            h: Harness::new(),
            host: Arc::new(FakeHost::default()),
            preferences: Arc::new(FakePreferences::default()),
        }
    }

    fn manager(&self, foreground: bool) -> PollingManager {
        PollingManager::new(
            &test_config(),
            self.h.controller.clone(),
            self.h.store.clone(),
            self.host.clone(),
            self.preferences.clone(),
            self.h.clock.clone(),
            foreground,
        )
    }

    /// Gives the account an inbox, a sent folder and one non-critical folder
    fn with_folders(self) -> Self {
        let account = self.h.account;
        let folders = vec![
            folder(account, "INBOX", FolderRole::Inbox),
            folder(account, "Sent", FolderRole::Sent),
            folder(account, "Lists", FolderRole::Other),
        ];
        self.h.store.set_folders(account, folders.clone());
        self.h.provider.set_folders(folders);
        self.h.provider.set_pages(account, "INBOX", 2, 1);
        self.h.provider.set_pages(account, "Sent", 1, 1);
        self.h.provider.set_pages(account, "Lists", 1, 1);
        self
    }
}

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Active / Passive
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_in_foreground_arms_timer() {
    let p = PollingHarness::new();
    let mut manager = p.manager(true);

    manager.start().await;

    assert_eq!(manager.state(), &PollingState::Active);
    assert!(manager.timer_running());
    assert!(p.host.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_start_in_background_registers_wake() {
    let p = PollingHarness::new();
    let mut manager = p.manager(false);

    manager.start().await;

    assert_eq!(manager.state(), &PollingState::Passive);
    assert!(!manager.timer_running());
    assert_eq!(
        p.host.calls(),
        vec![HostCall::RegisterWake(Duration::from_secs(15 * 60))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_background_and_foreground_swap_timer_and_wake() {
    let p = PollingHarness::new();
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::Backgrounded).await;
    assert_eq!(manager.state(), &PollingState::Passive);
    assert!(!manager.timer_running());

    manager.handle(LifecycleSignal::Foregrounded).await;
    assert_eq!(manager.state(), &PollingState::Active);
    assert!(manager.timer_running());

    assert_eq!(
        p.host.calls(),
        vec![
            HostCall::RegisterWake(Duration::from_secs(15 * 60)),
            HostCall::CancelWake,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_host_failures_do_not_block_transitions() {
    let p = PollingHarness::new();
    p.host.set_failing(true);
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::Backgrounded).await;

    assert_eq!(manager.state(), &PollingState::Passive);
    assert_eq!(p.host.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_tick_refreshes_critical_folders() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::Tick).await;

    assert_eq!(
        p.h.controller.queue().pending_jobs(),
        vec![
            SyncJob::fetch_headers(account, folder_id("INBOX"), None),
            SyncJob::fetch_headers(account, folder_id("Sent"), None),
            SyncJob::sync_folder_list(account),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_folder_list_follows_daily_cadence() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::Tick).await;
    p.h.drain().await;

    manager.handle(LifecycleSignal::Tick).await;
    assert!(!p
        .h
        .controller
        .queue()
        .pending_jobs()
        .contains(&SyncJob::sync_folder_list(account)));
    p.h.drain().await;

    tokio::time::advance(DAY).await;
    manager.handle(LifecycleSignal::Tick).await;
    assert!(p
        .h
        .controller
        .queue()
        .pending_jobs()
        .contains(&SyncJob::sync_folder_list(account)));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_wake_refreshes_in_background() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    let mut manager = p.manager(false);
    manager.start().await;

    // A stale timer tick is ignored in the background
    manager.handle(LifecycleSignal::Tick).await;
    assert!(p.h.controller.queue().is_empty());

    manager.handle(LifecycleSignal::PeriodicWake).await;
    assert!(p
        .h
        .controller
        .queue()
        .pending_jobs()
        .contains(&SyncJob::fetch_headers(account, folder_id("INBOX"), None)));
}

// ============================================================================
// Initial sync
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_initial_sync_runs_until_critical_folders_complete() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    p.preferences.set_days(account, 7);
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::AccountAdded(account)).await;

    assert!(matches!(manager.state(), PollingState::InitialSync { foreground: true, .. }));
    assert_eq!(
        p.h.controller.date_floor(&account),
        Some(t0() - ChronoDuration::days(7))
    );
    assert_eq!(
        p.h.controller.queue().pending_jobs(),
        vec![SyncJob::sync_folder_list(account)]
    );
    assert_eq!(
        p.host.calls(),
        vec![HostCall::RequestForeground("initial sync".into())]
    );

    // Folder list fetched, but INBOX has a second page outstanding
    p.h.controller.dispatch_next().await.unwrap();
    p.h.controller.dispatch_next().await.unwrap();
    p.h.controller.dispatch_next().await.unwrap();
    manager.handle(LifecycleSignal::Tick).await;
    assert!(matches!(manager.state(), PollingState::InitialSync { .. }));

    p.h.drain().await;
    manager.handle(LifecycleSignal::Tick).await;

    assert_eq!(manager.state(), &PollingState::Active);
    assert!(manager.timer_running());
    assert_eq!(p.host.calls().last(), Some(&HostCall::ReleaseForeground));
    // Header fetches carried the date floor
    assert_eq!(
        p.h.provider.last_date_floor(),
        Some(t0() - ChronoDuration::days(7))
    );
}

#[tokio::test(start_paused = true)]
async fn test_initial_sync_uses_default_history_window() {
    let p = PollingHarness::new();
    let account = p.h.account;
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::AccountAdded(account)).await;

    assert_eq!(
        p.h.controller.date_floor(&account),
        Some(t0() - ChronoDuration::days(30))
    );
}

#[tokio::test(start_paused = true)]
async fn test_initial_sync_gives_up_after_time_limit_in_background() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    let mut manager = p.manager(false);
    manager.start().await;
    p.host.clear();

    manager.handle(LifecycleSignal::AccountAdded(account)).await;
    assert!(manager.timer_running());
    assert_eq!(
        p.host.calls(),
        vec![
            HostCall::CancelWake,
            HostCall::RequestForeground("initial sync".into()),
        ]
    );

    // Nothing is dispatched, so backfill never completes
    tokio::time::advance(Duration::from_secs(29 * 60)).await;
    manager.handle(LifecycleSignal::Tick).await;
    assert!(matches!(manager.state(), PollingState::InitialSync { .. }));

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    manager.handle(LifecycleSignal::Tick).await;

    assert_eq!(manager.state(), &PollingState::Passive);
    assert!(!manager.timer_running());
    assert_eq!(
        p.host.calls()[2..],
        [
            HostCall::ReleaseForeground,
            HostCall::RegisterWake(Duration::from_secs(15 * 60)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_account_does_not_hold_initial_sync() {
    let p = PollingHarness::new();
    let mut manager = p.manager(true);
    manager.start().await;

    let stranger = AccountId::new();
    manager.handle(LifecycleSignal::AccountAdded(stranger)).await;

    assert_eq!(manager.state(), &PollingState::Active);
    assert_eq!(
        p.host.calls(),
        vec![
            HostCall::RequestForeground("initial sync".into()),
            HostCall::ReleaseForeground,
        ]
    );
    assert!(p.h.controller.queue().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_synced_accounts_keep_refreshing_during_initial_sync() {
    let p = PollingHarness::new().with_folders();
    let synced = p.h.account;
    let added = AccountId::new();
    p.h.controller.register_account(added, p.h.provider.clone());
    let mut manager = p.manager(true);
    manager.start().await;

    manager.handle(LifecycleSignal::AccountAdded(added)).await;
    manager.handle(LifecycleSignal::Tick).await;

    assert!(matches!(manager.state(), PollingState::InitialSync { .. }));
    let pending = p.h.controller.queue().pending_jobs();
    assert!(pending.contains(&SyncJob::sync_folder_list(added)));
    assert!(pending.contains(&SyncJob::fetch_headers(synced, folder_id("INBOX"), None)));
    assert!(pending.contains(&SyncJob::fetch_headers(synced, folder_id("Sent"), None)));
    assert!(!pending.contains(&SyncJob::fetch_headers(synced, folder_id("Lists"), None)));
}

// ============================================================================
// Run loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_run_loop_ticks_and_follows_signals() {
    let p = PollingHarness::new().with_folders();
    let account = p.h.account;
    let manager = p.manager(true);
    let (tx, rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(manager.run(rx, shutdown.clone()));

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(p
        .h
        .controller
        .queue()
        .pending_jobs()
        .contains(&SyncJob::fetch_headers(account, folder_id("Sent"), None)));

    tx.send(LifecycleSignal::Backgrounded).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        p.host.calls(),
        vec![HostCall::RegisterWake(Duration::from_secs(15 * 60))]
    );

    shutdown.cancel();
    runner.await.unwrap();
}

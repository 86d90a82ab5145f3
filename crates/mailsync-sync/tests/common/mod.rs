//! Shared test doubles for the scheduler integration tests
//!
//! - [`MemoryStore`]: an `ISyncStore` kept in process memory, so tests can
//!   run on a paused tokio clock without a database worker thread.
//! - [`ScriptedProvider`]: a mail provider serving pre-built header pages,
//!   with injectable failures, a call log and concurrency tracking.
//! - [`FakeTokens`], [`FakeHost`], [`FakePreferences`]: the other ports.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

use mailsync_core::{
    config::{Config, ConfigBuilder},
    domain::{
        last_write_wins,
        newtypes::{AccountId, FolderId, MessageId, PageToken, PendingActionId},
        Folder, FolderRole, FolderSyncState, LocalMutation, MessageBody, MessageHeader,
        PendingAction, ProviderError, Winner,
    },
    ports::{
        AccessToken, HeaderPage, HeaderPageRequest, IHostScheduler, IMailProvider, ISyncStore,
        ITokenProvider, IUserPreferences, ManualClock, StoreMutation, SyncCommit,
    },
};
use mailsync_sync::SyncController;

// ============================================================================
// Fixtures
// ============================================================================

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn folder_id(s: &str) -> FolderId {
    FolderId::new(s).unwrap()
}

pub fn message_id(s: &str) -> MessageId {
    MessageId::new(s).unwrap()
}

pub fn page_token(s: &str) -> PageToken {
    PageToken::new(s).unwrap()
}

pub fn header(account: AccountId, folder: &str, id: &str) -> MessageHeader {
    MessageHeader {
        id: message_id(id),
        account_id: account,
        folder_id: folder_id(folder),
        subject: format!("Subject {id}"),
        sender: "alice@example.com".to_string(),
        received_at: t0(),
        is_read: false,
        is_deleted: false,
    }
}

pub fn folder(account: AccountId, id: &str, role: FolderRole) -> Folder {
    Folder::new(folder_id(id), account, id, role)
}

/// Test configuration: 1s base backoff capped at 60s, 3 upload attempts
pub fn test_config() -> Config {
    ConfigBuilder::new()
        .backoff_base_ms(1000)
        .backoff_max_secs(60)
        .outbox_max_attempts(3)
        .build()
}

/// Everything a scheduler test needs, wired together
pub struct Harness {
    pub controller: SyncController,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub tokens: Arc<FakeTokens>,
    pub clock: Arc<ManualClock>,
    pub account: AccountId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemoryStore::default());
        let provider = Arc::new(ScriptedProvider::default());
        let tokens = Arc::new(FakeTokens::default());
        let clock = Arc::new(ManualClock::new(t0()));
        let controller = SyncController::with_clock(
            &config,
            store.clone(),
            tokens.clone(),
            clock.clone(),
        );
        let account = AccountId::new();
        controller.register_account(account, provider.clone());
        Self {
            controller,
            store,
            provider,
            tokens,
            clock,
            account,
        }
    }

    /// Dispatches until nothing is eligible right now
    pub async fn drain(&self) -> Vec<mailsync_sync::JobReport> {
        let mut reports = Vec::new();
        while let Some(report) = self.controller.try_dispatch_next().await {
            reports.push(report);
        }
        reports
    }
}

// ============================================================================
// MemoryStore
// ============================================================================

#[derive(Default)]
struct StoreState {
    folders: HashMap<AccountId, Vec<Folder>>,
    states: HashMap<(AccountId, FolderId), FolderSyncState>,
    messages: HashMap<(AccountId, MessageId), (MessageHeader, DateTime<Utc>)>,
    /// Bodies in fetch order, oldest first
    bodies: Vec<(AccountId, MessageBody)>,
    actions: Vec<PendingAction>,
}

/// In-memory `ISyncStore` applying each commit all-or-nothing
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    fail_commits: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryStore {
    /// Makes the next `n` commits fail without applying anything
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn message(&self, account: AccountId, id: &str) -> Option<MessageHeader> {
        self.state
            .lock()
            .unwrap()
            .messages
            .get(&(account, message_id(id)))
            .map(|(h, _)| h.clone())
    }

    pub fn message_count(&self, account: AccountId) -> usize {
        self.state
            .lock()
            .unwrap()
            .messages
            .keys()
            .filter(|(a, _)| *a == account)
            .count()
    }

    pub fn body_ids(&self, account: AccountId) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .bodies
            .iter()
            .filter(|(a, _)| *a == account)
            .map(|(_, b)| b.message_id.to_string())
            .collect()
    }

    pub fn state_of(&self, account: AccountId, folder: &str) -> Option<FolderSyncState> {
        self.state
            .lock()
            .unwrap()
            .states
            .get(&(account, folder_id(folder)))
            .cloned()
    }

    pub fn set_folders(&self, account: AccountId, folders: Vec<Folder>) {
        self.state.lock().unwrap().folders.insert(account, folders);
    }

    pub fn put_state(&self, state: FolderSyncState) {
        self.state
            .lock()
            .unwrap()
            .states
            .insert((state.account_id, state.folder_id.clone()), state);
    }

    pub fn all_actions(&self) -> Vec<PendingAction> {
        self.state.lock().unwrap().actions.clone()
    }

    fn apply(state: &mut StoreState, mutation: StoreMutation, applied_at: DateTime<Utc>) {
        match mutation {
            StoreMutation::UpsertFolderState(s) => {
                state.states.insert((s.account_id, s.folder_id.clone()), s);
            }
            StoreMutation::InsertMessages(batch) => {
                for header in batch {
                    let key = (header.account_id, header.id.clone());
                    let keep_stored = state
                        .messages
                        .get(&key)
                        .is_some_and(|(_, stamp)| last_write_wins(*stamp, applied_at) == Winner::Stored);
                    if !keep_stored {
                        state.messages.insert(key, (header, applied_at));
                    }
                }
            }
            StoreMutation::SaveMessageBody { account_id, body } => {
                state
                    .bodies
                    .retain(|(a, b)| !(*a == account_id && b.message_id == body.message_id));
                state.bodies.push((account_id, body));
            }
            StoreMutation::ReplaceFolders { account_id, folders } => {
                state
                    .states
                    .retain(|(a, f), _| *a != account_id || folders.iter().any(|x| &x.id == f));
                state.folders.insert(account_id, folders);
            }
            StoreMutation::InsertPendingAction(action) => state.actions.push(action),
            StoreMutation::UpdatePendingAction(action) => {
                if let Some(slot) = state.actions.iter_mut().find(|a| a.id == action.id) {
                    *slot = action;
                }
            }
            StoreMutation::DeletePendingAction(id) => state.actions.retain(|a| a.id != id),
            StoreMutation::ApplyLocalMutation {
                account_id,
                message_id,
                mutation,
            } => {
                if let Some((header, stamp)) = state.messages.get_mut(&(account_id, message_id)) {
                    match mutation {
                        LocalMutation::SetRead(read) => header.is_read = read,
                        LocalMutation::MarkDeleted => header.is_deleted = true,
                        LocalMutation::MoveTo(folder) => header.folder_id = folder,
                    }
                    *stamp = applied_at;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ISyncStore for MemoryStore {
    async fn commit(&self, commit: SyncCommit) -> anyhow::Result<()> {
        let remaining = self.fail_commits.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_commits.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("injected commit failure");
        }
        let applied_at = commit.applied_at();
        let mut state = self.state.lock().unwrap();
        for mutation in commit.into_mutations() {
            Self::apply(&mut state, mutation, applied_at);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn folder_state(
        &self,
        account_id: &AccountId,
        folder_id: &FolderId,
    ) -> anyhow::Result<Option<FolderSyncState>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .states
            .get(&(*account_id, folder_id.clone()))
            .cloned())
    }

    async fn folder_states(&self, account_id: &AccountId) -> anyhow::Result<Vec<FolderSyncState>> {
        let mut states: Vec<_> = self
            .state
            .lock()
            .unwrap()
            .states
            .values()
            .filter(|s| s.account_id == *account_id)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        Ok(states)
    }

    async fn folders(&self, account_id: &AccountId) -> anyhow::Result<Vec<Folder>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .folders
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn pending_action(&self, id: &PendingActionId) -> anyhow::Result<Option<PendingAction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .actions
            .iter()
            .find(|a| a.id == *id)
            .cloned())
    }

    async fn pending_actions(&self, account_id: &AccountId) -> anyhow::Result<Vec<PendingAction>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .actions
            .iter()
            .filter(|a| a.account_id == *account_id)
            .cloned()
            .collect())
    }

    async fn cache_size(&self, account_id: &AccountId) -> anyhow::Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .bodies
            .iter()
            .filter(|(a, _)| a == account_id)
            .map(|(_, b)| b.size_bytes())
            .sum())
    }

    async fn evict_cache(&self, account_id: &AccountId, target_bytes: u64) -> anyhow::Result<u64> {
        let mut state = self.state.lock().unwrap();
        let mut size: u64 = state
            .bodies
            .iter()
            .filter(|(a, _)| a == account_id)
            .map(|(_, b)| b.size_bytes())
            .sum();
        let mut freed = 0;
        while size > target_bytes {
            let Some(pos) = state.bodies.iter().position(|(a, _)| a == account_id) else {
                break;
            };
            let (_, body) = state.bodies.remove(pos);
            size -= body.size_bytes();
            freed += body.size_bytes();
        }
        Ok(freed)
    }
}

// ============================================================================
// ScriptedProvider
// ============================================================================

/// A provider call, as recorded in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Headers {
        folder: String,
        token: Option<String>,
    },
    Body(String),
    Apply(PendingActionId),
    ListFolders,
    Search(String),
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ProviderScript {
    /// Pages per folder; page `n` is requested with token `p{n}`
    pages: HashMap<FolderId, Vec<Vec<MessageHeader>>>,
    folders: Vec<Folder>,
    search_results: Vec<MessageHeader>,
    errors: VecDeque<ProviderError>,
    calls: Vec<Call>,
    hooks: VecDeque<Hook>,
    last_date_floor: Option<DateTime<Utc>>,
}

/// Scripted `IMailProvider`
#[derive(Default)]
pub struct ScriptedProvider {
    script: Mutex<ProviderScript>,
    delay: Mutex<Option<Duration>>,
    body_size: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    /// Serves `pages` pages of `per_page` headers for a folder
    pub fn set_pages(&self, account: AccountId, folder: &str, pages: usize, per_page: usize) {
        let built = (0..pages)
            .map(|p| {
                (0..per_page)
                    .map(|i| header(account, folder, &format!("{folder}-{p}-{i}")))
                    .collect()
            })
            .collect();
        self.script
            .lock()
            .unwrap()
            .pages
            .insert(folder_id(folder), built);
    }

    pub fn set_folders(&self, folders: Vec<Folder>) {
        self.script.lock().unwrap().folders = folders;
    }

    pub fn set_search_results(&self, results: Vec<MessageHeader>) {
        self.script.lock().unwrap().search_results = results;
    }

    /// The next call fails with `error`; errors are consumed in order
    pub fn fail_next(&self, error: ProviderError) {
        self.script.lock().unwrap().errors.push_back(error);
    }

    /// Runs `hook` at the start of the next call, while its job is in flight
    pub fn on_next_call(&self, hook: impl FnOnce() + Send + 'static) {
        self.script.lock().unwrap().hooks.push_back(Box::new(hook));
    }

    /// Size of every body returned by `fetch_body` (default 100 bytes)
    pub fn set_body_size(&self, bytes: usize) {
        self.body_size.store(bytes, Ordering::SeqCst);
    }

    /// Every call sleeps this long on the tokio clock
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn header_calls(&self) -> Vec<(String, Option<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Headers { folder, token } => Some((folder, token)),
                _ => None,
            })
            .collect()
    }

    pub fn last_date_floor(&self) -> Option<DateTime<Utc>> {
        self.script.lock().unwrap().last_date_floor
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Records the call, runs a pending hook, applies the delay, and
    /// returns an injected error if one is queued
    async fn enter(&self, call: Call) -> Result<(), ProviderError> {
        let (hook, error) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            (script.hooks.pop_front(), script.errors.pop_front())
        };
        if let Some(hook) = hook {
            hook();
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IMailProvider for ScriptedProvider {
    async fn fetch_headers(
        &self,
        _token: &AccessToken,
        request: &HeaderPageRequest,
    ) -> Result<HeaderPage, ProviderError> {
        self.enter(Call::Headers {
            folder: request.folder_id.to_string(),
            token: request.page_token.as_ref().map(|t| t.to_string()),
        })
        .await?;

        let mut script = self.script.lock().unwrap();
        script.last_date_floor = request.date_floor;
        let pages = script
            .pages
            .get(&request.folder_id)
            .cloned()
            .unwrap_or_default();
        let index = match &request.page_token {
            None => 0,
            Some(t) => t
                .as_str()
                .trim_start_matches('p')
                .parse::<usize>()
                .map_err(|_| ProviderError::StaleCursor)?,
        };
        if index > 0 && index >= pages.len() {
            return Err(ProviderError::StaleCursor);
        }
        let items = pages.get(index).cloned().unwrap_or_default();
        let next_page_token = (index + 1 < pages.len()).then(|| page_token(&format!("p{}", index + 1)));
        Ok(HeaderPage {
            items,
            next_page_token,
        })
    }

    async fn fetch_body(
        &self,
        _token: &AccessToken,
        _account_id: &AccountId,
        message_id: &MessageId,
    ) -> Result<MessageBody, ProviderError> {
        self.enter(Call::Body(message_id.to_string())).await?;
        Ok(MessageBody {
            message_id: message_id.clone(),
            content: "x".repeat(match self.body_size.load(Ordering::SeqCst) {
                0 => 100,
                n => n,
            }),
        })
    }

    async fn apply_action(
        &self,
        _token: &AccessToken,
        action: &PendingAction,
    ) -> Result<(), ProviderError> {
        self.enter(Call::Apply(action.id)).await
    }

    async fn list_folders(
        &self,
        _token: &AccessToken,
        _account_id: &AccountId,
    ) -> Result<Vec<Folder>, ProviderError> {
        self.enter(Call::ListFolders).await?;
        Ok(self.script.lock().unwrap().folders.clone())
    }

    async fn search(
        &self,
        _token: &AccessToken,
        _account_id: &AccountId,
        query: &str,
    ) -> Result<Vec<MessageHeader>, ProviderError> {
        self.enter(Call::Search(query.to_string())).await?;
        Ok(self.script.lock().unwrap().search_results.clone())
    }
}

// ============================================================================
// Token provider
// ============================================================================

#[derive(Default)]
pub struct FakeTokens {
    acquire_errors: Mutex<VecDeque<ProviderError>>,
    reauth_errors: Mutex<VecDeque<ProviderError>>,
    acquired: AtomicUsize,
    reauth_calls: AtomicUsize,
}

impl FakeTokens {
    pub fn fail_next_acquire(&self, error: ProviderError) {
        self.acquire_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_next_reauth(&self, error: ProviderError) {
        self.reauth_errors.lock().unwrap().push_back(error);
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn reauth_calls(&self) -> usize {
        self.reauth_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ITokenProvider for FakeTokens {
    async fn acquire_token(&self, account_id: &AccountId) -> Result<AccessToken, ProviderError> {
        if let Some(e) = self.acquire_errors.lock().unwrap().pop_front() {
            return Err(e);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(AccessToken::new(format!("token-{account_id}")))
    }

    async fn reauthenticate(&self, _account_id: &AccountId) -> Result<(), ProviderError> {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        match self.reauth_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Host and preferences
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    RegisterWake(Duration),
    CancelWake,
    RequestForeground(String),
    ReleaseForeground,
}

#[derive(Default)]
pub struct FakeHost {
    calls: Mutex<Vec<HostCall>>,
    fail: AtomicBool,
}

impl FakeHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes every host call fail after recording it
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: HostCall) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("host unavailable");
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl IHostScheduler for FakeHost {
    async fn register_periodic_wake(&self, interval: Duration) -> anyhow::Result<()> {
        self.record(HostCall::RegisterWake(interval))
    }

    async fn cancel_periodic_wake(&self) -> anyhow::Result<()> {
        self.record(HostCall::CancelWake)
    }

    async fn request_foreground_execution(&self, reason: &str) -> anyhow::Result<()> {
        self.record(HostCall::RequestForeground(reason.to_string()))
    }

    async fn release_foreground_execution(&self) -> anyhow::Result<()> {
        self.record(HostCall::ReleaseForeground)
    }
}

#[derive(Default)]
pub struct FakePreferences {
    days: Mutex<HashMap<AccountId, u32>>,
}

impl FakePreferences {
    pub fn set_days(&self, account: AccountId, days: u32) {
        self.days.lock().unwrap().insert(account, days);
    }
}

#[async_trait::async_trait]
impl IUserPreferences for FakePreferences {
    async fn initial_sync_duration_days(&self, account_id: &AccountId) -> anyhow::Result<Option<u32>> {
        Ok(self.days.lock().unwrap().get(account_id).copied())
    }
}

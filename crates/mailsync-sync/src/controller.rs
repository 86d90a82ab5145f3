//! Sync controller - the single dispatch authority
//!
//! The [`SyncController`] owns the [`JobQueue`], executes leased jobs
//! against the account's mail provider and the sync store, and turns every
//! outcome into a queue completion and a status snapshot.
//!
//! ## Execution
//!
//! ```text
//! take_next ──→ acquire token ──→ provider call ──→ one atomic store commit
//!     ▲          (under the per-job deadline)                │
//!     │                                                      ▼
//!     └──────────── complete(requeue / successors / backoff) ◀── classify
//! ```
//!
//! [`SyncController::run`] spawns one task per leased job; the queue's
//! in-flight gating keeps that to one task per account while other accounts
//! are served concurrently. [`SyncController::dispatch_next`] runs a single
//! cycle inline for deterministic driving.
//!
//! ## Failure Classification
//!
//! | Failure                 | Effect                                              |
//! |-------------------------|-----------------------------------------------------|
//! | Network, timeout, store | requeue, back off the account                       |
//! | Throttled               | requeue, back off (at least the retry-after hint)   |
//! | Auth                    | requeue, suspend the account, submit Reauthenticate |
//! | Stale cursor            | restart the folder's backfill from the first page   |
//! | Permanent               | drop the job                                        |
//! | Upload (non-auth)       | count the attempt; mark failed at the ceiling       |

use std::{any::Any, collections::HashSet, fmt, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::{sync::broadcast, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mailsync_core::{
    config::Config,
    domain::{
        newtypes::{AccountId, FolderId, MessageId, PageToken, PendingActionId},
        AccountStatus, FolderRole, FolderSyncState, JobKind, PendingAction, PendingActionKind,
        ProviderError, SyncJob, SyncState,
    },
    ports::{
        AccessToken, HeaderPage, HeaderPageRequest, IClock, IMailProvider, ISyncStore,
        ITokenProvider, SyncCommit, SystemClock,
    },
};

use crate::{
    backoff::{AccountSyncContext, BackoffPolicy},
    queue::{Completion, JobQueue, Lease, SubmitOutcome},
    status::StatusBroadcaster,
    SyncError,
};

// ============================================================================
// Settings
// ============================================================================

/// Controller parameters derived from [`Config`]
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub job_timeout: Duration,
    pub max_attempts: u32,
    pub cache_max_bytes: u64,
    pub cache_target_bytes: u64,
    pub critical_roles: Vec<FolderRole>,
    pub status_capacity: usize,
    pub backoff: BackoffPolicy,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            job_timeout: config.scheduler.job_timeout(),
            max_attempts: config.outbox.max_attempts,
            cache_max_bytes: config.cache.max_size_bytes(),
            cache_target_bytes: config.cache.target_size_bytes(),
            critical_roles: config.polling.critical_roles.clone(),
            status_capacity: config.scheduler.status_channel_capacity,
            backoff: BackoffPolicy::from_config(&config.backoff),
        }
    }

    fn is_critical(&self, role: FolderRole) -> bool {
        self.critical_roles.contains(&role)
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// How a job execution ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// All effects committed
    Succeeded,
    /// Failed transiently; the job is back in the queue
    Retrying { error: String },
    /// Credentials were rejected; the account waits for reauthentication
    Suspended { error: String },
    /// The provider rejected the folder cursor; backfill restarts
    CursorReset,
    /// The job can never succeed and was removed
    Dropped { error: String },
    /// An outbox entry reached the attempt ceiling and was marked failed
    ActionFailed {
        pending_action_id: PendingActionId,
        error: String,
    },
}

impl JobOutcome {
    fn error(&self) -> Option<&str> {
        match self {
            JobOutcome::Succeeded | JobOutcome::CursorReset => None,
            JobOutcome::Retrying { error }
            | JobOutcome::Suspended { error }
            | JobOutcome::Dropped { error }
            | JobOutcome::ActionFailed { error, .. } => Some(error),
        }
    }
}

/// Result of one dispatch cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job: SyncJob,
    pub outcome: JobOutcome,
    /// Account context after completion
    pub context: AccountSyncContext,
}

/// Jobs re-submitted by [`SyncController::restore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreSummary {
    pub uploads: usize,
    pub backfills: usize,
}

// ============================================================================
// Internal execution types
// ============================================================================

#[derive(Debug, Default)]
struct Executed {
    successors: Vec<SyncJob>,
    /// Message data was written; cache size must be rechecked
    stored_data: bool,
}

impl Executed {
    fn stored(successors: Vec<SyncJob>) -> Self {
        Self {
            successors,
            stored_data: true,
        }
    }
}

#[derive(Debug)]
enum JobFailure {
    Provider(ProviderError),
    Store(anyhow::Error),
    UnknownAccount,
    /// The execution panicked; the message of the panic payload
    Panicked(String),
}

impl From<ProviderError> for JobFailure {
    fn from(e: ProviderError) -> Self {
        JobFailure::Provider(e)
    }
}

impl From<anyhow::Error> for JobFailure {
    fn from(e: anyhow::Error) -> Self {
        JobFailure::Store(e)
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobFailure::Provider(e) => write!(f, "{e}"),
            JobFailure::Store(e) => write!(f, "Store error: {e:#}"),
            JobFailure::UnknownAccount => write!(f, "Account not registered"),
            JobFailure::Panicked(message) => write!(f, "Job panicked: {message}"),
        }
    }
}

#[derive(Clone)]
struct AccountEntry {
    provider: Arc<dyn IMailProvider>,
    date_floor: Option<DateTime<Utc>>,
}

struct Inner {
    queue: JobQueue,
    store: Arc<dyn ISyncStore>,
    tokens: Arc<dyn ITokenProvider>,
    clock: Arc<dyn IClock>,
    accounts: DashMap<AccountId, AccountEntry>,
    status: StatusBroadcaster,
    settings: ControllerSettings,
}

// ============================================================================
// SyncController
// ============================================================================

/// The scheduler's dispatcher
///
/// Cheap to clone; clones share the same queue and account registry.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<Inner>,
}

impl SyncController {
    /// Creates a controller using the system clock
    pub fn new(
        config: &Config,
        store: Arc<dyn ISyncStore>,
        tokens: Arc<dyn ITokenProvider>,
    ) -> Self {
        Self::with_clock(config, store, tokens, Arc::new(SystemClock))
    }

    /// Creates a controller with an injected wall clock
    pub fn with_clock(
        config: &Config,
        store: Arc<dyn ISyncStore>,
        tokens: Arc<dyn ITokenProvider>,
        clock: Arc<dyn IClock>,
    ) -> Self {
        let settings = ControllerSettings::from_config(config);
        info!(
            job_timeout_secs = settings.job_timeout.as_secs(),
            max_attempts = settings.max_attempts,
            "Creating sync controller"
        );
        Self {
            inner: Arc::new(Inner {
                queue: JobQueue::new(settings.backoff),
                store,
                tokens,
                clock,
                accounts: DashMap::new(),
                status: StatusBroadcaster::new(settings.status_capacity),
                settings,
            }),
        }
    }

    // --- Accounts ---

    /// Makes an account schedulable with the given provider
    pub fn register_account(&self, account_id: AccountId, provider: Arc<dyn IMailProvider>) {
        let date_floor = self
            .inner
            .accounts
            .get(&account_id)
            .and_then(|entry| entry.date_floor);
        self.inner.accounts.insert(
            account_id,
            AccountEntry {
                provider,
                date_floor,
            },
        );
        if self.inner.status.latest(&account_id).is_none() {
            self.inner
                .status
                .publish(AccountStatus::idle(account_id, self.inner.clock.now()));
        }
        info!(%account_id, "Account registered");
    }

    /// Removes an account and drops its pending jobs
    pub fn unregister_account(&self, account_id: &AccountId) -> bool {
        let removed = self.inner.accounts.remove(account_id).is_some();
        let dropped = self.inner.queue.remove_account(account_id);
        self.inner.status.forget(account_id);
        if removed {
            info!(%account_id, dropped_jobs = dropped, "Account unregistered");
        }
        removed
    }

    /// Registered accounts, in no particular order
    pub fn registered_accounts(&self) -> Vec<AccountId> {
        self.inner.accounts.iter().map(|e| *e.key()).collect()
    }

    pub fn is_registered(&self, account_id: &AccountId) -> bool {
        self.inner.accounts.contains_key(account_id)
    }

    /// Sets the oldest message date requested by header fetches
    pub fn set_date_floor(
        &self,
        account_id: &AccountId,
        floor: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        let mut entry = self
            .inner
            .accounts
            .get_mut(account_id)
            .ok_or(SyncError::UnknownAccount(*account_id))?;
        entry.date_floor = Some(floor);
        debug!(%account_id, %floor, "Date floor set");
        Ok(())
    }

    pub fn date_floor(&self, account_id: &AccountId) -> Option<DateTime<Utc>> {
        self.inner
            .accounts
            .get(account_id)
            .and_then(|entry| entry.date_floor)
    }

    /// Resumes an account after the user reauthenticated out of band
    pub fn reauthenticated(&self, account_id: &AccountId) {
        self.inner.queue.reauthenticated(account_id);
        let mut status = self
            .inner
            .status
            .latest(account_id)
            .unwrap_or_else(|| AccountStatus::idle(*account_id, self.inner.clock.now()));
        status.needs_reauthentication = false;
        status.updated_at = self.inner.clock.now();
        self.inner.status.publish(status);
        info!(%account_id, "Account reauthenticated; resuming");
    }

    // --- Submission ---

    /// Submits a job for a registered account
    pub fn submit(&self, job: SyncJob) -> Result<SubmitOutcome, SyncError> {
        let account_id = job.account_id();
        if !self.is_registered(&account_id) {
            return Err(SyncError::UnknownAccount(account_id));
        }
        Ok(self.inner.queue.submit(job))
    }

    /// Records a user mutation: applies it locally and queues its upload
    ///
    /// The local change and the outbox entry are written in one commit.
    pub async fn record_local_action(
        &self,
        account_id: AccountId,
        kind: PendingActionKind,
        target_id: MessageId,
    ) -> Result<PendingActionId, SyncError> {
        if !self.is_registered(&account_id) {
            return Err(SyncError::UnknownAccount(account_id));
        }

        let now = self.inner.clock.now();
        let action = PendingAction::new(account_id, kind, target_id, now);
        let action_id = action.id;

        let mut commit = SyncCommit::new(now);
        if let Some(mutation) = action.kind.local_mutation() {
            commit = commit.apply_local_mutation(account_id, action.target_id.clone(), mutation);
        }
        debug!(
            %account_id,
            %action_id,
            kind = action.kind.name(),
            target = %action.target_id,
            "Recording local action"
        );
        self.inner
            .store
            .commit(commit.insert_pending_action(action))
            .await?;

        self.inner
            .queue
            .submit(SyncJob::upload(account_id, action_id));
        Ok(action_id)
    }

    /// Re-submits persisted work after a restart
    ///
    /// Every non-failed outbox entry is queued for upload in creation order,
    /// and every folder with an unfinished backfill cursor gets a header
    /// fetch at that cursor.
    pub async fn restore(&self, account_id: &AccountId) -> Result<RestoreSummary, SyncError> {
        if !self.is_registered(account_id) {
            return Err(SyncError::UnknownAccount(*account_id));
        }

        let mut summary = RestoreSummary::default();

        for action in self.inner.store.pending_actions(account_id).await? {
            if action.failed {
                continue;
            }
            if self.inner.queue.submit(SyncJob::upload(*account_id, action.id))
                == SubmitOutcome::Enqueued
            {
                summary.uploads += 1;
            }
        }

        for state in self.inner.store.folder_states(account_id).await? {
            let Some(cursor) = state.next_page_token else {
                continue;
            };
            let job = SyncJob::fetch_headers(*account_id, state.folder_id, Some(cursor));
            if self.inner.queue.submit(job) == SubmitOutcome::Enqueued {
                summary.backfills += 1;
            }
        }

        info!(
            %account_id,
            uploads = summary.uploads,
            backfills = summary.backfills,
            "Restored persisted sync work"
        );
        Ok(summary)
    }

    // --- Observation ---

    /// Subscribes to status snapshots of all accounts
    pub fn subscribe(&self) -> broadcast::Receiver<AccountStatus> {
        self.inner.status.subscribe()
    }

    /// Latest status snapshot of an account
    pub fn status(&self, account_id: &AccountId) -> Option<AccountStatus> {
        self.inner.status.latest(account_id)
    }

    /// Snapshot of an account's scheduling context
    pub fn account_context(&self, account_id: &AccountId) -> AccountSyncContext {
        self.inner.queue.context(account_id)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    // --- Dispatch ---

    /// Waits for the next eligible job and executes it inline
    ///
    /// Dropping the returned future mid-execution puts the job back in the
    /// queue and frees its account.
    pub async fn dispatch_next(&self) -> Result<JobReport, SyncError> {
        let lease = self
            .inner
            .queue
            .take_next()
            .await
            .ok_or(SyncError::QueueClosed)?;
        Ok(self.process(lease).await)
    }

    /// Executes the next eligible job inline, if there is one right now
    pub async fn try_dispatch_next(&self) -> Option<JobReport> {
        let lease = self.inner.queue.try_take_next()?;
        Some(self.process(lease).await)
    }

    /// Runs the dispatch loop until `shutdown` fires or the queue closes
    ///
    /// Each leased job runs on its own task. On shutdown the queue is
    /// closed and in-flight jobs are awaited.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Sync controller starting");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                lease = self.inner.queue.take_next() => {
                    let Some(lease) = lease else {
                        info!("Job queue closed");
                        break;
                    };
                    let this = self.clone();
                    tasks.spawn(async move { this.process(lease).await });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Job task failed");
                    }
                }
            }
        }

        self.inner.queue.close();
        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task failed");
            }
        }
        info!("Sync controller stopped");
    }

    /// Closes the queue; `run` returns once in-flight jobs finish
    pub fn shutdown(&self) {
        self.inner.queue.close();
    }

    // ========================================================================
    // Job processing
    // ========================================================================

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(account_id = %lease.job().account_id(), job = %lease.job())
    )]
    async fn process(&self, lease: Lease) -> JobReport {
        let job = lease.job().clone();
        let account_id = job.account_id();

        let context = self.inner.queue.context(&account_id);
        self.publish(account_id, SyncState::Syncing, None, context.needs_reauthentication);

        let timeout = self.inner.settings.job_timeout;
        let execution = AssertUnwindSafe(self.execute(&job)).catch_unwind();
        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(JobFailure::Panicked(panic_message(payload.as_ref()))),
            Err(_) => Err(JobFailure::Provider(ProviderError::Network(format!(
                "Job timed out after {}s",
                timeout.as_secs()
            )))),
        };

        let (completion, outcome) = match result {
            Ok(executed) => {
                debug!(successors = executed.successors.len(), "Job succeeded");
                (
                    Completion::success().with_successors(executed.successors),
                    JobOutcome::Succeeded,
                )
            }
            Err(failure) => self.classify(&job, failure).await,
        };

        let report = self.inner.queue.complete(lease, completion);

        let state = match &outcome {
            JobOutcome::Succeeded | JobOutcome::CursorReset => SyncState::Idle,
            _ => SyncState::Error,
        };
        self.publish(
            account_id,
            state,
            outcome.error().map(str::to_string),
            report.context.needs_reauthentication,
        );

        JobReport {
            job,
            outcome,
            context: report.context,
        }
    }

    fn publish(
        &self,
        account_id: AccountId,
        state: SyncState,
        last_error: Option<String>,
        needs_reauthentication: bool,
    ) {
        self.inner.status.publish(AccountStatus {
            account_id,
            state,
            last_error,
            needs_reauthentication,
            updated_at: self.inner.clock.now(),
        });
    }

    fn account(&self, account_id: &AccountId) -> Option<AccountEntry> {
        self.inner
            .accounts
            .get(account_id)
            .map(|entry| entry.value().clone())
    }

    async fn execute(&self, job: &SyncJob) -> Result<Executed, JobFailure> {
        let account_id = job.account_id();

        match job.kind() {
            JobKind::Reauthenticate => {
                self.inner.tokens.reauthenticate(&account_id).await?;
                info!(%account_id, "Reauthentication completed");
                return Ok(Executed::default());
            }
            JobKind::EvictFromCache => {
                let target = self.inner.settings.cache_target_bytes;
                let freed = self.inner.store.evict_cache(&account_id, target).await?;
                info!(%account_id, freed_bytes = freed, target_bytes = target, "Cache evicted");
                return Ok(Executed::default());
            }
            _ => {}
        }

        let entry = self.account(&account_id).ok_or(JobFailure::UnknownAccount)?;
        let token = self.inner.tokens.acquire_token(&account_id).await?;
        let ctx = ExecContext {
            account_id,
            provider: entry.provider.as_ref(),
            token: &token,
            date_floor: entry.date_floor,
        };

        let mut executed = match job.kind() {
            JobKind::FetchFullMessageBody { message_id } => self.fetch_body(&ctx, message_id).await?,
            JobKind::FetchNextMessageListPage { folder_id } => {
                self.fetch_next_page(&ctx, folder_id).await?
            }
            JobKind::ForceRefreshFolder { folder_id } => self.force_refresh(&ctx, folder_id).await?,
            JobKind::SearchOnline { query } => self.search(&ctx, query).await?,
            JobKind::UploadAction { pending_action_id } => {
                self.upload(&ctx, pending_action_id).await?
            }
            JobKind::FetchMessageHeaders {
                folder_id,
                page_token,
            } => self.fetch_headers(&ctx, folder_id, page_token.as_ref()).await?,
            JobKind::SyncFolderList => self.sync_folder_list(&ctx).await?,
            JobKind::Reauthenticate | JobKind::EvictFromCache => Executed::default(),
        };

        if executed.stored_data {
            if let Some(evict) = self.eviction_needed(&account_id).await {
                executed.successors.push(evict);
            }
        }
        Ok(executed)
    }

    async fn fetch_page(
        &self,
        ctx: &ExecContext<'_>,
        folder_id: &FolderId,
        page_token: Option<PageToken>,
    ) -> Result<HeaderPage, ProviderError> {
        let request = HeaderPageRequest {
            account_id: ctx.account_id,
            folder_id: folder_id.clone(),
            page_token,
            date_floor: ctx.date_floor,
        };
        let page = ctx.provider.fetch_headers(ctx.token, &request).await?;
        debug!(
            folder = %folder_id,
            cursor = ?request.page_token.as_ref().map(PageToken::as_str),
            items = page.items.len(),
            has_more = page.next_page_token.is_some(),
            "Fetched header page"
        );
        Ok(page)
    }

    /// Commits a fetched page together with the advanced cursor
    async fn commit_page(
        &self,
        mut state: FolderSyncState,
        page: HeaderPage,
    ) -> Result<Option<PageToken>, JobFailure> {
        let now = self.inner.clock.now();
        state.advance(page.next_page_token.clone(), now);
        if state.is_backfill_complete() {
            info!(folder = %state.folder_id, "Folder backfill complete");
        }
        self.inner
            .store
            .commit(
                SyncCommit::new(now)
                    .insert_messages(page.items)
                    .upsert_folder_state(state),
            )
            .await?;
        Ok(page.next_page_token)
    }

    async fn fetch_headers(
        &self,
        ctx: &ExecContext<'_>,
        folder_id: &FolderId,
        hint: Option<&PageToken>,
    ) -> Result<Executed, JobFailure> {
        let existing = self
            .inner
            .store
            .folder_state(&ctx.account_id, folder_id)
            .await?;

        // The persisted cursor wins over the job's token
        let (cursor, head_refresh) = match &existing {
            Some(state) if state.is_backfill_complete() => (None, true),
            Some(state) => (state.next_page_token.clone(), false),
            None => (hint.cloned(), false),
        };
        if let (Some(hint), Some(_)) = (hint, &existing) {
            if cursor.as_ref() != Some(hint) {
                debug!(folder = %folder_id, hint = hint.as_str(), "Job token superseded by stored cursor");
            }
        }

        let page = self.fetch_page(ctx, folder_id, cursor).await?;

        if head_refresh {
            self.inner
                .store
                .commit(SyncCommit::new(self.inner.clock.now()).insert_messages(page.items))
                .await?;
            return Ok(Executed::stored(Vec::new()));
        }

        let state = existing.unwrap_or_else(|| FolderSyncState::new(folder_id.clone(), ctx.account_id));
        let next = self.commit_page(state, page).await?;
        let successors = next
            .map(|token| SyncJob::fetch_headers(ctx.account_id, folder_id.clone(), Some(token)))
            .into_iter()
            .collect();
        Ok(Executed::stored(successors))
    }

    async fn fetch_next_page(
        &self,
        ctx: &ExecContext<'_>,
        folder_id: &FolderId,
    ) -> Result<Executed, JobFailure> {
        let existing = self
            .inner
            .store
            .folder_state(&ctx.account_id, folder_id)
            .await?;
        if existing.as_ref().is_some_and(FolderSyncState::is_backfill_complete) {
            debug!(folder = %folder_id, "No further pages");
            return Ok(Executed::default());
        }

        let state = existing.unwrap_or_else(|| FolderSyncState::new(folder_id.clone(), ctx.account_id));
        let page = self
            .fetch_page(ctx, folder_id, state.next_page_token.clone())
            .await?;
        self.commit_page(state, page).await?;
        Ok(Executed::stored(Vec::new()))
    }

    async fn force_refresh(
        &self,
        ctx: &ExecContext<'_>,
        folder_id: &FolderId,
    ) -> Result<Executed, JobFailure> {
        let mut state = self
            .inner
            .store
            .folder_state(&ctx.account_id, folder_id)
            .await?
            .unwrap_or_else(|| FolderSyncState::new(folder_id.clone(), ctx.account_id));

        state.reset_cursor();
        self.inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).upsert_folder_state(state.clone()))
            .await?;

        let page = self.fetch_page(ctx, folder_id, None).await?;
        let next = self.commit_page(state, page).await?;
        let successors = next
            .map(|token| SyncJob::fetch_headers(ctx.account_id, folder_id.clone(), Some(token)))
            .into_iter()
            .collect();
        Ok(Executed::stored(successors))
    }

    async fn fetch_body(
        &self,
        ctx: &ExecContext<'_>,
        message_id: &MessageId,
    ) -> Result<Executed, JobFailure> {
        let body = ctx
            .provider
            .fetch_body(ctx.token, &ctx.account_id, message_id)
            .await?;
        debug!(message = %message_id, bytes = body.size_bytes(), "Fetched message body");
        self.inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).save_message_body(ctx.account_id, body))
            .await?;
        Ok(Executed::stored(Vec::new()))
    }

    async fn search(&self, ctx: &ExecContext<'_>, query: &str) -> Result<Executed, JobFailure> {
        let results = ctx
            .provider
            .search(ctx.token, &ctx.account_id, query)
            .await?;
        debug!(results = results.len(), "Online search finished");
        self.inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).insert_messages(results))
            .await?;
        Ok(Executed::stored(Vec::new()))
    }

    async fn upload(
        &self,
        ctx: &ExecContext<'_>,
        pending_action_id: &PendingActionId,
    ) -> Result<Executed, JobFailure> {
        let Some(action) = self.inner.store.pending_action(pending_action_id).await? else {
            debug!(action = %pending_action_id, "Outbox entry already gone");
            return Ok(Executed::default());
        };
        if action.failed {
            warn!(action = %pending_action_id, "Outbox entry is marked failed; not uploading");
            return Ok(Executed::default());
        }

        ctx.provider.apply_action(ctx.token, &action).await?;
        self.inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).delete_pending_action(action.id))
            .await?;
        info!(
            action = %action.id,
            kind = action.kind.name(),
            attempts = action.attempt_count + 1,
            "Outbox entry uploaded"
        );
        Ok(Executed::default())
    }

    async fn sync_folder_list(&self, ctx: &ExecContext<'_>) -> Result<Executed, JobFailure> {
        let folders = ctx.provider.list_folders(ctx.token, &ctx.account_id).await?;
        let known: HashSet<FolderId> = self
            .inner
            .store
            .folder_states(&ctx.account_id)
            .await?
            .into_iter()
            .map(|state| state.folder_id)
            .collect();

        let successors: Vec<SyncJob> = folders
            .iter()
            .filter(|folder| self.inner.settings.is_critical(folder.role) && !known.contains(&folder.id))
            .map(|folder| SyncJob::fetch_headers(ctx.account_id, folder.id.clone(), None))
            .collect();

        info!(
            folders = folders.len(),
            new_backfills = successors.len(),
            "Folder list refreshed"
        );
        self.inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).replace_folders(ctx.account_id, folders))
            .await?;
        Ok(Executed {
            successors,
            stored_data: false,
        })
    }

    async fn eviction_needed(&self, account_id: &AccountId) -> Option<SyncJob> {
        match self.inner.store.cache_size(account_id).await {
            Ok(size) if size > self.inner.settings.cache_max_bytes => {
                debug!(%account_id, size_bytes = size, "Cache above limit");
                Some(SyncJob::evict(*account_id))
            }
            Ok(_) => None,
            Err(e) => {
                warn!(%account_id, error = %format!("{e:#}"), "Failed to read cache size");
                None
            }
        }
    }

    // ========================================================================
    // Failure classification
    // ========================================================================

    async fn classify(&self, job: &SyncJob, failure: JobFailure) -> (Completion, JobOutcome) {
        let error = failure.to_string();
        let account_id = job.account_id();

        let err = match failure {
            JobFailure::Provider(err) => err,
            JobFailure::Store(_) => {
                warn!(%error, "Store failure; retrying with backoff");
                return (Completion::retry(None), JobOutcome::Retrying { error });
            }
            JobFailure::UnknownAccount => {
                warn!("Job for unregistered account dropped");
                return (Completion::discard(), JobOutcome::Dropped { error });
            }
            JobFailure::Panicked(_) => {
                error!(%error, "Job execution panicked; retrying with backoff");
                return (Completion::retry(None), JobOutcome::Retrying { error });
            }
        };

        match (job.kind(), err) {
            (JobKind::Reauthenticate, ProviderError::Auth(_)) => {
                warn!(%error, "Reauthentication not completed; account stays suspended");
                (Completion::discard(), JobOutcome::Dropped { error })
            }
            (_, ProviderError::Auth(_)) => {
                warn!(%error, "Credentials rejected; suspending account");
                (
                    Completion::suspend().with_successor(SyncJob::reauthenticate(account_id)),
                    JobOutcome::Suspended { error },
                )
            }
            (JobKind::UploadAction { pending_action_id }, err) => {
                self.record_upload_failure(*pending_action_id, err).await
            }
            (kind, ProviderError::StaleCursor) => match kind.folder_id() {
                Some(folder_id) => self.restart_backfill(account_id, folder_id).await,
                None => {
                    error!(%error, "Stale cursor reported for a job without a folder");
                    (Completion::discard(), JobOutcome::Dropped { error })
                }
            },
            (_, ProviderError::Throttled { retry_after }) => {
                warn!(%error, retry_after_ms = ?retry_after.map(|d| d.as_millis()), "Throttled; retrying");
                (Completion::retry(retry_after), JobOutcome::Retrying { error })
            }
            (_, ProviderError::Network(_)) => {
                warn!(%error, "Transient failure; retrying with backoff");
                (Completion::retry(None), JobOutcome::Retrying { error })
            }
            (_, ProviderError::Permanent(_)) => {
                error!(%error, "Permanent failure; dropping job");
                (Completion::discard(), JobOutcome::Dropped { error })
            }
        }
    }

    async fn record_upload_failure(
        &self,
        pending_action_id: PendingActionId,
        err: ProviderError,
    ) -> (Completion, JobOutcome) {
        let retry_after = match &err {
            ProviderError::Throttled { retry_after } => *retry_after,
            _ => None,
        };
        let error = err.to_string();

        let mut action = match self.inner.store.pending_action(&pending_action_id).await {
            Ok(Some(action)) => action,
            Ok(None) => {
                debug!(action = %pending_action_id, "Outbox entry vanished during upload");
                return (Completion::discard(), JobOutcome::Dropped { error });
            }
            Err(e) => {
                return (
                    Completion::retry(retry_after),
                    JobOutcome::Retrying {
                        error: format!("Store error: {e:#}"),
                    },
                );
            }
        };

        // Only failures the server rejected count toward the ceiling
        let transient = err.is_transient();
        let exhausted = if transient {
            action.record_transient_failure(&error);
            false
        } else {
            action.record_failure(&error, self.inner.settings.max_attempts)
        };
        let attempts = action.attempt_count;
        if let Err(e) = self
            .inner
            .store
            .commit(SyncCommit::new(self.inner.clock.now()).update_pending_action(action))
            .await
        {
            return (
                Completion::retry(retry_after),
                JobOutcome::Retrying {
                    error: format!("Store error: {e:#}"),
                },
            );
        }

        if exhausted {
            error!(
                action = %pending_action_id,
                attempts,
                %error,
                "Outbox entry failed permanently"
            );
            (
                Completion::discard_with_failure(),
                JobOutcome::ActionFailed {
                    pending_action_id,
                    error,
                },
            )
        } else {
            warn!(action = %pending_action_id, attempts, transient, %error, "Upload failed; retrying");
            (Completion::retry(retry_after), JobOutcome::Retrying { error })
        }
    }

    async fn restart_backfill(
        &self,
        account_id: AccountId,
        folder_id: &FolderId,
    ) -> (Completion, JobOutcome) {
        let result = async {
            let mut state = self
                .inner
                .store
                .folder_state(&account_id, folder_id)
                .await?
                .unwrap_or_else(|| FolderSyncState::new(folder_id.clone(), account_id));
            state.restart_backfill();
            self.inner
                .store
                .commit(SyncCommit::new(self.inner.clock.now()).upsert_folder_state(state))
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(folder = %folder_id, "Cursor expired; restarting backfill");
                (
                    Completion::discard()
                        .with_successor(SyncJob::fetch_headers(account_id, folder_id.clone(), None)),
                    JobOutcome::CursorReset,
                )
            }
            Err(e) => (
                Completion::retry(None),
                JobOutcome::Retrying {
                    error: format!("Store error: {e:#}"),
                },
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Borrowed per-execution inputs
struct ExecContext<'a> {
    account_id: AccountId,
    provider: &'a dyn IMailProvider,
    token: &'a AccessToken,
    date_floor: Option<DateTime<Utc>>,
}

//! Deduplicating priority job queue
//!
//! The [`JobQueue`] holds every submitted-but-unfinished [`SyncJob`] and
//! decides which one runs next. It owns the per-account
//! [`AccountSyncContext`], because eligibility depends on it.
//!
//! ## Ordering
//!
//! Pending jobs are kept in a `BTreeMap` keyed by `(Reverse(priority), seq)`,
//! where `seq` is a monotonically increasing submission counter. Iterating
//! the map therefore visits jobs by descending priority, then submission
//! order. A retried job re-enters with its original `seq`, so outbox uploads
//! stay FIFO per account across failures.
//!
//! ## Eligibility
//!
//! A pending job is skipped while:
//! - its account already has a job in flight,
//! - its account needs reauthentication and the job is not `Reauthenticate`,
//! - its account is in backoff and the job is not interactive.
//!
//! When only backoff holds work back, [`JobQueue::take_next`] sleeps until
//! the earliest backoff deadline (or until the queue changes).
//!
//! ## Deduplication
//!
//! A dedup key is held from submission until completion. Completion releases
//! the key, inserts successor jobs and clears the in-flight flag under one
//! lock, so a successor with the same key as the finished job is accepted.
//!
//! ## Abandoned leases
//!
//! A [`Lease`] dropped without [`JobQueue::complete`] (a cancelled dispatch,
//! a panicking job task) puts its job back at its original position and
//! clears the account's in-flight flag. When the drop happens during a panic
//! the account also backs off.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::{debug, trace, warn};

use mailsync_core::domain::{newtypes::AccountId, DedupKey, JobKind, Priority, SyncJob};

use crate::backoff::{AccountSyncContext, BackoffPolicy};

// ============================================================================
// Public types
// ============================================================================

/// Result of [`JobQueue::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The job was added to the queue
    Enqueued,
    /// A job with the same dedup key is pending or in flight; dropped
    Duplicate,
    /// The queue is closed
    Closed,
}

/// A job handed out by the queue, to be returned via [`JobQueue::complete`]
///
/// Dropping an uncompleted lease requeues its job.
pub struct Lease {
    job: SyncJob,
    seq: u64,
    queue: Arc<Shared>,
    settled: bool,
}

impl Lease {
    pub fn job(&self) -> &SyncJob {
        &self.job
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("job", &self.job)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let effect = if std::thread::panicking() {
            AccountEffect::Failure { retry_after: None }
        } else {
            AccountEffect::Unchanged
        };
        warn!(job = %self.job, "Job abandoned before completion; requeueing");
        self.queue
            .finish(self.job.clone(), self.seq, true, effect, Vec::new());
    }
}

/// How the account context changes when a job completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountEffect {
    /// Leave failures, backoff and reauthentication untouched
    Unchanged,
    /// Reset failures and backoff; clears the reauthentication flag
    Success,
    /// Count a failure and arm backoff, floored by the retry-after hint
    Failure { retry_after: Option<Duration> },
    /// Suspend the account until it is reauthenticated
    RequireReauthentication,
}

/// What to do with a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    requeue: bool,
    effect: AccountEffect,
    successors: Vec<SyncJob>,
}

impl Completion {
    /// The job succeeded
    pub fn success() -> Self {
        Self {
            requeue: false,
            effect: AccountEffect::Success,
            successors: Vec::new(),
        }
    }

    /// The job failed transiently; put it back and back off the account
    pub fn retry(retry_after: Option<Duration>) -> Self {
        Self {
            requeue: true,
            effect: AccountEffect::Failure { retry_after },
            successors: Vec::new(),
        }
    }

    /// The job failed because of credentials; put it back and suspend the
    /// account
    pub fn suspend() -> Self {
        Self {
            requeue: true,
            effect: AccountEffect::RequireReauthentication,
            successors: Vec::new(),
        }
    }

    /// Forget the job without touching the account context
    pub fn discard() -> Self {
        Self {
            requeue: false,
            effect: AccountEffect::Unchanged,
            successors: Vec::new(),
        }
    }

    /// Forget the job but still count the failure toward backoff
    pub fn discard_with_failure() -> Self {
        Self {
            requeue: false,
            effect: AccountEffect::Failure { retry_after: None },
            successors: Vec::new(),
        }
    }

    /// Adds a job to submit as part of the completion
    pub fn with_successor(mut self, job: SyncJob) -> Self {
        self.successors.push(job);
        self
    }

    /// Adds jobs to submit as part of the completion
    pub fn with_successors(mut self, jobs: impl IntoIterator<Item = SyncJob>) -> Self {
        self.successors.extend(jobs);
        self
    }

    pub fn requeues(&self) -> bool {
        self.requeue
    }

    pub fn effect(&self) -> AccountEffect {
        self.effect
    }

    pub fn successors(&self) -> &[SyncJob] {
        &self.successors
    }
}

/// Account context after a completion was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub context: AccountSyncContext,
    /// Successor submissions that were accepted
    pub successors_enqueued: usize,
}

// ============================================================================
// Queue state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Pending,
    InFlight,
}

enum Pick {
    Ready(SyncJob, u64),
    /// Nothing eligible now; the earliest backoff deadline that would
    /// change that, if any
    Blocked(Option<Instant>),
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<(Reverse<Priority>, u64), SyncJob>,
    keys: HashMap<DedupKey, KeyState>,
    accounts: HashMap<AccountId, AccountSyncContext>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn insert(&mut self, job: SyncJob) -> SubmitOutcome {
        if self.closed {
            return SubmitOutcome::Closed;
        }
        let key = job.dedup_key();
        if self.keys.contains_key(&key) {
            trace!(%key, "Duplicate job dropped");
            return SubmitOutcome::Duplicate;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.keys.insert(key, KeyState::Pending);
        self.pending.insert((Reverse(job.priority()), seq), job);
        SubmitOutcome::Enqueued
    }

    fn is_eligible(&self, job: &SyncJob, now: Instant) -> Result<(), Option<Instant>> {
        let Some(ctx) = self.accounts.get(&job.account_id()) else {
            return Ok(());
        };
        if ctx.in_flight {
            return Err(None);
        }
        if ctx.needs_reauthentication && !matches!(job.kind(), JobKind::Reauthenticate) {
            return Err(None);
        }
        if ctx.in_backoff(now) && !job.bypasses_backoff() {
            return Err(ctx.backoff_until);
        }
        Ok(())
    }

    fn pick(&mut self, now: Instant) -> Pick {
        let mut earliest: Option<Instant> = None;
        let mut chosen = None;

        for (slot, job) in &self.pending {
            match self.is_eligible(job, now) {
                Ok(()) => {
                    chosen = Some(*slot);
                    break;
                }
                Err(Some(deadline)) => {
                    earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                }
                Err(None) => {}
            }
        }

        let Some(slot) = chosen else {
            return Pick::Blocked(earliest);
        };
        let Some(job) = self.pending.remove(&slot) else {
            return Pick::Blocked(earliest);
        };

        self.keys.insert(job.dedup_key(), KeyState::InFlight);
        self.accounts.entry(job.account_id()).or_default().in_flight = true;
        Pick::Ready(job, slot.1)
    }
}

/// Queue state shared with outstanding leases
struct Shared {
    state: Mutex<QueueState>,
    changed: Notify,
    policy: BackoffPolicy,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Settles a leased job: applies the account effect, releases or
    /// requeues the job, submits successors and clears the in-flight flag
    fn finish(
        &self,
        job: SyncJob,
        seq: u64,
        requeue: bool,
        effect: AccountEffect,
        successors: Vec<SyncJob>,
    ) -> CompletionReport {
        let account_id = job.account_id();
        let key = job.dedup_key();

        let report = {
            let mut state = self.lock();
            let now = Instant::now();

            let ctx = state.accounts.entry(account_id).or_default();
            match effect {
                AccountEffect::Unchanged => {}
                AccountEffect::Success => ctx.record_success(),
                AccountEffect::Failure { retry_after } => {
                    ctx.record_failure(&self.policy, retry_after, now);
                }
                AccountEffect::RequireReauthentication => ctx.needs_reauthentication = true,
            }

            if requeue && !state.closed {
                state.keys.insert(key, KeyState::Pending);
                state.pending.insert((Reverse(job.priority()), seq), job);
            } else {
                state.keys.remove(&key);
            }

            let successors_enqueued = successors
                .into_iter()
                .map(|successor| state.insert(successor))
                .filter(|outcome| *outcome == SubmitOutcome::Enqueued)
                .count();

            let ctx = state.accounts.entry(account_id).or_default();
            ctx.in_flight = false;

            CompletionReport {
                context: ctx.clone(),
                successors_enqueued,
            }
        };

        self.changed.notify_waiters();
        report
    }
}

// ============================================================================
// JobQueue
// ============================================================================

/// The scheduler's job queue
///
/// All state lives behind one mutex; waiters are woken through a
/// [`Notify`] whenever the queue or an account context changes.
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                changed: Notify::new(),
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.shared.lock()
    }

    fn lease(&self, job: SyncJob, seq: u64) -> Lease {
        Lease {
            job,
            seq,
            queue: Arc::clone(&self.shared),
            settled: false,
        }
    }

    /// Adds a job unless its dedup key is already pending or in flight
    pub fn submit(&self, job: SyncJob) -> SubmitOutcome {
        let outcome = {
            let mut state = self.lock();
            let description = job.to_string();
            let outcome = state.insert(job);
            if outcome == SubmitOutcome::Enqueued {
                debug!(job = %description, pending = state.pending.len(), "Job enqueued");
            }
            outcome
        };
        if outcome == SubmitOutcome::Enqueued {
            self.shared.changed.notify_waiters();
        }
        outcome
    }

    /// Waits for the next eligible job and marks its account in flight
    ///
    /// Returns `None` once the queue is closed. Cancel-safe: a lease is only
    /// created in the same synchronous step that returns it.
    pub async fn take_next(&self) -> Option<Lease> {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                match state.pick(Instant::now()) {
                    Pick::Ready(job, seq) => return Some(self.lease(job, seq)),
                    Pick::Blocked(deadline) => deadline,
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Returns the next eligible job without waiting
    pub fn try_take_next(&self) -> Option<Lease> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        match state.pick(Instant::now()) {
            Pick::Ready(job, seq) => Some(self.lease(job, seq)),
            Pick::Blocked(_) => None,
        }
    }

    /// Finishes a leased job
    ///
    /// Under one lock: applies the account effect, releases or requeues the
    /// job, submits successors and clears the account's in-flight flag.
    pub fn complete(&self, mut lease: Lease, completion: Completion) -> CompletionReport {
        lease.settled = true;
        self.shared.finish(
            lease.job.clone(),
            lease.seq,
            completion.requeue,
            completion.effect,
            completion.successors,
        )
    }

    /// Clears the reauthentication flag of an account
    ///
    /// A pending `Reauthenticate` job is withdrawn, since the user already
    /// completed consent out of band.
    pub fn reauthenticated(&self, account_id: &AccountId) {
        {
            let mut state = self.lock();
            if let Some(ctx) = state.accounts.get_mut(account_id) {
                ctx.needs_reauthentication = false;
            }
            let reauth_key = SyncJob::reauthenticate(*account_id).dedup_key();
            if state.keys.get(&reauth_key) == Some(&KeyState::Pending) {
                state.keys.remove(&reauth_key);
                state.pending.retain(|_, job| {
                    job.account_id() != *account_id
                        || !matches!(job.kind(), JobKind::Reauthenticate)
                });
            }
        }
        self.shared.changed.notify_waiters();
    }

    /// Drops every pending job and the context of an account
    ///
    /// A job already in flight still completes; its completion is accepted
    /// but its successors are dropped together with the account.
    pub fn remove_account(&self, account_id: &AccountId) -> usize {
        let mut state = self.lock();
        let before = state.pending.len();
        let QueueState { pending, keys, .. } = &mut *state;
        pending.retain(|_, job| {
            let keep = job.account_id() != *account_id;
            if !keep {
                keys.remove(&job.dedup_key());
            }
            keep
        });
        let removed = before - state.pending.len();
        if state
            .accounts
            .get(account_id)
            .is_some_and(|ctx| !ctx.in_flight)
        {
            state.accounts.remove(account_id);
        }
        removed
    }

    /// Stops the queue: wakes all waiters and rejects further submissions
    pub fn close(&self) {
        self.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of pending (not in-flight) jobs
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending jobs in dispatch order, ignoring eligibility
    pub fn pending_jobs(&self) -> Vec<SyncJob> {
        self.lock().pending.values().cloned().collect()
    }

    /// Returns true if a job with this key is pending or in flight
    pub fn contains(&self, key: &DedupKey) -> bool {
        self.lock().keys.contains_key(key)
    }

    /// Snapshot of an account's sync context
    pub fn context(&self, account_id: &AccountId) -> AccountSyncContext {
        self.lock()
            .accounts
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

//! Polling lifecycle manager
//!
//! Decides *when* background work is submitted, following the host
//! application's lifecycle:
//!
//! ```text
//!            Backgrounded                         AccountAdded
//!   Active ───────────────→ Passive      Active/Passive ─────────→ InitialSync
//!     ▲      ←───────────────                         ◀─────────
//!     │       Foregrounded                 every initial-syncing account
//!     │                                    completed or timed out
//! interval timer                 periodic host wake
//! ```
//!
//! The state machine itself is the pure function [`transition`]; it returns
//! the next state plus a list of [`PollingEffect`]s and touches nothing.
//! [`PollingManager`] owns the current state and applies effects against the
//! controller, the store and the host.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::mpsc,
    time::{Instant, Interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mailsync_core::{
    config::Config,
    domain::{newtypes::AccountId, FolderRole, SyncJob},
    ports::{IClock, IHostScheduler, ISyncStore, IUserPreferences},
};

use crate::controller::SyncController;

// ============================================================================
// State machine
// ============================================================================

/// Lifecycle state of the poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollingState {
    /// App in the foreground: refresh on a short interval timer
    Active,
    /// App in the background: refresh on periodic host wakes
    Passive,
    /// At least one new account is downloading its initial history
    InitialSync {
        accounts: BTreeSet<AccountId>,
        /// Whether the app is currently in the foreground
        foreground: bool,
    },
}

impl PollingState {
    /// State for a freshly started process
    pub fn initial(foreground: bool) -> Self {
        if foreground {
            PollingState::Active
        } else {
            PollingState::Passive
        }
    }

    /// Effects that establish this state from nothing
    pub fn entry_effects(&self) -> Vec<PollingEffect> {
        match self {
            PollingState::Active => vec![PollingEffect::StartTimer],
            PollingState::Passive => vec![PollingEffect::RegisterPeriodicWake],
            PollingState::InitialSync { accounts, .. } => {
                let mut effects = vec![PollingEffect::StartTimer, PollingEffect::RequestForeground];
                effects.extend(accounts.iter().copied().map(PollingEffect::BeginInitialSync));
                effects
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PollingState::Active => "active",
            PollingState::Passive => "passive",
            PollingState::InitialSync { .. } => "initial_sync",
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleSignal {
    Foregrounded,
    Backgrounded,
    AccountAdded(AccountId),
    /// The host's periodic background wake fired
    PeriodicWake,
    /// The interval timer fired
    Tick,
    /// Every critical folder of the account finished backfill
    InitialSyncCompleted(AccountId),
    /// The account's initial sync ran past its wall-time guard
    InitialSyncElapsed(AccountId),
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingEffect {
    StartTimer,
    StopTimer,
    RegisterPeriodicWake,
    CancelPeriodicWake,
    RequestForeground,
    ReleaseForeground,
    /// Read the history preference, set the date floor, list folders
    BeginInitialSync(AccountId),
    /// Submit refresh jobs for every account
    Refresh,
    /// Check initial-syncing accounts for completion or timeout
    CheckInitialSync,
}

/// Computes the next state and the effects to apply
///
/// Signals that make no sense in the current state (a stale timer tick
/// after backgrounding, a duplicate foreground notification) are ignored.
pub fn transition(
    state: &PollingState,
    signal: &LifecycleSignal,
) -> (PollingState, Vec<PollingEffect>) {
    use LifecycleSignal as S;
    use PollingEffect as E;

    match (state, signal) {
        (PollingState::Active, S::Backgrounded) => (
            PollingState::Passive,
            vec![E::StopTimer, E::RegisterPeriodicWake],
        ),
        (PollingState::Active, S::Tick) => (PollingState::Active, vec![E::Refresh]),
        (PollingState::Active, S::AccountAdded(account)) => (
            PollingState::InitialSync {
                accounts: BTreeSet::from([*account]),
                foreground: true,
            },
            vec![E::BeginInitialSync(*account), E::RequestForeground],
        ),

        (PollingState::Passive, S::Foregrounded) => (
            PollingState::Active,
            vec![E::CancelPeriodicWake, E::StartTimer],
        ),
        (PollingState::Passive, S::PeriodicWake) => (PollingState::Passive, vec![E::Refresh]),
        (PollingState::Passive, S::AccountAdded(account)) => (
            PollingState::InitialSync {
                accounts: BTreeSet::from([*account]),
                foreground: false,
            },
            vec![
                E::CancelPeriodicWake,
                E::StartTimer,
                E::BeginInitialSync(*account),
                E::RequestForeground,
            ],
        ),

        (PollingState::InitialSync { accounts, .. }, S::Foregrounded) => (
            PollingState::InitialSync {
                accounts: accounts.clone(),
                foreground: true,
            },
            Vec::new(),
        ),
        (PollingState::InitialSync { accounts, .. }, S::Backgrounded) => (
            PollingState::InitialSync {
                accounts: accounts.clone(),
                foreground: false,
            },
            Vec::new(),
        ),
        (
            PollingState::InitialSync {
                accounts,
                foreground,
            },
            S::AccountAdded(account),
        ) => {
            let mut accounts = accounts.clone();
            let effects = if accounts.insert(*account) {
                vec![E::BeginInitialSync(*account)]
            } else {
                Vec::new()
            };
            (
                PollingState::InitialSync {
                    accounts,
                    foreground: *foreground,
                },
                effects,
            )
        }
        (PollingState::InitialSync { .. }, S::Tick) => {
            (state.clone(), vec![E::Refresh, E::CheckInitialSync])
        }
        (
            PollingState::InitialSync {
                accounts,
                foreground,
            },
            S::InitialSyncCompleted(account) | S::InitialSyncElapsed(account),
        ) => {
            let mut accounts = accounts.clone();
            if !accounts.remove(account) {
                return (state.clone(), Vec::new());
            }
            if !accounts.is_empty() {
                return (
                    PollingState::InitialSync {
                        accounts,
                        foreground: *foreground,
                    },
                    Vec::new(),
                );
            }
            if *foreground {
                (PollingState::Active, vec![E::ReleaseForeground])
            } else {
                (
                    PollingState::Passive,
                    vec![E::ReleaseForeground, E::StopTimer, E::RegisterPeriodicWake],
                )
            }
        }

        _ => (state.clone(), Vec::new()),
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Poller parameters derived from [`Config`]
#[derive(Debug, Clone)]
pub struct PollingSettings {
    pub active_interval: Duration,
    pub passive_wake_interval: Duration,
    pub folder_list_interval: Duration,
    pub critical_roles: Vec<FolderRole>,
    pub default_initial_sync_days: u32,
    pub initial_sync_max_duration: Duration,
}

impl PollingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            active_interval: config.polling.active_interval(),
            passive_wake_interval: config.polling.passive_wake_interval(),
            folder_list_interval: config.polling.folder_list_interval(),
            critical_roles: config.polling.critical_roles.clone(),
            default_initial_sync_days: config.initial_sync.default_duration_days,
            initial_sync_max_duration: config.initial_sync.max_duration(),
        }
    }
}

/// Applies lifecycle signals to the state machine and executes its effects
pub struct PollingManager {
    state: PollingState,
    controller: SyncController,
    store: Arc<dyn ISyncStore>,
    host: Arc<dyn IHostScheduler>,
    preferences: Arc<dyn IUserPreferences>,
    clock: Arc<dyn IClock>,
    settings: PollingSettings,
    ticker: Option<Interval>,
    initial_sync_deadlines: HashMap<AccountId, Instant>,
    last_folder_list: HashMap<AccountId, Instant>,
}

impl PollingManager {
    pub fn new(
        config: &Config,
        controller: SyncController,
        store: Arc<dyn ISyncStore>,
        host: Arc<dyn IHostScheduler>,
        preferences: Arc<dyn IUserPreferences>,
        clock: Arc<dyn IClock>,
        foreground: bool,
    ) -> Self {
        Self {
            state: PollingState::initial(foreground),
            controller,
            store,
            host,
            preferences,
            clock,
            settings: PollingSettings::from_config(config),
            ticker: None,
            initial_sync_deadlines: HashMap::new(),
            last_folder_list: HashMap::new(),
        }
    }

    pub fn state(&self) -> &PollingState {
        &self.state
    }

    /// Returns true while the interval timer is armed
    pub fn timer_running(&self) -> bool {
        self.ticker.is_some()
    }

    /// Applies the entry effects of the current state
    pub async fn start(&mut self) {
        info!(state = self.state.name(), "Polling manager starting");
        let effects = self.state.entry_effects();
        let mut follow_ups = VecDeque::new();
        for effect in effects {
            self.apply(effect, &mut follow_ups).await;
        }
        self.drain(follow_ups).await;
    }

    /// Feeds one signal through the state machine and applies its effects
    ///
    /// Effects may produce further signals (initial sync completion); those
    /// are processed before this returns.
    pub async fn handle(&mut self, signal: LifecycleSignal) {
        self.drain(VecDeque::from([signal])).await;
    }

    async fn drain(&mut self, mut signals: VecDeque<LifecycleSignal>) {
        while let Some(signal) = signals.pop_front() {
            let (next, effects) = transition(&self.state, &signal);
            if next != self.state {
                info!(
                    from = self.state.name(),
                    to = next.name(),
                    signal = ?signal,
                    "Polling state changed"
                );
            }
            self.state = next;
            for effect in effects {
                self.apply(effect, &mut signals).await;
            }
        }
    }

    /// Runs until `shutdown` fires or the signal channel closes
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<LifecycleSignal>,
        shutdown: CancellationToken,
    ) {
        self.start().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!("Lifecycle channel closed");
                        break;
                    };
                    self.handle(signal).await;
                }
                _ = next_tick(&mut self.ticker) => {
                    self.handle(LifecycleSignal::Tick).await;
                }
            }
        }

        if matches!(self.state, PollingState::InitialSync { .. }) {
            if let Err(e) = self.host.release_foreground_execution().await {
                warn!(error = %format!("{e:#}"), "Failed to release foreground execution");
            }
        }
        info!("Polling manager stopped");
    }

    async fn apply(&mut self, effect: PollingEffect, signals: &mut VecDeque<LifecycleSignal>) {
        debug!(effect = ?effect, "Applying polling effect");
        match effect {
            PollingEffect::StartTimer => {
                let period = self.settings.active_interval;
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
            }
            PollingEffect::StopTimer => self.ticker = None,
            PollingEffect::RegisterPeriodicWake => {
                let interval = self.settings.passive_wake_interval;
                if let Err(e) = self.host.register_periodic_wake(interval).await {
                    warn!(error = %format!("{e:#}"), "Failed to register periodic wake");
                }
            }
            PollingEffect::CancelPeriodicWake => {
                if let Err(e) = self.host.cancel_periodic_wake().await {
                    warn!(error = %format!("{e:#}"), "Failed to cancel periodic wake");
                }
            }
            PollingEffect::RequestForeground => {
                if let Err(e) = self.host.request_foreground_execution("initial sync").await {
                    warn!(error = %format!("{e:#}"), "Failed to request foreground execution");
                }
            }
            PollingEffect::ReleaseForeground => {
                if let Err(e) = self.host.release_foreground_execution().await {
                    warn!(error = %format!("{e:#}"), "Failed to release foreground execution");
                }
            }
            PollingEffect::BeginInitialSync(account_id) => {
                self.begin_initial_sync(account_id, signals).await
            }
            PollingEffect::Refresh => self.refresh().await,
            PollingEffect::CheckInitialSync => self.check_initial_sync(signals).await,
        }
    }

    async fn begin_initial_sync(
        &mut self,
        account_id: AccountId,
        signals: &mut VecDeque<LifecycleSignal>,
    ) {
        let days = match self.preferences.initial_sync_duration_days(&account_id).await {
            Ok(Some(days)) => days,
            Ok(None) => self.settings.default_initial_sync_days,
            Err(e) => {
                warn!(%account_id, error = %format!("{e:#}"), "Failed to read history preference");
                self.settings.default_initial_sync_days
            }
        };
        let floor = self.clock.now() - chrono::Duration::days(i64::from(days));
        if let Err(e) = self.controller.set_date_floor(&account_id, floor) {
            // Without a deadline the account would hold initial sync open
            warn!(%account_id, error = %e, "Cannot start initial sync; abandoning it");
            signals.push_back(LifecycleSignal::InitialSyncElapsed(account_id));
            return;
        }

        self.submit(SyncJob::sync_folder_list(account_id));
        let now = Instant::now();
        self.last_folder_list.insert(account_id, now);
        self.initial_sync_deadlines
            .insert(account_id, now + self.settings.initial_sync_max_duration);
        info!(%account_id, days, %floor, "Initial sync started");
    }

    async fn refresh(&mut self) {
        let now = Instant::now();
        for account_id in self.controller.registered_accounts() {
            let folders = match self.store.folders(&account_id).await {
                Ok(folders) => folders,
                Err(e) => {
                    warn!(%account_id, error = %format!("{e:#}"), "Failed to load folders");
                    continue;
                }
            };

            let mut submitted = 0usize;
            for folder in folders
                .into_iter()
                .filter(|f| self.settings.critical_roles.contains(&f.role))
            {
                self.submit(SyncJob::fetch_headers(account_id, folder.id, None));
                submitted += 1;
            }

            let folder_list_due = self
                .last_folder_list
                .get(&account_id)
                .map_or(true, |last| now.duration_since(*last) >= self.settings.folder_list_interval);
            if folder_list_due {
                self.submit(SyncJob::sync_folder_list(account_id));
                self.last_folder_list.insert(account_id, now);
            }
            debug!(%account_id, folders = submitted, folder_list_due, "Refresh submitted");
        }
    }

    async fn check_initial_sync(&mut self, signals: &mut VecDeque<LifecycleSignal>) {
        let PollingState::InitialSync { accounts, .. } = &self.state else {
            return;
        };
        let now = Instant::now();
        for account_id in accounts.clone() {
            let timed_out = self
                .initial_sync_deadlines
                .get(&account_id)
                .is_some_and(|deadline| now >= *deadline);
            if timed_out {
                warn!(%account_id, "Initial sync exceeded its time limit");
                self.initial_sync_deadlines.remove(&account_id);
                signals.push_back(LifecycleSignal::InitialSyncElapsed(account_id));
            } else if self.initial_sync_complete(&account_id).await {
                info!(%account_id, "Initial sync complete");
                self.initial_sync_deadlines.remove(&account_id);
                signals.push_back(LifecycleSignal::InitialSyncCompleted(account_id));
            }
        }
    }

    /// An account is done once it has folders and every critical folder
    /// finished its backfill
    async fn initial_sync_complete(&self, account_id: &AccountId) -> bool {
        let result = async {
            let folders = self.store.folders(account_id).await?;
            let states: HashMap<_, _> = self
                .store
                .folder_states(account_id)
                .await?
                .into_iter()
                .map(|state| (state.folder_id.clone(), state))
                .collect();
            anyhow::Ok(
                !folders.is_empty()
                    && folders
                        .iter()
                        .filter(|f| self.settings.critical_roles.contains(&f.role))
                        .all(|f| states.get(&f.id).is_some_and(|s| s.is_backfill_complete())),
            )
        }
        .await;

        result.unwrap_or_else(|e| {
            warn!(%account_id, error = %format!("{e:#}"), "Failed to check initial sync");
            false
        })
    }

    fn submit(&self, job: SyncJob) {
        if let Err(e) = self.controller.submit(job) {
            warn!(error = %e, "Failed to submit polling job");
        }
    }
}

/// Waits for the next timer tick, or forever when no timer is armed
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

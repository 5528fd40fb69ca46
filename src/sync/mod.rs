//! Client-side synchronization.
//!
//! A `SyncManager` keeps one identity's view of the ledger-derived state
//! fresh: it polls on an interval, polls early when a relevant fan-out event
//! arrives, retries transient read failures with backoff, and ends the
//! session when a read reports that the identity is gone.

pub mod backoff;
pub mod source;

pub use backoff::{AdaptiveInterval, BackoffPolicy};
pub use source::{AccountSnapshot, HttpSyncSource, SyncError, SyncSource};

use futures_util::FutureExt;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_stream::StreamExt;

use crate::{
    constants::{
        SYNC_CONFIRM_POLL_MS, SYNC_CONFIRM_TIMEOUT_SECS, SYNC_LEADERBOARD_LIMIT,
        SYNC_POLL_INTERVAL_MS, SYNC_POLL_TIMEOUT_MS,
    },
    models::{LeaderboardEntry, MatchStakeTotals},
    services::fanout::{DomainEvent, EventStream},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshKey {
    Account,
    MatchStakes(String),
    Leaderboard,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    pub identity: Option<String>,
    pub account: AccountSnapshot,
    pub match_totals: BTreeMap<String, MatchStakeTotals>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub is_loading: bool,
    pub last_sync: Option<Instant>,
    pub last_error: Option<String>,
    pub connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollSchedule {
    Fixed(Duration),
    Adaptive(AdaptiveInterval),
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub schedule: PollSchedule,
    /// Upper bound on one whole poll cycle, retries included.
    pub poll_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub confirm_poll: Duration,
    pub confirm_timeout: Duration,
    pub auto_refresh_on_confirm: bool,
    pub leaderboard_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            schedule: PollSchedule::Fixed(Duration::from_millis(SYNC_POLL_INTERVAL_MS)),
            poll_timeout: Duration::from_millis(SYNC_POLL_TIMEOUT_MS),
            backoff: BackoffPolicy::default(),
            confirm_poll: Duration::from_millis(SYNC_CONFIRM_POLL_MS),
            confirm_timeout: Duration::from_secs(SYNC_CONFIRM_TIMEOUT_SECS),
            auto_refresh_on_confirm: true,
            leaderboard_limit: SYNC_LEADERBOARD_LIMIT,
        }
    }
}

impl SyncSettings {
    pub fn adaptive() -> Self {
        Self {
            schedule: PollSchedule::Adaptive(AdaptiveInterval::default()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Synced,
    /// Another poll was already in flight.
    Skipped,
    NotConnected,
    Failed(SyncError),
    Disconnected(SyncError),
}

struct Fresh {
    account: AccountSnapshot,
    match_totals: BTreeMap<String, MatchStakeTotals>,
    leaderboard: Vec<LeaderboardEntry>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct Shared {
    source: Arc<dyn SyncSource>,
    settings: SyncSettings,
    state: watch::Sender<SyncState>,
    in_flight: AtomicBool,
    /// Bumped on every connect and disconnect; results from an older session are dropped.
    session: AtomicU64,
    last_activity: Mutex<Instant>,
    activity: Notify,
}

impl Shared {
    fn identity(&self) -> Option<String> {
        self.state.borrow().identity.clone()
    }

    fn last_activity(&self) -> MutexGuard<'_, Instant> {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_interval(&self) -> Duration {
        match self.settings.schedule {
            PollSchedule::Fixed(every) => every,
            PollSchedule::Adaptive(adaptive) => {
                adaptive.interval(*self.last_activity(), Instant::now())
            }
        }
    }

    fn end_session(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            let was_connected = state.connected || state.identity.is_some();
            *state = SyncState::default();
            was_connected
        });
    }

    /// Records a failed read. Returns true when the session was ended.
    fn record_failure(&self, session: u64, err: &SyncError) -> bool {
        if self.session.load(Ordering::SeqCst) != session {
            return false;
        }
        if err.is_terminal() {
            tracing::warn!("Sync identity lost, disconnecting: {}", err);
            self.end_session();
            return true;
        }
        tracing::warn!("Sync read failed: {}", err);
        self.state.send_modify(|state| {
            state.last_error = Some(err.to_string());
            state.is_loading = false;
        });
        false
    }

    async fn read_all(&self, identity: &str) -> Result<Fresh, SyncError> {
        let source = self.source.as_ref();
        let policy = self.settings.backoff;
        let limit = self.settings.leaderboard_limit;

        let account = policy.retry(move || source.account(identity)).await?;
        let leaderboard = policy.retry(move || source.leaderboard(limit)).await?;

        let mut match_totals = BTreeMap::new();
        for match_id in account.stakes.keys() {
            let id = match_id.as_str();
            if let Some(totals) = policy.retry(move || source.stake_totals(id)).await? {
                match_totals.insert(match_id.clone(), totals);
            }
        }

        Ok(Fresh {
            account,
            match_totals,
            leaderboard,
        })
    }

    async fn poll(&self) -> PollOutcome {
        let Some(identity) = self.identity() else {
            return PollOutcome::NotConnected;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync poll skipped, previous poll still running");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);
        let session = self.session.load(Ordering::SeqCst);

        self.state.send_modify(|state| state.is_loading = true);
        let result = match tokio::time::timeout(self.settings.poll_timeout, self.read_all(&identity))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::Transient(format!(
                "poll timed out after {:?}",
                self.settings.poll_timeout
            ))),
        };

        if self.session.load(Ordering::SeqCst) != session {
            return PollOutcome::NotConnected;
        }

        match result {
            Ok(fresh) => {
                self.state.send_modify(|state| {
                    state.account = fresh.account;
                    state.match_totals = fresh.match_totals;
                    state.leaderboard = fresh.leaderboard;
                    state.last_sync = Some(Instant::now());
                    state.last_error = None;
                    state.is_loading = false;
                });
                PollOutcome::Synced
            }
            Err(err) => {
                if self.record_failure(session, &err) {
                    PollOutcome::Disconnected(err)
                } else {
                    PollOutcome::Failed(err)
                }
            }
        }
    }

    fn is_relevant(&self, event: &DomainEvent) -> bool {
        let state = self.state.borrow();
        match event {
            DomainEvent::MatchSettled { .. } => true,
            DomainEvent::StakeConfirmed {
                match_id, staker, ..
            } => {
                state.identity.as_deref() == Some(staker.as_str())
                    || state.account.stakes.contains_key(match_id)
            }
        }
    }
}

async fn next_event(events: &mut Option<EventStream>) -> Option<DomainEvent> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn run_loop(shared: Arc<Shared>, mut events: Option<EventStream>, session: u64) {
    let mut next_due = Instant::now() + shared.next_interval();
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_due) => {}
            _ = shared.activity.notified() => {
                // Activity can only bring the next poll closer.
                next_due = next_due.min(Instant::now() + shared.next_interval());
                continue;
            }
            event = next_event(&mut events) => match event {
                Some(event) if shared.is_relevant(&event) => {
                    tracing::debug!("Sync poll triggered by {}", event.topic());
                    if let Some(stream) = events.as_mut() {
                        // Collapse a burst of events into one poll.
                        while let Some(Some(_)) = stream.next().now_or_never() {}
                    }
                }
                Some(_) => continue,
                None => {
                    events = None;
                    continue;
                }
            },
        }

        if shared.session.load(Ordering::SeqCst) != session {
            break;
        }
        match shared.poll().await {
            PollOutcome::Disconnected(_) | PollOutcome::NotConnected => break,
            _ => {}
        }
        next_due = Instant::now() + shared.next_interval();
    }
    tracing::debug!("Sync loop stopped");
}

pub struct SyncManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(source: Arc<dyn SyncSource>, settings: SyncSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                settings,
                state: watch::channel(SyncState::default()).0,
                in_flight: AtomicBool::new(false),
                session: AtomicU64::new(0),
                last_activity: Mutex::new(Instant::now()),
                activity: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts a session for `identity`: one sync right away, then a background
    /// loop. `events` lets the loop poll early on relevant fan-out events.
    pub async fn connect(
        &self,
        identity: &str,
        events: Option<EventStream>,
    ) -> Result<(), SyncError> {
        self.disconnect();
        let session = self.shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.last_activity() = Instant::now();
        self.shared.state.send_modify(|state| {
            state.identity = Some(identity.to_string());
            state.connected = true;
            state.last_error = None;
        });

        if let PollOutcome::Disconnected(err) = self.shared.poll().await {
            return Err(err);
        }

        let handle = tokio::spawn(run_loop(self.shared.clone(), events, session));
        *self.task() = Some(handle);
        tracing::info!("Sync session started for {}", identity);
        Ok(())
    }

    /// Stops polling and drops every cached value.
    pub fn disconnect(&self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
        self.shared.end_session();
    }

    pub async fn poll(&self) -> PollOutcome {
        self.shared.poll().await
    }

    pub async fn refresh(&self, key: RefreshKey) -> Result<(), SyncError> {
        let identity = self
            .shared
            .identity()
            .ok_or_else(|| SyncError::Terminal("no identity connected".to_string()))?;
        let session = self.shared.session.load(Ordering::SeqCst);
        let source = self.shared.source.as_ref();
        let policy = self.shared.settings.backoff;

        let result = match &key {
            RefreshKey::Account => {
                let id = identity.as_str();
                policy
                    .retry(move || source.account(id))
                    .await
                    .map(|account| {
                        self.apply(session, |state| state.account = account);
                    })
            }
            RefreshKey::MatchStakes(match_id) => {
                let id = match_id.as_str();
                policy
                    .retry(move || source.stake_totals(id))
                    .await
                    .map(|totals| {
                        self.apply(session, |state| match totals {
                            Some(totals) => {
                                state.match_totals.insert(id.to_string(), totals);
                            }
                            None => {
                                state.match_totals.remove(id);
                            }
                        });
                    })
            }
            RefreshKey::Leaderboard => {
                let limit = self.shared.settings.leaderboard_limit;
                policy
                    .retry(move || source.leaderboard(limit))
                    .await
                    .map(|entries| {
                        self.apply(session, |state| state.leaderboard = entries);
                    })
            }
        };

        if let Err(err) = &result {
            self.shared.record_failure(session, err);
        }
        result
    }

    fn apply(&self, session: u64, update: impl FnOnce(&mut SyncState)) {
        if self.shared.session.load(Ordering::SeqCst) != session {
            return;
        }
        self.shared.state.send_modify(update);
    }

    /// Polls the ledger until a proof for `txid` exists or the timeout
    /// (`confirm_timeout` when `None`) passes. Returns whether the
    /// transaction was confirmed.
    pub async fn wait_for_confirmation(
        &self,
        txid: &str,
        timeout: Option<Duration>,
    ) -> Result<bool, SyncError> {
        let deadline =
            Instant::now() + timeout.unwrap_or(self.shared.settings.confirm_timeout);
        loop {
            match tokio::time::timeout_at(deadline, self.shared.source.proof_confirmed(txid)).await {
                Err(_) => return Ok(false),
                Ok(Ok(true)) => {
                    if self.shared.settings.auto_refresh_on_confirm {
                        self.shared.poll().await;
                    }
                    return Ok(true);
                }
                Ok(Ok(false)) => {}
                Ok(Err(err)) if err.is_terminal() => {
                    self.shared
                        .record_failure(self.shared.session.load(Ordering::SeqCst), &err);
                    return Err(err);
                }
                Ok(Err(err)) => tracing::debug!("Confirmation check for {} failed: {}", txid, err),
            }

            if Instant::now() + self.shared.settings.confirm_poll >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.shared.settings.confirm_poll).await;
        }
    }

    /// Marks user activity; an adaptive schedule narrows back to its minimum.
    pub fn record_activity(&self) {
        *self.shared.last_activity() = Instant::now();
        self.shared.activity.notify_one();
    }

    pub fn state(&self) -> SyncState {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().connected
    }

    /// Amount the connected identity has staked on `match_id`.
    pub fn stake_for(&self, match_id: &str) -> i64 {
        self.shared
            .state
            .borrow()
            .account
            .stakes
            .get(match_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_state_fresh(&self, max_age: Duration) -> bool {
        self.shared
            .state
            .borrow()
            .last_sync
            .is_some_and(|at| at.elapsed() < max_age)
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        if let Some(handle) = self.task().take() {
            handle.abort();
        }
    }
}

//! Background synchronization of the local chain with the ingest endpoint.
//!
//! One cycle reads the oldest unsynced events, submits them as a batch and
//! advances the ledger's sync frontier to whatever the endpoint acknowledged.
//! Network and storage hiccups are retried with exponential backoff and never
//! surface to the user; once they outlast `max_retries` the breach is logged
//! and flagged in [`SyncStatus`]. A diverged or tampered chain is escalated and
//! stops the worker.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::instrument;

use tally_core::{Clock, SystemClock};
use tally_events::{ChainHash, Rejection, SyncBatch};
use tally_ledger::{LedgerError, LocalLedger};

use crate::offline::{ConnectivityState, OfflineMode};
use crate::sync::{IngestTransport, TransportError};

/// Tuning for the sync loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub retry_base_delay: Duration,
    pub max_backoff: Duration,
    /// Consecutive failures tolerated before the status is flagged.
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            sync_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
            retry_base_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            max_retries: 5,
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = max;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Defaults overridden by the `TALLY_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>(&lookup, "TALLY_SYNC_BATCH_SIZE") {
            config = config.with_batch_size(n);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TALLY_SYNC_INTERVAL_SECS") {
            config.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TALLY_SYNC_TIMEOUT_SECS") {
            config.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TALLY_SYNC_RETRY_DELAY_SECS") {
            config.retry_base_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "TALLY_SYNC_MAX_BACKOFF_SECS") {
            config.max_backoff = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "TALLY_SYNC_MAX_RETRIES") {
            config.max_retries = n;
        }

        config
    }

    /// Delay before the next attempt after `failures` consecutive failures:
    /// `retry_base_delay * 2^(failures - 1)`, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid sync setting");
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("chain diverged from the ingest endpoint: expected previous hash {expected}, sent {received}")]
    ChainDivergence {
        expected: ChainHash,
        received: ChainHash,
    },

    #[error("batch rejected: {0}")]
    Rejected(Rejection),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("ingest endpoint did not answer within {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl SyncError {
    /// Transient failures are retried with backoff; everything else needs an
    /// operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Ledger(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<Rejection> for SyncError {
    fn from(value: Rejection) -> Self {
        match value {
            Rejection::ChainDivergence {
                expected_previous_hash,
                received_previous_hash,
            } => Self::ChainDivergence {
                expected: expected_previous_hash,
                received: received_previous_hash,
            },
            other => Self::Rejected(other),
        }
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was waiting to be synced.
    Idle,
    /// The endpoint acknowledged a prefix of the batch.
    Acknowledged {
        submitted: usize,
        acknowledged: u64,
        frontier: u64,
    },
    /// The endpoint answered without acknowledging anything.
    Unacknowledged { submitted: usize },
}

impl CycleOutcome {
    /// A full batch went through, so more events are probably waiting.
    pub fn should_drain(&self, batch_size: usize) -> bool {
        matches!(
            self,
            Self::Acknowledged { submitted, acknowledged, .. }
                if *submitted >= batch_size && *acknowledged as usize == *submitted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AttemptOutcome {
    Idle,
    Acknowledged { submitted: usize, acknowledged: u64 },
    Unacknowledged { submitted: usize },
    Failed { error: String, retryable: bool },
}

impl AttemptOutcome {
    fn from_result(result: &Result<CycleOutcome, SyncError>) -> Self {
        match result {
            Ok(CycleOutcome::Idle) => Self::Idle,
            Ok(CycleOutcome::Acknowledged {
                submitted,
                acknowledged,
                ..
            }) => Self::Acknowledged {
                submitted: *submitted,
                acknowledged: *acknowledged,
            },
            Ok(CycleOutcome::Unacknowledged { submitted }) => Self::Unacknowledged {
                submitted: *submitted,
            },
            Err(e) => Self::Failed {
                error: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAttempt {
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
}

/// Running totals shared between the worker and diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub last_attempt: Option<SyncAttempt>,
    pub last_success: Option<DateTime<Utc>>,
    pub total_synced: u64,
    pub total_failed: u64,
    pub consecutive_failures: u32,
    /// Set once the worker stopped on an error that needs an operator.
    pub escalated: Option<String>,
    /// Consecutive failures passed `max_retries`; cleared by the next success.
    pub retries_exhausted: bool,
}

pub type SharedSyncStatus = Arc<RwLock<SyncStatus>>;

/// Pushes the ledger's unsynced events to the ingest endpoint.
pub struct SyncWorker<L, T> {
    ledger: L,
    transport: T,
    config: SyncConfig,
    offline: OfflineMode,
    status: SharedSyncStatus,
    clock: Arc<dyn Clock>,
    cycle_lock: Mutex<()>,
}

impl<L: LocalLedger, T: IngestTransport> SyncWorker<L, T> {
    pub fn new(ledger: L, transport: T, config: SyncConfig) -> Self {
        Self {
            ledger,
            transport,
            config,
            offline: OfflineMode::default(),
            status: SharedSyncStatus::default(),
            clock: Arc::new(SystemClock),
            cycle_lock: Mutex::new(()),
        }
    }

    pub fn with_offline_mode(mut self, offline: OfflineMode) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn offline_mode(&self) -> &OfflineMode {
        &self.offline
    }

    pub fn status(&self) -> SharedSyncStatus {
        self.status.clone()
    }

    /// Run exactly one sync cycle.
    ///
    /// Cycles never overlap. The ledger is not locked while waiting on the
    /// endpoint, so event creation continues during a slow request.
    #[instrument(
        skip(self),
        fields(
            device_id = %self.ledger.scope().device_id,
            tenant_id = %self.ledger.scope().tenant_id,
        ),
        err
    )]
    pub async fn run_cycle(&self) -> Result<CycleOutcome, SyncError> {
        let _cycle = self.cycle_lock.lock().await;

        let result = self.submit_next_batch().await;
        self.record(&result).await;
        result
    }

    async fn submit_next_batch(&self) -> Result<CycleOutcome, SyncError> {
        let events = self
            .ledger
            .unsynced_events(Some(self.config.batch_size))
            .await?;
        if events.is_empty() {
            return Ok(CycleOutcome::Idle);
        }

        let batch = SyncBatch::new(self.ledger.scope().clone(), events);
        let submitted = batch.len();
        tracing::debug!(batch_len = submitted, "submitting batch");

        let response =
            match tokio::time::timeout(self.config.request_timeout, self.transport.submit(&batch))
                .await
            {
                Ok(response) => response?,
                Err(_) => return Err(SyncError::Timeout(self.config.request_timeout)),
            };

        let frontier = match response.acknowledged_up_to_id {
            Some(upto) => {
                if batch.position_of(upto).is_none() {
                    return Err(SyncError::Protocol(format!(
                        "acknowledged event {upto} was not part of the submitted batch"
                    )));
                }
                let frontier = self.ledger.mark_synced(upto).await?;
                self.status.write().await.total_synced += frontier.newly_synced;
                tracing::info!(
                    event_id = %upto,
                    position = frontier.position,
                    batch_len = submitted,
                    acknowledged = frontier.newly_synced,
                    "batch acknowledged"
                );
                Some(frontier)
            }
            None => None,
        };

        // A rejection may follow an acknowledged prefix; the prefix stays marked.
        if let Some(rejection) = response.rejected {
            return Err(rejection.into());
        }

        Ok(match frontier {
            Some(f) => CycleOutcome::Acknowledged {
                submitted,
                acknowledged: f.newly_synced,
                frontier: f.position,
            },
            None => {
                tracing::warn!(batch_len = submitted, "endpoint acknowledged nothing");
                CycleOutcome::Unacknowledged { submitted }
            }
        })
    }

    async fn record(&self, result: &Result<CycleOutcome, SyncError>) {
        let at = self.clock.now();
        let mut status = self.status.write().await;

        match result {
            Ok(CycleOutcome::Idle) => {}
            Ok(_) => {
                status.consecutive_failures = 0;
                status.retries_exhausted = false;
                status.last_success = Some(at);
            }
            Err(e) => {
                status.total_failed += 1;
                status.consecutive_failures += 1;
                if !e.is_retryable() {
                    status.escalated = Some(e.to_string());
                } else if status.consecutive_failures > self.config.max_retries
                    && !status.retries_exhausted
                {
                    status.retries_exhausted = true;
                    tracing::error!(
                        device_id = %self.ledger.scope().device_id,
                        tenant_id = %self.ledger.scope().tenant_id,
                        failures = status.consecutive_failures,
                        max_retries = self.config.max_retries,
                        error = %e,
                        "sync retry limit exceeded; events stay queued locally"
                    );
                }
            }
        }

        status.last_attempt = Some(SyncAttempt {
            at,
            outcome: AttemptOutcome::from_result(result),
        });
    }
}

impl<L, T> SyncWorker<L, T>
where
    L: LocalLedger + 'static,
    T: IngestTransport + 'static,
{
    /// Spawn the background loop.
    ///
    /// The loop runs a cycle on every `sync_interval` tick, on
    /// [`SyncHandle::trigger`], and whenever the connectivity state flips to
    /// online. After a transient failure it waits out the backoff instead of
    /// the interval.
    pub fn start(self) -> SyncHandle {
        let trigger = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());
        let (escalation_tx, escalations) = mpsc::channel(1);
        let status = self.status.clone();

        let join = tokio::spawn(self.run_loop(trigger.clone(), shutdown.clone(), escalation_tx));

        SyncHandle {
            trigger,
            shutdown,
            escalations,
            status,
            join,
        }
    }

    async fn run_loop(
        self,
        trigger: Arc<Notify>,
        shutdown: Arc<Notify>,
        escalations: mpsc::Sender<SyncError>,
    ) {
        let scope = self.ledger.scope().clone();
        tracing::info!(chain = %scope, "sync worker started");

        let mut connectivity = self.offline.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut retry_at: Option<Instant> = None;
        let mut failures = 0u32;

        'worker: loop {
            let due = tokio::select! {
                biased;
                _ = shutdown.notified() => break 'worker,
                _ = trigger.notified() => true,
                changed = connectivity.changed() => {
                    changed.is_ok() && *connectivity.borrow_and_update() == ConnectivityState::Online
                }
                _ = wait_until(retry_at) => {
                    retry_at = None;
                    true
                }
                _ = ticker.tick(), if retry_at.is_none() => true,
            };
            if !due {
                continue;
            }

            if self.offline.is_offline() {
                let check = tokio::time::timeout(
                    self.config.request_timeout,
                    self.transport.check_connectivity(),
                );
                let reachable = tokio::select! {
                    biased;
                    _ = shutdown.notified() => break 'worker,
                    reachable = check => reachable.unwrap_or(false),
                };
                if !reachable {
                    tracing::debug!(chain = %scope, "offline; skipping sync cycle");
                    continue;
                }
                self.offline.set_online();
                connectivity.borrow_and_update();
            }

            loop {
                match self.run_cycle().await {
                    Ok(outcome) => {
                        failures = 0;
                        retry_at = None;
                        if !outcome.should_drain(self.config.batch_size) {
                            break;
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        failures += 1;
                        let delay = self.config.backoff(failures);
                        retry_at = Some(Instant::now() + delay);
                        tracing::warn!(
                            chain = %scope,
                            error = %e,
                            failures,
                            retry_in = ?delay,
                            "sync cycle failed; backing off"
                        );
                        if matches!(e, SyncError::Transport(TransportError::Network(_))) {
                            self.offline.set_offline();
                            connectivity.borrow_and_update();
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            chain = %scope,
                            error = %e,
                            "sync stopped; chain needs operator attention"
                        );
                        let _ = escalations.send(e).await;
                        break 'worker;
                    }
                }
            }
        }

        tracing::info!(chain = %scope, "sync worker stopped");
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Control handle for a started [`SyncWorker`].
#[derive(Debug)]
pub struct SyncHandle {
    trigger: Arc<Notify>,
    shutdown: Arc<Notify>,
    escalations: mpsc::Receiver<SyncError>,
    status: SharedSyncStatus,
    join: JoinHandle<()>,
}

impl SyncHandle {
    /// Run a cycle now, e.g. after connectivity was regained.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn status(&self) -> SharedSyncStatus {
        self.status.clone()
    }

    /// Wait for the error that stopped the worker, if any. Returns `None`
    /// once the worker has exited without escalating.
    pub async fn next_escalation(&mut self) -> Option<SyncError> {
        self.escalations.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the loop and wait for it to exit. An in-flight cycle finishes
    /// first.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        self.shutdown.notify_one();
        self.join.await
    }
}

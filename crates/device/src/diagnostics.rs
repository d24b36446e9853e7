//! Backlog and sync health for monitoring.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use tally_core::{Clock, DeviceId, SystemClock, TenantId};
use tally_ledger::{LedgerError, LocalLedger};

use crate::sync_worker::{SharedSyncStatus, SyncAttempt};

/// Point-in-time view of one device chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub unsynced_count: u64,
    pub oldest_unsynced_age_secs: Option<i64>,
    pub last_sync_attempt: Option<SyncAttempt>,
    pub last_sync_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_events: u64,
    pub frontier_position: u64,
    pub head_position: u64,
    pub ledger_halted: bool,
    pub sync_escalation: Option<String>,
    /// Sync has failed more times in a row than the retry policy allows.
    pub sync_retries_exhausted: bool,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    /// False once the backlog or its age passes a threshold, or when the
    /// chain needs an operator.
    pub fn is_healthy(&self, max_unsynced: u64, max_age: Duration) -> bool {
        !self.ledger_halted
            && self.sync_escalation.is_none()
            && !self.sync_retries_exhausted
            && self.unsynced_count <= max_unsynced
            && self
                .oldest_unsynced_age_secs
                .is_none_or(|age| age <= max_age.num_seconds())
    }
}

/// Backlog age threshold from whole seconds; saturates instead of
/// overflowing for absurdly large values.
pub fn max_age_from_secs(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Read-only health accessors over a ledger and, optionally, a running sync
/// worker.
pub struct DeviceDiagnostics<L> {
    ledger: L,
    status: Option<SharedSyncStatus>,
    clock: Arc<dyn Clock>,
}

impl<L: LocalLedger> DeviceDiagnostics<L> {
    pub fn new(ledger: L) -> Self {
        Self {
            ledger,
            status: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_sync_status(mut self, status: SharedSyncStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn unsynced_count(&self) -> Result<u64, LedgerError> {
        self.ledger.unsynced_count().await
    }

    pub async fn oldest_unsynced_age(&self) -> Result<Option<Duration>, LedgerError> {
        self.ledger.oldest_unsynced_age(self.clock.now()).await
    }

    pub async fn last_sync_attempt_result(&self) -> Option<SyncAttempt> {
        match &self.status {
            Some(status) => status.read().await.last_attempt.clone(),
            None => None,
        }
    }

    pub async fn snapshot(&self) -> Result<HealthReport, LedgerError> {
        let now = self.clock.now();
        let stats = self.ledger.stats().await?;
        let age = self.ledger.oldest_unsynced_age(now).await?;
        let status = match &self.status {
            Some(status) => status.read().await.clone(),
            None => Default::default(),
        };
        let scope = self.ledger.scope();

        Ok(HealthReport {
            device_id: scope.device_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            unsynced_count: stats.unsynced,
            oldest_unsynced_age_secs: age.map(|a| a.num_seconds()),
            last_sync_attempt: status.last_attempt,
            last_sync_success: status.last_success,
            consecutive_failures: status.consecutive_failures,
            total_events: stats.total,
            frontier_position: stats.frontier_position,
            head_position: stats.head_position,
            ledger_halted: self.ledger.is_halted(),
            sync_escalation: status.escalated,
            sync_retries_exhausted: status.retries_exhausted,
            generated_at: now,
        })
    }
}

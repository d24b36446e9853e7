use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{EventId, EventType};
use tally_events::{ChainHash, ChainScope, Event};

use crate::error::LedgerError;

/// The newest event of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainTail {
    pub hash: ChainHash,
    /// 1-based position in the chain.
    pub position: u64,
    pub timestamp: DateTime<Utc>,
}

/// Result of advancing the sync frontier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFrontier {
    pub upto: EventId,
    pub position: u64,
    /// Events that moved from unsynced to synced in this call.
    pub newly_synced: u64,
}

/// Point-in-time counts for a chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    /// Events currently retained (pruned events are not counted).
    pub total: u64,
    pub synced: u64,
    pub unsynced: u64,
    pub oldest_timestamp: Option<DateTime<Utc>>,
    pub newest_timestamp: Option<DateTime<Utc>>,
    pub oldest_unsynced_timestamp: Option<DateTime<Utc>>,
    /// Position of the last synced event; 0 when nothing has been synced.
    pub frontier_position: u64,
    /// Position of the tail; 0 for an empty chain.
    pub head_position: u64,
}

/// Serialized form produced by [`LocalLedger::export_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerExport {
    #[serde(flatten)]
    pub scope: ChainScope,
    /// `previous_hash` expected of the first exported event.
    pub anchor: ChainHash,
    pub events: Vec<Event>,
}

/// Durable, append-only store of one device's hash chain.
///
/// A ledger instance serves exactly one [`ChainScope`] for its lifetime.
/// Mutations are serialized internally; reads may run concurrently with them
/// and only observe committed state.
#[async_trait]
pub trait LocalLedger: Send + Sync {
    fn scope(&self) -> &ChainScope;

    /// Whether a fatal error has halted this ledger.
    fn is_halted(&self) -> bool;

    /// Durably append `event` to the tail of the chain.
    ///
    /// The stored copy always starts unsynced.
    async fn append(&self, event: Event) -> Result<(), LedgerError>;

    /// The newest event, if any.
    async fn tail(&self) -> Result<Option<ChainTail>, LedgerError>;

    /// Hash of the newest event, or the genesis sentinel for an empty chain.
    async fn last_hash(&self) -> Result<ChainHash, LedgerError> {
        Ok(self
            .tail()
            .await?
            .map(|t| t.hash)
            .unwrap_or_else(ChainHash::genesis))
    }

    /// Unsynced events in chain order, oldest first.
    async fn unsynced_events(&self, limit: Option<usize>) -> Result<Vec<Event>, LedgerError>;

    /// Mark every event up to and including `upto` as synced.
    async fn mark_synced(&self, upto: EventId) -> Result<SyncFrontier, LedgerError>;

    /// Retained events from `from_position` (1-based, inclusive) in chain order.
    async fn events(
        &self,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LedgerError>;

    async fn events_by_type(&self, event_type: &EventType) -> Result<Vec<Event>, LedgerError>;

    /// Retained events with `from <= timestamp < to`, in chain order.
    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, LedgerError>;

    async fn stats(&self) -> Result<LedgerStats, LedgerError>;

    async fn unsynced_count(&self) -> Result<u64, LedgerError> {
        Ok(self.stats().await?.unsynced)
    }

    /// Age of the oldest unsynced event relative to `now`, never negative.
    async fn oldest_unsynced_age(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, LedgerError> {
        Ok(self
            .stats()
            .await?
            .oldest_unsynced_timestamp
            .map(|oldest| (now - oldest).max(Duration::zero())))
    }

    /// Recompute the retained chain from its anchor.
    ///
    /// Any break is reported as `Corrupted` and halts the ledger.
    async fn verify(&self) -> Result<(), LedgerError>;

    /// Delete the longest prefix of synced events acknowledged before
    /// `older_than`.
    ///
    /// Never touches unsynced events or the tail. Returns the number removed.
    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError>;

    /// Snapshot of the retained chain.
    async fn export(&self) -> Result<LedgerExport, LedgerError>;

    /// Pretty-printed JSON of [`LocalLedger::export`].
    async fn export_json(&self) -> Result<String, LedgerError> {
        let export = self.export().await?;
        serde_json::to_string_pretty(&export).map_err(|e| LedgerError::ReadError(e.to_string()))
    }
}

#[async_trait]
impl<L> LocalLedger for Arc<L>
where
    L: LocalLedger + ?Sized,
{
    fn scope(&self) -> &ChainScope {
        (**self).scope()
    }

    fn is_halted(&self) -> bool {
        (**self).is_halted()
    }

    async fn append(&self, event: Event) -> Result<(), LedgerError> {
        (**self).append(event).await
    }

    async fn tail(&self) -> Result<Option<ChainTail>, LedgerError> {
        (**self).tail().await
    }

    async fn last_hash(&self) -> Result<ChainHash, LedgerError> {
        (**self).last_hash().await
    }

    async fn unsynced_events(&self, limit: Option<usize>) -> Result<Vec<Event>, LedgerError> {
        (**self).unsynced_events(limit).await
    }

    async fn mark_synced(&self, upto: EventId) -> Result<SyncFrontier, LedgerError> {
        (**self).mark_synced(upto).await
    }

    async fn events(
        &self,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LedgerError> {
        (**self).events(from_position, limit).await
    }

    async fn events_by_type(&self, event_type: &EventType) -> Result<Vec<Event>, LedgerError> {
        (**self).events_by_type(event_type).await
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, LedgerError> {
        (**self).events_between(from, to).await
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        (**self).stats().await
    }

    async fn unsynced_count(&self) -> Result<u64, LedgerError> {
        (**self).unsynced_count().await
    }

    async fn oldest_unsynced_age(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, LedgerError> {
        (**self).oldest_unsynced_age(now).await
    }

    async fn verify(&self) -> Result<(), LedgerError> {
        (**self).verify().await
    }

    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        (**self).prune_synced(older_than).await
    }

    async fn export(&self) -> Result<LedgerExport, LedgerError> {
        (**self).export().await
    }

    async fn export_json(&self) -> Result<String, LedgerError> {
        (**self).export_json().await
    }
}

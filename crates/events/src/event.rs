use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tally_core::{ActorId, DeviceId, EventId, EventType, TenantId, truncate_to_millis};

use crate::chain::{ChainError, ChainHash, compute_hash};
use crate::scope::{ChainScope, ChainScoped};

/// Whether the Ingest Endpoint has acknowledged an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    #[default]
    Unsynced,
    Synced,
}

/// The hashable fields of an event, before it is linked into a chain.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFields {
    pub id: EventId,
    pub event_type: EventType,
    pub actor_id: ActorId,
    pub payload: JsonValue,
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub timestamp: DateTime<Utc>,
}

impl EventFields {
    /// Link these fields after `previous_hash`, producing an immutable event.
    ///
    /// The timestamp is truncated to milliseconds first so the in-memory value
    /// matches what is hashed and persisted.
    pub fn seal(mut self, previous_hash: ChainHash) -> Result<Event, ChainError> {
        self.timestamp = truncate_to_millis(self.timestamp);
        let hash = compute_hash(&previous_hash, &self)?;

        Ok(Event {
            id: self.id,
            event_type: self.event_type,
            actor_id: self.actor_id,
            payload: self.payload,
            device_id: self.device_id,
            tenant_id: self.tenant_id,
            timestamp: self.timestamp,
            previous_hash,
            hash,
            sync_state: SyncState::Unsynced,
            synced_at: None,
        })
    }
}

/// An immutable, hash-chained record of one domain action.
///
/// Only `sync_state` (and the `synced_at` it implies) ever changes after
/// creation, and only through the sync path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: EventId,
    #[serde(rename = "type")]
    event_type: EventType,
    actor_id: ActorId,
    payload: JsonValue,
    device_id: DeviceId,
    tenant_id: TenantId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    previous_hash: ChainHash,
    hash: ChainHash,

    #[serde(default)]
    sync_state: SyncState,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    synced_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Rebuild an event from storage without recomputing its hash.
    ///
    /// Use [`crate::verify_chain`] to check restored events.
    pub fn restore(
        fields: EventFields,
        previous_hash: ChainHash,
        hash: ChainHash,
        sync_state: SyncState,
        synced_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: fields.id,
            event_type: fields.event_type,
            actor_id: fields.actor_id,
            payload: fields.payload,
            device_id: fields.device_id,
            tenant_id: fields.tenant_id,
            timestamp: fields.timestamp,
            previous_hash,
            hash,
            sync_state,
            synced_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.actor_id
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn previous_hash(&self) -> &ChainHash {
        &self.previous_hash
    }

    pub fn hash(&self) -> &ChainHash {
        &self.hash
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    pub fn is_synced(&self) -> bool {
        self.sync_state == SyncState::Synced
    }

    /// The hashable fields of this event.
    pub fn fields(&self) -> EventFields {
        EventFields {
            id: self.id,
            event_type: self.event_type.clone(),
            actor_id: self.actor_id.clone(),
            payload: self.payload.clone(),
            device_id: self.device_id.clone(),
            tenant_id: self.tenant_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Recompute the hash from the current content.
    pub fn recompute_hash(&self) -> Result<ChainHash, ChainError> {
        compute_hash(&self.previous_hash, &self.fields())
    }

    /// Return a copy carrying the given sync state.
    ///
    /// `synced_at` is cleared when moving back to `Unsynced`.
    pub fn with_sync_state(mut self, state: SyncState, at: Option<DateTime<Utc>>) -> Self {
        self.sync_state = state;
        self.synced_at = match state {
            SyncState::Synced => at,
            SyncState::Unsynced => None,
        };
        self
    }
}

impl ChainScoped for Event {
    fn chain_scope(&self) -> ChainScope {
        ChainScope::new(self.device_id.clone(), self.tenant_id.clone())
    }
}

//! Wire contract between a device's sync worker and the Ingest Endpoint.
//!
//! ```text
//! request:  {"deviceId":..,"tenantId":..,"events":[..]}
//! response: {"acknowledgedUpToId":"<uuid>"|null,"rejected":{"kind":..}|null}
//! ```

use serde::{Deserialize, Serialize};

use tally_core::{DeviceId, EventId, TenantId};

use crate::chain::ChainHash;
use crate::event::Event;
use crate::scope::{ChainScope, ChainScoped};

/// An ordered run of one chain's events submitted for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncBatch {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
    pub events: Vec<Event>,
}

impl SyncBatch {
    pub fn new(scope: ChainScope, events: Vec<Event>) -> Self {
        Self {
            device_id: scope.device_id,
            tenant_id: scope.tenant_id,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Position of `id` within the batch, if present.
    pub fn position_of(&self, id: EventId) -> Option<usize> {
        self.events.iter().position(|e| e.id() == id)
    }
}

impl ChainScoped for SyncBatch {
    fn chain_scope(&self) -> ChainScope {
        ChainScope::new(self.device_id.clone(), self.tenant_id.clone())
    }
}

/// Why the endpoint refused (part of) a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "kind",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Rejection {
    /// The device's chain does not extend what the endpoint already holds.
    ChainDivergence {
        expected_previous_hash: ChainHash,
        received_previous_hash: ChainHash,
    },

    /// An event failed verification or does not belong to the batch's chain.
    Tampered { event_id: EventId, reason: String },
}

impl core::fmt::Display for Rejection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ChainDivergence {
                expected_previous_hash,
                received_previous_hash,
            } => write!(
                f,
                "chain divergence: expected previous hash {expected_previous_hash}, received {received_previous_hash}"
            ),
            Self::Tampered { event_id, reason } => {
                write!(f, "event {event_id} rejected as tampered: {reason}")
            }
        }
    }
}

/// The endpoint's answer to a [`SyncBatch`].
///
/// `acknowledged_up_to_id` names the last event of the batch that is durably
/// stored centrally; every event before it in the batch is stored too. A
/// response may carry both an acknowledgement and a rejection when only a
/// prefix of the batch was accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub acknowledged_up_to_id: Option<EventId>,
    pub rejected: Option<Rejection>,
}

impl SyncResponse {
    pub fn acknowledged(upto: EventId) -> Self {
        Self {
            acknowledged_up_to_id: Some(upto),
            rejected: None,
        }
    }

    pub fn rejected(acknowledged_up_to_id: Option<EventId>, rejection: Rejection) -> Self {
        Self {
            acknowledged_up_to_id,
            rejected: Some(rejection),
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejected.is_some()
    }
}

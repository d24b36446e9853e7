//! Hash chain primitives.
//!
//! Every event commits to its predecessor through `previous_hash`, so editing,
//! dropping or reordering any event of a chain changes every hash after it.
//! Nothing here performs I/O: hashing is a pure function of the event fields.
//!
//! ## Canonical form
//!
//! Fields are rendered as compact JSON with object keys sorted recursively
//! before hashing, so the digest never depends on the in-memory order of a
//! payload's keys:
//!
//! ```text
//! {"actorId":..,"deviceId":..,"id":..,"payload":{..},"previousHash":..,"tenantId":..,"timestamp":<ms>,"type":..}
//! ```

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

use tally_core::{ActorId, DeviceId, EventId, EventType, TenantId};

use crate::event::{Event, EventFields};

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// `previous_hash` of the first event of every chain: 64 hex zeros.
///
/// No real SHA-256 output is expected to collide with it, which makes an empty
/// chain unambiguous.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// A hex-encoded SHA-256 digest linking events of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainHash(String);

impl ChainHash {
    /// The genesis sentinel.
    pub fn genesis() -> Self {
        Self(GENESIS_HASH.to_string())
    }

    pub fn is_genesis(&self) -> bool {
        self.0 == GENESIS_HASH
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_digest(digest: &[u8]) -> Self {
        Self(hex::encode(digest))
    }
}

impl Default for ChainHash {
    fn default() -> Self {
        Self::genesis()
    }
}

impl core::fmt::Display for ChainHash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ChainHash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() == HASH_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(ChainError::MalformedHash(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ChainHash {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChainHash> for String {
    fn from(value: ChainHash) -> Self {
        value.0
    }
}

/// Hash chain failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The hashable fields could not be serialized.
    #[error("failed to serialize hashable fields: {0}")]
    Serialization(String),

    /// A string is not a 64-character lowercase hex digest.
    #[error("malformed chain hash: {0:?}")]
    MalformedHash(String),

    /// `previous_hash` of the event at `index` does not match its predecessor.
    #[error("broken link at index {index}: expected previous hash {expected}, found {found}")]
    BrokenLink {
        index: usize,
        expected: ChainHash,
        found: ChainHash,
    },

    /// The stored hash of the event at `index` does not match its content.
    #[error("hash mismatch at index {index} (event {event_id})")]
    HashMismatch { index: usize, event_id: EventId },
}

/// Hashable content of an event (everything except `hash` and sync state).
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashableContent<'a> {
    id: &'a EventId,
    #[serde(rename = "type")]
    event_type: &'a EventType,
    actor_id: &'a ActorId,
    payload: &'a JsonValue,
    device_id: &'a DeviceId,
    tenant_id: &'a TenantId,
    timestamp: i64,
    previous_hash: &'a ChainHash,
}

/// Compute the hash of an event given its predecessor's hash.
///
/// Deterministic: the same logical fields always yield the same digest.
pub fn compute_hash(
    previous_hash: &ChainHash,
    fields: &EventFields,
) -> Result<ChainHash, ChainError> {
    let content = HashableContent {
        id: &fields.id,
        event_type: &fields.event_type,
        actor_id: &fields.actor_id,
        payload: &fields.payload,
        device_id: &fields.device_id,
        tenant_id: &fields.tenant_id,
        timestamp: fields.timestamp.timestamp_millis(),
        previous_hash,
    };

    let value =
        serde_json::to_value(&content).map_err(|e| ChainError::Serialization(e.to_string()))?;
    let canonical = canonical_json(&value);

    Ok(ChainHash::from_digest(&Sha256::digest(canonical.as_bytes())))
}

/// Render a JSON value compactly with object keys sorted at every depth.
pub fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Verify an ordered run of events starting from `anchor`.
///
/// `anchor` is the genesis sentinel for a full chain, or the `previous_hash`
/// of the first retained event when older events were pruned. Returns the
/// first break found.
pub fn verify_chain(anchor: &ChainHash, events: &[Event]) -> Result<(), ChainError> {
    let mut expected = anchor.clone();

    for (index, event) in events.iter().enumerate() {
        if event.previous_hash() != &expected {
            return Err(ChainError::BrokenLink {
                index,
                expected,
                found: event.previous_hash().clone(),
            });
        }

        if &event.recompute_hash()? != event.hash() {
            return Err(ChainError::HashMismatch {
                index,
                event_id: event.id(),
            });
        }

        expected = event.hash().clone();
    }

    Ok(())
}

//! `tally-events`: The hash-chained event model.
//!
//! - [`chain`]: hashing, canonical form and chain verification
//! - [`event`]: the immutable event record
//! - [`payload`]: typed payloads for known commerce kinds
//! - [`sync`]: device ↔ ingest wire contract
//! - [`bus`]: pub/sub for events that were already stored

pub mod bus;
pub mod chain;
pub mod event;
pub mod in_memory_bus;
pub mod payload;
pub mod scope;
pub mod sync;

pub use bus::{EventBus, Subscription};
pub use chain::{
    ChainError, ChainHash, GENESIS_HASH, HASH_HEX_LEN, canonical_json, compute_hash, verify_chain,
};
pub use event::{Event, EventFields, SyncState};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use payload::{DomainEvent, PayloadError, TypedPayload};
pub use scope::{ChainScope, ChainScoped};
pub use sync::{Rejection, SyncBatch, SyncResponse};

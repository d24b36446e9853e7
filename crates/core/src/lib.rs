//! `tally-core`: Domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the wall-clock abstraction.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock, truncate_to_millis};
pub use error::{DomainError, DomainResult};
pub use id::{ActorId, DeviceId, EventId, EventType, TenantId};

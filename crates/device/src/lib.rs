//! `tally-device`
//!
//! **Responsibility:** everything that runs on a point-of-sale device.
//!
//! - [`engine`]: turns domain actions into hash-chained ledger events
//! - [`sync_worker`]: pushes unsynced events to the ingest endpoint in the background
//! - [`sync`]: the transport to the ingest endpoint (HTTP via `reqwest`)
//! - [`offline`]: shared connectivity state
//! - [`diagnostics`]: backlog and sync health
//!
//! Event creation never waits on the network. The ledger handle is created
//! once at startup and shared (`Arc`) by the engine and the worker.

pub mod diagnostics;
pub mod engine;
pub mod offline;
pub mod sync;
pub mod sync_worker;

pub use diagnostics::{DeviceDiagnostics, HealthReport, max_age_from_secs};
pub use engine::{EngineError, EventEngine};
pub use offline::{ConnectivityState, OfflineMode};
pub use sync::{HttpIngestClient, IngestTransport, TransportError};
pub use sync_worker::{
    AttemptOutcome, CycleOutcome, SharedSyncStatus, SyncAttempt, SyncConfig, SyncError,
    SyncHandle, SyncStatus, SyncWorker,
};

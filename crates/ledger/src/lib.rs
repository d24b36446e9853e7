//! `tally-ledger`: Durable, append-only storage of a device's hash chain.
//!
//! The [`LocalLedger`] trait is the only way events enter or leave local
//! storage. Two implementations are provided:
//!
//! - [`InMemoryLedger`]: volatile, for tests and development
//! - [`SqliteLedger`]: durable, WAL-mode SQLite via `sqlx`

pub mod config;
pub mod error;
pub mod in_memory;
pub mod sqlite;
pub mod r#trait;

pub use config::{LedgerConfig, default_ledger_path};
pub use error::LedgerError;
pub use in_memory::InMemoryLedger;
pub use sqlite::SqliteLedger;
pub use r#trait::{ChainTail, LedgerExport, LedgerStats, LocalLedger, SyncFrontier};

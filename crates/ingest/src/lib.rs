//! `tally-ingest`: Reference ingest endpoint for device chains.
//!
//! - [`service`]: verification, deduplication and storage of batches
//! - [`app`]: the `axum` HTTP surface
//! - [`middleware`]: optional bearer-token check
//! - [`config`]: environment configuration for the binary

pub mod app;
pub mod config;
pub mod middleware;
pub mod service;

pub use config::{ConfigError, IngestConfig};
pub use service::{ChainHead, IngestError, IngestService};

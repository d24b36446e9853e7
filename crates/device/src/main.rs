//! `tally-ledger-health <db-path> <device-id> <tenant-id>`
//!
//! Prints the chain's health report as JSON and exits non-zero when the
//! unsynced backlog is too large or too old, or when the ledger is halted.
//! A missing database file is an error, never an empty healthy ledger.
//!
//! Thresholds: `TALLY_HEALTH_MAX_UNSYNCED` (default 1000) and
//! `TALLY_HEALTH_MAX_AGE_SECS` (default 3600).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};

use tally_core::{DeviceId, TenantId};
use tally_device::{DeviceDiagnostics, max_age_from_secs};
use tally_events::ChainScope;
use tally_ledger::{LedgerConfig, LocalLedger, SqliteLedger};

fn threshold(key: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tally_observability::init_stderr();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [path, device, tenant] = args.as_slice() else {
        bail!("usage: tally-ledger-health <db-path> <device-id> <tenant-id>");
    };

    let scope = ChainScope::new(
        DeviceId::new(device.as_str()).context("invalid device id")?,
        TenantId::new(tenant.as_str()).context("invalid tenant id")?,
    );
    let max_unsynced = threshold("TALLY_HEALTH_MAX_UNSYNCED", 1000)?;
    let max_age_secs = threshold("TALLY_HEALTH_MAX_AGE_SECS", 3600)?;

    let config = LedgerConfig::default()
        .with_path(path)
        .with_create_if_missing(false);
    let ledger = Arc::new(
        SqliteLedger::open(&config, scope)
            .await
            .with_context(|| format!("failed to open ledger at {path}"))?,
    );

    if let Err(e) = ledger.verify().await {
        tracing::error!(error = %e, "ledger integrity check failed");
    }

    let report = DeviceDiagnostics::new(ledger.clone()).snapshot().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    let healthy = report.is_healthy(max_unsynced, max_age_from_secs(max_age_secs));
    ledger.close().await;

    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

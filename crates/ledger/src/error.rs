use std::sync::OnceLock;

use thiserror::Error;

use tally_core::EventId;
use tally_events::{ChainHash, ChainScope};

/// Local ledger failure.
///
/// `ChainViolation`, `OrderViolation` and `Corrupted` mean the on-device chain
/// can no longer be trusted; after any of them the ledger refuses further
/// mutations with `Halted`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    WriteError(String),

    #[error("ledger read failed: {0}")]
    ReadError(String),

    #[error("chain violation: tail hash is {expected}, event links to {found}")]
    ChainViolation { expected: ChainHash, found: ChainHash },

    #[error("sync order violation: {0}")]
    OrderViolation(String),

    #[error("event {0} is not part of this chain")]
    NotFound(EventId),

    #[error("scope mismatch: ledger serves {expected}, got {found}")]
    ScopeMismatch {
        expected: ChainScope,
        found: ChainScope,
    },

    #[error("ledger corrupted: {0}")]
    Corrupted(String),

    #[error("ledger halted after fatal error: {0}")]
    Halted(String),
}

impl LedgerError {
    /// Whether this error halts the ledger.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChainViolation { .. } | Self::OrderViolation(_) | Self::Corrupted(_)
        )
    }

    /// Storage hiccups (busy database, I/O) that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteError(_) | Self::ReadError(_))
    }
}

/// Latches the first fatal error; once set, every mutation is refused.
#[derive(Debug, Default)]
pub(crate) struct HaltLatch {
    reason: OnceLock<String>,
}

impl HaltLatch {
    pub(crate) fn check(&self) -> Result<(), LedgerError> {
        match self.reason.get() {
            Some(reason) => Err(LedgerError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Pass `err` through, halting first if it is fatal.
    pub(crate) fn observe(&self, scope: &ChainScope, err: LedgerError) -> LedgerError {
        if err.is_fatal() && self.reason.set(err.to_string()).is_ok() {
            tracing::error!(
                device_id = %scope.device_id,
                tenant_id = %scope.tenant_id,
                error = %err,
                "ledger halted; operator intervention required"
            );
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{DeviceId, TenantId};

    fn scope() -> ChainScope {
        ChainScope::new(DeviceId::new("pos-7").unwrap(), TenantId::new("brunch-co").unwrap())
    }

    #[test]
    fn only_fatal_errors_trip_the_latch() {
        let latch = HaltLatch::default();

        latch.observe(&scope(), LedgerError::WriteError("disk full".into()));
        latch.observe(&scope(), LedgerError::NotFound(EventId::new()));
        assert!(latch.check().is_ok());

        latch.observe(&scope(), LedgerError::Corrupted("bad hash".into()));
        assert!(latch.is_halted());
        assert!(matches!(latch.check(), Err(LedgerError::Halted(r)) if r.contains("bad hash")));
    }

    #[test]
    fn first_fatal_reason_wins() {
        let latch = HaltLatch::default();
        latch.observe(&scope(), LedgerError::OrderViolation("first".into()));
        latch.observe(&scope(), LedgerError::Corrupted("second".into()));

        assert!(matches!(latch.check(), Err(LedgerError::Halted(r)) if r.contains("first")));
    }

    #[test]
    fn only_io_failures_are_transient() {
        assert!(LedgerError::ReadError("database is locked".into()).is_transient());
        assert!(LedgerError::WriteError("disk I/O error".into()).is_transient());
        assert!(!LedgerError::Corrupted("bad hash".into()).is_transient());
        assert!(!LedgerError::Halted("bad hash".into()).is_transient());
        assert!(!LedgerError::NotFound(EventId::new()).is_transient());
    }
}

//! Event creation on the device.
//!
//! The engine is the only writer of a chain: it reads the tail, builds and
//! hashes the next event, and appends it. Calls on one engine are serialized
//! from tail read through append, so concurrent callers never observe the
//! same tail. Nothing here touches the network.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::instrument;

use tally_core::{ActorId, Clock, DeviceId, EventId, EventType, SystemClock, TenantId, truncate_to_millis};
use tally_events::{ChainError, ChainScope, Event, EventFields, PayloadError, TypedPayload};
use tally_ledger::{LedgerError, LocalLedger};

#[derive(Debug, Error)]
pub enum EngineError {
    /// The event was not durably recorded; the action must be treated as not
    /// having happened.
    #[error("event could not be persisted: {0}")]
    PersistenceFailed(#[from] LedgerError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("engine is configured for {engine} but the ledger serves {ledger}")]
    ScopeMismatch {
        engine: ChainScope,
        ledger: ChainScope,
    },
}

impl From<PayloadError> for EngineError {
    fn from(value: PayloadError) -> Self {
        Self::InvalidPayload(value.to_string())
    }
}

impl From<ChainError> for EngineError {
    fn from(value: ChainError) -> Self {
        Self::InvalidPayload(value.to_string())
    }
}

/// Records domain actions as hash-chained events in the local ledger.
pub struct EventEngine<L> {
    scope: ChainScope,
    ledger: L,
    clock: Arc<dyn Clock>,
    write: Mutex<()>,
}

impl<L> core::fmt::Debug for EventEngine<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventEngine")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl<L: LocalLedger> EventEngine<L> {
    /// Bind an engine to `ledger`, which must serve the same device and tenant.
    pub fn new(device_id: DeviceId, tenant_id: TenantId, ledger: L) -> Result<Self, EngineError> {
        let scope = ChainScope::new(device_id, tenant_id);
        if ledger.scope() != &scope {
            return Err(EngineError::ScopeMismatch {
                engine: scope,
                ledger: ledger.scope().clone(),
            });
        }

        Ok(Self {
            scope,
            ledger,
            clock: Arc::new(SystemClock),
            write: Mutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scope(&self) -> &ChainScope {
        &self.scope
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.scope.device_id
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.scope.tenant_id
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Record one domain action.
    ///
    /// Returns only after the event is durably appended. On error nothing was
    /// written.
    #[instrument(
        skip(self, payload),
        fields(
            device_id = %self.scope.device_id,
            tenant_id = %self.scope.tenant_id,
            event_type = %event_type,
        ),
        err
    )]
    pub async fn create_event(
        &self,
        event_type: EventType,
        actor_id: ActorId,
        payload: JsonValue,
    ) -> Result<Event, EngineError> {
        let _write = self.write.lock().await;

        let tail = self.ledger.tail().await?;

        let mut timestamp = truncate_to_millis(self.clock.now());
        if let Some(tail) = &tail {
            if timestamp < tail.timestamp {
                let clamped = tail.timestamp + Duration::milliseconds(1);
                tracing::warn!(
                    clock = %timestamp,
                    previous = %tail.timestamp,
                    clamped = %clamped,
                    "device clock regressed; clamping event timestamp"
                );
                timestamp = clamped;
            }
        }

        let previous_hash = tail.map(|t| t.hash).unwrap_or_default();
        let event = EventFields {
            id: EventId::new(),
            event_type,
            actor_id,
            payload,
            device_id: self.scope.device_id.clone(),
            tenant_id: self.scope.tenant_id.clone(),
            timestamp,
        }
        .seal(previous_hash)?;

        self.ledger.append(event.clone()).await?;

        tracing::debug!(event_id = %event.id(), hash = %event.hash(), "event recorded");
        Ok(event)
    }

    /// Record a typed payload under its stable event type.
    pub async fn record<P>(&self, actor_id: ActorId, payload: &P) -> Result<Event, EngineError>
    where
        P: TypedPayload + Sync,
    {
        let value = payload.to_payload()?;
        self.create_event(P::event_type(), actor_id, value).await
    }
}

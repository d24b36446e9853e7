use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use tally_core::{Clock, EventId, EventType, SystemClock};
use tally_events::{ChainHash, ChainScope, ChainScoped, Event, SyncState, verify_chain};

use crate::error::{HaltLatch, LedgerError};
use crate::r#trait::{ChainTail, LedgerExport, LedgerStats, LocalLedger, SyncFrontier};

#[derive(Debug)]
struct ChainState {
    /// Retained events in chain order.
    events: Vec<Event>,
    /// Position of `events[0]`.
    first_position: u64,
    /// `previous_hash` of the first retained event.
    anchor: ChainHash,
    tail: Option<ChainTail>,
    frontier_position: u64,
    positions: HashMap<EventId, u64>,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            first_position: 1,
            anchor: ChainHash::genesis(),
            tail: None,
            frontier_position: 0,
            positions: HashMap::new(),
        }
    }
}

impl ChainState {
    fn index_of(&self, position: u64) -> Option<usize> {
        position
            .checked_sub(self.first_position)
            .map(|i| i as usize)
            .filter(|i| *i < self.events.len())
    }
}

/// Volatile ledger for tests and development.
///
/// Same semantics as the SQLite ledger, minus durability.
pub struct InMemoryLedger {
    scope: ChainScope,
    state: RwLock<ChainState>,
    halt: HaltLatch,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("scope", &self.scope)
            .field("state", &self.state)
            .field("halt", &self.halt)
            .finish_non_exhaustive()
    }
}

impl InMemoryLedger {
    pub fn new(scope: ChainScope) -> Self {
        Self {
            scope,
            state: RwLock::new(ChainState::default()),
            halt: HaltLatch::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Clock used to stamp `synced_at`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn read_err() -> LedgerError {
        LedgerError::ReadError("lock poisoned".to_string())
    }

    fn write_err() -> LedgerError {
        LedgerError::WriteError("lock poisoned".to_string())
    }
}

#[async_trait]
impl LocalLedger for InMemoryLedger {
    fn scope(&self) -> &ChainScope {
        &self.scope
    }

    fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    async fn append(&self, event: Event) -> Result<(), LedgerError> {
        self.halt.check()?;

        if !event.belongs_to(&self.scope) {
            return Err(LedgerError::ScopeMismatch {
                expected: self.scope.clone(),
                found: event.chain_scope(),
            });
        }

        let mut state = self.state.write().map_err(|_| Self::write_err())?;

        let expected = state
            .tail
            .as_ref()
            .map(|t| t.hash.clone())
            .unwrap_or_else(ChainHash::genesis);
        if event.previous_hash() != &expected {
            return Err(self.halt.observe(
                &self.scope,
                LedgerError::ChainViolation {
                    expected,
                    found: event.previous_hash().clone(),
                },
            ));
        }

        let position = state.tail.as_ref().map(|t| t.position + 1).unwrap_or(1);
        let event = event.with_sync_state(SyncState::Unsynced, None);

        state.tail = Some(ChainTail {
            hash: event.hash().clone(),
            position,
            timestamp: event.timestamp(),
        });
        state.positions.insert(event.id(), position);
        state.events.push(event);

        Ok(())
    }

    async fn tail(&self) -> Result<Option<ChainTail>, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;
        Ok(state.tail.clone())
    }

    async fn unsynced_events(&self, limit: Option<usize>) -> Result<Vec<Event>, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;

        let start = state
            .index_of(state.frontier_position + 1)
            .unwrap_or(state.events.len());
        let remaining = &state.events[start..];
        let take = limit.unwrap_or(remaining.len()).min(remaining.len());

        Ok(remaining[..take].to_vec())
    }

    async fn mark_synced(&self, upto: EventId) -> Result<SyncFrontier, LedgerError> {
        self.halt.check()?;

        let mut state = self.state.write().map_err(|_| Self::write_err())?;

        let position = match state.positions.get(&upto) {
            Some(p) => *p,
            None => return Err(LedgerError::NotFound(upto)),
        };
        if position <= state.frontier_position {
            return Err(self.halt.observe(
                &self.scope,
                LedgerError::OrderViolation(format!(
                    "event {upto} at position {position} is already synced (frontier {})",
                    state.frontier_position
                )),
            ));
        }

        let from = state
            .index_of(state.frontier_position + 1)
            .ok_or_else(|| LedgerError::Corrupted("sync frontier outside retained chain".into()))?;
        let to = state
            .index_of(position)
            .ok_or_else(|| LedgerError::Corrupted(format!("position {position} not retained")))?;

        let now = self.clock.now();
        for slot in &mut state.events[from..=to] {
            *slot = slot.clone().with_sync_state(SyncState::Synced, Some(now));
        }
        state.frontier_position = position;

        Ok(SyncFrontier {
            upto,
            position,
            newly_synced: (to - from + 1) as u64,
        })
    }

    async fn events(
        &self,
        from_position: u64,
        limit: Option<usize>,
    ) -> Result<Vec<Event>, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;

        let start = from_position.max(state.first_position);
        let Some(start) = state.index_of(start) else {
            return Ok(Vec::new());
        };
        let remaining = &state.events[start..];
        let take = limit.unwrap_or(remaining.len()).min(remaining.len());

        Ok(remaining[..take].to_vec())
    }

    async fn events_by_type(&self, event_type: &EventType) -> Result<Vec<Event>, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect())
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Event>, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.timestamp() >= from && e.timestamp() < to)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<LedgerStats, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;

        let total = state.events.len() as u64;
        let unsynced: Vec<&Event> = state.events.iter().filter(|e| !e.is_synced()).collect();

        Ok(LedgerStats {
            total,
            synced: total - unsynced.len() as u64,
            unsynced: unsynced.len() as u64,
            oldest_timestamp: state.events.first().map(Event::timestamp),
            newest_timestamp: state.events.last().map(Event::timestamp),
            oldest_unsynced_timestamp: unsynced.first().map(|e| e.timestamp()),
            frontier_position: state.frontier_position,
            head_position: state.tail.as_ref().map(|t| t.position).unwrap_or(0),
        })
    }

    async fn verify(&self) -> Result<(), LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;

        let result = verify_chain(&state.anchor, &state.events)
            .map_err(|e| LedgerError::Corrupted(e.to_string()))
            .and_then(|()| match (state.events.last(), &state.tail) {
                (Some(last), Some(tail)) if last.hash() != &tail.hash => Err(
                    LedgerError::Corrupted("tail record does not match last event".into()),
                ),
                _ => Ok(()),
            })
            .and_then(|()| {
                let contradiction = state.events.iter().enumerate().find(|(offset, e)| {
                    let position = state.first_position + *offset as u64;
                    e.is_synced() != (position <= state.frontier_position)
                });
                match contradiction {
                    Some((offset, e)) => Err(LedgerError::Corrupted(format!(
                        "sync state of event {} at position {} contradicts frontier {}",
                        e.id(),
                        state.first_position + offset as u64,
                        state.frontier_position
                    ))),
                    None => Ok(()),
                }
            });

        result.map_err(|e| self.halt.observe(&self.scope, e))
    }

    async fn prune_synced(&self, older_than: DateTime<Utc>) -> Result<u64, LedgerError> {
        self.halt.check()?;

        let mut state = self.state.write().map_err(|_| Self::write_err())?;

        // Stop at the first event that is unsynced or acknowledged too
        // recently, even if later ones qualify. The tail always stays.
        let keep_from = state.events.len().saturating_sub(1);
        let count = state.events[..keep_from]
            .iter()
            .take_while(|e| e.is_synced() && e.synced_at().is_some_and(|at| at < older_than))
            .count();

        if count == 0 {
            return Ok(0);
        }

        let removed: Vec<Event> = state.events.drain(..count).collect();
        for e in &removed {
            state.positions.remove(&e.id());
        }
        state.first_position += count as u64;
        if let Some(first) = state.events.first() {
            state.anchor = first.previous_hash().clone();
        }

        tracing::info!(
            device_id = %self.scope.device_id,
            tenant_id = %self.scope.tenant_id,
            pruned = count,
            "pruned synced events"
        );

        Ok(count as u64)
    }

    async fn export(&self) -> Result<LedgerExport, LedgerError> {
        let state = self.state.read().map_err(|_| Self::read_err())?;
        Ok(LedgerExport {
            scope: self.scope.clone(),
            anchor: state.anchor.clone(),
            events: state.events.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use tally_core::{ActorId, DeviceId, TenantId};
    use tally_events::EventFields;

    fn scope() -> ChainScope {
        ChainScope::new(DeviceId::new("pos-7").unwrap(), TenantId::new("brunch-co").unwrap())
    }

    fn next(ledger_tail: &ChainHash, n: i64) -> Event {
        EventFields {
            id: EventId::new(),
            event_type: EventType::from_static("ORDER_CREATED"),
            actor_id: ActorId::new("user-1").unwrap(),
            payload: json!({"orderId": format!("A{n}"), "amount": 42}),
            device_id: DeviceId::new("pos-7").unwrap(),
            tenant_id: TenantId::new("brunch-co").unwrap(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + n).unwrap(),
        }
        .seal(ledger_tail.clone())
        .unwrap()
    }

    async fn append_n(ledger: &InMemoryLedger, n: i64) -> Vec<Event> {
        let mut out = Vec::new();
        for i in 0..n {
            let event = next(&ledger.last_hash().await.unwrap(), i);
            ledger.append(event.clone()).await.unwrap();
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn empty_ledger_reports_genesis() {
        let ledger = InMemoryLedger::new(scope());
        assert!(ledger.last_hash().await.unwrap().is_genesis());
        assert!(ledger.tail().await.unwrap().is_none());
        assert!(ledger.unsynced_events(None).await.unwrap().is_empty());
        assert_eq!(ledger.stats().await.unwrap(), LedgerStats::default());
    }

    #[tokio::test]
    async fn broken_link_halts_the_ledger() {
        let ledger = InMemoryLedger::new(scope());
        append_n(&ledger, 1).await;

        let stray = next(&ChainHash::genesis(), 9);
        let err = ledger.append(stray).await.unwrap_err();
        assert!(matches!(err, LedgerError::ChainViolation { .. }));
        assert!(ledger.is_halted());

        let good = next(&ledger.last_hash().await.unwrap(), 10);
        assert!(matches!(ledger.append(good).await, Err(LedgerError::Halted(_))));
        // reads stay available
        assert_eq!(ledger.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn prune_keeps_tail_and_unsynced() {
        let ledger = InMemoryLedger::new(scope());
        let events = append_n(&ledger, 4).await;

        ledger.mark_synced(events[3].id()).await.unwrap();
        let removed = ledger
            .prune_synced(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(removed, 3);
        let stats = ledger.stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.head_position, 4);
        assert_eq!(ledger.last_hash().await.unwrap(), *events[3].hash());
        ledger.verify().await.unwrap();

        let export = ledger.export().await.unwrap();
        assert_eq!(&export.anchor, events[3].previous_hash());
        assert_eq!(ledger.events(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn frontier_out_of_step_with_sync_state_is_corruption() {
        let ledger = InMemoryLedger::new(scope());
        append_n(&ledger, 2).await;

        ledger.state.write().unwrap().frontier_position = 1;

        let err = ledger.verify().await.unwrap_err();
        assert!(matches!(err, LedgerError::Corrupted(ref r) if r.contains("contradicts frontier")));
        assert!(ledger.is_halted());
    }
}

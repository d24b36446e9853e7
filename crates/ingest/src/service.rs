//! Central chain store: verifies, deduplicates and persists device batches.
//!
//! Every device chain is stored independently. A batch is walked in order:
//! events already held with the same hash are acknowledged again, new events
//! must extend the stored head and hash correctly. The walk stops at the
//! first event that cannot be accepted; everything before it is stored and
//! acknowledged.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use tally_core::{EventId, TenantId};
use tally_events::{
    ChainHash, ChainScope, ChainScoped, Event, EventBus, InMemoryEventBus, Rejection, Subscription,
    SyncBatch, SyncResponse,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingest store lock poisoned")]
    Poisoned,
}

/// Summary of what the endpoint holds for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainHead {
    #[serde(flatten)]
    pub scope: ChainScope,
    pub hash: ChainHash,
    pub event_count: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct StoredChain {
    events: Vec<Event>,
    hashes: HashMap<EventId, ChainHash>,
    head: ChainHash,
}

/// Result of walking one batch against a stored chain.
#[derive(Debug, Default)]
struct Verdict {
    accepted: Vec<Event>,
    acknowledged: Option<EventId>,
    rejected: Option<Rejection>,
}

impl StoredChain {
    fn walk(&self, scope: &ChainScope, batch: &[Event]) -> Verdict {
        let mut verdict = Verdict::default();
        let mut head = self.head.clone();

        for event in batch {
            if !event.belongs_to(scope) {
                verdict.rejected = Some(Rejection::Tampered {
                    event_id: event.id(),
                    reason: format!(
                        "event belongs to chain {}, batch is for {scope}",
                        event.chain_scope()
                    ),
                });
                break;
            }

            if let Some(stored) = self.hashes.get(&event.id()) {
                if stored == event.hash() {
                    verdict.acknowledged = Some(event.id());
                    continue;
                }
                verdict.rejected = Some(Rejection::Tampered {
                    event_id: event.id(),
                    reason: "hash differs from the stored copy".to_string(),
                });
                break;
            }

            match event.recompute_hash() {
                Ok(hash) if &hash == event.hash() => {}
                Ok(_) => {
                    verdict.rejected = Some(Rejection::Tampered {
                        event_id: event.id(),
                        reason: "hash does not match event content".to_string(),
                    });
                    break;
                }
                Err(e) => {
                    verdict.rejected = Some(Rejection::Tampered {
                        event_id: event.id(),
                        reason: e.to_string(),
                    });
                    break;
                }
            }

            if event.previous_hash() != &head {
                if verdict.acknowledged.is_none() {
                    verdict.rejected = Some(Rejection::ChainDivergence {
                        expected_previous_hash: head,
                        received_previous_hash: event.previous_hash().clone(),
                    });
                }
                // Otherwise acknowledge the prefix; the next batch starts at
                // the break and is rejected there.
                break;
            }

            head = event.hash().clone();
            verdict.acknowledged = Some(event.id());
            verdict.accepted.push(event.clone());
        }

        verdict
    }

    fn push(&mut self, event: Event) {
        self.head = event.hash().clone();
        self.hashes.insert(event.id(), event.hash().clone());
        self.events.push(event);
    }

    fn summary(&self, scope: &ChainScope) -> Option<ChainHead> {
        let last = self.events.last()?;
        Some(ChainHead {
            scope: scope.clone(),
            hash: self.head.clone(),
            event_count: self.events.len() as u64,
            last_event_at: Some(last.timestamp()),
        })
    }
}

/// In-memory ingest endpoint.
///
/// Accepted events are published on the bus after they are stored.
#[derive(Debug, Default)]
pub struct IngestService {
    chains: RwLock<BTreeMap<ChainScope, StoredChain>>,
    bus: Arc<InMemoryEventBus<Event>>,
}

impl IngestService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<InMemoryEventBus<Event>>) -> Self {
        Self {
            chains: RwLock::default(),
            bus,
        }
    }

    /// Every event accepted from now on, in acceptance order.
    pub fn subscribe(&self) -> Subscription<Event> {
        self.bus.subscribe()
    }

    #[instrument(
        skip(self, batch),
        fields(
            device_id = %batch.device_id,
            tenant_id = %batch.tenant_id,
            batch_len = batch.len(),
        ),
        err
    )]
    pub fn ingest(&self, batch: &SyncBatch) -> Result<SyncResponse, IngestError> {
        if batch.is_empty() {
            return Ok(SyncResponse::default());
        }

        let scope = batch.chain_scope();
        let verdict = {
            let mut chains = self.chains.write().map_err(|_| IngestError::Poisoned)?;
            let chain = chains.entry(scope.clone()).or_default();
            let verdict = chain.walk(&scope, &batch.events);
            for event in &verdict.accepted {
                chain.push(event.clone());
            }
            verdict
        };

        match &verdict.rejected {
            Some(rejection) => tracing::warn!(
                %rejection,
                accepted = verdict.accepted.len(),
                "batch rejected"
            ),
            None => tracing::info!(accepted = verdict.accepted.len(), "batch ingested"),
        }

        for event in &verdict.accepted {
            if let Err(e) = self.bus.publish(event.clone()) {
                tracing::warn!(event_id = %event.id(), error = ?e, "failed to publish stored event");
            }
        }

        Ok(match verdict.rejected {
            Some(rejection) => SyncResponse::rejected(verdict.acknowledged, rejection),
            None => SyncResponse {
                acknowledged_up_to_id: verdict.acknowledged,
                rejected: None,
            },
        })
    }

    pub fn head(&self, scope: &ChainScope) -> Result<Option<ChainHead>, IngestError> {
        let chains = self.chains.read().map_err(|_| IngestError::Poisoned)?;
        Ok(chains.get(scope).and_then(|c| c.summary(scope)))
    }

    /// Stored events of one tenant, each device chain in order, devices
    /// sorted by id.
    pub fn tenant_events(&self, tenant_id: &TenantId) -> Result<Vec<Event>, IngestError> {
        let chains = self.chains.read().map_err(|_| IngestError::Poisoned)?;
        Ok(chains
            .iter()
            .filter(|(scope, _)| &scope.tenant_id == tenant_id)
            .flat_map(|(_, chain)| chain.events.iter().cloned())
            .collect())
    }

    pub fn event_count(&self) -> Result<usize, IngestError> {
        let chains = self.chains.read().map_err(|_| IngestError::Poisoned)?;
        Ok(chains.values().map(|c| c.events.len()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::{ActorId, DeviceId, EventType};
    use tally_events::{EventFields, SyncState};

    fn scope(device: &str) -> ChainScope {
        ChainScope::new(DeviceId::new(device).unwrap(), TenantId::new("brunch-co").unwrap())
    }

    fn fields(scope: &ChainScope, n: i64) -> EventFields {
        EventFields {
            id: EventId::new(),
            event_type: EventType::from_static("ORDER_CREATED"),
            actor_id: ActorId::new("user-1").unwrap(),
            payload: json!({"orderId": format!("A{n}"), "amount": 42}),
            device_id: scope.device_id.clone(),
            tenant_id: scope.tenant_id.clone(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + n).unwrap(),
        }
    }

    fn chain(scope: &ChainScope, n: i64) -> Vec<Event> {
        let mut out: Vec<Event> = Vec::new();
        for i in 0..n {
            let prev = out.last().map(|e| e.hash().clone()).unwrap_or_default();
            out.push(fields(scope, i).seal(prev).unwrap());
        }
        out
    }

    fn batch(scope: &ChainScope, events: &[Event]) -> SyncBatch {
        SyncBatch::new(scope.clone(), events.to_vec())
    }

    #[test]
    fn fresh_chain_is_acknowledged_to_the_end() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 3);

        let resp = service.ingest(&batch(&pos7, &events)).unwrap();
        assert_eq!(resp, SyncResponse::acknowledged(events[2].id()));

        let head = service.head(&pos7).unwrap().unwrap();
        assert_eq!(head.hash, *events[2].hash());
        assert_eq!(head.event_count, 3);
    }

    #[test]
    fn resend_is_idempotent() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 3);
        let sub = service.subscribe();

        service.ingest(&batch(&pos7, &events)).unwrap();
        let again = service.ingest(&batch(&pos7, &events)).unwrap();

        assert_eq!(again, SyncResponse::acknowledged(events[2].id()));
        assert_eq!(service.event_count().unwrap(), 3);
        assert_eq!(sub.drain().len(), 3);
    }

    #[test]
    fn overlapping_resend_extends_the_chain() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 4);

        service.ingest(&batch(&pos7, &events[..2])).unwrap();
        let resp = service.ingest(&batch(&pos7, &events)).unwrap();

        assert_eq!(resp, SyncResponse::acknowledged(events[3].id()));
        assert_eq!(service.event_count().unwrap(), 4);
    }

    #[test]
    fn chain_restarted_from_genesis_diverges() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let original = chain(&pos7, 2);
        service.ingest(&batch(&pos7, &original)).unwrap();

        let rebuilt = chain(&pos7, 1);
        let resp = service.ingest(&batch(&pos7, &rebuilt)).unwrap();

        assert_eq!(resp.acknowledged_up_to_id, None);
        assert_eq!(
            resp.rejected,
            Some(Rejection::ChainDivergence {
                expected_previous_hash: original[1].hash().clone(),
                received_previous_hash: ChainHash::genesis(),
            })
        );
        assert_eq!(service.event_count().unwrap(), 2);
    }

    #[test]
    fn gap_after_accepted_prefix_acknowledges_the_prefix() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 4);

        let with_gap = vec![events[0].clone(), events[1].clone(), events[3].clone()];
        let resp = service.ingest(&batch(&pos7, &with_gap)).unwrap();

        assert_eq!(resp, SyncResponse::acknowledged(events[1].id()));
        assert_eq!(service.event_count().unwrap(), 2);
    }

    #[test]
    fn edited_payload_is_tampered() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 2);

        let mut edited = events[1].fields();
        edited.payload = json!({"orderId": "A1", "amount": 4200});
        let forged = Event::restore(
            edited,
            events[1].previous_hash().clone(),
            events[1].hash().clone(),
            SyncState::Unsynced,
            None,
        );

        let resp = service
            .ingest(&batch(&pos7, &[events[0].clone(), forged]))
            .unwrap();

        assert_eq!(resp.acknowledged_up_to_id, Some(events[0].id()));
        assert!(matches!(
            resp.rejected,
            Some(Rejection::Tampered { event_id, .. }) if event_id == events[1].id()
        ));
        assert_eq!(service.event_count().unwrap(), 1);
    }

    #[test]
    fn known_id_with_other_hash_is_tampered() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let events = chain(&pos7, 1);
        service.ingest(&batch(&pos7, &events)).unwrap();

        let mut reused = fields(&pos7, 7);
        reused.id = events[0].id();
        let impostor = reused.seal(ChainHash::genesis()).unwrap();

        let resp = service.ingest(&batch(&pos7, &[impostor])).unwrap();
        assert!(matches!(resp.rejected, Some(Rejection::Tampered { .. })));
    }

    #[test]
    fn foreign_event_in_batch_is_tampered() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let pos8 = scope("pos-8");

        let resp = service.ingest(&batch(&pos7, &chain(&pos8, 1))).unwrap();
        assert!(matches!(resp.rejected, Some(Rejection::Tampered { .. })));
        assert!(service.head(&pos7).unwrap().is_none());
    }

    #[test]
    fn chains_of_one_tenant_are_independent() {
        let service = IngestService::new();
        let pos7 = scope("pos-7");
        let pos8 = scope("pos-8");
        let a = chain(&pos7, 2);
        let b = chain(&pos8, 3);

        service.ingest(&batch(&pos8, &b)).unwrap();
        service.ingest(&batch(&pos7, &a)).unwrap();

        let all = service
            .tenant_events(&TenantId::new("brunch-co").unwrap())
            .unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(all[..2], a[..]);
        assert_eq!(all[2..], b[..]);
        assert!(service
            .tenant_events(&TenantId::new("other-co").unwrap())
            .unwrap()
            .is_empty());
    }
}

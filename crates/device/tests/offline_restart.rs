//! Events recorded while offline survive a restart and the chain continues
//! where it left off.

use std::sync::Arc;

use serde_json::json;

use tally_core::{ActorId, DeviceId, EventType, TenantId};
use tally_device::{
    ConnectivityState, EventEngine, IngestTransport, OfflineMode, SyncConfig, SyncWorker,
    TransportError,
};
use tally_events::{ChainHash, ChainScope, SyncBatch, SyncResponse, verify_chain};
use tally_ledger::{LedgerConfig, LocalLedger, SqliteLedger};

struct Unreachable;

#[async_trait::async_trait]
impl IngestTransport for Unreachable {
    async fn submit(&self, _batch: &SyncBatch) -> Result<SyncResponse, TransportError> {
        Err(TransportError::Network("no route to host".into()))
    }

    async fn check_connectivity(&self) -> bool {
        false
    }
}

fn ids() -> (DeviceId, TenantId) {
    (DeviceId::new("pos-7").unwrap(), TenantId::new("brunch-co").unwrap())
}

async fn open(config: &LedgerConfig) -> Arc<SqliteLedger> {
    let (device, tenant) = ids();
    Arc::new(
        SqliteLedger::open(config, ChainScope::new(device, tenant))
            .await
            .unwrap(),
    )
}

#[tokio::test]
async fn offline_events_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = LedgerConfig::default().with_path(dir.path().join("pos-7.db"));
    let (device, tenant) = ids();

    let before = {
        let ledger = open(&config).await;
        let engine = EventEngine::new(device.clone(), tenant.clone(), ledger.clone()).unwrap();
        let worker = SyncWorker::new(ledger.clone(), Unreachable, SyncConfig::default())
            .with_offline_mode(OfflineMode::new(ConnectivityState::Offline));
        let handle = worker.start();

        let mut recorded = Vec::new();
        for n in 0..4 {
            recorded.push(
                engine
                    .create_event(
                        EventType::from_static("ORDER_CREATED"),
                        ActorId::new("user-1").unwrap(),
                        json!({"orderId": format!("A{n}")}),
                    )
                    .await
                    .unwrap(),
            );
            assert_eq!(ledger.unsynced_count().await.unwrap(), n + 1);
        }

        handle.shutdown().await.unwrap();
        ledger.close().await;
        recorded
    };

    let ledger = open(&config).await;
    assert_eq!(ledger.last_hash().await.unwrap(), *before[3].hash());
    assert_eq!(ledger.unsynced_events(None).await.unwrap(), before);

    let engine = EventEngine::new(device, tenant, ledger.clone()).unwrap();
    let next = engine
        .create_event(
            EventType::from_static("PAYMENT_COLLECTED"),
            ActorId::new("user-1").unwrap(),
            json!({"orderId": "A3", "amount": 42, "currency": "EGP"}),
        )
        .await
        .unwrap();
    assert_eq!(next.previous_hash(), before[3].hash());

    let all = ledger.events(1, None).await.unwrap();
    verify_chain(&ChainHash::genesis(), &all).unwrap();
    assert_eq!(all.len(), 5);
}

use std::sync::Arc;

use chrono::DateTime;
use reqwest::StatusCode;
use serde_json::json;

use tally_core::{ActorId, DeviceId, EventId, EventType, TenantId};
use tally_events::{ChainHash, ChainScope, Event, EventFields, SyncBatch, SyncResponse};
use tally_ingest::{IngestService, app::build_app};

struct TestServer {
    base_url: String,
    service: Arc<IngestService>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(token: Option<&str>) -> Self {
        let service = Arc::new(IngestService::new());
        let app = build_app(service.clone(), token.map(str::to_string));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            service,
            handle,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn scope() -> ChainScope {
    ChainScope::new(DeviceId::new("pos-7").unwrap(), TenantId::new("brunch-co").unwrap())
}

fn chain(n: i64) -> Vec<Event> {
    let mut out: Vec<Event> = Vec::new();
    for i in 0..n {
        let prev = out.last().map(|e| e.hash().clone()).unwrap_or_default();
        let event = EventFields {
            id: EventId::new(),
            event_type: EventType::from_static("ORDER_CREATED"),
            actor_id: ActorId::new("user-1").unwrap(),
            payload: json!({"orderId": format!("A{i}"), "amount": 42}),
            device_id: DeviceId::new("pos-7").unwrap(),
            tenant_id: TenantId::new("brunch-co").unwrap(),
            timestamp: DateTime::from_timestamp_millis(1_700_000_000_000 + i).unwrap(),
        }
        .seal(prev)
        .unwrap();
        out.push(event);
    }
    out
}

async fn post_batch(
    client: &reqwest::Client,
    srv: &TestServer,
    events: &[Event],
) -> (StatusCode, SyncResponse) {
    let res = client
        .post(format!("{}/v1/sync/batches", srv.base_url))
        .json(&SyncBatch::new(scope(), events.to_vec()))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn health_is_open() {
    let srv = TestServer::spawn(Some("s3cret")).await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn token_is_required_when_configured() {
    let srv = TestServer::spawn(Some("s3cret")).await;
    let client = reqwest::Client::new();
    let batch = SyncBatch::new(scope(), chain(1));

    let res = client
        .post(format!("{}/v1/sync/batches", srv.base_url))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/v1/sync/batches", srv.base_url))
        .bearer_auth("s3cret")
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn batch_is_acknowledged_and_visible() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();
    let events = chain(3);

    let (status, resp) = post_batch(&client, &srv, &events).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp.acknowledged_up_to_id, Some(events[2].id()));
    assert_eq!(resp.rejected, None);

    // resend changes nothing
    let (status, resp) = post_batch(&client, &srv, &events).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resp.acknowledged_up_to_id, Some(events[2].id()));
    assert_eq!(srv.service.event_count().unwrap(), 3);

    let head: serde_json::Value = client
        .get(format!(
            "{}/v1/tenants/brunch-co/devices/pos-7/head",
            srv.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(head["hash"], events[2].hash().as_str());
    assert_eq!(head["eventCount"], 3);
    assert_eq!(head["deviceId"], "pos-7");

    let listed: serde_json::Value = client
        .get(format!("{}/v1/tenants/brunch-co/events", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = listed["items"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[0]["type"], "ORDER_CREATED");
    assert_eq!(items[0]["previousHash"], ChainHash::genesis().as_str());
}

#[tokio::test]
async fn divergence_is_a_conflict() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();

    post_batch(&client, &srv, &chain(2)).await;
    let (status, resp) = post_batch(&client, &srv, &chain(1)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(resp.acknowledged_up_to_id, None);
    assert!(resp.rejected.is_some());
}

#[tokio::test]
async fn tampered_event_is_unprocessable() {
    let srv = TestServer::spawn(None).await;
    let client = reqwest::Client::new();
    let events = chain(2);

    let mut batch = serde_json::to_value(SyncBatch::new(scope(), events.clone())).unwrap();
    batch["events"][1]["payload"]["amount"] = json!(4200);

    let res = client
        .post(format!("{}/v1/sync/batches", srv.base_url))
        .json(&batch)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let resp: serde_json::Value = res.json().await.unwrap();
    assert_eq!(resp["acknowledgedUpToId"], events[0].id().to_string());
    assert_eq!(resp["rejected"]["kind"], "TAMPERED");
    assert_eq!(resp["rejected"]["eventId"], events[1].id().to_string());
}

#[tokio::test]
async fn malformed_body_is_a_bad_request() {
    let srv = TestServer::spawn(None).await;
    let res = reqwest::Client::new()
        .post(format!("{}/v1/sync/batches", srv.base_url))
        .json(&json!({"deviceId": "pos-7"}))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_batch");
}

#[tokio::test]
async fn unknown_chain_head_is_not_found() {
    let srv = TestServer::spawn(None).await;
    let res = reqwest::get(format!(
        "{}/v1/tenants/brunch-co/devices/pos-9/head",
        srv.base_url
    ))
    .await
    .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

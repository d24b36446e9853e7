use axum::{
    Router,
    routing::{get, post},
};

pub mod chains;
pub mod sync;
pub mod system;

/// Router for the versioned endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/v1/sync/batches", post(sync::submit_batch))
        .route("/v1/tenants/:tenant_id/events", get(chains::list_tenant_events))
        .route(
            "/v1/tenants/:tenant_id/devices/:device_id/head",
            get(chains::chain_head),
        )
}

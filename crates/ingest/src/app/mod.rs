//! HTTP wiring for the ingest endpoint.
//!
//! - `routes/`: one file per area
//! - `errors.rs`: consistent JSON error bodies

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;
use crate::service::IngestService;

pub mod errors;
pub mod routes;

/// Build the full router. When `token` is set, every `/v1` route requires it
/// as a bearer token; `/health` stays open for reachability probes.
pub fn build_app(service: Arc<IngestService>, token: Option<String>) -> Router {
    let auth_state = middleware::AuthState::new(token);

    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::require_token,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(service)))
}

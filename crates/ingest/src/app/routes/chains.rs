use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use tally_core::{DeviceId, TenantId};
use tally_events::ChainScope;

use crate::app::errors;
use crate::service::IngestService;

pub async fn list_tenant_events(
    Extension(service): Extension<Arc<IngestService>>,
    Path(tenant_id): Path<String>,
) -> axum::response::Response {
    let tenant_id = match TenantId::new(tenant_id) {
        Ok(t) => t,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_tenant_id", e.to_string()),
    };

    match service.tenant_events(&tenant_id) {
        Ok(items) => (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response(),
        Err(e) => errors::ingest_error_to_response(e),
    }
}

pub async fn chain_head(
    Extension(service): Extension<Arc<IngestService>>,
    Path((tenant_id, device_id)): Path<(String, String)>,
) -> axum::response::Response {
    let scope = match (DeviceId::new(device_id), TenantId::new(tenant_id)) {
        (Ok(device), Ok(tenant)) => ChainScope::new(device, tenant),
        (Err(e), _) | (_, Err(e)) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_chain", e.to_string());
        }
    };

    match service.head(&scope) {
        Ok(Some(head)) => (StatusCode::OK, Json(head)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "no events stored for this chain"),
        Err(e) => errors::ingest_error_to_response(e),
    }
}

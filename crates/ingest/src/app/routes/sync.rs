use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};

use tally_events::{Rejection, SyncBatch};

use crate::app::errors;
use crate::service::IngestService;

/// `POST /v1/sync/batches`
///
/// The body is always a `SyncResponse`: 200 when the batch (or a prefix of
/// it) was accepted, 409 on chain divergence, 422 on tampering.
pub async fn submit_batch(
    Extension(service): Extension<Arc<IngestService>>,
    body: Result<Json<SyncBatch>, JsonRejection>,
) -> axum::response::Response {
    let Json(batch) = match body {
        Ok(batch) => batch,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_batch", e.body_text()),
    };

    match service.ingest(&batch) {
        Ok(response) => {
            let status = match &response.rejected {
                None => StatusCode::OK,
                Some(Rejection::ChainDivergence { .. }) => StatusCode::CONFLICT,
                Some(Rejection::Tampered { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            };
            (status, Json(response)).into_response()
        }
        Err(e) => errors::ingest_error_to_response(e),
    }
}

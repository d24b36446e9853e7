use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use crate::service::IngestError;

pub fn ingest_error_to_response(err: IngestError) -> axum::response::Response {
    match err {
        IngestError::Poisoned => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            err.to_string(),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

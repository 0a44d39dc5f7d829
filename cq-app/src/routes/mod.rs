pub mod ingest;
pub mod monitor;
pub mod trigger;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use cq_core::QueueError;
use serde::Serialize;

pub fn router() -> Router {
    Router::new()
        .merge(ingest::router())
        .merge(trigger::router())
        .merge(monitor::router())
}

pub(crate) type JsonResponse = (StatusCode, Json<serde_json::Value>);

/// Serializes `body` and stamps it with a top-level `status` field.
pub(crate) fn ok_json(status: &str, body: &impl Serialize) -> JsonResponse {
    match serde_json::to_value(body) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("status".to_string(), serde_json::json!(status));
            (StatusCode::OK, Json(serde_json::Value::Object(map)))
        }
        Ok(other) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": status, "result": other })),
        ),
        Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub(crate) fn error_json(status: StatusCode, error: impl Into<String>) -> JsonResponse {
    (
        status,
        Json(serde_json::json!({
            "status": "error",
            "error": error.into(),
        })),
    )
}

pub(crate) fn queue_error_status(error: &QueueError) -> StatusCode {
    match error {
        QueueError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        QueueError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueueError::Scheduler(_) => StatusCode::BAD_GATEWAY,
        QueueError::CorruptEntry { .. } | QueueError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn queue_error_json(error: QueueError) -> JsonResponse {
    let status = queue_error_status(&error);
    if status.is_server_error() {
        tracing::error!(%error, "queue request failed");
    }
    error_json(status, error.to_string())
}

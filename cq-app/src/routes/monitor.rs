use super::{JsonResponse, error_json, ok_json, queue_error_json};
use crate::server::QueueState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json};
use cq_core::ConversationKey;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/queue/health", get(get_health))
        .route("/api/v1/queue/cleanup", post(cleanup))
        .route("/api/v1/queue/emergency-cleanup", post(emergency_cleanup))
        .route("/api/v1/queue/batches/{key}", get(get_batch))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<QueueState>>) -> JsonResponse {
    match state.monitor.health().await {
        Ok(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(body) => (StatusCode::OK, Json(body)),
            Err(e) => error_json(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        Err(e) => queue_error_json(e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn cleanup(Extension(state): Extension<Arc<QueueState>>) -> JsonResponse {
    match state.monitor.cleanup().await {
        Ok(report) => ok_json("ok", &report),
        Err(e) => queue_error_json(e),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn emergency_cleanup(Extension(state): Extension<Arc<QueueState>>) -> JsonResponse {
    match state.monitor.emergency_cleanup().await {
        Ok(report) => ok_json("ok", &report),
        Err(e) => queue_error_json(e),
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_batch(
    Path(raw_key): Path<String>,
    Extension(state): Extension<Arc<QueueState>>,
) -> JsonResponse {
    let key = match ConversationKey::parse(&raw_key) {
        Ok(key) => key,
        Err(e) => return queue_error_json(e),
    };
    match state.buffer.batch(&key).await {
        Ok(Some(batch)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "state": batch.state.label(),
                "batch": batch,
            })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "status": "not_found",
                "error": format!("no batch for {key}"),
            })),
        ),
        Err(e) => queue_error_json(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{call, memory_config, test_app};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use std::time::Duration;

    const WEBHOOK_SLOW_SWEEP: &str = r#"
        [scheduler]
        mode = "webhook"
        follow_up_url = "http://127.0.0.1:9/follow-ups"
        timeout_seconds = 1

        [recovery]
        sweep_interval_seconds = 86400
        emergency_threshold_seconds = 600
    "#;

    async fn ingest(router: &axum::Router, sender: &str, text: &str) {
        let (status, _) = call(
            router,
            Method::POST,
            "/api/v1/queue/messages",
            Some(json!({ "channel_id": "whatsapp", "sender_id": sender, "text": text })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_pending_work() {
        let app = test_app(memory_config(WEBHOOK_SLOW_SWEEP)).await;
        ingest(&app.router, "a", "hello").await;
        ingest(&app.router, "b", "hi").await;

        let (status, body) = call(&app.router, Method::GET, "/api/v1/queue/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store_backend"], "memory");
        assert_eq!(body["total_pending_messages"], 2);
        assert_eq!(body["indexed_keys"], 2);
        app.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_on_quiet_queue_is_a_no_op() {
        let app = test_app(memory_config("")).await;
        for _ in 0..2 {
            let (status, body) =
                call(&app.router, Method::POST, "/api/v1/queue/cleanup", None, None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["removed_locks"], 0);
            assert_eq!(body["removed_orphans"], 0);
        }
        app.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn admin_routes_require_configured_token() {
        let app = test_app(memory_config("[security]\nadmin_token = \"ops-token\"")).await;
        let (status, _) = call(&app.router, Method::POST, "/api/v1/queue/cleanup", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(
            &app.router,
            Method::POST,
            "/api/v1/queue/emergency-cleanup",
            None,
            Some("ops-token"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        app.runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn emergency_cleanup_expires_abandoned_conversations() {
        let app = test_app(memory_config(WEBHOOK_SLOW_SWEEP)).await;
        ingest(&app.router, "stale", "anyone?").await;
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        ingest(&app.router, "fresh", "new here").await;

        let (status, body) = call(
            &app.router,
            Method::POST,
            "/api/v1/queue/emergency-cleanup",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed_keys"], json!(["whatsapp:stale"]));
        assert_eq!(body["dropped_messages"], 1);
        assert!(app.handler.texts().is_empty());

        let (_, health) = call(&app.router, Method::GET, "/api/v1/queue/health", None, None).await;
        assert_eq!(health["emergency_expired_total"], 1);
        let kinds: Vec<&str> = health["recent_events"]
            .as_array()
            .expect("events")
            .iter()
            .filter_map(|e| e["kind"].as_str())
            .collect();
        assert!(kinds.contains(&"emergency_expired"), "{kinds:?}");
        app.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn batch_inspection_shows_state() {
        let app = test_app(memory_config(WEBHOOK_SLOW_SWEEP)).await;
        ingest(&app.router, "c", "look at me").await;

        let (status, body) = call(
            &app.router,
            Method::GET,
            "/api/v1/queue/batches/whatsapp:c",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "active");
        assert_eq!(body["batch"]["messages"].as_array().map(Vec::len), Some(1));

        let (status, body) = call(
            &app.router,
            Method::GET,
            "/api/v1/queue/batches/whatsapp:nobody",
            None,
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "not_found");
        app.runtime.shutdown().await;
    }
}

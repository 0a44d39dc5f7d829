use super::{JsonResponse, ok_json, queue_error_json};
use crate::server::QueueState;
use axum::routing::post;
use axum::{Extension, Json};
use cq_core::ConversationKey;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct FlushCheckRequest {
    conversation_key: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/queue/flush-check", post(flush_check))
}

/// Called by the in-process timer's external stand-in; an early call only re-arms.
#[tracing::instrument(level = "info", skip_all)]
async fn flush_check(
    Extension(state): Extension<Arc<QueueState>>,
    Json(req): Json<FlushCheckRequest>,
) -> JsonResponse {
    let key = match ConversationKey::parse(req.conversation_key.trim()) {
        Ok(key) => key,
        Err(e) => return queue_error_json(e),
    };
    match state.buffer.request_flush_check(&key).await {
        Ok(check) => ok_json("ok", &check),
        Err(e) => queue_error_json(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::routes::test_support::{call, memory_config, test_app};
    use axum::http::{Method, StatusCode};
    use serde_json::json;
    use std::time::Duration;

    async fn ingest(router: &axum::Router, text: &str) {
        let (status, _) = call(
            router,
            Method::POST,
            "/api/v1/queue/messages",
            Some(json!({ "channel_id": "signal", "sender_id": "+1999", "text": text })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn check(router: &axum::Router) -> serde_json::Value {
        let (status, body) = call(
            router,
            Method::POST,
            "/api/v1/queue/flush-check",
            Some(json!({ "conversation_key": "signal:+1999" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        body
    }

    #[tokio::test(start_paused = true)]
    async fn early_check_waits_then_due_check_flushes() {
        let cfg = memory_config(
            r#"
            [scheduler]
            mode = "webhook"
            follow_up_url = "http://127.0.0.1:9/follow-ups"
            timeout_seconds = 1
            "#,
        );
        let app = test_app(cfg).await;
        ingest(&app.router, "first").await;

        let body = check(&app.router).await;
        assert_eq!(body["action"]["action"], "reschedule");
        assert!(body.get("outcome").is_none());
        assert!(app.handler.texts().is_empty());

        tokio::time::advance(Duration::from_secs(6)).await;
        let body = check(&app.router).await;
        assert_eq!(body["action"]["action"], "flush");
        assert_eq!(body["outcome"]["outcome"], "completed");
        assert_eq!(app.handler.texts(), vec!["first".to_string()]);

        let body = check(&app.router).await;
        assert_eq!(body["action"]["action"], "idle");
        app.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_conversation_is_idle() {
        let app = test_app(memory_config("")).await;
        let body = check(&app.router).await;
        assert_eq!(body["action"]["action"], "idle");
        app.runtime.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_key_is_bad_request() {
        let app = test_app(memory_config("")).await;
        let (status, body) = call(
            &app.router,
            Method::POST,
            "/api/v1/queue/flush-check",
            Some(json!({ "conversation_key": "no-separator" })),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        app.runtime.shutdown().await;
    }
}

//! Follow-up scheduling for stateless deployments: an external timer service is
//! told when to call `flush-check` for a conversation.

use anyhow::anyhow;
use cq_core::clock::to_chrono;
use cq_core::error::{QueueError, Result};
use cq_core::{Clock, ConversationKey, DebounceScheduler};
use reqwest::Url;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct FollowUpRequest {
    conversation_key: String,
    delay_ms: u64,
    not_before: chrono::DateTime<chrono::Utc>,
}

pub struct WebhookScheduler {
    http: reqwest::Client,
    follow_up_url: Url,
    auth_token: Option<String>,
    clock: Arc<dyn Clock>,
}

impl WebhookScheduler {
    pub fn new(follow_up_url: &str, timeout: Duration, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let follow_up_url = Url::parse(follow_up_url.trim())
            .map_err(|e| anyhow!("invalid scheduler.follow_up_url {follow_up_url:?}: {e}"))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            follow_up_url,
            auth_token: None,
            clock,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }
}

#[async_trait::async_trait]
impl DebounceScheduler for WebhookScheduler {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn schedule(&self, key: &ConversationKey, delay: Duration) -> Result<()> {
        let body = FollowUpRequest {
            conversation_key: key.storage_key(),
            delay_ms: delay.as_millis() as u64,
            not_before: self.clock.now() + to_chrono(delay),
        };
        let mut request = self.http.post(self.follow_up_url.clone()).json(&body);
        if let Some(token) = self.auth_token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| QueueError::Scheduler(format!("follow-up request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::Scheduler(format!(
                "follow-up endpoint responded status={status}"
            )));
        }
        tracing::debug!(
            conversation_key = %key,
            delay_ms = body.delay_ms,
            "follow-up requested"
        );
        Ok(())
    }

    /// Nothing to cancel remotely; a stale follow-up finds nothing due and does nothing.
    async fn cancel(&self, _key: &ConversationKey) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::routing::post;
    use cq_core::ManualClock;
    use std::sync::Mutex;

    async fn serve(status: StatusCode, seen: Arc<Mutex<Vec<serde_json::Value>>>) -> String {
        let app = axum::Router::new().route(
            "/follow-ups",
            post(move |Json(body): Json<serde_json::Value>| {
                let seen = seen.clone();
                async move {
                    seen.lock().expect("lock").push(body);
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/follow-ups")
    }

    fn clock() -> Arc<ManualClock> {
        let start = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("timestamp")
            .with_timezone(&chrono::Utc);
        Arc::new(ManualClock::new(start))
    }

    #[tokio::test]
    async fn schedule_posts_due_time() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let url = serve(StatusCode::ACCEPTED, seen.clone()).await;
        let scheduler =
            WebhookScheduler::new(&url, Duration::from_secs(5), clock()).expect("scheduler");

        let key = ConversationKey::new("whatsapp", "+4412345");
        scheduler
            .schedule(&key, Duration::from_millis(5_000))
            .await
            .expect("scheduled");
        scheduler.cancel(&key).await.expect("cancel is a no-op");

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["conversation_key"], "whatsapp:+4412345");
        assert_eq!(seen[0]["delay_ms"], 5_000);
        assert_eq!(seen[0]["not_before"], "2026-01-01T00:00:05Z");
    }

    #[tokio::test]
    async fn rejected_follow_up_is_a_scheduler_error() {
        let url = serve(StatusCode::BAD_GATEWAY, Arc::default()).await;
        let scheduler =
            WebhookScheduler::new(&url, Duration::from_secs(5), clock()).expect("scheduler");
        let err = scheduler
            .schedule(&ConversationKey::new("sms", "1"), Duration::from_secs(1))
            .await
            .expect_err("must fail");
        assert!(matches!(err, QueueError::Scheduler(_)));
    }
}

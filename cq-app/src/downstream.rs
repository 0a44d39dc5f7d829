//! Flush callback that forwards each combined batch to the downstream responder.

use anyhow::anyhow;
use cq_core::error::ProcessError;
use cq_core::{CombinedBatch, FlushHandler};
use reqwest::{StatusCode, Url};
use std::time::Duration;

const ERROR_BODY_PREVIEW_CHARS: usize = 256;

#[derive(Clone)]
pub struct HttpFlushHandler {
    http: reqwest::Client,
    process_url: Url,
    auth_token: Option<String>,
}

impl HttpFlushHandler {
    pub fn new(process_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let process_url = Url::parse(process_url.trim())
            .map_err(|e| anyhow!("invalid downstream.process_url {process_url:?}: {e}"))?;
        if !matches!(process_url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "downstream.process_url must be http(s), got {}",
                process_url.scheme()
            ));
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            process_url,
            auth_token: None,
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

    pub fn process_url(&self) -> &Url {
        &self.process_url
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl FlushHandler for HttpFlushHandler {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(
            conversation_key = %batch.conversation_key,
            batch_id = %batch.batch_id,
            attempt = batch.attempt
        )
    )]
    async fn process(&self, batch: &CombinedBatch) -> Result<(), ProcessError> {
        let response = self
            .authorized_request(self.http.post(self.process_url.clone()))
            .header("idempotency-key", format!("{}:{}", batch.batch_id, batch.attempt))
            .json(batch)
            .send()
            .await
            .map_err(|e| ProcessError::Retryable(format!("downstream request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(status = status.as_u16(), "downstream accepted batch");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
        let message = format!("downstream responded status={status} body={preview}");
        Err(classify_status(status, message))
    }
}

/// 408, 429 and 5xx are worth retrying; any other non-2xx will not get better.
pub fn classify_status(status: StatusCode, message: String) -> ProcessError {
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ProcessError::Retryable(message)
    } else {
        ProcessError::Fatal(message)
    }
}

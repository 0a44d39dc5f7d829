use super::{JsonResponse, ok_json, queue_error_json};
use crate::server::QueueState;
use axum::routing::post;
use axum::{Extension, Json};
use cq_core::{ContentKind, ConversationKey};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct IngestRequest {
    channel_id: String,
    sender_id: String,
    /// Channel-native event, forwarded untouched to the downstream responder.
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    text: String,
    #[serde(default)]
    kind: ContentKind,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/queue/messages", post(submit_message))
}

#[tracing::instrument(level = "info", skip_all)]
async fn submit_message(
    Extension(state): Extension<Arc<QueueState>>,
    Json(req): Json<IngestRequest>,
) -> JsonResponse {
    let key = match ConversationKey::try_new(&req.channel_id, &req.sender_id) {
        Ok(key) => key,
        Err(e) => return queue_error_json(e),
    };
    match state
        .buffer
        .submit(&key, req.payload, &req.text, req.kind)
        .await
    {
        Ok(receipt) => {
            let label = if receipt.accepted { "accepted" } else { "ignored" };
            ok_json(label, &receipt)
        }
        Err(e) => queue_error_json(e),
    }
}

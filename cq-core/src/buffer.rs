//! Ingest facade: accepts messages, coalesces them per conversation and drives
//! the processor from debounce timers or external flush checks.

use crate::batch::ConversationBatch;
use crate::clock::Clock;
use crate::config::BufferConfig;
use crate::error::{QueueError, Result};
use crate::lock::LockManager;
use crate::policy::{
    ArrivalDecision, NextAction, apply_arrival, decide_arrival, in_retry_backoff, is_full,
    next_action,
};
use crate::processor::{FlushHandler, FlushOutcome, Processor};
use crate::scheduler::DebounceScheduler;
use crate::store::{Modification, QueueStore, mutation};
use crate::types::{ContentKind, ConversationKey, PendingMessage};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitReceipt {
    pub accepted: bool,
    pub reason: &'static str,
    pub conversation_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ArrivalDecision>,
    pub pending_messages: usize,
    /// Set when accepting the message triggered an immediate flush.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flushed: Option<FlushOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlushCheck {
    pub conversation_key: String,
    pub action: NextAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<FlushOutcome>,
}

pub struct MessageBuffer {
    cfg: BufferConfig,
    store: Arc<dyn QueueStore>,
    scheduler: Arc<dyn DebounceScheduler>,
    clock: Arc<dyn Clock>,
    processor: Arc<Processor>,
    shutdown: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBuffer {
    pub fn new(
        cfg: BufferConfig,
        store: Arc<dyn QueueStore>,
        locks: Arc<dyn LockManager>,
        handler: Arc<dyn FlushHandler>,
        scheduler: Arc<dyn DebounceScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        cfg.validate()?;
        let processor = Arc::new(Processor::new(
            cfg.clone(),
            Arc::clone(&store),
            locks,
            handler,
            Arc::clone(&scheduler),
            Arc::clone(&clock),
        ));
        Ok(Self {
            cfg,
            store,
            scheduler,
            clock,
            processor,
            shutdown: CancellationToken::new(),
            task_handle: Mutex::new(None),
        })
    }

    pub fn processor(&self) -> Arc<Processor> {
        Arc::clone(&self.processor)
    }

    pub fn config(&self) -> &BufferConfig {
        &self.cfg
    }

    pub fn scheduler_name(&self) -> &'static str {
        self.scheduler.name()
    }

    /// Accepts one inbound event for the conversation.
    ///
    /// Store failures propagate; a message is never dropped silently.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_key = %key))]
    pub async fn submit(
        &self,
        key: &ConversationKey,
        raw_payload: serde_json::Value,
        normalized_text: &str,
        kind: ContentKind,
    ) -> Result<SubmitReceipt> {
        let message = PendingMessage::new(
            key.clone(),
            raw_payload,
            normalized_text,
            kind,
            self.clock.now(),
        );
        if message.is_empty() {
            return Ok(SubmitReceipt {
                accepted: false,
                reason: "empty_message",
                conversation_key: key.storage_key(),
                decision: None,
                pending_messages: 0,
                flushed: None,
            });
        }

        let (decision, modification) = self.admit(key, message.clone(), true).await?;
        if decision != ArrivalDecision::FlushThenStart {
            return self.after_admit(key, decision, modification, decision.reason()).await;
        }

        let backing_off = modification
            .before
            .as_ref()
            .is_some_and(|batch| in_retry_backoff(batch, &self.cfg, self.clock.now()));
        let previous = if backing_off {
            tracing::info!("previous batch is in retry backoff; holding the incompatible arrival");
            None
        } else {
            let previous = self.processor.flush(key).await?;
            tracing::info!(
                outcome = previous.label(),
                "incompatible arrival flushed the previous batch"
            );
            Some(previous)
        };

        // Anything but a settled previous batch leaves the message held for the next unit.
        let (decision, modification) = self.admit(key, message, false).await?;
        let reason = match decision {
            ArrivalDecision::Hold => decision.reason(),
            _ => ArrivalDecision::FlushThenStart.reason(),
        };
        let mut receipt = self.after_admit(key, decision, modification, reason).await?;
        if receipt.flushed.is_none() {
            receipt.flushed = previous;
        }
        Ok(receipt)
    }

    async fn admit(
        &self,
        key: &ConversationKey,
        message: PendingMessage,
        split_allowed: bool,
    ) -> Result<(ArrivalDecision, Modification)> {
        let now = self.clock.now();
        let cfg = self.cfg.clone();
        let incoming = message.clone();
        let modification = self
            .store
            .modify(
                key,
                mutation(move |existing| {
                    let decision = decide_arrival(existing.as_ref(), &incoming, &cfg, now, split_allowed);
                    apply_arrival(existing, incoming, decision, now)
                }),
            )
            .await?;
        // Same pure inputs as inside the mutation, so this is the decision that was applied.
        let decision = decide_arrival(
            modification.before.as_ref(),
            &message,
            &self.cfg,
            now,
            split_allowed,
        );
        Ok((decision, modification))
    }

    async fn after_admit(
        &self,
        key: &ConversationKey,
        decision: ArrivalDecision,
        modification: Modification,
        reason: &'static str,
    ) -> Result<SubmitReceipt> {
        let batch = modification
            .after
            .ok_or_else(|| QueueError::Internal(format!("batch for {key} vanished on append")))?;
        tracing::debug!(
            decision = decision.reason(),
            batch_id = %batch.batch_id,
            messages = batch.messages.len(),
            deferred = batch.deferred.len(),
            "message accepted"
        );

        let mut flushed = None;
        match decision {
            ArrivalDecision::Defer | ArrivalDecision::Hold | ArrivalDecision::FlushThenStart => {}
            _ if is_full(&batch, &self.cfg) => {
                tracing::info!(messages = batch.messages.len(), "batch size cap reached; flushing now");
                flushed = Some(self.processor.flush(key).await?);
            }
            _ => {
                if let Err(error) = self.scheduler.schedule(key, self.cfg.debounce_window).await {
                    tracing::warn!(%error, "debounce scheduling failed; recovery sweep will resume the batch");
                }
            }
        }

        Ok(SubmitReceipt {
            accepted: true,
            reason,
            conversation_key: key.storage_key(),
            decision: Some(decision),
            pending_messages: batch.pending_count(),
            flushed,
        })
    }

    /// Evaluates the conversation and flushes it if due. Safe to call at any time,
    /// any number of times; an early call just re-arms the scheduler.
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_key = %key))]
    pub async fn request_flush_check(&self, key: &ConversationKey) -> Result<FlushCheck> {
        let batch = match self.store.load(key).await {
            Ok(batch) => batch,
            Err(QueueError::CorruptEntry { reason, .. }) => {
                tracing::warn!(%reason, "flush check skipped corrupt record; recovery will quarantine it");
                None
            }
            Err(error) => return Err(error),
        };
        let Some(batch) = batch else {
            return Ok(FlushCheck {
                conversation_key: key.storage_key(),
                action: NextAction::Idle,
                outcome: None,
            });
        };

        let action = next_action(&batch, &self.cfg, self.clock.now());
        let outcome = match action {
            NextAction::Flush | NextAction::Abandon => Some(self.processor.flush(key).await?),
            NextAction::Reschedule(delay) => {
                if let Err(error) = self.scheduler.schedule(key, delay).await {
                    tracing::warn!(%error, "flush check could not re-arm scheduler");
                }
                None
            }
            NextAction::Idle => None,
        };
        Ok(FlushCheck {
            conversation_key: key.storage_key(),
            action,
            outcome,
        })
    }

    /// Flushes immediately regardless of the debounce window or a pending retry
    /// backoff. Operator override; the ingest path never calls it.
    pub async fn flush_now(&self, key: &ConversationKey) -> Result<FlushOutcome> {
        self.processor.flush(key).await
    }

    pub async fn batch(&self, key: &ConversationKey) -> Result<Option<ConversationBatch>> {
        self.store.load(key).await
    }

    /// Consumes due keys from an in-process scheduler. Each key is checked on its own task.
    pub async fn start(self: &Arc<Self>, mut due_keys: mpsc::UnboundedReceiver<ConversationKey>) {
        let mut task_handle = self.task_handle.lock().await;
        if task_handle.is_some() {
            return;
        }
        let buffer = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        *task_handle = Some(tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    key = due_keys.recv() => key,
                };
                let Some(key) = key else {
                    break;
                };
                let buffer = Arc::clone(&buffer);
                tokio::spawn(async move {
                    if let Err(error) = buffer.request_flush_check(&key).await {
                        tracing::warn!(conversation_key = %key, %error, "scheduled flush check failed");
                    }
                });
            }
            tracing::debug!("due-key loop stopped");
        }));
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(?error, "due-key loop shutdown join failed");
            }
        }
    }
}

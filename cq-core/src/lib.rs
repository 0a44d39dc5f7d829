//! Conversation-keyed message coalescing: buffer bursts of inbound messages per
//! conversation, flush each burst once as a combined batch, retry failures with
//! backoff, and repair whatever crashed workers leave behind.

pub mod batch;
pub mod buffer;
pub mod clock;
pub mod config;
pub mod error;
pub mod health;
pub mod lock;
pub mod policy;
pub mod processor;
pub mod recovery;
pub mod scheduler;
pub mod store;
pub mod types;

pub use batch::{BatchState, CombinedBatch, ConversationBatch};
pub use buffer::{FlushCheck, MessageBuffer, SubmitReceipt};
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{BufferConfig, RecoveryConfig};
pub use error::{ProcessError, QueueError, Result};
pub use health::{HealthSnapshot, ProcessingStatsSnapshot, RecoveryEvent, RecoveryEventKind};
pub use lock::{LockManager, LockRecord, MemoryLockManager, ReleaseOutcome};
pub use policy::{ArrivalDecision, NextAction};
pub use processor::{FlushHandler, FlushOutcome, Processor};
pub use recovery::{CleanupReport, EmergencyReport, RecoveryMonitor, SweepReport};
pub use scheduler::{DebounceScheduler, TimerScheduler};
pub use store::{MemoryQueueStore, QueueStore, SqliteStore};
pub use types::{ChannelId, ContentKind, ConversationKey, MessageId, OwnerToken, PendingMessage, SenderId};

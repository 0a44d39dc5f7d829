use crate::error::{QueueError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ChannelId);
id_newtype!(SenderId);
id_newtype!(MessageId);

id_newtype!(OwnerToken);

impl MessageId {
    /// ULID-backed, so lexical order follows creation order.
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl OwnerToken {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Partition key for all buffering state: one channel instance plus one counterparty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    channel_id: ChannelId,
    sender_id: SenderId,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<ChannelId>, sender_id: impl Into<SenderId>) -> Self {
        Self {
            channel_id: channel_id.into(),
            sender_id: sender_id.into(),
        }
    }

    /// Validating constructor for untrusted input.
    pub fn try_new(channel_id: &str, sender_id: &str) -> Result<Self> {
        let channel_id = channel_id.trim();
        let sender_id = sender_id.trim();
        if channel_id.is_empty() {
            return Err(QueueError::InvalidInput("channel_id is required".to_string()));
        }
        if channel_id.contains(':') {
            return Err(QueueError::InvalidInput(format!(
                "channel_id must not contain ':': {channel_id:?}"
            )));
        }
        if sender_id.is_empty() {
            return Err(QueueError::InvalidInput("sender_id is required".to_string()));
        }
        Ok(Self::new(channel_id, sender_id))
    }

    /// Parses the `channel:sender` storage form. The sender part may contain `:`.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((channel_id, sender_id)) = raw.split_once(':') else {
            return Err(QueueError::InvalidInput(format!(
                "conversation key must look like channel:sender, got {raw:?}"
            )));
        };
        Self::try_new(channel_id, sender_id)
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn sender_id(&self) -> &SenderId {
        &self.sender_id
    }

    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.sender_id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.sender_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ContentKind {
    #[default]
    Text,
    Image {
        #[serde(default)]
        captioned: bool,
    },
    Audio,
    Video,
    Document,
    Other,
}

impl ContentKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image { captioned: true } => "captioned_image",
            Self::Image { captioned: false } => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

/// One inbound event waiting in a batch. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: MessageId,
    pub conversation_key: ConversationKey,
    pub raw_payload: serde_json::Value,
    pub normalized_text: String,
    #[serde(default)]
    pub kind: ContentKind,
    pub arrived_at: DateTime<Utc>,
}

impl PendingMessage {
    pub fn new(
        conversation_key: ConversationKey,
        raw_payload: serde_json::Value,
        normalized_text: impl Into<String>,
        kind: ContentKind,
        arrived_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            conversation_key,
            raw_payload,
            normalized_text: normalized_text.into(),
            kind,
            arrived_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.normalized_text.trim().is_empty() && self.raw_payload.is_null()
    }
}

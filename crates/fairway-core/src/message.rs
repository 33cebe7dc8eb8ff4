use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Core message domain type. Immutable once received from the source; the
/// dispatcher only looks at `session_key`, `sequence_id` and `id`, the payload
/// is opaque until a handler decodes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub session_key: String,
    /// Monotonic per session, assigned at send time.
    pub sequence_id: u64,
    pub payload: Vec<u8>,
    pub content_type: String,
    /// Number of times this message was handed out before the current delivery.
    pub delivery_count: u32,
    pub enqueued_at: u64,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }
}

/// A message as published by a producer, before the source assigns identity.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub session_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
}

impl OutboundMessage {
    pub fn new(
        session_key: impl Into<String>,
        payload: Vec<u8>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            payload,
            content_type: content_type.into(),
        }
    }
}

/// What the source hands back from `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageReceipt {
    pub id: Uuid,
    pub sequence_id: u64,
}

/// Peek-lock handle for one delivery of a message. A redelivery of the same
/// message carries a fresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub message_id: Uuid,
    pub token: Uuid,
}

/// One peek-locked delivery from the source.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub lease: LeaseToken,
}

pub(crate) fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

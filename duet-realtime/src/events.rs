//! Payload types carried on the pairing topics and the event sink.
//!
//! All payloads are camelCase JSON. Tagged fields (`type`, `eventType`) are
//! closed enums, so an unknown tag fails decoding instead of slipping through.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Chat message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Text,
    Image,
    System,
}

/// A chat message as delivered on the plain chat topic.
///
/// Messages from the E2EE topic are decrypted into the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: i64,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub image_url: Option<String>,
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub temp_id: Option<String>,
}

/// A chat message as carried on the E2EE topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct E2eeChatMessage {
    pub id: i64,
    pub sender_id: i64,
    pub encrypted_content: String,
    pub iv: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub is_read: bool,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub temp_id: Option<String>,
}

impl E2eeChatMessage {
    /// The same message with its decrypted content.
    pub fn into_plain(self, content: String) -> ChatMessage {
        ChatMessage {
            id: self.id,
            sender_id: self.sender_id,
            content: Some(content),
            message_type: self.message_type,
            image_url: None,
            is_read: self.is_read,
            read_at: None,
            created_at: self.created_at,
            temp_id: self.temp_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub reader_id: i64,
    #[serde(default)]
    pub last_read_message_id: Option<i64>,
    pub read_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub user_id: i64,
    pub is_typing: bool,
}

/// What happened to a synced domain object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncEventType {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: i64,
    pub title: String,
    pub date: NaiveDate,
    /// `HH:mm[:ss]`, as sent by the server.
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub all_day: bool,
    #[serde(default)]
    pub memo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketItem {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finance {
    pub id: i64,
    pub title: String,
    pub amount: i64,
    pub transaction_type: String,
    #[serde(default)]
    pub category: Option<String>,
    pub date: NaiveDate,
    #[serde(default)]
    pub shared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSync {
    pub event_type: SyncEventType,
    pub schedule: Schedule,
    pub user_id: i64,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketSync {
    pub event_type: SyncEventType,
    pub bucket_item: BucketItem,
    pub user_id: i64,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinanceSync {
    pub event_type: SyncEventType,
    pub finance: Finance,
    pub user_id: i64,
    pub timestamp: NaiveDateTime,
}

// -- Outbound payloads --

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingChatMessage {
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub temp_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingE2eeMessage {
    pub encrypted_content: String,
    pub iv: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub temp_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingReadReceipt {
    pub last_read_message_id: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingTyping {
    pub is_typing: bool,
}

/// Everything the client reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected { reason: Option<String> },
    /// `encrypted` is true when the message arrived on the E2EE topic.
    ChatMessage { message: ChatMessage, encrypted: bool },
    ReadReceipt(ReadReceipt),
    Typing(TypingIndicator),
    Schedule(ScheduleSync),
    Bucket(BucketSync),
    Finance(FinanceSync),
    Error(String),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ChatMessage { .. } => "chat-message",
            Self::ReadReceipt(_) => "read-receipt",
            Self::Typing(_) => "typing",
            Self::Schedule(_) => "schedule",
            Self::Bucket(_) => "bucket",
            Self::Finance(_) => "finance",
            Self::Error(_) => "error",
        }
    }
}

/// The single consumer of [`SyncEvent`]s.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: mpsc::UnboundedSender<SyncEvent>,
}

impl EventSink {
    pub fn new(sender: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self { sender }
    }

    /// A sink plus the receiver it feeds.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Deliver an event; returns false once the receiver is gone.
    pub fn emit(&self, event: SyncEvent) -> bool {
        let name = event.name();
        match self.sender.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!("event sink closed, dropping {name}");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Connection state of the realtime client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

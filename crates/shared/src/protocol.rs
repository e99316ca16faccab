use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, PresenceStatus, UserId},
    error::ApiError,
};

/// One direct message as it travels over the wire. `text` and `image_url`
/// are both optional but never both absent for a persisted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Frames a connected client may push over its socket. Message operations
/// go over HTTP; the socket only carries lightweight realtime signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientFrame {
    UpdatePresence { status: PresenceStatus },
    Typing { receiver_id: UserId, is_typing: bool },
}

/// Events pushed to live connections. Transient: these exist only on the
/// wire and in in-memory dispatch, never in the store. Tag names are the
/// wire contract consumed by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    NewMessage {
        message: MessagePayload,
    },
    MessageDeleted {
        message_id: MessageId,
        sender_id: UserId,
        receiver_id: UserId,
    },
    MessagesCleared {
        sender_id: UserId,
        receiver_id: UserId,
        deleted_count: u64,
    },
    GetOnlineUsers {
        user_ids: Vec<UserId>,
    },
    UserOnline {
        user_id: UserId,
    },
    UserOffline {
        user_id: UserId,
        last_seen_at: DateTime<Utc>,
    },
    UserPresenceUpdate {
        user_id: UserId,
        status: PresenceStatus,
        last_seen_at: DateTime<Utc>,
    },
    UserTyping {
        sender_id: UserId,
        is_typing: bool,
    },
    Error(ApiError),
}

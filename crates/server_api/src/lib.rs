use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use realtime::RealtimeHub;
use shared::{
    domain::{MessageId, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{MessagePayload, ServerEvent},
};
use storage::{Storage, StoredMessage};

pub mod media;

pub use media::{MediaError, MediaStore, MissingMediaStore, StorageMediaStore};

/// Cap applied to a catch-up query with no cursor.
pub const CATCH_UP_DEFAULT_LIMIT: u32 = 100;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub hub: Arc<RealtimeHub>,
    pub media: Arc<dyn MediaStore>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub text: Option<String>,
    /// Base64 image payload (optionally a data URL).
    #[serde(default)]
    pub image: Option<String>,
}

/// Persists a message and fans `newMessage` out to the receiver's and the
/// sender's live connections. Fan-out is enqueue-only: it can neither
/// delay nor fail the response, which depends on persistence alone.
/// Delivery to the sender's other devices is intentional; clients
/// reconcile the duplicate against their optimistic copy.
pub async fn send_message(
    ctx: &ApiContext,
    sender_id: UserId,
    receiver_id: UserId,
    request: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    let text = request
        .text
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let image = request
        .image
        .as_deref()
        .map(str::trim)
        .filter(|i| !i.is_empty());
    if text.is_none() && image.is_none() {
        return Err(ApiError::new(
            ErrorCode::EmptyMessage,
            "message needs text or an image",
        ));
    }

    let image_url = match image {
        Some(data) => Some(
            ctx.media
                .upload(sender_id, data)
                .await
                .map_err(|e| ApiError::new(ErrorCode::MediaUploadFailed, e.to_string()))?,
        ),
        None => None,
    };

    let stored = ctx
        .storage
        .insert_message(sender_id, receiver_id, text, image_url.as_deref())
        .await
        .map_err(persistence)?;
    let message = message_payload(stored);

    let event = ServerEvent::NewMessage {
        message: message.clone(),
    };
    let delivered = ctx.hub.bus().send_to_user(receiver_id, event.clone());
    let echoed = if sender_id != receiver_id {
        ctx.hub.bus().send_to_user(sender_id, event)
    } else {
        0
    };
    debug!(
        message_id = message.message_id.0,
        delivered, echoed, "message fanned out"
    );

    Ok(message)
}

/// Only the sender may delete a message. Both parties' connections hear
/// about it.
pub async fn delete_message(
    ctx: &ApiContext,
    requester_id: UserId,
    message_id: MessageId,
) -> Result<(), ApiError> {
    let message = ctx
        .storage
        .load_message(message_id)
        .await
        .map_err(persistence)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "message not found"))?;
    if message.sender_id != requester_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the sender can delete a message",
        ));
    }

    ctx.storage
        .delete_message(message_id)
        .await
        .map_err(persistence)?;

    let event = ServerEvent::MessageDeleted {
        message_id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
    };
    ctx.hub.bus().send_to_user(message.receiver_id, event.clone());
    if message.sender_id != message.receiver_id {
        ctx.hub.bus().send_to_user(message.sender_id, event);
    }
    Ok(())
}

/// Clears one direction of a conversation: only messages the requester
/// sent to the other user. Returns the count actually removed, which is
/// also what the `messagesCleared` event carries.
pub async fn clear_conversation(
    ctx: &ApiContext,
    requester_id: UserId,
    other_user_id: UserId,
) -> Result<u64, ApiError> {
    let deleted_count = ctx
        .storage
        .delete_conversation(requester_id, other_user_id)
        .await
        .map_err(persistence)?;

    let event = ServerEvent::MessagesCleared {
        sender_id: requester_id,
        receiver_id: other_user_id,
        deleted_count,
    };
    ctx.hub.bus().send_to_user(other_user_id, event.clone());
    if requester_id != other_user_id {
        ctx.hub.bus().send_to_user(requester_id, event);
    }
    Ok(deleted_count)
}

/// Catch-up query of the reconciliation protocol: messages between the
/// pair strictly newer than the cursor, ascending. Without a cursor the
/// most recent `CATCH_UP_DEFAULT_LIMIT` are returned, still ascending.
pub async fn catch_up(
    ctx: &ApiContext,
    user_id: UserId,
    other_user_id: UserId,
    since: Option<DateTime<Utc>>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let limit = since.is_none().then_some(CATCH_UP_DEFAULT_LIMIT);
    let messages = ctx
        .storage
        .find_messages_between(user_id, other_user_id, since, limit)
        .await
        .map_err(persistence)?;
    Ok(messages.into_iter().map(message_payload).collect())
}

/// Sidebar roster: every user except the caller.
pub async fn list_users(ctx: &ApiContext, user_id: UserId) -> Result<Vec<UserSummary>, ApiError> {
    let users = ctx
        .storage
        .list_users_except(user_id)
        .await
        .map_err(persistence)?;
    Ok(users
        .into_iter()
        .map(|u| UserSummary {
            user_id: u.user_id,
            username: u.username,
        })
        .collect())
}

fn message_payload(stored: StoredMessage) -> MessagePayload {
    MessagePayload {
        message_id: stored.message_id,
        sender_id: stored.sender_id,
        receiver_id: stored.receiver_id,
        text: stored.text,
        image_url: stored.image_url,
        created_at: stored.created_at,
    }
}

fn persistence(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::PersistenceFailed, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

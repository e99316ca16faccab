use shared::{domain::MessageId, protocol::MessagePayload};

/// Two records closer together than this are the optimistic/confirmed pair
/// of one logical message.
pub const DUPLICATE_WINDOW_MS: i64 = 2000;

/// The single reconciliation law. Push delivery, catch-up queries and
/// optimistic sends all funnel through this rule; that shared funnel is
/// what makes the dual delivery paths idempotent.
///
/// A candidate duplicates an existing message when the ids match, or when
/// text and sender match with creation times within the window — the
/// latter pairs a client-assigned optimistic id with its server id.
pub fn is_duplicate(existing: &MessagePayload, candidate: &MessagePayload) -> bool {
    if existing.message_id == candidate.message_id {
        return true;
    }
    existing.text == candidate.text
        && existing.sender_id == candidate.sender_id
        && (existing.created_at - candidate.created_at)
            .num_milliseconds()
            .abs()
            < DUPLICATE_WINDOW_MS
}

/// Merges a candidate into an ascending-by-`created_at` message list.
/// Returns true when the candidate was new. A server-confirmed copy
/// replaces a matched optimistic placeholder (negative id) in place.
pub fn merge_message(messages: &mut Vec<MessagePayload>, candidate: MessagePayload) -> bool {
    if let Some(index) = messages.iter().position(|m| is_duplicate(m, &candidate)) {
        if messages[index].message_id.0 < 0 && candidate.message_id.0 >= 0 {
            messages[index] = candidate;
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
        return false;
    }

    let position = messages
        .iter()
        .rposition(|m| m.created_at <= candidate.created_at)
        .map_or(0, |p| p + 1);
    messages.insert(position, candidate);
    true
}

/// Removes a message by id. Returns true when something was removed.
pub fn remove_message(messages: &mut Vec<MessagePayload>, message_id: MessageId) -> bool {
    let before = messages.len();
    messages.retain(|m| m.message_id != message_id);
    messages.len() != before
}

/// Drops every message a given sender contributed, mirroring a
/// `messagesCleared` event. Returns how many were removed.
pub fn remove_from_sender(messages: &mut Vec<MessagePayload>, sender_id: shared::domain::UserId) -> u64 {
    let before = messages.len();
    messages.retain(|m| m.sender_id != sender_id);
    (before - messages.len()) as u64
}

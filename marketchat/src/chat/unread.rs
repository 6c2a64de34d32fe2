//! Unread accounting derived from the chat list.

use marketchat_proto::identity::ConversationId;
use marketchat_proto::record::ConversationPointer;

/// Sums unread counts across a user's pointers.
#[must_use]
pub fn total_unread(pointers: &[ConversationPointer]) -> u32 {
    pointers
        .iter()
        .fold(0u32, |total, p| total.saturating_add(p.unread_count))
}

/// Returns the unread count for one conversation, or zero if it is not in
/// the list.
#[must_use]
pub fn unread_for(pointers: &[ConversationPointer], id: &ConversationId) -> u32 {
    pointers
        .iter()
        .find(|p| p.conversation_id == *id)
        .map_or(0, |p| p.unread_count)
}

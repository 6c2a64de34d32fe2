//! Where each record family lives in the document store.
//!
//! The chat core and the admin cascade both build paths through these
//! helpers so that they always agree on the layout:
//!
//! ```text
//! chats/{conversationId}                       Conversation
//! chats/{conversationId}/messages/{messageId}  Message
//! userChats/{userId}/chats/{conversationId}    ConversationPointer
//! items/{itemId}                               Listing
//! ```

use crate::document::{CollectionPath, DocPath};
use crate::identity::ConversationId;
use crate::ids::{ItemId, UserId};
use crate::query::{Direction, Query};
use crate::record::field;

/// Top-level collection of conversation records.
pub const CHATS: &str = "chats";
/// Sub-collection of messages under a conversation.
pub const MESSAGES: &str = "messages";
/// Top-level collection of per-user pointer roots.
pub const USER_CHATS: &str = "userChats";
/// Sub-collection of pointers under a user root.
pub const USER_CHAT_ENTRIES: &str = "chats";
/// Top-level collection of listings.
pub const ITEMS: &str = "items";

/// Collection holding every conversation record.
#[must_use]
pub fn conversations() -> CollectionPath {
    collection(CHATS)
}

/// Path of one conversation record.
#[must_use]
pub fn conversation_doc(id: &ConversationId) -> DocPath {
    conversations().doc(id.as_str())
}

/// Collection of messages for one conversation.
#[must_use]
pub fn messages(id: &ConversationId) -> CollectionPath {
    conversation_doc(id).collection(MESSAGES)
}

/// Collection of a user's conversation pointers.
#[must_use]
pub fn pointers(user: &UserId) -> CollectionPath {
    collection(USER_CHATS)
        .doc(user.as_str())
        .collection(USER_CHAT_ENTRIES)
}

/// Path of a user's pointer to one conversation.
#[must_use]
pub fn pointer_doc(user: &UserId, id: &ConversationId) -> DocPath {
    pointers(user).doc(id.as_str())
}

/// Collection holding every listing.
#[must_use]
pub fn listings() -> CollectionPath {
    collection(ITEMS)
}

/// Path of one listing.
#[must_use]
pub fn listing_doc(item: &ItemId) -> DocPath {
    listings().doc(item.as_str())
}

/// Messages of a conversation, oldest first.
#[must_use]
pub fn messages_query(id: &ConversationId) -> Query {
    Query::new(messages(id)).order_by(field::TIMESTAMP, Direction::Ascending)
}

/// A user's conversation pointers, most recently active first.
#[must_use]
pub fn chat_list_query(user: &UserId) -> Query {
    Query::new(pointers(user)).order_by(field::LAST_MESSAGE_TIME, Direction::Descending)
}

/// Every conversation a user participates in.
#[must_use]
pub fn conversations_of(user: &UserId) -> Query {
    Query::new(conversations()).array_contains(field::PARTICIPANTS, user.as_str())
}

/// Every listing owned by a user.
#[must_use]
pub fn listings_of(user: &UserId) -> Query {
    Query::new(listings()).where_eq(field::OWNER_ID, user.as_str())
}

fn collection(name: &'static str) -> CollectionPath {
    CollectionPath::top_level(name)
}

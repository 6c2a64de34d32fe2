//! Cascading user deletion, run with admin privileges.
//!
//! Removes everything a user leaves behind: their listings, every
//! conversation they took part in (with its messages and the counterpart's
//! pointer), and their own chat list. Each conversation is removed in one
//! atomic batch so a counterpart never sees a pointer to a half-deleted
//! conversation.

use marketchat_proto::document::Document;
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::UserId;
use marketchat_proto::paths;
use marketchat_proto::query::Query;
use marketchat_proto::record::Conversation;
use marketchat_proto::store::{DocumentStore, StoreError, WriteBatch};

/// What a cascade removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeletedCounts {
    /// Listings owned by the user.
    pub listings: usize,
    /// Conversations the user participated in.
    pub conversations: usize,
    /// Messages inside those conversations.
    pub messages: usize,
    /// Pointer records, the user's own and their counterparts'.
    pub pointers: usize,
}

/// Deletes `user` and every record that refers to them.
///
/// `store` must have admin access; with ordinary rules most of these
/// deletes would be refused.
///
/// # Errors
///
/// Returns the first [`StoreError`] hit. Work already committed stays
/// committed, and running the cascade again picks up where it stopped.
pub async fn delete_user<S: DocumentStore>(
    store: &S,
    user: &UserId,
) -> Result<DeletedCounts, StoreError> {
    let mut counts = DeletedCounts::default();

    for listing in store.query(&paths::listings_of(user)).await? {
        store.delete(&listing.path).await?;
        counts.listings += 1;
    }

    for conversation in store.query(&paths::conversations_of(user)).await? {
        let id = ConversationId::from_raw(conversation.id());
        let messages = store.query(&Query::new(paths::messages(&id))).await?;

        let mut batch = WriteBatch::new();
        for message in &messages {
            batch.delete(message.path.clone());
        }
        for participant in participants(&conversation, &id) {
            if participant != *user {
                batch.delete(paths::pointer_doc(&participant, &id));
                counts.pointers += 1;
            }
        }
        batch.delete(conversation.path.clone());
        store.commit(batch).await?;

        counts.messages += messages.len();
        counts.conversations += 1;
        tracing::debug!(conversation_id = %id, messages = messages.len(), "conversation removed");
    }

    // Pointers whose conversation is already gone are still in the user's list.
    for pointer in store.query(&Query::new(paths::pointers(user))).await? {
        store.delete(&pointer.path).await?;
        counts.pointers += 1;
    }

    tracing::info!(
        user_id = %user,
        listings = counts.listings,
        conversations = counts.conversations,
        messages = counts.messages,
        pointers = counts.pointers,
        "user deleted"
    );
    Ok(counts)
}

fn participants(doc: &Document, id: &ConversationId) -> Vec<UserId> {
    match Conversation::from_document(doc) {
        Ok(conversation) => conversation.participants.to_vec(),
        Err(e) => {
            tracing::warn!(conversation_id = %id, error = %e, "undecodable conversation, using id");
            id.parts()
                .map(|parts| vec![parts.low, parts.high])
                .unwrap_or_default()
        }
    }
}

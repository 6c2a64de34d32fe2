//! Conversation store adapter.
//!
//! Owns every read and write of the three chat record families. Read paths
//! fail closed: a permission error means "not visible" and maps to
//! `false`/`None`. Write paths propagate errors, except for the
//! denormalized preview and unread writes, which go through the
//! [`DenormWriter`] and never fail a send.

use std::sync::Arc;

use marketchat_proto::document::{DocPath, Document, Fields};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, MessageId, UserId};
use marketchat_proto::paths;
use marketchat_proto::record::{
    Conversation, ConversationPointer, ItemSnapshot, Listing, SenderId, field,
};
use marketchat_proto::store::{DocumentStore, SetOptions, StoreError, WriteBatch};
use serde_json::json;

use super::denorm::{DenormKind, DenormWrite, DenormWriter, WriteMode};
use super::{AuthUser, ChatError, FallbackInit, Participant, ValidationError};

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Store-assigned id of the new message.
    pub message_id: MessageId,
    /// `true` if the send created the conversation first.
    pub conversation_created: bool,
}

/// Reads and writes conversations, pointers and messages.
pub struct ConversationStore<S: DocumentStore> {
    store: Arc<S>,
    denorm: Arc<DenormWriter<S>>,
}

impl<S: DocumentStore> Clone for ConversationStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            denorm: Arc::clone(&self.denorm),
        }
    }
}

impl<S: DocumentStore> std::fmt::Debug for ConversationStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore").finish_non_exhaustive()
    }
}

impl<S: DocumentStore> ConversationStore<S> {
    /// Creates an adapter over `store`, routing cache writes through `denorm`.
    pub const fn new(store: Arc<S>, denorm: Arc<DenormWriter<S>>) -> Self {
        Self { store, denorm }
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the cache writer.
    #[must_use]
    pub const fn denorm(&self) -> &Arc<DenormWriter<S>> {
        &self.denorm
    }

    /// Returns `true` if the conversation exists and is visible.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] for failures other than a denial.
    pub async fn exists(&self, id: &ConversationId) -> Result<bool, ChatError> {
        Ok(self.read(&paths::conversation_doc(id)).await?.is_some())
    }

    /// Creates the conversation between `a` and `b` about `item_id`, or
    /// refreshes both pointers if it already exists.
    ///
    /// A new conversation and both pointers are written in one atomic batch.
    /// The conversation is then read back; if it is not visible with both
    /// participants the call fails.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] if an id or the item title is missing,
    ///   before anything is written.
    /// - [`ChatError::InconsistentWrite`] if the read-back check fails.
    /// - [`ChatError::Store`] if a write fails.
    pub async fn initialize(
        &self,
        a: &Participant,
        b: &Participant,
        item_id: &ItemId,
        item: &ItemSnapshot,
    ) -> Result<ConversationId, ChatError> {
        Ok(self.ensure_conversation(a, b, item_id, item).await?.id)
    }

    /// Reads a conversation record. A denied read is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] for other store failures and
    /// [`ChatError::Record`] if the record is malformed.
    pub async fn get_metadata(&self, id: &ConversationId) -> Result<Option<Conversation>, ChatError> {
        self.read(&paths::conversation_doc(id))
            .await?
            .map(|doc| Conversation::from_document(&doc))
            .transpose()
            .map_err(ChatError::from)
    }

    /// Reads `user`'s pointer to a conversation. A denied read is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] for other store failures and
    /// [`ChatError::Record`] if the record is malformed.
    pub async fn get_pointer(
        &self,
        user: &UserId,
        id: &ConversationId,
    ) -> Result<Option<ConversationPointer>, ChatError> {
        self.read(&paths::pointer_doc(user, id))
            .await?
            .map(|doc| ConversationPointer::from_document(&doc))
            .transpose()
            .map_err(ChatError::from)
    }

    /// Appends a message from `sender`.
    ///
    /// If the conversation does not exist yet it is created from
    /// `fallback` first, using the item id encoded in `id`. After the
    /// message is stored, the conversation preview, the sender's pointer
    /// (unread reset to zero) and the recipient's pointer (unread plus one)
    /// are refreshed in that order; those writes are best-effort.
    ///
    /// # Errors
    ///
    /// - [`ChatError::NotAuthenticated`] if `sender` has no id.
    /// - [`ChatError::Validation`] if `text` is blank.
    /// - [`ChatError::NotParticipant`] if `sender` or the fallback
    ///   recipient does not match the conversation id.
    /// - [`ChatError::ConversationNotFound`] if the conversation is missing
    ///   and no fallback was given.
    /// - [`ChatError::Store`] if the message itself could not be stored.
    pub async fn send_message(
        &self,
        sender: &AuthUser,
        id: &ConversationId,
        text: &str,
        fallback: Option<&FallbackInit>,
    ) -> Result<SentMessage, ChatError> {
        if sender.id.is_empty() {
            return Err(ChatError::NotAuthenticated);
        }
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let parts = id.parts()?;
        let Some(counterpart) = parts.counterpart(&sender.id) else {
            return Err(not_participant(&sender.id, id));
        };

        let (conversation, created) = match self.get_metadata(id).await? {
            Some(conversation) => (conversation, false),
            None => {
                let Some(fallback) = fallback else {
                    return Err(ChatError::ConversationNotFound(id.clone()));
                };
                if fallback.recipient.id != *counterpart {
                    return Err(not_participant(&fallback.recipient.id, id));
                }
                let conversation = self
                    .ensure_conversation(
                        &Participant::from(sender),
                        &fallback.recipient,
                        &parts.item_id,
                        &fallback.item,
                    )
                    .await?;
                tracing::info!(conversation_id = %id, "conversation created by first message");
                (conversation, true)
            }
        };
        let Some(recipient) = conversation.other_participant(&sender.id).cloned() else {
            return Err(not_participant(&sender.id, id));
        };

        let message_path = self
            .store
            .add(
                &paths::messages(id),
                Fields::new()
                    .with(field::SENDER_ID, sender.id.as_str())
                    .with(field::TEXT, text)
                    .with_server_timestamp(field::TIMESTAMP),
            )
            .await?;
        tracing::debug!(conversation_id = %id, message = %message_path, "message stored");

        let sender_id = SenderId::User(sender.id.clone());
        self.refresh_previews(&conversation, text, &sender_id, Some(&sender.id), &recipient)
            .await;

        Ok(SentMessage {
            message_id: MessageId::new(message_path.id()),
            conversation_created: created,
        })
    }

    /// Resets `user`'s unread count for a conversation to zero.
    ///
    /// A missing pointer is rebuilt from the conversation record. If the
    /// conversation is missing too, nothing happens.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] if the write fails.
    pub async fn mark_read(&self, user: &UserId, id: &ConversationId) -> Result<(), ChatError> {
        match self.get_pointer(user, id).await? {
            Some(pointer) if pointer.unread_count == 0 => Ok(()),
            Some(_) => {
                self.store
                    .update(
                        &paths::pointer_doc(user, id),
                        Fields::new().with(field::UNREAD_COUNT, 0),
                    )
                    .await?;
                tracing::debug!(conversation_id = %id, user_id = %user, "marked read");
                Ok(())
            }
            None => {
                let Some(conversation) = self.get_metadata(id).await? else {
                    tracing::debug!(conversation_id = %id, "mark read on missing conversation ignored");
                    return Ok(());
                };
                let Some(fields) = pointer_fields(&conversation, user) else {
                    return Err(not_participant(user, id));
                };
                let (preview, time) = conversation
                    .last_message
                    .as_ref()
                    .map_or((String::new(), conversation.created_at), |m| {
                        (m.text.clone(), m.timestamp)
                    });
                self.store
                    .set(
                        &paths::pointer_doc(user, id),
                        fields
                            .with(field::LAST_MESSAGE, preview)
                            .with(field::LAST_MESSAGE_TIME, time.as_millis())
                            .with(field::UNREAD_COUNT, 0),
                        SetOptions::merge(),
                    )
                    .await?;
                tracing::info!(conversation_id = %id, user_id = %user, "rebuilt missing pointer");
                Ok(())
            }
        }
    }

    /// Appends a message from the reserved system sender and bumps both
    /// participants' unread counts.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::ConversationNotFound`] if the conversation is not
    /// visible and [`ChatError::Store`] if the message could not be stored.
    pub async fn post_system_notice(
        &self,
        id: &ConversationId,
        text: &str,
    ) -> Result<MessageId, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let Some(conversation) = self.get_metadata(id).await? else {
            return Err(ChatError::ConversationNotFound(id.clone()));
        };

        let message_path = self
            .store
            .add(
                &paths::messages(id),
                Fields::new()
                    .with(field::SENDER_ID, SenderId::System.as_str())
                    .with(field::TEXT, text)
                    .with_server_timestamp(field::TIMESTAMP),
            )
            .await?;

        let [first, second] = conversation.participants.clone();
        self.refresh_previews(&conversation, text, &SenderId::System, None, &first)
            .await;
        self.denorm
            .write(recipient_write(&conversation, &second, text))
            .await;

        Ok(MessageId::new(message_path.id()))
    }

    /// Reads a listing. A denied read is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] for other store failures and
    /// [`ChatError::Record`] if the record is malformed.
    pub async fn listing(&self, item: &ItemId) -> Result<Option<Listing>, ChatError> {
        self.read(&paths::listing_doc(item))
            .await?
            .map(|doc| Listing::from_document(&doc))
            .transpose()
            .map_err(ChatError::from)
    }

    /// Returns `true` if the listing still exists.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] for failures other than a denial.
    pub async fn listing_exists(&self, item: &ItemId) -> Result<bool, ChatError> {
        Ok(self.read(&paths::listing_doc(item)).await?.is_some())
    }

    /// Returns `user`'s conversations about one listing. Undecodable records
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Store`] if the query fails.
    pub async fn conversations_about(
        &self,
        user: &UserId,
        item: &ItemId,
    ) -> Result<Vec<Conversation>, ChatError> {
        let query = paths::conversations_of(user).where_eq(field::ITEM_ID, item.as_str());
        let docs = match self.store.query(&query).await {
            Ok(docs) => docs,
            Err(e) if e.is_permission_denied() => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(docs
            .iter()
            .filter_map(|doc| match Conversation::from_document(doc) {
                Ok(conversation) => Some(conversation),
                Err(e) => {
                    tracing::warn!(path = %doc.path, error = %e, "skipping undecodable conversation");
                    None
                }
            })
            .collect())
    }

    async fn read(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        match self.store.get(path).await {
            Err(e) if e.is_permission_denied() => {
                tracing::debug!(%path, "read denied, treating as missing");
                Ok(None)
            }
            other => other,
        }
    }

    async fn ensure_conversation(
        &self,
        a: &Participant,
        b: &Participant,
        item_id: &ItemId,
        item: &ItemSnapshot,
    ) -> Result<Conversation, ChatError> {
        if a.id.is_empty() || b.id.is_empty() {
            return Err(ValidationError::MissingUserId.into());
        }
        if item_id.is_empty() {
            return Err(ValidationError::MissingItemId.into());
        }
        if item.title.trim().is_empty() {
            return Err(ValidationError::MissingItemTitle.into());
        }
        let id = ConversationId::derive(&a.id, &b.id, item_id)?;
        let conversation_path = paths::conversation_doc(&id);

        let mut batch = WriteBatch::new();
        match self.read(&conversation_path).await? {
            None => {
                let (low, high) = if a.id <= b.id { (a, b) } else { (b, a) };
                batch.set(
                    conversation_path.clone(),
                    Fields::new()
                        .with(field::ID, id.as_str())
                        .with(field::ITEM_ID, item_id.as_str())
                        .with(field::ITEM_NAME, item.title.as_str())
                        .with(field::ITEM_IMAGE, item.image_url.clone())
                        .with(field::PARTICIPANTS, json!([low.id.as_str(), high.id.as_str()]))
                        .with(
                            field::USER_NAMES,
                            json!({ low.id.as_str(): low.name, high.id.as_str(): high.name }),
                        )
                        .with_server_timestamp(field::CREATED_AT),
                    SetOptions::overwrite(),
                );
                for (owner, other) in [(a, b), (b, a)] {
                    batch.set(
                        paths::pointer_doc(&owner.id, &id),
                        identity_fields(&id, other, item_id, item)
                            .with(field::LAST_MESSAGE, "")
                            .with_server_timestamp(field::LAST_MESSAGE_TIME)
                            .with(field::UNREAD_COUNT, 0),
                        SetOptions::merge(),
                    );
                }
                tracing::info!(conversation_id = %id, "creating conversation");
            }
            Some(doc) => {
                let existing = Conversation::from_document(&doc)?;
                let time = existing
                    .last_message
                    .as_ref()
                    .map_or(existing.created_at, |m| m.timestamp);
                for owner in &existing.participants {
                    if let Some(fields) = pointer_fields(&existing, owner) {
                        batch.set(
                            paths::pointer_doc(owner, &id),
                            fields.with(field::LAST_MESSAGE_TIME, time.as_millis()),
                            SetOptions::merge(),
                        );
                    }
                }
                tracing::debug!(conversation_id = %id, "conversation exists, refreshing pointers");
            }
        }
        self.store.commit(batch).await?;

        self.verify(&id, &a.id, &b.id).await
    }

    async fn verify(
        &self,
        id: &ConversationId,
        a: &UserId,
        b: &UserId,
    ) -> Result<Conversation, ChatError> {
        let inconsistent = |reason: &str| ChatError::InconsistentWrite {
            id: id.clone(),
            reason: reason.to_string(),
        };
        let Some(doc) = self.read(&paths::conversation_doc(id)).await? else {
            tracing::warn!(conversation_id = %id, "conversation not visible after write");
            return Err(inconsistent("conversation not visible after write"));
        };
        let conversation =
            Conversation::from_document(&doc).map_err(|e| inconsistent(&e.to_string()))?;
        if !conversation.has_participant(a) || !conversation.has_participant(b) {
            tracing::warn!(conversation_id = %id, "participants missing after write");
            return Err(inconsistent("participants missing after write"));
        }
        Ok(conversation)
    }

    async fn refresh_previews(
        &self,
        conversation: &Conversation,
        text: &str,
        sender: &SenderId,
        sender_user: Option<&UserId>,
        recipient: &UserId,
    ) {
        let id = &conversation.id;
        self.denorm
            .write(DenormWrite {
                conversation_id: id.clone(),
                kind: DenormKind::ConversationPreview,
                path: paths::conversation_doc(id),
                fields: Fields::new().with_object(
                    field::LAST_MESSAGE,
                    Fields::new()
                        .with(field::TEXT, text)
                        .with(field::SENDER_ID, sender.as_str())
                        .with_server_timestamp(field::TIMESTAMP),
                ),
                mode: WriteMode::Update,
            })
            .await;

        if let Some((user, fields)) =
            sender_user.and_then(|user| pointer_fields(conversation, user).map(|f| (user, f)))
        {
            self.denorm
                .write(DenormWrite {
                    conversation_id: id.clone(),
                    kind: DenormKind::SenderPointer,
                    path: paths::pointer_doc(user, id),
                    fields: fields
                        .with(field::LAST_MESSAGE, text)
                        .with_server_timestamp(field::LAST_MESSAGE_TIME)
                        .with(field::UNREAD_COUNT, 0),
                    mode: WriteMode::Merge,
                })
                .await;
        }

        self.denorm
            .write(recipient_write(conversation, recipient, text))
            .await;
    }
}

fn recipient_write(conversation: &Conversation, recipient: &UserId, text: &str) -> DenormWrite {
    let fields = pointer_fields(conversation, recipient).unwrap_or_default();
    DenormWrite {
        conversation_id: conversation.id.clone(),
        kind: DenormKind::RecipientPointer,
        path: paths::pointer_doc(recipient, &conversation.id),
        fields: fields
            .with(field::LAST_MESSAGE, text)
            .with_server_timestamp(field::LAST_MESSAGE_TIME)
            .with_increment(field::UNREAD_COUNT, 1),
        mode: WriteMode::Merge,
    }
}

/// Identity fields of `owner`'s pointer, taken from the conversation.
fn pointer_fields(conversation: &Conversation, owner: &UserId) -> Option<Fields> {
    let other = conversation.other_participant(owner)?;
    let other = Participant::new(
        other.clone(),
        conversation.name_of(other).unwrap_or_default(),
    );
    Some(identity_fields(
        &conversation.id,
        &other,
        &conversation.item_id,
        &conversation.item,
    ))
}

fn identity_fields(
    id: &ConversationId,
    other: &Participant,
    item_id: &ItemId,
    item: &ItemSnapshot,
) -> Fields {
    Fields::new()
        .with(field::CONVERSATION_ID, id.as_str())
        .with(field::OTHER_USER_ID, other.id.as_str())
        .with(field::OTHER_USER_NAME, other.name.as_str())
        .with(field::ITEM_ID, item_id.as_str())
        .with(field::ITEM_NAME, item.title.as_str())
        .with(field::ITEM_IMAGE, item.image_url.clone())
}

fn not_participant(user: &UserId, id: &ConversationId) -> ChatError {
    ChatError::NotParticipant {
        user: user.clone(),
        conversation: id.clone(),
    }
}

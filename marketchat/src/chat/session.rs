//! A signed-in user's chat session.

use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, MessageId, UserId};
use marketchat_proto::record::Conversation;
use marketchat_proto::store::DocumentStore;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::denorm::{DenormWarning, DenormWriter};
use super::retry::RetryPolicy;
use super::store::{ConversationStore, SentMessage};
use super::subscription::{ChatListView, MessagesView, SubscriptionManager};
use super::{AuthUser, ChatError, FallbackInit, unread};
use crate::connectivity::NetworkGate;

/// Per-session tuning.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// How live subscriptions retry.
    pub retry: RetryPolicy,
    /// How often failed preview writes are retried.
    pub denorm_retry_interval: Duration,
    /// Capacity of the preview-failure warning channel.
    pub warning_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            denorm_retry_interval: Duration::from_secs(30),
            warning_buffer: 64,
        }
    }
}

/// A conversation together with the state of the listing it is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDetails {
    /// The stored conversation, including its listing snapshot.
    pub conversation: Conversation,
    /// `false` once the listing has been deleted.
    pub listing_exists: bool,
}

/// Chat state for one signed-in user.
///
/// Created by [`login`](Self::login). Dropping the session (or calling
/// [`logout`](Self::logout)) stops every subscription and background task
/// and discards the in-memory views.
pub struct ChatSession<S: DocumentStore + 'static> {
    user: AuthUser,
    store: ConversationStore<S>,
    subscriptions: SubscriptionManager<S>,
    denorm_task: JoinHandle<()>,
    read_tracker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: DocumentStore + 'static> ChatSession<S> {
    /// Starts a session for `user` and subscribes to their chat list.
    ///
    /// Returns the session and the receiver for preview-write warnings.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::NotAuthenticated`] if `user` has no id.
    pub fn login(
        store: Arc<S>,
        user: AuthUser,
        gate: NetworkGate,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<DenormWarning>), ChatError> {
        if user.id.is_empty() {
            return Err(ChatError::NotAuthenticated);
        }

        let (denorm, warnings) = DenormWriter::new(Arc::clone(&store), config.warning_buffer);
        let denorm = Arc::new(denorm);
        let denorm_task = denorm.spawn_retry_task(config.denorm_retry_interval);

        let subscriptions =
            SubscriptionManager::new(Arc::clone(&store), user.id.clone(), gate, config.retry);
        subscriptions.start_chat_list();

        tracing::info!(user_id = %user.id, "chat session started");
        let session = Self {
            store: ConversationStore::new(store, denorm),
            subscriptions,
            denorm_task,
            read_tracker: Mutex::new(None),
            user,
        };
        Ok((session, warnings))
    }

    /// Ends the session.
    pub fn logout(self) {
        tracing::info!(user_id = %self.user.id, "chat session ended");
    }

    /// Returns the signed-in user.
    #[must_use]
    pub const fn user(&self) -> &AuthUser {
        &self.user
    }

    /// Returns the conversation store adapter.
    #[must_use]
    pub const fn store(&self) -> &ConversationStore<S> {
        &self.store
    }

    /// Returns the subscription manager.
    #[must_use]
    pub const fn subscriptions(&self) -> &SubscriptionManager<S> {
        &self.subscriptions
    }

    /// Returns the id of the conversation with `other` about `item`,
    /// without touching the store.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Identity`] if the ids cannot form a conversation.
    pub fn start_conversation(
        &self,
        other: &UserId,
        item: &ItemId,
    ) -> Result<ConversationId, ChatError> {
        Ok(ConversationId::derive(&self.user.id, other, item)?)
    }

    /// Makes `id` the active conversation.
    ///
    /// Subscribes to its messages and marks it read. While it stays active,
    /// new inbound messages are marked read as they arrive.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Identity`] for a malformed id and
    /// [`ChatError::NotParticipant`] if the user is not part of it.
    pub async fn open_conversation(&self, id: &ConversationId) -> Result<(), ChatError> {
        if !id.parts()?.involves(&self.user.id) {
            return Err(ChatError::NotParticipant {
                user: self.user.id.clone(),
                conversation: id.clone(),
            });
        }

        self.subscriptions.open_conversation(id);
        if let Err(e) = self.store.mark_read(&self.user.id, id).await {
            tracing::warn!(conversation_id = %id, error = %e, "mark read failed");
        }

        let tracker = tokio::spawn(track_reads(
            self.store.clone(),
            self.user.id.clone(),
            id.clone(),
            self.subscriptions.watch_messages(),
            self.subscriptions.watch_chat_list(),
        ));
        if let Some(previous) = self.read_tracker.lock().replace(tracker) {
            previous.abort();
        }
        Ok(())
    }

    /// Leaves the active conversation.
    pub fn close_conversation(&self) {
        if let Some(tracker) = self.read_tracker.lock().take() {
            tracker.abort();
        }
        self.subscriptions.close_conversation();
    }

    /// Returns the active conversation, if any.
    #[must_use]
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.subscriptions.active_conversation()
    }

    /// Sends `text` to conversation `id`.
    ///
    /// If the send had to create the conversation and it is the active one,
    /// its message subscription is restarted so the new messages show up.
    ///
    /// # Errors
    ///
    /// See [`ConversationStore::send_message`].
    pub async fn send_message(
        &self,
        id: &ConversationId,
        text: &str,
        fallback: Option<&FallbackInit>,
    ) -> Result<SentMessage, ChatError> {
        let sent = self
            .store
            .send_message(&self.user, id, text, fallback)
            .await?;
        if sent.conversation_created && self.active_conversation().as_ref() == Some(id) {
            tracing::debug!(conversation_id = %id, "resubscribing to newly created conversation");
            self.subscriptions.open_conversation(id);
        }
        Ok(sent)
    }

    /// Resets the user's unread count for `id`.
    ///
    /// # Errors
    ///
    /// See [`ConversationStore::mark_read`].
    pub async fn mark_read(&self, id: &ConversationId) -> Result<(), ChatError> {
        self.store.mark_read(&self.user.id, id).await
    }

    /// Returns the conversation and whether its listing still exists.
    ///
    /// Returns `None` if the conversation is missing, not visible, or cannot
    /// be read.
    pub async fn conversation_details(&self, id: &ConversationId) -> Option<ConversationDetails> {
        let conversation = match self.store.get_metadata(id).await {
            Ok(conversation) => conversation?,
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "conversation metadata unavailable");
                return None;
            }
        };
        let listing_exists = self
            .store
            .listing_exists(&conversation.item_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(item_id = %conversation.item_id, error = %e, "listing lookup failed");
                true
            });
        Some(ConversationDetails {
            conversation,
            listing_exists,
        })
    }

    /// Posts a notice from the system sender into `id`.
    ///
    /// # Errors
    ///
    /// See [`ConversationStore::post_system_notice`].
    pub async fn post_system_notice(
        &self,
        id: &ConversationId,
        text: &str,
    ) -> Result<MessageId, ChatError> {
        self.store.post_system_notice(id, text).await
    }

    /// Returns the current chat list.
    #[must_use]
    pub fn chat_list(&self) -> ChatListView {
        self.subscriptions.chat_list()
    }

    /// Returns a receiver that observes chat-list changes.
    #[must_use]
    pub fn watch_chat_list(&self) -> tokio::sync::watch::Receiver<ChatListView> {
        self.subscriptions.watch_chat_list()
    }

    /// Returns the active conversation's messages.
    #[must_use]
    pub fn messages(&self) -> MessagesView {
        self.subscriptions.messages()
    }

    /// Returns a receiver that observes message changes.
    #[must_use]
    pub fn watch_messages(&self) -> tokio::sync::watch::Receiver<MessagesView> {
        self.subscriptions.watch_messages()
    }

    /// Returns the total unread count across the chat list.
    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.subscriptions.chat_list().total_unread
    }

    /// Retries queued preview writes now. Returns how many succeeded.
    pub async fn flush_denorm(&self) -> usize {
        self.store.denorm().flush_pending().await
    }
}

impl<S: DocumentStore + 'static> Drop for ChatSession<S> {
    fn drop(&mut self) {
        if let Some(tracker) = self.read_tracker.lock().take() {
            tracker.abort();
        }
        self.denorm_task.abort();
        self.subscriptions.stop_all();
    }
}

impl<S: DocumentStore + 'static> std::fmt::Debug for ChatSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("user", &self.user.id)
            .field("active", &self.active_conversation())
            .finish_non_exhaustive()
    }
}

/// Marks `id` read whenever a new inbound message shows up or its pointer
/// reports unread messages. Ends when the conversation stops being active.
async fn track_reads<S: DocumentStore + 'static>(
    store: ConversationStore<S>,
    user: UserId,
    id: ConversationId,
    mut messages: tokio::sync::watch::Receiver<MessagesView>,
    mut chat_list: tokio::sync::watch::Receiver<ChatListView>,
) {
    let mut seen_inbound = 0;
    loop {
        let should_mark = tokio::select! {
            changed = messages.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = messages.borrow_and_update();
                if view.conversation_id.as_ref() != Some(&id) {
                    break;
                }
                let inbound = view.messages.iter().filter(|m| !m.is_from(&user)).count();
                let grew = inbound > seen_inbound;
                seen_inbound = inbound;
                grew
            }
            changed = chat_list.changed() => {
                if changed.is_err() {
                    break;
                }
                unread::unread_for(&chat_list.borrow_and_update().conversations, &id) > 0
            }
        };

        if should_mark {
            if let Err(e) = store.mark_read(&user, &id).await {
                tracing::warn!(conversation_id = %id, error = %e, "mark read failed");
            }
        }
    }
    tracing::debug!(conversation_id = %id, "read tracking stopped");
}

//! Realtime subscription manager.
//!
//! Keeps two independent live subscriptions per session: the user's chat
//! list and the active conversation's messages. Each feeds a view slot that
//! only the manager writes; callers read snapshots or watch for changes.
//!
//! Switching or closing a subscription bumps the slot's generation before
//! the old task is cancelled, so a callback still in flight from the old
//! subscription can never overwrite the new view.

use std::sync::Arc;

use marketchat_proto::document::Document;
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::UserId;
use marketchat_proto::paths;
use marketchat_proto::record::{ConversationPointer, Message, RecordError};
use marketchat_proto::store::DocumentStore;
use parking_lot::Mutex;
use tokio::sync::watch;

use super::retry::{RetryPolicy, SubscriptionHandle, SubscriptionState, spawn_retrying};
use super::unread;
use crate::connectivity::NetworkGate;

/// The signed-in user's chat list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatListView {
    /// Pointers, most recently active first.
    pub conversations: Vec<ConversationPointer>,
    /// Sum of unread counts across `conversations`.
    pub total_unread: u32,
}

impl ChatListView {
    fn from_pointers(conversations: Vec<ConversationPointer>) -> Self {
        Self {
            total_unread: unread::total_unread(&conversations),
            conversations,
        }
    }
}

/// Messages of the active conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagesView {
    /// Conversation being shown, if any.
    pub conversation_id: Option<ConversationId>,
    /// Messages, oldest first.
    pub messages: Vec<Message>,
}

/// A view slot that only accepts writes from its current generation.
#[derive(Debug)]
struct Published<T> {
    generation: Mutex<u64>,
    tx: watch::Sender<T>,
}

impl<T: Clone> Published<T> {
    fn new(initial: T) -> Self {
        Self {
            generation: Mutex::new(0),
            tx: watch::Sender::new(initial),
        }
    }

    /// Stores `value` if `generation` is still current.
    fn publish(&self, generation: u64, value: T) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.tx.send_replace(value);
        true
    }

    /// Invalidates every earlier generation and stores `value`.
    fn reset(&self, value: T) -> u64 {
        let mut current = self.generation.lock();
        *current += 1;
        self.tx.send_replace(value);
        *current
    }

    fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

/// Owns the live chat-list and message subscriptions of one user.
pub struct SubscriptionManager<S: DocumentStore + 'static> {
    store: Arc<S>,
    user: UserId,
    gate: NetworkGate,
    policy: RetryPolicy,
    chat_list: Arc<Published<ChatListView>>,
    messages: Arc<Published<MessagesView>>,
    list_handle: Mutex<Option<SubscriptionHandle>>,
    message_handle: Mutex<Option<SubscriptionHandle>>,
}

impl<S: DocumentStore + 'static> SubscriptionManager<S> {
    /// Creates an idle manager for `user`.
    pub fn new(store: Arc<S>, user: UserId, gate: NetworkGate, policy: RetryPolicy) -> Self {
        Self {
            store,
            user,
            gate,
            policy,
            chat_list: Arc::new(Published::new(ChatListView::default())),
            messages: Arc::new(Published::new(MessagesView::default())),
            list_handle: Mutex::new(None),
            message_handle: Mutex::new(None),
        }
    }

    /// (Re)starts the chat-list subscription.
    pub fn start_chat_list(&self) {
        let generation = self.chat_list.reset(ChatListView::default());
        let slot = Arc::clone(&self.chat_list);
        let handle = spawn_retrying(
            Arc::clone(&self.store),
            paths::chat_list_query(&self.user),
            self.policy,
            self.gate.clone(),
            move |docs| {
                let pointers = decode_all(&docs, ConversationPointer::from_document);
                slot.publish(generation, ChatListView::from_pointers(pointers));
            },
        );
        // Dropping the previous handle cancels it.
        *self.list_handle.lock() = Some(handle);
        tracing::debug!(user_id = %self.user, "chat list subscription started");
    }

    /// Makes `id` the active conversation and subscribes to its messages.
    ///
    /// Any previous message subscription stops delivering before this
    /// returns.
    pub fn open_conversation(&self, id: &ConversationId) {
        let generation = self.messages.reset(MessagesView {
            conversation_id: Some(id.clone()),
            messages: Vec::new(),
        });
        let slot = Arc::clone(&self.messages);
        let conversation_id = id.clone();
        let handle = spawn_retrying(
            Arc::clone(&self.store),
            paths::messages_query(id),
            self.policy,
            self.gate.clone(),
            move |docs| {
                let messages = decode_all(&docs, Message::from_document);
                slot.publish(
                    generation,
                    MessagesView {
                        conversation_id: Some(conversation_id.clone()),
                        messages,
                    },
                );
            },
        );
        *self.message_handle.lock() = Some(handle);
        tracing::debug!(conversation_id = %id, "message subscription started");
    }

    /// Stops the message subscription and clears the messages view.
    pub fn close_conversation(&self) {
        self.messages.reset(MessagesView::default());
        self.message_handle.lock().take();
    }

    /// Returns the active conversation, if any.
    #[must_use]
    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.messages.tx.borrow().conversation_id.clone()
    }

    /// Returns the current chat list.
    #[must_use]
    pub fn chat_list(&self) -> ChatListView {
        self.chat_list.get()
    }

    /// Returns a receiver that observes chat-list changes.
    #[must_use]
    pub fn watch_chat_list(&self) -> watch::Receiver<ChatListView> {
        self.chat_list.subscribe()
    }

    /// Returns the current messages view.
    #[must_use]
    pub fn messages(&self) -> MessagesView {
        self.messages.get()
    }

    /// Returns a receiver that observes message changes.
    #[must_use]
    pub fn watch_messages(&self) -> watch::Receiver<MessagesView> {
        self.messages.subscribe()
    }

    /// Returns the chat-list subscription state.
    #[must_use]
    pub fn chat_list_state(&self) -> SubscriptionState {
        state_of(&self.list_handle)
    }

    /// Returns the message subscription state.
    #[must_use]
    pub fn message_state(&self) -> SubscriptionState {
        state_of(&self.message_handle)
    }

    /// Stops both subscriptions and clears both views.
    pub fn stop_all(&self) {
        self.chat_list.reset(ChatListView::default());
        self.messages.reset(MessagesView::default());
        self.list_handle.lock().take();
        self.message_handle.lock().take();
        tracing::debug!(user_id = %self.user, "all subscriptions stopped");
    }
}

impl<S: DocumentStore + 'static> std::fmt::Debug for SubscriptionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("user", &self.user)
            .field("chat_list_state", &self.chat_list_state())
            .field("message_state", &self.message_state())
            .finish_non_exhaustive()
    }
}

fn state_of(handle: &Mutex<Option<SubscriptionHandle>>) -> SubscriptionState {
    handle
        .lock()
        .as_ref()
        .map_or(SubscriptionState::Idle, SubscriptionHandle::state)
}

fn decode_all<T>(docs: &[Document], decode: fn(&Document) -> Result<T, RecordError>) -> Vec<T> {
    docs.iter()
        .filter_map(|doc| match decode(doc) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(path = %doc.path, error = %e, "skipping undecodable record");
                None
            }
        })
        .collect()
}

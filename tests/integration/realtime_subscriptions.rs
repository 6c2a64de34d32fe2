//! Integration tests for live chat-list and message subscriptions.
//!
//! Verifies how the views behave when the store misbehaves:
//! 1. A denied chat-list query shows an empty list instead of an error.
//! 2. An interrupted stream is re-subscribed after the backoff delay.
//! 3. Exhausted retries fall back to a one-shot fetch.
//! 4. Switching conversations never shows the previous one's messages.
//! 5. Closing a conversation releases its listener.

use std::sync::Arc;
use std::time::Duration;

use marketchat::chat::denorm::DenormWriter;
use marketchat::chat::retry::SubscriptionState;
use marketchat::chat::{
    AuthUser, ChatSession, ConversationStore, FallbackInit, MessagesView, Participant,
    SessionConfig,
};
use marketchat::connectivity::NetworkGate;
use marketchat_docstore::fault::Operation;
use marketchat_docstore::{DocClient, MemoryBackend};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, UserId};
use marketchat_proto::record::ItemSnapshot;
use marketchat_proto::store::StoreError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn login(backend: &MemoryBackend, id: &str) -> ChatSession<DocClient> {
    let (session, _warnings) = ChatSession::login(
        Arc::new(backend.client(&UserId::new(id))),
        AuthUser::new(id, id.to_uppercase()),
        NetworkGate::new(),
        SessionConfig::default(),
    )
    .unwrap();
    session
}

/// Sends `text` from `from` to `to` without starting any subscription.
async fn seed(
    backend: &MemoryBackend,
    from: &str,
    to: &str,
    item: &str,
    text: &str,
) -> ConversationId {
    let client = Arc::new(backend.client(&UserId::new(from)));
    let (denorm, _warnings) = DenormWriter::new(Arc::clone(&client), 8);
    let store = ConversationStore::new(client, Arc::new(denorm));
    let id = ConversationId::derive(&UserId::new(from), &UserId::new(to), &ItemId::new(item))
        .unwrap();
    let fallback = FallbackInit {
        recipient: Participant::new(UserId::new(to), to.to_uppercase()),
        item: ItemSnapshot::new(item, None),
    };
    store
        .send_message(&AuthUser::new(from, from.to_uppercase()), &id, text, Some(&fallback))
        .await
        .unwrap();
    id
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn denied_chat_list_shows_empty_list() {
    let backend = MemoryBackend::new();
    seed(&backend, "bob", "ann", "bike", "hi").await;
    backend.faults().fail_next(
        Operation::Listen,
        StoreError::PermissionDenied("missing or insufficient permissions".into()),
        1,
    );

    let ann = login(&backend, "ann");
    wait_until("fault to fire", || backend.faults().pending() == 0).await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    assert!(ann.chat_list().conversations.is_empty());
    assert_eq!(ann.total_unread(), 0);
    assert_eq!(ann.subscriptions().chat_list_state(), SubscriptionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn interrupted_chat_list_resubscribes() {
    let backend = MemoryBackend::new();
    let id = seed(&backend, "bob", "ann", "bike", "first").await;
    let ann = login(&backend, "ann");
    let mut list = ann.watch_chat_list();
    list.wait_for(|v| v.total_unread == 1).await.unwrap();

    assert_eq!(
        backend.interrupt_listeners(&StoreError::Unavailable("connection reset".into())),
        1
    );
    wait_until("retry to be scheduled", || {
        ann.subscriptions().chat_list_state() == SubscriptionState::Retrying { attempt: 1 }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(
        ann.subscriptions().chat_list_state(),
        SubscriptionState::Listening
    );

    seed(&backend, "bob", "ann", "bike", "second").await;
    let view = list
        .wait_for(|v| v.total_unread == 2)
        .await
        .unwrap()
        .clone();
    assert_eq!(view.conversations[0].conversation_id, id);
    assert_eq!(view.conversations[0].last_message, "second");
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fall_back_to_one_shot_fetch() {
    let backend = MemoryBackend::new();
    seed(&backend, "bob", "ann", "bike", "hello").await;
    backend.faults().fail_always(
        Operation::Listen,
        StoreError::Unavailable("backend unreachable".into()),
    );

    let ann = login(&backend, "ann");
    // 1s + 2s + 3s of backoff before giving up.
    tokio::time::sleep(Duration::from_millis(5900)).await;
    assert!(matches!(
        ann.subscriptions().chat_list_state(),
        SubscriptionState::Retrying { .. }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        ann.subscriptions().chat_list_state(),
        SubscriptionState::ManualFallback
    );
    let view = ann.chat_list();
    assert_eq!(view.conversations.len(), 1);
    assert_eq!(view.total_unread, 1);
}

#[tokio::test]
async fn switching_conversations_drops_stale_messages() {
    let backend = MemoryBackend::new();
    let bike = seed(&backend, "bob", "ann", "bike", "about the bike").await;
    let lamp = seed(&backend, "carl", "ann", "lamp", "about the lamp").await;
    let ann = login(&backend, "ann");

    ann.open_conversation(&bike).await.unwrap();
    ann.open_conversation(&lamp).await.unwrap();

    let mut messages = ann.watch_messages();
    let view = messages
        .wait_for(|v| !v.messages.is_empty())
        .await
        .unwrap()
        .clone();
    assert_eq!(view.conversation_id.as_ref(), Some(&lamp));
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].text, "about the lamp");
    assert_eq!(view.messages[0].conversation_id, lamp);
    assert_eq!(ann.active_conversation(), Some(lamp));
}

#[tokio::test]
async fn closing_conversation_releases_listener() {
    let backend = MemoryBackend::new();
    let id = seed(&backend, "bob", "ann", "bike", "hi").await;
    let ann = login(&backend, "ann");

    ann.open_conversation(&id).await.unwrap();
    wait_until("both listeners", || backend.listener_count() == 2).await;

    ann.close_conversation();
    assert_eq!(ann.messages(), MessagesView::default());
    assert!(ann.active_conversation().is_none());
    wait_until("message listener to go away", || backend.listener_count() == 1).await;
}

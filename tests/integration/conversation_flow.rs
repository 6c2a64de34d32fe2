//! Integration tests for starting and carrying on a listing conversation.
//!
//! Covers the buyer/seller flow end to end against the in-process store:
//! 1. The first message creates the conversation and both pointers.
//! 2. Sending bumps the recipient's unread count, never the sender's.
//! 3. Opening a conversation marks it read.
//! 4. Messages arrive in send order.
//! 5. A deleted listing leaves the conversation readable with its snapshot.

use std::sync::Arc;

use marketchat::chat::denorm::DenormWarning;
use marketchat::chat::{
    AuthUser, ChatError, ChatSession, FallbackInit, Participant, SessionConfig, ValidationError,
};
use marketchat::connectivity::NetworkGate;
use marketchat_docstore::fault::Operation;
use marketchat_docstore::{DocClient, MemoryBackend};
use marketchat_proto::document::Fields;
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, UserId};
use marketchat_proto::paths;
use marketchat_proto::record::{ItemSnapshot, SenderId, field};
use marketchat_proto::store::{DocumentStore, SetOptions, StoreError};
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn login(
    backend: &MemoryBackend,
    id: &str,
    name: &str,
) -> (ChatSession<DocClient>, mpsc::Receiver<DenormWarning>) {
    ChatSession::login(
        Arc::new(backend.client(&UserId::new(id))),
        AuthUser::new(id, name),
        NetworkGate::new(),
        SessionConfig::default(),
    )
    .unwrap()
}

async fn post_listing(backend: &MemoryBackend, owner: &str, item: &str, title: &str) {
    backend
        .client(&UserId::new(owner))
        .set(
            &paths::listing_doc(&ItemId::new(item)),
            Fields::new()
                .with(field::OWNER_ID, owner)
                .with(field::TITLE, title),
            SetOptions::overwrite(),
        )
        .await
        .unwrap();
}

fn bike_for(recipient: &str, name: &str) -> FallbackInit {
    FallbackInit {
        recipient: Participant::new(UserId::new(recipient), name),
        item: ItemSnapshot::new("Bike", None),
    }
}

fn unread(backend: &MemoryBackend, user: &str, id: &ConversationId) -> Option<serde_json::Value> {
    backend
        .document(&paths::pointer_doc(&UserId::new(user), id))
        .and_then(|doc| doc.get(field::UNREAD_COUNT).cloned())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buyer_asks_seller_about_bike() {
    let backend = MemoryBackend::new();
    post_listing(&backend, "U2", "ITEM42", "Bike").await;
    let (buyer, _w1) = login(&backend, "U1", "Ann");
    let (seller, _w2) = login(&backend, "U2", "Ben");

    let id = buyer
        .start_conversation(&UserId::new("U2"), &ItemId::new("ITEM42"))
        .unwrap();
    assert_eq!(id.as_str(), "U1_U2_ITEM42");

    let sent = buyer
        .send_message(&id, "Is it available?", Some(&bike_for("U2", "Ben")))
        .await
        .unwrap();
    assert!(sent.conversation_created);

    let conversation = buyer.store().get_metadata(&id).await.unwrap().unwrap();
    assert_eq!(
        conversation.participants,
        [UserId::new("U1"), UserId::new("U2")]
    );
    assert_eq!(conversation.item.title, "Bike");
    assert_eq!(conversation.name_of(&UserId::new("U1")), Some("Ann"));
    assert_eq!(conversation.name_of(&UserId::new("U2")), Some("Ben"));

    assert_eq!(unread(&backend, "U1", &id), Some(json!(0)));
    assert_eq!(unread(&backend, "U2", &id), Some(json!(1)));

    let mut list = seller.watch_chat_list();
    let view = list
        .wait_for(|v| v.total_unread == 1)
        .await
        .unwrap()
        .clone();
    let pointer = &view.conversations[0];
    assert_eq!(pointer.other_user_id, UserId::new("U1"));
    assert_eq!(pointer.other_user_name, "Ann");
    assert_eq!(pointer.item.title, "Bike");
    assert_eq!(pointer.last_message, "Is it available?");

    seller.send_message(&id, "Yes!", None).await.unwrap();
    assert_eq!(unread(&backend, "U1", &id), Some(json!(1)));
    assert_eq!(unread(&backend, "U2", &id), Some(json!(0)));
}

#[tokio::test]
async fn pointers_come_in_pairs() {
    let backend = MemoryBackend::new();
    let (ann, _w) = login(&backend, "ann", "Ann");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();
    ann.send_message(&id, "hi", Some(&bike_for("bob", "Bob")))
        .await
        .unwrap();

    let (bob, _w) = login(&backend, "bob", "Bob");
    let mine = ann
        .store()
        .get_pointer(&UserId::new("ann"), &id)
        .await
        .unwrap()
        .unwrap();
    let theirs = bob
        .store()
        .get_pointer(&UserId::new("bob"), &id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(mine.other_user_id, UserId::new("bob"));
    assert_eq!(theirs.other_user_id, UserId::new("ann"));
    assert_eq!(mine.item_id, theirs.item_id);
    assert_eq!(mine.last_message, theirs.last_message);
}

#[tokio::test]
async fn opening_marks_read() {
    let backend = MemoryBackend::new();
    let (ann, _w1) = login(&backend, "ann", "Ann");
    let (bob, _w2) = login(&backend, "bob", "Bob");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();
    for text in ["one", "two", "three"] {
        ann.send_message(&id, text, Some(&bike_for("bob", "Bob")))
            .await
            .unwrap();
    }
    assert_eq!(unread(&backend, "bob", &id), Some(json!(3)));

    bob.open_conversation(&id).await.unwrap();
    assert_eq!(unread(&backend, "bob", &id), Some(json!(0)));

    let mut list = bob.watch_chat_list();
    list.wait_for(|v| v.total_unread == 0 && !v.conversations.is_empty())
        .await
        .unwrap();
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let backend = MemoryBackend::new();
    let (ann, _w1) = login(&backend, "ann", "Ann");
    let (bob, _w2) = login(&backend, "bob", "Bob");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();
    ann.send_message(&id, "m1", Some(&bike_for("bob", "Bob")))
        .await
        .unwrap();

    bob.open_conversation(&id).await.unwrap();
    bob.send_message(&id, "m2", None).await.unwrap();
    ann.send_message(&id, "m3", None).await.unwrap();

    let mut messages = bob.watch_messages();
    let view = messages
        .wait_for(|v| v.messages.len() == 3)
        .await
        .unwrap()
        .clone();
    let texts: Vec<&str> = view.messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["m1", "m2", "m3"]);
    assert!(view.messages[1].is_from(&UserId::new("bob")));
    assert!(
        view.messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    );
}

#[tokio::test]
async fn blank_message_writes_nothing() {
    let backend = MemoryBackend::new();
    let (ann, _w) = login(&backend, "ann", "Ann");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();

    let err = ann
        .send_message(&id, "   \n", Some(&bike_for("bob", "Bob")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::EmptyMessage)
    ));
    assert_eq!(err.user_notice(), "Type a message first.");
    assert_eq!(backend.document_count(), 0);
}

#[tokio::test]
async fn outsider_cannot_write_into_conversation() {
    let backend = MemoryBackend::new();
    let (ann, _w1) = login(&backend, "ann", "Ann");
    let (eve, _w2) = login(&backend, "eve", "Eve");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();
    ann.send_message(&id, "hi", Some(&bike_for("bob", "Bob")))
        .await
        .unwrap();

    let err = eve.send_message(&id, "me too", None).await.unwrap_err();
    assert!(matches!(err, ChatError::NotParticipant { .. }));
    assert!(eve.open_conversation(&id).await.is_err());
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let backend = MemoryBackend::new();
    let (ann, _w) = login(&backend, "ann", "Ann");
    let me = Participant::new(UserId::new("ann"), "Ann");
    let bob = Participant::new(UserId::new("bob"), "Bob");
    let item = ItemSnapshot::new("Bike", None);

    let first = ann
        .store()
        .initialize(&me, &bob, &ItemId::new("bike"), &item)
        .await
        .unwrap();
    ann.send_message(&first, "hello", None).await.unwrap();
    let before = backend.document_count();

    let second = ann
        .store()
        .initialize(&bob, &me, &ItemId::new("bike"), &item)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.document_count(), before);
    assert_eq!(unread(&backend, "bob", &first), Some(json!(1)));
}

#[tokio::test]
async fn deleted_listing_keeps_conversation_readable() {
    let backend = MemoryBackend::new();
    post_listing(&backend, "seller", "lamp", "Desk lamp").await;
    let (buyer, _w1) = login(&backend, "buyer", "Bea");
    let (seller, _w2) = login(&backend, "seller", "Sam");

    let id = buyer
        .start_conversation(&UserId::new("seller"), &ItemId::new("lamp"))
        .unwrap();
    let listing = buyer
        .store()
        .listing(&ItemId::new("lamp"))
        .await
        .unwrap()
        .unwrap();
    buyer
        .send_message(
            &id,
            "Does it work?",
            Some(&FallbackInit {
                recipient: Participant::new(UserId::new("seller"), "Sam"),
                item: listing.snapshot(),
            }),
        )
        .await
        .unwrap();

    backend
        .client(&UserId::new("seller"))
        .delete(&paths::listing_doc(&ItemId::new("lamp")))
        .await
        .unwrap();
    seller
        .post_system_notice(&id, "This listing has been removed by the seller.")
        .await
        .unwrap();

    let details = buyer.conversation_details(&id).await.unwrap();
    assert!(!details.listing_exists);
    assert_eq!(details.conversation.item.title, "Desk lamp");

    buyer.open_conversation(&id).await.unwrap();
    let mut messages = buyer.watch_messages();
    let view = messages
        .wait_for(|v| v.messages.len() == 2)
        .await
        .unwrap()
        .clone();
    assert_eq!(view.messages[1].sender, SenderId::System);
}

#[tokio::test]
async fn missing_conversation_without_fallback_is_not_found() {
    let backend = MemoryBackend::new();
    let (ann, _w) = login(&backend, "ann", "Ann");
    let id = ann
        .start_conversation(&UserId::new("bob"), &ItemId::new("bike"))
        .unwrap();

    let err = ann.send_message(&id, "hello", None).await.unwrap_err();
    assert!(matches!(err, ChatError::ConversationNotFound(_)));
    assert_eq!(err.user_notice(), "This conversation is not available.");
}

#[tokio::test]
async fn retried_preview_never_regresses() {
    let backend = MemoryBackend::new();
    let (ann, _w1) = login(&backend, "ann", "Ann");
    let (_bob, _w2) = login(&backend, "bob", "Bob");
    let me = Participant::new(UserId::new("ann"), "Ann");
    let bob = Participant::new(UserId::new("bob"), "Bob");
    let id = ann
        .store()
        .initialize(&me, &bob, &ItemId::new("bike"), &ItemSnapshot::new("Bike", None))
        .await
        .unwrap();

    // The conversation preview for m1 fails; everything else lands.
    backend
        .faults()
        .fail_next(Operation::Update, StoreError::Unavailable("flaky".into()), 1);
    ann.send_message(&id, "m1", None).await.unwrap();
    ann.send_message(&id, "m2", None).await.unwrap();
    ann.flush_denorm().await;

    let conversation = ann.store().get_metadata(&id).await.unwrap().unwrap();
    let preview = conversation.last_message.map(|m| m.text);
    assert_eq!(preview.as_deref(), Some("m2"));
    assert_eq!(unread(&backend, "bob", &id), Some(json!(2)));
}

//! Integration tests for deleting a user with admin privileges.
//!
//! Builds a small marketplace through real chat sessions, deletes the
//! seller, and checks that nothing referring to them survives while
//! unrelated conversations are left alone.

use std::sync::Arc;

use marketchat::chat::{AuthUser, ChatSession, FallbackInit, Participant, SessionConfig};
use marketchat::connectivity::NetworkGate;
use marketchat_docstore::admin::{self, DeletedCounts};
use marketchat_docstore::{DocClient, MemoryBackend};
use marketchat_proto::document::Fields;
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, UserId};
use marketchat_proto::paths;
use marketchat_proto::query::Query;
use marketchat_proto::record::{ItemSnapshot, field};
use marketchat_proto::store::{DocumentStore, SetOptions, StoreError};

fn login(backend: &MemoryBackend, id: &str) -> ChatSession<DocClient> {
    let (session, _warnings) = ChatSession::login(
        Arc::new(backend.client(&UserId::new(id))),
        AuthUser::new(id, id),
        NetworkGate::new(),
        SessionConfig::default(),
    )
    .unwrap();
    session
}

async fn post_listing(backend: &MemoryBackend, owner: &str, item: &str) {
    backend
        .client(&UserId::new(owner))
        .set(
            &paths::listing_doc(&ItemId::new(item)),
            Fields::new()
                .with(field::OWNER_ID, owner)
                .with(field::TITLE, item),
            SetOptions::overwrite(),
        )
        .await
        .unwrap();
}

async fn chat(
    from: &ChatSession<DocClient>,
    to: &str,
    item: &str,
    texts: &[&str],
) -> ConversationId {
    let id = from
        .start_conversation(&UserId::new(to), &ItemId::new(item))
        .unwrap();
    let fallback = FallbackInit {
        recipient: Participant::new(UserId::new(to), to),
        item: ItemSnapshot::new(item, None),
    };
    for text in texts {
        from.send_message(&id, text, Some(&fallback)).await.unwrap();
    }
    id
}

#[tokio::test]
async fn deleting_seller_removes_their_trail() {
    let backend = MemoryBackend::new();
    post_listing(&backend, "seller", "bike").await;
    post_listing(&backend, "seller", "lamp").await;
    post_listing(&backend, "amy", "desk").await;

    let amy = login(&backend, "amy");
    let ben = login(&backend, "ben");
    let bike = chat(&amy, "seller", "bike", &["still there?", "I can pick up today"]).await;
    let lamp = chat(&ben, "seller", "lamp", &["does it work?"]).await;
    let desk = chat(&ben, "amy", "desk", &["how wide is it?"]).await;

    let mut amy_list = amy.watch_chat_list();
    amy_list
        .wait_for(|v| v.conversations.len() == 2)
        .await
        .unwrap();

    let admin_client = backend.admin_client();
    let counts = admin::delete_user(&admin_client, &UserId::new("seller"))
        .await
        .unwrap();
    assert_eq!(
        counts,
        DeletedCounts {
            listings: 2,
            conversations: 2,
            messages: 3,
            pointers: 4,
        }
    );

    for id in [&bike, &lamp] {
        assert!(backend.document(&paths::conversation_doc(id)).is_none());
        assert!(
            backend
                .document(&paths::pointer_doc(&UserId::new("seller"), id))
                .is_none()
        );
    }
    assert!(
        backend
            .document(&paths::pointer_doc(&UserId::new("amy"), &bike))
            .is_none()
    );
    assert!(
        backend
            .document(&paths::pointer_doc(&UserId::new("ben"), &lamp))
            .is_none()
    );
    let messages = admin_client
        .query(&Query::new(paths::messages(&bike)))
        .await
        .unwrap();
    assert!(messages.is_empty());

    // Unrelated data survives.
    assert!(
        backend
            .document(&paths::listing_doc(&ItemId::new("desk")))
            .is_some()
    );
    assert!(backend.document(&paths::conversation_doc(&desk)).is_some());

    // Live chat lists drop the deleted conversations.
    let view = amy_list
        .wait_for(|v| v.conversations.len() == 1)
        .await
        .unwrap()
        .clone();
    assert_eq!(view.conversations[0].conversation_id, desk);
}

#[tokio::test]
async fn cascade_is_idempotent() {
    let backend = MemoryBackend::new();
    post_listing(&backend, "seller", "bike").await;
    let amy = login(&backend, "amy");
    chat(&amy, "seller", "bike", &["hi"]).await;

    let admin_client = backend.admin_client();
    let seller = UserId::new("seller");
    admin::delete_user(&admin_client, &seller).await.unwrap();
    let again = admin::delete_user(&admin_client, &seller).await.unwrap();
    assert_eq!(again, DeletedCounts::default());
}

#[tokio::test]
async fn ordinary_users_cannot_cascade() {
    let backend = MemoryBackend::new();
    post_listing(&backend, "seller", "bike").await;
    let amy = login(&backend, "amy");
    let id = chat(&amy, "seller", "bike", &["hi"]).await;

    let result = admin::delete_user(&backend.client(&UserId::new("amy")), &UserId::new("seller")).await;
    assert!(matches!(result, Err(StoreError::PermissionDenied(_))));
    assert!(backend.document(&paths::conversation_doc(&id)).is_some());
}

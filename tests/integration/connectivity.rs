//! Integration tests for connectivity changes during a chat session.
//!
//! A [`ConnectivityMonitor`] and a [`ChatSession`] share one store client and
//! one network gate, as they do in the binary. Verifies that:
//! 1. Going offline pauses subscriptions without burning retry attempts.
//! 2. Sends fail with the offline notice while offline.
//! 3. Coming back online resumes live updates.
//! 4. Returning from the background waits for the settle delay.

use std::sync::Arc;
use std::time::Duration;

use marketchat::chat::retry::SubscriptionState;
use marketchat::chat::{AuthUser, ChatError, ChatSession, FallbackInit, Participant, SessionConfig};
use marketchat::connectivity::{
    Connectivity, ConnectivityMonitor, ConnectivitySignal, NetworkGate,
};
use marketchat_docstore::{DocClient, MemoryBackend};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::ids::{ItemId, UserId};
use marketchat_proto::record::ItemSnapshot;
use marketchat_proto::store::StoreError;

const SETTLE: Duration = Duration::from_millis(1500);

struct Device {
    client: Arc<DocClient>,
    gate: NetworkGate,
    monitor: ConnectivityMonitor<DocClient>,
    session: ChatSession<DocClient>,
}

fn device(backend: &MemoryBackend, id: &str, name: &str) -> Device {
    let client = Arc::new(backend.client(&UserId::new(id)));
    let gate = NetworkGate::new();
    let monitor = ConnectivityMonitor::new(Arc::clone(&client), gate.clone(), SETTLE);
    let (session, _warnings) = ChatSession::login(
        Arc::clone(&client),
        AuthUser::new(id, name),
        gate.clone(),
        SessionConfig::default(),
    )
    .unwrap();
    Device {
        client,
        gate,
        monitor,
        session,
    }
}

async fn start_chat(from: &Device, to: &str, to_name: &str) -> ConversationId {
    let id = from
        .session
        .start_conversation(&UserId::new(to), &ItemId::new("bike"))
        .unwrap();
    let fallback = FallbackInit {
        recipient: Participant::new(UserId::new(to), to_name),
        item: ItemSnapshot::new("Bike", None),
    };
    from.session
        .send_message(&id, "is it available?", Some(&fallback))
        .await
        .unwrap();
    id
}

async fn wait_for_state(device: &Device, expected: SubscriptionState) {
    for _ in 0..200 {
        if device.session.subscriptions().chat_list_state() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("chat list never reached {expected:?}");
}

#[tokio::test(start_paused = true)]
async fn offline_pauses_and_online_resumes() {
    let backend = MemoryBackend::new();
    let mut ann = device(&backend, "ann", "Ann");
    let bob = device(&backend, "bob", "Bob");
    let id = start_chat(&bob, "ann", "Ann").await;

    let mut list = ann.session.watch_chat_list();
    list.wait_for(|v| v.total_unread == 1).await.unwrap();

    assert_eq!(
        ann.monitor.handle(ConnectivitySignal::Offline).await,
        Connectivity::Offline
    );
    assert!(!ann.gate.is_open());
    assert!(!ann.client.is_network_enabled());
    wait_for_state(&ann, SubscriptionState::Retrying { attempt: 0 }).await;

    // Long enough to exhaust the retry policy if attempts were being counted.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(
        ann.session.subscriptions().chat_list_state(),
        SubscriptionState::Retrying { attempt: 0 }
    );
    // The last snapshot stays on screen.
    assert_eq!(ann.session.chat_list().conversations.len(), 1);

    let err = ann.session.send_message(&id, "yes", None).await.unwrap_err();
    assert!(matches!(err, ChatError::Store(StoreError::Unavailable(_))));
    assert_eq!(err.user_notice(), "You are offline. Your message was not sent.");

    bob.session.send_message(&id, "hello?", None).await.unwrap();

    assert_eq!(
        ann.monitor.handle(ConnectivitySignal::Online).await,
        Connectivity::Connected
    );
    wait_for_state(&ann, SubscriptionState::Listening).await;
    let view = list
        .wait_for(|v| v.total_unread == 2)
        .await
        .unwrap()
        .clone();
    assert_eq!(view.conversations[0].last_message, "hello?");
}

#[tokio::test(start_paused = true)]
async fn foreground_reconnects_after_settle_delay() {
    let backend = MemoryBackend::new();
    let mut ann = device(&backend, "ann", "Ann");
    wait_for_state(&ann, SubscriptionState::Listening).await;

    ann.monitor.handle(ConnectivitySignal::Background).await;
    assert!(!ann.gate.is_open());
    wait_for_state(&ann, SubscriptionState::Retrying { attempt: 0 }).await;

    ann.monitor.handle(ConnectivitySignal::Foreground).await;
    assert_eq!(ann.monitor.state(), Connectivity::Connected);
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(!ann.gate.is_open());
    assert!(!ann.client.is_network_enabled());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(ann.gate.is_open());
    wait_for_state(&ann, SubscriptionState::Listening).await;
}

#[tokio::test(start_paused = true)]
async fn quick_background_flip_cancels_pending_reconnect() {
    let backend = MemoryBackend::new();
    let mut ann = device(&backend, "ann", "Ann");

    ann.monitor.handle(ConnectivitySignal::Background).await;
    ann.monitor.handle(ConnectivitySignal::Foreground).await;
    ann.monitor.handle(ConnectivitySignal::Background).await;

    tokio::time::sleep(SETTLE * 2).await;
    assert_eq!(ann.monitor.state(), Connectivity::Background);
    assert!(!ann.gate.is_open());
    assert!(!ann.client.is_network_enabled());
}

#[tokio::test]
async fn spawned_monitor_follows_signals() {
    let backend = MemoryBackend::new();
    let ann = device(&backend, "ann", "Ann");
    let mut state = ann.monitor.watch();
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let task = ann.monitor.spawn(rx);

    tx.send(ConnectivitySignal::Offline).await.unwrap();
    state
        .wait_for(|s| *s == Connectivity::Offline)
        .await
        .unwrap();
    assert!(!ann.gate.is_open());

    tx.send(ConnectivitySignal::Online).await.unwrap();
    state
        .wait_for(|s| *s == Connectivity::Connected)
        .await
        .unwrap();
    assert!(ann.gate.is_open());

    drop(tx);
    task.await.unwrap();
}

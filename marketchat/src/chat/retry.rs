//! Retrying live subscriptions.
//!
//! [`spawn_retrying`] keeps one live query alive for as long as its
//! [`SubscriptionHandle`] exists:
//!
//! ```text
//! Idle ─▶ Listening ─ retryable error ─▶ Retrying{n} ─ sleep n × base ─▶ Listening
//!              │                              │
//!              │ permission denied            │ attempts exhausted / fatal error
//!              ▼                              ▼
//!        Idle (empty result)           ManualFallback (one-shot fetch, else empty)
//! ```
//!
//! Every delivery passes the full, ordered result set to `on_update`. Errors
//! are never surfaced to the caller; the worst case is an empty result.

use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::document::Document;
use marketchat_proto::query::Query;
use marketchat_proto::store::{DocumentStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connectivity::NetworkGate;

/// How a subscription reacts to errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Re-subscribe attempts after the initial one.
    pub max_attempts: u32,
    /// Linear backoff step: attempt `n` waits `n × base_delay`.
    pub base_delay: Duration,
    /// Decides whether an error is worth another attempt.
    pub is_retryable: fn(&StoreError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            is_retryable: StoreError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Returns the wait before re-subscribe attempt `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

/// Where a subscription is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not listening: never started, cancelled, or access denied.
    Idle,
    /// A live query is open.
    Listening,
    /// Waiting to re-subscribe. Attempt 0 means waiting for the network
    /// gate to reopen, which does not count against the policy.
    Retrying {
        /// Attempt about to be made.
        attempt: u32,
    },
    /// Live updates gave up; the last result came from a one-shot fetch.
    ManualFallback,
}

/// Owns a running subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    task: Option<JoinHandle<()>>,
    state: Arc<watch::Sender<SubscriptionState>>,
}

impl SubscriptionHandle {
    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    /// Stops the subscription. No further updates are started after this
    /// returns.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.send_replace(SubscriptionState::Idle);
    }

    /// Returns `true` once the subscription has stopped for good.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Starts a live subscription to `query` that survives transient failures.
///
/// `on_update` receives every snapshot. It is also called with an empty
/// result when access is denied or when both the live query and the
/// fallback fetch fail.
pub fn spawn_retrying<S, F>(
    store: Arc<S>,
    query: Query,
    policy: RetryPolicy,
    gate: NetworkGate,
    on_update: F,
) -> SubscriptionHandle
where
    S: DocumentStore + 'static,
    F: FnMut(Vec<Document>) + Send + 'static,
{
    let state = Arc::new(watch::Sender::new(SubscriptionState::Idle));
    let task = tokio::spawn(run(
        store,
        query,
        policy,
        gate,
        on_update,
        Arc::clone(&state),
    ));
    SubscriptionHandle {
        task: Some(task),
        state,
    }
}

async fn run<S, F>(
    store: Arc<S>,
    query: Query,
    policy: RetryPolicy,
    gate: NetworkGate,
    mut on_update: F,
    state: Arc<watch::Sender<SubscriptionState>>,
) where
    S: DocumentStore,
    F: FnMut(Vec<Document>) + Send,
{
    let collection = query.collection.clone();
    let mut attempt = 0;

    loop {
        gate.wait_open().await;

        let error = match store.listen(&query).await {
            Ok(mut listener) => {
                state.send_replace(SubscriptionState::Listening);
                tracing::debug!(%collection, "subscription listening");
                loop {
                    match listener.next_snapshot().await {
                        Some(Ok(docs)) => {
                            attempt = 0;
                            on_update(docs);
                        }
                        Some(Err(e)) => break e,
                        None => break StoreError::Unavailable("listener closed".into()),
                    }
                }
            }
            Err(e) => e,
        };

        if error.is_permission_denied() {
            tracing::debug!(%collection, "subscription denied, treating as empty");
            on_update(Vec::new());
            state.send_replace(SubscriptionState::Idle);
            return;
        }

        if !gate.is_open() {
            tracing::debug!(%collection, error = %error, "subscription paused until network returns");
            state.send_replace(SubscriptionState::Retrying { attempt: 0 });
            continue;
        }

        if (policy.is_retryable)(&error) && attempt < policy.max_attempts {
            attempt += 1;
            let delay = policy.delay_for(attempt);
            tracing::warn!(
                %collection,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "subscription failed, retrying"
            );
            state.send_replace(SubscriptionState::Retrying { attempt });
            tokio::time::sleep(delay).await;
            continue;
        }

        tracing::warn!(%collection, attempt, error = %error, "subscription gave up, fetching once");
        state.send_replace(SubscriptionState::ManualFallback);
        match store.query(&query).await {
            Ok(docs) => on_update(docs),
            Err(e) => {
                tracing::warn!(%collection, error = %e, "fallback fetch failed, using empty result");
                on_update(Vec::new());
            }
        }
        return;
    }
}

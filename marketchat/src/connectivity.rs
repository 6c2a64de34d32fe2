//! Network and visibility tracking.
//!
//! The [`ConnectivityMonitor`] turns raw online/offline and
//! foreground/background signals into a [`Connectivity`] state and flips
//! two switches accordingly: the store client's network access and the
//! [`NetworkGate`] that retrying subscriptions wait on. It never touches
//! subscriptions directly.
//!
//! ```text
//!   Connected ── offline ──▶ Offline ── online ──▶ Connected (immediately)
//!   Connected ─ background ▶ Background ─ foreground ▶ Connected (after settle delay)
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::store::DocumentStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default wait after returning to the foreground before reconnecting.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Derived connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Online and in the foreground.
    Connected,
    /// The device reports no network.
    Offline,
    /// Online but the application is in the background.
    Background,
}

impl fmt::Display for Connectivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Offline => write!(f, "offline"),
            Self::Background => write!(f, "background"),
        }
    }
}

/// Raw platform events fed into the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    /// The network came back.
    Online,
    /// The network went away.
    Offline,
    /// The application became visible.
    Foreground,
    /// The application was hidden.
    Background,
}

/// Shared "may we open live connections" flag.
///
/// Cloning yields another handle to the same flag.
#[derive(Debug, Clone)]
pub struct NetworkGate {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for NetworkGate {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkGate {
    /// Creates an open gate.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(true)),
        }
    }

    /// Returns `true` if live connections are allowed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Allows live connections.
    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    /// Forbids live connections.
    pub fn close(&self) {
        self.tx.send_replace(false);
    }

    /// Waits until the gate is open. Returns immediately if it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Tracks connectivity for one store client.
pub struct ConnectivityMonitor<S: DocumentStore + 'static> {
    store: Arc<S>,
    gate: NetworkGate,
    settle_delay: Duration,
    online: bool,
    visible: bool,
    state: watch::Sender<Connectivity>,
    pending_reconnect: Option<JoinHandle<()>>,
}

impl<S: DocumentStore + 'static> ConnectivityMonitor<S> {
    /// Creates a monitor that starts out connected.
    pub fn new(store: Arc<S>, gate: NetworkGate, settle_delay: Duration) -> Self {
        Self {
            store,
            gate,
            settle_delay,
            online: true,
            visible: true,
            state: watch::Sender::new(Connectivity::Connected),
            pending_reconnect: None,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Applies one signal and returns the resulting state.
    pub async fn handle(&mut self, signal: ConnectivitySignal) -> Connectivity {
        match signal {
            ConnectivitySignal::Online => self.online = true,
            ConnectivitySignal::Offline => self.online = false,
            ConnectivitySignal::Foreground => self.visible = true,
            ConnectivitySignal::Background => self.visible = false,
        }

        let next = if !self.online {
            Connectivity::Offline
        } else if !self.visible {
            Connectivity::Background
        } else {
            Connectivity::Connected
        };
        let previous = self.state();
        if next == previous {
            return next;
        }

        if let Some(pending) = self.pending_reconnect.take() {
            pending.abort();
        }

        match next {
            Connectivity::Offline | Connectivity::Background => {
                // Close first so failing listeners see a closed gate.
                self.gate.close();
                self.store.set_network_enabled(false).await;
            }
            Connectivity::Connected if previous == Connectivity::Background => {
                let store = Arc::clone(&self.store);
                let gate = self.gate.clone();
                let delay = self.settle_delay;
                self.pending_reconnect = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    store.set_network_enabled(true).await;
                    gate.open();
                    tracing::debug!("network re-enabled after settle delay");
                }));
            }
            Connectivity::Connected => {
                self.store.set_network_enabled(true).await;
                self.gate.open();
            }
        }

        self.state.send_replace(next);
        tracing::info!(from = %previous, to = %next, "connectivity changed");
        next
    }

    /// Runs the monitor as a task over a stream of signals. The task ends
    /// when every sender is dropped.
    pub fn spawn(mut self, mut signals: mpsc::Receiver<ConnectivitySignal>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                self.handle(signal).await;
            }
            tracing::debug!("connectivity signal channel closed");
        })
    }
}

impl<S: DocumentStore + 'static> Drop for ConnectivityMonitor<S> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending_reconnect.take() {
            pending.abort();
        }
    }
}

impl<S: DocumentStore + 'static> fmt::Debug for ConnectivityMonitor<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("state", &self.state())
            .field("gate_open", &self.gate.is_open())
            .field("settle_delay", &self.settle_delay)
            .finish_non_exhaustive()
    }
}

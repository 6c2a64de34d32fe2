//! The shared in-memory backend every client talks to.
//!
//! All writes go through one path: ops are resolved (sentinels replaced by
//! concrete values), checked against the rules on a staged overlay, and
//! only then applied together. After every applied write each live
//! listener whose result set changed receives a fresh full snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use marketchat_proto::document::{DocPath, Document, DocumentData, FieldValue, Fields};
use marketchat_proto::ids::UserId;
use marketchat_proto::query::Query;
use marketchat_proto::record::Timestamp;
use marketchat_proto::store::{Listener, SnapshotResult, StoreError, WriteOp};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::DocClient;
use crate::fault::FaultInjector;
use crate::rules::{Access, MarketplaceRules, Principal, Rules, StoreView};

/// An in-memory document store shared by any number of clients.
///
/// Cloning is cheap and every clone refers to the same data.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

struct Inner {
    state: RwLock<State>,
    rules: Box<dyn Rules>,
    faults: FaultInjector,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    docs: BTreeMap<DocPath, DocumentData>,
    listeners: HashMap<u64, Registration>,
    last_time: u64,
}

struct Registration {
    client: u64,
    query: Query,
    sender: mpsc::UnboundedSender<SnapshotResult>,
    last: Vec<Document>,
}

impl StoreView for State {
    fn read(&self, path: &DocPath) -> Option<&DocumentData> {
        self.docs.get(path)
    }
}

impl State {
    /// Commit time in milliseconds, strictly increasing across writes.
    fn server_time(&mut self) -> u64 {
        let now = Timestamp::now().as_millis();
        self.last_time = now.max(self.last_time.saturating_add(1));
        self.last_time
    }

    fn notify(&mut self) {
        let docs = &self.docs;
        let mut closed = Vec::new();
        for (id, registration) in &mut self.listeners {
            let snapshot = snapshot(docs, &registration.query);
            if snapshot == registration.last {
                continue;
            }
            if registration.sender.send(Ok(snapshot.clone())).is_err() {
                closed.push(*id);
            } else {
                registration.last = snapshot;
            }
        }
        for id in closed {
            self.listeners.remove(&id);
        }
    }

    fn terminate(&mut self, error: &StoreError, mut which: impl FnMut(&Registration) -> bool) -> usize {
        let ids: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, registration)| which(registration))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(registration) = self.listeners.remove(id) {
                let _ = registration.sender.send(Err(error.clone()));
            }
        }
        ids.len()
    }
}

/// Writes staged on top of the committed documents.
struct Staged<'a> {
    base: &'a BTreeMap<DocPath, DocumentData>,
    changes: BTreeMap<DocPath, Option<DocumentData>>,
}

impl StoreView for Staged<'_> {
    fn read(&self, path: &DocPath) -> Option<&DocumentData> {
        match self.changes.get(path) {
            Some(change) => change.as_ref(),
            None => self.base.get(path),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an empty backend enforcing [`MarketplaceRules`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_rules(MarketplaceRules)
    }

    /// Creates an empty backend enforcing `rules`.
    pub fn with_rules(rules: impl Rules + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                rules: Box::new(rules),
                faults: FaultInjector::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns a client acting as `user`.
    #[must_use]
    pub fn client(&self, user: &UserId) -> DocClient {
        DocClient::new(self.clone(), Principal::User(user.clone()), self.next_id())
    }

    /// Returns a client that bypasses the rules.
    #[must_use]
    pub fn admin_client(&self) -> DocClient {
        DocClient::new(self.clone(), Principal::Admin, self.next_id())
    }

    /// Returns a client with no signed-in user.
    #[must_use]
    pub fn anonymous_client(&self) -> DocClient {
        DocClient::new(self.clone(), Principal::Anonymous, self.next_id())
    }

    /// Returns the fault registry shared by all clients.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.inner.faults
    }

    /// Terminates every live listener with `error`, as a dropped backend
    /// connection would. Returns how many were terminated.
    pub fn interrupt_listeners(&self, error: &StoreError) -> usize {
        let count = self.inner.state.write().terminate(error, |_| true);
        tracing::debug!(count, error = %error, "interrupted listeners");
        count
    }

    /// Returns the number of registered live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.state.read().listeners.len()
    }

    /// Reads a document without any access checks.
    #[must_use]
    pub fn document(&self, path: &DocPath) -> Option<DocumentData> {
        self.inner.state.read().docs.get(path).cloned()
    }

    /// Returns the number of stored documents.
    #[must_use]
    pub fn document_count(&self) -> usize {
        self.inner.state.read().docs.len()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn read(
        &self,
        principal: &Principal,
        path: &DocPath,
    ) -> Result<Option<Document>, StoreError> {
        let state = self.inner.state.read();
        let data = state.docs.get(path);
        if !self
            .inner
            .rules
            .allow(principal, path, Access::Read(data), &*state)
        {
            return Err(denied(principal, "read", path.as_str()));
        }
        Ok(data.map(|data| Document {
            path: path.clone(),
            data: data.clone(),
        }))
    }

    pub(crate) fn query(
        &self,
        principal: &Principal,
        query: &Query,
    ) -> Result<Vec<Document>, StoreError> {
        let state = self.inner.state.read();
        if !self.inner.rules.allow_query(principal, query, &*state) {
            return Err(denied(principal, "query", query.collection.as_str()));
        }
        Ok(snapshot(&state.docs, query))
    }

    pub(crate) fn listen(
        &self,
        principal: &Principal,
        client: u64,
        query: &Query,
    ) -> Result<Listener, StoreError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_id();
        {
            let mut state = self.inner.state.write();
            if !self.inner.rules.allow_query(principal, query, &*state) {
                return Err(denied(principal, "listen to", query.collection.as_str()));
            }
            let initial = snapshot(&state.docs, query);
            let _ = sender.send(Ok(initial.clone()));
            state.listeners.insert(
                id,
                Registration {
                    client,
                    query: query.clone(),
                    sender,
                    last: initial,
                },
            );
        }
        tracing::debug!(listener = id, client, collection = %query.collection, "listener registered");

        let inner = Arc::downgrade(&self.inner);
        Ok(Listener::new(receiver, move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.write().listeners.remove(&id);
            }
        }))
    }

    /// Applies `ops` atomically on behalf of `principal`.
    pub(crate) fn write(&self, principal: &Principal, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut state = self.inner.state.write();
        let now = state.server_time();

        let changes = {
            let mut staged = Staged {
                base: &state.docs,
                changes: BTreeMap::new(),
            };
            for op in &ops {
                let path = op.path();
                let before = staged.read(path).cloned();
                let after = match op {
                    WriteOp::Set { fields, options, .. } => {
                        let base = if options.merge { before.clone() } else { None };
                        Some(apply_fields(base, fields, now))
                    }
                    WriteOp::Update { fields, .. } => {
                        let Some(existing) = before.clone() else {
                            return Err(StoreError::NotFound(path.to_string()));
                        };
                        Some(apply_fields(Some(existing), fields, now))
                    }
                    WriteOp::Delete { .. } => None,
                };

                let access = match (&before, &after) {
                    (None, Some(after)) => Access::Create { after },
                    (Some(before), Some(after)) => Access::Update { before, after },
                    (before, None) => Access::Delete(before.as_ref()),
                };
                if !self.inner.rules.allow(principal, path, access, &staged) {
                    return Err(denied(principal, "write", path.as_str()));
                }
                staged.changes.insert(path.clone(), after);
            }
            staged.changes
        };

        for (path, change) in changes {
            match change {
                Some(data) => {
                    state.docs.insert(path, data);
                }
                None => {
                    state.docs.remove(&path);
                }
            }
        }
        state.notify();
        Ok(())
    }

    /// Terminates the listeners owned by one client.
    pub(crate) fn disconnect(&self, client: u64) {
        let error = StoreError::Unavailable("client network disabled".into());
        let count = self
            .inner
            .state
            .write()
            .terminate(&error, |registration| registration.client == client);
        tracing::debug!(client, count, "client disconnected");
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("MemoryBackend")
            .field("documents", &state.docs.len())
            .field("listeners", &state.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Generates an id for a document created through `add`.
pub(crate) fn new_document_id() -> String {
    uuid::Uuid::now_v7().simple().to_string()
}

fn snapshot(docs: &BTreeMap<DocPath, DocumentData>, query: &Query) -> Vec<Document> {
    query.apply(
        docs.iter()
            .filter(|(path, _)| query.collection.contains(path))
            .map(|(path, data)| Document {
                path: path.clone(),
                data: data.clone(),
            }),
    )
}

fn denied(principal: &Principal, action: &str, target: &str) -> StoreError {
    StoreError::PermissionDenied(format!("{principal} may not {action} {target}"))
}

/// Resolves `fields` on top of `base`. Top-level keys replace existing
/// ones; nested objects are written whole.
fn apply_fields(base: Option<DocumentData>, fields: &Fields, now: u64) -> DocumentData {
    let mut data = base.unwrap_or_default();
    for (key, value) in fields.iter() {
        let resolved = resolve(value, data.get(key), now);
        data.insert(key.clone(), resolved);
    }
    data
}

fn resolve(value: &FieldValue, current: Option<&Value>, now: u64) -> Value {
    match value {
        FieldValue::Value(value) => value.clone(),
        FieldValue::ServerTimestamp => Value::from(now),
        FieldValue::Increment(delta) => increment(current, *delta),
        FieldValue::Object(nested) => Value::Object(apply_fields(None, nested, now)),
    }
}

#[allow(clippy::cast_precision_loss)]
fn increment(current: Option<&Value>, delta: i64) -> Value {
    let Some(number) = current.and_then(Value::as_number) else {
        return Value::from(delta);
    };
    if let Some(value) = number.as_i64() {
        Value::from(value.saturating_add(delta))
    } else {
        number
            .as_f64()
            .map_or_else(|| Value::from(delta), |value| Value::from(value + delta as f64))
    }
}

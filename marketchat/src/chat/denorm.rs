//! Best-effort writes to denormalized preview and unread fields.
//!
//! A sent message is the durable fact; the conversation's `lastMessage` and
//! both pointers are caches of it. [`DenormWriter`] performs those cache
//! writes so that a failure never fails the send:
//!
//! 1. The error is logged with `tracing::warn!`.
//! 2. Transient failures are queued and retried by [`DenormWriter::flush_pending`].
//! 3. A [`DenormWarning`] is emitted so the front end can show a notice.
//!
//! The queue holds at most one write per document. A later write to the same
//! document supersedes the queued fields it overwrites, so a replay never
//! puts an older preview over a newer one. Unread deltas still owed are kept.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use marketchat_proto::document::{DocPath, FieldValue, Fields};
use marketchat_proto::identity::ConversationId;
use marketchat_proto::store::{DocumentStore, SetOptions, StoreError};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

/// Queued writes beyond this are evicted oldest first.
const MAX_PENDING: usize = 1000;

/// Which cache a write refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenormKind {
    /// The conversation's `lastMessage`.
    ConversationPreview,
    /// The sender's pointer (preview, unread reset).
    SenderPointer,
    /// The recipient's pointer (preview, unread increment).
    RecipientPointer,
}

impl fmt::Display for DenormKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConversationPreview => write!(f, "conversation preview"),
            Self::SenderPointer => write!(f, "sender pointer"),
            Self::RecipientPointer => write!(f, "recipient pointer"),
        }
    }
}

/// How the fields are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// `update`: the document must exist.
    Update,
    /// `set` with merge: creates the document if needed.
    Merge,
}

/// One cache write.
#[derive(Debug, Clone, PartialEq)]
pub struct DenormWrite {
    /// Conversation the write belongs to.
    pub conversation_id: ConversationId,
    /// What is being refreshed.
    pub kind: DenormKind,
    /// Target document.
    pub path: DocPath,
    /// Fields to write.
    pub fields: Fields,
    /// Update or merge.
    pub mode: WriteMode,
}

impl DenormWrite {
    /// Folds `later`, a write to the same document, into this queued one.
    ///
    /// When `later` reached the store, only what it left untouched survives,
    /// plus any increment still owed. Otherwise both collapse into one write.
    fn absorb(&mut self, later: &Self, applied: bool) {
        for (key, value) in later.fields.iter() {
            let merged = match (self.fields.get(key), value) {
                (Some(FieldValue::Increment(owed)), FieldValue::Increment(delta)) => {
                    if applied {
                        continue;
                    }
                    Some(FieldValue::Increment(owed + delta))
                }
                // A queued literal followed by an increment replays as their sum.
                (Some(FieldValue::Value(Value::Number(n))), FieldValue::Increment(delta))
                    if n.is_i64() =>
                {
                    n.as_i64().map(|n| FieldValue::Value(Value::from(n + delta)))
                }
                _ if applied => None,
                _ => Some(value.clone()),
            };
            match merged {
                Some(merged) => self.fields.insert(key.clone(), merged),
                None => {
                    self.fields.remove(key);
                }
            }
        }
        if !applied {
            self.kind = later.kind;
            if later.mode == WriteMode::Merge {
                self.mode = WriteMode::Merge;
            }
        }
    }
}

/// Emitted when a cache write fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DenormWarning {
    /// Conversation whose preview may be stale.
    pub conversation_id: ConversationId,
    /// Which cache failed.
    pub kind: DenormKind,
    /// Description of the error.
    pub reason: String,
}

/// Applies cache writes without ever failing the caller.
pub struct DenormWriter<S: DocumentStore> {
    store: Arc<S>,
    pending: Mutex<VecDeque<DenormWrite>>,
    warning_tx: mpsc::Sender<DenormWarning>,
}

impl<S: DocumentStore> DenormWriter<S> {
    /// Creates a writer and the receiver for its warnings.
    #[must_use]
    pub fn new(store: Arc<S>, warning_buffer: usize) -> (Self, mpsc::Receiver<DenormWarning>) {
        let (tx, rx) = mpsc::channel(warning_buffer.max(1));
        let writer = Self {
            store,
            pending: Mutex::new(VecDeque::new()),
            warning_tx: tx,
        };
        (writer, rx)
    }

    /// Applies `write`. Returns `true` if it reached the store.
    ///
    /// Transient failures are queued for [`flush_pending`](Self::flush_pending).
    /// A queued write for the same document is merged with this one.
    pub async fn write(&self, write: DenormWrite) -> bool {
        let mut pending = self.pending.lock().await;
        let result = self.apply(&write).await;
        let retryable = result.as_ref().err().is_some_and(StoreError::is_retryable);

        let queued = pending.iter().position(|q| q.path == write.path);
        let mergeable = queued.filter(|_| result.is_ok() || retryable);
        if let Some(index) = mergeable {
            let drained = pending.get_mut(index).is_some_and(|entry| {
                entry.absorb(&write, result.is_ok());
                entry.fields.is_empty()
            });
            if drained {
                pending.remove(index);
            }
        }

        let Err(err) = result else {
            return true;
        };

        tracing::warn!(
            conversation_id = %write.conversation_id,
            kind = %write.kind,
            error = %err,
            "denormalized write failed, message itself is stored"
        );
        // Best-effort: a full channel drops the warning.
        let _ = self.warning_tx.try_send(DenormWarning {
            conversation_id: write.conversation_id.clone(),
            kind: write.kind,
            reason: err.to_string(),
        });
        if retryable && queued.is_none() {
            while pending.len() >= MAX_PENDING {
                let Some(evicted) = pending.pop_front() else {
                    break;
                };
                tracing::warn!(
                    conversation_id = %evicted.conversation_id,
                    kind = %evicted.kind,
                    "denormalized retry queue full, dropping oldest write"
                );
            }
            pending.push_back(write);
        }
        false
    }

    /// Retries every queued write. Returns how many succeeded.
    ///
    /// Writes that now fail permanently are dropped.
    pub async fn flush_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let writes: Vec<DenormWrite> = pending.drain(..).collect();
        let total = writes.len();
        let mut succeeded = 0;

        for write in writes {
            match self.apply(&write).await {
                Ok(()) => succeeded += 1,
                Err(e) if e.is_retryable() => pending.push_back(write),
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %write.conversation_id,
                        kind = %write.kind,
                        error = %e,
                        "dropping denormalized write"
                    );
                }
            }
        }

        if succeeded > 0 {
            tracing::info!(succeeded, attempted = total, "flushed pending denormalized writes");
        }
        succeeded
    }

    /// Returns the number of writes awaiting retry.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Spawns a task that flushes the queue every `interval` until aborted.
    pub fn spawn_retry_task(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()>
    where
        S: 'static,
    {
        let writer = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                if writer.pending_count().await > 0 {
                    writer.flush_pending().await;
                }
            }
        })
    }

    async fn apply(&self, write: &DenormWrite) -> Result<(), StoreError> {
        match write.mode {
            WriteMode::Update => self.store.update(&write.path, write.fields.clone()).await,
            WriteMode::Merge => {
                self.store
                    .set(&write.path, write.fields.clone(), SetOptions::merge())
                    .await
            }
        }
    }
}

impl<S: DocumentStore> fmt::Debug for DenormWriter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DenormWriter").finish_non_exhaustive()
    }
}

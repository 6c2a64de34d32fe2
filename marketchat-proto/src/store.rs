//! The document-store contract the chat core is written against.
//!
//! [`DocumentStore`] is the seam between the chat core and whatever holds
//! the data. The in-memory backend in `marketchat-docstore` implements it;
//! tests wrap it to inject failures.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::document::{CollectionPath, DocPath, Document, Fields, PathError};
use crate::query::Query;

/// Errors returned by store operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The caller is not allowed to perform the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The store cannot be reached (network disabled or backend down).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend failed internally.
    #[error("internal store error: {0}")]
    Internal(String),

    /// The operation was aborted by a conflicting one.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// The target document does not exist.
    #[error("document not found: {0}")]
    NotFound(String),

    /// The request itself is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// How callers should react to a [`StoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying will not help; the caller lacks access.
    PermissionDenied,
    /// A transient condition; retrying later may succeed.
    Retryable,
    /// Any other failure.
    Fatal,
}

impl StoreError {
    /// Classifies the error for retry decisions.
    #[must_use]
    pub const fn classify(&self) -> ErrorClass {
        match self {
            Self::PermissionDenied(_) => ErrorClass::PermissionDenied,
            Self::Unavailable(_) | Self::Internal(_) | Self::Aborted(_) => ErrorClass::Retryable,
            Self::NotFound(_) | Self::InvalidArgument(_) => ErrorClass::Fatal,
        }
    }

    /// Returns `true` for transient failures.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.classify(), ErrorClass::Retryable)
    }

    /// Returns `true` if the caller was denied access.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}

impl From<PathError> for StoreError {
    fn from(err: PathError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Options for [`DocumentStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge top-level fields into an existing document instead of
    /// replacing it.
    pub merge: bool,
}

impl SetOptions {
    /// Replace the whole document.
    #[must_use]
    pub const fn overwrite() -> Self {
        Self { merge: false }
    }

    /// Merge into the existing document.
    #[must_use]
    pub const fn merge() -> Self {
        Self { merge: true }
    }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or replace (or merge into) a document.
    Set {
        /// Target document.
        path: DocPath,
        /// Fields to write.
        fields: Fields,
        /// Merge or overwrite.
        options: SetOptions,
    },
    /// Update fields of an existing document.
    Update {
        /// Target document.
        path: DocPath,
        /// Fields to write.
        fields: Fields,
    },
    /// Remove a document.
    Delete {
        /// Target document.
        path: DocPath,
    },
}

impl WriteOp {
    /// Returns the document this write targets.
    #[must_use]
    pub const fn path(&self) -> &DocPath {
        match self {
            Self::Set { path, .. } | Self::Update { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// A group of writes applied atomically: all of them or none.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a set.
    pub fn set(&mut self, path: DocPath, fields: Fields, options: SetOptions) -> &mut Self {
        self.ops.push(WriteOp::Set {
            path,
            fields,
            options,
        });
        self
    }

    /// Queues an update.
    pub fn update(&mut self, path: DocPath, fields: Fields) -> &mut Self {
        self.ops.push(WriteOp::Update { path, fields });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, path: DocPath) -> &mut Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    /// Returns the queued writes in order.
    #[must_use]
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consumes the batch, returning its writes.
    #[must_use]
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Returns the number of queued writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Returns `true` if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One delivery from a listener: the full current result set, or the
/// error that terminated the listener.
pub type SnapshotResult = Result<Vec<Document>, StoreError>;

/// A live query.
///
/// Yields a full snapshot whenever the result set may have changed. After
/// an `Err` item the listener is dead and the stream ends. Dropping the
/// listener detaches it from the store.
pub struct Listener {
    receiver: mpsc::UnboundedReceiver<SnapshotResult>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Listener {
    /// Wraps a snapshot channel. `on_close` runs once when the listener
    /// is dropped.
    pub fn new(
        receiver: mpsc::UnboundedReceiver<SnapshotResult>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Wraps a snapshot channel with no detach hook.
    #[must_use]
    pub const fn from_receiver(receiver: mpsc::UnboundedReceiver<SnapshotResult>) -> Self {
        Self {
            receiver,
            on_close: None,
        }
    }

    /// Waits for the next delivery. Returns `None` once the store side
    /// has gone away.
    pub async fn next_snapshot(&mut self) -> Option<SnapshotResult> {
        self.receiver.recv().await
    }
}

impl Stream for Listener {
    type Item = SnapshotResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("closed", &self.receiver.is_closed())
            .finish_non_exhaustive()
    }
}

/// Async document store operations.
///
/// All operations act on behalf of whichever principal the implementation
/// was created for, so access rules apply to every call.
pub trait DocumentStore: Send + Sync {
    /// Reads one document. `Ok(None)` means it does not exist.
    fn get(
        &self,
        path: &DocPath,
    ) -> impl std::future::Future<Output = Result<Option<Document>, StoreError>> + Send;

    /// Creates or replaces a document, or merges into it with
    /// [`SetOptions::merge`].
    fn set(
        &self,
        path: &DocPath,
        fields: Fields,
        options: SetOptions,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Updates fields of an existing document.
    ///
    /// Fails with [`StoreError::NotFound`] if the document is missing.
    fn update(
        &self,
        path: &DocPath,
        fields: Fields,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Creates a document with a store-generated id and returns its path.
    fn add(
        &self,
        collection: &CollectionPath,
        fields: Fields,
    ) -> impl std::future::Future<Output = Result<DocPath, StoreError>> + Send;

    /// Removes a document. Deleting a missing document succeeds.
    fn delete(&self, path: &DocPath)
    -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Runs a one-shot query.
    fn query(
        &self,
        query: &Query,
    ) -> impl std::future::Future<Output = Result<Vec<Document>, StoreError>> + Send;

    /// Starts a live query. The first snapshot is delivered immediately.
    fn listen(
        &self,
        query: &Query,
    ) -> impl std::future::Future<Output = Result<Listener, StoreError>> + Send;

    /// Applies every write in `batch` atomically.
    fn commit(
        &self,
        batch: WriteBatch,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Enables or disables this client's network access. While disabled,
    /// operations fail with [`StoreError::Unavailable`] and live queries
    /// are terminated.
    fn set_network_enabled(&self, enabled: bool) -> impl std::future::Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn classification() {
        assert_eq!(
            StoreError::PermissionDenied("x".into()).classify(),
            ErrorClass::PermissionDenied
        );
        for err in [
            StoreError::Unavailable("x".into()),
            StoreError::Internal("x".into()),
            StoreError::Aborted("x".into()),
        ] {
            assert!(err.is_retryable(), "{err} should be retryable");
        }
        assert_eq!(
            StoreError::NotFound("x".into()).classify(),
            ErrorClass::Fatal
        );
        assert!(!StoreError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn batch_keeps_write_order() {
        let a = DocPath::parse("chats/a").unwrap();
        let b = DocPath::parse("userChats/u/chats/a").unwrap();
        let mut batch = WriteBatch::new();
        batch
            .set(a.clone(), Fields::new().with("x", 1), SetOptions::overwrite())
            .update(b.clone(), Fields::new().with_increment("n", 1))
            .delete(a.clone());

        let paths: Vec<&DocPath> = batch.ops().iter().map(WriteOp::path).collect();
        assert_eq!(paths, [&a, &b, &a]);
        assert_eq!(batch.len(), 3);
        assert!(matches!(batch.into_ops()[2], WriteOp::Delete { .. }));
    }

    #[tokio::test]
    async fn listener_streams_snapshots_and_runs_close_hook() {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let mut listener = Listener::new(rx, move || flag.store(true, Ordering::SeqCst));

        tx.send(Ok(Vec::new())).unwrap();
        tx.send(Err(StoreError::Unavailable("offline".into()))).unwrap();
        drop(tx);

        assert!(matches!(listener.next().await, Some(Ok(docs)) if docs.is_empty()));
        assert!(matches!(listener.next_snapshot().await, Some(Err(_))));
        assert!(listener.next().await.is_none());
        assert!(!closed.load(Ordering::SeqCst));

        drop(listener);
        assert!(closed.load(Ordering::SeqCst));
    }
}

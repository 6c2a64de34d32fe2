//! Per-principal handle onto a [`MemoryBackend`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use marketchat_proto::document::{CollectionPath, DocPath, Document, Fields};
use marketchat_proto::query::Query;
use marketchat_proto::store::{
    DocumentStore, Listener, SetOptions, StoreError, WriteBatch, WriteOp,
};

use crate::engine::{MemoryBackend, new_document_id};
use crate::fault::Operation;
use crate::rules::Principal;

/// A store client acting as one principal.
///
/// Each client has its own network switch: while disabled every operation
/// fails with [`StoreError::Unavailable`] and the client's live listeners
/// are terminated. Clones share the switch and the listeners.
#[derive(Debug, Clone)]
pub struct DocClient {
    backend: MemoryBackend,
    principal: Principal,
    id: u64,
    network: Arc<AtomicBool>,
}

impl DocClient {
    pub(crate) fn new(backend: MemoryBackend, principal: Principal, id: u64) -> Self {
        Self {
            backend,
            principal,
            id,
            network: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Returns who this client acts as.
    #[must_use]
    pub const fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Returns `true` while the client may reach the backend.
    #[must_use]
    pub fn is_network_enabled(&self) -> bool {
        self.network.load(Ordering::SeqCst)
    }

    /// Returns the backend this client talks to.
    #[must_use]
    pub const fn backend(&self) -> &MemoryBackend {
        &self.backend
    }

    fn preflight(&self, operation: Operation, target: &str) -> Result<(), StoreError> {
        if !self.is_network_enabled() {
            return Err(StoreError::Unavailable(format!(
                "{operation} {target}: client is offline"
            )));
        }
        self.backend.faults().check(operation, target)
    }
}

// Every operation yields once so callers observe a real suspension point.
impl DocumentStore for DocClient {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Get, path.as_str())?;
        self.backend.read(&self.principal, path)
    }

    async fn set(
        &self,
        path: &DocPath,
        fields: Fields,
        options: SetOptions,
    ) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Set, path.as_str())?;
        self.backend.write(
            &self.principal,
            vec![WriteOp::Set {
                path: path.clone(),
                fields,
                options,
            }],
        )
    }

    async fn update(&self, path: &DocPath, fields: Fields) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Update, path.as_str())?;
        self.backend.write(
            &self.principal,
            vec![WriteOp::Update {
                path: path.clone(),
                fields,
            }],
        )
    }

    async fn add(&self, collection: &CollectionPath, fields: Fields) -> Result<DocPath, StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Add, collection.as_str())?;
        let path = collection.doc(&new_document_id());
        self.backend.write(
            &self.principal,
            vec![WriteOp::Set {
                path: path.clone(),
                fields,
                options: SetOptions::overwrite(),
            }],
        )?;
        Ok(path)
    }

    async fn delete(&self, path: &DocPath) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Delete, path.as_str())?;
        self.backend
            .write(&self.principal, vec![WriteOp::Delete { path: path.clone() }])
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Query, query.collection.as_str())?;
        self.backend.query(&self.principal, query)
    }

    async fn listen(&self, query: &Query) -> Result<Listener, StoreError> {
        tokio::task::yield_now().await;
        self.preflight(Operation::Listen, query.collection.as_str())?;
        self.backend.listen(&self.principal, self.id, query)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        let target = batch.ops().first().map_or("", |op| op.path().as_str());
        self.preflight(Operation::Commit, target)?;
        self.backend.write(&self.principal, batch.into_ops())
    }

    async fn set_network_enabled(&self, enabled: bool) {
        let was_enabled = self.network.swap(enabled, Ordering::SeqCst);
        if was_enabled == enabled {
            return;
        }
        tracing::debug!(client = self.id, principal = %self.principal, enabled, "network switched");
        if !enabled {
            self.backend.disconnect(self.id);
        }
    }
}

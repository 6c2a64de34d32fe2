//! Scripted failures for exercising error paths.
//!
//! Faults are matched by operation and, optionally, by a path prefix. Each
//! fault either fires a fixed number of times or until it is cleared.

use std::fmt;

use marketchat_proto::store::StoreError;
use parking_lot::Mutex;

/// Store operations a fault can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Single-document read.
    Get,
    /// Create or replace.
    Set,
    /// Update an existing document.
    Update,
    /// Create with a generated id.
    Add,
    /// Remove a document.
    Delete,
    /// One-shot query.
    Query,
    /// Start a live query.
    Listen,
    /// Atomic batch.
    Commit,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::Update => "update",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Query => "query",
            Self::Listen => "listen",
            Self::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Fault {
    operation: Operation,
    path_prefix: Option<String>,
    error: StoreError,
    /// `None` fires until cleared.
    remaining: Option<usize>,
}

impl Fault {
    fn matches(&self, operation: Operation, path: &str) -> bool {
        self.operation == operation
            && self
                .path_prefix
                .as_deref()
                .is_none_or(|prefix| path.starts_with(prefix))
    }
}

/// Registry of pending faults shared by every client of a backend.
#[derive(Debug, Default)]
pub struct FaultInjector {
    faults: Mutex<Vec<Fault>>,
}

impl FaultInjector {
    /// Fails the next `times` calls of `operation` with `error`.
    pub fn fail_next(&self, operation: Operation, error: StoreError, times: usize) {
        self.push(operation, None, error, Some(times));
    }

    /// Fails every call of `operation` until [`FaultInjector::clear`].
    pub fn fail_always(&self, operation: Operation, error: StoreError) {
        self.push(operation, None, error, None);
    }

    /// Fails calls of `operation` on paths starting with `prefix`.
    ///
    /// `times` of `None` keeps failing until cleared.
    pub fn fail_path(
        &self,
        operation: Operation,
        prefix: &str,
        error: StoreError,
        times: Option<usize>,
    ) {
        self.push(operation, Some(prefix.to_string()), error, times);
    }

    /// Removes every pending fault.
    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Returns the number of registered faults that can still fire.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.faults.lock().len()
    }

    /// Returns the error to fail with, consuming one firing of the first
    /// matching fault.
    pub(crate) fn check(&self, operation: Operation, path: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.lock();
        let Some(index) = faults.iter().position(|f| f.matches(operation, path)) else {
            return Ok(());
        };

        let error = faults[index].error.clone();
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        drop(faults);

        tracing::debug!(%operation, path, error = %error, "injected fault");
        Err(error)
    }

    fn push(
        &self,
        operation: Operation,
        path_prefix: Option<String>,
        error: StoreError,
        remaining: Option<usize>,
    ) {
        if remaining == Some(0) {
            return;
        }
        self.faults.lock().push(Fault {
            operation,
            path_prefix,
            error,
            remaining,
        });
    }
}

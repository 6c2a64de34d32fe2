//! Schemaless documents, write payloads and document paths.
//!
//! The store holds JSON-like objects addressed by slash-separated paths
//! that alternate collection and document segments
//! (`chats/{id}/messages/{id}`). Writes are expressed as [`Fields`], which
//! may carry store-side sentinels resolved at commit time.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// The stored contents of one document.
pub type DocumentData = Map<String, Value>;

/// Errors produced when parsing a path string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path has an empty segment (leading, trailing or doubled `/`).
    #[error("path {0:?} has an empty segment")]
    EmptySegment(String),

    /// The path has the wrong number of segments for its kind.
    #[error("path {path:?} is not a {expected} path")]
    WrongKind {
        /// The offending path.
        path: String,
        /// `"document"` or `"collection"`.
        expected: &'static str,
    },
}

/// Path of a single document (an even number of segments).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DocPath(String);

impl DocPath {
    /// Parses and validates a document path.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if a segment is empty or the segment count is odd.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let count = segment_count(path)?;
        if count % 2 != 0 {
            return Err(PathError::WrongKind {
                path: path.to_string(),
                expected: "document",
            });
        }
        Ok(Self(path.to_string()))
    }

    /// Returns the full path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the last segment, the document's id within its collection.
    #[must_use]
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Returns the collection this document belongs to.
    #[must_use]
    pub fn parent(&self) -> CollectionPath {
        let parent = self.0.rsplit_once('/').map_or("", |(head, _)| head);
        CollectionPath(parent.to_string())
    }

    /// Returns a sub-collection path below this document.
    #[must_use]
    pub fn collection(&self, name: &str) -> CollectionPath {
        CollectionPath(format!("{}/{name}", self.0))
    }

    /// Returns the individual path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of a collection (an odd number of segments).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parses and validates a collection path.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if a segment is empty or the segment count is even.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let count = segment_count(path)?;
        if count % 2 == 0 {
            return Err(PathError::WrongKind {
                path: path.to_string(),
                expected: "collection",
            });
        }
        Ok(Self(path.to_string()))
    }

    /// Names a top-level collection from a compiled-in constant.
    pub(crate) fn top_level(name: &'static str) -> Self {
        Self(name.to_string())
    }

    /// Returns the full path string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the path of the document `id` inside this collection.
    #[must_use]
    pub fn doc(&self, id: &str) -> DocPath {
        DocPath(format!("{}/{id}", self.0))
    }

    /// Returns the document this collection hangs off, if it is nested.
    #[must_use]
    pub fn parent_doc(&self) -> Option<DocPath> {
        self.0
            .rsplit_once('/')
            .map(|(head, _)| DocPath(head.to_string()))
    }

    /// Returns `true` if `path` names a document directly inside this collection.
    #[must_use]
    pub fn contains(&self, path: &DocPath) -> bool {
        path.parent() == *self
    }

    /// Returns the individual path segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl std::fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn segment_count(path: &str) -> Result<usize, PathError> {
    if path.split('/').any(str::is_empty) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(path.split('/').count())
}

/// A document as returned by reads, queries and listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Where the document lives.
    pub path: DocPath,
    /// The document's fields.
    pub data: DocumentData,
}

impl Document {
    /// Returns the document id (last path segment).
    #[must_use]
    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Returns a top-level field, if present.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }
}

/// A single field in a write payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A literal value.
    Value(Value),
    /// Replaced with the store's commit time (milliseconds since the epoch).
    ServerTimestamp,
    /// Adds the delta to the current numeric value, treating a missing or
    /// non-numeric value as zero.
    Increment(i64),
    /// A nested map whose own fields may hold sentinels.
    Object(Fields),
}

/// Field updates for a `set`, `update` or `add` write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fields(BTreeMap<String, FieldValue>);

impl Fields {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a literal value.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), FieldValue::Value(value.into()));
        self
    }

    /// Adds a server timestamp sentinel.
    #[must_use]
    pub fn with_server_timestamp(mut self, key: &str) -> Self {
        self.0.insert(key.to_string(), FieldValue::ServerTimestamp);
        self
    }

    /// Adds an atomic increment sentinel.
    #[must_use]
    pub fn with_increment(mut self, key: &str, delta: i64) -> Self {
        self.0.insert(key.to_string(), FieldValue::Increment(delta));
        self
    }

    /// Adds a nested map.
    #[must_use]
    pub fn with_object(mut self, key: &str, nested: Self) -> Self {
        self.0.insert(key.to_string(), FieldValue::Object(nested));
        self
    }

    /// Inserts or replaces a field.
    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) {
        self.0.insert(key.into(), value);
    }

    /// Removes the field written under `key`.
    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.0.remove(key)
    }

    /// Returns the field written under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    /// Iterates fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Returns the number of top-level fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the payload writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_path_parts() {
        let path = DocPath::parse("chats/c1/messages/m1").unwrap();
        assert_eq!(path.id(), "m1");
        assert_eq!(path.parent().as_str(), "chats/c1/messages");
        assert_eq!(
            path.parent().parent_doc(),
            Some(DocPath::parse("chats/c1").unwrap())
        );
    }

    #[test]
    fn path_kinds_are_checked() {
        assert!(DocPath::parse("chats").is_err());
        assert!(CollectionPath::parse("chats/c1").is_err());
        assert!(matches!(
            DocPath::parse("chats//m"),
            Err(PathError::EmptySegment(_))
        ));
        assert!(CollectionPath::parse("chats").unwrap().parent_doc().is_none());
    }

    #[test]
    fn collection_contains_only_direct_children() {
        let chats = CollectionPath::parse("chats").unwrap();
        assert!(chats.contains(&DocPath::parse("chats/c1").unwrap()));
        assert!(!chats.contains(&DocPath::parse("chats/c1/messages/m1").unwrap()));
        assert_eq!(chats.doc("c2").as_str(), "chats/c2");
    }

    #[test]
    fn fields_builder_keeps_sentinels() {
        let fields = Fields::new()
            .with("text", "hi")
            .with_server_timestamp("timestamp")
            .with_increment("unreadCount", 1)
            .with_object("lastMessage", Fields::new().with("text", json!("hi")));

        assert_eq!(fields.len(), 4);
        assert_eq!(fields.get("text"), Some(&FieldValue::Value(json!("hi"))));
        assert_eq!(fields.get("timestamp"), Some(&FieldValue::ServerTimestamp));
        assert_eq!(fields.get("unreadCount"), Some(&FieldValue::Increment(1)));
        assert!(matches!(
            fields.get("lastMessage"),
            Some(FieldValue::Object(_))
        ));
    }
}

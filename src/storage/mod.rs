//! Source document store seam
//!
//! The pipeline only ever needs two things from the document store: "read
//! every document in one collection matching a filter" and "render the native
//! document identifier as a string". Everything here is read-only from the
//! pipeline's point of view.

pub mod in_memory;
pub mod sqlite;

pub use in_memory::{MemoryCollection, MemoryDocumentStore};
pub use sqlite::{SqliteCollection, SqliteDocumentStore, SqliteSourceConnector};

use crate::error::Result;
use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Store-native document identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DocumentId {
    /// 12-byte object id: 4 bytes of big-endian epoch seconds, 8 random bytes
    ObjectId([u8; 12]),
    Int(i64),
    Text(String),
}

impl DocumentId {
    pub fn new_object_id() -> Self {
        let secs = chrono::Utc::now().timestamp() as u32;
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut bytes[4..]);
        DocumentId::ObjectId(bytes)
    }

    /// The representation handed downstream; the native type never leaves the extractor.
    pub fn to_portable_string(&self) -> String {
        match self {
            DocumentId::ObjectId(bytes) => hex::encode(bytes),
            DocumentId::Int(n) => n.to_string(),
            DocumentId::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_portable_string())
    }
}

/// A document exactly as stored
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub id: DocumentId,
    pub body: Value,
}

/// Conjunction of top-level field equalities. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    equals: BTreeMap<String, Value>,
}

impl DocumentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn field_equals(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.equals
            .iter()
            .all(|(field, expected)| body.get(field) == Some(expected))
    }
}

/// Lazy, finite, single-pass sequence of documents
#[async_trait]
pub trait DocumentCursor: Send {
    async fn next(&mut self) -> Result<Option<SourceDocument>>;
}

/// A handle on one collection for the duration of a run
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    fn name(&self) -> &str;

    async fn find(&self, filter: &DocumentFilter) -> Result<Box<dyn DocumentCursor>>;
}

/// Acquires a collection handle; dropping the handle releases the connection.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DocumentCollection>>;
}

/// Write access for fixtures and tests; the pipeline never writes to the source
pub trait DocumentWriter {
    /// Insert bodies under freshly generated object ids, preserving order
    fn insert_many(&self, collection: &str, bodies: Vec<Value>) -> Result<Vec<DocumentId>>;

    fn insert_with_id(&self, collection: &str, id: &DocumentId, body: &Value) -> Result<()>;

    /// Replace the body of the first matching document. Returns whether one matched.
    fn replace_one(&self, collection: &str, filter: &DocumentFilter, body: &Value) -> Result<bool>;

    fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> Result<usize>;

    fn count(&self, collection: &str) -> Result<usize>;
}

/// Strip the store's own `_id` before a body is written back out
pub(crate) fn body_without_id(body: &Value) -> Value {
    match body {
        Value::Object(map) => {
            let stripped: Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != "_id")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Object(stripped)
        }
        other => other.clone(),
    }
}

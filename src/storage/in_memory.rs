use super::{
    body_without_id, DocumentCollection, DocumentCursor, DocumentFilter, DocumentId, DocumentWriter,
    SourceConnector, SourceDocument,
};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

type Collections = HashMap<String, Vec<SourceDocument>>;

/// In-memory document store for development/testing
#[derive(Clone, Default)]
pub struct MemoryDocumentStore {
    collections: Arc<Mutex<Collections>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>> {
        self.collections
            .lock()
            .map_err(|_| PipelineError::source_query("in-memory document store lock poisoned"))
    }

    pub fn collection(&self, name: &str) -> MemoryCollection {
        MemoryCollection {
            store: self.clone(),
            name: name.to_string(),
        }
    }
}

impl DocumentWriter for MemoryDocumentStore {
    fn insert_many(&self, collection: &str, bodies: Vec<Value>) -> Result<Vec<DocumentId>> {
        let mut collections = self.lock()?;
        let docs = collections.entry(collection.to_string()).or_default();
        let mut ids = Vec::with_capacity(bodies.len());
        for body in bodies {
            let id = DocumentId::new_object_id();
            docs.push(SourceDocument {
                id: id.clone(),
                body: body_without_id(&body),
            });
            ids.push(id);
        }
        debug!("Inserted {} documents into {}", ids.len(), collection);
        Ok(ids)
    }

    fn insert_with_id(&self, collection: &str, id: &DocumentId, body: &Value) -> Result<()> {
        let mut collections = self.lock()?;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(SourceDocument {
                id: id.clone(),
                body: body_without_id(body),
            });
        Ok(())
    }

    fn replace_one(&self, collection: &str, filter: &DocumentFilter, body: &Value) -> Result<bool> {
        let mut collections = self.lock()?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };
        match docs.iter_mut().find(|d| filter.matches(&d.body)) {
            Some(doc) => {
                doc.body = body_without_id(body);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> Result<usize> {
        let mut collections = self.lock()?;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|d| !filter.matches(&d.body));
        Ok(before - docs.len())
    }

    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.lock()?.get(collection).map_or(0, Vec::len))
    }
}

/// A named view onto a [`MemoryDocumentStore`]; doubles as its own connector.
#[derive(Clone)]
pub struct MemoryCollection {
    store: MemoryDocumentStore,
    name: String,
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &DocumentFilter) -> Result<Box<dyn DocumentCursor>> {
        let collections = self.store.lock()?;
        let snapshot: Vec<SourceDocument> = collections
            .get(&self.name)
            .map(|docs| docs.iter().filter(|d| filter.matches(&d.body)).cloned().collect())
            .unwrap_or_default();
        Ok(Box::new(SnapshotCursor {
            docs: snapshot.into_iter(),
        }))
    }
}

#[async_trait]
impl SourceConnector for MemoryCollection {
    async fn connect(&self) -> Result<Box<dyn DocumentCollection>> {
        Ok(Box::new(self.clone()))
    }
}

struct SnapshotCursor {
    docs: std::vec::IntoIter<SourceDocument>,
}

#[async_trait]
impl DocumentCursor for SnapshotCursor {
    async fn next(&mut self) -> Result<Option<SourceDocument>> {
        Ok(self.docs.next())
    }
}

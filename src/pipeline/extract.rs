use crate::domain::RawSessionDocument;
use crate::error::{PipelineError, Result};
use crate::metrics::ExtractMetrics;
use crate::storage::{DocumentCollection, DocumentCursor, DocumentFilter, SourceDocument};
use tracing::{debug, info, instrument};

/// Read every matching document into memory.
///
/// Memory grows with the collection; use [`SessionStream`] when that matters.
#[instrument(skip(collection, filter), fields(collection = %collection.name()))]
pub async fn extract(
    collection: &dyn DocumentCollection,
    filter: &DocumentFilter,
) -> Result<Vec<RawSessionDocument>> {
    let mut stream = SessionStream::open(collection, filter).await?;
    let mut batch = Vec::new();
    while let Some(doc) = stream.next().await? {
        batch.push(doc);
    }
    info!("📥 Extracted {} session documents from {}", batch.len(), collection.name());
    Ok(batch)
}

/// Lazy, finite, single-pass sequence of decoded session documents
pub struct SessionStream {
    cursor: Box<dyn DocumentCursor>,
    yielded: usize,
}

impl SessionStream {
    pub async fn open(collection: &dyn DocumentCollection, filter: &DocumentFilter) -> Result<Self> {
        debug!("Opening cursor on {} (filtered: {})", collection.name(), !filter.is_empty());
        let cursor = collection.find(filter).await?;
        Ok(Self { cursor, yielded: 0 })
    }

    pub async fn next(&mut self) -> Result<Option<RawSessionDocument>> {
        match self.cursor.next().await? {
            Some(doc) => {
                let raw = decode(doc)?;
                self.yielded += 1;
                ExtractMetrics::record_documents(1);
                Ok(Some(raw))
            }
            None => Ok(None),
        }
    }

    /// Pull up to `max` documents. An empty chunk means the stream is exhausted.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Vec<RawSessionDocument>> {
        let mut chunk = Vec::with_capacity(max.min(1024));
        while chunk.len() < max {
            match self.next().await? {
                Some(doc) => chunk.push(doc),
                None => break,
            }
        }
        Ok(chunk)
    }

    /// Documents handed out so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }
}

fn decode(doc: SourceDocument) -> Result<RawSessionDocument> {
    let document_id = doc.id.to_portable_string();
    RawSessionDocument::from_body(document_id.clone(), &doc.body).map_err(|e| {
        PipelineError::MalformedDocument {
            document_id,
            reason: e.to_string(),
        }
    })
}

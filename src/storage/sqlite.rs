use super::{
    body_without_id, DocumentCollection, DocumentCursor, DocumentFilter, DocumentId, DocumentWriter,
    SourceConnector, SourceDocument,
};
use crate::constants::CURSOR_PAGE_SIZE;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS documents (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        collection  TEXT NOT NULL,
        doc_id      BLOB NOT NULL,
        body        TEXT NOT NULL,
        UNIQUE (collection, doc_id)
    );
    CREATE INDEX IF NOT EXISTS documents_by_collection ON documents (collection, seq);
"#;

const PAGE_SQL: &str = "SELECT seq, doc_id, body FROM documents
     WHERE collection = ?1 AND seq > ?2
     ORDER BY seq LIMIT ?3";

/// Document store persisted in a single SQLite file.
///
/// Each collection is a partition of the `documents` table; the native id
/// column keeps its storage class (12-byte BLOB object ids, INTEGER or TEXT).
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDocumentStore {
    /// Open (creating if needed) a writable store, e.g. for seeding fixtures
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| {
            PipelineError::source_unavailable(format!("Failed to open {}: {e}", path.display()))
        })?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            PipelineError::source_unavailable(format!("Failed to prepare document schema: {e}"))
        })?;
        Ok(Self::from_connection(conn))
    }

    /// Open an existing store without write access. A missing file is an unavailable source.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| {
            PipelineError::source_unavailable(format!("Failed to open {}: {e}", path.display()))
        })?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PipelineError::source_unavailable(format!("Failed to open in-memory store: {e}")))?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            PipelineError::source_unavailable(format!("Failed to prepare document schema: {e}"))
        })?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn collection(&self, name: &str) -> SqliteCollection {
        SqliteCollection {
            conn: Arc::clone(&self.conn),
            name: name.to_string(),
        }
    }
}

impl DocumentWriter for SqliteDocumentStore {
    fn insert_many(&self, collection: &str, bodies: Vec<Value>) -> Result<Vec<DocumentId>> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction().map_err(write_error)?;
        let mut ids = Vec::with_capacity(bodies.len());
        {
            let mut stmt = tx
                .prepare("INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)")
                .map_err(write_error)?;
            for body in bodies {
                let id = DocumentId::new_object_id();
                let encoded = serde_json::to_string(&body_without_id(&body))?;
                stmt.execute(params![collection, native_id_value(&id), encoded])
                    .map_err(write_error)?;
                ids.push(id);
            }
        }
        tx.commit().map_err(write_error)?;
        info!("Inserted {} documents into {}", ids.len(), collection);
        Ok(ids)
    }

    fn insert_with_id(&self, collection: &str, id: &DocumentId, body: &Value) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)",
            params![collection, native_id_value(id), serde_json::to_string(&body_without_id(body))?],
        )
        .map_err(write_error)?;
        Ok(())
    }

    fn replace_one(&self, collection: &str, filter: &DocumentFilter, body: &Value) -> Result<bool> {
        let conn = lock(&self.conn)?;
        let Some(seq) = matching_seqs(&conn, collection, filter)?.into_iter().next() else {
            return Ok(false);
        };
        conn.execute(
            "UPDATE documents SET body = ?1 WHERE seq = ?2",
            params![serde_json::to_string(&body_without_id(body))?, seq],
        )
        .map_err(write_error)?;
        Ok(true)
    }

    fn delete_many(&self, collection: &str, filter: &DocumentFilter) -> Result<usize> {
        let conn = lock(&self.conn)?;
        if filter.is_empty() {
            return conn
                .execute("DELETE FROM documents WHERE collection = ?1", params![collection])
                .map_err(write_error);
        }
        let mut deleted = 0;
        for seq in matching_seqs(&conn, collection, filter)? {
            deleted += conn
                .execute("DELETE FROM documents WHERE seq = ?1", params![seq])
                .map_err(write_error)?;
        }
        Ok(deleted)
    }

    fn count(&self, collection: &str) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM documents WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(query_error)?;
        Ok(n as usize)
    }
}

/// Opens the configured store read-only once per run
pub struct SqliteSourceConnector {
    path: PathBuf,
    collection: String,
}

impl SqliteSourceConnector {
    pub fn new(path: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl SourceConnector for SqliteSourceConnector {
    async fn connect(&self) -> Result<Box<dyn DocumentCollection>> {
        debug!("Opening document store at {}", self.path.display());
        let store = SqliteDocumentStore::open_read_only(&self.path)?;
        Ok(Box::new(store.collection(&self.collection)))
    }
}

pub struct SqliteCollection {
    conn: Arc<Mutex<Connection>>,
    name: String,
}

#[async_trait]
impl DocumentCollection for SqliteCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(&self, filter: &DocumentFilter) -> Result<Box<dyn DocumentCursor>> {
        // Surface a missing or unreadable table before handing out a cursor
        {
            let conn = lock(&self.conn)?;
            conn.prepare(PAGE_SQL).map_err(query_error)?;
        }
        Ok(Box::new(PagedCursor {
            conn: Arc::clone(&self.conn),
            collection: self.name.clone(),
            filter: filter.clone(),
            last_seq: 0,
            buffer: VecDeque::new(),
            exhausted: false,
            page_size: CURSOR_PAGE_SIZE,
        }))
    }
}

/// Keyset-paged cursor: memory is bounded by one page regardless of collection size
struct PagedCursor {
    conn: Arc<Mutex<Connection>>,
    collection: String,
    filter: DocumentFilter,
    last_seq: i64,
    buffer: VecDeque<SourceDocument>,
    exhausted: bool,
    page_size: usize,
}

impl PagedCursor {
    fn fetch_page(&mut self) -> Result<()> {
        let after = self.last_seq;
        let limit = self.page_size as i64;
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare_cached(PAGE_SQL).map_err(query_error)?;
        let mut rows = stmt
            .query(params![self.collection, after, limit])
            .map_err(query_error)?;

        let mut fetched = 0;
        while let Some(row) = rows.next().map_err(query_error)? {
            fetched += 1;
            let seq: i64 = row.get(0).map_err(query_error)?;
            self.last_seq = seq;

            let id = decode_native_id(row.get_ref(1).map_err(query_error)?)?;
            let raw: String = row.get(2).map_err(query_error)?;
            let body: Value = serde_json::from_str(&raw).map_err(|e| {
                PipelineError::source_query(format!("Document {id} has an unreadable body: {e}"))
            })?;
            if self.filter.matches(&body) {
                self.buffer.push_back(SourceDocument { id, body });
            }
        }
        if fetched < self.page_size {
            self.exhausted = true;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentCursor for PagedCursor {
    async fn next(&mut self) -> Result<Option<SourceDocument>> {
        while self.buffer.is_empty() && !self.exhausted {
            self.fetch_page()?;
        }
        Ok(self.buffer.pop_front())
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| PipelineError::source_query("document store connection lock poisoned"))
}

fn matching_seqs(conn: &Connection, collection: &str, filter: &DocumentFilter) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT seq, body FROM documents WHERE collection = ?1 ORDER BY seq")
        .map_err(query_error)?;
    let rows = stmt
        .query_map(params![collection], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .map_err(query_error)?;

    let mut seqs = Vec::new();
    for row in rows {
        let (seq, raw) = row.map_err(query_error)?;
        let body: Value = serde_json::from_str(&raw)?;
        if filter.matches(&body) {
            seqs.push(seq);
        }
    }
    Ok(seqs)
}

fn native_id_value(id: &DocumentId) -> SqlValue {
    match id {
        DocumentId::ObjectId(bytes) => SqlValue::Blob(bytes.to_vec()),
        DocumentId::Int(n) => SqlValue::Integer(*n),
        DocumentId::Text(s) => SqlValue::Text(s.clone()),
    }
}

fn decode_native_id(value: ValueRef<'_>) -> Result<DocumentId> {
    match value {
        ValueRef::Blob(bytes) => {
            let bytes: [u8; 12] = bytes.try_into().map_err(|_| {
                PipelineError::source_query(format!("Object id has {} bytes, expected 12", bytes.len()))
            })?;
            Ok(DocumentId::ObjectId(bytes))
        }
        ValueRef::Integer(n) => Ok(DocumentId::Int(n)),
        ValueRef::Text(s) => Ok(DocumentId::Text(String::from_utf8_lossy(s).into_owned())),
        other => Err(PipelineError::source_query(format!(
            "Unsupported document id storage class {:?}",
            other.data_type()
        ))),
    }
}

fn query_error(e: rusqlite::Error) -> PipelineError {
    PipelineError::source_query(e.to_string())
}

fn write_error(e: rusqlite::Error) -> PipelineError {
    PipelineError::source_query(format!("Document write failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn drain(coll: &dyn DocumentCollection, filter: &DocumentFilter) -> Vec<SourceDocument> {
        let mut cursor = coll.find(filter).await.unwrap();
        let mut out = Vec::new();
        while let Some(doc) = cursor.next().await.unwrap() {
            out.push(doc);
        }
        out
    }

    #[tokio::test]
    async fn test_cursor_pages_through_large_collections() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        let bodies: Vec<Value> = (0..(CURSOR_PAGE_SIZE * 2 + 7))
            .map(|i| json!({"session_id": format!("s{i}"), "even": i % 2 == 0}))
            .collect();
        store.insert_many("UserSessions", bodies).unwrap();
        store.insert_many("EventLogs", vec![json!({"event_id": "e1"})]).unwrap();

        let coll = store.collection("UserSessions");
        let all = drain(&coll, &DocumentFilter::all()).await;
        assert_eq!(all.len(), CURSOR_PAGE_SIZE * 2 + 7);
        assert_eq!(all[0].body["session_id"], json!("s0"));
        assert_eq!(all.last().unwrap().body["session_id"], json!(format!("s{}", CURSOR_PAGE_SIZE * 2 + 6)));

        let even = drain(&coll, &DocumentFilter::all().field_equals("even", true)).await;
        assert_eq!(even.len(), CURSOR_PAGE_SIZE + 4);
    }

    #[tokio::test]
    async fn test_native_id_storage_classes_round_trip() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store.insert_with_id("c", &DocumentId::Int(7), &json!({"n": 1})).unwrap();
        store
            .insert_with_id("c", &DocumentId::Text("doc-7".into()), &json!({"n": 2}))
            .unwrap();
        let oid = store.insert_many("c", vec![json!({"n": 3})]).unwrap().remove(0);

        let docs = drain(&store.collection("c"), &DocumentFilter::all()).await;
        let ids: Vec<_> = docs.into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![DocumentId::Int(7), DocumentId::Text("doc-7".into()), oid]);
    }

    #[tokio::test]
    async fn test_replace_and_delete() {
        let store = SqliteDocumentStore::open_in_memory().unwrap();
        store
            .insert_many("c", vec![json!({"session_id": "s1", "device": "Mobile"}), json!({"session_id": "s2"})])
            .unwrap();

        let filter = DocumentFilter::all().field_equals("session_id", "s1");
        assert!(store
            .replace_one("c", &filter, &json!({"session_id": "s1", "device": "Desktop"}))
            .unwrap());
        let docs = drain(&store.collection("c"), &filter).await;
        assert_eq!(docs[0].body["device"], json!("Desktop"));

        assert_eq!(store.delete_many("c", &filter).unwrap(), 1);
        assert_eq!(store.count("c").unwrap(), 1);
        assert_eq!(store.delete_many("c", &DocumentFilter::all()).unwrap(), 1);
        assert_eq!(store.count("c").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_is_unavailable() {
        let dir = tempdir().unwrap();
        let connector = SqliteSourceConnector::new(dir.path().join("absent.db"), "UserSessions");
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_store_without_documents_table_fails_the_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE unrelated (x INTEGER);")
            .unwrap();

        let coll = SqliteSourceConnector::new(&path, "UserSessions").connect().await.unwrap();
        let err = coll.find(&DocumentFilter::all()).await.err().unwrap();
        assert!(matches!(err, PipelineError::SourceQueryError { .. }), "{err}");
    }
}

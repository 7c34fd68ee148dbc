use super::{looks_like_constraint_failure, DestinationConnector, SessionWarehouse, SqlValue, WarehouseError, SCHEMA_SQL};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(n) => ToSqlOutput::from(*n),
            SqlValue::Text(s) => ToSqlOutput::from(s.as_str()),
        })
    }
}

/// Local SQLite warehouse (file or in-memory)
pub struct SqliteWarehouse {
    conn: Connection,
}

impl SqliteWarehouse {
    pub fn open<P: AsRef<Path>>(path: P) -> std::result::Result<Self, WarehouseError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| WarehouseError::Unavailable(format!("{}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to open {}: {e}", path.display())))?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> std::result::Result<Self, WarehouseError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| WarehouseError::Unavailable(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Run arbitrary DDL, e.g. to add constraints the bootstrap schema does not carry
    pub fn execute_batch(&self, sql: &str) -> std::result::Result<(), WarehouseError> {
        self.conn
            .execute_batch(sql)
            .map_err(|e| WarehouseError::Query(e.to_string()))
    }
}

#[async_trait]
impl SessionWarehouse for SqliteWarehouse {
    async fn ensure_schema(&mut self) -> std::result::Result<(), WarehouseError> {
        self.conn
            .execute_batch(SCHEMA_SQL)
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to run migrations: {e}")))?;
        debug!("Warehouse schema ready");
        Ok(())
    }

    async fn execute_in_transaction(
        &mut self,
        sql: &str,
        rows: &[Vec<SqlValue>],
    ) -> std::result::Result<usize, WarehouseError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to begin transaction: {e}")))?;
        {
            let mut stmt = tx
                .prepare_cached(sql)
                .map_err(|e| WarehouseError::Query(e.to_string()))?;
            for (index, row) in rows.iter().enumerate() {
                // Dropping `tx` on the error path rolls the batch back
                stmt.execute(params_from_iter(row.iter()))
                    .map_err(|e| classify(index, e))?;
            }
        }
        tx.commit()
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to commit: {e}")))?;
        Ok(rows.len())
    }

    async fn query_rows(&mut self, sql: &str) -> std::result::Result<Vec<Vec<SqlValue>>, WarehouseError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| WarehouseError::Query(e.to_string()))?;
        let columns = stmt.column_count();
        let mut rows = stmt.query([]).map_err(|e| WarehouseError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(|e| WarehouseError::Query(e.to_string()))? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                let value = row.get_ref(i).map_err(|e| WarehouseError::Query(e.to_string()))?;
                values.push(match value {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(n) => SqlValue::Integer(n),
                    ValueRef::Text(t) => SqlValue::Text(String::from_utf8_lossy(t).into_owned()),
                    other => {
                        return Err(WarehouseError::Query(format!(
                            "unsupported column type {:?}",
                            other.data_type()
                        )))
                    }
                });
            }
            out.push(values);
        }
        Ok(out)
    }
}

fn classify(index: usize, e: rusqlite::Error) -> WarehouseError {
    let message = e.to_string();
    let is_constraint = match &e {
        rusqlite::Error::SqliteFailure(err, _) => err.code == ErrorCode::ConstraintViolation,
        _ => looks_like_constraint_failure(&message),
    };
    if is_constraint {
        WarehouseError::Constraint { index, message }
    } else {
        WarehouseError::Statement { index, message }
    }
}

/// Opens the configured SQLite warehouse once per run
pub struct SqliteDestinationConnector {
    path: PathBuf,
}

impl SqliteDestinationConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DestinationConnector for SqliteDestinationConnector {
    async fn connect(&self) -> Result<Box<dyn SessionWarehouse>> {
        info!("Connecting to SQLite warehouse at {}", self.path.display());
        let mut warehouse = SqliteWarehouse::open(&self.path)
            .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
        warehouse
            .ensure_schema()
            .await
            .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
        Ok(Box::new(warehouse))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_row_rolls_back_the_whole_transaction() {
        let mut wh = SqliteWarehouse::open_in_memory().unwrap();
        wh.execute_batch("CREATE TABLE t (k TEXT PRIMARY KEY, n INTEGER NOT NULL CHECK (n > 0));")
            .unwrap();

        let sql = "INSERT INTO t (k, n) VALUES (?1, ?2)";
        let rows = vec![
            vec![SqlValue::Text("a".into()), SqlValue::Integer(1)],
            vec![SqlValue::Text("b".into()), SqlValue::Integer(-1)],
        ];
        let err = wh.execute_in_transaction(sql, &rows).await.unwrap_err();
        assert!(matches!(err, WarehouseError::Constraint { index: 1, .. }), "{err:?}");

        let left = wh.query_rows("SELECT k, n FROM t").await.unwrap();
        assert!(left.is_empty());
    }

    #[tokio::test]
    async fn test_query_rows_decodes_values() {
        let mut wh = SqliteWarehouse::open_in_memory().unwrap();
        wh.execute_batch("CREATE TABLE t (k TEXT, n INTEGER, z TEXT);").unwrap();
        let n = wh
            .execute_in_transaction(
                "INSERT INTO t (k, n, z) VALUES (?1, ?2, ?3)",
                &[vec![SqlValue::Text("a".into()), SqlValue::Integer(5), SqlValue::Null]],
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let rows = wh.query_rows("SELECT k, n, z FROM t").await.unwrap();
        assert_eq!(
            rows,
            vec![vec![SqlValue::Text("a".into()), SqlValue::Integer(5), SqlValue::Null]]
        );
    }

    #[tokio::test]
    async fn test_unwritable_path_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file
        let connector = SqliteDestinationConnector::new(dir.path());
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, PipelineError::DestinationUnavailable { .. }), "{err}");
    }
}

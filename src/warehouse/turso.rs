use super::{looks_like_constraint_failure, DestinationConnector, SessionWarehouse, SqlValue, WarehouseError, SCHEMA_SQL};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use libsql::{Builder, Connection};
use std::env;
use tracing::info;

/// Warehouse backed by Turso/libSQL
pub struct LibsqlWarehouse {
    conn: Connection,
}

impl LibsqlWarehouse {
    /// Connect to a remote Turso database
    pub async fn connect_remote(url: &str, auth_token: &str) -> std::result::Result<Self, WarehouseError> {
        info!("Connecting to Turso database at {}", url);

        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to connect to database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to get database connection: {e}")))?;
        Ok(Self { conn })
    }
}

fn to_libsql(value: &SqlValue) -> libsql::Value {
    match value {
        SqlValue::Null => libsql::Value::Null,
        SqlValue::Integer(n) => libsql::Value::Integer(*n),
        SqlValue::Text(s) => libsql::Value::Text(s.clone()),
    }
}

fn classify(index: usize, e: libsql::Error) -> WarehouseError {
    let message = e.to_string();
    if looks_like_constraint_failure(&message) {
        WarehouseError::Constraint { index, message }
    } else {
        WarehouseError::Statement { index, message }
    }
}

#[async_trait]
impl SessionWarehouse for LibsqlWarehouse {
    async fn ensure_schema(&mut self) -> std::result::Result<(), WarehouseError> {
        info!("Running database migrations...");
        self.conn
            .execute_batch(SCHEMA_SQL)
            .await
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to run migrations: {e}")))?;
        info!("Database migrations completed successfully");
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
            .await
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to begin transaction: {e}")))?;

        let mut stmt = match tx.prepare(sql).await {
            Ok(stmt) => stmt,
            Err(e) => {
                let err = WarehouseError::Query(e.to_string());
                return Err(match tx.rollback().await {
                    Ok(()) => err,
                    Err(rollback) => {
                        WarehouseError::Unavailable(format!("{err}; rollback also failed: {rollback}"))
                    }
                });
            }
        };

        for (index, row) in rows.iter().enumerate() {
            let params: Vec<libsql::Value> = row.iter().map(to_libsql).collect();
            let outcome = stmt.execute(params).await;
            stmt.reset();
            if let Err(e) = outcome {
                let err = classify(index, e);
                if let Err(rollback) = tx.rollback().await {
                    return Err(WarehouseError::Unavailable(format!(
                        "{err}; rollback also failed: {rollback}"
                    )));
                }
                return Err(err);
            }
        }

        tx.commit()
            .await
            .map_err(|e| WarehouseError::Unavailable(format!("Failed to commit: {e}")))?;
        Ok(rows.len())
    }

    async fn query_rows(&mut self, sql: &str) -> std::result::Result<Vec<Vec<SqlValue>>, WarehouseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| WarehouseError::Query(e.to_string()))?;
        let columns = rows.column_count();

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| WarehouseError::Query(e.to_string()))? {
            let mut values = Vec::with_capacity(columns.max(0) as usize);
            for i in 0..columns {
                let value = row.get_value(i).map_err(|e| WarehouseError::Query(e.to_string()))?;
                values.push(match value {
                    libsql::Value::Null => SqlValue::Null,
                    libsql::Value::Integer(n) => SqlValue::Integer(n),
                    libsql::Value::Text(s) => SqlValue::Text(s),
                    other => {
                        return Err(WarehouseError::Query(format!("unsupported column value {other:?}")))
                    }
                });
            }
            out.push(values);
        }
        Ok(out)
    }
}

/// Connects to Turso once per run. Credentials fall back to
/// `LIBSQL_URL` / `LIBSQL_AUTH_TOKEN`.
pub struct LibsqlDestinationConnector {
    url: Option<String>,
}

impl LibsqlDestinationConnector {
    pub fn new(url: Option<String>) -> Self {
        Self { url }
    }
}

#[async_trait]
impl DestinationConnector for LibsqlDestinationConnector {
    async fn connect(&self) -> Result<Box<dyn SessionWarehouse>> {
        let url = match &self.url {
            Some(url) => url.clone(),
            None => env::var("LIBSQL_URL").map_err(|_| {
                PipelineError::destination_unavailable("LIBSQL_URL environment variable not set")
            })?,
        };
        let auth_token = env::var("LIBSQL_AUTH_TOKEN").map_err(|_| {
            PipelineError::destination_unavailable("LIBSQL_AUTH_TOKEN environment variable not set")
        })?;

        let mut warehouse = LibsqlWarehouse::connect_remote(&url, &auth_token)
            .await
            .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
        warehouse
            .ensure_schema()
            .await
            .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
        Ok(Box::new(warehouse))
    }
}

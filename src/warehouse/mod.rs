//! Destination warehouse seam
//!
//! The loader owns the table contract (statement text, column encoding); a
//! warehouse only has to run statements transactionally and read rows back.

pub mod sqlite;
#[cfg(feature = "db")]
pub mod turso;

pub use sqlite::{SqliteDestinationConnector, SqliteWarehouse};
#[cfg(feature = "db")]
pub use turso::{LibsqlDestinationConnector, LibsqlWarehouse};

use crate::error::Result;
use async_trait::async_trait;
use thiserror::Error;

/// Bootstrap DDL for the destination table
pub const SCHEMA_SQL: &str = include_str!("../../migrations/001_create_user_sessions.sql");

/// Column value as bound into, or read out of, a statement
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Text(String),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WarehouseError {
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),

    #[error("row {index} violated a table constraint: {message}")]
    Constraint { index: usize, message: String },

    #[error("row {index} failed: {message}")]
    Statement { index: usize, message: String },

    #[error("query failed: {0}")]
    Query(String),
}

/// One warehouse session, acquired per run and released on drop
#[async_trait]
pub trait SessionWarehouse: Send {
    /// Create the destination table when it does not exist yet
    async fn ensure_schema(&mut self) -> std::result::Result<(), WarehouseError>;

    /// Execute `sql` once per parameter row inside a single transaction.
    ///
    /// Either every row is applied and committed, or the transaction is rolled
    /// back and the index of the first failing row is reported.
    async fn execute_in_transaction(
        &mut self,
        sql: &str,
        rows: &[Vec<SqlValue>],
    ) -> std::result::Result<usize, WarehouseError>;

    async fn query_rows(&mut self, sql: &str) -> std::result::Result<Vec<Vec<SqlValue>>, WarehouseError>;
}

/// Acquires a warehouse session for one run
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SessionWarehouse>>;
}

pub(crate) fn looks_like_constraint_failure(message: &str) -> bool {
    message.to_ascii_lowercase().contains("constraint")
}

use crate::constants::SESSIONS_TABLE;
use crate::domain::CanonicalSessionRecord;
use crate::error::{PipelineError, Result};
use crate::metrics::LoadMetrics;
use crate::warehouse::{SessionWarehouse, SqlValue, WarehouseError};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

/// Insert-or-update keyed on `session_id`; every other column is overwritten (last write wins)
pub const UPSERT_SQL: &str = r#"
    INSERT INTO user_sessions (
        session_id, user_id, start_time, end_time,
        pages_visited, pages_visited_count, device, actions
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(session_id) DO UPDATE SET
        user_id = excluded.user_id,
        start_time = excluded.start_time,
        end_time = excluded.end_time,
        pages_visited = excluded.pages_visited,
        pages_visited_count = excluded.pages_visited_count,
        device = excluded.device,
        actions = excluded.actions
"#;

const SELECT_ALL_SQL: &str = r#"
    SELECT session_id, user_id, start_time, end_time,
           pages_visited, pages_visited_count, device, actions
    FROM user_sessions
    ORDER BY session_id
"#;

const COUNT_SQL: &str = "SELECT COUNT(*) FROM user_sessions";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Records processed; inserts and updates are not distinguished
    pub rows_affected: usize,
}

/// RFC 3339 in UTC, keeping whatever sub-second precision the record carries
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Bind parameters for [`UPSERT_SQL`], in placeholder order
pub fn encode_record(record: &CanonicalSessionRecord) -> Result<Vec<SqlValue>> {
    Ok(vec![
        SqlValue::Text(record.session_id.clone()),
        SqlValue::Integer(record.user_id),
        SqlValue::Text(encode_timestamp(&record.start_time)),
        SqlValue::Text(encode_timestamp(&record.end_time)),
        SqlValue::Text(serde_json::to_string(&record.pages_visited)?),
        SqlValue::Integer(record.pages_visited_count),
        SqlValue::Text(record.device.clone()),
        SqlValue::Text(serde_json::to_string(&record.actions)?),
    ])
}

/// Upsert a canonical batch inside one transaction.
///
/// All-or-nothing: if any record fails the whole batch is rolled back and the
/// error names the offending session.
#[instrument(skip(warehouse, records), fields(batch_size = records.len()))]
pub async fn load(
    warehouse: &mut dyn SessionWarehouse,
    records: &[CanonicalSessionRecord],
) -> Result<LoadResult> {
    if records.is_empty() {
        info!("💾 Nothing to load into {}", SESSIONS_TABLE);
        return Ok(LoadResult::default());
    }

    let rows = records.iter().map(encode_record).collect::<Result<Vec<_>>>()?;
    let session_at = |index: usize| {
        records
            .get(index)
            .map(|r| r.session_id.clone())
            .unwrap_or_default()
    };

    match warehouse.execute_in_transaction(UPSERT_SQL, &rows).await {
        Ok(rows_affected) => {
            LoadMetrics::record_rows_upserted(rows_affected);
            info!("💾 Upserted {} rows into {}", rows_affected, SESSIONS_TABLE);
            Ok(LoadResult { rows_affected })
        }
        Err(WarehouseError::Unavailable(message)) => Err(PipelineError::DestinationUnavailable { message }),
        Err(WarehouseError::Constraint { index, message }) => {
            LoadMetrics::record_batch_rolled_back();
            error!("Batch rolled back: session {} violated a constraint: {}", session_at(index), message);
            Err(PipelineError::ConstraintViolation {
                session_id: session_at(index),
                message,
            })
        }
        Err(WarehouseError::Statement { index, message }) => {
            LoadMetrics::record_batch_rolled_back();
            error!("Batch rolled back: upsert of session {} failed: {}", session_at(index), message);
            Err(PipelineError::LoadAborted {
                session_id: session_at(index),
                message,
            })
        }
        Err(WarehouseError::Query(message)) => {
            error!("Upsert into {} could not be prepared: {}", SESSIONS_TABLE, message);
            Err(PipelineError::IncompatibleDestination { message })
        }
    }
}

/// Every loaded row, ordered by `session_id`
pub async fn fetch_all(warehouse: &mut dyn SessionWarehouse) -> Result<Vec<CanonicalSessionRecord>> {
    let rows = warehouse
        .query_rows(SELECT_ALL_SQL)
        .await
        .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
    rows.iter().map(|row| decode_row(row)).collect()
}

pub async fn row_count(warehouse: &mut dyn SessionWarehouse) -> Result<usize> {
    let rows = warehouse
        .query_rows(COUNT_SQL)
        .await
        .map_err(|e| PipelineError::destination_unavailable(e.to_string()))?;
    rows.first()
        .and_then(|row| row.first())
        .and_then(SqlValue::as_integer)
        .map(|n| n as usize)
        .ok_or_else(|| PipelineError::destination_unavailable("COUNT(*) returned no value"))
}

fn decode_row(row: &[SqlValue]) -> Result<CanonicalSessionRecord> {
    let text = |i: usize| {
        row.get(i)
            .and_then(SqlValue::as_text)
            .ok_or_else(|| PipelineError::destination_unavailable(format!("column {i} is not text")))
    };
    let integer = |i: usize| {
        row.get(i)
            .and_then(SqlValue::as_integer)
            .ok_or_else(|| PipelineError::destination_unavailable(format!("column {i} is not an integer")))
    };
    let timestamp = |i: usize| -> Result<DateTime<Utc>> {
        let raw = text(i)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| PipelineError::destination_unavailable(format!("bad timestamp '{raw}': {e}")))
    };

    Ok(CanonicalSessionRecord {
        session_id: text(0)?.to_string(),
        user_id: integer(1)?,
        start_time: timestamp(2)?,
        end_time: timestamp(3)?,
        pages_visited: serde_json::from_str(text(4)?)?,
        pages_visited_count: integer(5)?,
        device: text(6)?.to_string(),
        actions: serde_json::from_str(text(7)?)?,
    })
}

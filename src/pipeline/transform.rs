use crate::domain::{CanonicalSessionRecord, RawSessionDocument};
use crate::error::{PipelineError, Result};
use crate::metrics::TransformMetrics;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

/// What to do with a document that fails validation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidRecordPolicy {
    /// Fail the whole batch on the first bad document
    #[default]
    Abort,
    /// Drop the bad document and report it
    Skip,
}

/// A document the lenient transform dropped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedRecord {
    pub document_id: String,
    pub session_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformReport {
    pub records: Vec<CanonicalSessionRecord>,
    pub rejected: Vec<RejectedRecord>,
}

fn missing(field: &'static str, raw: &RawSessionDocument) -> PipelineError {
    PipelineError::MissingRequiredField {
        field,
        session_id: raw.session_id.clone(),
        document_id: raw.document_id.clone(),
    }
}

/// Map one raw document to its canonical form
pub fn transform_record(raw: &RawSessionDocument) -> Result<CanonicalSessionRecord> {
    let session_id = raw.session_id.clone().ok_or_else(|| missing("session_id", raw))?;
    let user_id = raw.user_id.ok_or_else(|| missing("user_id", raw))?;
    let start_time = raw.start_time.ok_or_else(|| missing("start_time", raw))?;
    let end_time = raw.end_time.ok_or_else(|| missing("end_time", raw))?;
    let pages_visited = raw.pages_visited.clone().ok_or_else(|| missing("pages_visited", raw))?;
    let actions = raw.actions.clone().ok_or_else(|| missing("actions", raw))?;

    Ok(CanonicalSessionRecord {
        session_id,
        user_id,
        start_time,
        end_time,
        pages_visited_count: pages_visited.len() as i64,
        pages_visited,
        device: raw.device.as_deref().map(str::to_lowercase).unwrap_or_default(),
        actions,
    })
}

/// Transform a whole batch, failing on the first invalid document. Output order follows input order.
#[instrument(skip(batch), fields(batch_size = batch.len()))]
pub fn transform(batch: &[RawSessionDocument]) -> Result<Vec<CanonicalSessionRecord>> {
    let records = batch.iter().map(transform_record).collect::<Result<Vec<_>>>()?;
    TransformMetrics::record_transformed(records.len());
    info!("🔧 Transformed {} session documents", records.len());
    Ok(records)
}

/// Transform a batch, skipping invalid documents and reporting them instead of failing
#[instrument(skip(batch), fields(batch_size = batch.len()))]
pub fn transform_lenient(batch: &[RawSessionDocument]) -> TransformReport {
    let mut report = TransformReport::default();
    for raw in batch {
        match transform_record(raw) {
            Ok(record) => report.records.push(record),
            Err(e) => {
                warn!("Skipping document {}: {}", raw.document_id, e);
                report.rejected.push(RejectedRecord {
                    document_id: raw.document_id.clone(),
                    session_id: raw.session_id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }
    TransformMetrics::record_transformed(report.records.len());
    TransformMetrics::record_rejected(report.rejected.len());
    info!(
        "🔧 Transformed {} session documents, rejected {}",
        report.records.len(),
        report.rejected.len()
    );
    report
}

/// Dispatch on the configured policy
pub fn transform_with_policy(
    batch: &[RawSessionDocument],
    policy: InvalidRecordPolicy,
) -> Result<TransformReport> {
    debug!("Transforming with policy {:?}", policy);
    match policy {
        InvalidRecordPolicy::Abort => Ok(TransformReport {
            records: transform(batch)?,
            rejected: Vec::new(),
        }),
        InvalidRecordPolicy::Skip => Ok(transform_lenient(batch)),
    }
}

use super::extract::{extract, SessionStream};
use super::handoff::{self, HandoffStore, MemoryHandoff};
use super::load::load;
use super::retry::RetryPolicy;
use super::transform::{transform_with_policy, InvalidRecordPolicy, TransformReport};
use crate::constants::DEFAULT_STREAM_CHUNK_SIZE;
use crate::domain::RawSessionDocument;
use crate::error::{PipelineError, Result};
use crate::metrics::RunMetrics;
use crate::storage::{DocumentFilter, SourceConnector};
use crate::warehouse::DestinationConnector;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// One task of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Extract, Stage::Transform, Stage::Load];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "extract" => Ok(Stage::Extract),
            "transform" => Ok(Stage::Transform),
            "load" => Ok(Stage::Load),
            other => Err(PipelineError::Config(format!(
                "unknown stage '{other}' (expected extract, transform or load)"
            ))),
        }
    }
}

/// How a run moves records between stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Whole-batch hand-off between stages
    #[default]
    Batch,
    /// Chunked pass with memory bounded by the chunk size; each chunk commits on its own
    Streaming,
}

/// Outcome of one successful run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub extracted: usize,
    pub transformed: usize,
    pub rejected: usize,
    pub rows_affected: usize,
    /// Attempts per stage, retries included
    pub attempts: BTreeMap<&'static str, u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of a single stage executed through [`PipelineOrchestrator::run_stage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    pub attempts: u32,
    /// Documents extracted, records transformed, or rows upserted
    pub produced: usize,
    pub rejected: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct StageCounts {
    produced: usize,
    rejected: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamTotals {
    extracted: usize,
    transformed: usize,
    rejected: usize,
    rows_affected: usize,
}

/// Sequences extract, transform and load, owning retries and inter-stage hand-off.
///
/// Source and destination connections are acquired per stage attempt and
/// released when the attempt ends, whatever its outcome.
pub struct PipelineOrchestrator {
    source: Arc<dyn SourceConnector>,
    destination: Arc<dyn DestinationConnector>,
    handoff: Arc<dyn HandoffStore>,
    retry: RetryPolicy,
    filter: DocumentFilter,
    on_invalid_record: InvalidRecordPolicy,
    stream_chunk_size: usize,
}

impl PipelineOrchestrator {
    pub fn new(source: Arc<dyn SourceConnector>, destination: Arc<dyn DestinationConnector>) -> Self {
        Self {
            source,
            destination,
            handoff: Arc::new(MemoryHandoff::new()),
            retry: RetryPolicy::default(),
            filter: DocumentFilter::all(),
            on_invalid_record: InvalidRecordPolicy::Abort,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_handoff(mut self, handoff: Arc<dyn HandoffStore>) -> Self {
        self.handoff = handoff;
        self
    }

    pub fn with_filter(mut self, filter: DocumentFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_invalid_record_policy(mut self, policy: InvalidRecordPolicy) -> Self {
        self.on_invalid_record = policy;
        self
    }

    pub fn with_stream_chunk_size(mut self, size: usize) -> Self {
        self.stream_chunk_size = size.max(1);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn new_run_id() -> String {
        format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), uuid::Uuid::new_v4().simple())
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunReport> {
        match mode {
            RunMode::Batch => self.run_once().await,
            RunMode::Streaming => self.run_streaming().await,
        }
    }

    /// Extract, transform and load one batch with whole-batch hand-off between stages
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RunReport> {
        let run_id = Self::new_run_id();
        let started_at = Utc::now();
        info!("🚀 Starting pipeline run {}", run_id);

        let mut attempts = BTreeMap::new();
        let mut counts = BTreeMap::new();
        for stage in Stage::ALL {
            match self.run_stage(stage, &run_id).await {
                Ok(report) => {
                    attempts.insert(stage.name(), report.attempts);
                    counts.insert(stage, report);
                }
                Err(e) => {
                    RunMetrics::record_run_finished(false);
                    error!("❌ Run {} failed at {} ({}): {}", run_id, stage, e.kind(), e);
                    if self.handoff.is_durable() {
                        info!("Hand-off data of run {} kept for re-running the {} stage", run_id, stage);
                    } else if let Err(clear_err) = self.handoff.clear(&run_id).await {
                        warn!("Failed to clear hand-off data for run {}: {}", run_id, clear_err);
                    }
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.handoff.clear(&run_id).await {
            warn!("Failed to clear hand-off data for run {}: {}", run_id, e);
        }

        let produced = |stage: Stage| counts.get(&stage).map_or(0, |r| r.produced);
        let report = RunReport {
            run_id,
            mode: RunMode::Batch,
            extracted: produced(Stage::Extract),
            transformed: produced(Stage::Transform),
            rejected: counts.get(&Stage::Transform).map_or(0, |r| r.rejected),
            rows_affected: produced(Stage::Load),
            attempts,
            started_at,
            completed_at: Utc::now(),
        };
        RunMetrics::record_run_finished(true);
        info!(
            "🎉 Run {} complete: {} extracted, {} transformed, {} rejected, {} rows upserted",
            report.run_id, report.extracted, report.transformed, report.rejected, report.rows_affected
        );
        Ok(report)
    }

    /// Stream documents through transform and load chunk by chunk.
    ///
    /// A failed pass is retried from the start; chunks committed by the failed
    /// pass are upserted again, which leaves the table unchanged.
    #[instrument(skip(self))]
    pub async fn run_streaming(&self) -> Result<RunReport> {
        let run_id = Self::new_run_id();
        let started_at = Utc::now();
        info!(
            "🚀 Starting streaming run {} (chunks of {})",
            run_id, self.stream_chunk_size
        );

        let (result, attempts) = self
            .retry
            .run(
                "streaming pass",
                |_| self.stream_pass(),
                |e| RunMetrics::record_stage_retry("streaming", e.kind()),
            )
            .await;

        let totals = match result {
            Ok(totals) => totals,
            Err(e) => {
                RunMetrics::record_run_finished(false);
                error!("❌ Streaming run {} failed ({}): {}", run_id, e.kind(), e);
                return Err(e);
            }
        };

        let report = RunReport {
            run_id,
            mode: RunMode::Streaming,
            extracted: totals.extracted,
            transformed: totals.transformed,
            rejected: totals.rejected,
            rows_affected: totals.rows_affected,
            attempts: BTreeMap::from([("streaming", attempts)]),
            started_at,
            completed_at: Utc::now(),
        };
        RunMetrics::record_run_finished(true);
        info!(
            "🎉 Streaming run {} complete: {} extracted, {} transformed, {} rejected, {} rows upserted",
            report.run_id, report.extracted, report.transformed, report.rejected, report.rows_affected
        );
        Ok(report)
    }

    /// Execute one stage with retries, reading its input from and writing its
    /// output to the hand-off store under `run_id`.
    #[instrument(skip(self, stage), fields(stage = %stage))]
    pub async fn run_stage(&self, stage: Stage, run_id: &str) -> Result<StageReport> {
        let (result, attempts) = self
            .retry
            .run(
                stage.name(),
                |_| self.attempt_stage(stage, run_id),
                |e| RunMetrics::record_stage_retry(stage.name(), e.kind()),
            )
            .await;
        let counts = result?;
        Ok(StageReport {
            stage,
            attempts,
            produced: counts.produced,
            rejected: counts.rejected,
        })
    }

    async fn attempt_stage(&self, stage: Stage, run_id: &str) -> Result<StageCounts> {
        RunMetrics::record_stage_attempt(stage.name());
        let started = Instant::now();
        let result = match stage {
            Stage::Extract => self.extract_stage(run_id).await,
            Stage::Transform => self.transform_stage(run_id).await,
            Stage::Load => self.load_stage(run_id).await,
        };
        RunMetrics::record_stage_duration(stage.name(), started.elapsed().as_secs_f64());
        result
    }

    async fn extract_stage(&self, run_id: &str) -> Result<StageCounts> {
        info!("📡 Extracting session documents...");
        let collection = self.source.connect().await?;
        let batch = extract(collection.as_ref(), &self.filter).await?;
        handoff::push(self.handoff.as_ref(), run_id, Stage::Extract.name(), &batch).await?;
        Ok(StageCounts {
            produced: batch.len(),
            rejected: 0,
        })
    }

    async fn transform_stage(&self, run_id: &str) -> Result<StageCounts> {
        let batch: Vec<RawSessionDocument> =
            handoff::pull(self.handoff.as_ref(), run_id, Stage::Extract.name()).await?;
        let report = transform_with_policy(&batch, self.on_invalid_record)?;
        handoff::push(self.handoff.as_ref(), run_id, Stage::Transform.name(), &report).await?;
        Ok(StageCounts {
            produced: report.records.len(),
            rejected: report.rejected.len(),
        })
    }

    async fn load_stage(&self, run_id: &str) -> Result<StageCounts> {
        let report: TransformReport =
            handoff::pull(self.handoff.as_ref(), run_id, Stage::Transform.name()).await?;
        info!("💾 Loading {} records...", report.records.len());
        let mut warehouse = self.destination.connect().await?;
        let loaded = load(warehouse.as_mut(), &report.records).await?;
        Ok(StageCounts {
            produced: loaded.rows_affected,
            rejected: 0,
        })
    }

    async fn stream_pass(&self) -> Result<StreamTotals> {
        RunMetrics::record_stage_attempt("streaming");
        let started = Instant::now();
        let result = self.stream_chunks().await;
        RunMetrics::record_stage_duration("streaming", started.elapsed().as_secs_f64());
        result
    }

    async fn stream_chunks(&self) -> Result<StreamTotals> {
        let collection = self.source.connect().await?;
        let mut warehouse = self.destination.connect().await?;
        let mut stream = SessionStream::open(collection.as_ref(), &self.filter).await?;

        let mut totals = StreamTotals::default();
        loop {
            let chunk = stream.next_chunk(self.stream_chunk_size).await?;
            if chunk.is_empty() {
                break;
            }
            totals.extracted += chunk.len();
            let report = transform_with_policy(&chunk, self.on_invalid_record)?;
            totals.transformed += report.records.len();
            totals.rejected += report.rejected.len();
            let loaded = load(warehouse.as_mut(), &report.records).await?;
            totals.rows_affected += loaded.rows_affected;
        }
        Ok(totals)
    }
}

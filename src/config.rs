use crate::constants::{
    DEFAULT_LOG_DIR, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY_SECS, DEFAULT_SCHEDULE,
    DEFAULT_STREAM_CHUNK_SIZE, SESSIONS_COLLECTION, SOURCE_DATABASE,
};
use crate::error::{PipelineError, Result};
use crate::fixtures;
use crate::pipeline::{
    Backoff, FsHandoff, HandoffStore, InvalidRecordPolicy, MemoryHandoff, PipelineOrchestrator,
    RetryPolicy, RunMode, Schedule,
};
use crate::storage::{MemoryDocumentStore, SourceConnector, SqliteSourceConnector};
use crate::warehouse::{DestinationConnector, SqliteDestinationConnector};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub destination: DestinationConfig,
    pub pipeline: PipelineConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Sqlite,
    /// In-process store filled with generated sessions, for demos
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub collection: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sqlite,
            path: PathBuf::from(format!("data/{SOURCE_DATABASE}.db")),
            collection: SESSIONS_COLLECTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[default]
    Sqlite,
    /// Turso/libSQL; needs the `db` feature
    Libsql,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    pub kind: DestinationKind,
    pub path: PathBuf,
    /// libSQL URL; falls back to `LIBSQL_URL`
    pub url: Option<String>,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            kind: DestinationKind::Sqlite,
            path: PathBuf::from("data/warehouse.db"),
            url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub retries: u32,
    pub retry_delay_secs: u64,
    pub backoff: Backoff,
    pub on_invalid_record: InvalidRecordPolicy,
    pub mode: RunMode,
    pub stream_chunk_size: usize,
    /// Persist stage hand-offs here; in memory when unset
    pub handoff_dir: Option<PathBuf>,
    pub schedule: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            backoff: Backoff::Fixed,
            on_invalid_record: InvalidRecordPolicy::Abort,
            mode: RunMode::Batch,
            stream_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
            handoff_dir: None,
            schedule: DEFAULT_SCHEDULE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_dir: PathBuf,
    /// Serve Prometheus metrics on this address when set
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            metrics_addr: None,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = path.as_ref();
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path.display(),
                e
            ))
        })?;

        Self::from_toml_str(&config_content)
    }

    /// Load `path` if it exists, otherwise fall back to validated defaults.
    /// The flag tells whether the file was read.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, true))
        } else {
            let config = Self::default();
            config.validate()?;
            Ok((config, false))
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.stream_chunk_size == 0 {
            return Err(PipelineError::Config(
                "pipeline.stream_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.source.collection.trim().is_empty() {
            return Err(PipelineError::Config("source.collection must not be empty".to_string()));
        }
        self.schedule()?;
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule> {
        self.pipeline.schedule.parse()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.pipeline.retries,
            Duration::from_secs(self.pipeline.retry_delay_secs),
        )
        .with_backoff(self.pipeline.backoff)
    }

    pub fn source_connector(&self) -> Result<Arc<dyn SourceConnector>> {
        match self.source.kind {
            SourceKind::Sqlite => Ok(Arc::new(SqliteSourceConnector::new(
                self.source.path.clone(),
                self.source.collection.clone(),
            ))),
            SourceKind::Memory => {
                let store = MemoryDocumentStore::new();
                fixtures::seed(&store, &self.source.collection, fixtures::DEFAULT_SEED_COUNT)?;
                Ok(Arc::new(store.collection(&self.source.collection)))
            }
        }
    }

    pub fn destination_connector(&self) -> Result<Arc<dyn DestinationConnector>> {
        match self.destination.kind {
            DestinationKind::Sqlite => Ok(Arc::new(SqliteDestinationConnector::new(
                self.destination.path.clone(),
            ))),
            #[cfg(feature = "db")]
            DestinationKind::Libsql => Ok(Arc::new(crate::warehouse::LibsqlDestinationConnector::new(
                self.destination.url.clone(),
            ))),
            #[cfg(not(feature = "db"))]
            DestinationKind::Libsql => Err(PipelineError::Config(
                "the libsql destination needs a build with the `db` feature".to_string(),
            )),
        }
    }

    pub fn handoff_store(&self) -> Arc<dyn HandoffStore> {
        match &self.pipeline.handoff_dir {
            Some(dir) => Arc::new(FsHandoff::new(dir.clone())),
            None => Arc::new(MemoryHandoff::new()),
        }
    }

    /// Wire the configured source, destination, hand-off and policies together
    pub fn build_orchestrator(&self) -> Result<PipelineOrchestrator> {
        Ok(
            PipelineOrchestrator::new(self.source_connector()?, self.destination_connector()?)
                .with_retry_policy(self.retry_policy())
                .with_handoff(self.handoff_store())
                .with_invalid_record_policy(self.pipeline.on_invalid_record)
                .with_stream_chunk_size(self.pipeline.stream_chunk_size),
        )
    }
}

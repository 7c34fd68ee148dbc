//! Inter-stage hand-off storage
//!
//! Each stage publishes its output under `(run_id, stage)` and the next stage
//! pulls it from there, so a stage can be re-run on its own from the
//! persisted input of the stage before it.

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[async_trait]
pub trait HandoffStore: Send + Sync {
    /// Store a serialized payload, replacing any earlier one for the same key
    async fn put(&self, run_id: &str, stage: &str, payload: String) -> Result<()>;

    async fn get(&self, run_id: &str, stage: &str) -> Result<String>;

    /// Forget everything stored for a run
    async fn clear(&self, run_id: &str) -> Result<()>;

    /// Whether stored data outlives the process, so a failed run can be resumed later
    fn is_durable(&self) -> bool;
}

/// Serialize `value` and publish it
pub async fn push<T: Serialize + ?Sized>(
    store: &dyn HandoffStore,
    run_id: &str,
    stage: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_string(value)?;
    store.put(run_id, stage, payload).await
}

/// Fetch and deserialize a published payload
pub async fn pull<T: DeserializeOwned>(store: &dyn HandoffStore, run_id: &str, stage: &str) -> Result<T> {
    let payload = store.get(run_id, stage).await?;
    serde_json::from_str(&payload)
        .map_err(|e| PipelineError::handoff_corrupt(format!("{run_id}/{stage}: undecodable payload: {e}")))
}

pub(crate) fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Process-local hand-off
#[derive(Clone, Default)]
pub struct MemoryHandoff {
    entries: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemoryHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `(run, stage)` payloads currently held
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HandoffStore for MemoryHandoff {
    async fn put(&self, run_id: &str, stage: &str, payload: String) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PipelineError::handoff("hand-off lock poisoned"))?;
        entries.insert((run_id.to_string(), stage.to_string()), payload);
        Ok(())
    }

    async fn get(&self, run_id: &str, stage: &str) -> Result<String> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| PipelineError::handoff("hand-off lock poisoned"))?;
        entries
            .get(&(run_id.to_string(), stage.to_string()))
            .cloned()
            .ok_or_else(|| PipelineError::handoff(format!("no {stage} output recorded for run {run_id}")))
    }

    async fn clear(&self, run_id: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| PipelineError::handoff("hand-off lock poisoned"))?;
        entries.retain(|(run, _), _| run != run_id);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    stage: String,
    sha256: String,
    written_at: chrono::DateTime<chrono::Utc>,
    payload: String,
}

/// File-backed hand-off: `<dir>/<run_id>/<stage>.json`, checksummed
#[derive(Debug, Clone)]
pub struct FsHandoff {
    dir: PathBuf,
}

impl FsHandoff {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str, stage: &str) -> PathBuf {
        self.dir.join(run_id).join(format!("{stage}.json"))
    }
}

#[async_trait]
impl HandoffStore for FsHandoff {
    async fn put(&self, run_id: &str, stage: &str, payload: String) -> Result<()> {
        let path = self.path_for(run_id, stage);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let envelope = Envelope {
            stage: stage.to_string(),
            sha256: checksum(&payload),
            written_at: chrono::Utc::now(),
            payload,
        };
        let content = serde_json::to_string_pretty(&envelope)?;

        // Write then rename so readers never see a half-written file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Persisted {} hand-off to {}", stage, path.display());
        Ok(())
    }

    async fn get(&self, run_id: &str, stage: &str) -> Result<String> {
        let path = self.path_for(run_id, stage);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            PipelineError::handoff(format!("cannot read {}: {e}", path.display()))
        })?;
        let envelope: Envelope = serde_json::from_str(&content).map_err(|e| {
            PipelineError::handoff_corrupt(format!("unreadable envelope in {}: {e}", path.display()))
        })?;
        if checksum(&envelope.payload) != envelope.sha256 {
            return Err(PipelineError::handoff_corrupt(format!(
                "checksum mismatch in {}",
                path.display()
            )));
        }
        Ok(envelope.payload)
    }

    async fn clear(&self, run_id: &str) -> Result<()> {
        let dir = self.dir.join(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_handoff_round_trip_and_clear() {
        let store = MemoryHandoff::new();
        push(&store, "run-1", "extract", &vec![1, 2, 3]).await.unwrap();
        let back: Vec<i32> = pull(&store, "run-1", "extract").await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);

        assert_eq!(store.len(), 1);
        store.clear("run-1").await.unwrap();
        assert!(store.is_empty());
        let err = pull::<Vec<i32>>(&store, "run-1", "extract").await.unwrap_err();
        assert!(matches!(err, PipelineError::Handoff { .. }));
    }

    #[tokio::test]
    async fn test_fs_handoff_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHandoff::new(dir.path());
        push(&store, "run-7", "transform", &"payload").await.unwrap();

        assert!(dir.path().join("run-7").join("transform.json").exists());
        let back: String = pull(&store, "run-7", "transform").await.unwrap();
        assert_eq!(back, "payload");

        store.clear("run-7").await.unwrap();
        assert!(!dir.path().join("run-7").exists());
        // Clearing twice is fine
        store.clear("run-7").await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_handoff_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHandoff::new(dir.path());
        push(&store, "r", "extract", &vec!["a"]).await.unwrap();

        let path = dir.path().join("r").join("extract.json");
        let content = std::fs::read_to_string(&path).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&content).unwrap();
        envelope["payload"] = serde_json::Value::String(r#"["b"]"#.to_string());
        std::fs::write(&path, envelope.to_string()).unwrap();

        let err = store.get("r", "extract").await.unwrap_err();
        assert!(matches!(err, PipelineError::HandoffCorrupt { .. }), "{err}");
        assert!(err.to_string().contains("checksum mismatch"), "{err}");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_corrupt() {
        let store = MemoryHandoff::new();
        store.put("r", "extract", "not json".to_string()).await.unwrap();
        let err = pull::<Vec<String>>(&store, "r", "extract").await.unwrap_err();
        assert!(matches!(err, PipelineError::HandoffCorrupt { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_missing_payload_is_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsHandoff::new(dir.path());
        let err = store.get("never-ran", "extract").await.unwrap_err();
        assert!(matches!(err, PipelineError::Handoff { .. }), "{err}");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_durability() {
        assert!(!MemoryHandoff::new().is_durable());
        assert!(FsHandoff::new("/tmp/handoff").is_durable());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

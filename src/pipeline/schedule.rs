use super::orchestrator::{PipelineOrchestrator, RunMode};
use crate::error::{PipelineError, Result};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Fixed run interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    every: Duration,
}

impl Schedule {
    pub fn every(every: Duration) -> Result<Self> {
        if every.is_zero() {
            return Err(PipelineError::Config("schedule interval must be positive".to_string()));
        }
        Ok(Self { every })
    }

    pub fn interval(&self) -> Duration {
        self.every
    }
}

impl FromStr for Schedule {
    type Err = PipelineError;

    /// `@hourly`, `@daily`, `@weekly`, or a count with a unit: `30s`, `15m`, `6h`, `2d`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let secs = match s {
            "@hourly" => 3_600,
            "@daily" => 86_400,
            "@weekly" => 7 * 86_400,
            _ => {
                let invalid = || PipelineError::Config(format!("invalid schedule '{s}'"));
                let split = s.len().checked_sub(1).filter(|&i| s.is_char_boundary(i)).ok_or_else(invalid)?;
                let (count, unit) = s.split_at(split);
                let count: u64 = count.parse().map_err(|_| invalid())?;
                let unit_secs = match unit {
                    "s" => 1,
                    "m" => 60,
                    "h" => 3_600,
                    "d" => 86_400,
                    _ => return Err(invalid()),
                };
                count.checked_mul(unit_secs).ok_or_else(invalid)?
            }
        };
        Schedule::every(Duration::from_secs(secs))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "every {:?}", self.every)
    }
}

/// Fires a run on every tick of the schedule.
///
/// The first run starts immediately. Ticks missed while a run is still going
/// are dropped rather than caught up, so runs never overlap.
pub struct Scheduler {
    orchestrator: Arc<PipelineOrchestrator>,
    schedule: Schedule,
    mode: RunMode,
    max_runs: Option<usize>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, schedule: Schedule) -> Self {
        Self {
            orchestrator,
            schedule,
            mode: RunMode::Batch,
            max_runs: None,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_runs(mut self, max_runs: Option<usize>) -> Self {
        self.max_runs = max_runs;
        self
    }

    /// Run until `shutdown` resolves or `max_runs` runs have happened. Returns
    /// the number of runs started. A failed run is logged and the schedule goes on.
    pub async fn run_until<F>(&self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.schedule.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("⏰ Scheduler started: {} ({:?} mode)", self.schedule, self.mode);
        let mut runs = 0;
        loop {
            if self.max_runs.is_some_and(|max| runs >= max) {
                info!("Reached the configured maximum of {} runs", runs);
                break;
            }
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested, scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    runs += 1;
                    match self.orchestrator.run(self.mode).await {
                        Ok(report) => info!("Scheduled run {} succeeded ({} rows)", report.run_id, report.rows_affected),
                        Err(e) => error!("Scheduled run failed ({}): {}", e.kind(), e),
                    }
                }
            }
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RetryPolicy;
    use crate::storage::MemoryDocumentStore;
    use crate::warehouse::SqliteDestinationConnector;

    #[test]
    fn test_schedule_parsing() {
        assert_eq!("@hourly".parse::<Schedule>().unwrap().interval(), Duration::from_secs(3_600));
        assert_eq!("@daily".parse::<Schedule>().unwrap().interval(), Duration::from_secs(86_400));
        assert_eq!("@weekly".parse::<Schedule>().unwrap().interval(), Duration::from_secs(604_800));
        assert_eq!("30s".parse::<Schedule>().unwrap().interval(), Duration::from_secs(30));
        assert_eq!("15m".parse::<Schedule>().unwrap().interval(), Duration::from_secs(900));
        assert_eq!("2d".parse::<Schedule>().unwrap().interval(), Duration::from_secs(172_800));

        for bad in ["", "m", "0s", "10x", "-5m", "@monthly", "1.5h"] {
            assert!(bad.parse::<Schedule>().is_err(), "{bad} should be rejected");
        }
    }

    fn scheduler(dir: &std::path::Path) -> Scheduler {
        let store = MemoryDocumentStore::new();
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(store.collection("UserSessions")),
            Arc::new(SqliteDestinationConnector::new(dir.join("wh.db"))),
        )
        .with_retry_policy(RetryPolicy::no_retry());
        Scheduler::new(Arc::new(orchestrator), "@hourly".parse().unwrap())
    }

    #[tokio::test]
    async fn test_first_run_fires_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let runs = scheduler(dir.path())
            .with_max_runs(Some(1))
            .run_until(std::future::pending())
            .await;
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_shutdown_wins_over_a_due_tick() {
        let dir = tempfile::tempdir().unwrap();
        let runs = scheduler(dir.path()).run_until(async {}).await;
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn test_failed_runs_do_not_stop_the_schedule() {
        let dir = tempfile::tempdir().unwrap();
        // A directory is not a usable warehouse, so every run fails
        let orchestrator = PipelineOrchestrator::new(
            Arc::new(MemoryDocumentStore::new().collection("UserSessions")),
            Arc::new(SqliteDestinationConnector::new(dir.path())),
        )
        .with_retry_policy(RetryPolicy::no_retry());
        let runs = Scheduler::new(Arc::new(orchestrator), "1s".parse().unwrap())
            .with_max_runs(Some(2))
            .run_until(std::future::pending())
            .await;
        assert_eq!(runs, 2);
    }
}

// Session replication pipeline: extract, transform, load, and the orchestration around them

pub mod extract;
pub mod handoff;
pub mod load;
pub mod orchestrator;
pub mod retry;
pub mod schedule;
pub mod transform;

// Re-export the stage entry points
pub use extract::{extract, SessionStream};
pub use handoff::{FsHandoff, HandoffStore, MemoryHandoff};
pub use load::{fetch_all, load, row_count, LoadResult};
pub use orchestrator::{PipelineOrchestrator, RunMode, RunReport, Stage, StageReport};
pub use retry::{Backoff, RetryPolicy};
pub use schedule::{Schedule, Scheduler};
pub use transform::{
    transform, transform_lenient, transform_record, transform_with_policy, InvalidRecordPolicy,
    RejectedRecord, TransformReport,
};

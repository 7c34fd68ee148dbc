pub mod config;
pub mod constants;
pub mod error;
pub mod fixtures;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod storage;
pub mod warehouse;

// Session record shapes shared by every stage
pub mod domain;

pub use error::{PipelineError, Result};

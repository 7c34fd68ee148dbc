/// Names shared between the pipeline stages, the stores and the CLI

// Source document store
pub const SOURCE_DATABASE: &str = "users";
pub const SESSIONS_COLLECTION: &str = "UserSessions";

// Destination warehouse
pub const SESSIONS_TABLE: &str = "user_sessions";

// Orchestration defaults (one retry, one minute apart, once a day)
pub const DEFAULT_RETRIES: u32 = 1;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_SCHEDULE: &str = "@daily";
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 500;

// Rows fetched per round trip by paging cursors
pub const CURSOR_PAGE_SIZE: usize = 256;

pub const DEFAULT_LOG_DIR: &str = "logs";
pub const LOG_FILE_NAME: &str = "replicator.log";

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable: {message}")]
    SourceUnavailable { message: String },

    #[error("Source query failed: {message}")]
    SourceQueryError { message: String },

    #[error("Malformed document {document_id}: {reason}")]
    MalformedDocument { document_id: String, reason: String },

    #[error("Missing required field '{field}' in document {document_id}{}", session_suffix(.session_id))]
    MissingRequiredField {
        field: &'static str,
        session_id: Option<String>,
        document_id: String,
    },

    #[error("Destination unavailable: {message}")]
    DestinationUnavailable { message: String },

    #[error("Constraint violation for session {session_id}: {message}")]
    ConstraintViolation { session_id: String, message: String },

    #[error("Load aborted at session {session_id}: {message}")]
    LoadAborted { session_id: String, message: String },

    #[error("Upsert rejected by destination schema: {message}")]
    IncompatibleDestination { message: String },

    #[error("Stage hand-off failed: {message}")]
    Handoff { message: String },

    #[error("Stage hand-off data is corrupt: {message}")]
    HandoffCorrupt { message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn session_suffix(session_id: &Option<String>) -> String {
    match session_id {
        Some(id) => format!(" (session {id})"),
        None => String::new(),
    }
}

impl PipelineError {
    /// Stable snake_case name used in log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::SourceUnavailable { .. } => "source_unavailable",
            PipelineError::SourceQueryError { .. } => "source_query_error",
            PipelineError::MalformedDocument { .. } => "malformed_document",
            PipelineError::MissingRequiredField { .. } => "missing_required_field",
            PipelineError::DestinationUnavailable { .. } => "destination_unavailable",
            PipelineError::ConstraintViolation { .. } => "constraint_violation",
            PipelineError::LoadAborted { .. } => "load_aborted",
            PipelineError::IncompatibleDestination { .. } => "incompatible_destination",
            PipelineError::Handoff { .. } => "handoff",
            PipelineError::HandoffCorrupt { .. } => "handoff_corrupt",
            PipelineError::Config(_) => "config",
            PipelineError::Json(_) => "json",
            PipelineError::Toml(_) => "toml",
            PipelineError::Io(_) => "io",
        }
    }

    /// Whether the orchestrator may re-attempt the stage that produced this error.
    ///
    /// Data-quality faults, corrupt hand-off data and a destination schema
    /// that rejects the upsert are deterministic, so repeating the stage
    /// cannot succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::SourceUnavailable { .. }
                | PipelineError::SourceQueryError { .. }
                | PipelineError::DestinationUnavailable { .. }
                | PipelineError::LoadAborted { .. }
                | PipelineError::Handoff { .. }
                | PipelineError::Io(_)
        )
    }

    pub fn source_unavailable(message: impl Into<String>) -> Self {
        PipelineError::SourceUnavailable { message: message.into() }
    }

    pub fn source_query(message: impl Into<String>) -> Self {
        PipelineError::SourceQueryError { message: message.into() }
    }

    pub fn destination_unavailable(message: impl Into<String>) -> Self {
        PipelineError::DestinationUnavailable { message: message.into() }
    }

    pub fn handoff(message: impl Into<String>) -> Self {
        PipelineError::Handoff { message: message.into() }
    }

    pub fn handoff_corrupt(message: impl Into<String>) -> Self {
        PipelineError::HandoffCorrupt { message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_message_includes_session_when_known() {
        let err = PipelineError::MissingRequiredField {
            field: "user_id",
            session_id: Some("s1".to_string()),
            document_id: "abc".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing required field 'user_id' in document abc (session s1)"
        );

        let err = PipelineError::MissingRequiredField {
            field: "session_id",
            session_id: None,
            document_id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Missing required field 'session_id' in document abc");
    }

    #[test]
    fn test_data_quality_faults_are_not_retryable() {
        let missing = PipelineError::MissingRequiredField {
            field: "actions",
            session_id: None,
            document_id: "1".to_string(),
        };
        let constraint = PipelineError::ConstraintViolation {
            session_id: "s1".to_string(),
            message: "CHECK failed".to_string(),
        };
        assert!(!missing.is_retryable());
        assert!(!constraint.is_retryable());
        assert!(!PipelineError::Config("bad".to_string()).is_retryable());
        assert!(!PipelineError::handoff_corrupt("checksum mismatch").is_retryable());
        assert!(!PipelineError::IncompatibleDestination {
            message: "no such column".to_string()
        }
        .is_retryable());
        assert!(PipelineError::handoff("cannot read").is_retryable());

        assert!(PipelineError::source_unavailable("down").is_retryable());
        assert!(PipelineError::destination_unavailable("down").is_retryable());
        assert!(PipelineError::LoadAborted {
            session_id: "s1".to_string(),
            message: "disk I/O error".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(PipelineError::source_query("boom").kind(), "source_query_error");
        assert_eq!(PipelineError::handoff("gone").kind(), "handoff");
        assert_eq!(PipelineError::handoff_corrupt("bad").kind(), "handoff_corrupt");
    }
}

use thiserror::Error;

/// The six error kinds of §7. Variants carry enough context to render a
/// sanitized, user-visible message without leaking secrets or raw
/// prompts — `Display` never includes prompt/driver payload content,
/// only lengths or hashes, matching the teacher's `redact_text` pattern.
#[derive(Debug, Error)]
pub enum AmeliaError {
    #[error("transient provider error ({provider}): {reason}")]
    TransientProvider { provider: String, reason: String },

    #[error("schema validation failed for `{schema_name}`: {reason}")]
    SchemaValidation {
        schema_name: String,
        reason: String,
    },

    #[error("concurrent write to single-writer field `{0}`")]
    ConcurrentWrite(String),

    #[error("sandbox error during `{operation}`: {reason}")]
    Sandbox { operation: String, reason: String },

    #[error("ingestion error: {0}")]
    Ingestion(String),

    #[error("auth error: {0}")]
    Auth(String),
}

impl AmeliaError {
    /// Whether this error kind is retryable at the workflow level — only
    /// `TransientProvider` is (§7, §4.5).
    pub fn is_retryable(&self) -> bool {
        matches!(self, AmeliaError::TransientProvider { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AmeliaError::TransientProvider { .. } => "transient_provider_error",
            AmeliaError::SchemaValidation { .. } => "schema_validation_error",
            AmeliaError::ConcurrentWrite(_) => "concurrent_write_error",
            AmeliaError::Sandbox { .. } => "sandbox_error",
            AmeliaError::Ingestion(_) => "ingestion_error",
            AmeliaError::Auth(_) => "auth_error",
        }
    }
}

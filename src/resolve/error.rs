use thiserror::Error;

/// Failures talking to or interpreting the LLM backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("llm backend unavailable: {0}")]
    Unavailable(String),
    #[error("llm backend rate limited")]
    RateLimit,
    #[error("failed to parse llm response: {0}")]
    ParseFailure(String),
    #[error("llm response did not match the expected schema: {0}")]
    InvalidSchema(String),
    #[error("prompt content too long")]
    ContentTooLong,
    #[error("llm response was truncated at the token limit")]
    TokenLimit,
}

impl LlmError {
    /// Wire-level kind string for audit records and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::Timeout(_) => "timeout",
            LlmError::Unavailable(_) => "unavailable",
            LlmError::RateLimit => "rate_limit",
            LlmError::ParseFailure(_) => "parse_failure",
            LlmError::InvalidSchema(_) => "invalid_schema",
            LlmError::ContentTooLong => "content_too_long",
            LlmError::TokenLimit => "token_limit",
        }
    }

}

/// Raised by entity directory implementations during candidate gathering.
#[derive(Debug, Error)]
#[error("entity directory error: {0}")]
pub struct DirectoryError(pub String);

/// Anything that can fail a resolution batch.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("trace recording failed: {0}")]
    Trace(#[from] crate::resolve::trace::TraceError),
}

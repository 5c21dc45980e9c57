use thiserror::Error;

/// Wire-level error taxonomy for ingest failures.
///
/// These kinds are what gets persisted to the errors table and counted in the
/// final report; the typed [`IngestError`] variants map onto them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ParseError,
    EncodingError,
    IoError,
    ValidationError,
    StorageError,
    UnexpectedError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ParseError => "parse_error",
            ErrorKind::EncodingError => "encoding_error",
            ErrorKind::IoError => "io_error",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::StorageError => "storage_error",
            ErrorKind::UnexpectedError => "unexpected_error",
        }
    }

    /// Classify a free-form error message by substring.
    ///
    /// Used for errors that arrive as strings from lower layers. Order matters:
    /// parse beats encoding beats io.
    pub fn classify(message: &str) -> ErrorKind {
        let lower = message.to_lowercase();
        if lower.contains("parse") {
            ErrorKind::ParseError
        } else if lower.contains("encoding") {
            ErrorKind::EncodingError
        } else if lower.contains("io") || lower.contains("read") || lower.contains("open") {
            ErrorKind::IoError
        } else if lower.contains("validation") {
            ErrorKind::ValidationError
        } else if lower.contains("storage") || lower.contains("database") {
            ErrorKind::StorageError
        } else {
            ErrorKind::UnexpectedError
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised along the ingest path.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("parse failure for {path}: {message}")]
    Parse { path: String, message: String },
    #[error("encoding failure for {path}: {message}")]
    Encoding { path: String, message: String },
    #[error("io failure for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("storage failure: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("{0}")]
    Unexpected(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Parse { .. } => ErrorKind::ParseError,
            IngestError::Encoding { .. } => ErrorKind::EncodingError,
            IngestError::Io { .. } => ErrorKind::IoError,
            IngestError::Validation(_) => ErrorKind::ValidationError,
            IngestError::Storage(_) => ErrorKind::StorageError,
            IngestError::Unexpected(message) => ErrorKind::classify(message),
        }
    }
}

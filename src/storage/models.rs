use crate::ingest::classifier::{ProcessingStep, ProcessingTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Where a stored content item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "source_system", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    ManualEml,
    EmbeddedEmail,
    Attachment,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::ManualEml => "manual_eml",
            SourceSystem::EmbeddedEmail => "embedded_email",
            SourceSystem::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "processing_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ingest_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

/// Insert shape for a source row.
///
/// `raw_content` holds body text for emails; for binary attachments it is the
/// base64 payload with a `base64:` prefix (see [`StoredContent`]).
/// `content_size` is the length of the stored body, not of the original part;
/// readers wanting the original attachment size should use the link's
/// `size_bytes`.
#[derive(Debug, Clone)]
pub struct NewEmailSource {
    pub tenant_id: Uuid,
    pub source_system: SourceSystem,
    pub external_id: String,
    pub content_hash: String,
    pub raw_content: String,
    pub content_type: String,
    pub content_size: i64,
    pub ingestion_metadata: Value,
    pub source_timestamp: Option<DateTime<Utc>>,
    pub participant_emails: Vec<String>,
    pub content_id: Option<String>,
}

/// Identity of a freshly inserted source row.
#[derive(Debug, Clone)]
pub struct CreatedSource {
    pub id: i64,
    pub created_at: DateTime<Utc>,
}

/// Wrapper for reading stored source content back out.
///
/// Binary content is stored base64-encoded behind a `base64:` prefix; readers
/// must go through [`StoredContent::decode`] to round-trip it.
#[derive(Debug, Clone)]
pub struct StoredContent(pub String);

pub const BASE64_CONTENT_PREFIX: &str = "base64:";

impl StoredContent {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        match self.0.strip_prefix(BASE64_CONTENT_PREFIX) {
            Some(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded),
            None => Ok(self.0.as_bytes().to_vec()),
        }
    }
}

/// External id for an attachment source row.
pub fn attachment_external_id(parent_source_id: i64, position: i32) -> String {
    format!("attachment:{}:{}", parent_source_id, position)
}

/// Insert shape for an attachment link row.
#[derive(Debug, Clone)]
pub struct NewAttachmentLink {
    pub parent_source_id: i64,
    pub child_source_id: Option<i64>,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub position: i32,
    pub content_id: Option<String>,
    pub is_inline: bool,
    pub processing_tier: ProcessingTier,
    pub tier_reason: String,
    pub processing_steps: Vec<ProcessingStep>,
    pub is_embedded_email: bool,
}

/// Which uniqueness rule flagged a duplicate. Message-id wins over hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateReason {
    MessageId,
    ContentHash,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::MessageId => "message_id",
            DuplicateReason::ContentHash => "content_hash",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub existing_id: Option<i64>,
    pub reason: Option<DuplicateReason>,
}

impl DuplicateCheck {
    pub fn not_duplicate() -> Self {
        Self {
            is_duplicate: false,
            existing_id: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewIngestJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: JobStatus,
    pub source_system: SourceSystem,
    pub content_type: String,
    pub total_count: i32,
    pub file_manifest: Vec<String>,
    pub options: Value,
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub status: JobStatus,
    pub source_system: SourceSystem,
    pub content_type: String,
    pub total_count: i32,
    pub processed_count: i32,
    pub imported_count: i32,
    pub skipped_count: i32,
    pub failed_count: i32,
    pub file_manifest: Vec<String>,
    pub processed_files: Vec<String>,
    pub options: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//! Persistence layer.
//!
//! [`IngestStore`] is the repository seam the ingest pipeline talks to; the
//! Postgres implementation lives in [`postgres`]. Duplicate detection is a
//! pre-insert check; races are ultimately caught by the partial unique
//! indexes on `(tenant_id, external_id)` and `(tenant_id, content_hash)`.

pub mod models;
pub mod postgres;

pub use models::*;
pub use postgres::PgIngestStore;

use crate::ingest::error::ErrorKind;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0} not found")]
    NotFound(&'static str),
}

/// Repository surface for the ingest pipeline. All operations are tenant
/// scoped and take effect against non-deleted rows only.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn create_source(&self, source: NewEmailSource) -> Result<CreatedSource, StorageError>;

    async fn exists_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<bool, StorageError>;

    async fn exists_by_content_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StorageError>;

    /// Message-id precedence over content hash.
    async fn check_duplicate(
        &self,
        tenant_id: Uuid,
        external_id: &str,
        content_hash: &str,
    ) -> Result<DuplicateCheck, StorageError>;

    /// Insert the attachment's source row and its link row in one
    /// transaction. Returns `(child_source_id, link_id)`.
    async fn create_attachment_with_source(
        &self,
        source: NewEmailSource,
        link: NewAttachmentLink,
    ) -> Result<(i64, i64), StorageError>;

    async fn create_attachment_link_only(
        &self,
        link: NewAttachmentLink,
    ) -> Result<i64, StorageError>;

    /// Child source id of an existing link carrying this content hash, if one
    /// was already stored. Used to dedupe attachment bytes across emails.
    async fn find_stored_attachment_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<i64>, StorageError>;

    async fn create_job(&self, job: NewIngestJob) -> Result<Uuid, StorageError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, StorageError>;

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        processed: i32,
        imported: i32,
        skipped: i32,
        failed: i32,
        processed_files: &[String],
    ) -> Result<(), StorageError>;

    async fn complete_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), StorageError>;

    async fn record_error(
        &self,
        job_id: Uuid,
        file_path: &str,
        kind: ErrorKind,
        message: &str,
        details: Value,
    ) -> Result<(), StorageError>;

    /// Files from `all_files` not yet in the job's processed set. Used for
    /// resume.
    async fn remaining_files_for_job(
        &self,
        job_id: Uuid,
        all_files: &[String],
    ) -> Result<Vec<String>, StorageError>;

    /// Mark a source failed/completed with an optional triage metadata merge.
    /// Triage keys are merged into the existing ingestion metadata; same-named
    /// keys are overwritten. `None` and an empty map both leave the metadata
    /// untouched.
    async fn update_source_status_with_failure(
        &self,
        source_id: i64,
        status: ProcessingStatus,
        failure_category: &str,
        failure_reason: &str,
        triage_metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), StorageError>;
}

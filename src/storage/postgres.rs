//! Postgres repository.

use crate::ingest::error::ErrorKind;
use crate::storage::{
    CreatedSource, DuplicateCheck, DuplicateReason, IngestJob, IngestStore, JobStatus,
    NewAttachmentLink, NewEmailSource, NewIngestJob, ProcessingStatus, StorageError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Connect a pool using the `DB_*` environment configuration.
pub async fn connect_pool(config: &crate::config::DbConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.connect_timeout)
        .connect(&config.connection_url())
        .await
}

/// Run the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

#[derive(Clone)]
pub struct PgIngestStore {
    pool: PgPool,
}

impl PgIngestStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_source(
        tx: &mut Transaction<'_, Postgres>,
        source: &NewEmailSource,
    ) -> Result<CreatedSource, sqlx::Error> {
        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            r#"INSERT INTO sources
               (tenant_id, source_system, external_id, content_hash, raw_content,
                content_type, content_size, ingestion_metadata, processing_status,
                source_timestamp, participant_emails, content_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $10, $11)
               RETURNING id, created_at"#,
        )
        .bind(source.tenant_id)
        .bind(source.source_system)
        .bind(&source.external_id)
        .bind(&source.content_hash)
        .bind(&source.raw_content)
        .bind(&source.content_type)
        .bind(source.content_size)
        .bind(&source.ingestion_metadata)
        .bind(source.source_timestamp)
        .bind(&source.participant_emails)
        .bind(&source.content_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(CreatedSource { id, created_at })
    }

    async fn insert_link(
        tx: &mut Transaction<'_, Postgres>,
        link: &NewAttachmentLink,
    ) -> Result<i64, sqlx::Error> {
        let steps =
            serde_json::to_value(&link.processing_steps).unwrap_or(Value::Array(Vec::new()));

        let (id,): (i64,) = sqlx::query_as(
            r#"INSERT INTO source_attachments
               (parent_source_id, child_source_id, filename, mime_type, size_bytes,
                content_hash, position, content_id, is_inline, processing_tier,
                tier_reason, processing_steps, is_embedded_email)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
               RETURNING id"#,
        )
        .bind(link.parent_source_id)
        .bind(link.child_source_id)
        .bind(&link.filename)
        .bind(&link.mime_type)
        .bind(link.size_bytes)
        .bind(&link.content_hash)
        .bind(link.position)
        .bind(&link.content_id)
        .bind(link.is_inline)
        .bind(link.processing_tier)
        .bind(&link.tier_reason)
        .bind(steps)
        .bind(link.is_embedded_email)
        .fetch_one(&mut **tx)
        .await?;

        Ok(id)
    }
}

#[async_trait]
impl IngestStore for PgIngestStore {
    async fn create_source(&self, source: NewEmailSource) -> Result<CreatedSource, StorageError> {
        let mut tx = self.pool.begin().await?;
        let created = Self::insert_source(&mut tx, &source).await?;
        tx.commit().await?;
        Ok(created)
    }

    async fn exists_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<bool, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM sources
             WHERE tenant_id = $1 AND external_id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn exists_by_content_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM sources
             WHERE tenant_id = $1 AND content_hash = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn check_duplicate(
        &self,
        tenant_id: Uuid,
        external_id: &str,
        content_hash: &str,
    ) -> Result<DuplicateCheck, StorageError> {
        let by_id: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM sources
             WHERE tenant_id = $1 AND external_id = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = by_id {
            return Ok(DuplicateCheck {
                is_duplicate: true,
                existing_id: Some(id),
                reason: Some(DuplicateReason::MessageId),
            });
        }

        let by_hash: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM sources
             WHERE tenant_id = $1 AND content_hash = $2 AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((id,)) = by_hash {
            return Ok(DuplicateCheck {
                is_duplicate: true,
                existing_id: Some(id),
                reason: Some(DuplicateReason::ContentHash),
            });
        }

        Ok(DuplicateCheck::not_duplicate())
    }

    async fn create_attachment_with_source(
        &self,
        source: NewEmailSource,
        mut link: NewAttachmentLink,
    ) -> Result<(i64, i64), StorageError> {
        let mut tx = self.pool.begin().await?;

        let created = Self::insert_source(&mut tx, &source).await?;
        link.child_source_id = Some(created.id);
        let link_id = Self::insert_link(&mut tx, &link).await?;

        tx.commit().await?;
        Ok((created.id, link_id))
    }

    async fn create_attachment_link_only(
        &self,
        link: NewAttachmentLink,
    ) -> Result<i64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let link_id = Self::insert_link(&mut tx, &link).await?;
        tx.commit().await?;
        Ok(link_id)
    }

    async fn find_stored_attachment_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<i64>, StorageError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT child_source_id FROM source_attachments
             WHERE content_hash = $1 AND child_source_id IS NOT NULL
             LIMIT 1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn create_job(&self, job: NewIngestJob) -> Result<Uuid, StorageError> {
        let manifest =
            serde_json::to_value(&job.file_manifest).unwrap_or(Value::Array(Vec::new()));

        let (id,): (Uuid,) = sqlx::query_as(
            r#"INSERT INTO ingest_jobs
               (id, tenant_id, status, source_system, content_type, total_count,
                file_manifest, processed_files, options, started_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, '[]'::jsonb, $8, NOW())
               RETURNING id"#,
        )
        .bind(job.id)
        .bind(job.tenant_id)
        .bind(job.status)
        .bind(job.source_system)
        .bind(&job.content_type)
        .bind(job.total_count)
        .bind(manifest)
        .bind(&job.options)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, StorageError> {
        #[derive(sqlx::FromRow)]
        struct JobRow {
            id: Uuid,
            tenant_id: Uuid,
            status: JobStatus,
            source_system: crate::storage::SourceSystem,
            content_type: String,
            total_count: i32,
            processed_count: i32,
            imported_count: i32,
            skipped_count: i32,
            failed_count: i32,
            file_manifest: Value,
            processed_files: Value,
            options: Value,
            started_at: Option<DateTime<Utc>>,
            completed_at: Option<DateTime<Utc>>,
            created_at: DateTime<Utc>,
            updated_at: DateTime<Utc>,
        }

        let row: Option<JobRow> = sqlx::query_as(
            r#"SELECT id, tenant_id, status, source_system, content_type, total_count,
                      processed_count, imported_count, skipped_count, failed_count,
                      file_manifest, processed_files, options,
                      started_at, completed_at, created_at, updated_at
               FROM ingest_jobs WHERE id = $1"#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| IngestJob {
            id: row.id,
            tenant_id: row.tenant_id,
            status: row.status,
            source_system: row.source_system,
            content_type: row.content_type,
            total_count: row.total_count,
            processed_count: row.processed_count,
            imported_count: row.imported_count,
            skipped_count: row.skipped_count,
            failed_count: row.failed_count,
            file_manifest: string_list(&row.file_manifest),
            processed_files: string_list(&row.processed_files),
            options: row.options,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }))
    }

    async fn update_job_progress(
        &self,
        job_id: Uuid,
        processed: i32,
        imported: i32,
        skipped: i32,
        failed: i32,
        processed_files: &[String],
    ) -> Result<(), StorageError> {
        let files = serde_json::to_value(processed_files).unwrap_or(Value::Array(Vec::new()));

        let result = sqlx::query(
            r#"UPDATE ingest_jobs
               SET processed_count = $1, imported_count = $2, skipped_count = $3,
                   failed_count = $4, processed_files = $5, updated_at = NOW()
               WHERE id = $6"#,
        )
        .bind(processed)
        .bind(imported)
        .bind(skipped)
        .bind(failed)
        .bind(files)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("ingest job"));
        }
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE ingest_jobs
             SET status = $1, completed_at = NOW(), updated_at = NOW()
             WHERE id = $2",
        )
        .bind(status)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("ingest job"));
        }
        Ok(())
    }

    async fn record_error(
        &self,
        job_id: Uuid,
        file_path: &str,
        kind: ErrorKind,
        message: &str,
        details: Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO ingest_errors (job_id, file_path, error_kind, message, details)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(job_id)
        .bind(file_path)
        .bind(kind.as_str())
        .bind(message)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remaining_files_for_job(
        &self,
        job_id: Uuid,
        all_files: &[String],
    ) -> Result<Vec<String>, StorageError> {
        let job = self
            .get_job(job_id)
            .await?
            .ok_or(StorageError::NotFound("ingest job"))?;

        let processed: std::collections::HashSet<&str> =
            job.processed_files.iter().map(String::as_str).collect();

        Ok(all_files
            .iter()
            .filter(|file| !processed.contains(file.as_str()))
            .cloned()
            .collect())
    }

    async fn update_source_status_with_failure(
        &self,
        source_id: i64,
        status: ProcessingStatus,
        failure_category: &str,
        failure_reason: &str,
        triage_metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), StorageError> {
        // JSONB concatenation keeps existing keys and overwrites same-named
        // ones, which is exactly the merge we want for triage annotations.
        let triage = triage_metadata.filter(|map| !map.is_empty());

        let result = match triage {
            Some(map) => {
                sqlx::query(
                    r#"UPDATE sources
                       SET processing_status = $1, failure_category = $2, failure_reason = $3,
                           ingestion_metadata = ingestion_metadata || $4, updated_at = NOW()
                       WHERE id = $5"#,
                )
                .bind(status)
                .bind(failure_category)
                .bind(failure_reason)
                .bind(Value::Object(map))
                .bind(source_id)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"UPDATE sources
                       SET processing_status = $1, failure_category = $2, failure_reason = $3,
                           updated_at = NOW()
                       WHERE id = $4"#,
                )
                .bind(status)
                .bind(failure_category)
                .bind(failure_reason)
                .bind(source_id)
                .execute(&self.pool)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound("source"));
        }
        Ok(())
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

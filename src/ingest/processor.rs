//! Batch ingest of `.eml` files.
//!
//! The [`BatchProcessor`] drives the whole ingest lifecycle: discover files,
//! create or resume the job row, fan the files out over a bounded worker
//! pool, run the per-file pipeline (parse, duplicate check, persist, extract
//! attachments, publish events), and aggregate outcomes under a single mutex.
//!
//! # Worker pool
//!
//! Exactly `concurrency` workers (default 4) pull file paths from a bounded
//! channel and push outcomes onto a results channel. The single results
//! consumer owns all aggregation: the in-memory report, the progress tracker,
//! `record_error`, and `update_job_progress`. Outcome ordering across files is
//! not guaranteed, only the totals are. The pool is joined before the
//! job-completed event goes out.
//!
//! # Failure isolation
//!
//! A failing file is recorded with its error kind and never stops the other
//! files. Cancellation marks the remaining in-flight files as skipped and the
//! tracker as cancelled.
//!
//! The processor is also the [`EmbeddedEmailHandler`]: when the extractor
//! finds a nested email it calls back here, which re-runs the duplicate-check
//! and create-source path with `source_system = embedded_email` and recurses
//! into the new email's own attachments.

use crate::config::resolve_tenant;
use crate::events::{
    AttachmentIngestedEvent, BaseEvent, EmailIngestedEvent, EventSink, JobCompletedEvent,
    JobProgressEvent, channels, publish_logged,
};
use crate::ingest::classifier::ClassifierPipeline;
use crate::ingest::error::{ErrorKind, IngestError};
use crate::ingest::extractor::{AttachmentExtractor, EmbeddedEmailHandler, ExtractionContext};
use crate::ingest::parser::{ParseError, ParsedEmail, ParserOptions, parse_email_file};
use crate::ingest::progress::ProgressTracker;
use crate::storage::{
    IngestStore, JobStatus, NewEmailSource, NewIngestJob, SourceSystem,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Caller-facing knobs for one ingest run.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Tenant string; empty or `"default"` maps to the default tenant.
    pub tenant: String,
    /// Worker count; 1 runs the pipeline sequentially.
    pub concurrency: usize,
    /// Parse and count without persisting or publishing anything.
    pub dry_run: bool,
    /// Resume an existing job, skipping its already-processed files.
    pub resume_job_id: Option<Uuid>,
    /// Labels carried into ingestion metadata and the ingested event.
    pub labels: Vec<String>,
    /// Body truncation limit in bytes, 0 for unlimited.
    pub max_body_size: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            concurrency: 4,
            dry_run: false,
            resume_job_id: None,
            labels: Vec::new(),
            max_body_size: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileError {
    pub file_path: String,
    pub message: String,
}

/// Final report of one `process` invocation.
#[derive(Debug)]
pub struct IngestReport {
    pub job_id: Uuid,
    pub success: bool,
    pub status: JobStatus,
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<FileError>,
    pub error_kind_counts: HashMap<ErrorKind, usize>,
    pub publish_failures: usize,
}

#[derive(Debug)]
enum Disposition {
    Imported,
    Skipped,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug)]
struct FileOutcome {
    file_path: String,
    disposition: Disposition,
    publish_failures: usize,
}

#[derive(Default)]
struct ReportState {
    processed: usize,
    imported: usize,
    skipped: usize,
    failed: usize,
    processed_files: Vec<String>,
    errors: Vec<FileError>,
    error_kind_counts: HashMap<ErrorKind, usize>,
    publish_failures: usize,
}

pub struct BatchProcessor {
    store: Arc<dyn IngestStore>,
    events: Arc<dyn EventSink>,
    extractor: AttachmentExtractor,
    options: IngestOptions,
    tenant_id: Uuid,
    parser_options: ParserOptions,
}

impl BatchProcessor {
    pub fn new(
        store: Arc<dyn IngestStore>,
        events: Arc<dyn EventSink>,
        options: IngestOptions,
    ) -> Result<Self, IngestError> {
        let tenant_id = resolve_tenant(&options.tenant)
            .map_err(|err| IngestError::Validation(format!("invalid tenant: {}", err)))?;

        let parser_options = ParserOptions {
            max_body_size: options.max_body_size,
            include_attachment_content: true,
            fallback_date: None,
        };

        let extractor = AttachmentExtractor::new(
            Arc::clone(&store),
            ClassifierPipeline::with_default_rules(),
            parser_options.clone(),
        );

        Ok(Self {
            store,
            events,
            extractor,
            options,
            tenant_id,
            parser_options,
        })
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// Ingest a single `.eml` file or a directory tree of them.
    pub async fn process(
        self: Arc<Self>,
        path: &Path,
        cancel: CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let files = discover_eml_files(path)?;
        log::info!("discovered {} .eml files under {}", files.len(), path.display());

        let (job_id, files, mut state) = self.prepare_job(files).await?;

        let tracker = Arc::new(ProgressTracker::new(files.len()));
        tracker.start();

        if files.is_empty() {
            log::info!("job {}: nothing to process", job_id);
        }

        let state = {
            state.processed_files.reserve(files.len());
            Arc::new(Mutex::new(state))
        };

        if self.options.concurrency <= 1 {
            for file in &files {
                let outcome = if cancel.is_cancelled() {
                    FileOutcome {
                        file_path: file.clone(),
                        disposition: Disposition::Skipped,
                        publish_failures: 0,
                    }
                } else {
                    tracker.set_current_file(file);
                    self.process_file(job_id, file).await
                };
                self.record_outcome(job_id, &state, &tracker, outcome).await;
            }
        } else {
            Self::run_worker_pool(&self, job_id, &files, &state, &tracker, &cancel).await;
        }

        self.finish_job(job_id, &state, &tracker, &cancel, files.len())
            .await
    }

    async fn prepare_job(
        &self,
        files: Vec<String>,
    ) -> Result<(Uuid, Vec<String>, ReportState), IngestError> {
        if let Some(job_id) = self.options.resume_job_id {
            let job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or_else(|| IngestError::Validation(format!("unknown job {}", job_id)))?;

            let remaining = self.store.remaining_files_for_job(job_id, &files).await?;
            log::info!(
                "job {}: resuming, {} of {} files remain",
                job_id,
                remaining.len(),
                files.len()
            );

            let state = ReportState {
                processed: job.processed_count as usize,
                imported: job.imported_count as usize,
                skipped: job.skipped_count as usize,
                failed: job.failed_count as usize,
                processed_files: job.processed_files,
                ..ReportState::default()
            };
            return Ok((job_id, remaining, state));
        }

        let job_id = Uuid::new_v4();
        if !self.options.dry_run {
            self.store
                .create_job(NewIngestJob {
                    id: job_id,
                    tenant_id: self.tenant_id,
                    status: JobStatus::InProgress,
                    source_system: SourceSystem::ManualEml,
                    content_type: "message/rfc822".to_string(),
                    total_count: files.len() as i32,
                    file_manifest: files.clone(),
                    options: json!({
                        "concurrency": self.options.concurrency,
                        "dry_run": self.options.dry_run,
                        "labels": self.options.labels,
                        "max_body_size": self.options.max_body_size,
                    }),
                })
                .await?;
            log::info!("job {}: created for {} files", job_id, files.len());
        } else {
            log::info!("job {}: dry run over {} files, nothing will persist", job_id, files.len());
        }

        Ok((job_id, files, ReportState::default()))
    }

    async fn run_worker_pool(
        this: &Arc<Self>,
        job_id: Uuid,
        files: &[String],
        state: &Arc<Mutex<ReportState>>,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
    ) {
        let capacity = files.len().max(1);
        let (file_tx, file_rx) = mpsc::channel::<String>(capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<FileOutcome>(capacity);
        let file_rx = Arc::new(Mutex::new(file_rx));

        for file in files {
            // Capacity equals the file count, so this never blocks.
            let _ = file_tx.send(file.clone()).await;
        }
        drop(file_tx);

        let mut handles = Vec::with_capacity(this.options.concurrency);
        for worker in 0..this.options.concurrency {
            let processor = Arc::clone(this);
            let file_rx = Arc::clone(&file_rx);
            let result_tx = result_tx.clone();
            let tracker = Arc::clone(tracker);
            let cancel = cancel.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    let file = {
                        let mut rx = file_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(file) = file else { break };

                    let outcome = if cancel.is_cancelled() {
                        FileOutcome {
                            file_path: file,
                            disposition: Disposition::Skipped,
                            publish_failures: 0,
                        }
                    } else {
                        tracker.set_current_file(&file);
                        processor.process_file(job_id, &file).await
                    };

                    if result_tx.send(outcome).await.is_err() {
                        break;
                    }
                }
                log::debug!("worker {} drained", worker);
            }));
        }
        drop(result_tx);

        while let Some(outcome) = result_rx.recv().await {
            this.record_outcome(job_id, state, tracker, outcome).await;
        }

        // Join before anything downstream sees the job as finished.
        for handle in handles {
            if let Err(err) = handle.await {
                log::error!("worker task panicked: {}", err);
            }
        }
    }

    /// Single aggregation point for file outcomes.
    async fn record_outcome(
        &self,
        job_id: Uuid,
        state: &Arc<Mutex<ReportState>>,
        tracker: &Arc<ProgressTracker>,
        outcome: FileOutcome,
    ) {
        let mut state = state.lock().await;
        state.processed += 1;
        state.processed_files.push(outcome.file_path.clone());
        state.publish_failures += outcome.publish_failures;

        match &outcome.disposition {
            Disposition::Imported => {
                state.imported += 1;
                tracker.record_imported(&outcome.file_path);
            }
            Disposition::Skipped => {
                state.skipped += 1;
                tracker.record_skipped(&outcome.file_path);
            }
            Disposition::Failed { kind, message } => {
                state.failed += 1;
                *state.error_kind_counts.entry(*kind).or_insert(0) += 1;
                state.errors.push(FileError {
                    file_path: outcome.file_path.clone(),
                    message: message.clone(),
                });
                tracker.record_failed(&outcome.file_path);
                log::error!("{}: {} ({})", outcome.file_path, message, kind);

                if !self.options.dry_run {
                    if let Err(err) = self
                        .store
                        .record_error(job_id, &outcome.file_path, *kind, message, json!({}))
                        .await
                    {
                        log::error!("failed to record error for {}: {}", outcome.file_path, err);
                    }
                }
            }
        }

        if !self.options.dry_run {
            if let Err(err) = self
                .store
                .update_job_progress(
                    job_id,
                    state.processed as i32,
                    state.imported as i32,
                    state.skipped as i32,
                    state.failed as i32,
                    &state.processed_files,
                )
                .await
            {
                log::error!("job {}: failed to update progress: {}", job_id, err);
            }

            let snapshot = tracker.snapshot();
            let event = JobProgressEvent {
                base: BaseEvent::new("ingest_job.progress"),
                job_id,
                total: snapshot.total,
                processed: snapshot.processed,
                imported: snapshot.imported,
                skipped: snapshot.skipped,
                failed: snapshot.failed,
                current_file: snapshot.current_file,
                elapsed_seconds: snapshot.elapsed_seconds,
                eta_seconds: snapshot.eta_seconds,
                status: snapshot.status.as_str().to_string(),
            };
            if !publish_logged(&*self.events, channels::INGEST_JOB_PROGRESS, &event).await {
                state.publish_failures += 1;
            }
        }
    }

    async fn finish_job(
        &self,
        job_id: Uuid,
        state: &Arc<Mutex<ReportState>>,
        tracker: &Arc<ProgressTracker>,
        cancel: &CancellationToken,
        total: usize,
    ) -> Result<IngestReport, IngestError> {
        let state = state.lock().await;

        let cancelled = cancel.is_cancelled();
        let success = state.failed == 0;
        let status = if cancelled {
            JobStatus::Cancelled
        } else if state.failed > 0 {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };

        let mut publish_failures = state.publish_failures;

        if !self.options.dry_run {
            self.store.complete_job(job_id, status).await?;

            let snapshot = tracker.snapshot();
            let started_at = snapshot.started_at.unwrap_or_else(Utc::now);
            let completed_at = Utc::now();
            let event = JobCompletedEvent {
                base: BaseEvent::new("ingest_job.completed"),
                job_id,
                tenant_id: self.tenant_id,
                source_system: SourceSystem::ManualEml.as_str().to_string(),
                total,
                imported: state.imported,
                skipped: state.skipped,
                failed: state.failed,
                started_at,
                completed_at,
                duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
                success,
                status: status.as_str().to_string(),
            };
            if !publish_logged(&*self.events, channels::INGEST_JOB_COMPLETED, &event).await {
                publish_failures += 1;
            }
        }

        if cancelled {
            tracker.cancel();
            log::warn!("job {}: cancelled", job_id);
        } else {
            tracker.complete(success);
        }

        log::info!(
            "job {}: done, {} imported, {} skipped, {} failed",
            job_id,
            state.imported,
            state.skipped,
            state.failed
        );

        Ok(IngestReport {
            job_id,
            success,
            status,
            total,
            imported: state.imported,
            skipped: state.skipped,
            failed: state.failed,
            errors: state.errors.clone(),
            error_kind_counts: state.error_kind_counts.clone(),
            publish_failures,
        })
    }

    async fn process_file(&self, job_id: Uuid, path: &str) -> FileOutcome {
        match self.ingest_file(job_id, path).await {
            Ok((disposition, publish_failures)) => FileOutcome {
                file_path: path.to_string(),
                disposition,
                publish_failures,
            },
            Err(err) => FileOutcome {
                file_path: path.to_string(),
                disposition: Disposition::Failed {
                    kind: err.kind(),
                    message: err.to_string(),
                },
                publish_failures: 0,
            },
        }
    }

    async fn ingest_file(
        &self,
        job_id: Uuid,
        path: &str,
    ) -> Result<(Disposition, usize), IngestError> {
        let email = parse_email_file(Path::new(path), &self.parser_options).map_err(|err| {
            match err {
                ParseError::Io { path, source } => IngestError::Io { path, source },
                ParseError::Mime(source) => IngestError::Parse {
                    path: path.to_string(),
                    message: source.to_string(),
                },
            }
        })?;

        for warning in &email.warnings {
            log::debug!("{}: {}", path, warning);
        }

        let duplicate = self
            .store
            .check_duplicate(self.tenant_id, &email.message_id, &email.content_hash)
            .await?;
        if duplicate.is_duplicate {
            log::info!(
                "{}: duplicate by {} (existing source {:?}), skipping",
                path,
                duplicate.reason.map(|r| r.as_str()).unwrap_or(""),
                duplicate.existing_id
            );
            return Ok((Disposition::Skipped, 0));
        }

        if self.options.dry_run {
            return Ok((Disposition::Imported, 0));
        }

        let source = self.email_source(&email, SourceSystem::ManualEml, None, 0);
        let created = self.store.create_source(source).await?;

        let seen = vec![email.message_id.clone()];
        let ctx = ExtractionContext {
            tenant_id: self.tenant_id,
            depth: 0,
            seen_message_ids: &seen,
            handler: self,
        };
        let extraction = self.extractor.extract(&email, created.id, &ctx).await;
        if extraction.errors > 0 {
            log::warn!(
                "{}: {} of {} attachments failed extraction",
                path,
                extraction.errors,
                extraction.total
            );
        }

        let mut publish_failures = 0;

        let event = EmailIngestedEvent {
            base: BaseEvent::new("manual_email.ingested"),
            source_id: created.id,
            tenant_id: self.tenant_id,
            message_id: email.message_id.clone(),
            job_id,
            from: email.from.email.clone(),
            to: email.to.iter().map(|a| a.email.clone()).collect(),
            cc: email.cc.iter().map(|a| a.email.clone()).collect(),
            date: email.date,
            date_fallback: email.date_fallback,
            has_attachments: email.has_attachments(),
            attachment_count: email.attachments.len(),
            content_hash: email.content_hash.clone(),
            source_system: SourceSystem::ManualEml.as_str().to_string(),
            file_path: path.to_string(),
            labels: self.options.labels.clone(),
        };
        if !publish_logged(&*self.events, channels::MANUAL_EMAIL_INGESTED, &event).await {
            publish_failures += 1;
        }

        for stored in &extraction.stored {
            let event = AttachmentIngestedEvent {
                base: BaseEvent::new("attachment.ingested"),
                source_id: stored.child_source_id,
                parent_source_id: created.id,
                tenant_id: self.tenant_id,
                filename: stored.filename.clone(),
                mime_type: stored.mime_type.clone(),
                size_bytes: stored.size_bytes,
                is_embedded_email: stored.is_embedded_email,
            };
            if !publish_logged(&*self.events, channels::ATTACHMENT_INGESTED, &event).await {
                publish_failures += 1;
            }
        }

        Ok((Disposition::Imported, publish_failures))
    }

    fn email_source(
        &self,
        email: &ParsedEmail,
        source_system: SourceSystem,
        parent_source_id: Option<i64>,
        depth: usize,
    ) -> NewEmailSource {
        let mut metadata = json!({
            "file_path": email.file_path,
            "message_id_synthetic": email.message_id_synthetic,
            "from": email.from.email,
            "to": email.to.iter().map(|a| a.email.clone()).collect::<Vec<_>>(),
            "cc": email.cc.iter().map(|a| a.email.clone()).collect::<Vec<_>>(),
            "subject": email.subject,
            "labels": self.options.labels,
            "headers": email.headers,
        });
        if let Some(parent) = parent_source_id {
            metadata["parent_source_id"] = json!(parent);
            metadata["depth"] = json!(depth);
        }

        // Only the plain-text body is stored, which keeps row sizes bounded
        // even for emails dragging large HTML or raw payloads.
        NewEmailSource {
            tenant_id: self.tenant_id,
            source_system,
            external_id: email.message_id.clone(),
            content_hash: email.content_hash.clone(),
            raw_content: email.body_text.clone(),
            content_type: "text/plain".to_string(),
            content_size: email.body_text.len() as i64,
            ingestion_metadata: metadata,
            source_timestamp: Some(email.date),
            participant_emails: email.all_participant_emails(),
            content_id: None,
        }
    }
}

#[async_trait]
impl EmbeddedEmailHandler for BatchProcessor {
    async fn ingest_embedded(
        &self,
        email: ParsedEmail,
        parent_source_id: i64,
        tenant_id: Uuid,
        depth: usize,
        seen_message_ids: Vec<String>,
    ) -> Result<i64, IngestError> {
        let duplicate = self
            .store
            .check_duplicate(tenant_id, &email.message_id, &email.content_hash)
            .await?;
        if duplicate.is_duplicate {
            if let Some(existing) = duplicate.existing_id {
                log::debug!(
                    "embedded email {} already ingested as source {}",
                    email.message_id,
                    existing
                );
                return Ok(existing);
            }
        }

        let source = self.email_source(&email, SourceSystem::EmbeddedEmail, Some(parent_source_id), depth);
        let created = self.store.create_source(source).await?;
        log::info!(
            "embedded email {} ingested as source {} at depth {}",
            email.message_id,
            created.id,
            depth
        );

        let ctx = ExtractionContext {
            tenant_id,
            depth,
            seen_message_ids: &seen_message_ids,
            handler: self,
        };
        let extraction = self.extractor.extract(&email, created.id, &ctx).await;
        if extraction.errors > 0 {
            log::warn!(
                "embedded email {}: {} attachments failed extraction",
                email.message_id,
                extraction.errors
            );
        }

        Ok(created.id)
    }
}

fn has_eml_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("eml"))
        .unwrap_or(false)
}

/// Discover the `.eml` files under `path` as absolute paths, sorted for
/// deterministic ordering. Non-`.eml` files inside a directory are ignored; a
/// direct file target must itself be an `.eml`.
fn discover_eml_files(path: &Path) -> Result<Vec<String>, IngestError> {
    let metadata = std::fs::metadata(path).map_err(|source| IngestError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let absolutize = |p: &Path| -> Result<String, IngestError> {
        std::fs::canonicalize(p)
            .map(|abs| abs.display().to_string())
            .map_err(|source| IngestError::Io {
                path: p.display().to_string(),
                source,
            })
    };

    if metadata.is_file() {
        if !has_eml_extension(path) {
            return Err(IngestError::Validation(format!(
                "{} is not an .eml file",
                path.display()
            )));
        }
        return Ok(vec![absolutize(path)?]);
    }

    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(path) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("skipping unreadable entry under {}: {}", path.display(), err);
                continue;
            }
        };
        if entry.file_type().is_file() && has_eml_extension(entry.path()) {
            files.push(absolutize(entry.path())?);
        }
    }
    files.sort();
    Ok(files)
}

//! Shared in-memory fakes for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use penfold::events::{EventSink, PublishError};
use penfold::ingest::ErrorKind;
use penfold::resolve::{
    CompletionProvider, CompletionRequest, CompletionResponse, DecisionRecord, DirectoryError,
    EntityDirectory, EntityMatch, EntityType, LlmCallRecord, LlmError, MentionPattern, NewTrace,
    ProjectAffinity, ResolutionTracer, TraceCounters, TraceLevel,
};
use penfold::resolve::trace::TraceError;
use penfold::storage::{
    CreatedSource, DuplicateCheck, DuplicateReason, IngestJob, IngestStore, JobStatus,
    NewAttachmentLink, NewEmailSource, NewIngestJob, ProcessingStatus, StorageError,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredSource {
    pub id: i64,
    pub source: NewEmailSource,
}

#[derive(Debug, Clone)]
pub struct StoredLink {
    pub id: i64,
    pub link: NewAttachmentLink,
}

#[derive(Debug, Clone)]
pub struct RecordedError {
    pub job_id: Uuid,
    pub file_path: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job: NewIngestJob,
    pub status: JobStatus,
    pub processed: i32,
    pub imported: i32,
    pub skipped: i32,
    pub failed: i32,
    pub processed_files: Vec<String>,
}

/// Repository fake backed by vectors.
#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicI64,
    pub sources: Mutex<Vec<StoredSource>>,
    pub links: Mutex<Vec<StoredLink>>,
    pub jobs: Mutex<HashMap<Uuid, JobEntry>>,
    pub errors: Mutex<Vec<RecordedError>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn sources_with_system(&self, system: penfold::storage::SourceSystem) -> Vec<StoredSource> {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.source.source_system == system)
            .cloned()
            .collect()
    }

    pub fn source_by_external_id(&self, external_id: &str) -> Option<StoredSource> {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.source.external_id == external_id)
            .cloned()
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    async fn create_source(&self, source: NewEmailSource) -> Result<CreatedSource, StorageError> {
        let id = self.allocate_id();
        self.sources.lock().unwrap().push(StoredSource {
            id,
            source,
        });
        Ok(CreatedSource {
            id,
            created_at: Utc::now(),
        })
    }

    async fn exists_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<bool, StorageError> {
        Ok(self.sources.lock().unwrap().iter().any(|s| {
            s.source.tenant_id == tenant_id && s.source.external_id == external_id
        }))
    }

    async fn exists_by_content_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> Result<bool, StorageError> {
        Ok(self.sources.lock().unwrap().iter().any(|s| {
            s.source.tenant_id == tenant_id && s.source.content_hash == content_hash
        }))
    }

    async fn check_duplicate(
        &self,
        tenant_id: Uuid,
        external_id: &str,
        content_hash: &str,
    ) -> Result<DuplicateCheck, StorageError> {
        let sources = self.sources.lock().unwrap();
        if let Some(existing) = sources.iter().find(|s| {
            s.source.tenant_id == tenant_id && s.source.external_id == external_id
        }) {
            return Ok(DuplicateCheck {
                is_duplicate: true,
                existing_id: Some(existing.id),
                reason: Some(DuplicateReason::MessageId),
            });
        }
        if let Some(existing) = sources.iter().find(|s| {
            s.source.tenant_id == tenant_id && s.source.content_hash == content_hash
        }) {
            return Ok(DuplicateCheck {
                is_duplicate: true,
                existing_id: Some(existing.id),
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
        let source_id = self.allocate_id();
        let link_id = self.allocate_id();
        link.child_source_id = Some(source_id);
        self.sources.lock().unwrap().push(StoredSource {
            id: source_id,
            source,
        });
        self.links.lock().unwrap().push(StoredLink { id: link_id, link });
        Ok((source_id, link_id))
    }

    async fn create_attachment_link_only(
        &self,
        link: NewAttachmentLink,
    ) -> Result<i64, StorageError> {
        let link_id = self.allocate_id();
        self.links.lock().unwrap().push(StoredLink { id: link_id, link });
        Ok(link_id)
    }

    async fn find_stored_attachment_by_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<i64>, StorageError> {
        Ok(self
            .links
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.link.content_hash == content_hash && l.link.child_source_id.is_some())
            .and_then(|l| l.link.child_source_id))
    }

    async fn create_job(&self, job: NewIngestJob) -> Result<Uuid, StorageError> {
        let id = job.id;
        self.jobs.lock().unwrap().insert(
            id,
            JobEntry {
                status: job.status,
                job,
                processed: 0,
                imported: 0,
                skipped: 0,
                failed: 0,
                processed_files: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, StorageError> {
        Ok(self.jobs.lock().unwrap().get(&job_id).map(|entry| IngestJob {
            id: entry.job.id,
            tenant_id: entry.job.tenant_id,
            status: entry.status,
            source_system: entry.job.source_system,
            content_type: entry.job.content_type.clone(),
            total_count: entry.job.total_count,
            processed_count: entry.processed,
            imported_count: entry.imported,
            skipped_count: entry.skipped,
            failed_count: entry.failed,
            file_manifest: entry.job.file_manifest.clone(),
            processed_files: entry.processed_files.clone(),
            options: entry.job.options.clone(),
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
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
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs.get_mut(&job_id).ok_or(StorageError::NotFound("ingest job"))?;
        entry.processed = processed;
        entry.imported = imported;
        entry.skipped = skipped;
        entry.failed = failed;
        entry.processed_files = processed_files.to_vec();
        Ok(())
    }

    async fn complete_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), StorageError> {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs.get_mut(&job_id).ok_or(StorageError::NotFound("ingest job"))?;
        entry.status = status;
        Ok(())
    }

    async fn record_error(
        &self,
        job_id: Uuid,
        file_path: &str,
        kind: ErrorKind,
        message: &str,
        _details: Value,
    ) -> Result<(), StorageError> {
        self.errors.lock().unwrap().push(RecordedError {
            job_id,
            file_path: file_path.to_string(),
            kind,
            message: message.to_string(),
        });
        Ok(())
    }

    async fn remaining_files_for_job(
        &self,
        job_id: Uuid,
        all_files: &[String],
    ) -> Result<Vec<String>, StorageError> {
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs.get(&job_id).ok_or(StorageError::NotFound("ingest job"))?;
        Ok(all_files
            .iter()
            .filter(|file| !entry.processed_files.contains(file))
            .cloned()
            .collect())
    }

    async fn update_source_status_with_failure(
        &self,
        source_id: i64,
        _status: ProcessingStatus,
        _failure_category: &str,
        _failure_reason: &str,
        triage_metadata: Option<serde_json::Map<String, Value>>,
    ) -> Result<(), StorageError> {
        let mut sources = self.sources.lock().unwrap();
        let stored = sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or(StorageError::NotFound("source"))?;
        if let Some(map) = triage_metadata.filter(|m| !m.is_empty()) {
            if let Some(existing) = stored.source.ingestion_metadata.as_object_mut() {
                for (key, value) in map {
                    existing.insert(key, value);
                }
            }
        }
        Ok(())
    }
}

/// Event sink that remembers everything published.
#[derive(Default)]
pub struct CollectingSink {
    pub published: Mutex<Vec<(String, Value)>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_channel(&self, channel: &str) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), PublishError> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload));
        Ok(())
    }
}

/// Completion provider replaying a queue of scripted responses.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Unavailable("script exhausted".to_string()))?;
        Ok(CompletionResponse {
            content,
            finish_reason: Some("stop".to_string()),
            prompt_tokens: 10,
            completion_tokens: 10,
        })
    }
}

/// Entity directory with a fixed candidate table keyed by mention text.
#[derive(Default)]
pub struct StaticDirectory {
    pub entities: HashMap<String, Vec<EntityMatch>>,
    pub prior_links: HashMap<i64, i64>,
}

impl StaticDirectory {
    pub fn with_entity(mut self, text: &str, id: i64, name: &str, confidence: f64) -> Self {
        self.entities.entry(text.to_string()).or_default().push(EntityMatch {
            entity_id: id,
            entity_name: name.to_string(),
            confidence,
        });
        self
    }
}

#[async_trait]
impl EntityDirectory for StaticDirectory {
    async fn lookup(
        &self,
        _tenant_id: Uuid,
        _entity_type: EntityType,
        text: &str,
    ) -> Result<Vec<EntityMatch>, DirectoryError> {
        Ok(self.entities.get(text).cloned().unwrap_or_default())
    }

    async fn prior_link_count(
        &self,
        _tenant_id: Uuid,
        entity_id: i64,
    ) -> Result<i64, DirectoryError> {
        Ok(self.prior_links.get(&entity_id).copied().unwrap_or(0))
    }

    async fn project_affinity(
        &self,
        _tenant_id: Uuid,
        _entity_id: i64,
        _project_id: i64,
    ) -> Result<Option<ProjectAffinity>, DirectoryError> {
        Ok(None)
    }

    async fn mention_pattern(
        &self,
        _tenant_id: Uuid,
        _text: &str,
        _entity_type: EntityType,
    ) -> Result<Option<MentionPattern>, DirectoryError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Started(i32),
    Completed(i32),
    Failed(i32),
    Skipped(i32),
}

/// Tracer that records everything in memory at a configurable level.
pub struct RecordingTracer {
    pub level: TraceLevel,
    pub stage_events: Mutex<Vec<StageEvent>>,
    pub decisions: Mutex<Vec<DecisionRecord>>,
    pub llm_calls: Mutex<Vec<(i32, LlmCallRecord)>>,
    pub completed: Mutex<Option<TraceCounters>>,
    pub failed: Mutex<Option<String>>,
    pub comparisons: Mutex<Vec<(String, Vec<String>)>>,
    pub comparison_decisions: Mutex<Vec<(String, String, Value)>>,
}

impl RecordingTracer {
    pub fn new(level: TraceLevel) -> Self {
        Self {
            level,
            stage_events: Mutex::new(Vec::new()),
            decisions: Mutex::new(Vec::new()),
            llm_calls: Mutex::new(Vec::new()),
            completed: Mutex::new(None),
            failed: Mutex::new(None),
            comparisons: Mutex::new(Vec::new()),
            comparison_decisions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ResolutionTracer for RecordingTracer {
    fn level(&self) -> TraceLevel {
        self.level
    }

    async fn start_trace(&self, _trace: NewTrace) -> Result<String, TraceError> {
        Ok(penfold::resolve::trace::new_trace_id())
    }

    async fn start_stage(&self, _trace_id: &str, stage: i32, _name: &str) -> Result<(), TraceError> {
        self.stage_events.lock().unwrap().push(StageEvent::Started(stage));
        Ok(())
    }

    async fn complete_stage(
        &self,
        _trace_id: &str,
        stage: i32,
        _duration_ms: i64,
        _input: Option<Value>,
        _output: Option<Value>,
    ) -> Result<(), TraceError> {
        self.stage_events.lock().unwrap().push(StageEvent::Completed(stage));
        Ok(())
    }

    async fn fail_stage(
        &self,
        _trace_id: &str,
        stage: i32,
        _duration_ms: i64,
        _error: &str,
    ) -> Result<(), TraceError> {
        self.stage_events.lock().unwrap().push(StageEvent::Failed(stage));
        Ok(())
    }

    async fn skip_stage(
        &self,
        _trace_id: &str,
        stage: i32,
        _name: &str,
        _reason: &str,
    ) -> Result<(), TraceError> {
        self.stage_events.lock().unwrap().push(StageEvent::Skipped(stage));
        Ok(())
    }

    async fn record_llm_call(
        &self,
        _trace_id: &str,
        stage: i32,
        call: &LlmCallRecord,
    ) -> Result<(), TraceError> {
        if self.level.keeps_payloads() {
            self.llm_calls.lock().unwrap().push((stage, call.clone()));
        }
        Ok(())
    }

    async fn record_decision(
        &self,
        _trace_id: &str,
        decision: &DecisionRecord,
    ) -> Result<(), TraceError> {
        if self.level.keeps_decisions() {
            self.decisions.lock().unwrap().push(decision.clone());
        }
        Ok(())
    }

    async fn complete_trace(
        &self,
        _trace_id: &str,
        counters: TraceCounters,
    ) -> Result<(), TraceError> {
        *self.completed.lock().unwrap() = Some(counters);
        Ok(())
    }

    async fn fail_trace(&self, _trace_id: &str, error: &str) -> Result<(), TraceError> {
        *self.failed.lock().unwrap() = Some(error.to_string());
        Ok(())
    }

    async fn start_comparison(
        &self,
        _tenant_id: Uuid,
        _content_id: i64,
        models: &[String],
    ) -> Result<String, TraceError> {
        let comparison_id = penfold::resolve::trace::new_comparison_id();
        self.comparisons
            .lock()
            .unwrap()
            .push((comparison_id.clone(), models.to_vec()));
        Ok(comparison_id)
    }

    async fn record_comparison_decision(
        &self,
        comparison_id: &str,
        model: &str,
        decision: Value,
    ) -> Result<(), TraceError> {
        self.comparison_decisions.lock().unwrap().push((
            comparison_id.to_string(),
            model.to_string(),
            decision,
        ));
        Ok(())
    }
}

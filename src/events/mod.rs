//! Ingest lifecycle events.
//!
//! Events are JSON payloads published to named channels. The Postgres
//! implementation rides the shared pool via `pg_notify`, so downstream
//! consumers LISTEN on the channel names below. Publishing is advisory:
//! failures are logged and counted by the caller, never propagated into the
//! ingest outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

pub mod channels {
    pub const MANUAL_EMAIL_INGESTED: &str = "events.manual_email.ingested";
    pub const INGEST_JOB_PROGRESS: &str = "events.ingest_job.progress";
    pub const INGEST_JOB_COMPLETED: &str = "events.ingest_job.completed";
    pub const ATTACHMENT_INGESTED: &str = "events.attachment.ingested";
}

const EVENT_SOURCE: &str = "penfold-ingest";
const EVENT_VERSION: &str = "1.0";

/// Envelope carried by every event.
#[derive(Debug, Clone, Serialize)]
pub struct BaseEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source: &'static str,
    pub version: &'static str,
}

impl BaseEvent {
    pub fn new(event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            source: EVENT_SOURCE,
            version: EVENT_VERSION,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailIngestedEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub source_id: i64,
    pub tenant_id: Uuid,
    pub message_id: String,
    pub job_id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub date: DateTime<Utc>,
    pub date_fallback: bool,
    pub has_attachments: bool,
    pub attachment_count: usize,
    pub content_hash: String,
    pub source_system: String,
    pub file_path: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgressEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub job_id: Uuid,
    pub total: usize,
    pub processed: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub current_file: String,
    pub elapsed_seconds: f64,
    pub eta_seconds: Option<f64>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobCompletedEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub source_system: String,
    pub total: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub success: bool,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentIngestedEvent {
    #[serde(flatten)]
    pub base: BaseEvent,
    pub source_id: i64,
    pub parent_source_id: i64,
    pub tenant_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_embedded_email: bool,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to publish event: {0}")]
    Transport(#[from] sqlx::Error),
}

/// Pub/sub seam. Implementations must be cheap to share across workers.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), PublishError>;
}

/// Publishes events over Postgres NOTIFY on the shared pool.
#[derive(Clone)]
pub struct PgEventPublisher {
    pool: PgPool,
}

impl PgEventPublisher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for PgEventPublisher {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), PublishError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Publish an event, swallowing failures. Returns false when the publish
/// failed so callers can count it.
pub async fn publish_logged<E: Serialize>(
    sink: &dyn EventSink,
    channel: &str,
    event: &E,
) -> bool {
    let payload = match serde_json::to_value(event) {
        Ok(payload) => payload,
        Err(err) => {
            log::warn!("failed to serialize event for {}: {}", channel, err);
            return false;
        }
    };

    match sink.publish(channel, payload).await {
        Ok(()) => true,
        Err(err) => {
            log::warn!("failed to publish event to {}: {}", channel, err);
            false
        }
    }
}

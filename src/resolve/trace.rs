//! Audit tracing for resolution runs.
//!
//! Every resolver invocation opens a trace; stages, LLM calls, and decisions
//! hang off it. The trace level gates what actually reaches storage:
//!
//! - `minimal`: trace and stage shells with outcomes and counters only.
//! - `standard`: plus decisions.
//! - `full` / `debug`: plus LLM calls and stage input/output payloads.
//!
//! The tracer is stateless between calls; each record method branches on the
//! level itself and never materializes payloads it will not keep.

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use sqlx::PgPool;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    Minimal,
    Standard,
    Full,
    Debug,
}

impl TraceLevel {
    /// Level from `RESOLVER_TRACE_LEVEL`, defaulting to `standard`.
    pub fn from_env() -> Self {
        std::env::var("RESOLVER_TRACE_LEVEL")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(TraceLevel::Standard)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Minimal => "minimal",
            TraceLevel::Standard => "standard",
            TraceLevel::Full => "full",
            TraceLevel::Debug => "debug",
        }
    }

    pub fn keeps_decisions(&self) -> bool {
        *self >= TraceLevel::Standard
    }

    pub fn keeps_payloads(&self) -> bool {
        *self >= TraceLevel::Full
    }
}

impl FromStr for TraceLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "minimal" => Ok(TraceLevel::Minimal),
            "standard" => Ok(TraceLevel::Standard),
            "full" => Ok(TraceLevel::Full),
            "debug" => Ok(TraceLevel::Debug),
            other => Err(format!("unknown trace level `{}`", other)),
        }
    }
}

pub fn new_trace_id() -> String {
    format!("trace_{:016x}", rand::thread_rng().r#gen::<u64>())
}

pub fn new_comparison_id() -> String {
    format!("comp_{:016x}", rand::thread_rng().r#gen::<u64>())
}

#[derive(Debug, Clone)]
pub struct NewTrace {
    pub tenant_id: Uuid,
    pub content_id: i64,
    pub model: String,
    pub config_snapshot: Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceCounters {
    pub mentions_found: i32,
    pub auto_resolved: i32,
    pub queued_for_review: i32,
    pub new_entities_suggested: i32,
}

/// A single prompt/response exchange with token accounting.
#[derive(Debug, Clone)]
pub struct LlmCallRecord {
    pub prompt: String,
    pub response: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionType {
    Resolve,
    QueueReview,
    SuggestNewEntity,
    SkipVerification,
}

impl DecisionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionType::Resolve => "resolve",
            DecisionType::QueueReview => "queue_review",
            DecisionType::SuggestNewEntity => "suggest_new_entity",
            DecisionType::SkipVerification => "skip_verification",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionRecord {
    pub decision_type: DecisionType,
    pub mention_text: String,
    pub chosen: Option<Value>,
    pub alternatives: Value,
    pub confidence: f64,
    pub reasoning: String,
    pub factors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Tracer surface used by the resolver. Implementations decide how much of
/// each record to keep based on their level.
#[async_trait]
pub trait ResolutionTracer: Send + Sync {
    fn level(&self) -> TraceLevel;

    /// Open a trace and return its id (`trace_{16 hex}`).
    async fn start_trace(&self, trace: NewTrace) -> Result<String, TraceError>;

    async fn start_stage(&self, trace_id: &str, stage: i32, name: &str) -> Result<(), TraceError>;

    async fn complete_stage(
        &self,
        trace_id: &str,
        stage: i32,
        duration_ms: i64,
        input: Option<Value>,
        output: Option<Value>,
    ) -> Result<(), TraceError>;

    async fn fail_stage(
        &self,
        trace_id: &str,
        stage: i32,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), TraceError>;

    async fn skip_stage(&self, trace_id: &str, stage: i32, name: &str, reason: &str)
    -> Result<(), TraceError>;

    async fn record_llm_call(
        &self,
        trace_id: &str,
        stage: i32,
        call: &LlmCallRecord,
    ) -> Result<(), TraceError>;

    async fn record_decision(
        &self,
        trace_id: &str,
        decision: &DecisionRecord,
    ) -> Result<(), TraceError>;

    async fn complete_trace(
        &self,
        trace_id: &str,
        counters: TraceCounters,
    ) -> Result<(), TraceError>;

    async fn fail_trace(&self, trace_id: &str, error: &str) -> Result<(), TraceError>;

    /// Open a multi-model comparison shell and return its id
    /// (`comp_{16 hex}`).
    async fn start_comparison(
        &self,
        tenant_id: Uuid,
        content_id: i64,
        models: &[String],
    ) -> Result<String, TraceError>;

    /// Record one model's decision under a comparison shell.
    async fn record_comparison_decision(
        &self,
        comparison_id: &str,
        model: &str,
        decision: Value,
    ) -> Result<(), TraceError>;
}

/// Postgres tracer. Stage rows are inserted on start and mutated in place as
/// the stage transitions; durations land in integer milliseconds.
pub struct PgResolutionTracer {
    pool: PgPool,
    level: TraceLevel,
}

impl PgResolutionTracer {
    pub fn new(pool: PgPool, level: TraceLevel) -> Self {
        Self { pool, level }
    }
}

#[async_trait]
impl ResolutionTracer for PgResolutionTracer {
    fn level(&self) -> TraceLevel {
        self.level
    }

    async fn start_trace(&self, trace: NewTrace) -> Result<String, TraceError> {
        let trace_id = new_trace_id();
        sqlx::query(
            r#"INSERT INTO resolution_traces
               (trace_id, tenant_id, content_id, status, model, trace_level, config_snapshot)
               VALUES ($1, $2, $3, 'in_progress', $4, $5, $6)"#,
        )
        .bind(&trace_id)
        .bind(trace.tenant_id)
        .bind(trace.content_id)
        .bind(&trace.model)
        .bind(self.level.as_str())
        .bind(&trace.config_snapshot)
        .execute(&self.pool)
        .await?;
        Ok(trace_id)
    }

    async fn start_stage(&self, trace_id: &str, stage: i32, name: &str) -> Result<(), TraceError> {
        sqlx::query(
            r#"INSERT INTO resolution_stages (trace_id, stage_number, name, status, started_at)
               VALUES ($1, $2, $3, 'started', NOW())
               ON CONFLICT (trace_id, stage_number)
               DO UPDATE SET status = 'started', started_at = NOW()"#,
        )
        .bind(trace_id)
        .bind(stage)
        .bind(name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_stage(
        &self,
        trace_id: &str,
        stage: i32,
        duration_ms: i64,
        input: Option<Value>,
        output: Option<Value>,
    ) -> Result<(), TraceError> {
        let (input, output) = if self.level.keeps_payloads() {
            (input, output)
        } else {
            (None, None)
        };

        sqlx::query(
            r#"UPDATE resolution_stages
               SET status = 'completed', duration_ms = $1, input = $2, output = $3,
                   completed_at = NOW()
               WHERE trace_id = $4 AND stage_number = $5"#,
        )
        .bind(duration_ms)
        .bind(input)
        .bind(output)
        .bind(trace_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_stage(
        &self,
        trace_id: &str,
        stage: i32,
        duration_ms: i64,
        error: &str,
    ) -> Result<(), TraceError> {
        sqlx::query(
            r#"UPDATE resolution_stages
               SET status = 'failed', duration_ms = $1, error = $2, completed_at = NOW()
               WHERE trace_id = $3 AND stage_number = $4"#,
        )
        .bind(duration_ms)
        .bind(error)
        .bind(trace_id)
        .bind(stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn skip_stage(
        &self,
        trace_id: &str,
        stage: i32,
        name: &str,
        reason: &str,
    ) -> Result<(), TraceError> {
        sqlx::query(
            r#"INSERT INTO resolution_stages
               (trace_id, stage_number, name, status, error, started_at, completed_at)
               VALUES ($1, $2, $3, 'skipped', $4, NOW(), NOW())
               ON CONFLICT (trace_id, stage_number)
               DO UPDATE SET status = 'skipped', error = $4, completed_at = NOW()"#,
        )
        .bind(trace_id)
        .bind(stage)
        .bind(name)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_llm_call(
        &self,
        trace_id: &str,
        stage: i32,
        call: &LlmCallRecord,
    ) -> Result<(), TraceError> {
        if !self.level.keeps_payloads() {
            return Ok(());
        }

        sqlx::query(
            r#"INSERT INTO resolution_llm_calls
               (trace_id, stage_number, prompt, response, prompt_tokens, completion_tokens)
               VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(trace_id)
        .bind(stage)
        .bind(&call.prompt)
        .bind(&call.response)
        .bind(call.prompt_tokens)
        .bind(call.completion_tokens)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_decision(
        &self,
        trace_id: &str,
        decision: &DecisionRecord,
    ) -> Result<(), TraceError> {
        if !self.level.keeps_decisions() {
            return Ok(());
        }

        sqlx::query(
            r#"INSERT INTO resolution_decisions
               (trace_id, decision_type, mention_text, chosen, alternatives, confidence,
                reasoning, factors)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(trace_id)
        .bind(decision.decision_type.as_str())
        .bind(&decision.mention_text)
        .bind(&decision.chosen)
        .bind(&decision.alternatives)
        .bind(decision.confidence)
        .bind(&decision.reasoning)
        .bind(serde_json::to_value(&decision.factors).unwrap_or(Value::Array(Vec::new())))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_trace(
        &self,
        trace_id: &str,
        counters: TraceCounters,
    ) -> Result<(), TraceError> {
        sqlx::query(
            r#"UPDATE resolution_traces
               SET status = 'completed', mentions_found = $1, auto_resolved = $2,
                   queued_for_review = $3, new_entities_suggested = $4, completed_at = NOW()
               WHERE trace_id = $5"#,
        )
        .bind(counters.mentions_found)
        .bind(counters.auto_resolved)
        .bind(counters.queued_for_review)
        .bind(counters.new_entities_suggested)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_trace(&self, trace_id: &str, error: &str) -> Result<(), TraceError> {
        sqlx::query(
            r#"UPDATE resolution_traces
               SET status = 'failed', error = $1, completed_at = NOW()
               WHERE trace_id = $2"#,
        )
        .bind(error)
        .bind(trace_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn start_comparison(
        &self,
        tenant_id: Uuid,
        content_id: i64,
        models: &[String],
    ) -> Result<String, TraceError> {
        let comparison_id = new_comparison_id();
        sqlx::query(
            r#"INSERT INTO resolution_comparisons (comparison_id, tenant_id, content_id, models)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(&comparison_id)
        .bind(tenant_id)
        .bind(content_id)
        .bind(serde_json::to_value(models).unwrap_or(Value::Array(Vec::new())))
        .execute(&self.pool)
        .await?;
        Ok(comparison_id)
    }

    async fn record_comparison_decision(
        &self,
        comparison_id: &str,
        model: &str,
        decision: Value,
    ) -> Result<(), TraceError> {
        sqlx::query(
            r#"INSERT INTO resolution_comparison_decisions (comparison_id, model, decision)
               VALUES ($1, $2, $3)"#,
        )
        .bind(comparison_id)
        .bind(model)
        .bind(decision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Four-stage mention resolution.
//!
//! `process_batch` runs understanding, cross-mention reasoning, candidate
//! gathering, matching, and confidence-gated verification as a strictly
//! sequential pipeline. Every state change lands in the audit trace; a stage
//! failure fails the trace and surfaces in the returned [`BatchResult`],
//! whose trace id always points at the record of what happened. An optional
//! heartbeat callback fires between stages so external orchestrators can
//! observe liveness without the resolver knowing about them.

use crate::config::env_f64;
use crate::resolve::candidates::CandidateGatherer;
use crate::resolve::error::ResolveError;
use crate::resolve::mention::{
    BatchResult, CandidateSet, Decision, ExtractedMention, MentionBatch, Resolution,
    ResolvedEntity,
};
use crate::resolve::stages::{RawEntityRef, RawResolution, StageExecutor, StageRun, Verdict};
use crate::resolve::trace::{
    DecisionRecord, DecisionType, LlmCallRecord, NewTrace, ResolutionTracer, TraceCounters,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Thresholds steering aggregation and verification.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Resolutions at or above this confidence are applied automatically.
    pub auto_resolve_threshold: f64,
    /// Resolutions below this confidence (and at or above auto-resolve) get a
    /// verification pass.
    pub verification_threshold: f64,
    /// New-entity suggestions below this confidence fall back to review.
    pub suggest_threshold: f64,
    pub max_mentions_per_batch: usize,
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        Self {
            auto_resolve_threshold: env_f64("RESOLVER_AUTO_RESOLVE_THRESHOLD", 0.8),
            verification_threshold: env_f64("RESOLVER_VERIFICATION_THRESHOLD", 0.9),
            suggest_threshold: env_f64("RESOLVER_SUGGEST_THRESHOLD", 0.7),
            max_mentions_per_batch: crate::config::env_usize("RESOLVER_MAX_MENTIONS", 50),
        }
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            auto_resolve_threshold: 0.8,
            verification_threshold: 0.9,
            suggest_threshold: 0.7,
            max_mentions_per_batch: 50,
        }
    }
}

pub type HeartbeatFn = Arc<dyn Fn() + Send + Sync>;

/// One model's run inside a comparison.
#[derive(Debug, Clone)]
pub struct ModelRun {
    pub model: String,
    pub result: BatchResult,
}

/// Result of replaying one batch across several models.
#[derive(Debug, Clone)]
pub struct ModelComparison {
    pub comparison_id: String,
    pub runs: Vec<ModelRun>,
}

pub struct MentionResolver {
    executor: StageExecutor,
    gatherer: CandidateGatherer,
    tracer: Arc<dyn ResolutionTracer>,
    config: ResolverConfig,
    heartbeat: Option<HeartbeatFn>,
}

impl MentionResolver {
    pub fn new(
        executor: StageExecutor,
        gatherer: CandidateGatherer,
        tracer: Arc<dyn ResolutionTracer>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            executor,
            gatherer,
            tracer,
            config,
            heartbeat: None,
        }
    }

    /// Install a liveness callback invoked between stages.
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatFn) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub async fn process_batch(&self, tenant_id: Uuid, batch: &MentionBatch) -> BatchResult {
        self.process_batch_with_cancel(tenant_id, batch, CancellationToken::new())
            .await
    }

    /// Replay one batch across several models, recording each run's final
    /// resolutions under one comparison shell. Every run still gets its own
    /// trace; the comparison rows are what the side-by-side review reads.
    pub async fn compare_models(
        &self,
        tenant_id: Uuid,
        batch: &MentionBatch,
        models: &[String],
    ) -> Result<ModelComparison, ResolveError> {
        let comparison_id = self
            .tracer
            .start_comparison(tenant_id, batch.content_id, models)
            .await?;

        let mut runs = Vec::with_capacity(models.len());
        for model in models {
            let run_resolver = Self {
                executor: self.executor.with_model(model.as_str()),
                gatherer: self.gatherer.clone(),
                tracer: Arc::clone(&self.tracer),
                config: self.config.clone(),
                heartbeat: self.heartbeat.clone(),
            };

            let result = run_resolver.process_batch(tenant_id, batch).await;

            for resolution in &result.resolutions {
                if let Ok(decision) = serde_json::to_value(resolution) {
                    self.tracer
                        .record_comparison_decision(&comparison_id, model, decision)
                        .await?;
                }
            }

            log::info!(
                "comparison {}: model {} auto resolved {} of {} mentions",
                comparison_id,
                model,
                result.auto_resolved,
                result.mentions_found
            );
            runs.push(ModelRun {
                model: model.clone(),
                result,
            });
        }

        Ok(ModelComparison {
            comparison_id,
            runs,
        })
    }

    pub async fn process_batch_with_cancel(
        &self,
        tenant_id: Uuid,
        batch: &MentionBatch,
        cancel: CancellationToken,
    ) -> BatchResult {
        let trace = NewTrace {
            tenant_id,
            content_id: batch.content_id,
            model: self.executor.model().to_string(),
            config_snapshot: json!({
                "auto_resolve_threshold": self.config.auto_resolve_threshold,
                "verification_threshold": self.config.verification_threshold,
                "suggest_threshold": self.config.suggest_threshold,
                "max_mentions_per_batch": self.config.max_mentions_per_batch,
                "model": self.executor.model(),
            }),
        };

        let trace_id = match self.tracer.start_trace(trace).await {
            Ok(trace_id) => trace_id,
            Err(err) => {
                log::error!("failed to open resolution trace: {}", err);
                return BatchResult::failed(String::new(), err.to_string());
            }
        };

        match self.run_pipeline(&trace_id, tenant_id, batch, &cancel).await {
            Ok(result) => result,
            Err(err) => {
                log::error!("trace {}: resolution failed: {}", trace_id, err);
                if let Err(trace_err) = self.tracer.fail_trace(&trace_id, &err.to_string()).await {
                    log::error!("trace {}: failed to record failure: {}", trace_id, trace_err);
                }
                BatchResult::failed(trace_id, err.to_string())
            }
        }
    }

    async fn run_pipeline(
        &self,
        trace_id: &str,
        tenant_id: Uuid,
        batch: &MentionBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ResolveError> {
        let keep_payloads = self.tracer.level().keeps_payloads();
        self.beat();

        // Stage 1: understanding.
        let run = self
            .run_stage(trace_id, 1, "understanding", || {
                self.executor.understanding(&batch.content, cancel)
            })
            .await?;
        let mut mentions = run.output.mentions;
        if mentions.len() > self.config.max_mentions_per_batch {
            log::warn!(
                "trace {}: {} mentions found, truncating to {}",
                trace_id,
                mentions.len(),
                self.config.max_mentions_per_batch
            );
            mentions.truncate(self.config.max_mentions_per_batch);
        }
        self.record_stage_complete(
            trace_id,
            1,
            run.duration_ms,
            keep_payloads.then(|| json!({ "content": &batch.content })),
            keep_payloads.then(|| json!({ "mentions": &mentions })),
            &run.calls,
        )
        .await?;

        if mentions.is_empty() {
            log::info!("trace {}: no mentions found", trace_id);
            self.tracer
                .complete_trace(trace_id, TraceCounters::default())
                .await?;
            return Ok(BatchResult::empty(trace_id.to_string()));
        }
        self.beat();

        // Stage 2: cross-mention reasoning.
        let run = self
            .run_stage(trace_id, 2, "cross_mention", || {
                self.executor.cross_mention(&mentions, cancel)
            })
            .await?;
        let stage2 = run.output;
        self.record_stage_complete(
            trace_id,
            2,
            run.duration_ms,
            keep_payloads.then(|| json!({ "mentions": &mentions })),
            keep_payloads.then(|| {
                json!({
                    "unified_understanding": &stage2.unified_understanding,
                    "relationship_count": stage2.relationships.len(),
                })
            }),
            &run.calls,
        )
        .await?;
        self.beat();

        // Candidate gathering sits between the reasoning and matching stages.
        let candidates = self
            .gatherer
            .gather(tenant_id, &mentions, &stage2, batch.project_id)
            .await?;

        // Stage 3: matching.
        let run = self
            .run_stage(trace_id, 3, "matching", || {
                self.executor.matching(&mentions, &candidates, &stage2, cancel)
            })
            .await?;
        let mut resolutions = run.output.resolutions;
        let new_entities = run.output.new_entities;
        self.record_stage_complete(
            trace_id,
            3,
            run.duration_ms,
            keep_payloads.then(|| json!({ "candidates": &candidates })),
            keep_payloads.then(|| json!({ "resolution_count": resolutions.len() })),
            &run.calls,
        )
        .await?;
        self.beat();

        // Stage 4: verification of the mid-confidence band.
        self.verify_band(trace_id, &mut resolutions, &candidates, cancel)
            .await?;
        self.beat();

        self.aggregate(trace_id, &mentions, resolutions, new_entities)
            .await
    }

    /// Verification applies to resolve decisions whose confidence sits in
    /// `[auto_resolve, verification)`. A verification failure downgrades the
    /// resolution instead of aborting the batch.
    async fn verify_band(
        &self,
        trace_id: &str,
        resolutions: &mut [RawResolution],
        candidates: &[CandidateSet],
        cancel: &CancellationToken,
    ) -> Result<(), ResolveError> {
        let band: Vec<usize> = resolutions
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.decision == Decision::Resolve
                    && r.confidence >= self.config.auto_resolve_threshold
                    && r.confidence < self.config.verification_threshold
            })
            .map(|(idx, _)| idx)
            .collect();

        if band.is_empty() {
            self.tracer
                .skip_stage(trace_id, 4, "verification", "no resolutions in the verification band")
                .await?;
            return Ok(());
        }

        self.tracer.start_stage(trace_id, 4, "verification").await?;
        let started = Instant::now();
        let mut calls = Vec::new();
        let mut verified = 0usize;

        for idx in band {
            let resolution = &mut resolutions[idx];
            let candidate_set = candidates
                .iter()
                .find(|set| set.mention_text == resolution.mention_text);

            match self
                .executor
                .verification(resolution, candidate_set, cancel)
                .await
            {
                Ok(run) => {
                    calls.extend(run.calls);
                    match run.output.verdict {
                        Verdict::Confirmed => {}
                        Verdict::Adjusted => {
                            if let Some(confidence) = run.output.adjusted_confidence {
                                resolution.confidence = confidence;
                            }
                        }
                        Verdict::Rejected => {
                            resolution.decision = Decision::QueueReview;
                            if let Some(confidence) = run.output.adjusted_confidence {
                                resolution.confidence = confidence;
                            }
                            resolution
                                .factors
                                .push("rejected by verification".to_string());
                        }
                    }
                    if !run.output.reasoning.is_empty() {
                        resolution.reasoning = run.output.reasoning;
                    }
                    verified += 1;
                }
                Err(err) => {
                    log::warn!(
                        "trace {}: verification of `{}` failed, queuing for review: {}",
                        trace_id,
                        resolution.mention_text,
                        err
                    );
                    resolution.decision = Decision::QueueReview;
                    resolution
                        .factors
                        .push(format!("verification failed: {}", err.kind()));
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        for call in &calls {
            self.tracer.record_llm_call(trace_id, 4, call).await?;
        }
        self.tracer
            .complete_stage(
                trace_id,
                4,
                duration_ms,
                None,
                self.tracer
                    .level()
                    .keeps_payloads()
                    .then(|| json!({ "verified": verified })),
            )
            .await?;

        Ok(())
    }

    async fn aggregate(
        &self,
        trace_id: &str,
        mentions: &[ExtractedMention],
        raw_resolutions: Vec<RawResolution>,
        new_entities: Vec<crate::resolve::mention::NewEntitySuggestion>,
    ) -> Result<BatchResult, ResolveError> {
        let mut auto_resolved = 0usize;
        let mut queued_for_review = 0usize;
        let mut resolutions = Vec::with_capacity(raw_resolutions.len());

        for mut raw in raw_resolutions {
            // Weak new-entity suggestions are not worth creating entities for.
            if raw.decision == Decision::SuggestNewEntity
                && raw.confidence < self.config.suggest_threshold
            {
                raw.decision = Decision::QueueReview;
                raw.factors
                    .push("suggestion below confidence threshold".to_string());
            }

            let resolution = to_resolution(raw);

            let decision_type = match resolution.decision {
                Decision::Resolve if resolution.confidence >= self.config.auto_resolve_threshold => {
                    auto_resolved += 1;
                    DecisionType::Resolve
                }
                Decision::Resolve => {
                    queued_for_review += 1;
                    DecisionType::QueueReview
                }
                Decision::QueueReview => {
                    queued_for_review += 1;
                    DecisionType::QueueReview
                }
                Decision::SuggestNewEntity => DecisionType::SuggestNewEntity,
            };

            self.tracer
                .record_decision(
                    trace_id,
                    &DecisionRecord {
                        decision_type,
                        mention_text: resolution.mention_text.clone(),
                        chosen: resolution
                            .resolved_to
                            .as_ref()
                            .and_then(|r| serde_json::to_value(r).ok()),
                        alternatives: serde_json::to_value(&resolution.alternatives)
                            .unwrap_or_default(),
                        confidence: resolution.confidence,
                        reasoning: resolution.reasoning.clone(),
                        factors: resolution.factors.clone(),
                    },
                )
                .await?;

            // High-confidence resolutions bypassed stage 4; at payload-keeping
            // levels leave an audit mark saying so.
            if self.tracer.level().keeps_payloads()
                && resolution.decision == Decision::Resolve
                && resolution.confidence >= self.config.verification_threshold
            {
                self.tracer
                    .record_decision(
                        trace_id,
                        &DecisionRecord {
                            decision_type: DecisionType::SkipVerification,
                            mention_text: resolution.mention_text.clone(),
                            chosen: None,
                            alternatives: serde_json::Value::Array(Vec::new()),
                            confidence: resolution.confidence,
                            reasoning: "confidence above verification threshold".to_string(),
                            factors: Vec::new(),
                        },
                    )
                    .await?;
            }

            resolutions.push(resolution);
        }

        let counters = TraceCounters {
            mentions_found: mentions.len() as i32,
            auto_resolved: auto_resolved as i32,
            queued_for_review: queued_for_review as i32,
            new_entities_suggested: new_entities.len() as i32,
        };
        self.tracer.complete_trace(trace_id, counters).await?;

        log::info!(
            "trace {}: {} mentions, {} auto resolved, {} queued, {} new entities",
            trace_id,
            mentions.len(),
            auto_resolved,
            queued_for_review,
            new_entities.len()
        );

        Ok(BatchResult {
            trace_id: trace_id.to_string(),
            mentions_found: mentions.len(),
            auto_resolved,
            queued_for_review,
            new_entity_suggestions: new_entities,
            resolutions,
            error: None,
        })
    }

    /// Run one LLM stage with start/fail bookkeeping. Completion is recorded
    /// by the caller once it has the payloads it wants kept.
    async fn run_stage<T, F, Fut>(
        &self,
        trace_id: &str,
        stage: i32,
        name: &str,
        run: F,
    ) -> Result<TimedRun<T>, ResolveError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<StageRun<T>, crate::resolve::error::LlmError>>,
    {
        self.tracer.start_stage(trace_id, stage, name).await?;
        let started = Instant::now();

        match run().await {
            Ok(stage_run) => Ok(TimedRun {
                output: stage_run.output,
                calls: stage_run.calls,
                duration_ms: started.elapsed().as_millis() as i64,
            }),
            Err(err) => {
                let duration_ms = started.elapsed().as_millis() as i64;
                self.tracer
                    .fail_stage(trace_id, stage, duration_ms, &err.to_string())
                    .await?;
                Err(err.into())
            }
        }
    }

    async fn record_stage_complete(
        &self,
        trace_id: &str,
        stage: i32,
        duration_ms: i64,
        input: Option<serde_json::Value>,
        output: Option<serde_json::Value>,
        calls: &[LlmCallRecord],
    ) -> Result<(), ResolveError> {
        for call in calls {
            self.tracer.record_llm_call(trace_id, stage, call).await?;
        }
        self.tracer
            .complete_stage(trace_id, stage, duration_ms, input, output)
            .await?;
        Ok(())
    }

    fn beat(&self) {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat();
        }
    }
}

struct TimedRun<T> {
    output: T,
    calls: Vec<LlmCallRecord>,
    duration_ms: i64,
}

fn to_resolution(raw: RawResolution) -> Resolution {
    fn entity(raw: RawEntityRef) -> ResolvedEntity {
        ResolvedEntity {
            entity_type: raw.entity_type,
            entity_id: raw.entity_id,
            entity_name: raw.entity_name,
        }
    }

    Resolution {
        mention_text: raw.mention_text,
        decision: raw.decision,
        resolved_to: raw.resolved_to.map(entity),
        confidence: raw.confidence.clamp(0.0, 1.0),
        reasoning: raw.reasoning,
        factors: raw.factors,
        alternatives: raw.alternatives_considered.into_iter().map(entity).collect(),
        is_transcription_error: raw.is_transcription_error,
    }
}

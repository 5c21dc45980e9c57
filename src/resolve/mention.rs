//! Domain types for mention resolution.

use crate::resolve::error::DirectoryError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Term,
    Product,
    Company,
    Project,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Term => "term",
            EntityType::Product => "product",
            EntityType::Company => "company",
            EntityType::Project => "project",
        }
    }
}

/// How a resolution was reached, for audit and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    ExactMatch,
    Alias,
    Fuzzy,
    ProjectContext,
    PriorLink,
    UserConfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionStatus {
    Pending,
    Resolved,
    ReviewQueued,
    Dismissed,
}

/// How a mention was resolved, once it has been.
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionInfo {
    pub resolved_entity_id: i64,
    pub confidence: f64,
    pub source: ResolutionSource,
}

/// A persisted mention record, the shape hosts store and review queues read.
/// The pipeline itself works on [`ExtractedMention`] and produces
/// [`Resolution`]s that hosts fold back into these.
#[derive(Debug, Clone, Serialize)]
pub struct Mention {
    pub tenant_id: Uuid,
    pub content_id: i64,
    pub entity_type: EntityType,
    pub mention_text: String,
    pub position: i32,
    pub context: String,
    pub status: MentionStatus,
    pub resolution: Option<ResolutionInfo>,
    pub candidates: Vec<Candidate>,
    pub project_id: Option<i64>,
}

/// Input to one resolver invocation: a content item to scan for mentions.
#[derive(Debug, Clone)]
pub struct MentionBatch {
    /// Source id of the ingested content.
    pub content_id: i64,
    /// The content text handed to stage 1.
    pub content: String,
    /// Optional project context sharpening candidate gathering.
    pub project_id: Option<i64>,
}

/// A mention found by the understanding stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedMention {
    pub mention_text: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub position: i32,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub understanding: String,
    #[serde(default)]
    pub possible_transcription_error: bool,
    #[serde(default)]
    pub phonetic_variants: Vec<String>,
}

/// One candidate entity for a mention, with the evidence hints gathered for
/// it. Hints are an open key set (`fuzzy_match`, `prior_links`,
/// `project_member`, `pattern_match`, ...) consumed by the matching prompt.
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub entity_id: i64,
    pub entity_name: String,
    pub entity_type: EntityType,
    pub hints: BTreeMap<String, Value>,
    pub preliminary_score: f64,
}

/// Candidates gathered for one mention, sorted by preliminary score.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateSet {
    pub mention_text: String,
    pub entity_type: EntityType,
    pub candidates: Vec<Candidate>,
}

/// What the matching stage decided for a mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Resolve,
    QueueReview,
    SuggestNewEntity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEntity {
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    pub entity_id: i64,
    pub entity_name: String,
}

/// Final per-mention resolution after matching and verification.
#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub mention_text: String,
    pub decision: Decision,
    pub resolved_to: Option<ResolvedEntity>,
    pub confidence: f64,
    pub reasoning: String,
    pub factors: Vec<String>,
    pub alternatives: Vec<ResolvedEntity>,
    pub is_transcription_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEntitySuggestion {
    pub name: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub reason: String,
}

/// Result of a whole batch. `error` is set when the pipeline failed; the
/// trace id is always present so the run can be inspected either way.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub trace_id: String,
    pub mentions_found: usize,
    pub auto_resolved: usize,
    pub queued_for_review: usize,
    pub new_entity_suggestions: Vec<NewEntitySuggestion>,
    pub resolutions: Vec<Resolution>,
    pub error: Option<String>,
}

impl BatchResult {
    pub fn empty(trace_id: String) -> Self {
        Self {
            trace_id,
            mentions_found: 0,
            auto_resolved: 0,
            queued_for_review: 0,
            new_entity_suggestions: Vec::new(),
            resolutions: Vec::new(),
            error: None,
        }
    }

    pub fn failed(trace_id: String, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(trace_id)
        }
    }
}

/// An entity store match with its self-reported fuzzy confidence.
#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub entity_id: i64,
    pub entity_name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct ProjectAffinity {
    pub is_member: bool,
    pub affinity_score: f64,
    pub mention_count: i64,
}

#[derive(Debug, Clone)]
pub struct MentionPattern {
    pub entity_id: i64,
    pub times_linked: i64,
    pub is_permanent: bool,
}

/// Entity store seam consulted during candidate gathering. Implementations
/// are keyed by entity type and tenant scoped.
#[async_trait]
pub trait EntityDirectory: Send + Sync {
    async fn lookup(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
        text: &str,
    ) -> Result<Vec<EntityMatch>, DirectoryError>;

    /// How many prior resolutions point at this entity.
    async fn prior_link_count(
        &self,
        tenant_id: Uuid,
        entity_id: i64,
    ) -> Result<i64, DirectoryError>;

    async fn project_affinity(
        &self,
        tenant_id: Uuid,
        entity_id: i64,
        project_id: i64,
    ) -> Result<Option<ProjectAffinity>, DirectoryError>;

    /// Historical pattern for `(text, entity type)`, if one exists.
    async fn mention_pattern(
        &self,
        tenant_id: Uuid,
        text: &str,
        entity_type: EntityType,
    ) -> Result<Option<MentionPattern>, DirectoryError>;
}

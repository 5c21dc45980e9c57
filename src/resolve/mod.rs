//! Mention resolution pipeline.
//!
//! Resolves human and entity mentions in ingested content through four LLM
//! stages, with candidate gathering between reasoning and matching and a full
//! audit trail of every decision:
//!
//! 1. **Understanding**: find mentions in the content.
//! 2. **Cross-mention reasoning**: relationships and transcription links
//!    across the whole document.
//! 3. **Matching**: pick a candidate, queue for review, or suggest a new
//!    entity, per mention.
//! 4. **Verification**: re-check resolutions in the mid-confidence band.
//!
//! The seams are traits: [`CompletionProvider`] for the LLM transport,
//! [`EntityDirectory`] for the entity store, and [`ResolutionTracer`] for the
//! audit backend. The resolver itself is single threaded per call; run
//! multiple batches concurrently at the caller if needed, each gets its own
//! trace.

pub mod candidates;
pub mod error;
pub mod llm;
pub mod mention;
pub mod resolver;
pub mod stages;
pub mod trace;

pub use candidates::CandidateGatherer;
pub use error::{DirectoryError, LlmError, ResolveError};
pub use llm::{CompletionProvider, CompletionRequest, CompletionResponse, HttpCompletionProvider, LlmConfig};
pub use mention::{
    BatchResult, Candidate, CandidateSet, Decision, EntityDirectory, EntityMatch, EntityType,
    ExtractedMention, Mention, MentionBatch, MentionPattern, MentionStatus, NewEntitySuggestion,
    ProjectAffinity, Resolution, ResolutionInfo, ResolutionSource, ResolvedEntity,
};
pub use resolver::{HeartbeatFn, MentionResolver, ModelComparison, ModelRun, ResolverConfig};
pub use stages::{Stage1Output, Stage2Output, Stage3Output, Stage4Output, StageExecutor};
pub use trace::{
    DecisionRecord, DecisionType, LlmCallRecord, NewTrace, PgResolutionTracer, ResolutionTracer,
    TraceCounters, TraceLevel,
};

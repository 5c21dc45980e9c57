//! Prompt templates and structured output handling for the four resolution
//! stages.
//!
//! Each stage renders a user prompt, calls the completion provider in JSON
//! mode, and parses the response into its typed output. Parsing is tolerant:
//! code fences are stripped, and every entity id accepts both JSON numbers
//! and decimal strings (the "flexible int" rule). Stage 3 additionally
//! repairs the id-as-name failure mode of small models by mapping entity
//! names back to candidate ids before giving up.
//!
//! Malformed output is retried with an increasingly blunt JSON-only
//! instruction appended to the prompt. A `finish_reason` of `length` is a
//! terminal token-limit failure: retrying a truncated response cannot help.

use crate::resolve::error::LlmError;
use crate::resolve::llm::{CompletionProvider, CompletionRequest};
use crate::resolve::mention::{
    CandidateSet, Decision, EntityType, ExtractedMention, NewEntitySuggestion,
};
use crate::resolve::trace::LlmCallRecord;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Marker embedded in flexible-int decode errors so the stage-3 fallback can
/// recognize exactly this failure mode.
const NON_NUMERIC_ID_MARKER: &str = "non-numeric entity_id";

/// Deserialize an entity id from a JSON number or a decimal string.
pub(crate) mod flex_id {
    use super::NON_NUMERIC_ID_MARKER;
    use serde::de::{self, Deserializer, Visitor};

    struct FlexIdVisitor;

    impl Visitor<'_> for FlexIdVisitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an integer or a decimal string")
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<i64, E> {
            Ok(value)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<i64, E> {
            i64::try_from(value).map_err(|_| de::Error::custom("entity id out of range"))
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<i64, E> {
            if value.fract() == 0.0 {
                Ok(value as i64)
            } else {
                Err(de::Error::custom(NON_NUMERIC_ID_MARKER))
            }
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<i64, E> {
            value
                .trim()
                .parse::<i64>()
                .map_err(|_| de::Error::custom(format!("{}: `{}`", NON_NUMERIC_ID_MARKER, value)))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        deserializer.deserialize_any(FlexIdVisitor)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage1Output {
    #[serde(default)]
    pub mentions: Vec<ExtractedMention>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MentionRelationship {
    pub from: String,
    pub to: String,
    pub relationship: String,
    #[serde(default)]
    pub inference: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage2Output {
    #[serde(default)]
    pub unified_understanding: String,
    #[serde(default)]
    pub relationships: Vec<MentionRelationship>,
    #[serde(default)]
    pub resolution_hints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEntityRef {
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(deserialize_with = "flex_id::deserialize")]
    pub entity_id: i64,
    #[serde(default)]
    pub entity_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawResolution {
    pub mention_text: String,
    pub decision: Decision,
    #[serde(default)]
    pub resolved_to: Option<RawEntityRef>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub factors: Vec<String>,
    #[serde(default)]
    pub alternatives_considered: Vec<RawEntityRef>,
    #[serde(default)]
    pub is_transcription_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage3Output {
    #[serde(default)]
    pub resolutions: Vec<RawResolution>,
    #[serde(default)]
    pub new_entities: Vec<NewEntitySuggestion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Confirmed,
    Adjusted,
    Rejected,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Stage4Output {
    pub verdict: Verdict,
    #[serde(default, deserialize_with = "optional_confidence")]
    pub adjusted_confidence: Option<f64>,
    #[serde(default)]
    pub reasoning: String,
}

fn optional_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<f64>::deserialize(d)?.map(|c| c.clamp(0.0, 1.0)))
}

/// Output of one stage run: the typed result plus every prompt/response
/// exchange made to get there, for the tracer.
#[derive(Debug)]
pub struct StageRun<T> {
    pub output: T,
    pub calls: Vec<LlmCallRecord>,
}

const STAGE1_SYSTEM: &str = "You analyze workplace communication to find mentions of people, \
companies, products, projects, and domain terms. You respond only with JSON matching the \
requested schema.";

const STAGE2_SYSTEM: &str = "You reason across all mentions found in a document at once, looking \
for relationships between them: the same entity under different spellings, abbreviations, likely \
speech-to-text transcription errors, and contextual links. You respond only with JSON matching \
the requested schema.";

const STAGE3_SYSTEM: &str = "You match entity mentions to candidate entities. For each mention \
decide: resolve (pick a candidate), queue_review (ambiguous), or suggest_new_entity (no candidate \
fits and the mention is concrete enough to create). Entity ids must be the candidates' numeric \
ids. You respond only with JSON matching the requested schema.";

const STAGE4_SYSTEM: &str = "You double-check a proposed entity resolution. Verdicts: confirmed \
(the match holds), adjusted (the match holds at a different confidence), rejected (the match does \
not hold). You respond only with JSON matching the requested schema.";

pub struct StageExecutor {
    provider: Arc<dyn CompletionProvider>,
    model: String,
    max_retries: usize,
}

impl StageExecutor {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: String, max_retries: usize) -> Self {
        Self {
            provider,
            model,
            max_retries,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Same provider and retry budget, different model. Used by comparison
    /// runs to replay a batch across models.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            model: model.into(),
            max_retries: self.max_retries,
        }
    }

    /// Stage 1: find mentions in the content.
    pub async fn understanding(
        &self,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<StageRun<Stage1Output>, LlmError> {
        let user = format!(
            "Find every mention of a person, company, product, project, or domain term in the \
             content below. For each, report: mention_text, entity_type (person|term|product|\
             company|project), position (character offset), context (surrounding sentence), \
             understanding (what the mention refers to), possible_transcription_error (true when \
             the text looks like a speech-to-text mistake), and phonetic_variants (plausible \
             intended spellings when flagged).\n\nRespond as {{\"mentions\": [...]}}.\n\n\
             Content:\n{}",
            content
        );

        self.structured_completion(STAGE1_SYSTEM, user, parse_stage_json::<Stage1Output>, cancel)
            .await
    }

    /// Stage 2: cross-mention reasoning over the stage-1 output.
    pub async fn cross_mention(
        &self,
        mentions: &[ExtractedMention],
        cancel: &CancellationToken,
    ) -> Result<StageRun<Stage2Output>, LlmError> {
        let mentions_json =
            serde_json::to_string_pretty(mentions).map_err(|e| LlmError::InvalidSchema(e.to_string()))?;
        let user = format!(
            "Given these mentions from one document, produce: unified_understanding (one \
             paragraph tying them together), relationships (list of {{from, to, relationship, \
             inference}} where relationship names the link, e.g. \"same_entity\", \
             \"transcription_variant\", \"works_at\"), and resolution_hints (free-text hints \
             for matching).\n\nRespond as {{\"unified_understanding\": ..., \"relationships\": \
             [...], \"resolution_hints\": [...]}}.\n\nMentions:\n{}",
            mentions_json
        );

        self.structured_completion(STAGE2_SYSTEM, user, parse_stage_json::<Stage2Output>, cancel)
            .await
    }

    /// Stage 3: match mentions against their gathered candidates.
    pub async fn matching(
        &self,
        mentions: &[ExtractedMention],
        candidates: &[CandidateSet],
        stage2: &Stage2Output,
        cancel: &CancellationToken,
    ) -> Result<StageRun<Stage3Output>, LlmError> {
        let mentions_json =
            serde_json::to_string_pretty(mentions).map_err(|e| LlmError::InvalidSchema(e.to_string()))?;
        let candidates_json = serde_json::to_string_pretty(candidates)
            .map_err(|e| LlmError::InvalidSchema(e.to_string()))?;
        let user = format!(
            "Match each mention to one of its candidates, or decide it needs review or a new \
             entity. Use the cross-mention understanding and the per-candidate hints (fuzzy \
             score, prior links, project affinity, pattern history).\n\nFor each mention respond \
             with: mention_text, decision (resolve|queue_review|suggest_new_entity), resolved_to \
             ({{entity_type, entity_id, entity_name}}, entity_id MUST be the candidate's numeric \
             id), confidence (0 to 1), reasoning, factors (list of strings), \
             alternatives_considered (list of {{entity_type, entity_id, entity_name}}), and \
             is_transcription_error.\n\nRespond as {{\"resolutions\": [...], \"new_entities\": \
             [{{\"name\", \"entity_type\", \"reason\"}}]}}.\n\nUnified understanding:\n{}\n\n\
             Mentions:\n{}\n\nCandidates:\n{}",
            stage2.unified_understanding, mentions_json, candidates_json
        );

        let name_index = candidate_name_index(candidates);
        let parse = move |raw: &str| parse_stage3_json(raw, &name_index);

        self.structured_completion(STAGE3_SYSTEM, user, parse, cancel).await
    }

    /// Stage 4: verify one mid-confidence resolution.
    pub async fn verification(
        &self,
        resolution: &RawResolution,
        candidates: Option<&CandidateSet>,
        cancel: &CancellationToken,
    ) -> Result<StageRun<Stage4Output>, LlmError> {
        let resolved = resolution
            .resolved_to
            .as_ref()
            .map(|r| format!("{} (id {})", r.entity_name, r.entity_id))
            .unwrap_or_else(|| "nothing".to_string());
        let candidates_json = candidates
            .map(|set| serde_json::to_string_pretty(set).unwrap_or_default())
            .unwrap_or_else(|| "[]".to_string());
        let user = format!(
            "The mention \"{}\" was resolved to {} with confidence {:.2}. Reasoning: {}\n\n\
             Candidates considered:\n{}\n\nVerify this resolution. Respond as {{\"verdict\": \
             \"confirmed\"|\"adjusted\"|\"rejected\", \"adjusted_confidence\": number or null, \
             \"reasoning\": ...}}.",
            resolution.mention_text, resolved, resolution.confidence, resolution.reasoning,
            candidates_json
        );

        self.structured_completion(STAGE4_SYSTEM, user, parse_stage_json::<Stage4Output>, cancel)
            .await
    }

    /// Run a completion and parse it, retrying malformed output with an
    /// escalating JSON-only hint.
    async fn structured_completion<T, F>(
        &self,
        system: &str,
        user: String,
        parse: F,
        cancel: &CancellationToken,
    ) -> Result<StageRun<T>, LlmError>
    where
        F: Fn(&str) -> Result<T, LlmError>,
    {
        let mut calls = Vec::new();
        let mut last_error: Option<LlmError> = None;

        for attempt in 0..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(LlmError::Unavailable("cancelled".to_string()));
            }

            let prompt = match attempt {
                0 => user.clone(),
                1 => format!("{}\n\nRespond with valid JSON only.", user),
                _ => format!(
                    "{}\n\nIMPORTANT: respond with a single valid JSON object and nothing else. \
                     No prose, no code fences, no trailing commentary.",
                    user
                ),
            };

            let request = CompletionRequest {
                model: self.model.clone(),
                system_prompt: system.to_string(),
                user_prompt: prompt.clone(),
                json_mode: true,
            };

            let response = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(LlmError::Unavailable("cancelled".to_string()));
                }
                response = self.provider.complete(&request) => response?,
            };

            calls.push(LlmCallRecord {
                prompt,
                response: response.content.clone(),
                prompt_tokens: response.prompt_tokens,
                completion_tokens: response.completion_tokens,
            });

            if response.finish_reason.as_deref() == Some("length") {
                return Err(LlmError::TokenLimit);
            }

            match parse(&response.content) {
                Ok(output) => return Ok(StageRun { output, calls }),
                Err(err) => {
                    log::warn!(
                        "structured completion attempt {} failed to parse: {}",
                        attempt + 1,
                        err
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::ParseFailure("no attempts made".to_string())))
    }
}

/// Strip a single leading ```json / ``` fence and a trailing ``` fence.
fn strip_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    for opener in ["```json", "```"] {
        if let Some(rest) = text.strip_prefix(opener) {
            text = rest;
            break;
        }
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Tolerant parse shared by all stages.
pub fn parse_stage_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, LlmError> {
    serde_json::from_str(strip_fences(raw)).map_err(|err| LlmError::ParseFailure(err.to_string()))
}

/// Name-to-id index over candidate sets, including alternatives the prompt
/// exposed. Used by the stage-3 fallback.
pub fn candidate_name_index(candidates: &[CandidateSet]) -> HashMap<String, i64> {
    let mut index = HashMap::new();
    for set in candidates {
        for candidate in &set.candidates {
            index.insert(candidate.entity_name.clone(), candidate.entity_id);
        }
    }
    index
}

/// Stage-3 parse with the id-as-name fallback.
///
/// When the typed parse fails specifically on numeric-id conversion, the raw
/// JSON is re-read as a tree, every `resolutions[*].resolved_to.entity_id`
/// and `resolutions[*].alternatives_considered[*].entity_id` holding a
/// non-numeric string is matched against the candidate names, and matches are
/// substituted with the candidate's id. If nothing substitutes, the original
/// error stands.
pub fn parse_stage3_json(
    raw: &str,
    name_index: &HashMap<String, i64>,
) -> Result<Stage3Output, LlmError> {
    match parse_stage_json::<Stage3Output>(raw) {
        Ok(output) => Ok(output),
        Err(LlmError::ParseFailure(message)) if message.contains(NON_NUMERIC_ID_MARKER) => {
            match repair_entity_ids(raw, name_index) {
                Some(repaired) => parse_stage_json::<Stage3Output>(&repaired),
                None => Err(LlmError::ParseFailure(message)),
            }
        }
        Err(err) => Err(err),
    }
}

/// Rewrite name-valued entity ids to their candidate ids. Returns the
/// re-serialized JSON when at least one substitution happened.
fn repair_entity_ids(raw: &str, name_index: &HashMap<String, i64>) -> Option<String> {
    let mut tree: Value = serde_json::from_str(strip_fences(raw)).ok()?;
    let mut substitutions = 0usize;

    let mut fix = |entity: &mut Value| {
        let Some(obj) = entity.as_object_mut() else {
            return;
        };
        let Some(id_value) = obj.get("entity_id") else {
            return;
        };
        let Some(name) = id_value.as_str() else {
            return;
        };
        if name.trim().parse::<i64>().is_ok() {
            return;
        }
        if let Some(&id) = name_index.get(name.trim()) {
            log::warn!("mapping entity name `{}` to id {} in llm output", name.trim(), id);
            obj.insert("entity_id".to_string(), Value::from(id));
            substitutions += 1;
        }
    };

    if let Some(resolutions) = tree.get_mut("resolutions").and_then(Value::as_array_mut) {
        for resolution in resolutions {
            if let Some(resolved) = resolution.get_mut("resolved_to") {
                fix(resolved);
            }
            if let Some(alternatives) = resolution
                .get_mut("alternatives_considered")
                .and_then(Value::as_array_mut)
            {
                for alternative in alternatives {
                    fix(alternative);
                }
            }
        }
    }

    (substitutions > 0).then(|| tree.to_string())
}

//! Candidate gathering for mention resolution.
//!
//! For each mention the gatherer consults the injected entity directory and
//! decorates every candidate with evidence hints: the directory's own fuzzy
//! confidence, prior-resolution counts, project affinity when a project
//! context is supplied, and historical mention patterns. Mentions flagged as
//! likely transcription errors also look up their phonetic variants. A
//! composite preliminary score orders candidates before the matching stage
//! sees them, and stage-2 relationships run as a final pass that can merge
//! candidate sets across transcription-linked mentions.

use crate::resolve::error::ResolveError;
use crate::resolve::mention::{Candidate, CandidateSet, EntityDirectory, ExtractedMention};
use crate::resolve::stages::Stage2Output;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Fuzzy score attached to candidates merged in through a transcription
/// relationship.
const TRANSCRIPTION_MERGE_SCORE: f64 = 0.8;

#[derive(Clone)]
pub struct CandidateGatherer {
    directory: Arc<dyn EntityDirectory>,
}

impl CandidateGatherer {
    pub fn new(directory: Arc<dyn EntityDirectory>) -> Self {
        Self { directory }
    }

    pub async fn gather(
        &self,
        tenant_id: Uuid,
        mentions: &[ExtractedMention],
        stage2: &Stage2Output,
        project_id: Option<i64>,
    ) -> Result<Vec<CandidateSet>, ResolveError> {
        let mut sets = Vec::with_capacity(mentions.len());

        for mention in mentions {
            let mut set = self.gather_for_mention(tenant_id, mention, project_id).await?;

            if mention.possible_transcription_error {
                self.add_phonetic_variants(tenant_id, mention, &mut set, project_id)
                    .await?;
            }

            sort_by_score(&mut set.candidates);
            sets.push(set);
        }

        apply_relationships(&mut sets, stage2);
        Ok(sets)
    }

    async fn gather_for_mention(
        &self,
        tenant_id: Uuid,
        mention: &ExtractedMention,
        project_id: Option<i64>,
    ) -> Result<CandidateSet, ResolveError> {
        let matches = self
            .directory
            .lookup(tenant_id, mention.entity_type, &mention.mention_text)
            .await?;

        let mut candidates = Vec::with_capacity(matches.len());
        for entity in matches {
            let candidate = self
                .build_candidate(tenant_id, mention, entity, project_id, None)
                .await?;
            candidates.push(candidate);
        }

        Ok(CandidateSet {
            mention_text: mention.mention_text.clone(),
            entity_type: mention.entity_type,
            candidates,
        })
    }

    async fn build_candidate(
        &self,
        tenant_id: Uuid,
        mention: &ExtractedMention,
        entity: crate::resolve::mention::EntityMatch,
        project_id: Option<i64>,
        phonetic_variant: Option<&str>,
    ) -> Result<Candidate, ResolveError> {
        let mut hints: BTreeMap<String, Value> = BTreeMap::new();
        hints.insert("fuzzy_match".to_string(), json!(entity.confidence));

        let prior_links = self
            .directory
            .prior_link_count(tenant_id, entity.entity_id)
            .await?;
        hints.insert("prior_links".to_string(), json!(prior_links));

        if let Some(project_id) = project_id {
            if let Some(affinity) = self
                .directory
                .project_affinity(tenant_id, entity.entity_id, project_id)
                .await?
            {
                hints.insert("project_member".to_string(), json!(affinity.is_member));
                hints.insert("affinity_score".to_string(), json!(affinity.affinity_score));
                hints.insert(
                    "project_mention_count".to_string(),
                    json!(affinity.mention_count),
                );
            }
        }

        if let Some(pattern) = self
            .directory
            .mention_pattern(tenant_id, &mention.mention_text, mention.entity_type)
            .await?
        {
            if pattern.entity_id == entity.entity_id {
                hints.insert("pattern_match".to_string(), json!(true));
                hints.insert(
                    "pattern_times_linked".to_string(),
                    json!(pattern.times_linked),
                );
                hints.insert(
                    "pattern_is_permanent".to_string(),
                    json!(pattern.is_permanent),
                );
            }
        }

        if let Some(variant) = phonetic_variant {
            hints.insert("phonetic_variant".to_string(), json!(variant));
        }

        let preliminary_score = preliminary_score(&hints);

        Ok(Candidate {
            entity_id: entity.entity_id,
            entity_name: entity.entity_name,
            entity_type: mention.entity_type,
            hints,
            preliminary_score,
        })
    }

    /// Union in candidates found under each phonetic variant spelling.
    async fn add_phonetic_variants(
        &self,
        tenant_id: Uuid,
        mention: &ExtractedMention,
        set: &mut CandidateSet,
        project_id: Option<i64>,
    ) -> Result<(), ResolveError> {
        for variant in &mention.phonetic_variants {
            let matches = self
                .directory
                .lookup(tenant_id, mention.entity_type, variant)
                .await?;

            for entity in matches {
                if set.candidates.iter().any(|c| c.entity_id == entity.entity_id) {
                    continue;
                }
                let candidate = self
                    .build_candidate(tenant_id, mention, entity, project_id, Some(variant))
                    .await?;
                set.candidates.push(candidate);
            }
        }
        Ok(())
    }
}

/// Composite preliminary ranking over the gathered hints.
pub fn preliminary_score(hints: &BTreeMap<String, Value>) -> f64 {
    let number = |key: &str| hints.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    let flag = |key: &str| hints.get(key).and_then(Value::as_bool).unwrap_or(false);

    number("fuzzy_match")
        + if flag("project_member") { 0.3 } else { 0.0 }
        + 0.2 * number("affinity_score")
        + 0.05 * number("prior_links").min(4.0)
        + if flag("pattern_match") { 0.2 } else { 0.0 }
}

fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.preliminary_score
            .partial_cmp(&a.preliminary_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Final pass: annotate cross-mention relationships and merge candidate sets
/// across transcription links.
fn apply_relationships(sets: &mut [CandidateSet], stage2: &Stage2Output) {
    for relationship in &stage2.relationships {
        let Some(from_idx) = sets.iter().position(|s| s.mention_text == relationship.from) else {
            continue;
        };

        let hint = json!({
            "to": relationship.to,
            "relationship": relationship.relationship,
        });
        for candidate in &mut sets[from_idx].candidates {
            candidate
                .hints
                .insert("cross_mention_relationship".to_string(), hint.clone());
        }

        if relationship.relationship.contains("transcription") {
            let Some(to_idx) = sets.iter().position(|s| s.mention_text == relationship.to) else {
                continue;
            };
            if to_idx == from_idx {
                continue;
            }

            let merged: Vec<Candidate> = sets[to_idx].candidates.to_vec();
            let from_set = &mut sets[from_idx];
            for mut candidate in merged {
                if from_set
                    .candidates
                    .iter()
                    .any(|c| c.entity_id == candidate.entity_id)
                {
                    continue;
                }
                candidate
                    .hints
                    .insert("transcription_linked_to".to_string(), json!(relationship.to));
                candidate
                    .hints
                    .insert("fuzzy_match".to_string(), json!(TRANSCRIPTION_MERGE_SCORE));
                candidate.preliminary_score = preliminary_score(&candidate.hints);
                from_set.candidates.push(candidate);
            }
            sort_by_score(&mut sets[from_idx].candidates);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::mention::EntityType;
    use crate::resolve::stages::MentionRelationship;

    fn candidate(id: i64, name: &str, hints: BTreeMap<String, Value>) -> Candidate {
        let preliminary_score = preliminary_score(&hints);
        Candidate {
            entity_id: id,
            entity_name: name.to_string(),
            entity_type: EntityType::Person,
            hints,
            preliminary_score,
        }
    }

    #[test]
    fn score_formula_components() {
        let mut hints = BTreeMap::new();
        hints.insert("fuzzy_match".to_string(), json!(0.5));
        assert!((preliminary_score(&hints) - 0.5).abs() < 1e-9);

        hints.insert("project_member".to_string(), json!(true));
        assert!((preliminary_score(&hints) - 0.8).abs() < 1e-9);

        hints.insert("affinity_score".to_string(), json!(0.5));
        assert!((preliminary_score(&hints) - 0.9).abs() < 1e-9);

        hints.insert("prior_links".to_string(), json!(10));
        // prior links cap at 4.
        assert!((preliminary_score(&hints) - 1.1).abs() < 1e-9);

        hints.insert("pattern_match".to_string(), json!(true));
        assert!((preliminary_score(&hints) - 1.3).abs() < 1e-9);
    }

    #[test]
    fn relationship_pass_annotates_and_merges_transcription_links() {
        let mut hints_a = BTreeMap::new();
        hints_a.insert("fuzzy_match".to_string(), json!(0.9));
        let mut hints_b = BTreeMap::new();
        hints_b.insert("fuzzy_match".to_string(), json!(0.95));

        let mut sets = vec![
            CandidateSet {
                mention_text: "Jon Smyth".to_string(),
                entity_type: EntityType::Person,
                candidates: vec![candidate(1, "Jon Smythe", hints_a)],
            },
            CandidateSet {
                mention_text: "John Smith".to_string(),
                entity_type: EntityType::Person,
                candidates: vec![candidate(7, "John Smith", hints_b)],
            },
        ];

        let stage2 = Stage2Output {
            unified_understanding: String::new(),
            relationships: vec![MentionRelationship {
                from: "Jon Smyth".to_string(),
                to: "John Smith".to_string(),
                relationship: "transcription_variant".to_string(),
                inference: String::new(),
            }],
            resolution_hints: Vec::new(),
        };

        apply_relationships(&mut sets, &stage2);

        let from_set = &sets[0];
        assert_eq!(from_set.candidates.len(), 2);
        assert!(from_set.candidates.iter().all(|c| c
            .hints
            .contains_key("cross_mention_relationship")
            || c.hints.contains_key("transcription_linked_to")));

        let merged = from_set
            .candidates
            .iter()
            .find(|c| c.entity_id == 7)
            .expect("merged candidate");
        assert_eq!(merged.hints["transcription_linked_to"], json!("John Smith"));
        assert_eq!(merged.hints["fuzzy_match"], json!(TRANSCRIPTION_MERGE_SCORE));
    }

    #[test]
    fn non_transcription_relationship_only_annotates() {
        let mut hints = BTreeMap::new();
        hints.insert("fuzzy_match".to_string(), json!(0.9));
        let mut sets = vec![
            CandidateSet {
                mention_text: "Alice".to_string(),
                entity_type: EntityType::Person,
                candidates: vec![candidate(1, "Alice A", hints.clone())],
            },
            CandidateSet {
                mention_text: "Acme".to_string(),
                entity_type: EntityType::Company,
                candidates: vec![candidate(2, "Acme Corp", hints)],
            },
        ];

        let stage2 = Stage2Output {
            unified_understanding: String::new(),
            relationships: vec![MentionRelationship {
                from: "Alice".to_string(),
                to: "Acme".to_string(),
                relationship: "works_at".to_string(),
                inference: String::new(),
            }],
            resolution_hints: Vec::new(),
        };

        apply_relationships(&mut sets, &stage2);
        assert_eq!(sets[0].candidates.len(), 1);
        assert!(sets[0].candidates[0].hints.contains_key("cross_mention_relationship"));
        assert_eq!(sets[1].candidates.len(), 1);
    }
}

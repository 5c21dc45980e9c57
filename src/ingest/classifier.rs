//! Attachment classification.
//!
//! A pipeline of classifier steps decides what happens to each attachment:
//! store and process it, skip it, or hold it for review. The first definitive
//! classification wins; `pending_review` results are recorded as breadcrumbs
//! and the pipeline keeps going. Every step's verdict is kept as a
//! [`ProcessingStep`] so the stored attachment link explains itself.

use crate::ingest::parser::EmailAttachment;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What the pipeline decided to do with an attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "processing_tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingTier {
    AutoProcess,
    AutoSkip,
    PendingReview,
    ManualProcess,
    ManualSkip,
}

impl ProcessingTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingTier::AutoProcess => "auto_process",
            ProcessingTier::AutoSkip => "auto_skip",
            ProcessingTier::PendingReview => "pending_review",
            ProcessingTier::ManualProcess => "manual_process",
            ProcessingTier::ManualSkip => "manual_skip",
        }
    }

    /// Anything but `pending_review` settles the pipeline.
    pub fn is_definitive(&self) -> bool {
        *self != ProcessingTier::PendingReview
    }

    /// Tiers whose content gets stored as a child source.
    pub fn is_processable(&self) -> bool {
        matches!(self, ProcessingTier::AutoProcess | ProcessingTier::ManualProcess)
    }
}

/// A single classification verdict.
#[derive(Debug, Clone)]
pub struct Classification {
    pub tier: ProcessingTier,
    pub reason: String,
    pub confidence: f64,
    /// Name of the step that produced this verdict.
    pub step: String,
    /// Set when the attachment is an embedded email and should be ingested
    /// recursively rather than stored as bytes.
    pub is_embedded_email: bool,
}

/// Audit breadcrumb persisted with the attachment link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStep {
    pub step: String,
    pub tier: ProcessingTier,
    pub reason: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

/// A classifier step either produces a verdict or defers to the next step.
pub trait ClassifierStep: Send + Sync {
    fn name(&self) -> &str;
    fn classify(&self, attachment: &EmailAttachment) -> Option<Classification>;
}

/// Ordered pipeline of classifier steps.
pub struct ClassifierPipeline {
    steps: Vec<Box<dyn ClassifierStep>>,
}

impl ClassifierPipeline {
    pub fn new(steps: Vec<Box<dyn ClassifierStep>>) -> Self {
        Self { steps }
    }

    /// Pipeline with only the built-in heuristic step.
    pub fn with_default_rules() -> Self {
        Self::new(vec![Box::new(HeuristicStep::new(HeuristicRules::default()))])
    }

    pub fn classify(&self, attachment: &EmailAttachment) -> (Classification, Vec<ProcessingStep>) {
        let mut steps_taken = Vec::new();
        let mut last_pending: Option<Classification> = None;

        for step in &self.steps {
            let Some(classification) = step.classify(attachment) else {
                continue;
            };

            steps_taken.push(ProcessingStep {
                step: classification.step.clone(),
                tier: classification.tier,
                reason: classification.reason.clone(),
                confidence: classification.confidence,
                timestamp: Utc::now(),
            });

            if classification.tier.is_definitive() {
                return (classification, steps_taken);
            }
            last_pending = Some(classification);
        }

        let classification = last_pending.unwrap_or_else(|| Classification {
            tier: ProcessingTier::PendingReview,
            reason: "no classifier produced a result".to_string(),
            confidence: 0.5,
            step: "default".to_string(),
            is_embedded_email: false,
        });

        if steps_taken.is_empty() {
            steps_taken.push(ProcessingStep {
                step: classification.step.clone(),
                tier: classification.tier,
                reason: classification.reason.clone(),
                confidence: classification.confidence,
                timestamp: Utc::now(),
            });
        }

        (classification, steps_taken)
    }
}

/// Tunable knobs for the built-in heuristic step.
#[derive(Debug, Clone)]
pub struct HeuristicRules {
    /// Images at or above this size are kept (diagrams, screenshots).
    pub min_image_size: i64,
    /// Images at or below this size are skipped (signatures, logos).
    pub max_skip_image_size: i64,
    /// Case-insensitive filename patterns that mark throwaway images.
    pub skip_name_patterns: Vec<Regex>,
    /// Mime types skipped outright.
    pub skip_mime_types: Vec<String>,
}

const DEFAULT_SKIP_NAME_PATTERNS: &[&str] = &[
    "signature",
    "logo",
    "icon",
    r"^image\d+\.(png|gif|jpe?g)$",
    "spacer",
    "pixel",
    "tracking",
    "banner",
    "footer",
];

impl Default for HeuristicRules {
    fn default() -> Self {
        Self {
            min_image_size: 100 * 1024,
            max_skip_image_size: 20 * 1024,
            skip_name_patterns: DEFAULT_SKIP_NAME_PATTERNS
                .iter()
                .map(|pattern| {
                    Regex::new(&format!("(?i){}", pattern)).expect("default pattern is valid")
                })
                .collect(),
            skip_mime_types: vec![
                "image/gif".to_string(),
                "application/pgp-signature".to_string(),
                "application/pkcs7-signature".to_string(),
                "application/x-pkcs7-signature".to_string(),
                "text/x-vcard".to_string(),
            ],
        }
    }
}

const EMBEDDED_EMAIL_MIMES: &[&str] = &["message/rfc822", "application/vnd.ms-outlook"];
const EMBEDDED_EMAIL_EXTENSIONS: &[&str] = &[".eml", ".msg"];

const DOCUMENT_MIMES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.oasis.opendocument.text",
    "application/vnd.oasis.opendocument.spreadsheet",
    "application/vnd.oasis.opendocument.presentation",
    "text/plain",
    "text/csv",
    "application/rtf",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    ".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".odt", ".ods", ".odp", ".txt",
    ".csv", ".rtf",
];

/// The built-in rule step. Rules apply in a fixed order: embedded emails,
/// then keep-worthy documents and large images, then skip-worthy inline
/// images and signature fodder, then pending review.
pub struct HeuristicStep {
    rules: HeuristicRules,
}

impl HeuristicStep {
    pub fn new(rules: HeuristicRules) -> Self {
        Self { rules }
    }
}

const STEP_NAME: &str = "heuristic";

impl ClassifierStep for HeuristicStep {
    fn name(&self) -> &str {
        STEP_NAME
    }

    fn classify(&self, attachment: &EmailAttachment) -> Option<Classification> {
        let mime = attachment.mime_type.to_ascii_lowercase();
        let extension = file_extension(&attachment.filename);
        let is_image = mime.starts_with("image/");

        // Rule 1: embedded emails are always processed, recursively.
        if EMBEDDED_EMAIL_MIMES.contains(&mime.as_str())
            || EMBEDDED_EMAIL_EXTENSIONS.contains(&extension.as_str())
        {
            return Some(Classification {
                tier: ProcessingTier::AutoProcess,
                reason: "embedded email attachment".to_string(),
                confidence: 1.0,
                step: STEP_NAME.to_string(),
                is_embedded_email: true,
            });
        }

        // Rule 2: documents and large images are worth processing.
        if DOCUMENT_MIMES.contains(&mime.as_str()) {
            return Some(Classification {
                tier: ProcessingTier::AutoProcess,
                reason: format!("document mime type {}", mime),
                confidence: 0.95,
                step: STEP_NAME.to_string(),
                is_embedded_email: false,
            });
        }
        if DOCUMENT_EXTENSIONS.contains(&extension.as_str()) {
            return Some(Classification {
                tier: ProcessingTier::AutoProcess,
                reason: format!("document extension {}", extension),
                confidence: 0.9,
                step: STEP_NAME.to_string(),
                is_embedded_email: false,
            });
        }
        if is_image && attachment.size >= self.rules.min_image_size {
            return Some(Classification {
                tier: ProcessingTier::AutoProcess,
                reason: format!("large image ({} bytes), likely diagram or screenshot", attachment.size),
                confidence: 0.8,
                step: STEP_NAME.to_string(),
                is_embedded_email: false,
            });
        }

        // Rule 3: inline decorations and signature fodder are skipped.
        if attachment.is_inline && attachment.content_id.is_some() {
            return Some(Classification {
                tier: ProcessingTier::AutoSkip,
                reason: "inline image with Content-ID".to_string(),
                confidence: 0.9,
                step: STEP_NAME.to_string(),
                is_embedded_email: false,
            });
        }
        if is_image && attachment.size > 0 && attachment.size <= self.rules.max_skip_image_size {
            return Some(Classification {
                tier: ProcessingTier::AutoSkip,
                reason: format!("small image ({} bytes), likely signature or logo", attachment.size),
                confidence: 0.85,
                step: STEP_NAME.to_string(),
                is_embedded_email: false,
            });
        }
        if !attachment.filename.is_empty() {
            for pattern in &self.rules.skip_name_patterns {
                if pattern.is_match(&attachment.filename) {
                    return Some(Classification {
                        tier: ProcessingTier::AutoSkip,
                        reason: format!("filename matches skip pattern {}", pattern.as_str()),
                        confidence: 0.85,
                        step: STEP_NAME.to_string(),
                        is_embedded_email: false,
                    });
                }
            }
        }
        if self.rules.skip_mime_types.contains(&mime) {
            // GIFs only skip while small; a big GIF may be a real diagram and
            // falls through to review.
            let size_gated = is_image && attachment.size > self.rules.max_skip_image_size;
            if !size_gated {
                return Some(Classification {
                    tier: ProcessingTier::AutoSkip,
                    reason: format!("skip-listed mime type {}", mime),
                    confidence: 0.9,
                    step: STEP_NAME.to_string(),
                    is_embedded_email: false,
                });
            }
        }

        Some(Classification {
            tier: ProcessingTier::PendingReview,
            reason: "no heuristic rule matched".to_string(),
            confidence: 0.5,
            step: STEP_NAME.to_string(),
            is_embedded_email: false,
        })
    }
}

fn file_extension(filename: &str) -> String {
    match filename.rfind('.') {
        Some(idx) => filename[idx..].to_ascii_lowercase(),
        None => String::new(),
    }
}

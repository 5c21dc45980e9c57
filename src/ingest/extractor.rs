//! Attachment extraction and recursive embedded-email handling.
//!
//! For every attachment on a parsed email the extractor runs the classifier,
//! then either stores the content as a child source (with its link row in the
//! same transaction), records a link-only row, or hands an embedded email to
//! the injected [`EmbeddedEmailHandler`] for recursive ingestion. Recursion is
//! bounded at [`MAX_EMBEDDED_DEPTH`] and guarded against message-id cycles via
//! the caller-supplied seen set. A failing attachment never takes the parent
//! email down with it.

use crate::ingest::classifier::{Classification, ClassifierPipeline, ProcessingStep, ProcessingTier};
use crate::ingest::error::IngestError;
use crate::ingest::parser::{EmailAttachment, ParsedEmail, ParserOptions, parse_email_bytes};
use crate::storage::{
    IngestStore, NewAttachmentLink, NewEmailSource, SourceSystem, attachment_external_id,
};
use async_trait::async_trait;
use base64::Engine as _;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Embedded emails nested deeper than this are stored as plain attachments.
pub const MAX_EMBEDDED_DEPTH: usize = 5;

/// Capability for ingesting an embedded email as a first-class source.
/// Injected by the batch processor, which is itself the implementation; the
/// returned id is the new child source.
#[async_trait]
pub trait EmbeddedEmailHandler: Send + Sync {
    async fn ingest_embedded(
        &self,
        email: ParsedEmail,
        parent_source_id: i64,
        tenant_id: Uuid,
        depth: usize,
        seen_message_ids: Vec<String>,
    ) -> Result<i64, IngestError>;
}

/// Per-call extraction state, threaded through the recursion.
pub struct ExtractionContext<'a> {
    pub tenant_id: Uuid,
    pub depth: usize,
    pub seen_message_ids: &'a [String],
    pub handler: &'a dyn EmbeddedEmailHandler,
}

/// An attachment whose bytes ended up behind a child source.
#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub child_source_id: i64,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub is_embedded_email: bool,
}

#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub errors: usize,
    pub stored: Vec<StoredAttachment>,
}

enum AttachmentResult {
    Processed(Option<StoredAttachment>),
    Skipped,
    Pending,
}

pub struct AttachmentExtractor {
    store: Arc<dyn IngestStore>,
    classifier: ClassifierPipeline,
    parser_options: ParserOptions,
}

impl AttachmentExtractor {
    pub fn new(
        store: Arc<dyn IngestStore>,
        classifier: ClassifierPipeline,
        parser_options: ParserOptions,
    ) -> Self {
        Self {
            store,
            classifier,
            parser_options,
        }
    }

    /// Classify and persist every attachment on `email`, recursing into
    /// embedded emails through the context's handler.
    pub async fn extract(
        &self,
        email: &ParsedEmail,
        parent_source_id: i64,
        ctx: &ExtractionContext<'_>,
    ) -> ExtractionOutcome {
        let mut outcome = ExtractionOutcome {
            total: email.attachments.len(),
            ..ExtractionOutcome::default()
        };

        for attachment in &email.attachments {
            match self
                .process_attachment(email, attachment, parent_source_id, ctx)
                .await
            {
                Ok(AttachmentResult::Processed(stored)) => {
                    outcome.processed += 1;
                    outcome.stored.extend(stored);
                }
                Ok(AttachmentResult::Skipped) => outcome.skipped += 1,
                Ok(AttachmentResult::Pending) => outcome.pending += 1,
                Err(err) => {
                    log::warn!(
                        "attachment {} ({}) of source {} failed: {}",
                        attachment.position,
                        attachment.filename,
                        parent_source_id,
                        err
                    );
                    outcome.errors += 1;
                }
            }
        }

        outcome
    }

    async fn process_attachment(
        &self,
        email: &ParsedEmail,
        attachment: &EmailAttachment,
        parent_source_id: i64,
        ctx: &ExtractionContext<'_>,
    ) -> Result<AttachmentResult, IngestError> {
        let (classification, steps) = self.classifier.classify(attachment);

        if let (true, Some(content)) = (classification.is_embedded_email, attachment.content.as_deref())
        {
            if ctx.depth >= MAX_EMBEDDED_DEPTH {
                log::warn!(
                    "embedded email at depth {} exceeds limit, storing as attachment",
                    ctx.depth
                );
            } else {
                match self
                    .recurse_embedded(
                        email,
                        attachment,
                        content,
                        parent_source_id,
                        &classification,
                        &steps,
                        ctx,
                    )
                    .await
                {
                    Ok(result) => return Ok(result),
                    Err(err) => {
                        log::warn!(
                            "embedded email in attachment {} failed, storing as attachment: {}",
                            attachment.position,
                            err
                        );
                    }
                }
            }
        }

        self.store_regular(email, attachment, parent_source_id, &classification, steps, ctx)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn recurse_embedded(
        &self,
        email: &ParsedEmail,
        attachment: &EmailAttachment,
        content: &[u8],
        parent_source_id: i64,
        classification: &Classification,
        steps: &[ProcessingStep],
        ctx: &ExtractionContext<'_>,
    ) -> Result<AttachmentResult, IngestError> {
        let embedded = parse_email_bytes(
            content,
            &format!("{}#{}", email.file_path, attachment.position),
            &self.parser_options,
        )
        .map_err(|err| IngestError::Parse {
            path: email.file_path.clone(),
            message: format!("embedded email parse failed: {}", err),
        })?;

        if ctx.seen_message_ids.contains(&embedded.message_id) {
            let link = self.build_link(
                attachment,
                parent_source_id,
                None,
                ProcessingTier::AutoSkip,
                format!(
                    "cycle detected: message-id {} already processed",
                    embedded.message_id
                ),
                steps.to_vec(),
                true,
            );
            self.store.create_attachment_link_only(link).await?;
            log::warn!(
                "cycle detected for embedded message-id {}, skipping recursion",
                embedded.message_id
            );
            return Ok(AttachmentResult::Skipped);
        }

        let mut seen = ctx.seen_message_ids.to_vec();
        if !seen.contains(&email.message_id) {
            seen.push(email.message_id.clone());
        }

        let child_id = ctx
            .handler
            .ingest_embedded(
                embedded,
                parent_source_id,
                ctx.tenant_id,
                ctx.depth + 1,
                seen,
            )
            .await?;

        let link = self.build_link(
            attachment,
            parent_source_id,
            Some(child_id),
            classification.tier,
            "embedded email processed recursively".to_string(),
            steps.to_vec(),
            true,
        );
        self.store.create_attachment_link_only(link).await?;

        Ok(AttachmentResult::Processed(Some(StoredAttachment {
            child_source_id: child_id,
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.size,
            is_embedded_email: true,
        })))
    }

    async fn store_regular(
        &self,
        email: &ParsedEmail,
        attachment: &EmailAttachment,
        parent_source_id: i64,
        classification: &Classification,
        steps: Vec<ProcessingStep>,
        ctx: &ExtractionContext<'_>,
    ) -> Result<AttachmentResult, IngestError> {
        let storable_content = if classification.tier.is_processable() {
            attachment.content.as_deref()
        } else {
            None
        };

        if let Some(content) = storable_content {
            let content_hash = attachment
                .content_hash
                .clone()
                .unwrap_or_else(|| crate::ingest::parser::sha256_hex(content));

            // Same bytes stored before: record a link-only row so at most one
            // link per content hash carries a child.
            if let Some(existing) = self
                .store
                .find_stored_attachment_by_hash(&content_hash)
                .await?
            {
                let link = self.build_link(
                    attachment,
                    parent_source_id,
                    None,
                    classification.tier,
                    format!(
                        "{} (duplicate content of source {})",
                        classification.reason, existing
                    ),
                    steps,
                    classification.is_embedded_email,
                );
                self.store.create_attachment_link_only(link).await?;
                return Ok(AttachmentResult::Processed(None));
            }

            let source = self.build_attachment_source(
                email,
                attachment,
                parent_source_id,
                ctx.tenant_id,
                &content_hash,
            );
            let link = self.build_link(
                attachment,
                parent_source_id,
                None,
                classification.tier,
                classification.reason.clone(),
                steps,
                classification.is_embedded_email,
            );

            let (child_id, _) = self
                .store
                .create_attachment_with_source(source, link)
                .await?;

            return Ok(AttachmentResult::Processed(Some(StoredAttachment {
                child_source_id: child_id,
                filename: attachment.filename.clone(),
                mime_type: attachment.mime_type.clone(),
                size_bytes: attachment.size,
                is_embedded_email: classification.is_embedded_email,
            })));
        }

        let link = self.build_link(
            attachment,
            parent_source_id,
            None,
            classification.tier,
            classification.reason.clone(),
            steps,
            classification.is_embedded_email,
        );
        self.store.create_attachment_link_only(link).await?;

        Ok(match classification.tier {
            ProcessingTier::PendingReview => AttachmentResult::Pending,
            _ => AttachmentResult::Skipped,
        })
    }

    fn build_attachment_source(
        &self,
        email: &ParsedEmail,
        attachment: &EmailAttachment,
        parent_source_id: i64,
        tenant_id: Uuid,
        content_hash: &str,
    ) -> NewEmailSource {
        let content = attachment.content.as_deref().unwrap_or_default();
        // Text content is stored as-is; anything else goes behind the base64
        // prefix so it survives the text column.
        let raw_content = if attachment.mime_type.starts_with("text/") {
            String::from_utf8_lossy(content).into_owned()
        } else {
            format!(
                "{}{}",
                crate::storage::BASE64_CONTENT_PREFIX,
                base64::engine::general_purpose::STANDARD.encode(content)
            )
        };
        let content_size = raw_content.len() as i64;

        NewEmailSource {
            tenant_id,
            source_system: SourceSystem::Attachment,
            external_id: attachment_external_id(parent_source_id, attachment.position),
            content_hash: content_hash.to_string(),
            raw_content,
            content_type: attachment.mime_type.clone(),
            content_size,
            ingestion_metadata: json!({
                "filename": attachment.filename,
                "mime_type": attachment.mime_type,
                "parent_source_id": parent_source_id,
                "position": attachment.position,
                "original_size": attachment.size,
            }),
            source_timestamp: Some(email.date),
            participant_emails: Vec::new(),
            content_id: attachment.content_id.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_link(
        &self,
        attachment: &EmailAttachment,
        parent_source_id: i64,
        child_source_id: Option<i64>,
        tier: ProcessingTier,
        tier_reason: String,
        processing_steps: Vec<ProcessingStep>,
        is_embedded_email: bool,
    ) -> NewAttachmentLink {
        NewAttachmentLink {
            parent_source_id,
            child_source_id,
            filename: attachment.filename.clone(),
            mime_type: attachment.mime_type.clone(),
            size_bytes: attachment.size,
            content_hash: attachment.content_hash.clone().unwrap_or_default(),
            position: attachment.position,
            content_id: attachment.content_id.clone(),
            is_inline: attachment.is_inline,
            processing_tier: tier,
            tier_reason,
            processing_steps,
            is_embedded_email,
        }
    }
}

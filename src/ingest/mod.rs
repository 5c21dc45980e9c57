//! Bulk email ingest pipeline.
//!
//! This module provides the full path from `.eml` files on disk to persisted
//! sources, attachment links, and lifecycle events:
//!
//! - **`parser`**: RFC 5322 bytes to structured emails with attachments.
//! - **`classifier`**: rule pipeline assigning each attachment a processing
//!   tier.
//! - **`extractor`**: per-email attachment persistence with recursive
//!   embedded-email handling, bounded depth and cycle detection.
//! - **`processor`**: job lifecycle, file discovery, the worker pool and the
//!   per-file pipeline.
//! - **`progress`**: thread-safe counters shared by the worker pool.
//! - **`error`**: the ingest error taxonomy.
//!
//! # Data flow
//!
//! The processor pulls files, parses each one, checks for duplicates, creates
//! the email source row, extracts attachments (classifying each one and
//! recursing into embedded emails up to depth 5), then publishes events and
//! updates progress. One file failing never stops the batch.

pub mod classifier;
pub mod error;
pub mod extractor;
pub mod parser;
pub mod processor;
pub mod progress;

pub use classifier::{Classification, ClassifierPipeline, ClassifierStep, ProcessingTier};
pub use error::{ErrorKind, IngestError};
pub use extractor::{
    AttachmentExtractor, EmbeddedEmailHandler, ExtractionContext, ExtractionOutcome,
    MAX_EMBEDDED_DEPTH,
};
pub use parser::{EmailAddress, EmailAttachment, ParsedEmail, ParserOptions};
pub use processor::{BatchProcessor, IngestOptions, IngestReport};
pub use progress::{ProgressSnapshot, ProgressTracker};

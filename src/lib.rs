//! Penfold: bulk email ingest and mention resolution.
//!
//! Penfold ingests RFC 5322 `.eml` files in bulk, extracts bodies and
//! attachments, classifies attachments by processing value, persists
//! everything to Postgres, and publishes lifecycle events. Downstream, a
//! four-stage LLM pipeline resolves entity mentions in ingested content, with
//! every decision audited.
//!
//! # Modules
//!
//! - [`ingest`]: parser, classifier, extractor, batch processor, progress.
//! - [`storage`]: the repository seam and its Postgres implementation.
//! - [`events`]: lifecycle event publishing over Postgres NOTIFY.
//! - [`resolve`]: the four-stage mention resolution pipeline and audit
//!   tracing.
//! - [`config`]: environment configuration and tenant resolution.
//!
//! The binary in `main.rs` wires these together behind a small CLI; the
//! library surface is what integration tests (and other hosts) use directly.

pub mod config;
pub mod events;
pub mod ingest;
pub mod resolve;
pub mod storage;

//! End-to-end ingest scenarios against in-memory fakes of the repository and
//! event sink.

mod support;

use penfold::events::channels;
use penfold::ingest::classifier::ProcessingTier;
use penfold::ingest::{BatchProcessor, IngestOptions};
use penfold::storage::{JobStatus, SourceSystem};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use support::{CollectingSink, MemoryStore};
use tokio_util::sync::CancellationToken;

const SIMPLE_EMAIL: &str = concat!(
    "Message-ID: <a@x>\r\n",
    "From: John <john@x>\r\n",
    "To: jane@x\r\n",
    "Subject: T\r\n",
    "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
    "\r\n",
    "hello\r\n"
);

fn processor(
    store: &Arc<MemoryStore>,
    sink: &Arc<CollectingSink>,
    options: IngestOptions,
) -> Arc<BatchProcessor> {
    let store: Arc<dyn penfold::storage::IngestStore> = Arc::clone(store) as _;
    let sink: Arc<dyn penfold::events::EventSink> = Arc::clone(sink) as _;
    Arc::new(BatchProcessor::new(store, sink, options).unwrap())
}

fn write_eml(dir: &Path, name: &str, contents: &str) {
    std::fs::write(dir.join(name), contents).unwrap();
}

#[tokio::test]
async fn simple_ingest_creates_source_and_event() {
    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "one.eml", SIMPLE_EMAIL);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    let report = processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert!(report.success);
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(
        (report.total, report.imported, report.skipped, report.failed),
        (1, 1, 0, 0)
    );

    let source = store.source_by_external_id("<a@x>").expect("source row");
    let expected_hash = format!("{:x}", Sha256::digest(SIMPLE_EMAIL.as_bytes()));
    assert_eq!(source.source.content_hash, expected_hash);
    assert_eq!(source.source.raw_content, "hello");
    assert_eq!(source.source.source_system, SourceSystem::ManualEml);
    assert_eq!(
        source.source.participant_emails,
        vec!["john@x".to_string(), "jane@x".to_string()]
    );

    let events = sink.on_channel(channels::MANUAL_EMAIL_INGESTED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["message_id"], "<a@x>");
    assert_eq!(events[0]["from"], "john@x");
    assert_eq!(events[0]["content_hash"], expected_hash);
    assert_eq!(events[0]["has_attachments"], false);

    let job = store.jobs.lock().unwrap().values().next().cloned().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!((job.processed, job.imported), (1, 1));
}

#[tokio::test]
async fn second_ingest_of_same_directory_skips_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "one.eml", SIMPLE_EMAIL);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());

    let first = processor(&store, &sink, IngestOptions::default());
    first.process(dir.path(), CancellationToken::new()).await.unwrap();

    let second = processor(&store, &sink, IngestOptions::default());
    let report = second
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        (report.total, report.imported, report.skipped, report.failed),
        (1, 0, 1, 0)
    );
    assert_eq!(store.sources.lock().unwrap().len(), 1);
    // The duplicate short-circuits before source creation, so no second event.
    assert_eq!(sink.on_channel(channels::MANUAL_EMAIL_INGESTED).len(), 1);
}

fn email_with_embedded_boundary(outer_id: &str, inner: &str, boundary: &str) -> String {
    format!(
        concat!(
            "Message-ID: {id}\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: multipart/mixed; boundary=\"{b}\"\r\n",
            "\r\n",
            "--{b}\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "outer body\r\n",
            "--{b}\r\n",
            "Content-Type: message/rfc822\r\n",
            "Content-Disposition: attachment; filename=\"fwd.eml\"\r\n",
            "\r\n",
            "{inner}",
            "--{b}--\r\n"
        ),
        id = outer_id,
        b = boundary,
        inner = inner
    )
}

fn email_with_embedded(outer_id: &str, inner: &str) -> String {
    email_with_embedded_boundary(outer_id, inner, "b")
}

#[tokio::test]
async fn embedded_email_with_cycle_is_link_only_skip() {
    // The embedded message carries the same message-id as its parent.
    let inner = concat!(
        "Message-ID: <outer@x>\r\n",
        "From: b@x\r\n",
        "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
        "\r\n",
        "inner body\r\n"
    );
    let outer = email_with_embedded("<outer@x>", inner);

    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "cycle.eml", &outer);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    let report = processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.imported, 1);

    // Only the parent source exists; the cycle produced no child.
    assert_eq!(store.sources.lock().unwrap().len(), 1);

    let links = store.links.lock().unwrap();
    assert_eq!(links.len(), 1);
    let link = &links[0].link;
    assert_eq!(link.processing_tier, ProcessingTier::AutoSkip);
    assert!(link.is_embedded_email);
    assert!(link.tier_reason.starts_with("cycle detected"));
    assert!(link.child_source_id.is_none());
}

#[tokio::test]
async fn embedded_email_is_ingested_recursively() {
    let inner = concat!(
        "Message-ID: <inner@x>\r\n",
        "From: b@x\r\n",
        "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
        "\r\n",
        "inner body\r\n"
    );
    let outer = email_with_embedded("<outer@x>", inner);

    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "fwd.eml", &outer);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    let embedded = store.sources_with_system(SourceSystem::EmbeddedEmail);
    assert_eq!(embedded.len(), 1);
    assert_eq!(embedded[0].source.external_id, "<inner@x>");
    assert_eq!(
        embedded[0].source.ingestion_metadata["parent_source_id"],
        serde_json::json!(store.source_by_external_id("<outer@x>").unwrap().id)
    );

    let links = store.links.lock().unwrap();
    assert_eq!(links.len(), 1);
    let link = &links[0].link;
    assert_eq!(link.processing_tier, ProcessingTier::AutoProcess);
    assert_eq!(link.tier_reason, "embedded email processed recursively");
    assert_eq!(link.child_source_id, Some(embedded[0].id));
    drop(links);

    let events = sink.on_channel(channels::ATTACHMENT_INGESTED);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["is_embedded_email"], true);
    assert_eq!(events[0]["source_id"], serde_json::json!(embedded[0].id));
}

#[tokio::test]
async fn embedded_recursion_stops_at_depth_limit() {
    // Leaf wrapped six times: levels 1 through 5 ingest as embedded emails,
    // the level-6 message is stored as a plain attachment.
    let mut raw = concat!(
        "Message-ID: <leaf@x>\r\n",
        "From: a@x\r\n",
        "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
        "\r\n",
        "leaf body\r\n"
    )
    .to_string();
    for level in (0..6).rev() {
        raw = email_with_embedded_boundary(
            &format!("<level{}@x>", level),
            &raw,
            &format!("b{}", level),
        );
    }

    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "deep.eml", &raw);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    let report = processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();
    assert!(report.success);

    assert_eq!(store.sources_with_system(SourceSystem::ManualEml).len(), 1);
    assert_eq!(store.sources_with_system(SourceSystem::EmbeddedEmail).len(), 5);

    let attachments = store.sources_with_system(SourceSystem::Attachment);
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].source.content_type, "message/rfc822");
    assert!(attachments[0].source.raw_content.starts_with("base64:"));
}

#[tokio::test]
async fn tiny_inline_image_is_skipped_without_child() {
    let png_bytes = vec![0u8; 4 * 1024];
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&png_bytes);
    let raw = format!(
        concat!(
            "Message-ID: <img@x>\r\n",
            "From: a@x\r\n",
            "Date: Mon, 15 Jan 2024 10:30:00 -0500\r\n",
            "Content-Type: multipart/related; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "see signature\r\n",
            "--b\r\n",
            "Content-Type: image/png\r\n",
            "Content-ID: <sig@x>\r\n",
            "Content-Disposition: inline; filename=\"sig.png\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "{}\r\n",
            "--b--\r\n"
        ),
        encoded
    );

    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "sig.eml", &raw);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    // No child source for the signature image.
    assert_eq!(store.sources.lock().unwrap().len(), 1);

    let links = store.links.lock().unwrap();
    assert_eq!(links.len(), 1);
    let link = &links[0].link;
    assert_eq!(link.processing_tier, ProcessingTier::AutoSkip);
    assert!(link.tier_reason.contains("inline image with Content-ID"));
    assert!(link.child_source_id.is_none());
    drop(links);

    assert!(sink.on_channel(channels::ATTACHMENT_INGESTED).is_empty());
}

#[tokio::test]
async fn dry_run_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "one.eml", SIMPLE_EMAIL);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(
        &store,
        &sink,
        IngestOptions {
            dry_run: true,
            ..IngestOptions::default()
        },
    );

    let report = processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.imported, 1);
    assert!(store.sources.lock().unwrap().is_empty());
    assert!(store.jobs.lock().unwrap().is_empty());
    assert!(sink.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn resume_processes_only_remaining_files() {
    let dir = tempfile::tempdir().unwrap();
    write_eml(dir.path(), "one.eml", SIMPLE_EMAIL);
    write_eml(
        dir.path(),
        "two.eml",
        &SIMPLE_EMAIL.replace("<a@x>", "<b@x>").replace("hello", "second"),
    );

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());

    let first = processor(&store, &sink, IngestOptions::default());
    let report = first.process(dir.path(), CancellationToken::new()).await.unwrap();
    assert_eq!(report.imported, 2);
    let job_id = report.job_id;

    write_eml(
        dir.path(),
        "three.eml",
        &SIMPLE_EMAIL.replace("<a@x>", "<c@x>").replace("hello", "third"),
    );

    let resumed = processor(
        &store,
        &sink,
        IngestOptions {
            resume_job_id: Some(job_id),
            ..IngestOptions::default()
        },
    );
    let report = resumed
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.job_id, job_id);
    assert_eq!(report.imported, 3);
    assert_eq!(report.skipped, 0);
    assert_eq!(store.sources.lock().unwrap().len(), 3);

    let jobs = store.jobs.lock().unwrap();
    let entry = jobs.get(&job_id).unwrap();
    assert_eq!(entry.processed, 3);
    assert_eq!(entry.processed_files.len(), 3);
}

#[tokio::test]
async fn concurrent_ingest_matches_sequential_totals() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..12 {
        write_eml(
            dir.path(),
            &format!("mail{}.eml", i),
            &SIMPLE_EMAIL
                .replace("<a@x>", &format!("<m{}@x>", i))
                .replace("hello", &format!("body {}", i)),
        );
    }

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(
        &store,
        &sink,
        IngestOptions {
            concurrency: 4,
            ..IngestOptions::default()
        },
    );

    let report = processor
        .process(dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        (report.total, report.imported, report.skipped, report.failed),
        (12, 12, 0, 0)
    );
    assert_eq!(store.sources.lock().unwrap().len(), 12);
    assert_eq!(sink.on_channel(channels::MANUAL_EMAIL_INGESTED).len(), 12);
}

#[tokio::test]
async fn cancelled_job_skips_remaining_files() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..4 {
        write_eml(
            dir.path(),
            &format!("mail{}.eml", i),
            &SIMPLE_EMAIL.replace("<a@x>", &format!("<m{}@x>", i)),
        );
    }

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let processor = processor(&store, &sink, IngestOptions::default());

    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = processor.process(dir.path(), cancel).await.unwrap();
    assert_eq!(report.status, JobStatus::Cancelled);
    assert_eq!(report.skipped, 4);
    assert_eq!(report.imported, 0);
    assert!(store.sources.lock().unwrap().is_empty());
}

//! Shared progress state for a running ingest job.
//!
//! One tracker is shared by every worker in the pool. State sits behind a
//! readers-writer lock so snapshot reads never block counter updates from
//! other workers. Counters only ever go up, and `processed` always equals
//! `imported + skipped + failed`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Pending => "pending",
            ProgressStatus::Running => "running",
            ProgressStatus::Completed => "completed",
            ProgressStatus::Failed => "failed",
            ProgressStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
struct ProgressState {
    total: usize,
    processed: usize,
    imported: usize,
    skipped: usize,
    failed: usize,
    current_file: String,
    status: ProgressStatus,
    processed_files: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// Immutable view of the tracker with derived timing.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub processed: usize,
    pub imported: usize,
    pub skipped: usize,
    pub failed: usize,
    pub current_file: String,
    pub status: ProgressStatus,
    pub processed_files: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    /// `elapsed / processed * remaining`, present once anything finished.
    pub eta_seconds: Option<f64>,
}

type UpdateCallback = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;

pub struct ProgressTracker {
    state: RwLock<ProgressState>,
    callback: Option<UpdateCallback>,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self::with_callback(total, None)
    }

    pub fn with_callback(total: usize, callback: Option<UpdateCallback>) -> Self {
        Self {
            state: RwLock::new(ProgressState {
                total,
                processed: 0,
                imported: 0,
                skipped: 0,
                failed: 0,
                current_file: String::new(),
                status: ProgressStatus::Pending,
                processed_files: Vec::new(),
                started_at: None,
                updated_at: Utc::now(),
            }),
            callback,
        }
    }

    pub fn start(&self) {
        {
            let mut state = self.state.write();
            state.status = ProgressStatus::Running;
            state.started_at = Some(Utc::now());
            state.updated_at = Utc::now();
        }
        self.notify();
    }

    pub fn set_current_file(&self, file: &str) {
        {
            let mut state = self.state.write();
            state.current_file = file.to_string();
            state.updated_at = Utc::now();
        }
        self.notify();
    }

    pub fn record_imported(&self, file: &str) {
        self.record(file, |state| state.imported += 1);
    }

    pub fn record_skipped(&self, file: &str) {
        self.record(file, |state| state.skipped += 1);
    }

    pub fn record_failed(&self, file: &str) {
        self.record(file, |state| state.failed += 1);
    }

    fn record(&self, file: &str, bump: impl FnOnce(&mut ProgressState)) {
        {
            let mut state = self.state.write();
            bump(&mut state);
            state.processed += 1;
            state.current_file = file.to_string();
            state.processed_files.push(file.to_string());
            state.updated_at = Utc::now();
        }
        self.notify();
    }

    pub fn complete(&self, success: bool) {
        {
            let mut state = self.state.write();
            state.status = if success {
                ProgressStatus::Completed
            } else {
                ProgressStatus::Failed
            };
            state.updated_at = Utc::now();
        }
        self.notify();
    }

    pub fn cancel(&self) {
        {
            let mut state = self.state.write();
            state.status = ProgressStatus::Cancelled;
            state.updated_at = Utc::now();
        }
        self.notify();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.read();
        let elapsed_seconds = state
            .started_at
            .map(|started| (Utc::now() - started).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        let eta_seconds = if state.processed > 0 && state.total >= state.processed {
            let remaining = (state.total - state.processed) as f64;
            Some(elapsed_seconds / state.processed as f64 * remaining)
        } else {
            None
        };

        ProgressSnapshot {
            total: state.total,
            processed: state.processed,
            imported: state.imported,
            skipped: state.skipped,
            failed: state.failed,
            current_file: state.current_file.clone(),
            status: state.status,
            processed_files: state.processed_files.clone(),
            started_at: state.started_at,
            updated_at: state.updated_at,
            elapsed_seconds,
            eta_seconds,
        }
    }

    /// Callback fires off the caller's thread so slow observers never hold
    /// up a worker.
    fn notify(&self) {
        if let Some(callback) = &self.callback {
            let callback = Arc::clone(callback);
            let snapshot = self.snapshot();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { callback(snapshot) });
            } else {
                callback(snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_stay_consistent() {
        let tracker = ProgressTracker::new(4);
        tracker.start();
        tracker.record_imported("a.eml");
        tracker.record_skipped("b.eml");
        tracker.record_failed("c.eml");
        tracker.record_imported("d.eml");

        let snap = tracker.snapshot();
        assert_eq!(snap.processed, 4);
        assert_eq!(snap.imported, 2);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.processed, snap.imported + snap.skipped + snap.failed);
        assert_eq!(
            snap.processed_files,
            vec!["a.eml", "b.eml", "c.eml", "d.eml"]
        );
    }

    #[test]
    fn snapshot_reports_eta_once_processing_starts() {
        let tracker = ProgressTracker::new(10);
        tracker.start();
        assert!(tracker.snapshot().eta_seconds.is_none());

        tracker.record_imported("a.eml");
        let snap = tracker.snapshot();
        let eta = snap.eta_seconds.expect("eta after first file");
        assert!(eta >= 0.0);
    }

    #[test]
    fn terminal_states() {
        let tracker = ProgressTracker::new(1);
        tracker.start();
        tracker.complete(true);
        assert_eq!(tracker.snapshot().status, ProgressStatus::Completed);

        let tracker = ProgressTracker::new(1);
        tracker.start();
        tracker.complete(false);
        assert_eq!(tracker.snapshot().status, ProgressStatus::Failed);

        let tracker = ProgressTracker::new(1);
        tracker.start();
        tracker.cancel();
        assert_eq!(tracker.snapshot().status, ProgressStatus::Cancelled);
    }

    #[tokio::test]
    async fn callback_receives_snapshots() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_cb = Arc::clone(&hits);
        let tracker = ProgressTracker::with_callback(
            2,
            Some(Arc::new(move |_snapshot| {
                hits_in_cb.fetch_add(1, Ordering::SeqCst);
            })),
        );

        tracker.start();
        tracker.record_imported("a.eml");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(hits.load(Ordering::SeqCst) >= 2);
    }
}

//! Sync engine: load checkpoint, scan for new records, materialize them one
//! timestamp group at a time, and advance the checkpoint after each group.
//!
//! A group is the unit of progress. The checkpoint moves to a group's
//! timestamp only after every record in it succeeded, and the next group
//! never starts before that. An interrupted or failed run therefore resumes
//! by redoing at most the group it stopped in.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::download::error::MaterializeError;
use crate::download::Materializer;
use crate::feed::Record;
use crate::scan::{self, ScanError, Scanner};

/// Subset of application config consumed by the sync engine.
/// Decoupled from CLI parsing so the engine can be tested independently.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub(crate) concurrency: usize,
    pub(crate) dry_run: bool,
    pub(crate) no_progress_bar: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            dry_run: false,
            no_progress_bar: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Record {id} created at {created} failed: {source}")]
    Materialize {
        id: String,
        created: i64,
        #[source]
        source: MaterializeError,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl SyncError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SyncError::Scan(_) => 2,
            SyncError::Materialize { .. } | SyncError::Checkpoint(_) => 3,
        }
    }
}

/// What one sync pass accomplished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub records: usize,
    pub files: usize,
    pub groups_committed: usize,
    pub checkpoint: i64,
    pub interrupted: bool,
}

pub struct SyncEngine {
    scanner: Scanner,
    materializer: Materializer,
    checkpoint: Arc<dyn CheckpointStore>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        scanner: Scanner,
        materializer: Materializer,
        checkpoint: Arc<dyn CheckpointStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            scanner,
            materializer,
            checkpoint,
            config,
        }
    }

    /// Run one full pass. Shutdown is honoured between timestamp groups.
    pub async fn run(&self, shutdown_token: CancellationToken) -> Result<SyncSummary, SyncError> {
        let started = Instant::now();
        let checkpoint = self.checkpoint.load().await?;
        tracing::info!(checkpoint, "Scanning for images newer than checkpoint");

        let batch = self.scanner.scan(checkpoint).await?;
        let mut summary = SyncSummary {
            checkpoint,
            ..SyncSummary::default()
        };

        if batch.is_empty() {
            tracing::info!("No new images to download");
            return Ok(summary);
        }

        let total = scan::record_count(&batch);
        tracing::info!(
            "Found {} new records across {} timestamps",
            total,
            batch.len()
        );

        let pb = create_progress_bar(self.config.no_progress_bar, total as u64);

        for (created, records) in &batch {
            if shutdown_token.is_cancelled() {
                pb.suspend(|| tracing::info!("Shutdown requested, stopping before next group"));
                summary.interrupted = true;
                break;
            }

            let files = match self.materialize_group(records, &pb).await {
                Ok(files) => files,
                Err(e) => {
                    pb.finish_and_clear();
                    return Err(e);
                }
            };

            summary.records += records.len();
            summary.files += files;

            if self.config.dry_run {
                continue;
            }
            if let Err(e) = self.checkpoint.advance(*created).await {
                pb.finish_and_clear();
                return Err(e.into());
            }
            summary.checkpoint = *created;
            summary.groups_committed += 1;
        }

        pb.finish_and_clear();
        log_summary(&summary, self.config.dry_run, started.elapsed());
        Ok(summary)
    }

    /// Materialize every record of one timestamp group, returning the number
    /// of files written. Stops starting new records after the first failure
    /// but lets in-flight ones finish.
    async fn materialize_group(
        &self,
        records: &[Record],
        pb: &ProgressBar,
    ) -> Result<usize, SyncError> {
        let failed = AtomicBool::new(false);
        let failed_ref = &failed;

        let mut results = stream::iter(records)
            .take_while(|_| std::future::ready(!failed_ref.load(Ordering::SeqCst)))
            .map(|record| async move { (record, self.materializer.materialize(record).await) })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut files = 0usize;
        let mut first_error = None;
        while let Some((record, result)) = results.next().await {
            pb.inc(1);
            match result {
                Ok(done) => {
                    tracing::debug!(
                        id = %record.id,
                        created = done.created,
                        files = done.files.len(),
                        "record complete"
                    );
                    files += done.files.len();
                }
                Err(source) => {
                    failed.store(true, Ordering::SeqCst);
                    pb.suspend(|| {
                        tracing::error!(
                            "Record {} created at {} failed: {}",
                            record.id,
                            record.created,
                            source
                        )
                    });
                    first_error.get_or_insert(SyncError::Materialize {
                        id: record.id.clone(),
                        created: record.created,
                        source,
                    });
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(files),
        }
    }
}

fn log_summary(summary: &SyncSummary, dry_run: bool, elapsed: Duration) {
    if dry_run {
        tracing::info!("── Dry Run Summary ──");
        tracing::info!("  {} records would be downloaded", summary.records);
        tracing::info!("  checkpoint left at {}", summary.checkpoint);
        return;
    }
    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} records, {} files, {} timestamp groups committed",
        summary.records,
        summary.files,
        summary.groups_committed
    );
    tracing::info!("  checkpoint: {}", summary.checkpoint);
    tracing::info!("  elapsed: {}", format_duration(elapsed));
    if summary.interrupted {
        tracing::info!("  interrupted; remaining records resume on the next run");
    }
}

/// Create a progress bar with a consistent template.
///
/// Returns `ProgressBar::hidden()` when the user passed `--no-progress-bar` or
/// stdout is not a TTY (e.g. piped output, cron jobs).
fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .expect("valid template")
        .progress_chars("=> "),
    );
    pb
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use crate::checkpoint::FileCheckpoint;
    use crate::download::caption::CaptionTagger;
    use crate::download::codec;
    use crate::download::error::FetchError;
    use crate::download::fetch::AssetSource;
    use crate::feed::{FeedError, RecordSource};
    use crate::retry::BackoffConfig;

    fn record(id: &str, created: i64, assets: usize) -> Record {
        Record {
            id: id.to_string(),
            created,
            assets: (0..assets).map(|i| format!("{id}/{i}")).collect(),
            caption: Some(format!("prompt {id}")),
        }
    }

    struct FakeFeed {
        history: Vec<Record>,
        fail: bool,
    }

    impl FakeFeed {
        fn new(mut history: Vec<Record>) -> Self {
            history.sort_by(|a, b| b.created.cmp(&a.created));
            Self {
                history,
                fail: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl RecordSource for FakeFeed {
        async fn page(&self, page: u32, limit: u32) -> Result<Vec<Record>, FeedError> {
            if self.fail {
                return Err(FeedError::HttpStatus { status: 401, page });
            }
            let start = ((page - 1) * limit) as usize;
            Ok(self
                .history
                .iter()
                .skip(start)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeAssets {
        unreachable: Mutex<HashSet<String>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeAssets {
        fn break_location(&self, location: &str) {
            self.unreachable.lock().unwrap().insert(location.to_string());
        }

        fn heal(&self) {
            self.unreachable.lock().unwrap().clear();
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }

        fn requested_records(&self) -> HashSet<String> {
            self.requests()
                .iter()
                .map(|loc| loc.split('/').next().unwrap().to_string())
                .collect()
        }

        fn clear_requests(&self) {
            self.requests.lock().unwrap().clear();
        }
    }

    #[async_trait::async_trait]
    impl AssetSource for FakeAssets {
        async fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
            self.requests.lock().unwrap().push(location.to_string());
            if self.unreachable.lock().unwrap().contains(location) {
                return Err(FetchError::HttpStatus {
                    status: 500,
                    location: location.to_string(),
                });
            }
            Ok(codec::test_png())
        }
    }

    struct NullTagger;

    #[async_trait::async_trait]
    impl CaptionTagger for NullTagger {
        async fn tag(&self, _paths: &[PathBuf], _caption: &str) {}
    }

    /// File checkpoint that records, for every advance, how many asset
    /// requests had been made, and can simulate a crash right after an
    /// advance by cancelling the shutdown token.
    struct RecordingCheckpoint {
        inner: FileCheckpoint,
        assets: Arc<FakeAssets>,
        advances: Mutex<Vec<(i64, HashSet<String>)>>,
        crash_after_advance: Option<CancellationToken>,
    }

    #[async_trait::async_trait]
    impl CheckpointStore for RecordingCheckpoint {
        async fn load(&self) -> Result<i64, CheckpointError> {
            self.inner.load().await
        }

        async fn advance(&self, timestamp: i64) -> Result<(), CheckpointError> {
            self.inner.advance(timestamp).await?;
            self.advances
                .lock()
                .unwrap()
                .push((timestamp, self.assets.requested_records()));
            if let Some(token) = &self.crash_after_advance {
                token.cancel();
            }
            Ok(())
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        assets: Arc<FakeAssets>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                assets: Arc::new(FakeAssets::default()),
            }
        }

        fn checkpoint(
            &self,
            crash_after_advance: Option<CancellationToken>,
        ) -> Arc<RecordingCheckpoint> {
            Arc::new(RecordingCheckpoint {
                inner: FileCheckpoint::new(self.dir.path()),
                assets: self.assets.clone(),
                advances: Mutex::new(Vec::new()),
                crash_after_advance,
            })
        }

        fn engine(
            &self,
            feed: FakeFeed,
            checkpoint: Arc<dyn CheckpointStore>,
            config: SyncConfig,
        ) -> SyncEngine {
            let backoff = BackoffConfig {
                initial_delay: Duration::from_millis(1),
                ceiling: Duration::from_millis(4),
            };
            let materializer = Materializer::new(
                self.assets.clone(),
                Arc::new(NullTagger),
                self.dir.path().to_path_buf(),
                backoff,
            )
            .with_concurrency(config.concurrency)
            .with_dry_run(config.dry_run);
            SyncEngine::new(
                Scanner::new(Arc::new(feed), 2),
                materializer,
                checkpoint,
                config,
            )
        }

        fn images(&self) -> Vec<PathBuf> {
            image_files(self.dir.path())
        }

        async fn persisted_checkpoint(&self) -> i64 {
            FileCheckpoint::new(self.dir.path()).load().await.unwrap()
        }
    }

    fn image_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "png"))
            .collect();
        files.sort();
        files
    }

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_two_groups_commit_in_order_after_all_records() {
        let h = Harness::new();
        let feed = FakeFeed::new(vec![
            record("a", 100, 2),
            record("b", 100, 1),
            record("c", 200, 3),
        ]);
        let cp = h.checkpoint(None);
        let engine = h.engine(feed, cp.clone(), SyncConfig::default());

        let summary = engine.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            summary,
            SyncSummary {
                records: 3,
                files: 6,
                groups_committed: 2,
                checkpoint: 200,
                interrupted: false,
            }
        );
        assert_eq!(h.images().len(), 6);
        assert_eq!(h.persisted_checkpoint().await, 200);

        let advances = cp.advances.lock().unwrap();
        assert_eq!(advances.len(), 2);
        // 100 is committed once a and b are done, before c starts.
        assert_eq!(advances[0], (100, set(&["a", "b"])));
        assert_eq!(advances[1], (200, set(&["a", "b", "c"])));
    }

    #[tokio::test]
    async fn test_failure_in_later_group_keeps_earlier_checkpoint() {
        let h = Harness::new();
        h.assets.break_location("c/1");
        let feed = FakeFeed::new(vec![
            record("a", 100, 1),
            record("b", 100, 1),
            record("c", 200, 3),
        ]);
        let engine = h.engine(feed, h.checkpoint(None), SyncConfig::default());

        let err = engine.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, SyncError::Materialize { created: 200, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(h.persisted_checkpoint().await, 100);
        // a and b survive; nothing of c remains.
        assert_eq!(h.images().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_inside_group_does_not_advance_that_group() {
        let h = Harness::new();
        h.assets.break_location("b/0");
        let feed = FakeFeed::new(vec![
            record("a", 100, 1),
            record("b", 100, 1),
            record("c", 200, 1),
        ]);
        let cp = h.checkpoint(None);
        let engine = h.engine(feed, cp.clone(), SyncConfig::default());

        assert!(engine.run(CancellationToken::new()).await.is_err());
        assert_eq!(h.persisted_checkpoint().await, 0);
        assert!(cp.advances.lock().unwrap().is_empty());
        assert!(!h.assets.requested_records().contains("c"));
    }

    #[tokio::test]
    async fn test_resume_after_crash_skips_committed_group() {
        let h = Harness::new();
        let history = vec![
            record("a", 100, 1),
            record("b", 100, 1),
            record("c", 200, 2),
            record("d", 300, 1),
        ];

        // First run "crashes" right after committing group 100.
        let crash = CancellationToken::new();
        let engine = h.engine(
            FakeFeed::new(history.clone()),
            h.checkpoint(Some(crash.clone())),
            SyncConfig::default(),
        );
        let first = engine.run(crash).await.unwrap();
        assert!(first.interrupted);
        assert_eq!(first.groups_committed, 1);
        assert_eq!(h.persisted_checkpoint().await, 100);
        assert_eq!(h.assets.requested_records(), set(&["a", "b"]));

        // Second run picks up at 200 and never touches a or b again.
        h.assets.clear_requests();
        let engine = h.engine(FakeFeed::new(history), h.checkpoint(None), SyncConfig::default());
        let second = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(second.records, 2);
        assert_eq!(second.checkpoint, 300);
        let mut requests = h.assets.requests();
        requests.sort();
        assert_eq!(requests, vec!["c/0", "c/1", "d/0"]);
        assert_eq!(h.images().len(), 5);
    }

    #[tokio::test]
    async fn test_rerun_after_failure_redoes_only_failed_group() {
        let h = Harness::new();
        let history = vec![record("a", 100, 1), record("b", 200, 2)];
        h.assets.break_location("b/1");

        let engine = h.engine(
            FakeFeed::new(history.clone()),
            h.checkpoint(None),
            SyncConfig::default(),
        );
        assert!(engine.run(CancellationToken::new()).await.is_err());
        assert_eq!(h.persisted_checkpoint().await, 100);

        h.assets.heal();
        h.assets.clear_requests();
        let engine = h.engine(FakeFeed::new(history), h.checkpoint(None), SyncConfig::default());
        let summary = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.checkpoint, 200);
        assert_eq!(h.assets.requested_records(), set(&["b"]));
        assert_eq!(h.images().len(), 3);
    }

    #[tokio::test]
    async fn test_nothing_new_leaves_checkpoint() {
        let h = Harness::new();
        FileCheckpoint::new(h.dir.path()).advance(500).await.unwrap();
        let feed = FakeFeed::new(vec![record("a", 500, 1), record("b", 400, 1)]);
        let engine = h.engine(feed, h.checkpoint(None), SyncConfig::default());

        let summary = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.records, 0);
        assert_eq!(summary.checkpoint, 500);
        assert!(h.assets.requests().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_leaves_checkpoint_untouched() {
        let h = Harness::new();
        FileCheckpoint::new(h.dir.path()).advance(50).await.unwrap();
        let mut feed = FakeFeed::new(vec![record("a", 100, 1)]);
        feed.fail = true;
        let engine = h.engine(feed, h.checkpoint(None), SyncConfig::default());

        let err = engine.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Scan(_)));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(h.persisted_checkpoint().await, 50);
        assert!(h.assets.requests().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic_across_runs() {
        let h = Harness::new();
        let mut history = vec![record("a", 100, 1)];
        let mut seen = Vec::new();
        for next in [200, 300, 400] {
            let engine = h.engine(
                FakeFeed::new(history.clone()),
                h.checkpoint(None),
                SyncConfig::default(),
            );
            engine.run(CancellationToken::new()).await.unwrap();
            seen.push(h.persisted_checkpoint().await);
            history.push(record(&format!("r{next}"), next, 1));
        }
        assert_eq!(seen, vec![100, 200, 300]);
    }

    #[tokio::test]
    async fn test_concurrent_records_in_group() {
        let h = Harness::new();
        let feed = FakeFeed::new(
            (0..6)
                .map(|i| record(&format!("r{i}"), 100 + i / 3, 2))
                .collect(),
        );
        let config = SyncConfig {
            concurrency: 3,
            ..SyncConfig::default()
        };
        let cp = h.checkpoint(None);
        let engine = h.engine(feed, cp.clone(), config);

        let summary = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.files, 12);
        assert_eq!(summary.checkpoint, 101);
        let advances = cp.advances.lock().unwrap();
        assert_eq!(advances[0], (100, set(&["r0", "r1", "r2"])));
    }

    #[tokio::test]
    async fn test_dry_run_downloads_and_commits_nothing() {
        let h = Harness::new();
        let feed = FakeFeed::new(vec![record("a", 100, 2), record("b", 200, 1)]);
        let config = SyncConfig {
            dry_run: true,
            ..SyncConfig::default()
        };
        let engine = h.engine(feed, h.checkpoint(None), config);

        let summary = engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.groups_committed, 0);
        assert_eq!(h.persisted_checkpoint().await, 0);
        assert!(h.images().is_empty());
        assert!(h.assets.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_does_nothing() {
        let h = Harness::new();
        let feed = FakeFeed::new(vec![record("a", 100, 1)]);
        let engine = h.engine(feed, h.checkpoint(None), SyncConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let summary = engine.run(token).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.records, 0);
        assert!(h.images().is_empty());
    }

    #[test]
    fn test_format_duration_seconds_only() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(59)), "59s");
    }

    #[test]
    fn test_format_duration_minutes_and_seconds() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m 00s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
    }

    #[test]
    fn test_format_duration_hours() {
        assert_eq!(format_duration(Duration::from_secs(3661)), "1h 01m 01s");
    }

    #[test]
    fn test_create_progress_bar_hidden_when_disabled() {
        let pb = create_progress_bar(true, 100);
        assert!(pb.is_hidden());
    }
}

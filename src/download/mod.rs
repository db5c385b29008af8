//! Item materializer: turns one history record into image files on disk.
//!
//! Every asset of a record is fetched with backoff, decoded, re-encoded as an
//! optimized PNG under a unique name, captioned, and stamped with the
//! record's creation time. A record is all or nothing: if any asset fails,
//! every file already written for that record is removed before the error
//! is returned.

pub mod caption;
pub mod codec;
pub mod error;
pub mod fetch;
pub mod paths;

use std::fs::FileTimes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{self, StreamExt};

use crate::feed::Record;
use crate::retry::BackoffConfig;

use caption::CaptionTagger;
use error::MaterializeError;
use fetch::AssetSource;

/// Files written for one record. `created` is the checkpoint candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedRecord {
    pub created: i64,
    pub files: Vec<PathBuf>,
}

pub struct Materializer {
    assets: Arc<dyn AssetSource>,
    tagger: Arc<dyn CaptionTagger>,
    directory: PathBuf,
    backoff: BackoffConfig,
    concurrency: usize,
    dry_run: bool,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("directory", &self.directory)
            .field("backoff", &self.backoff)
            .field("concurrency", &self.concurrency)
            .field("dry_run", &self.dry_run)
            .finish_non_exhaustive()
    }
}

impl Materializer {
    pub fn new(
        assets: Arc<dyn AssetSource>,
        tagger: Arc<dyn CaptionTagger>,
        directory: PathBuf,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            assets,
            tagger,
            directory,
            backoff,
            concurrency: 1,
            dry_run: false,
        }
    }

    /// Fetch up to `concurrency` assets of a record at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Materialize every asset of `record`.
    pub async fn materialize(
        &self,
        record: &Record,
    ) -> Result<MaterializedRecord, MaterializeError> {
        let prefix = paths::filename_prefix(record.created);

        if self.dry_run {
            for location in &record.assets {
                tracing::info!("[DRY RUN] Would download {}", location);
            }
            return Ok(MaterializedRecord {
                created: record.created,
                files: Vec::new(),
            });
        }

        let fileset = self.write_assets(record, &prefix).await?;

        if let Some(caption) = &record.caption {
            self.tagger.tag(&fileset, caption).await;
        }

        stamp_times(&fileset, record.created).await;

        tracing::debug!(id = %record.id, files = fileset.len(), "record materialized");
        Ok(MaterializedRecord {
            created: record.created,
            files: fileset,
        })
    }

    /// Fetch and save all assets, rolling back on the first failure.
    ///
    /// The returned paths follow the record's asset order. In-flight assets are always drained before rolling back so that no
    /// save can land after the cleanup; no new asset starts once one failed.
    async fn write_assets(
        &self,
        record: &Record,
        prefix: &str,
    ) -> Result<Vec<PathBuf>, MaterializeError> {
        let failed = AtomicBool::new(false);
        let failed_ref = &failed;

        let mut results = stream::iter(record.assets.iter())
            .take_while(|_| std::future::ready(!failed_ref.load(Ordering::SeqCst)))
            .map(|location| self.write_asset(location, prefix))
            .buffered(self.concurrency);

        let mut fileset = Vec::with_capacity(record.assets.len());
        let mut first_error = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(path) => fileset.push(path),
                Err(e) => {
                    failed.store(true, Ordering::SeqCst);
                    first_error.get_or_insert(e);
                }
            }
        }
        drop(results);

        match first_error {
            None => Ok(fileset),
            Some(e) => {
                tracing::error!("Scraping aborted with error \"{}\"", e);
                rollback(&fileset).await;
                Err(e)
            }
        }
    }

    async fn write_asset(
        &self,
        location: &str,
        prefix: &str,
    ) -> Result<PathBuf, MaterializeError> {
        tracing::debug!("Requesting image {}", location);
        let bytes = fetch::fetch_with_backoff(self.assets.as_ref(), location, &self.backoff)
            .await
            .map_err(|source| MaterializeError::Fetch {
                location: location.to_string(),
                attempts: self.backoff.max_attempts(),
                source,
            })?;

        let path = paths::unique_asset_path(&self.directory, prefix);
        tracing::debug!("Saving as {}", path.display());

        let location = location.to_string();
        let save_path = path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MaterializeError> {
            let decoded = codec::decode(&location, &bytes)?;
            if let Err(e) = codec::save_optimized_png(&decoded, &save_path) {
                // Not yet in the fileset, so clean up the partial file here.
                let _ = std::fs::remove_file(&save_path);
                return Err(e);
            }
            Ok(())
        })
        .await??;

        Ok(path)
    }
}

/// Stamp every file with the record's creation time. Failures only warn:
/// the files are complete, so the record still counts as materialized.
async fn stamp_times(fileset: &[PathBuf], created: i64) {
    let paths = fileset.to_vec();
    let stamped = tokio::task::spawn_blocking(move || {
        paths
            .into_iter()
            .filter_map(|path| set_file_mtime(&path, created).err().map(|e| (path, e)))
            .collect::<Vec<_>>()
    })
    .await;

    match stamped {
        Ok(failures) => {
            for (path, e) in failures {
                tracing::warn!("Could not set mtime on {}: {}", path.display(), e);
            }
        }
        Err(e) => tracing::warn!("mtime task failed, leaving file times unset: {}", e),
    }
}

/// Remove every file written for a failed record.
async fn rollback(fileset: &[PathBuf]) {
    if fileset.is_empty() {
        return;
    }
    tracing::info!("Removing {} files: {:?}", fileset.len(), fileset);
    for path in fileset {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Could not remove {}: {}", path.display(), e);
            }
        }
    }
}

/// Set the modification and access times of a file to the given Unix
/// timestamp.
///
/// Handles negative timestamps (dates before 1970) by counting back from
/// the Unix epoch.
fn set_file_mtime(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let time = if timestamp >= 0 {
        UNIX_EPOCH + Duration::from_secs(timestamp as u64)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(timestamp.unsigned_abs()))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    };
    let times = FileTimes::new().set_modified(time).set_accessed(time);
    let file = std::fs::File::options().write(true).open(path)?;
    file.set_times(times)?;
    Ok(())
}

//! Checkpoint persistence.
//!
//! The checkpoint is the creation time of the newest timestamp group that
//! was fully materialized. It is stored as a human-readable integer in
//! `<directory>/.timestamp` and only ever moves forward.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use thiserror::Error;

/// Checkpoint file name inside the destination directory.
pub const CHECKPOINT_FILE: &str = ".timestamp";

/// Advisory lock file held while a sync runs against a directory.
pub const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Checkpoint file {} does not hold a timestamp: {content:?}", .path.display())]
    Corrupt { path: PathBuf, content: String },

    #[error("Refusing to move checkpoint backwards from {current} to {requested}")]
    Regression { current: i64, requested: i64 },

    #[error("Another dallepd-rs instance is syncing {} (lock: {})", .directory.display(), .lock_path.display())]
    Locked {
        directory: PathBuf,
        lock_path: PathBuf,
    },

    #[error("Checkpoint task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Load/advance interface over the persisted checkpoint.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The persisted checkpoint, or 0 when none was ever written.
    async fn load(&self) -> Result<i64, CheckpointError>;

    /// Durably replace the checkpoint with `timestamp`.
    ///
    /// Callers advance only after every record created at `timestamp` was
    /// materialized.
    async fn advance(&self, timestamp: i64) -> Result<(), CheckpointError>;
}

/// Checkpoint stored in a file inside the destination directory.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(directory: &Path) -> Self {
        Self {
            path: directory.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the persisted checkpoint. Returns whether a file was removed.
    pub async fn reset(&self) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CheckpointError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn io_err(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Parse the first line of a checkpoint file.
fn parse_checkpoint(path: &Path, content: &str) -> Result<i64, CheckpointError> {
    let first = content.lines().next().unwrap_or("").trim();
    first.parse::<i64>().map_err(|_| CheckpointError::Corrupt {
        path: path.to_path_buf(),
        content: first.to_string(),
    })
}

/// Write `timestamp` to a sibling temp file, fsync it, then rename it over
/// `path` so readers only ever see the old or the new value.
fn write_atomically(path: &Path, timestamp: i64) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        writeln!(file, "{}", timestamp)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpoint {
    async fn load(&self) -> Result<i64, CheckpointError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => parse_checkpoint(&self.path, &content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn advance(&self, timestamp: i64) -> Result<(), CheckpointError> {
        let current = self.load().await?;
        if timestamp < current {
            return Err(CheckpointError::Regression {
                current,
                requested: timestamp,
            });
        }
        if timestamp == current {
            tracing::debug!(timestamp, "checkpoint already at timestamp");
            return Ok(());
        }

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, timestamp))
            .await?
            .map_err(|e| self.io_err(e))?;
        tracing::debug!(timestamp, path = %self.path.display(), "checkpoint advanced");
        Ok(())
    }
}

/// Exclusive advisory lock on a destination directory, held for the
/// lifetime of the value.
#[derive(Debug)]
pub struct DirectoryLock {
    _file: std::fs::File,
    path: PathBuf,
}

impl DirectoryLock {
    pub fn acquire(directory: &Path) -> Result<Self, CheckpointError> {
        let lock_path = directory.join(LOCK_FILE);
        let file = std::fs::File::create(&lock_path).map_err(|source| CheckpointError::Io {
            path: lock_path.clone(),
            source,
        })?;
        file.try_lock_exclusive()
            .map_err(|_| CheckpointError::Locked {
                directory: directory.to_path_buf(),
                lock_path: lock_path.clone(),
            })?;
        tracing::debug!("Acquired lock {}", lock_path.display());
        Ok(Self {
            _file: file,
            path: lock_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

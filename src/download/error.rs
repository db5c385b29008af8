use std::path::PathBuf;

use thiserror::Error;

/// Transport failure fetching one asset. Every variant is treated as
/// transient by the backoff fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error {status} fetching {location}")]
    HttpStatus { status: u16, location: String },

    #[error("HTTP error fetching {location}: {source}")]
    Http {
        location: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Failure materializing one record. Any of these rolls back the files
/// already written for that record.
#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("Giving up on {location} after {attempts} attempts: {source}")]
    Fetch {
        location: String,
        attempts: usize,
        #[source]
        source: FetchError,
    },

    /// Not retried: fetching the same bytes again will not fix them.
    #[error("Cannot decode image from {location}: {source}")]
    Decode {
        location: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Failed to save {}: {source}", .path.display())]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("Image task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

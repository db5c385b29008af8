use thiserror::Error;

/// Failures while listing the task history.
///
/// None of these are retried: a page that cannot be read aborts the scan.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("HTTP error {status} listing history page {page}")]
    HttpStatus { status: u16, page: u32 },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("Malformed history page: {0}")]
    Json(#[from] serde_json::Error),
}

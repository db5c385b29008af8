//! Task history feed: the remote, paginated, newest-first list of image
//! generation records.

mod client;
pub mod error;
pub(crate) mod record;

pub use client::LabsClient;
pub use error::FeedError;
pub use record::Record;

/// A source of history pages.
///
/// Pages are numbered from 1 and continue a single stream sorted newest
/// first. An empty page means the end of history.
#[async_trait::async_trait]
pub trait RecordSource: Send + Sync {
    async fn page(&self, page: u32, limit: u32) -> Result<Vec<Record>, FeedError>;
}

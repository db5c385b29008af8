//! Incremental history scan.
//!
//! Walks the history newest first and collects every record created after
//! the checkpoint. The record that stops the scan (created at or before the
//! checkpoint) is excluded: a checkpoint is only ever written once all
//! records sharing its timestamp were materialized.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::feed::{FeedError, Record, RecordSource};

/// New records keyed by creation time. Iterates oldest first.
pub type Batch = BTreeMap<i64, Vec<Record>>;

/// How one history page relates to the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    /// Every record on the page is new; keep paging.
    Continue(Vec<Record>),
    /// The page was empty: there is no older history.
    EndOfHistory,
    /// A record at or before the checkpoint was found. Carries the new
    /// records that preceded it on the page.
    ReachedCheckpoint(Vec<Record>),
}

/// Classify a page against the checkpoint.
pub fn classify_page(records: Vec<Record>, checkpoint: i64) -> PageOutcome {
    if records.is_empty() {
        return PageOutcome::EndOfHistory;
    }
    let mut newer = Vec::with_capacity(records.len());
    for record in records {
        if record.created <= checkpoint {
            return PageOutcome::ReachedCheckpoint(newer);
        }
        newer.push(record);
    }
    PageOutcome::Continue(newer)
}

/// A history page could not be read. The partial scan is discarded.
#[derive(Debug, Error)]
#[error("Indexing aborted on history page {page}: {source}")]
pub struct ScanError {
    pub page: u32,
    #[source]
    pub source: FeedError,
}

/// Number of records across all timestamp groups.
pub fn record_count(batch: &Batch) -> usize {
    batch.values().map(Vec::len).sum()
}

pub struct Scanner {
    source: Arc<dyn RecordSource>,
    page_size: u32,
}

impl Scanner {
    pub fn new(source: Arc<dyn RecordSource>, page_size: u32) -> Self {
        Self { source, page_size }
    }

    /// Collect every record newer than `checkpoint`, starting from page 1.
    ///
    /// Page requests are not retried; any failure aborts the whole scan,
    /// since resuming relies on a contiguous walk down to the checkpoint.
    pub async fn scan(&self, checkpoint: i64) -> Result<Batch, ScanError> {
        let mut batch = Batch::new();
        let mut page: u32 = 1;

        loop {
            tracing::info!("Requesting history page {}", page);
            let records = self
                .source
                .page(page, self.page_size)
                .await
                .map_err(|source| ScanError { page, source })?;
            tracing::debug!(page, records = records.len(), "history page received");

            match classify_page(records, checkpoint) {
                PageOutcome::Continue(records) => insert_all(&mut batch, records),
                PageOutcome::ReachedCheckpoint(records) => {
                    insert_all(&mut batch, records);
                    tracing::debug!(page, checkpoint, "reached checkpoint");
                    return Ok(batch);
                }
                PageOutcome::EndOfHistory => {
                    tracing::debug!(page, "reached end of history");
                    return Ok(batch);
                }
            }

            page += 1;
        }
    }
}

fn insert_all(batch: &mut Batch, records: Vec<Record>) {
    for record in records {
        batch.entry(record.created).or_default().push(record);
    }
}

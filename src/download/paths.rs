use std::path::{Path, PathBuf};

use chrono::{Local, TimeZone};
use uuid::Uuid;

/// Extension of every materialized asset; images are re-encoded as PNG.
pub const ASSET_EXTENSION: &str = "png";

/// Human-readable filename prefix for a creation time, in local time:
/// `2022-11-21-04-06`. Falls back to the raw seconds for times chrono
/// cannot represent.
pub fn filename_prefix(created: i64) -> String {
    match Local.timestamp_opt(created, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d-%H-%M").to_string(),
        None => created.to_string(),
    }
}

/// A fresh, collision-free path for one asset: `{prefix}-{uuid}.png`.
///
/// Records sharing a minute share a prefix; the random suffix keeps
/// re-runs of an interrupted group from overwriting earlier files.
pub fn unique_asset_path(directory: &Path, prefix: &str) -> PathBuf {
    directory.join(format!("{}-{}.{}", prefix, Uuid::new_v4(), ASSET_EXTENSION))
}

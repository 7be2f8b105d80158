//! COG generation pipeline: four operations run through the workflow engine,
//! driven by a retrying background job queue.
//!
//! Operations exchange derived artifacts through named context keys:
//! `download` writes [`SOURCE_PATH_KEY`], `generate_cog` writes
//! [`COG_PATH_KEY`] and [`TILESET_METADATA_KEY`], and `upload` /
//! `update_tileset` read them when their payload leaves a field out.

mod jobs;
pub mod operations;
pub mod uri;

pub use jobs::{
    DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, JobDeps, JobQueue, JobRunner,
    RetryPolicy, TaskQueue, run_cog_job,
};
pub use operations::{Download, GenerateCog, Upload, UpdateTileSet};
pub use uri::Location;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::notify::Notifier;
use crate::raster::MAX_ZOOM;
use crate::storage::ObjectStorage;
use crate::store::Store;
use crate::workflow::Workflow;

pub const COG_WORKFLOW: &str = "cog_workflow";

/// Context key holding the local path of the downloaded source.
pub const SOURCE_PATH_KEY: &str = "source_path";
/// Context key holding the local path of the generated COG.
pub const COG_PATH_KEY: &str = "cog_path";
/// Context key holding [`TileSetMetadata`].
pub const TILESET_METADATA_KEY: &str = "tileset_metadata";

/// Maximum stored length of a failed run's error message.
pub const MAX_ERROR_MESSAGE_LEN: usize = 2000;

/// Values derived from a generated COG for its tile set record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSetMetadata {
    pub file_size: u64,
    /// `[west, south, east, north]` in EPSG:4326.
    pub bounds: Option<[f64; 4]>,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

impl Default for TileSetMetadata {
    fn default() -> Self {
        Self {
            file_size: 0,
            bounds: None,
            min_zoom: 0,
            max_zoom: MAX_ZOOM,
        }
    }
}

/// Storage key of the processed COG for a tile set.
///
/// Retries of the same tile set write to the same key, replacing any object a
/// failed attempt left behind.
pub fn processed_key(tileset_id: &str) -> String {
    format!("tilesets/{tileset_id}/processed.tif")
}

/// `download → generate_cog → upload → update_tileset`.
pub fn cog_workflow(
    storage: Arc<dyn ObjectStorage>,
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
) -> Workflow {
    Workflow::new(COG_WORKFLOW)
        .then(Download::new(storage.clone()))
        .then(GenerateCog)
        .then(Upload::new(storage))
        .then(UpdateTileSet::new(store, notifier))
}

/// Truncates to at most `max` characters without splitting a character.
pub(crate) fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdef", 3), "abc");
        assert_eq!(truncate_message("ééé", 2), "éé");
        assert_eq!(truncate_message(&"x".repeat(5000), MAX_ERROR_MESSAGE_LEN).len(), 2000);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta = TileSetMetadata::default();
        assert_eq!((meta.file_size, meta.min_zoom, meta.max_zoom), (0, 0, 22));
        assert!(meta.bounds.is_none());
    }
}

//! Dataset ingestion: direct uploads, multipart orchestration, and the
//! hand-off of uploaded rasters to background COG generation.

mod datasets;
mod multipart;

pub use datasets::{DatasetService, NewDataset, NodeUpdate};
pub use multipart::{MultipartInit, MultipartInitResponse, MultipartUploadService};

use chrono::Utc;

use crate::error::Result;
use crate::pipeline::TaskQueue;
use crate::store::Store;
use crate::types::{Dataset, DatasetStatus, DatasetType, FileFormat};

/// Extension of `file_name`, if it has one.
pub fn file_extension(file_name: &str) -> Option<&str> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty())
}

/// `datasets/{dataset_id}/file.{ext}`, or `datasets/{dataset_id}/file` without
/// an extension.
pub fn dataset_storage_key(dataset_id: &str, file_name: &str) -> String {
    match file_extension(file_name) {
        Some(ext) => format!("datasets/{dataset_id}/file.{}", ext.to_ascii_lowercase()),
        None => format!("datasets/{dataset_id}/file"),
    }
}

/// Records a durable upload and queues COG generation for rasters.
///
/// A failed enqueue is logged; the dataset stays uploaded and its tile set can
/// be regenerated later.
pub(crate) fn finish_upload(
    store: &dyn Store,
    queue: &dyn TaskQueue,
    dataset: &mut Dataset,
    file_size: u64,
) -> Result<()> {
    dataset.file_size = i64::try_from(file_size).unwrap_or(i64::MAX);
    dataset.status = DatasetStatus::Uploaded;
    dataset.updated_at = Utc::now();
    store.update_dataset(dataset)?;

    if dataset.dataset_type == DatasetType::Raster {
        if let Err(e) = queue.enqueue(&dataset.id) {
            tracing::error!(dataset_id = %dataset.id, "Failed to enqueue COG job: {e}");
        }
    }
    Ok(())
}

/// Format detected from a file name, or `None` for unknown extensions.
pub fn detect_format(file_name: &str) -> Option<FileFormat> {
    file_extension(file_name).and_then(FileFormat::from_extension)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_storage_key() {
        assert_eq!(
            dataset_storage_key("d1", "Ortho.TIF"),
            "datasets/d1/file.tif"
        );
        assert_eq!(dataset_storage_key("d1", "README"), "datasets/d1/file");
        assert_eq!(dataset_storage_key("d1", "trailing."), "datasets/d1/file");
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("roads.geojson"), Some(FileFormat::Geojson));
        assert_eq!(detect_format("dem.tiff"), Some(FileFormat::Geotiff));
        assert_eq!(detect_format("notes.docx"), None);
        assert_eq!(detect_format("noext"), None);
    }
}

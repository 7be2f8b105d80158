use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{dataset_storage_key, detect_format, finish_upload};
use crate::error::{Error, Result};
use crate::pipeline::TaskQueue;
use crate::storage::{CompletedPart, ObjectMetadata, ObjectStorage, PresignMethod};
use crate::store::Store;
use crate::store::name::normalize_name;
use crate::types::{
    Dataset, DatasetMetadata, DatasetStatus, DatasetType, FileFormat, Node, NodeKind,
};

#[derive(Debug, Clone, Deserialize)]
pub struct MultipartInit {
    pub name: String,
    #[serde(default, alias = "parent_id")]
    pub parent: Option<String>,
    #[serde(default)]
    pub dataset_type: Option<DatasetType>,
    #[serde(default)]
    pub metadata: DatasetMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultipartInitResponse {
    pub upload_id: String,
    pub key: String,
    pub dataset_id: String,
    pub node_id: String,
}

/// Drives large uploads: the client pushes parts straight to storage through
/// presigned URLs and this service tracks the dataset around them.
pub struct MultipartUploadService {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn TaskQueue>,
}

impl MultipartUploadService {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn ObjectStorage>,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            store,
            storage,
            queue,
        }
    }

    pub fn init(&self, owner_id: &str, req: MultipartInit) -> Result<MultipartInitResponse> {
        let name = normalize_name(&req.name)?;
        let format = match (detect_format(&name), req.dataset_type) {
            (Some(format), _) => format,
            (None, Some(_)) => FileFormat::Bin,
            (None, None) => FileFormat::Geotiff,
        };
        let dataset_type = req.dataset_type.unwrap_or_else(|| format.dataset_type());

        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            parent_id: req.parent,
            kind: NodeKind::Dataset,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let dataset_id = Uuid::new_v4().to_string();
        let dataset = Dataset {
            storage_key: dataset_storage_key(&dataset_id, &name),
            id: dataset_id,
            node_id: node.id.clone(),
            dataset_type,
            format,
            file_name: name,
            file_size: 0,
            metadata: req.metadata,
            status: DatasetStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store.create_dataset_node(&node, &dataset)?;

        let mut object_meta = ObjectMetadata::new();
        object_meta.insert("dataset_id".to_string(), dataset.id.clone());
        object_meta.insert("original_filename".to_string(), dataset.file_name.clone());

        let upload_id = match self.storage.create_multipart_upload(
            &dataset.storage_key,
            dataset.metadata.content_type.as_deref(),
            &object_meta,
        ) {
            Ok(upload_id) => upload_id,
            Err(e) => {
                tracing::error!(dataset_id = %dataset.id, "failed to open multipart upload: {e}");
                if let Err(cleanup) = self.store.delete_node(&node.id) {
                    tracing::error!(node_id = %node.id, "failed to remove dataset rows: {cleanup}");
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            dataset_id = %dataset.id,
            upload_id = %upload_id,
            "multipart upload started"
        );
        Ok(MultipartInitResponse {
            upload_id,
            key: dataset.storage_key,
            dataset_id: dataset.id,
            node_id: node.id,
        })
    }

    pub fn sign(&self, upload_id: &str, key: &str, part_number: u32) -> Result<String> {
        if part_number == 0 {
            return Err(Error::validation("part_number must be at least 1"));
        }
        Ok(self.storage.generate_presigned_url(
            key,
            Some(upload_id),
            Some(part_number),
            PresignMethod::Put,
        )?)
    }

    pub fn complete(
        &self,
        upload_id: &str,
        key: &str,
        mut parts: Vec<CompletedPart>,
    ) -> Result<Dataset> {
        if parts.is_empty() {
            return Err(Error::validation("parts cannot be empty"));
        }
        parts.sort_by_key(|part| part.part_number);
        self.storage
            .complete_multipart_upload(key, upload_id, &parts)?;

        let mut dataset = self
            .store
            .get_dataset_by_storage_key(key)?
            .ok_or_else(|| Error::not_found(format!("Dataset not found for key: {key}")))?;
        let info = self.storage.get_object_info(key)?;
        finish_upload(self.store.as_ref(), self.queue.as_ref(), &mut dataset, info.size)?;

        tracing::info!(dataset_id = %dataset.id, size = info.size, "multipart upload completed");
        Ok(dataset)
    }

    pub fn abort(&self, upload_id: &str, key: &str) -> Result<()> {
        self.storage.abort_multipart_upload(key, upload_id)?;

        if let Some(mut dataset) = self.store.get_dataset_by_storage_key(key)? {
            dataset.status = DatasetStatus::Failed;
            self.store.update_dataset(&dataset)?;
            self.store.delete_node(&dataset.node_id)?;
            tracing::info!(dataset_id = %dataset.id, "multipart upload aborted");
        }
        Ok(())
    }
}

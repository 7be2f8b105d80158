use std::io::Read;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::{dataset_storage_key, detect_format, finish_upload};
use crate::error::{Error, Result};
use crate::pipeline::TaskQueue;
use crate::storage::{ObjectMetadata, ObjectStorage};
use crate::store::Store;
use crate::store::name::normalize_name;
use crate::types::{
    Dataset, DatasetMetadata, DatasetStatus, DatasetType, Node, NodeKind, NodeWithDataset,
    TileSet, TileSetStatus,
};

/// A dataset to be created from a single uploaded file.
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub name: String,
    pub parent_id: Option<String>,
    pub dataset_type: Option<DatasetType>,
    pub metadata: DatasetMetadata,
    pub file_name: String,
}

/// Requested node changes. `parent_id: Some(None)` moves the node to the root.
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub parent_id: Option<Option<String>>,
}

/// Node tree and dataset lifecycle on top of the store and object storage.
pub struct DatasetService {
    store: Arc<dyn Store>,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn TaskQueue>,
}

impl DatasetService {
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

    pub fn create_folder(
        &self,
        owner_id: &str,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<Node> {
        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            name: normalize_name(name)?,
            parent_id: parent_id.map(str::to_string),
            kind: NodeKind::Folder,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_node(&node)?;
        tracing::info!(node_id = %node.id, owner_id, "created folder");
        Ok(node)
    }

    /// Creates the dataset node, stores the file, and marks the dataset
    /// uploaded. A failed upload leaves the dataset in `failed`.
    pub fn create_dataset(
        &self,
        owner_id: &str,
        new: NewDataset,
        reader: &mut dyn Read,
    ) -> Result<NodeWithDataset> {
        let name = normalize_name(&new.name)?;
        let format = detect_format(&new.file_name).ok_or_else(|| {
            Error::validation(format!("unsupported file type: {}", new.file_name))
        })?;

        let now = Utc::now();
        let node = Node {
            id: Uuid::new_v4().to_string(),
            name,
            parent_id: new.parent_id,
            kind: NodeKind::Dataset,
            owner_id: owner_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        let dataset_id = Uuid::new_v4().to_string();
        let mut dataset = Dataset {
            storage_key: dataset_storage_key(&dataset_id, &new.file_name),
            id: dataset_id,
            node_id: node.id.clone(),
            dataset_type: new.dataset_type.unwrap_or_else(|| format.dataset_type()),
            format,
            file_name: new.file_name,
            file_size: 0,
            metadata: new.metadata,
            status: DatasetStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.store.create_dataset_node(&node, &dataset)?;

        let mut object_meta = ObjectMetadata::new();
        object_meta.insert("dataset_id".to_string(), dataset.id.clone());
        object_meta.insert("original_filename".to_string(), dataset.file_name.clone());
        if let Some(content_type) = &dataset.metadata.content_type {
            object_meta.insert("content-type".to_string(), content_type.clone());
        }

        match self
            .storage
            .upload_object(reader, &dataset.storage_key, &object_meta)
        {
            Ok(info) => {
                finish_upload(self.store.as_ref(), self.queue.as_ref(), &mut dataset, info.size)?;
                tracing::info!(dataset_id = %dataset.id, size = info.size, "stored dataset file");
            }
            Err(e) => {
                tracing::error!(dataset_id = %dataset.id, "dataset upload failed: {e}");
                dataset.status = DatasetStatus::Failed;
                self.store.update_dataset(&dataset)?;
                return Err(e.into());
            }
        }

        Ok(NodeWithDataset {
            node,
            dataset: Some(dataset),
        })
    }

    pub fn get_node(&self, id: &str) -> Result<NodeWithDataset> {
        let node = self
            .store
            .get_node(id)?
            .ok_or_else(|| Error::not_found(format!("node '{id}'")))?;
        let dataset = match node.kind {
            NodeKind::Dataset => self.store.get_dataset_by_node(&node.id)?,
            NodeKind::Folder => None,
        };
        Ok(NodeWithDataset { node, dataset })
    }

    pub fn update_node(&self, id: &str, update: NodeUpdate) -> Result<Node> {
        let name = update.name.as_deref().map(normalize_name).transpose()?;
        self.store.update_node(
            id,
            name.as_deref(),
            update.parent_id.as_ref().map(Option::as_deref),
        )
    }

    /// Deletes the node's subtree, then removes every blob that belonged to it.
    pub fn delete_node(&self, id: &str) -> Result<()> {
        let keys = self
            .store
            .delete_node(id)?
            .ok_or_else(|| Error::not_found(format!("node '{id}'")))?;

        for key in &keys {
            if let Err(e) = self.storage.delete_object(key) {
                tracing::warn!(node_id = id, key = %key, "failed to delete object: {e}");
            }
        }
        tracing::info!(node_id = id, objects = keys.len(), "deleted node");
        Ok(())
    }

    pub fn tileset(&self, dataset_id: &str) -> Result<TileSet> {
        self.store
            .get_tileset_by_dataset(dataset_id)?
            .ok_or_else(|| Error::not_found(format!("tile set for dataset '{dataset_id}'")))
    }

    /// Re-enqueues COG generation for an uploaded raster dataset.
    pub fn regenerate_tileset(&self, dataset_id: &str) -> Result<()> {
        let dataset = self
            .store
            .get_dataset(dataset_id)?
            .ok_or_else(|| Error::not_found(format!("dataset '{dataset_id}'")))?;
        if dataset.dataset_type != DatasetType::Raster {
            return Err(Error::validation("only raster datasets have tile sets"));
        }
        if dataset.status != DatasetStatus::Uploaded {
            return Err(Error::Conflict(format!(
                "dataset is {}, not uploaded",
                dataset.status
            )));
        }
        let in_progress = self
            .store
            .get_tileset_by_dataset(dataset_id)?
            .is_some_and(|tileset| tileset.status == TileSetStatus::Processing);
        if in_progress {
            return Err(Error::Conflict(
                "tile set generation is already in progress".to_string(),
            ));
        }
        self.queue.enqueue(dataset_id)
    }
}

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::pipeline::{TILESET_METADATA_KEY, TileSetMetadata};
use crate::store::Store;
use crate::types::TileSetStatus;
use crate::workflow::{Operation, WorkflowContext};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateTileSetPayload {
    pub tileset_id: String,
    pub storage_key: String,
}

#[derive(Debug, Serialize)]
pub struct UpdateTileSetOutput {
    pub tileset_id: String,
    pub status: TileSetStatus,
}

/// Marks the tile set ready with the metadata `generate_cog` left in the
/// context and notifies the dataset's owner.
pub struct UpdateTileSet {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl UpdateTileSet {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    fn notify_owner(&self, dataset_id: &str) -> Result<()> {
        let Some(dataset) = self.store.get_dataset(dataset_id)? else {
            tracing::warn!(dataset_id, "tile set has no dataset, skipping notification");
            return Ok(());
        };
        let Some(node) = self.store.get_node(&dataset.node_id)? else {
            tracing::warn!(dataset_id, "dataset has no node, skipping notification");
            return Ok(());
        };
        self.notifier.notify(
            &node.owner_id,
            &format!("Tileset generation completed for dataset '{}'.", node.name),
        );
        Ok(())
    }
}

impl Operation for UpdateTileSet {
    const NAME: &'static str = "update_tileset";
    type Payload = UpdateTileSetPayload;
    type Output = UpdateTileSetOutput;

    fn execute(
        &self,
        payload: UpdateTileSetPayload,
        ctx: &mut WorkflowContext,
    ) -> Result<UpdateTileSetOutput> {
        let metadata = ctx
            .get::<TileSetMetadata>(TILESET_METADATA_KEY)?
            .unwrap_or_default();

        let mut tileset = self
            .store
            .get_tileset(&payload.tileset_id)?
            .ok_or_else(|| Error::not_found(format!("tile set '{}'", payload.tileset_id)))?;

        tileset.status = TileSetStatus::Ready;
        tileset.storage_key = payload.storage_key;
        tileset.file_size = i64::try_from(metadata.file_size).unwrap_or(i64::MAX);
        tileset.bounds = metadata.bounds;
        tileset.min_zoom = metadata.min_zoom;
        tileset.max_zoom = metadata.max_zoom;
        tileset.error_message.clear();
        tileset.updated_at = Utc::now();
        self.store.update_tileset(&tileset)?;

        tracing::info!(tileset_id = %tileset.id, "tile set ready");
        self.notify_owner(&tileset.dataset_id)?;

        Ok(UpdateTileSetOutput {
            tileset_id: tileset.id,
            status: tileset.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::StoreNotifier;
    use crate::store::SqliteStore;
    use crate::types::{
        Dataset, DatasetMetadata, DatasetStatus, DatasetType, FileFormat, Node, NodeKind,
    };

    fn seeded() -> (Arc<SqliteStore>, String) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.initialize().unwrap();
        let now = Utc::now();
        let node = Node {
            id: "n1".to_string(),
            name: "ortho1".to_string(),
            parent_id: None,
            kind: NodeKind::Dataset,
            owner_id: "alice".to_string(),
            created_at: now,
            updated_at: now,
        };
        let dataset = Dataset {
            id: "d1".to_string(),
            node_id: "n1".to_string(),
            dataset_type: DatasetType::Raster,
            format: FileFormat::Geotiff,
            file_name: "ortho.tif".to_string(),
            file_size: 10,
            storage_key: "datasets/d1/file.tif".to_string(),
            metadata: DatasetMetadata::default(),
            status: DatasetStatus::Uploaded,
            created_at: now,
            updated_at: now,
        };
        store.create_dataset_node(&node, &dataset).unwrap();
        let tileset = store.begin_tileset_processing("d1").unwrap();
        (store, tileset.id)
    }

    #[test]
    fn test_marks_ready_from_context_and_notifies() {
        let (store, tileset_id) = seeded();
        let op = UpdateTileSet::new(store.clone(), Arc::new(StoreNotifier::new(store.clone())));

        let mut ctx = WorkflowContext::new();
        ctx.insert(
            TILESET_METADATA_KEY,
            &TileSetMetadata {
                file_size: 1234,
                bounds: Some([7.0, 45.0, 8.0, 46.0]),
                min_zoom: 2,
                max_zoom: 12,
            },
        )
        .unwrap();

        let out = op
            .execute(
                UpdateTileSetPayload {
                    tileset_id: tileset_id.clone(),
                    storage_key: "tilesets/x/processed.tif".to_string(),
                },
                &mut ctx,
            )
            .unwrap();
        assert_eq!(out.status, TileSetStatus::Ready);

        let tileset = store.get_tileset(&tileset_id).unwrap().unwrap();
        assert_eq!(tileset.status, TileSetStatus::Ready);
        assert_eq!(tileset.file_size, 1234);
        assert_eq!(tileset.bounds, Some([7.0, 45.0, 8.0, 46.0]));
        assert_eq!((tileset.min_zoom, tileset.max_zoom), (2, 12));

        let notes = store.list_notifications("alice").unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[0].message,
            "Tileset generation completed for dataset 'ortho1'."
        );
    }

    #[test]
    fn test_missing_metadata_uses_defaults() {
        let (store, tileset_id) = seeded();
        let op = UpdateTileSet::new(store.clone(), Arc::new(StoreNotifier::new(store.clone())));
        op.execute(
            UpdateTileSetPayload {
                tileset_id: tileset_id.clone(),
                storage_key: "k".to_string(),
            },
            &mut WorkflowContext::new(),
        )
        .unwrap();

        let tileset = store.get_tileset(&tileset_id).unwrap().unwrap();
        assert_eq!((tileset.file_size, tileset.min_zoom, tileset.max_zoom), (0, 0, 22));
        assert!(tileset.bounds.is_none());
    }

    #[test]
    fn test_unknown_tileset() {
        let (store, _) = seeded();
        let op = UpdateTileSet::new(store.clone(), Arc::new(StoreNotifier::new(store)));
        let err = op
            .execute(
                UpdateTileSetPayload {
                    tileset_id: "nope".to_string(),
                    storage_key: "k".to_string(),
                },
                &mut WorkflowContext::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}

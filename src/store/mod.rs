mod closure;
pub mod name;
mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::types::*;

/// Store defines the catalog database interface.
pub trait Store: Send + Sync {
    fn initialize(&self) -> Result<()>;

    // Node operations (tree maintained through the closure table)
    fn create_node(&self, node: &Node) -> Result<()>;
    fn create_dataset_node(&self, node: &Node, dataset: &Dataset) -> Result<()>;
    fn get_node(&self, id: &str) -> Result<Option<Node>>;
    fn list_children(&self, parent_id: Option<&str>) -> Result<Vec<Node>>;
    fn list_descendants(&self, id: &str) -> Result<Vec<(Node, i64)>>;
    fn list_ancestors(&self, id: &str) -> Result<Vec<(Node, i64)>>;
    /// Renames and/or reparents a node in one transaction. `new_parent_id:
    /// Some(None)` moves it to the root. Nothing is written unless every
    /// change is valid.
    fn update_node(
        &self,
        id: &str,
        name: Option<&str>,
        new_parent_id: Option<Option<&str>>,
    ) -> Result<Node>;

    fn move_node(&self, id: &str, new_parent_id: Option<&str>) -> Result<Node> {
        self.update_node(id, None, Some(new_parent_id))
    }
    /// Deletes the node and its subtree. Returns the object storage keys that
    /// belonged to datasets and tile sets inside it, or `None` if the node
    /// did not exist.
    fn delete_node(&self, id: &str) -> Result<Option<Vec<String>>>;
    fn list_closure_edges(&self, descendant_id: &str) -> Result<Vec<ClosureEdge>>;
    fn rebuild_closure(&self) -> Result<usize>;

    // Dataset operations
    fn get_dataset(&self, id: &str) -> Result<Option<Dataset>>;
    fn get_dataset_by_node(&self, node_id: &str) -> Result<Option<Dataset>>;
    fn get_dataset_by_storage_key(&self, storage_key: &str) -> Result<Option<Dataset>>;
    fn update_dataset(&self, dataset: &Dataset) -> Result<()>;

    // Tile set operations
    /// Creates the dataset's tile set or resets the existing one to
    /// `processing` with a cleared error message.
    fn begin_tileset_processing(&self, dataset_id: &str) -> Result<TileSet>;
    fn get_tileset(&self, id: &str) -> Result<Option<TileSet>>;
    fn get_tileset_by_dataset(&self, dataset_id: &str) -> Result<Option<TileSet>>;
    fn update_tileset(&self, tileset: &TileSet) -> Result<()>;

    // Notification operations
    fn create_notification(&self, notification: &Notification) -> Result<()>;
    fn list_notifications(&self, user_id: &str) -> Result<Vec<Notification>>;
}

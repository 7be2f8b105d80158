mod datasets;
mod nodes;
mod notifications;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use crate::auth::RequireOwner;
use crate::server::AppState;
use crate::server::response::{ApiError, StoreOptionExt, StoreResultExt};
use crate::types::Node;

pub fn catalog_router() -> Router<Arc<AppState>> {
    Router::new()
        // Node tree
        .route("/nodes", get(nodes::list_tree))
        .route("/nodes", post(nodes::create_node))
        .route("/nodes/{id}", get(nodes::get_node))
        .route("/nodes/{id}", patch(nodes::update_node))
        .route("/nodes/{id}", delete(nodes::delete_node))
        .route("/nodes/{id}/descendants", get(nodes::list_descendants))
        .route("/nodes/{id}/ancestors", get(nodes::list_ancestors))
        .route("/nodes/{id}/download", get(nodes::download))
        // Tile sets
        .route("/datasets/{id}/tileset", get(datasets::get_tileset))
        .route(
            "/datasets/{id}/tileset/regenerate",
            post(datasets::regenerate_tileset),
        )
        // Notifications
        .route("/notifications", get(notifications::list_notifications))
}

/// Loads a node the caller owns. Nodes of other owners read as missing.
fn owned_node(state: &AppState, owner: &RequireOwner, id: &str) -> Result<Node, ApiError> {
    let node = state
        .store
        .get_node(id)
        .api_err("Failed to get node")?
        .or_not_found("Node not found")?;
    if node.owner_id != owner.0 {
        return Err(ApiError::not_found("Node not found"));
    }
    Ok(node)
}

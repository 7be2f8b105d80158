use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use super::owned_node;
use crate::auth::RequireOwner;
use crate::server::AppState;
use crate::server::dto::RegenerateResponse;
use crate::server::response::{ApiError, ApiResponse, StoreOptionExt, StoreResultExt};
use crate::types::Dataset;

fn owned_dataset(state: &AppState, owner: &RequireOwner, id: &str) -> Result<Dataset, ApiError> {
    let dataset = state
        .store
        .get_dataset(id)
        .api_err("Failed to get dataset")?
        .or_not_found("Dataset not found")?;
    owned_node(state, owner, &dataset.node_id)?;
    Ok(dataset)
}

pub async fn get_tileset(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_dataset(&state, &owner, &id)?;
    let tileset = state.datasets.tileset(&id)?;
    Ok::<_, ApiError>(Json(ApiResponse::success(tileset)))
}

pub async fn regenerate_tileset(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    owned_dataset(&state, &owner, &id)?;
    state.datasets.regenerate_tileset(&id)?;
    tracing::info!(dataset_id = %id, "tile set regeneration requested");

    Ok::<_, ApiError>((
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(RegenerateResponse {
            dataset_id: id,
            status: "queued",
        })),
    ))
}

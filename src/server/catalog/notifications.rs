use std::sync::Arc;

use axum::{Json, extract::State, response::IntoResponse};

use crate::auth::RequireOwner;
use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse, StoreResultExt};

pub async fn list_notifications(
    owner: RequireOwner,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let notifications = state
        .store
        .list_notifications(&owner.0)
        .api_err("Failed to list notifications")?;
    Ok::<_, ApiError>(Json(ApiResponse::success(notifications)))
}

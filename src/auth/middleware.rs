use std::sync::Arc;

use axum::{
    Json,
    extract::FromRequestParts,
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::server::AppState;

/// Header carrying the caller's user id, set by the fronting auth proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Extractor that requires a caller identity. Node ownership is keyed on it.
pub struct RequireOwner(pub String);

#[derive(Debug)]
pub enum AuthError {
    MissingIdentity,
    InvalidIdentity,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let message = match self {
            AuthError::MissingIdentity => "Authentication required",
            AuthError::InvalidIdentity => "Invalid user id",
        };

        let body = json!({ "data": null, "error": message });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

impl FromRequestParts<Arc<AppState>> for RequireOwner {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or(AuthError::MissingIdentity)?;
        let user_id = value
            .to_str()
            .map_err(|_| AuthError::InvalidIdentity)?
            .trim();

        if user_id.is_empty() {
            return Err(AuthError::MissingIdentity);
        }
        if user_id.chars().any(char::is_control) {
            return Err(AuthError::InvalidIdentity);
        }

        Ok(RequireOwner(user_id.to_string()))
    }
}

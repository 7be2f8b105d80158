//! Object access through presigned URLs issued by the storage backend.

use std::io::Read;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;

use crate::server::AppState;
use crate::server::response::{ApiError, ApiResponse};
use crate::storage::{ObjectMetadata, PresignMethod, PresignedParams, StorageError};

pub fn storage_router() -> Router<Arc<AppState>> {
    Router::new().route("/{*key}", get(get_object).put(put_object))
}

fn presigned(
    state: &AppState,
    key: &str,
    method: PresignMethod,
    query: Result<Query<PresignedParams>, QueryRejection>,
) -> Result<PresignedParams, ApiError> {
    let Query(params) =
        query.map_err(|_| ApiError::forbidden("Missing or malformed presigned URL parameters"))?;
    state.presigner.verify(key, method, &params)?;
    Ok(params)
}

/// `PUT /storage/{key}`: one multipart part when the URL names a part,
/// otherwise the whole object.
pub async fn put_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    query: Result<Query<PresignedParams>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let params = presigned(&state, &key, PresignMethod::Put, query)?;
    let storage = state.storage.clone();

    match (params.upload_id, params.part_number) {
        (Some(upload_id), Some(part_number)) => {
            let etag = tokio::task::spawn_blocking(move || {
                storage.upload_part(&key, &upload_id, part_number, &body)
            })
            .await
            .map_err(|e| ApiError::internal(format!("Upload task failed: {e}")))??;

            let quoted = format!("\"{etag}\"");
            Ok::<_, ApiError>((
                [(header::ETAG, quoted)],
                Json(ApiResponse::success(json!({ "part_number": part_number, "etag": etag }))),
            ))
        }
        (None, None) => {
            let mut metadata = ObjectMetadata::new();
            if let Some(content_type) = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
            {
                metadata.insert("content-type".to_string(), content_type.to_string());
            }
            let info = tokio::task::spawn_blocking(move || {
                storage.upload_object(&mut &body[..], &key, &metadata)
            })
            .await
            .map_err(|e| ApiError::internal(format!("Upload task failed: {e}")))??;

            let quoted = format!("\"{}\"", info.etag);
            Ok((
                [(header::ETAG, quoted)],
                Json(ApiResponse::success(json!({
                    "key": info.key,
                    "size": info.size,
                    "etag": info.etag,
                }))),
            ))
        }
        _ => Err(ApiError::bad_request(
            "uploadId and partNumber must be given together",
        )),
    }
}

pub async fn get_object(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    query: Result<Query<PresignedParams>, QueryRejection>,
) -> impl IntoResponse {
    presigned(&state, &key, PresignMethod::Get, query)?;
    let storage = state.storage.clone();

    let (content_type, body) = tokio::task::spawn_blocking(move || -> Result<_, StorageError> {
        let info = storage.get_object_info(&key)?;
        let mut reader = storage.download_object(&key)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok((info.content_type, buf))
    })
    .await
    .map_err(|e| ApiError::internal(format!("Download task failed: {e}")))??;

    let content_type = content_type.unwrap_or_else(|| "application/octet-stream".to_string());
    Ok::<_, ApiError>(([(header::CONTENT_TYPE, content_type)], body))
}

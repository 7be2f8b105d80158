use std::sync::Arc;
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{Router, routing::get};

use super::catalog::catalog_router;
use super::storage::storage_router;
use super::tiles::{HeaderCache, tiles_router};
use crate::catalog::{DatasetService, MultipartUploadService};
use crate::pipeline::TaskQueue;
use crate::storage::{ObjectStorage, Presigner};
use crate::store::Store;

/// Largest request body accepted for direct uploads and multipart parts.
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub storage: Arc<dyn ObjectStorage>,
    /// Verifies the presigned URLs served under `/storage`.
    pub presigner: Presigner,
    pub queue: Arc<dyn TaskQueue>,
    pub datasets: DatasetService,
    pub multipart: MultipartUploadService,
    pub tile_headers: HeaderCache,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        storage: Arc<dyn ObjectStorage>,
        presigner: Presigner,
        queue: Arc<dyn TaskQueue>,
    ) -> Self {
        Self {
            datasets: DatasetService::new(store.clone(), storage.clone(), queue.clone()),
            multipart: MultipartUploadService::new(store.clone(), storage.clone(), queue.clone()),
            store,
            storage,
            presigner,
            queue,
            tile_headers: HeaderCache::default(),
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", catalog_router())
        .nest("/api/v1", tiles_router())
        .merge(tiles_router())
        .nest("/storage", storage_router())
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

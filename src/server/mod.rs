mod catalog;
pub mod dto;
pub mod response;
mod router;
mod storage;
mod tiles;

pub use catalog::catalog_router;
pub use router::{AppState, MAX_UPLOAD_BYTES, create_router};
pub use storage::storage_router;
pub use tiles::tiles_router;

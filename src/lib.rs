//! # Mapvault
//!
//! A geospatial dataset catalog: a closure-table node tree of folders and
//! datasets, background Cloud-Optimized GeoTIFF generation for rasters, and an
//! XYZ tile server with on-the-fly Terrain-RGB for elevation data. Usable both
//! as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! mapvault = { version = "0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mapvault::notify::StoreNotifier;
//! use mapvault::pipeline::{JobDeps, JobQueue, RetryPolicy};
//! use mapvault::server::{AppState, create_router};
//! use mapvault::storage::{FsObjectStorage, Presigner};
//! use mapvault::store::{SqliteStore, Store};
//!
//! let store: Arc<dyn Store> = Arc::new(SqliteStore::new("./data/mapvault.db").unwrap());
//! store.initialize().unwrap();
//!
//! let presigner = Presigner::new("secret", "http://127.0.0.1:8080", 3600);
//! let storage = Arc::new(FsObjectStorage::new("./data/objects", "mapvault", presigner.clone()));
//! let queue = JobQueue::for_cog_jobs(
//!     JobDeps {
//!         store: store.clone(),
//!         storage: storage.clone(),
//!         notifier: Arc::new(StoreNotifier::new(store.clone())),
//!     },
//!     RetryPolicy::default(),
//!     2,
//! );
//!
//! let state = Arc::new(AppState::new(store, storage, presigner, Arc::new(queue)));
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `mapvault` binary. Disable with `default-features = false`.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod raster;
pub mod server;
pub mod storage;
pub mod store;
pub mod types;
pub mod workflow;

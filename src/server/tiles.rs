//! XYZ tile endpoint over ready tile sets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::error::{Error, Result};
use crate::raster::mercator::TileCoord;
use crate::raster::{CogHeader, CogReader, Resampling, render_png, render_terrain_png};
use crate::server::AppState;
use crate::server::dto::TileParams;
use crate::server::response::{ApiError, StoreOptionExt, StoreResultExt};
use crate::types::{DatasetMetadata, TileSetStatus};

pub fn tiles_router() -> Router<Arc<AppState>> {
    Router::new().route("/datasets/{id}/tiles/{z}/{x}/{y}", get(get_tile))
}

/// Explicit visualization choice from the query string, if any.
fn requested_elevation(params: &TileParams) -> std::result::Result<Option<bool>, ApiError> {
    if let Some(visualization) = params.visualization.as_deref() {
        return match visualization.to_ascii_lowercase().as_str() {
            "terrain" => Ok(Some(true)),
            "raster" | "rgb" => Ok(Some(false)),
            other => Err(ApiError::bad_request(format!(
                "Invalid visualization '{other}', expected terrain, raster or rgb"
            ))),
        };
    }
    Ok(params.terrain.or(params.raster_dem))
}

/// What the dataset's metadata says about the raster being elevation.
fn metadata_elevation(metadata: &DatasetMetadata) -> Option<bool> {
    if let Some(kind) = metadata.raster_kind.as_deref() {
        return Some(matches!(
            kind.to_ascii_lowercase().as_str(),
            "dem" | "dtm" | "dsm" | "elevation" | "terrain"
        ));
    }
    metadata.band_count.map(|bands| bands == 1)
}

const HEADER_CACHE_CAPACITY: usize = 256;

/// Parsed COG headers by storage key, each valid for one tile set revision.
#[derive(Default)]
pub struct HeaderCache {
    entries: Mutex<HashMap<String, (DateTime<Utc>, Arc<CogHeader>)>>,
}

impl HeaderCache {
    fn get(&self, key: &str, revision: DateTime<Utc>) -> Option<Arc<CogHeader>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(cached, _)| *cached == revision)
            .map(|(_, header)| Arc::clone(header))
    }

    fn insert(&self, key: &str, revision: DateTime<Utc>, header: Arc<CogHeader>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= HEADER_CACHE_CAPACITY && !entries.contains_key(key) {
            entries.clear();
        }
        entries.insert(key.to_string(), (revision, header));
    }
}

/// Reads one tile from the COG at `key`. Without a decision from the caller,
/// a single-band source is rendered as Terrain-RGB.
fn render_tile(
    state: &AppState,
    key: &str,
    revision: DateTime<Utc>,
    tile: &TileCoord,
    elevation: Option<bool>,
) -> Result<Vec<u8>> {
    let source = state.storage.open_url(&state.storage.object_url(key))?;
    let mut reader = match state.tile_headers.get(key, revision) {
        Some(header) => CogReader::with_header(source, header),
        None => {
            let reader = CogReader::open(source)?;
            state
                .tile_headers
                .insert(key, revision, Arc::clone(reader.header()));
            reader
        }
    };
    let elevation = elevation.unwrap_or(reader.info().bands == 1);

    if elevation {
        let data = reader.read_tile(tile, Resampling::Bilinear)?;
        render_terrain_png(&data)
    } else {
        let data = reader.read_tile(tile, Resampling::Nearest)?;
        render_png(&data)
    }
}

pub async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((id, z, x, y)): Path<(String, u8, u32, String)>,
    Query(params): Query<TileParams>,
) -> std::result::Result<Response, ApiError> {
    let y: u32 = y
        .strip_suffix(".png")
        .unwrap_or(&y)
        .parse()
        .map_err(|_| ApiError::bad_request("Invalid tile y coordinate"))?;
    let tile = TileCoord::new(z, x, y)
        .ok_or_else(|| ApiError::bad_request("Tile coordinates out of range"))?;

    let tileset = state
        .store
        .get_tileset_by_dataset(&id)
        .api_err("Failed to get tile set")?
        .or_not_found("Tileset not found")?;

    if tileset.status != TileSetStatus::Ready {
        let body = json!({
            "data": null,
            "error": "Tileset is not ready",
            "status": tileset.status,
        });
        return Ok((StatusCode::CONFLICT, Json(body)).into_response());
    }

    let elevation = match requested_elevation(&params)? {
        Some(choice) => Some(choice),
        None => state
            .store
            .get_dataset(&id)
            .api_err("Failed to get dataset")?
            .and_then(|dataset| metadata_elevation(&dataset.metadata)),
    };

    let task_state = state.clone();
    let rendered = tokio::task::spawn_blocking(move || {
        render_tile(
            &task_state,
            &tileset.storage_key,
            tileset.updated_at,
            &tile,
            elevation,
        )
    })
    .await
    .map_err(|e| ApiError::internal(format!("Tile task failed: {e}")))?;

    match rendered {
        Ok(png) => Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response()),
        Err(Error::NotFound(msg)) => Err(ApiError::not_found(msg)),
        Err(e) => {
            tracing::error!(dataset_id = %id, z, x, y, "tile read failed: {e}");
            Err(ApiError::internal(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_elevation() {
        let params = |terrain, raster_dem, visualization: Option<&str>| TileParams {
            terrain,
            raster_dem,
            visualization: visualization.map(str::to_string),
        };
        assert_eq!(requested_elevation(&params(None, None, None)).unwrap(), None);
        assert_eq!(
            requested_elevation(&params(Some(false), Some(true), None)).unwrap(),
            Some(false)
        );
        assert_eq!(
            requested_elevation(&params(None, Some(true), None)).unwrap(),
            Some(true)
        );
        assert_eq!(
            requested_elevation(&params(Some(true), None, Some("rgb"))).unwrap(),
            Some(false)
        );
        assert!(requested_elevation(&params(None, None, Some("hillshade"))).is_err());
    }

    #[test]
    fn test_metadata_elevation() {
        let mut meta = DatasetMetadata::default();
        assert_eq!(metadata_elevation(&meta), None);

        meta.band_count = Some(3);
        assert_eq!(metadata_elevation(&meta), Some(false));

        meta.raster_kind = Some("DEM".to_string());
        assert_eq!(metadata_elevation(&meta), Some(true));

        meta.raster_kind = Some("orthophoto".to_string());
        meta.band_count = Some(1);
        assert_eq!(metadata_elevation(&meta), Some(false));
    }

    #[test]
    fn test_header_cache_is_scoped_to_revision() {
        use std::io::Cursor;

        use crate::raster::cog::encode_cog;
        use crate::raster::{Crs, GeoTransform, Raster, SampleType};

        let raster = Raster {
            width: 4,
            height: 4,
            bands: 1,
            sample_type: SampleType::U8,
            crs: Crs::Wgs84,
            transform: GeoTransform {
                origin_x: 10.0,
                origin_y: 50.0,
                pixel_width: 0.1,
                pixel_height: 0.1,
            },
            nodata: None,
            data: vec![1.0; 16],
        };
        let (bytes, _) = encode_cog(&raster).unwrap();
        let header = Arc::clone(CogReader::open(Cursor::new(bytes)).unwrap().header());

        let cache = HeaderCache::default();
        let first = Utc::now();
        let later = first + chrono::Duration::seconds(5);
        assert!(cache.get("tilesets/t/processed.tif", first).is_none());

        cache.insert("tilesets/t/processed.tif", first, header);
        let cached = cache.get("tilesets/t/processed.tif", first).unwrap();
        assert_eq!(cached.info().bands, 1);
        assert!(cache.get("tilesets/t/processed.tif", later).is_none());
    }
}

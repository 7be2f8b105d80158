use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::pipeline::{COG_PATH_KEY, SOURCE_PATH_KEY, TILESET_METADATA_KEY, TileSetMetadata};
use crate::raster;
use crate::workflow::{Operation, WorkflowContext};

pub const COG_FILE_NAME: &str = "output.tif";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateCogPayload {
    /// Falls back to the path the download step recorded.
    #[serde(default, alias = "path")]
    pub input_path: Option<PathBuf>,
    /// Defaults to the input's directory.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct GenerateCogOutput {
    pub path: PathBuf,
    pub levels: usize,
    pub file_size: u64,
}

/// Transcodes a GeoTIFF into a tiled, Deflate-compressed COG with internal
/// overviews, then derives tile set metadata from the written file.
pub struct GenerateCog;

impl Operation for GenerateCog {
    const NAME: &'static str = "generate_cog";
    type Payload = GenerateCogPayload;
    type Output = GenerateCogOutput;

    fn execute(
        &self,
        payload: GenerateCogPayload,
        ctx: &mut WorkflowContext,
    ) -> Result<GenerateCogOutput> {
        let input = match payload.input_path {
            Some(path) => path,
            None => ctx
                .get::<PathBuf>(SOURCE_PATH_KEY)?
                .ok_or_else(|| Error::validation("input_path is required."))?,
        };
        let work_dir = match payload.work_dir {
            Some(dir) => dir,
            None => input
                .parent()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        std::fs::create_dir_all(&work_dir)?;
        let output = work_dir.join(COG_FILE_NAME);

        let source = raster::read_raster(&input)?;
        let summary = raster::write_cog(&source, &output)?;
        drop(source);

        let info = raster::inspect(&output)?;
        let (min_zoom, max_zoom) = info.zoom_range();
        let metadata = TileSetMetadata {
            file_size: summary.file_size,
            bounds: Some(info.bounds_wgs84()),
            min_zoom,
            max_zoom,
        };
        tracing::info!(
            path = %output.display(),
            levels = summary.levels,
            min_zoom,
            max_zoom,
            "generated COG"
        );

        ctx.insert(TILESET_METADATA_KEY, &metadata)?;
        ctx.insert(COG_PATH_KEY, &output)?;

        Ok(GenerateCogOutput {
            path: output,
            levels: summary.levels,
            file_size: summary.file_size,
        })
    }
}

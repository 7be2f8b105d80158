//! The operations of the COG workflow.

mod download;
mod generate_cog;
mod update_tileset;
mod upload;

pub use download::{Download, DownloadOutput, DownloadPayload};
pub use generate_cog::{COG_FILE_NAME, GenerateCog, GenerateCogOutput, GenerateCogPayload};
pub use update_tileset::{UpdateTileSet, UpdateTileSetOutput, UpdateTileSetPayload};
pub use upload::{Upload, UploadOutput, UploadPayload};

use std::fs;
use std::io::{self, Read};
use std::path::Path;

/// File name the COG job downloads its source to.
pub const SOURCE_FILE_NAME: &str = "source.tif";

/// Streams `reader` into `path`, creating parent directories.
fn write_to_path(reader: &mut dyn Read, path: &Path) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::File::create(path)?;
    io::copy(reader, &mut file)
}

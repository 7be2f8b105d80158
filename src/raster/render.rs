//! PNG encoding of tile windows.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};

use super::reader::TileData;
use super::terrain;
use crate::error::{Error, Result};

fn channel(value: f64) -> u8 {
    if value.is_finite() {
        value.round().clamp(0.0, 255.0) as u8
    } else {
        0
    }
}

fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| Error::processing(format!("PNG encode failed: {e}")))?;
    Ok(out)
}

/// Visual rendering: grey for one or two bands, RGB(A) for three or more.
pub fn render_png(tile: &TileData) -> Result<Vec<u8>> {
    let mut image = RgbaImage::new(tile.size, tile.size);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        if !tile.is_valid(x, y) {
            *pixel = Rgba([0, 0, 0, 0]);
            continue;
        }
        let samples = tile.pixel(x, y);
        *pixel = match samples {
            [r, g, b, a, ..] => Rgba([channel(*r), channel(*g), channel(*b), channel(*a)]),
            [r, g, b] => Rgba([channel(*r), channel(*g), channel(*b), 255]),
            [grey, ..] => {
                let v = channel(*grey);
                Rgba([v, v, v, 255])
            }
            [] => Rgba([0, 0, 0, 0]),
        };
    }
    encode_png(&image)
}

/// Terrain-RGB rendering of the first band; invalid pixels are transparent.
pub fn render_terrain_png(tile: &TileData) -> Result<Vec<u8>> {
    let mut image = RgbaImage::new(tile.size, tile.size);
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let valid = tile.is_valid(x, y);
        let elevation = tile.pixel(x, y).first().copied().unwrap_or(f64::NAN);
        let [r, g, b] = terrain::encode(if valid {
            elevation
        } else {
            terrain::NODATA_ELEVATION
        });
        *pixel = Rgba([r, g, b, if valid { 255 } else { 0 }]);
    }
    encode_png(&image)
}

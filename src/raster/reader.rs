//! Windowed tile reads from a Cloud-Optimized GeoTIFF.
//!
//! Only the IFDs and the internal tiles a request touches are read from the
//! source; the parsed header can be shared between readers of the same file.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use tiff::decoder::Decoder;
use tiff::tags::Tag;

use super::geotiff::{self, RasterInfo};
use super::mercator::{self, TILE_SIZE, TileCoord};
use super::{Crs, GeoTransform, SampleType};
use crate::error::{Error, Result};

const REDUCED_RESOLUTION: u32 = 0x1;
const TRANSPARENCY_MASK: u32 = 0x4;

/// Tolerance when matching an overview's resolution to a tile's.
const LEVEL_TOLERANCE: f64 = 1.0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resampling {
    Nearest,
    #[default]
    Bilinear,
}

/// One 256×256 window read for an XYZ tile.
#[derive(Debug, Clone)]
pub struct TileData {
    pub size: u32,
    pub bands: u16,
    pub sample_type: SampleType,
    /// Row-major, band-interleaved; NaN where the pixel is invalid.
    pub values: Vec<f64>,
    /// One flag per pixel.
    pub valid: Vec<bool>,
}

impl TileData {
    pub fn pixel(&self, x: u32, y: u32) -> &[f64] {
        let bands = usize::from(self.bands);
        let start = (y as usize * self.size as usize + x as usize) * bands;
        &self.values[start..start + bands]
    }

    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        self.valid[y as usize * self.size as usize + x as usize]
    }
}

#[derive(Debug, Clone)]
struct Level {
    ifd_index: usize,
    width: u32,
    height: u32,
    transform: GeoTransform,
}

/// Raster description and pyramid levels of a COG, finest level first.
#[derive(Debug, Clone)]
pub struct CogHeader {
    info: RasterInfo,
    levels: Vec<Level>,
}

impl CogHeader {
    /// Walks the IFD chain. Tile data is not touched.
    pub fn read<R: Read + Seek>(source: &mut R) -> Result<Self> {
        source.seek(SeekFrom::Start(0))?;
        let mut decoder = geotiff::open(&mut *source)?;
        let info = geotiff::read_info(&mut decoder)?;

        let mut levels = vec![Level {
            ifd_index: 0,
            width: info.width,
            height: info.height,
            transform: info.transform,
        }];

        let mut ifd_index = 0;
        while decoder.more_images() {
            decoder.next_image().map_err(geotiff::tiff_err)?;
            ifd_index += 1;

            let subfile = geotiff::find_u32s(&mut decoder, Tag::NewSubfileType)?
                .and_then(|v| v.first().copied())
                .unwrap_or(0);
            if subfile & REDUCED_RESOLUTION == 0 || subfile & TRANSPARENCY_MASK != 0 {
                continue;
            }
            let (bands, _) = geotiff::read_layout(&mut decoder)?;
            if bands != info.bands {
                continue;
            }
            let (width, height) = decoder.dimensions().map_err(geotiff::tiff_err)?;
            levels.push(Level {
                ifd_index,
                width,
                height,
                transform: info
                    .transform
                    .scaled((info.width, info.height), (width, height)),
            });
        }
        levels.sort_by(|a, b| b.width.cmp(&a.width));

        Ok(Self { info, levels })
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Coarsest level that is still at least as fine as the tile's pixels.
    pub fn pick_level(&self, tile: &TileCoord) -> usize {
        let target = match self.info.crs {
            Crs::WebMercator => tile.pixel_size(),
            Crs::Wgs84 => {
                let [west, _, east, _] = tile.bounds_lon_lat();
                (east - west) / f64::from(TILE_SIZE)
            }
        };
        self.levels
            .iter()
            .rposition(|level| level.transform.pixel_width <= target * LEVEL_TOLERANCE)
            .unwrap_or(0)
    }
}

/// Tile reader over a seekable COG source.
pub struct CogReader<R> {
    source: R,
    header: Arc<CogHeader>,
}

impl<R: Read + Seek> CogReader<R> {
    pub fn open(mut source: R) -> Result<Self> {
        let header = Arc::new(CogHeader::read(&mut source)?);
        Ok(Self { source, header })
    }

    /// Reuses a header parsed earlier from the same file.
    pub fn with_header(source: R, header: Arc<CogHeader>) -> Self {
        Self { source, header }
    }

    pub fn header(&self) -> &Arc<CogHeader> {
        &self.header
    }

    pub fn info(&self) -> &RasterInfo {
        self.header.info()
    }

    pub fn level_count(&self) -> usize {
        self.header.level_count()
    }

    pub fn pick_level(&self, tile: &TileCoord) -> usize {
        self.header.pick_level(tile)
    }

    pub fn read_tile(&mut self, tile: &TileCoord, resampling: Resampling) -> Result<TileData> {
        let header = Arc::clone(&self.header);
        let info = header.info();
        if !mercator::intersects(&tile.bounds_lon_lat(), &info.bounds_wgs84()) {
            return Err(Error::not_found("tile outside raster bounds"));
        }

        let level = &header.levels[header.pick_level(tile)];
        self.source.seek(SeekFrom::Start(0))?;
        let mut decoder = geotiff::open(&mut self.source)?;
        for _ in 0..level.ifd_index {
            decoder.next_image().map_err(geotiff::tiff_err)?;
        }
        let mut sampler = Sampler::new(decoder, level, info);

        let size = TILE_SIZE;
        let bands = usize::from(info.bands);
        let pixels = (size * size) as usize;
        let mut values = vec![f64::NAN; pixels * bands];
        let mut valid = vec![false; pixels];

        let [min_x, _, _, max_y] = tile.bounds_mercator();
        let step = tile.pixel_size();
        let transform = level.transform;
        let mut scratch = vec![0.0; bands];

        for py in 0..size {
            for px in 0..size {
                let mx = min_x + (f64::from(px) + 0.5) * step;
                let my = max_y - (f64::from(py) + 0.5) * step;
                let (cx, cy) = info.crs.from_mercator(mx, my);
                let fx = (cx - transform.origin_x) / transform.pixel_width;
                let fy = (transform.origin_y - cy) / transform.pixel_height;

                let hit = match resampling {
                    Resampling::Nearest => sampler.nearest(fx, fy, &mut scratch)?,
                    Resampling::Bilinear => sampler.bilinear(fx, fy, &mut scratch)?,
                };
                if hit {
                    let index = (py * size + px) as usize;
                    values[index * bands..(index + 1) * bands].copy_from_slice(&scratch);
                    valid[index] = true;
                }
            }
        }

        Ok(TileData {
            size,
            bands: info.bands,
            sample_type: info.sample_type,
            values,
            valid,
        })
    }
}

struct Chunk {
    stride: usize,
    data: Vec<f64>,
}

/// Pixel access over one pyramid level, decoding each internal tile once.
struct Sampler<R: Read + Seek> {
    decoder: Decoder<R>,
    width: u32,
    height: u32,
    chunk_width: u32,
    chunk_height: u32,
    chunks_across: u32,
    bands: usize,
    nodata: Option<f64>,
    cache: HashMap<u32, Chunk>,
}

impl<R: Read + Seek> Sampler<R> {
    fn new(decoder: Decoder<R>, level: &Level, info: &RasterInfo) -> Self {
        let (chunk_width, chunk_height) = decoder.chunk_dimensions();
        let chunk_width = chunk_width.max(1);
        let chunk_height = chunk_height.max(1);
        Self {
            decoder,
            width: level.width,
            height: level.height,
            chunk_width,
            chunk_height,
            chunks_across: level.width.div_ceil(chunk_width),
            bands: usize::from(info.bands),
            nodata: info.nodata,
            cache: HashMap::new(),
        }
    }

    fn chunk(&mut self, index: u32, chunk_col: u32) -> Result<&Chunk> {
        if !self.cache.contains_key(&index) {
            let result = self.decoder.read_chunk(index).map_err(geotiff::tiff_err)?;
            let data = geotiff::samples_to_f64(result)?;
            let pixels = data.len() / self.bands.max(1);
            // Edge chunks may come back cropped to the image.
            let stride = if pixels == (self.chunk_width * self.chunk_height) as usize {
                self.chunk_width
            } else {
                self.chunk_width
                    .min(self.width - chunk_col * self.chunk_width)
            };
            self.cache.insert(
                index,
                Chunk {
                    stride: stride as usize,
                    data,
                },
            );
        }
        self.cache
            .get(&index)
            .ok_or_else(|| Error::processing("tile cache miss"))
    }

    /// Copies the bands at integer pixel `(col, row)`; false when invalid.
    fn pixel(&mut self, col: u32, row: u32, out: &mut [f64]) -> Result<bool> {
        let chunk_col = col / self.chunk_width;
        let chunk_row = row / self.chunk_height;
        let index = chunk_row * self.chunks_across + chunk_col;
        let bands = self.bands;
        let (cw, ch) = (self.chunk_width, self.chunk_height);

        let chunk = self.chunk(index, chunk_col)?;
        let local =
            (row - chunk_row * ch) as usize * chunk.stride + (col - chunk_col * cw) as usize;
        let start = local * bands;
        let Some(samples) = chunk.data.get(start..start + bands) else {
            return Ok(false);
        };
        out.copy_from_slice(samples);
        Ok(is_valid_pixel(out, self.nodata))
    }

    fn nearest(&mut self, fx: f64, fy: f64, out: &mut [f64]) -> Result<bool> {
        if !self.contains(fx, fy) {
            return Ok(false);
        }
        let col = (fx.floor() as u32).min(self.width - 1);
        let row = (fy.floor() as u32).min(self.height - 1);
        self.pixel(col, row, out)
    }

    fn bilinear(&mut self, fx: f64, fy: f64, out: &mut [f64]) -> Result<bool> {
        if !self.contains(fx, fy) {
            return Ok(false);
        }
        let x = fx - 0.5;
        let y = fy - 0.5;
        let x0 = x.floor();
        let y0 = y.floor();
        let wx = x - x0;
        let wy = y - y0;

        let clamp_col = |c: f64| c.clamp(0.0, f64::from(self.width - 1)) as u32;
        let clamp_row = |r: f64| r.clamp(0.0, f64::from(self.height - 1)) as u32;
        let corners = [
            (clamp_col(x0), clamp_row(y0), (1.0 - wx) * (1.0 - wy)),
            (clamp_col(x0 + 1.0), clamp_row(y0), wx * (1.0 - wy)),
            (clamp_col(x0), clamp_row(y0 + 1.0), (1.0 - wx) * wy),
            (clamp_col(x0 + 1.0), clamp_row(y0 + 1.0), wx * wy),
        ];

        let mut neighbour = vec![0.0; self.bands];
        out.fill(0.0);
        for (col, row, weight) in corners {
            if !self.pixel(col, row, &mut neighbour)? {
                return self.nearest(fx, fy, out);
            }
            for (acc, value) in out.iter_mut().zip(&neighbour) {
                *acc += value * weight;
            }
        }
        Ok(true)
    }

    fn contains(&self, fx: f64, fy: f64) -> bool {
        fx >= 0.0 && fy >= 0.0 && fx < f64::from(self.width) && fy < f64::from(self.height)
    }
}

fn is_valid_pixel(samples: &[f64], nodata: Option<f64>) -> bool {
    if samples.iter().any(|v| !v.is_finite()) {
        return false;
    }
    match nodata {
        Some(nodata) => !samples.iter().all(|v| *v == nodata),
        None => true,
    }
}

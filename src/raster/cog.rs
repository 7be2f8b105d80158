//! Cloud-Optimized GeoTIFF writer.
//!
//! Output layout: classic little-endian TIFF, every IFD (full resolution first,
//! then reduced-resolution overviews) packed right after the header, followed
//! by tile data ordered from the smallest overview up to full resolution.

use std::io::Write;
use std::path::Path;

use flate2::Compression;
use flate2::write::ZlibEncoder;

use super::{Crs, GeoTransform, Raster, SampleType};
use crate::error::{Error, Result};

pub const COG_TILE_SIZE: u32 = 512;
pub const MAX_OVERVIEWS: usize = 6;

const COMPRESSION_DEFLATE: u16 = 8;
const PHOTOMETRIC_MIN_IS_BLACK: u16 = 1;
const PHOTOMETRIC_RGB: u16 = 2;
const EXTRA_SAMPLE_UNSPECIFIED: u16 = 0;
const EXTRA_SAMPLE_UNASSOCIATED_ALPHA: u16 = 2;

// TIFF field types
const TYPE_ASCII: u16 = 2;
const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_DOUBLE: u16 = 12;

/// Outcome of a COG write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CogSummary {
    /// Full resolution plus overviews.
    pub levels: usize,
    pub file_size: u64,
}

enum FieldValue {
    Short(Vec<u16>),
    Long(Vec<u32>),
    Double(Vec<f64>),
    Ascii(String),
}

impl FieldValue {
    fn type_code(&self) -> u16 {
        match self {
            Self::Short(_) => TYPE_SHORT,
            Self::Long(_) => TYPE_LONG,
            Self::Double(_) => TYPE_DOUBLE,
            Self::Ascii(_) => TYPE_ASCII,
        }
    }

    fn count(&self) -> u32 {
        let count = match self {
            Self::Short(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Ascii(s) => s.len() + 1,
        };
        count as u32
    }

    fn bytes(&self) -> Vec<u8> {
        match self {
            Self::Short(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Long(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Double(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Self::Ascii(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
        }
    }
}

struct Ifd {
    entries: Vec<(u16, FieldValue)>,
}

impl Ifd {
    fn out_of_line_len(bytes: &[u8]) -> usize {
        if bytes.len() > 4 {
            bytes.len() + bytes.len() % 2
        } else {
            0
        }
    }

    fn size(&self) -> usize {
        let values: usize = self
            .entries
            .iter()
            .map(|(_, v)| Self::out_of_line_len(&v.bytes()))
            .sum();
        2 + 12 * self.entries.len() + 4 + values
    }

    /// Serialises at the current end of `out`, which must be this IFD's offset.
    fn write(&self, out: &mut Vec<u8>, next_ifd: u32) {
        let start = out.len();
        let mut value_offset = start + 2 + 12 * self.entries.len() + 4;
        let mut values = Vec::new();

        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for (tag, value) in &self.entries {
            let bytes = value.bytes();
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&value.type_code().to_le_bytes());
            out.extend_from_slice(&value.count().to_le_bytes());
            if bytes.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..bytes.len()].copy_from_slice(&bytes);
                out.extend_from_slice(&inline);
            } else {
                out.extend_from_slice(&(value_offset as u32).to_le_bytes());
                value_offset += Self::out_of_line_len(&bytes);
                values.extend_from_slice(&bytes);
                if bytes.len() % 2 == 1 {
                    values.push(0);
                }
            }
        }
        out.extend_from_slice(&next_ifd.to_le_bytes());
        out.extend_from_slice(&values);
    }
}

/// One resolution level of the pyramid.
struct Level<'a> {
    width: u32,
    height: u32,
    data: std::borrow::Cow<'a, [f64]>,
}

fn is_valid(value: f64, nodata: Option<f64>) -> bool {
    value.is_finite() && nodata != Some(value)
}

fn fill_value(raster: &Raster) -> f64 {
    match raster.nodata {
        Some(nodata) => nodata,
        None if raster.sample_type.is_float() => f64::NAN,
        None => 0.0,
    }
}

/// Halves a level with a no-data-aware 2×2 average.
fn downsample(src: &Level<'_>, raster: &Raster) -> Level<'static> {
    let bands = usize::from(raster.bands);
    let width = src.width.div_ceil(2);
    let height = src.height.div_ceil(2);
    let fill = fill_value(raster);
    let round = !raster.sample_type.is_float();
    let mut data = Vec::with_capacity(width as usize * height as usize * bands);

    for row in 0..height {
        for col in 0..width {
            for band in 0..bands {
                let mut sum = 0.0;
                let mut n = 0u32;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (x, y) = (col * 2 + dx, row * 2 + dy);
                    if x >= src.width || y >= src.height {
                        continue;
                    }
                    let v = src.data[(y as usize * src.width as usize + x as usize) * bands + band];
                    if is_valid(v, raster.nodata) {
                        sum += v;
                        n += 1;
                    }
                }
                let value = match n {
                    0 => fill,
                    _ if round => (sum / f64::from(n)).round(),
                    _ => sum / f64::from(n),
                };
                data.push(value);
            }
        }
    }

    Level {
        width,
        height,
        data: data.into(),
    }
}

fn build_pyramid(raster: &Raster) -> Vec<Level<'_>> {
    let mut levels = vec![Level {
        width: raster.width,
        height: raster.height,
        data: raster.data.as_slice().into(),
    }];

    while levels.len() <= MAX_OVERVIEWS {
        let Some(last) = levels.last() else { break };
        if last.width <= COG_TILE_SIZE && last.height <= COG_TILE_SIZE {
            break;
        }
        let next = downsample(last, raster);
        levels.push(next);
    }
    levels
}

/// Cuts a level into padded, Deflate-compressed tiles in row-major order.
fn encode_tiles(level: &Level<'_>, raster: &Raster) -> Result<Vec<Vec<u8>>> {
    let bands = usize::from(raster.bands);
    let across = level.width.div_ceil(COG_TILE_SIZE);
    let down = level.height.div_ceil(COG_TILE_SIZE);
    let fill = fill_value(raster);
    let tile_bytes =
        (COG_TILE_SIZE * COG_TILE_SIZE) as usize * bands * raster.sample_type.byte_len();

    let mut tiles = Vec::with_capacity((across * down) as usize);
    let mut raw = Vec::with_capacity(tile_bytes);
    for ty in 0..down {
        for tx in 0..across {
            raw.clear();
            for r in 0..COG_TILE_SIZE {
                let row = ty * COG_TILE_SIZE + r;
                for c in 0..COG_TILE_SIZE {
                    let col = tx * COG_TILE_SIZE + c;
                    let inside = row < level.height && col < level.width;
                    let base = (row as usize * level.width as usize + col as usize) * bands;
                    for band in 0..bands {
                        let value = if inside { level.data[base + band] } else { fill };
                        raster.sample_type.write_le(value, &mut raw);
                    }
                }
            }

            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&raw)?;
            tiles.push(encoder.finish()?);
        }
    }
    Ok(tiles)
}

fn geokey_directory(crs: Crs) -> Vec<u16> {
    match crs {
        Crs::Wgs84 => vec![1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 1, 2048, 0, 1, 4326],
        Crs::WebMercator => vec![1, 1, 0, 3, 1024, 0, 1, 1, 1025, 0, 1, 1, 3072, 0, 1, 3857],
    }
}

fn format_nodata(nodata: f64) -> String {
    if nodata.is_nan() {
        "nan".to_string()
    } else {
        format!("{nodata}")
    }
}

fn build_ifd(
    raster: &Raster,
    level: &Level<'_>,
    overview: bool,
    offsets: Vec<u32>,
    byte_counts: Vec<u32>,
) -> Ifd {
    let bands = raster.bands;
    let sample_type: SampleType = raster.sample_type;
    let rgb = matches!(bands, 3 | 4);
    let colour_channels = if rgb { 3 } else { 1 };
    let extra: Vec<u16> = (colour_channels..bands)
        .map(|_| {
            if rgb && sample_type == SampleType::U8 {
                EXTRA_SAMPLE_UNASSOCIATED_ALPHA
            } else {
                EXTRA_SAMPLE_UNSPECIFIED
            }
        })
        .collect();

    let mut entries = vec![
        (254, FieldValue::Long(vec![u32::from(overview)])),
        (256, FieldValue::Long(vec![level.width])),
        (257, FieldValue::Long(vec![level.height])),
        (258, FieldValue::Short(vec![sample_type.bits(); usize::from(bands)])),
        (259, FieldValue::Short(vec![COMPRESSION_DEFLATE])),
        (
            262,
            FieldValue::Short(vec![if rgb {
                PHOTOMETRIC_RGB
            } else {
                PHOTOMETRIC_MIN_IS_BLACK
            }]),
        ),
        (277, FieldValue::Short(vec![bands])),
        (284, FieldValue::Short(vec![1])),
        (322, FieldValue::Short(vec![COG_TILE_SIZE as u16])),
        (323, FieldValue::Short(vec![COG_TILE_SIZE as u16])),
        (324, FieldValue::Long(offsets)),
        (325, FieldValue::Long(byte_counts)),
    ];
    if !extra.is_empty() {
        entries.push((338, FieldValue::Short(extra)));
    }
    entries.push((
        339,
        FieldValue::Short(vec![sample_type.tiff_format(); usize::from(bands)]),
    ));

    if !overview {
        let GeoTransform {
            origin_x,
            origin_y,
            pixel_width,
            pixel_height,
        } = raster.transform;
        entries.push((33550, FieldValue::Double(vec![pixel_width, pixel_height, 0.0])));
        entries.push((
            33922,
            FieldValue::Double(vec![0.0, 0.0, 0.0, origin_x, origin_y, 0.0]),
        ));
        entries.push((34735, FieldValue::Short(geokey_directory(raster.crs))));
        if let Some(nodata) = raster.nodata {
            entries.push((42113, FieldValue::Ascii(format_nodata(nodata))));
        }
    }

    Ifd { entries }
}

/// Encodes `raster` as a Cloud-Optimized GeoTIFF in memory.
pub fn encode_cog(raster: &Raster) -> Result<(Vec<u8>, usize)> {
    let expected = raster.width as usize * raster.height as usize * usize::from(raster.bands);
    if raster.width == 0 || raster.height == 0 || raster.data.len() != expected {
        return Err(Error::processing(format!(
            "raster buffer holds {} samples, expected {expected}",
            raster.data.len()
        )));
    }

    let levels = build_pyramid(raster);
    let tiles = levels
        .iter()
        .map(|level| encode_tiles(level, raster))
        .collect::<Result<Vec<_>>>()?;

    // Sizes do not depend on offset values, so lay out IFDs with placeholders.
    let placeholder = |i: usize| vec![0u32; tiles[i].len()];
    let ifd_sizes: Vec<usize> = levels
        .iter()
        .enumerate()
        .map(|(i, level)| build_ifd(raster, level, i > 0, placeholder(i), placeholder(i)).size())
        .collect();

    let header_len = 8usize;
    let data_start = header_len + ifd_sizes.iter().sum::<usize>();
    let data_len: usize = tiles.iter().flatten().map(Vec::len).sum();
    let total = data_start + data_len;
    if u32::try_from(total).is_err() {
        return Err(Error::processing(
            "COG exceeds 4 GiB; BigTIFF output is not supported",
        ));
    }

    // Tile data runs from the smallest overview to full resolution.
    let mut offsets: Vec<Vec<u32>> = vec![Vec::new(); levels.len()];
    let mut cursor = data_start;
    for (i, level_tiles) in tiles.iter().enumerate().rev() {
        for tile in level_tiles {
            offsets[i].push(cursor as u32);
            cursor += tile.len();
        }
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&(header_len as u32).to_le_bytes());

    let mut ifd_offset = header_len;
    for (i, level) in levels.iter().enumerate() {
        let byte_counts = tiles[i].iter().map(|t| t.len() as u32).collect();
        let ifd = build_ifd(raster, level, i > 0, std::mem::take(&mut offsets[i]), byte_counts);
        let next = if i + 1 < levels.len() {
            (ifd_offset + ifd_sizes[i]) as u32
        } else {
            0
        };
        ifd.write(&mut out, next);
        ifd_offset += ifd_sizes[i];
    }

    for level_tiles in tiles.iter().rev() {
        for tile in level_tiles {
            out.extend_from_slice(tile);
        }
    }

    Ok((out, levels.len()))
}

/// Writes `raster` to `path` as a Cloud-Optimized GeoTIFF.
pub fn write_cog(raster: &Raster, path: &Path) -> Result<CogSummary> {
    let (bytes, levels) = encode_cog(raster)?;
    std::fs::write(path, &bytes)?;
    tracing::debug!(
        path = %path.display(),
        levels,
        bytes = bytes.len(),
        "wrote COG"
    );
    Ok(CogSummary {
        levels,
        file_size: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{geotiff, CogReader};
    use tempfile::TempDir;

    fn gradient(width: u32, height: u32, nodata: Option<f64>) -> Raster {
        let mut data = Vec::with_capacity((width * height) as usize);
        for row in 0..height {
            for col in 0..width {
                data.push(f64::from(row * 2 + col) / 10.0);
            }
        }
        Raster {
            width,
            height,
            bands: 1,
            sample_type: SampleType::F32,
            crs: Crs::Wgs84,
            transform: GeoTransform {
                origin_x: 10.0,
                origin_y: 50.0,
                pixel_width: 0.001,
                pixel_height: 0.001,
            },
            nodata,
            data,
        }
    }

    #[test]
    fn test_pyramid_stops_when_level_fits_one_tile() {
        let small = gradient(300, 200, None);
        assert_eq!(build_pyramid(&small).len(), 1);

        let wide = gradient(1100, 40, None);
        let levels = build_pyramid(&wide);
        let dims: Vec<_> = levels.iter().map(|l| (l.width, l.height)).collect();
        assert_eq!(dims, vec![(1100, 40), (550, 20), (275, 10)]);
    }

    #[test]
    fn test_downsample_ignores_nodata() {
        let mut raster = gradient(2, 2, Some(-9999.0));
        raster.data = vec![1.0, -9999.0, 3.0, f64::NAN];
        let level = Level {
            width: 2,
            height: 2,
            data: raster.data.as_slice().into(),
        };
        let half = downsample(&level, &raster);
        assert_eq!((half.width, half.height), (1, 1));
        assert_eq!(half.data[0], 2.0);

        raster.data = vec![-9999.0; 4];
        let level = Level {
            width: 2,
            height: 2,
            data: raster.data.as_slice().into(),
        };
        assert_eq!(downsample(&level, &raster).data[0], -9999.0);
    }

    #[test]
    fn test_written_cog_reads_back() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("output.tif");
        let raster = gradient(600, 300, Some(-9999.0));

        let summary = write_cog(&raster, &path).unwrap();
        assert_eq!(summary.levels, 2);
        assert_eq!(summary.file_size, std::fs::metadata(&path).unwrap().len());

        let info = geotiff::inspect(&path).unwrap();
        assert_eq!((info.width, info.height, info.bands), (600, 300, 1));
        assert_eq!(info.sample_type, SampleType::F32);
        assert_eq!(info.crs, Crs::Wgs84);
        assert_eq!(info.nodata, Some(-9999.0));
        assert!((info.transform.origin_x - 10.0).abs() < 1e-12);
        assert!((info.transform.pixel_height - 0.001).abs() < 1e-12);

        let decoded = geotiff::read_raster(&path).unwrap();
        assert_eq!(decoded.data.len(), raster.data.len());
        assert!((decoded.data[301] - raster.data[301]).abs() < 1e-4);
        assert!((decoded.data[599 * 600 / 2] - raster.data[599 * 600 / 2]).abs() < 1e-4);

        let bytes = std::fs::read(&path).unwrap();
        let reader = CogReader::open(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(reader.level_count(), 2);
    }

    #[test]
    fn test_rgb_web_mercator_header() {
        let raster = Raster {
            width: 4,
            height: 4,
            bands: 3,
            sample_type: SampleType::U8,
            crs: Crs::WebMercator,
            transform: GeoTransform {
                origin_x: 0.0,
                origin_y: 1000.0,
                pixel_width: 250.0,
                pixel_height: 250.0,
            },
            nodata: None,
            data: (0..48).map(f64::from).collect(),
        };
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("rgb.tif");
        write_cog(&raster, &path).unwrap();

        let decoded = geotiff::read_raster(&path).unwrap();
        assert_eq!(decoded.bands, 3);
        assert_eq!(decoded.crs, Crs::WebMercator);
        assert_eq!(decoded.data, raster.data);
    }

    #[test]
    fn test_rejects_mismatched_buffer() {
        let mut raster = gradient(10, 10, None);
        raster.data.pop();
        assert!(matches!(encode_cog(&raster), Err(Error::Processing(_))));
    }
}

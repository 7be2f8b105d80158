//! GeoTIFF decoding: sample layout, georeferencing and no-data.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use tiff::TiffError;
use tiff::decoder::ifd::Value;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

use super::{Crs, GeoTransform, Raster, SampleType};
use crate::error::{Error, Result};

// GeoKey ids
const GT_MODEL_TYPE: u32 = 1024;
const GEOGRAPHIC_TYPE: u32 = 2048;
const PROJECTED_CS_TYPE: u32 = 3072;

const MODEL_TYPE_PROJECTED: u32 = 1;

/// Layout and georeferencing of a raster, read from its first image.
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub sample_type: SampleType,
    pub crs: Crs,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
}

impl RasterInfo {
    pub fn bounds_wgs84(&self) -> [f64; 4] {
        super::bounds_wgs84(self.crs, &self.transform, self.width, self.height)
    }

    pub fn zoom_range(&self) -> (u8, u8) {
        super::zoom_range(self.crs, &self.transform)
    }
}

pub(crate) fn tiff_err(e: TiffError) -> Error {
    Error::processing(format!("TIFF decode error: {e}"))
}

pub(crate) fn open<R: Read + Seek>(reader: R) -> Result<Decoder<R>> {
    Decoder::new(reader)
        .map(|decoder| decoder.with_limits(Limits::unlimited()))
        .map_err(tiff_err)
}

fn u32_values(value: Value) -> std::result::Result<Vec<u32>, TiffError> {
    match value {
        Value::List(items) => items.into_iter().map(Value::into_u32).collect(),
        other => other.into_u32().map(|v| vec![v]),
    }
}

fn f64_values(value: Value) -> std::result::Result<Vec<f64>, TiffError> {
    match value {
        Value::List(items) => items.into_iter().map(Value::into_f64).collect(),
        other => other.into_f64().map(|v| vec![v]),
    }
}

pub(crate) fn find_u32s<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    tag: Tag,
) -> Result<Option<Vec<u32>>> {
    decoder
        .find_tag(tag)
        .map_err(tiff_err)?
        .map(u32_values)
        .transpose()
        .map_err(tiff_err)
}

fn find_f64s<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Result<Option<Vec<f64>>> {
    decoder
        .find_tag(tag)
        .map_err(tiff_err)?
        .map(f64_values)
        .transpose()
        .map_err(tiff_err)
}

/// Band count and sample type of the decoder's current image.
pub(crate) fn read_layout<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<(u16, SampleType)> {
    let bands = find_u32s(decoder, Tag::SamplesPerPixel)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let bands = u16::try_from(bands)
        .ok()
        .filter(|b| *b > 0)
        .ok_or_else(|| Error::processing(format!("invalid band count {bands}")))?;

    let bits = find_u32s(decoder, Tag::BitsPerSample)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let format = find_u32s(decoder, Tag::SampleFormat)?
        .and_then(|v| v.first().copied())
        .unwrap_or(1);
    let sample_type = SampleType::from_tiff(bits, format).ok_or_else(|| {
        Error::processing(format!(
            "unsupported sample layout: {bits}-bit samples with format {format}"
        ))
    })?;

    if bands > 1 {
        let planar = find_u32s(decoder, Tag::PlanarConfiguration)?
            .and_then(|v| v.first().copied())
            .unwrap_or(1);
        if planar != 1 {
            return Err(Error::processing(
                "band-separate (planar) TIFF layout is not supported",
            ));
        }
    }

    Ok((bands, sample_type))
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoTransform> {
    if let Some(m) = find_f64s(decoder, Tag::ModelTransformationTag)? {
        if m.len() < 16 {
            return Err(Error::processing("malformed ModelTransformation tag"));
        }
        if m[1] != 0.0 || m[4] != 0.0 {
            return Err(Error::processing("rotated rasters are not supported"));
        }
        return north_up(GeoTransform {
            origin_x: m[3],
            origin_y: m[7],
            pixel_width: m[0],
            pixel_height: -m[5],
        });
    }

    let scale = find_f64s(decoder, Tag::ModelPixelScaleTag)?;
    let tiepoint = find_f64s(decoder, Tag::ModelTiepointTag)?;
    let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
        return Err(Error::processing("raster is not georeferenced"));
    };
    if scale.len() < 2 || tiepoint.len() < 6 {
        return Err(Error::processing("malformed ModelPixelScale/ModelTiepoint tags"));
    }

    let (sx, sy) = (scale[0], scale[1]);
    north_up(GeoTransform {
        origin_x: tiepoint[3] - tiepoint[0] * sx,
        origin_y: tiepoint[4] + tiepoint[1] * sy,
        pixel_width: sx,
        pixel_height: sy,
    })
}

fn north_up(transform: GeoTransform) -> Result<GeoTransform> {
    let finite = [
        transform.origin_x,
        transform.origin_y,
        transform.pixel_width,
        transform.pixel_height,
    ]
    .iter()
    .all(|v| v.is_finite());
    if !finite || transform.pixel_width <= 0.0 || transform.pixel_height <= 0.0 {
        return Err(Error::processing(
            "raster must be north-up with a positive pixel size",
        ));
    }
    Ok(transform)
}

/// Inline SHORT-valued keys of a GeoKeyDirectory.
fn parse_geokeys(directory: &[u32]) -> HashMap<u32, u32> {
    let count = directory.get(3).copied().unwrap_or(0) as usize;
    directory
        .get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .take(count)
        .filter(|entry| entry[1] == 0)
        .map(|entry| (entry[0], entry[3]))
        .collect()
}

fn crs_from_geokeys(keys: &HashMap<u32, u32>) -> Result<Crs> {
    if let Some(&code) = keys.get(&PROJECTED_CS_TYPE) {
        return match code {
            3857 | 3785 | 900_913 => Ok(Crs::WebMercator),
            other => Err(Error::processing(format!(
                "unsupported projected CRS EPSG:{other}; reproject to EPSG:4326 or EPSG:3857"
            ))),
        };
    }

    if keys.get(&GT_MODEL_TYPE) == Some(&MODEL_TYPE_PROJECTED) {
        return Err(Error::processing(
            "user-defined projected CRS is not supported",
        ));
    }

    if let Some(&code) = keys.get(&GEOGRAPHIC_TYPE) {
        if code != 4326 {
            tracing::debug!(epsg = code, "treating geographic CRS as WGS84");
        }
    }
    Ok(Crs::Wgs84)
}

fn read_crs<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Crs> {
    match find_u32s(decoder, Tag::GeoKeyDirectoryTag)? {
        Some(directory) => crs_from_geokeys(&parse_geokeys(&directory)),
        None => {
            tracing::warn!("GeoTIFF has no GeoKeyDirectory, assuming EPSG:4326");
            Ok(Crs::Wgs84)
        }
    }
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Option<f64>> {
    let Some(value) = decoder.find_tag(Tag::GdalNodata).map_err(tiff_err)? else {
        return Ok(None);
    };
    let text = value.into_string().map_err(tiff_err)?;
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(None);
    }
    text.parse::<f64>()
        .map(Some)
        .map_err(|_| Error::processing(format!("invalid GDAL_NODATA value '{text}'")))
}

/// Reads layout and georeferencing of the decoder's current image.
pub(crate) fn read_info<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<RasterInfo> {
    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let (bands, sample_type) = read_layout(decoder)?;
    Ok(RasterInfo {
        width,
        height,
        bands,
        sample_type,
        crs: read_crs(decoder)?,
        transform: read_transform(decoder)?,
        nodata: read_nodata(decoder)?,
    })
}

pub(crate) fn samples_to_f64(result: DecodingResult) -> Result<Vec<f64>> {
    #[allow(unreachable_patterns)]
    let samples = match result {
        DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|s| s as f64).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|s| s as f64).collect(),
        DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
        DecodingResult::F64(v) => v,
        _ => return Err(Error::processing("unsupported TIFF sample encoding")),
    };
    Ok(samples)
}

/// Reads the header of a GeoTIFF on disk.
pub fn inspect(path: &Path) -> Result<RasterInfo> {
    let mut decoder = open(BufReader::new(File::open(path)?))?;
    read_info(&mut decoder)
}

/// Decodes the first image of a GeoTIFF on disk.
pub fn read_raster(path: &Path) -> Result<Raster> {
    let mut decoder = open(BufReader::new(File::open(path)?))?;
    let info = read_info(&mut decoder)?;
    let data = samples_to_f64(decoder.read_image().map_err(tiff_err)?)?;

    let expected = info.width as usize * info.height as usize * usize::from(info.bands);
    if data.len() != expected {
        return Err(Error::processing(format!(
            "decoded {} samples, expected {expected}",
            data.len()
        )));
    }

    tracing::debug!(
        width = info.width,
        height = info.height,
        bands = info.bands,
        epsg = info.crs.epsg(),
        "decoded source raster"
    );

    Ok(Raster {
        width: info.width,
        height: info.height,
        bands: info.bands,
        sample_type: info.sample_type,
        crs: info.crs,
        transform: info.transform,
        nodata: info.nodata,
        data,
    })
}

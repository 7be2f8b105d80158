//! Raster engine: GeoTIFF decoding, Cloud-Optimized GeoTIFF writing, XYZ tile
//! reads and PNG / Terrain-RGB rendering.

pub mod cog;
pub mod geotiff;
pub mod mercator;
pub mod reader;
pub mod render;
pub mod terrain;

pub use cog::write_cog;
pub use geotiff::{RasterInfo, inspect, read_raster};
pub use reader::{CogHeader, CogReader, Resampling, TileData};
pub use render::{render_png, render_terrain_png};

/// Metres per degree of longitude at the equator.
pub const METERS_PER_DEGREE: f64 = 111_319.49;

pub const MAX_ZOOM: u8 = 22;

/// Zoom assumed when the native resolution is unusable.
pub const FALLBACK_MAX_ZOOM: u8 = 18;

/// Number of zoom levels served below the native one.
pub const ZOOM_SPAN: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    U8,
    U16,
    U32,
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl SampleType {
    pub fn from_tiff(bits: u32, format: u32) -> Option<Self> {
        match (format, bits) {
            (1, 8) => Some(Self::U8),
            (1, 16) => Some(Self::U16),
            (1, 32) => Some(Self::U32),
            (2, 8) => Some(Self::I8),
            (2, 16) => Some(Self::I16),
            (2, 32) => Some(Self::I32),
            (3, 32) => Some(Self::F32),
            (3, 64) => Some(Self::F64),
            _ => None,
        }
    }

    pub const fn bits(self) -> u16 {
        match self {
            Self::U8 | Self::I8 => 8,
            Self::U16 | Self::I16 => 16,
            Self::U32 | Self::I32 | Self::F32 => 32,
            Self::F64 => 64,
        }
    }

    /// TIFF SampleFormat: 1 unsigned, 2 signed, 3 IEEE float.
    pub const fn tiff_format(self) -> u16 {
        match self {
            Self::U8 | Self::U16 | Self::U32 => 1,
            Self::I8 | Self::I16 | Self::I32 => 2,
            Self::F32 | Self::F64 => 3,
        }
    }

    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn byte_len(self) -> usize {
        self.bits() as usize / 8
    }

    /// Appends `value` in little-endian byte order, saturating into range.
    pub fn write_le(self, value: f64, out: &mut Vec<u8>) {
        match self {
            Self::U8 => out.push(value.round() as u8),
            Self::U16 => out.extend_from_slice(&(value.round() as u16).to_le_bytes()),
            Self::U32 => out.extend_from_slice(&(value.round() as u32).to_le_bytes()),
            Self::I8 => out.extend_from_slice(&(value.round() as i8).to_le_bytes()),
            Self::I16 => out.extend_from_slice(&(value.round() as i16).to_le_bytes()),
            Self::I32 => out.extend_from_slice(&(value.round() as i32).to_le_bytes()),
            Self::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            Self::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

/// Coordinate reference systems the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    /// EPSG:4326, degrees.
    Wgs84,
    /// EPSG:3857, metres.
    WebMercator,
}

impl Crs {
    pub const fn epsg(self) -> u16 {
        match self {
            Self::Wgs84 => 4326,
            Self::WebMercator => 3857,
        }
    }

    /// Converts a position in this CRS to longitude/latitude.
    pub fn to_lon_lat(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Self::Wgs84 => (x, y),
            Self::WebMercator => mercator::mercator_to_lon_lat(x, y),
        }
    }

    /// Converts a Web Mercator position into this CRS.
    pub fn from_mercator(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Self::Wgs84 => mercator::mercator_to_lon_lat(x, y),
            Self::WebMercator => (x, y),
        }
    }
}

/// North-up affine transform of the top-left pixel corner.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub origin_y: f64,
    /// Pixel width in CRS units, positive.
    pub pixel_width: f64,
    /// Pixel height in CRS units, positive (rows grow southwards).
    pub pixel_height: f64,
}

impl GeoTransform {
    /// Transform of the same extent resampled to `width`×`height` pixels.
    pub fn scaled(&self, from: (u32, u32), to: (u32, u32)) -> Self {
        Self {
            origin_x: self.origin_x,
            origin_y: self.origin_y,
            pixel_width: self.pixel_width * f64::from(from.0) / f64::from(to.0.max(1)),
            pixel_height: self.pixel_height * f64::from(from.1) / f64::from(to.1.max(1)),
        }
    }

    /// `[min_x, min_y, max_x, max_y]` in CRS units.
    pub fn extent(&self, width: u32, height: u32) -> [f64; 4] {
        [
            self.origin_x,
            self.origin_y - self.pixel_height * f64::from(height),
            self.origin_x + self.pixel_width * f64::from(width),
            self.origin_y,
        ]
    }
}

/// A fully decoded raster with interleaved samples.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub bands: u16,
    pub sample_type: SampleType,
    pub crs: Crs,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    /// Row-major, band-interleaved samples.
    pub data: Vec<f64>,
}

/// Extent in `[west, south, east, north]` degrees.
pub fn bounds_wgs84(crs: Crs, transform: &GeoTransform, width: u32, height: u32) -> [f64; 4] {
    let [min_x, min_y, max_x, max_y] = transform.extent(width, height);
    let (west, south) = crs.to_lon_lat(min_x, min_y);
    let (east, north) = crs.to_lon_lat(max_x, max_y);
    [west, south, east, north]
}

/// Highest useful zoom for a pixel resolution given in degrees.
pub fn resolution_to_zoom(resolution_degrees: f64) -> u8 {
    if !resolution_degrees.is_finite() || resolution_degrees <= 0.0 {
        return FALLBACK_MAX_ZOOM;
    }
    let zoom = (360.0 / (resolution_degrees * 256.0)).log2().floor();
    zoom.clamp(0.0, f64::from(MAX_ZOOM)) as u8
}

/// `(min_zoom, max_zoom)` for a raster's native resolution.
pub fn zoom_range(crs: Crs, transform: &GeoTransform) -> (u8, u8) {
    let resolution_degrees = match crs {
        Crs::Wgs84 => transform.pixel_width,
        Crs::WebMercator => transform.pixel_width / METERS_PER_DEGREE,
    };
    let max_zoom = resolution_to_zoom(resolution_degrees);
    (max_zoom.saturating_sub(ZOOM_SPAN), max_zoom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_to_zoom_thirty_metre() {
        let zoom = resolution_to_zoom(0.000277);
        assert!((12..=13).contains(&zoom), "got {zoom}");
    }

    #[test]
    fn test_resolution_to_zoom_degenerate_inputs() {
        assert_eq!(resolution_to_zoom(0.0), FALLBACK_MAX_ZOOM);
        assert_eq!(resolution_to_zoom(-1.0), FALLBACK_MAX_ZOOM);
        assert_eq!(resolution_to_zoom(f64::NAN), FALLBACK_MAX_ZOOM);
    }

    #[test]
    fn test_resolution_to_zoom_clamps() {
        assert_eq!(resolution_to_zoom(1e-12), MAX_ZOOM);
        assert_eq!(resolution_to_zoom(360.0), 0);
        assert_eq!(resolution_to_zoom(10_000.0), 0);
    }

    #[test]
    fn test_zoom_range_min_zoom_saturates() {
        let coarse = GeoTransform {
            origin_x: -180.0,
            origin_y: 90.0,
            pixel_width: 0.5,
            pixel_height: 0.5,
        };
        let (min, max) = zoom_range(Crs::Wgs84, &coarse);
        assert_eq!(max, 1);
        assert_eq!(min, 0);
    }

    #[test]
    fn test_zoom_range_web_mercator_converts_metres() {
        let thirty_m = GeoTransform {
            origin_x: 0.0,
            origin_y: 0.0,
            pixel_width: 30.0,
            pixel_height: 30.0,
        };
        let (min, max) = zoom_range(Crs::WebMercator, &thirty_m);
        assert_eq!(max, 12);
        assert_eq!(min, 2);
    }

    #[test]
    fn test_bounds_wgs84_geographic_extent() {
        let transform = GeoTransform {
            origin_x: 10.0,
            origin_y: 50.0,
            pixel_width: 0.01,
            pixel_height: 0.02,
        };
        let [w, s, e, n] = bounds_wgs84(Crs::Wgs84, &transform, 100, 50);
        assert!((w - 10.0).abs() < 1e-9);
        assert!((s - 49.0).abs() < 1e-9);
        assert!((e - 11.0).abs() < 1e-9);
        assert!((n - 50.0).abs() < 1e-9);
    }
}

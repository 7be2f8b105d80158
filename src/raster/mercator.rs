//! Web Mercator (EPSG:3857) and XYZ tile grid math.

use std::f64::consts::PI;

/// Earth radius used by EPSG:3857, in metres.
pub const EARTH_RADIUS: f64 = 6_378_137.0;

/// Half the width of the Web Mercator plane, in metres.
pub const ORIGIN_SHIFT: f64 = 20_037_508.342_789_244;

/// Highest latitude representable in Web Mercator.
pub const MAX_LAT: f64 = 85.051_128_779_806_59;

pub const TILE_SIZE: u32 = 256;

/// Deepest zoom level the tile endpoint accepts.
pub const MAX_TILE_ZOOM: u8 = 30;

/// An XYZ tile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    /// Returns `None` when the address is not on the grid of its zoom level.
    pub fn new(z: u8, x: u32, y: u32) -> Option<Self> {
        if z > MAX_TILE_ZOOM {
            return None;
        }
        let n = 1u64 << z;
        if u64::from(x) >= n || u64::from(y) >= n {
            return None;
        }
        Some(Self { z, x, y })
    }

    /// Tile edge length in metres.
    pub fn span(&self) -> f64 {
        2.0 * ORIGIN_SHIFT / 2f64.powi(i32::from(self.z))
    }

    /// Size of one output pixel in metres.
    pub fn pixel_size(&self) -> f64 {
        self.span() / f64::from(TILE_SIZE)
    }

    /// `[min_x, min_y, max_x, max_y]` in metres.
    pub fn bounds_mercator(&self) -> [f64; 4] {
        let span = self.span();
        let min_x = -ORIGIN_SHIFT + f64::from(self.x) * span;
        let max_y = ORIGIN_SHIFT - f64::from(self.y) * span;
        [min_x, max_y - span, min_x + span, max_y]
    }

    /// `[west, south, east, north]` in degrees.
    pub fn bounds_lon_lat(&self) -> [f64; 4] {
        let (north, west) = tile_to_lat_lon(self.z, self.x, self.y);
        let (south, east) = tile_to_lat_lon(self.z, self.x + 1, self.y + 1);
        [west, south, east, north]
    }
}

/// Latitude/longitude of the north-west corner of a tile. Accepts `x`/`y`
/// one past the last tile so the south-east corner can be computed.
pub fn tile_to_lat_lon(z: u8, x: u32, y: u32) -> (f64, f64) {
    let n = 2f64.powi(i32::from(z));
    let lon = f64::from(x) / n * 360.0 - 180.0;
    let lat_rad = (PI * (1.0 - 2.0 * f64::from(y) / n)).sinh().atan();
    (lat_rad.to_degrees(), lon)
}

pub fn lon_lat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-MAX_LAT, MAX_LAT);
    let x = lon.to_radians() * EARTH_RADIUS;
    let y = (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() * EARTH_RADIUS;
    (x, y)
}

pub fn mercator_to_lon_lat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS).to_degrees();
    let lat = (y / EARTH_RADIUS).sinh().atan().to_degrees();
    (lon, lat)
}

/// True when two `[west, south, east, north]` boxes overlap with positive area.
pub fn intersects(a: &[f64; 4], b: &[f64; 4]) -> bool {
    a[0] < b[2] && b[0] < a[2] && a[1] < b[3] && b[1] < a[3]
}

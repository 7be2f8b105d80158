//! Mapbox Terrain-RGB packing of elevations into 8-bit colour channels.

pub const BASE_VALUE: f64 = -10_000.0;
pub const INTERVAL: f64 = 0.1;

/// Elevation written for no-data and NaN samples.
pub const NODATA_ELEVATION: f64 = -10_000.0;

const MAX_PACKED: f64 = 16_777_215.0; // 2^24 - 1

pub fn encode(elevation: f64) -> [u8; 3] {
    let elevation = if elevation.is_finite() {
        elevation
    } else {
        NODATA_ELEVATION
    };
    let packed = ((elevation - BASE_VALUE) / INTERVAL)
        .round()
        .clamp(0.0, MAX_PACKED) as u32;
    [
        ((packed >> 16) & 0xff) as u8,
        ((packed >> 8) & 0xff) as u8,
        (packed & 0xff) as u8,
    ]
}

pub fn decode([r, g, b]: [u8; 3]) -> f64 {
    let packed = u32::from(r) * 65_536 + u32::from(g) * 256 + u32::from(b);
    BASE_VALUE + f64::from(packed) * INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_one_step() {
        for elevation in [-432.7, 0.0, 0.05, 8848.86, 1234.56, -10_000.0] {
            let decoded = decode(encode(elevation));
            assert!(
                (decoded - elevation).abs() <= INTERVAL,
                "{elevation} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn test_known_packing() {
        // (0 + 10000) / 0.1 = 100000 = 0x0186A0
        assert_eq!(encode(0.0), [0x01, 0x86, 0xA0]);
        assert_eq!(encode(BASE_VALUE), [0, 0, 0]);
    }

    #[test]
    fn test_nan_becomes_sentinel() {
        assert_eq!(encode(f64::NAN), encode(NODATA_ELEVATION));
        assert_eq!(encode(f64::INFINITY), [0, 0, 0]);
    }

    #[test]
    fn test_out_of_range_clamps() {
        assert_eq!(encode(-20_000.0), [0, 0, 0]);
        assert_eq!(encode(1.0e9), [255, 255, 255]);
    }
}

//! Slippy-map tile math.
//!
//! Uses the OpenStreetMap / Web Mercator tile pyramid:
//! - `z` is the zoom level, with `2^z x 2^z` tiles covering the world
//! - `x` is the column (0 at 180°W, increasing eastward)
//! - `y` is the row (0 at ~85.05°N, increasing southward)
//!
//! Projected bounds are in EPSG:3857 meters on a sphere of radius
//! [`EARTH_RADIUS_M`].

use crate::{DemError, Result};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;

/// Spherical Earth radius used by Web Mercator.
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Latitude limit of the square Web Mercator world (arctan(sinh(π))).
pub const MAX_MERCATOR_LAT: f64 = 85.051_128_779_806_59;

/// Latitude clamp applied before the log-tangent projection step.
const PROJECTION_LAT_CLAMP: f64 = 89.9999;

/// Highest zoom level accepted anywhere in the pipeline.
pub const MAX_ZOOM: u8 = 24;

/// One cell of the tile pyramid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileIndex {
    /// Column.
    pub x: u32,
    /// Row.
    pub y: u32,
    /// Zoom level.
    pub z: u8,
}

impl TileIndex {
    /// Create a tile index, checking `0 <= x, y < 2^z`.
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self> {
        if z > MAX_ZOOM {
            return Err(DemError::InvalidZoomLevel(z));
        }
        let n = 1u64 << z;
        if u64::from(x) >= n || u64::from(y) >= n {
            return Err(DemError::InvalidTileIndex { z, x, y });
        }
        Ok(Self { x, y, z })
    }

    /// The tile at `zoom` (<= self.z) containing this tile.
    pub fn ancestor(&self, zoom: u8) -> Self {
        let shift = self.z.saturating_sub(zoom);
        Self {
            x: self.x >> shift,
            y: self.y >> shift,
            z: self.z - shift,
        }
    }

    /// All tiles at `zoom` (>= self.z) covered by this tile, row by row.
    pub fn children(&self, zoom: u8) -> impl Iterator<Item = TileIndex> {
        let shift = zoom.saturating_sub(self.z);
        let scale = 1u32 << shift;
        let (x0, y0, z) = (self.x << shift, self.y << shift, self.z + shift);
        (0..scale).flat_map(move |dy| (0..scale).map(move |dx| TileIndex { x: x0 + dx, y: y0 + dy, z }))
    }

    /// Geographic bounds of the tile.
    pub fn lonlat_bounds(&self) -> GeoExtent {
        let n = f64::from(1u32 << self.z);
        let lon_min = f64::from(self.x) / n * 360.0 - 180.0;
        let lon_max = f64::from(self.x + 1) / n * 360.0 - 180.0;
        let lat_max = (PI * (1.0 - 2.0 * f64::from(self.y) / n)).sinh().atan().to_degrees();
        let lat_min = (PI * (1.0 - 2.0 * f64::from(self.y + 1) / n)).sinh().atan().to_degrees();
        GeoExtent {
            lon_min,
            lat_min,
            lon_max,
            lat_max,
        }
    }

    /// Projected bounds of the tile, see [`tile_bounds_projected`].
    pub fn projected_bounds(&self) -> ProjectedBounds {
        tile_bounds_projected(self.x, self.y, self.z)
    }
}

impl fmt::Display for TileIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Geographic bounding box in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoExtent {
    /// Western edge.
    pub lon_min: f64,
    /// Southern edge.
    pub lat_min: f64,
    /// Eastern edge.
    pub lon_max: f64,
    /// Northern edge.
    pub lat_max: f64,
}

impl GeoExtent {
    /// Create an extent; no validation, see [`GeoExtent::validate`].
    pub fn new(lon_min: f64, lat_min: f64, lon_max: f64, lat_max: f64) -> Self {
        Self {
            lon_min,
            lat_min,
            lon_max,
            lat_max,
        }
    }

    /// Check ordering and domain.
    pub fn validate(&self) -> Result<()> {
        let reject = |reason| DemError::InvalidExtent {
            lon_min: self.lon_min,
            lat_min: self.lat_min,
            lon_max: self.lon_max,
            lat_max: self.lat_max,
            reason,
        };

        let values = [self.lon_min, self.lat_min, self.lon_max, self.lat_max];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(reject("non-finite coordinate"));
        }
        if self.lon_min >= self.lon_max || self.lat_min >= self.lat_max {
            return Err(reject("minimum must be less than maximum"));
        }
        if self.lon_min < -180.0 || self.lon_max > 180.0 {
            return Err(reject("longitude outside [-180, 180]"));
        }
        if self.lat_min < -MAX_MERCATOR_LAT || self.lat_max > MAX_MERCATOR_LAT {
            return Err(reject("latitude outside the Web Mercator domain"));
        }
        Ok(())
    }

    /// Check if a coordinate is within the extent.
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        lon >= self.lon_min && lon <= self.lon_max && lat >= self.lat_min && lat <= self.lat_max
    }
}

/// Bounding box in EPSG:3857 meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedBounds {
    /// West.
    pub minx: f64,
    /// South.
    pub miny: f64,
    /// East.
    pub maxx: f64,
    /// North.
    pub maxy: f64,
}

impl ProjectedBounds {
    /// Center point `(x, y)`.
    pub fn center(&self) -> (f64, f64) {
        ((self.minx + self.maxx) / 2.0, (self.miny + self.maxy) / 2.0)
    }

    /// Pixel size `(dx, dy)` for a raster of `side x side` samples.
    pub fn pixel_size(&self, side: usize) -> (f64, f64) {
        (
            (self.maxx - self.minx) / side as f64,
            (self.maxy - self.miny) / side as f64,
        )
    }

    /// GDAL-style geotransform, north-up.
    pub fn geotransform(&self, side: usize) -> [f64; 6] {
        let (dx, dy) = self.pixel_size(side);
        [self.minx, dx, 0.0, self.maxy, 0.0, -dy]
    }
}

/// Convert a longitude/latitude to the containing tile at `zoom`.
///
/// Implements `x = floor((lon + 180) / 360 * 2^z)` and
/// `y = floor((1 - ln(tan(lat) + sec(lat)) / π) / 2 * 2^z)`.
///
/// No clamping is applied: the caller must keep `lat` within
/// ±[`MAX_MERCATOR_LAT`] and `lon` within [-180, 180). Values outside the
/// pyramid saturate at the `u32` range.
pub fn lonlat_to_tile(lon: f64, lat: f64, zoom: u8) -> TileIndex {
    let n = 2f64.powi(i32::from(zoom));
    let lat_rad = lat.to_radians();
    let x = ((lon + 180.0) / 360.0 * n).floor();
    let y = ((1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n).floor();
    TileIndex {
        x: x as u32,
        y: y as u32,
        z: zoom,
    }
}

/// Project a longitude/latitude to Web Mercator meters.
pub fn lonlat_to_mercator(lon: f64, lat: f64) -> (f64, f64) {
    let lat = lat.clamp(-PROJECTION_LAT_CLAMP, PROJECTION_LAT_CLAMP);
    let x = EARTH_RADIUS_M * lon.to_radians();
    let y = EARTH_RADIUS_M * (PI / 4.0 + lat.to_radians() / 2.0).tan().ln();
    (x, y)
}

/// Inverse of [`lonlat_to_mercator`].
pub fn mercator_to_lonlat(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (y / EARTH_RADIUS_M).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}

/// Projected (EPSG:3857) bounds of tile `(x, y, z)`.
pub fn tile_bounds_projected(x: u32, y: u32, z: u8) -> ProjectedBounds {
    let geo = TileIndex { x, y, z }.lonlat_bounds();
    let (minx, maxy) = lonlat_to_mercator(geo.lon_min, geo.lat_max);
    let (maxx, miny) = lonlat_to_mercator(geo.lon_max, geo.lat_min);
    ProjectedBounds {
        minx,
        miny,
        maxx,
        maxy,
    }
}

/// Inclusive rectangle of tiles at one zoom level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRange {
    /// Zoom level.
    pub zoom: u8,
    /// First column.
    pub x0: u32,
    /// Last column (inclusive).
    pub x1: u32,
    /// First row.
    pub y0: u32,
    /// Last row (inclusive).
    pub y1: u32,
}

impl TileRange {
    /// Tiles covering `extent` at `zoom`.
    ///
    /// Fails before any network work if the extent is invalid or the range
    /// collapses.
    pub fn from_extent(extent: &GeoExtent, zoom: u8) -> Result<Self> {
        if zoom > MAX_ZOOM {
            return Err(DemError::InvalidZoomLevel(zoom));
        }
        extent.validate()?;

        let top_left = lonlat_to_tile(extent.lon_min, extent.lat_max, zoom);
        let bottom_right = lonlat_to_tile(extent.lon_max, extent.lat_min, zoom);

        // An eastern edge at exactly 180° lands one column past the pyramid.
        let last = ((1u64 << zoom) - 1) as u32;
        let (x0, x1) = (top_left.x.min(last), bottom_right.x.min(last));
        let (y0, y1) = (top_left.y.min(last), bottom_right.y.min(last));

        if x1 < x0 || y1 < y0 {
            return Err(DemError::EmptyTileRange { zoom, x0, x1, y0, y1 });
        }
        Ok(Self { zoom, x0, x1, y0, y1 })
    }

    /// Number of columns.
    pub fn width(&self) -> u32 {
        self.x1 - self.x0 + 1
    }

    /// Number of rows.
    pub fn height(&self) -> u32 {
        self.y1 - self.y0 + 1
    }

    /// Total number of tiles.
    pub fn len(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    /// A range always holds at least one tile.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate tiles column by column.
    pub fn iter(&self) -> impl Iterator<Item = TileIndex> {
        let (x0, x1, y0, y1, z) = (self.x0, self.x1, self.y0, self.y1, self.zoom);
        (x0..=x1).flat_map(move |x| (y0..=y1).map(move |y| TileIndex { x, y, z }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_lonlat_to_tile_equator() {
        let tile = lonlat_to_tile(0.0, 0.0, 12);
        assert_eq!(tile, TileIndex { x: 2048, y: 2048, z: 12 });
    }

    #[test]
    fn test_lonlat_to_tile_tokyo() {
        // Tokyo Station at z17.
        let tile = lonlat_to_tile(139.7671, 35.6812, 17);
        assert_eq!(tile.x, 116423);
        assert_eq!(tile.y, 51613);
    }

    #[test]
    fn test_tile_bounds_contain_point() {
        let points = [
            (139.7671, 35.6812),
            (-122.3321, 47.6062),
            (151.2093, -33.8688),
            (0.0, 0.0),
        ];
        for (lon, lat) in points {
            let tile = lonlat_to_tile(lon, lat, 15);
            let bounds = tile.lonlat_bounds();
            assert!(bounds.contains(lon, lat), "({lon}, {lat}) not in {bounds:?} for {tile}");
        }
    }

    #[test]
    fn test_projected_center_roundtrip() {
        for z in [0u8, 1, 5, 12, 17, 20] {
            let n = 1u32 << z;
            for (x, y) in [(0, 0), (n - 1, n - 1), (n / 2, n / 3), (n / 7, n - 1)] {
                let bounds = tile_bounds_projected(x, y, z);
                let (cx, cy) = bounds.center();
                let (lon, lat) = mercator_to_lonlat(cx, cy);
                assert_eq!(lonlat_to_tile(lon, lat, z), TileIndex { x, y, z });
            }
        }
    }

    #[test]
    fn test_world_bounds() {
        let bounds = tile_bounds_projected(0, 0, 0);
        let half = PI * EARTH_RADIUS_M;
        assert_relative_eq!(bounds.minx, -half, epsilon = 1e-6);
        assert_relative_eq!(bounds.maxx, half, epsilon = 1e-6);
        assert_relative_eq!(bounds.maxy, half, epsilon = 1e-3);
        assert_relative_eq!(bounds.miny, -half, epsilon = 1e-3);
    }

    #[test]
    fn test_mercator_inverse() {
        let (x, y) = lonlat_to_mercator(139.0, 35.0);
        let (lon, lat) = mercator_to_lonlat(x, y);
        assert_relative_eq!(lon, 139.0, epsilon = 1e-9);
        assert_relative_eq!(lat, 35.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ancestor_and_children() {
        let tile = TileIndex { x: 116423, y: 51613, z: 17 };
        let parent = tile.ancestor(15);
        assert_eq!(parent, TileIndex { x: 29105, y: 12903, z: 15 });
        let children: Vec<_> = parent.children(17).collect();
        assert_eq!(children.len(), 16);
        assert!(children.contains(&tile));
        assert_eq!(children[0], TileIndex { x: 116420, y: 51612, z: 17 });
    }

    #[test]
    fn test_tile_index_new_range() {
        assert!(TileIndex::new(2, 3, 3).is_ok());
        assert!(matches!(
            TileIndex::new(2, 4, 0),
            Err(DemError::InvalidTileIndex { z: 2, x: 4, y: 0 })
        ));
        assert!(matches!(TileIndex::new(2, 0, 4), Err(DemError::InvalidTileIndex { .. })));
        assert!(matches!(TileIndex::new(30, 0, 0), Err(DemError::InvalidZoomLevel(30))));
    }

    #[test]
    fn test_range_single_tile() {
        let tile = lonlat_to_tile(139.7671, 35.6812, 17);
        let b = tile.lonlat_bounds();
        let inset = 1e-6;
        let extent = GeoExtent::new(b.lon_min + inset, b.lat_min + inset, b.lon_max - inset, b.lat_max - inset);
        let range = TileRange::from_extent(&extent, 17).unwrap();
        assert_eq!(range.len(), 1);
        assert_eq!(range.iter().next(), Some(tile));
    }

    #[test]
    fn test_range_orientation() {
        let extent = GeoExtent::new(139.70, 35.60, 139.80, 35.70);
        let range = TileRange::from_extent(&extent, 14).unwrap();
        assert!(range.x0 <= range.x1);
        assert!(range.y0 <= range.y1);
        assert_eq!(range.iter().count(), range.len());
    }

    #[test]
    fn test_range_rejects_inverted_extent() {
        let extent = GeoExtent::new(139.80, 35.60, 139.70, 35.70);
        assert!(matches!(
            TileRange::from_extent(&extent, 17),
            Err(DemError::InvalidExtent { .. })
        ));
    }

    #[test]
    fn test_range_rejects_polar_extent() {
        let extent = GeoExtent::new(0.0, 80.0, 1.0, 89.0);
        assert!(TileRange::from_extent(&extent, 10).is_err());
    }

    #[test]
    fn test_range_clamps_antimeridian() {
        let extent = GeoExtent::new(179.9, 0.0, 180.0, 1.0);
        let range = TileRange::from_extent(&extent, 3).unwrap();
        assert_eq!(range.x1, 7);
    }
}

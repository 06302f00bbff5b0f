// Copyright 2025 Chris Custine
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Web Mercator tile addressing.
//!
//! Pure conversions between geographic coordinates and slippy-map tile
//! indices (EPSG:3857). Nothing in here holds state or performs I/O.
//!
//! Tile `x` wraps around the antimeridian; tile `y` does not wrap and must lie
//! in `[0, 2^zoom)`. Latitudes beyond the Mercator limit (±85.0511°) are
//! clamped before projection, anything outside ±90° is rejected.

use std::f64::consts::PI;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Edge length of a raster tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Northern/southern limit of the Web Mercator projection in degrees.
pub const MAX_LATITUDE: f64 = 85.051_128_779_806_59;

/// Highest zoom level accepted by the addressing functions.
pub const MAX_ZOOM: u8 = 24;

/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Errors produced by tile addressing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AddressError {
    #[error("coordinate out of range: {0}")]
    OutOfRangeCoordinate(String),
}

/// A geographic position in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    #[must_use]
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Whether the point is finite and inside ±90° / ±180°.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        check_geo(self.lat, self.lon).is_ok()
    }

    /// Great-circle distance to `other` in meters (Haversine).
    #[must_use]
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let lat1_rad = self.lat.to_radians();
        let lat2_rad = other.lat.to_radians();
        let delta_lat = (other.lat - self.lat).to_radians();
        let delta_lon = (other.lon - self.lon).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_M * c
    }
}

/// Identifies one raster tile of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub provider: String,
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    /// Build a key, wrapping `x` around the antimeridian.
    ///
    /// Fails when `zoom` exceeds [`MAX_ZOOM`] or `y` falls outside the world.
    pub fn new(
        provider: impl Into<String>,
        zoom: u8,
        x: i64,
        y: i64,
    ) -> Result<Self, AddressError> {
        check_zoom(zoom)?;
        let n = i64::from(tiles_per_axis(zoom));
        if !(0..n).contains(&y) {
            return Err(AddressError::OutOfRangeCoordinate(format!(
                "tile row {y} outside [0, {n}) at zoom {zoom}"
            )));
        }

        Ok(Self {
            provider: provider.into(),
            zoom,
            x: wrap_x(x, zoom),
            y: y as u32,
        })
    }

    /// Key of the tile containing `point` at `zoom`.
    pub fn containing(
        provider: impl Into<String>,
        point: GeoPoint,
        zoom: u8,
    ) -> Result<Self, AddressError> {
        let (x, y) = to_tile(point.lat, point.lon, zoom)?;
        Ok(Self {
            provider: provider.into(),
            zoom,
            x,
            y,
        })
    }

    /// Geographic bounding box of this tile.
    #[must_use]
    pub fn bounds(&self) -> TileBounds {
        tile_bounds(self.x, self.y, self.zoom)
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}/{}", self.provider, self.zoom, self.x, self.y)
    }
}

/// Geographic bounding box of a tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileBounds {
    pub lat_min: f64,
    pub lon_min: f64,
    pub lat_max: f64,
    pub lon_max: f64,
}

impl TileBounds {
    #[must_use]
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.lat_min
            && point.lat <= self.lat_max
            && point.lon >= self.lon_min
            && point.lon <= self.lon_max
    }

    #[must_use]
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.lat_min + self.lat_max) / 2.0,
            (self.lon_min + self.lon_max) / 2.0,
        )
    }
}

/// Number of tiles along one axis at `zoom`.
#[must_use]
pub fn tiles_per_axis(zoom: u8) -> u32 {
    1u32 << zoom.min(MAX_ZOOM)
}

/// Wrap a tile column into `[0, 2^zoom)`.
#[must_use]
pub fn wrap_x(x: i64, zoom: u8) -> u32 {
    x.rem_euclid(i64::from(tiles_per_axis(zoom))) as u32
}

/// Clamp a latitude into the range Web Mercator can represent.
#[must_use]
pub fn clamp_latitude(lat: f64) -> f64 {
    lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)
}

fn check_zoom(zoom: u8) -> Result<(), AddressError> {
    if zoom > MAX_ZOOM {
        return Err(AddressError::OutOfRangeCoordinate(format!(
            "zoom {zoom} above maximum {MAX_ZOOM}"
        )));
    }
    Ok(())
}

fn check_geo(lat: f64, lon: f64) -> Result<(), AddressError> {
    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(AddressError::OutOfRangeCoordinate(format!("latitude {lat}")));
    }
    if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
        return Err(AddressError::OutOfRangeCoordinate(format!("longitude {lon}")));
    }
    Ok(())
}

/// Projection without validation; callers guarantee sane input.
pub(crate) fn project(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    let n = 2_f64.powi(i32::from(zoom));
    let lat_rad = clamp_latitude(lat).to_radians();
    let x = (lon + 180.0) / 360.0 * n;
    let y = (1.0 - lat_rad.tan().asinh() / PI) / 2.0 * n;
    (x, y)
}

/// Convert a position to fractional tile coordinates.
pub fn to_tile_fractional(lat: f64, lon: f64, zoom: u8) -> Result<(f64, f64), AddressError> {
    check_zoom(zoom)?;
    check_geo(lat, lon)?;
    Ok(project(lat, lon, zoom))
}

/// Convert a position to the indices of the tile containing it.
pub fn to_tile(lat: f64, lon: f64, zoom: u8) -> Result<(u32, u32), AddressError> {
    let (fx, fy) = to_tile_fractional(lat, lon, zoom)?;
    let last_row = tiles_per_axis(zoom) - 1;

    let x = wrap_x(fx.floor() as i64, zoom);
    // The clamped south pole lands exactly on the bottom edge
    let y = (fy.floor().max(0.0) as u32).min(last_row);
    Ok((x, y))
}

/// Convert (possibly fractional) tile coordinates back to a position.
///
/// Integral inputs yield the north-west corner of the tile.
#[must_use]
pub fn to_geo(x: f64, y: f64, zoom: u8) -> GeoPoint {
    let n = 2_f64.powi(i32::from(zoom));
    let lon = x / n * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * y / n)).sinh().atan().to_degrees();
    GeoPoint::new(lat, lon)
}

/// Geographic bounding box of tile `(x, y)` at `zoom`.
#[must_use]
pub fn tile_bounds(x: u32, y: u32, zoom: u8) -> TileBounds {
    let nw = to_geo(f64::from(x), f64::from(y), zoom);
    let se = to_geo(f64::from(x) + 1.0, f64::from(y) + 1.0, zoom);

    TileBounds {
        lat_min: se.lat,
        lon_min: nw.lon,
        lat_max: nw.lat,
        lon_max: se.lon,
    }
}

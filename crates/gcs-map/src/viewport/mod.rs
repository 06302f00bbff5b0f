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

//! Pan/zoom state and geographic to screen transforms.
//!
//! Screen coordinates are pixels from the top-left corner of the viewport.
//! All positions are derived from the centre, zoom and size on demand.

use std::collections::HashSet;

use crate::cache::{TileCache, TileResult};
use crate::config::MapConfig;
use crate::fetch::TileSource;
use crate::mission::Mission;
use crate::tile::{self, tiles_per_axis, AddressError, GeoPoint, TileKey, MAX_LATITUDE};
use crate::tracker::{Rgb, TrackedEntity};

/// Equatorial circumference in metres (WGS84).
const EARTH_CIRCUMFERENCE_M: f64 = 40_075_016.686;

/// A position in viewport pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f64,
    pub y: f64,
}

/// Where a tile goes on screen. `x`/`y` is its top-left corner.
///
/// When the viewport is wider than the world the same key is placed more
/// than once.
#[derive(Debug, Clone, PartialEq)]
pub struct TilePlacement {
    pub key: TileKey,
    pub x: f64,
    pub y: f64,
    pub size: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileDraw {
    pub placement: TilePlacement,
    pub result: TileResult,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraw {
    pub id: String,
    pub color: Rgb,
    pub position: ScreenPoint,
    pub heading: f64,
    /// Flight path, oldest first.
    pub path: Vec<ScreenPoint>,
    pub home: Option<ScreenPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaypointDraw {
    /// 1-based position in the route.
    pub number: usize,
    pub position: ScreenPoint,
    pub altitude: f64,
}

/// Mission markers in screen space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissionDraw {
    pub waypoints: Vec<WaypointDraw>,
    /// Polyline through the waypoints; empty with fewer than two.
    pub route: Vec<ScreenPoint>,
    /// Geofence vertices; the last connects back to the first.
    pub geofence: Vec<ScreenPoint>,
    pub rally_points: Vec<ScreenPoint>,
}

/// A round distance and the bar length that represents it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleBar {
    pub meters: f64,
    pub pixels: f64,
}

/// Everything a renderer needs for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderPlan {
    /// Nearest to the centre first.
    pub tiles: Vec<TileDraw>,
    /// In tracker order.
    pub entities: Vec<EntityDraw>,
    pub mission: MissionDraw,
    pub meters_per_pixel: f64,
}

impl RenderPlan {
    /// Tiles still waiting for data.
    #[must_use]
    pub fn pending_tiles(&self) -> usize {
        self.tiles.iter().filter(|t| t.result.is_pending()).count()
    }
}

/// The visible map window.
#[derive(Debug, Clone, PartialEq)]
pub struct MapViewport {
    center: GeoPoint,
    zoom: u8,
    width_px: u32,
    height_px: u32,
    provider: String,
    min_zoom: u8,
    max_zoom: u8,
    tile_size: f64,
}

impl MapViewport {
    /// Viewport at the configured default position and zoom.
    #[must_use]
    pub fn new(config: &MapConfig, width_px: u32, height_px: u32) -> Self {
        let view = &config.view;
        let mut viewport = Self {
            center: GeoPoint::default(),
            zoom: view.default_zoom,
            width_px,
            height_px,
            provider: view.default_provider.clone(),
            min_zoom: view.min_zoom.min(view.max_zoom),
            max_zoom: view.max_zoom,
            tile_size: f64::from(view.tile_size.max(1)),
        };
        viewport.set_zoom(view.default_zoom);
        viewport.center = normalize(GeoPoint::new(view.default_lat, view.default_lon));
        viewport
    }

    /// Move to `center` at `zoom` (clamped).
    pub fn with_center(mut self, center: GeoPoint, zoom: u8) -> Result<Self, AddressError> {
        self.set_center(center.lat, center.lon)?;
        self.set_zoom(zoom);
        Ok(self)
    }

    #[must_use]
    pub fn center(&self) -> GeoPoint {
        self.center
    }

    #[must_use]
    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    #[must_use]
    pub fn size(&self) -> (u32, u32) {
        (self.width_px, self.height_px)
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    #[must_use]
    pub fn tile_size(&self) -> f64 {
        self.tile_size
    }

    /// Centre the map on a position. Latitude is clamped to the Mercator range.
    pub fn set_center(&mut self, lat: f64, lon: f64) -> Result<(), AddressError> {
        tile::to_tile_fractional(lat, lon, 0)?;
        self.center = normalize(GeoPoint::new(lat, lon));
        Ok(())
    }

    /// Set the zoom, clamped to the configured range.
    pub fn set_zoom(&mut self, zoom: u8) {
        self.zoom = zoom.clamp(self.min_zoom, self.max_zoom);
    }

    pub fn zoom_by(&mut self, delta: i32) {
        let target = (i32::from(self.zoom) + delta).clamp(0, i32::from(u8::MAX));
        self.set_zoom(target as u8);
    }

    /// Zoom while keeping the point under the cursor at `(sx, sy)` fixed.
    pub fn zoom_at(&mut self, delta: i32, sx: f64, sy: f64) {
        let anchor = self.unproject(sx, sy);
        self.zoom_by(delta);

        let (ax, ay) = tile::project(anchor.lat, anchor.lon, self.zoom);
        let cx = ax - (sx - self.half_width()) / self.tile_size;
        let cy = ay - (sy - self.half_height()) / self.tile_size;
        self.center = self.tile_to_geo(cx, cy);
    }

    /// Drag the map by a pixel delta; content follows the pointer.
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        let (cx, cy) = self.center_tile();
        self.center = self.tile_to_geo(cx - dx / self.tile_size, cy - dy / self.tile_size);
    }

    pub fn resize(&mut self, width_px: u32, height_px: u32) {
        self.width_px = width_px;
        self.height_px = height_px;
    }

    pub fn set_provider(&mut self, provider: impl Into<String>) {
        self.provider = provider.into();
    }

    /// Fractional tile coordinates of the centre at the current zoom.
    #[must_use]
    pub fn center_tile(&self) -> (f64, f64) {
        tile::project(self.center.lat, self.center.lon, self.zoom)
    }

    fn half_width(&self) -> f64 {
        f64::from(self.width_px) / 2.0
    }

    fn half_height(&self) -> f64 {
        f64::from(self.height_px) / 2.0
    }

    fn world_tiles(&self) -> f64 {
        f64::from(tiles_per_axis(self.zoom))
    }

    /// Geographic position of fractional tile coordinates, wrapping x and
    /// clamping y to the world.
    fn tile_to_geo(&self, x: f64, y: f64) -> GeoPoint {
        let n = self.world_tiles();
        let geo = tile::to_geo(x.rem_euclid(n), y.clamp(0.0, n), self.zoom);
        normalize(geo)
    }

    /// Tiles covering the viewport plus a one-tile border, nearest to the
    /// centre first.
    #[must_use]
    pub fn tile_placements(&self) -> Vec<TilePlacement> {
        let (cx, cy) = self.center_tile();
        let n = i64::from(tiles_per_axis(self.zoom));
        let span_x = self.half_width() / self.tile_size;
        let span_y = self.half_height() / self.tile_size;

        let x_range = ((cx - span_x).floor() as i64 - 1)..=((cx + span_x).floor() as i64 + 1);
        let y_min = ((cy - span_y).floor() as i64 - 1).max(0);
        let y_max = ((cy + span_y).floor() as i64 + 1).min(n - 1);
        let y_range = y_min..=y_max;

        let mut placements: Vec<(f64, TilePlacement)> = Vec::new();
        for ty in y_range {
            for tx in x_range.clone() {
                let Ok(key) = TileKey::new(self.provider.clone(), self.zoom, tx, ty) else {
                    continue;
                };
                let dx = tx as f64 + 0.5 - cx;
                let dy = ty as f64 + 0.5 - cy;
                placements.push((
                    dx * dx + dy * dy,
                    TilePlacement {
                        key,
                        x: self.half_width() + (tx as f64 - cx) * self.tile_size,
                        y: self.half_height() + (ty as f64 - cy) * self.tile_size,
                        size: self.tile_size,
                    },
                ));
            }
        }

        placements.sort_by(|(a, _), (b, _)| a.total_cmp(b));
        placements.into_iter().map(|(_, placement)| placement).collect()
    }

    /// The set of tiles a renderer needs for the current view.
    #[must_use]
    pub fn visible_tiles(&self) -> HashSet<TileKey> {
        self.tile_placements().into_iter().map(|p| p.key).collect()
    }

    /// Screen position of a geographic point.
    ///
    /// Uses the copy of the world nearest the centre so positions across the
    /// antimeridian land next to the centre rather than a world away.
    #[must_use]
    pub fn project(&self, lat: f64, lon: f64) -> ScreenPoint {
        let (cx, cy) = self.center_tile();
        let (px, py) = tile::project(lat, lon, self.zoom);
        let n = self.world_tiles();

        let mut dx = (px - cx).rem_euclid(n);
        if dx > n / 2.0 {
            dx -= n;
        }

        ScreenPoint {
            x: self.half_width() + dx * self.tile_size,
            y: self.half_height() + (py - cy) * self.tile_size,
        }
    }

    /// Geographic position under a screen point.
    #[must_use]
    pub fn unproject(&self, sx: f64, sy: f64) -> GeoPoint {
        let (cx, cy) = self.center_tile();
        self.tile_to_geo(
            cx + (sx - self.half_width()) / self.tile_size,
            cy + (sy - self.half_height()) / self.tile_size,
        )
    }

    /// Ground distance covered by one pixel at the centre latitude.
    #[must_use]
    pub fn meters_per_pixel(&self) -> f64 {
        EARTH_CIRCUMFERENCE_M * self.center.lat.to_radians().cos()
            / (self.tile_size * self.world_tiles())
    }

    /// Longest 1, 2 or 5 times a power of ten metres that fits in `max_px`.
    #[must_use]
    pub fn scale_bar(&self, max_px: f64) -> ScaleBar {
        let mpp = self.meters_per_pixel();
        let max_m = mpp * max_px;
        if max_m <= 0.0 || !max_m.is_finite() {
            return ScaleBar {
                meters: 0.0,
                pixels: 0.0,
            };
        }

        let magnitude = 10_f64.powf(max_m.log10().floor());
        let meters = [5.0, 2.0, 1.0]
            .iter()
            .map(|step| step * magnitude)
            .find(|m| *m <= max_m)
            .unwrap_or(magnitude);

        ScaleBar {
            meters,
            pixels: meters / mpp,
        }
    }

    /// Project mission markers to screen space.
    #[must_use]
    pub fn project_mission(&self, mission: &Mission) -> MissionDraw {
        let waypoints: Vec<WaypointDraw> = mission
            .waypoints()
            .iter()
            .enumerate()
            .map(|(i, w)| WaypointDraw {
                number: i + 1,
                position: self.project(w.position.lat, w.position.lon),
                altitude: w.altitude,
            })
            .collect();

        let route = if waypoints.len() >= 2 {
            waypoints.iter().map(|w| w.position).collect()
        } else {
            Vec::new()
        };

        MissionDraw {
            route,
            waypoints,
            geofence: mission
                .geofence()
                .iter()
                .map(|p| self.project(p.lat, p.lon))
                .collect(),
            rally_points: mission
                .rally_points()
                .iter()
                .map(|p| self.project(p.lat, p.lon))
                .collect(),
        }
    }

    /// Tile, entity and mission placements for one frame.
    ///
    /// Schedules missing tiles nearest the centre first and drops queued
    /// requests for tiles that are no longer visible.
    pub fn render_plan<S: TileSource>(
        &self,
        cache: &TileCache<S>,
        entities: &[TrackedEntity],
        mission: &Mission,
    ) -> RenderPlan {
        let (cx, cy) = self.center_tile();
        cache.focus(self.zoom, cx, cy);

        let placements = self.tile_placements();
        let visible: HashSet<TileKey> = placements.iter().map(|p| p.key.clone()).collect();
        cache.retain_visible(&visible);

        let tiles = placements
            .into_iter()
            .map(|placement| TileDraw {
                result: cache.get_or_schedule(&placement.key),
                placement,
            })
            .collect();

        let entities = entities
            .iter()
            .map(|entity| EntityDraw {
                id: entity.id.clone(),
                color: entity.color,
                position: self.project(entity.position.lat, entity.position.lon),
                heading: entity.heading,
                path: entity.path.iter().map(|p| self.project(p.lat, p.lon)).collect(),
                home: entity.home.map(|h| self.project(h.lat, h.lon)),
            })
            .collect();

        RenderPlan {
            tiles,
            entities,
            mission: self.project_mission(mission),
            meters_per_pixel: self.meters_per_pixel(),
        }
    }
}

/// Clamp latitude to the Mercator range and wrap longitude into [-180, 180).
fn normalize(point: GeoPoint) -> GeoPoint {
    GeoPoint::new(
        point.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE),
        (point.lon + 180.0).rem_euclid(360.0) - 180.0,
    )
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use chrono::Utc;

    use super::*;
    use crate::test_support::MockSource;
    use crate::tracker::PositionPoint;

    fn viewport(lat: f64, lon: f64, zoom: u8) -> MapViewport {
        MapViewport::new(&MapConfig::in_memory(), 800, 600)
            .with_center(GeoPoint::new(lat, lon), zoom)
            .unwrap()
    }

    fn close(a: f64, b: f64, eps: f64) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_defaults_from_config() {
        let vp = MapViewport::new(&MapConfig::default(), 800, 600);
        assert_eq!(vp.zoom(), 12);
        assert!(close(vp.center().lat, 28.6139, 1e-9));
        assert_eq!(vp.provider(), "Esri World Imagery");
    }

    #[test]
    fn test_zoom_is_clamped() {
        let mut vp = viewport(0.0, 0.0, 10);
        vp.set_zoom(30);
        assert_eq!(vp.zoom(), 19);
        vp.zoom_by(-100);
        assert_eq!(vp.zoom(), 3);
        vp.zoom_by(2);
        assert_eq!(vp.zoom(), 5);
    }

    #[test]
    fn test_center_projects_to_middle() {
        let vp = viewport(37.77, -122.41, 15);
        let p = vp.project(37.77, -122.41);
        assert!(close(p.x, 400.0, 1e-6));
        assert!(close(p.y, 300.0, 1e-6));
    }

    #[test]
    fn test_unproject_inverts_project() {
        let vp = viewport(37.77, -122.41, 15);
        let p = vp.project(37.775, -122.415);
        let geo = vp.unproject(p.x, p.y);
        assert!(close(geo.lat, 37.775, 1e-9));
        assert!(close(geo.lon, -122.415, 1e-9));
    }

    #[test]
    fn test_pan_moves_center_opposite_to_drag() {
        let mut vp = viewport(37.77, -122.41, 15);
        let (cx, cy) = vp.center_tile();

        vp.pan_by(256.0, -128.0);
        let (nx, ny) = vp.center_tile();

        assert!(close(nx, cx - 1.0, 1e-6));
        assert!(close(ny, cy + 0.5, 1e-6));
        assert!(vp.center().lon < -122.41);
    }

    #[test]
    fn test_pan_wraps_across_antimeridian() {
        let mut vp = viewport(0.0, 179.0, 3);
        vp.pan_by(-512.0, 0.0);
        assert!(vp.center().lon < 0.0);
        assert!(vp.center().lon >= -180.0);
    }

    #[test]
    fn test_pan_stops_at_poles() {
        let mut vp = viewport(80.0, 0.0, 3);
        vp.pan_by(0.0, 100_000.0);
        assert!(close(vp.center().lat, MAX_LATITUDE, 1e-6));
    }

    #[test]
    fn test_zoom_at_keeps_cursor_point() {
        let mut vp = viewport(37.77, -122.41, 12);
        let before = vp.unproject(100.0, 450.0);

        vp.zoom_at(2, 100.0, 450.0);
        let after = vp.unproject(100.0, 450.0);

        assert_eq!(vp.zoom(), 14);
        assert!(close(before.lat, after.lat, 1e-9));
        assert!(close(before.lon, after.lon, 1e-9));
    }

    #[test]
    fn test_visible_tiles_cover_viewport_with_border() {
        let vp = viewport(37.77, -122.41, 15);
        let tiles = vp.visible_tiles();
        let (cx, cy) = vp.center_tile();
        let (cx, cy) = (cx.floor() as u32, cy.floor() as u32);

        for dx in -2..=2_i64 {
            for dy in -1..=1_i64 {
                let key =
                    TileKey::new(vp.provider(), 15, i64::from(cx) + dx, i64::from(cy) + dy)
                        .unwrap();
                assert!(tiles.contains(&key), "missing {key}");
            }
        }
        // 800x600 at 256 px: at most 7 columns by 6 rows
        assert!(tiles.len() <= 42);
        assert!(tiles.iter().all(|k| k.zoom == 15 && k.provider == vp.provider()));
    }

    #[test]
    fn test_visible_tiles_wrap_at_antimeridian() {
        let vp = viewport(0.0, 179.99, 5);
        let tiles = vp.visible_tiles();
        assert!(tiles.iter().any(|k| k.x == 0));
        assert!(tiles.iter().any(|k| k.x == 31));
    }

    #[test]
    fn test_visible_tiles_skip_rows_outside_world() {
        let vp = viewport(85.0, 0.0, 4);
        assert!(vp.visible_tiles().iter().all(|k| k.y < 16));
        assert!(vp.visible_tiles().iter().any(|k| k.y == 0));
    }

    #[test]
    fn test_placements_nearest_first() {
        let vp = viewport(37.77, -122.41, 15);
        let placements = vp.tile_placements();
        let first = &placements[0];

        assert!(first.x <= 400.0 && first.x + first.size >= 400.0);
        assert!(first.y <= 300.0 && first.y + first.size >= 300.0);
    }

    #[test]
    fn test_project_picks_nearest_world_copy() {
        let vp = viewport(0.0, 179.9, 10);
        let east = vp.project(0.0, -179.9);
        assert!(east.x > 400.0);
        assert!(east.x < 800.0);
    }

    #[test]
    fn test_meters_per_pixel() {
        let vp = viewport(0.0, 0.0, 3);
        assert!(close(vp.meters_per_pixel(), 156_543.033_928 / 8.0, 1e-3));

        let north = viewport(60.0, 0.0, 3);
        assert!(close(north.meters_per_pixel(), vp.meters_per_pixel() / 2.0, 1e-3));
    }

    #[test]
    fn test_scale_bar_is_round() {
        let vp = viewport(0.0, 0.0, 10);
        let bar = vp.scale_bar(150.0);

        assert!(bar.pixels <= 150.0);
        assert!(bar.pixels > 30.0);
        let leading = bar.meters / 10_f64.powf(bar.meters.log10().floor());
        assert!([1.0, 2.0, 5.0].iter().any(|s| close(*s, leading, 1e-9)));
    }

    #[test]
    fn test_out_of_range_center_rejected() {
        let mut vp = viewport(0.0, 0.0, 5);
        assert!(vp.set_center(91.0, 0.0).is_err());
        assert!(vp.set_center(0.0, f64::NAN).is_err());
        assert_eq!(vp.center(), GeoPoint::new(0.0, 0.0));
    }

    #[tokio::test]
    async fn test_render_plan() {
        let cache = TileCache::new(&MapConfig::in_memory(), MockSource::default()).unwrap();
        let vp = viewport(37.77, -122.41, 15);
        let entity = TrackedEntity {
            id: "alpha".to_string(),
            color: Rgb::new(255, 0, 0),
            position: GeoPoint::new(37.77, -122.41),
            heading: 45.0,
            altitude: 10.0,
            speed: 5.0,
            last_update: Utc::now(),
            path: VecDeque::from(vec![PositionPoint {
                lat: 37.769,
                lon: -122.41,
                altitude: 10.0,
                timestamp: Utc::now(),
            }]),
            home: Some(GeoPoint::new(37.769, -122.41)),
        };

        let plan = vp.render_plan(&cache, std::slice::from_ref(&entity), &Mission::new());

        assert_eq!(plan.tiles.len(), vp.tile_placements().len());
        assert!(plan.tiles.iter().all(|t| !matches!(t.result, TileResult::Failed(_))));
        assert_eq!(plan.entities.len(), 1);
        let draw = &plan.entities[0];
        assert!(close(draw.position.x, 400.0, 1e-6));
        assert_eq!(draw.path.len(), 1);
        assert!(draw.path[0].y > 300.0);
        assert_eq!(draw.home, Some(draw.path[0]));
        assert_eq!(plan.mission, MissionDraw::default());

        for _ in 0..500 {
            if vp.render_plan(&cache, &[], &Mission::new()).pending_tiles() == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("tiles never loaded");
    }

    #[test]
    fn test_project_mission() {
        let vp = viewport(37.77, -122.41, 15);
        let mut mission = Mission::new();
        mission.add_waypoint(GeoPoint::new(37.77, -122.41), 40.0).unwrap();

        // A single waypoint gets a marker but no route
        let draw = vp.project_mission(&mission);
        assert_eq!(draw.waypoints.len(), 1);
        assert!(draw.route.is_empty());
        assert!(close(draw.waypoints[0].position.x, 400.0, 1e-6));
        assert!(close(draw.waypoints[0].position.y, 300.0, 1e-6));

        mission.add_waypoint(GeoPoint::new(37.771, -122.409), 60.0).unwrap();
        mission
            .set_geofence(vec![
                GeoPoint::new(37.765, -122.415),
                GeoPoint::new(37.765, -122.405),
                GeoPoint::new(37.775, -122.405),
                GeoPoint::new(37.775, -122.415),
            ])
            .unwrap();
        mission.add_rally_point(GeoPoint::new(37.769, -122.41)).unwrap();

        let draw = vp.project_mission(&mission);
        let numbers: Vec<usize> = draw.waypoints.iter().map(|w| w.number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(draw.waypoints[1].altitude, 60.0);
        assert_eq!(draw.route, vec![draw.waypoints[0].position, draw.waypoints[1].position]);

        // North-east of the centre is up and to the right
        assert!(draw.route[1].x > 400.0 && draw.route[1].y < 300.0);

        assert_eq!(draw.geofence.len(), 4);
        assert!(draw.geofence[0].x < 400.0 && draw.geofence[0].y > 300.0);
        assert!(draw.geofence[2].x > 400.0 && draw.geofence[2].y < 300.0);
        assert_eq!(draw.rally_points.len(), 1);
        assert!(close(draw.rally_points[0].x, 400.0, 1e-6));
        assert!(draw.rally_points[0].y > 300.0);
    }
}

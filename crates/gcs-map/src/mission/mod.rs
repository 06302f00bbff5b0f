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

//! Mission markers drawn over the map: an ordered waypoint route, a geofence
//! polygon and rally points.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tile::GeoPoint;

/// Altitude given to waypoints added without one, in metres.
pub const DEFAULT_WAYPOINT_ALTITUDE: f64 = 100.0;

/// A geofence needs at least this many vertices to enclose an area.
pub const MIN_GEOFENCE_VERTICES: usize = 3;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MissionError {
    #[error("invalid position {lat}, {lon}")]
    InvalidPosition { lat: f64, lon: f64 },

    #[error("invalid altitude {0}")]
    InvalidAltitude(f64),

    #[error("geofence needs at least 3 vertices, got {0}")]
    GeofenceTooSmall(usize),
}

/// A route point with its target altitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub position: GeoPoint,
    /// Metres.
    pub altitude: f64,
}

/// Planned route, boundary and fallback landing points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    #[serde(default)]
    waypoints: Vec<Waypoint>,
    /// Open ring; the last vertex connects back to the first
    #[serde(default)]
    geofence: Vec<GeoPoint>,
    #[serde(default)]
    rally_points: Vec<GeoPoint>,
}

fn checked(point: GeoPoint) -> Result<GeoPoint, MissionError> {
    if point.is_valid() {
        Ok(point)
    } else {
        Err(MissionError::InvalidPosition {
            lat: point.lat,
            lon: point.lon,
        })
    }
}

impl Mission {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a waypoint to the end of the route.
    pub fn add_waypoint(&mut self, position: GeoPoint, altitude: f64) -> Result<(), MissionError> {
        if !altitude.is_finite() {
            return Err(MissionError::InvalidAltitude(altitude));
        }
        self.waypoints.push(Waypoint {
            position: checked(position)?,
            altitude,
        });
        Ok(())
    }

    pub fn clear_waypoints(&mut self) {
        self.waypoints.clear();
    }

    /// Replace the geofence. An empty list removes it.
    pub fn set_geofence(&mut self, vertices: Vec<GeoPoint>) -> Result<(), MissionError> {
        if !vertices.is_empty() && vertices.len() < MIN_GEOFENCE_VERTICES {
            return Err(MissionError::GeofenceTooSmall(vertices.len()));
        }
        let mut vertices = vertices
            .into_iter()
            .map(checked)
            .collect::<Result<Vec<_>, _>>()?;

        // Accept closed rings too
        if vertices.len() > MIN_GEOFENCE_VERTICES && vertices.first() == vertices.last() {
            vertices.pop();
        }
        self.geofence = vertices;
        Ok(())
    }

    pub fn clear_geofence(&mut self) {
        self.geofence.clear();
    }

    pub fn add_rally_point(&mut self, position: GeoPoint) -> Result<(), MissionError> {
        self.rally_points.push(checked(position)?);
        Ok(())
    }

    pub fn clear_rally_points(&mut self) {
        self.rally_points.clear();
    }

    #[must_use]
    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    #[must_use]
    pub fn geofence(&self) -> &[GeoPoint] {
        &self.geofence
    }

    #[must_use]
    pub fn rally_points(&self) -> &[GeoPoint] {
        &self.rally_points
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty() && self.geofence.is_empty() && self.rally_points.is_empty()
    }

    /// Length of the waypoint route in metres.
    #[must_use]
    pub fn route_length_m(&self) -> f64 {
        self.waypoints
            .windows(2)
            .map(|pair| pair[0].position.distance_m(&pair[1].position))
            .sum()
    }

    /// Whether `point` lies inside the geofence, or `None` when no fence is set.
    ///
    /// Uses ray casting on latitude/longitude, which is accurate for fences
    /// that do not cross the antimeridian.
    #[must_use]
    pub fn geofence_contains(&self, point: &GeoPoint) -> Option<bool> {
        let fence = &self.geofence;
        if fence.len() < MIN_GEOFENCE_VERTICES {
            return None;
        }

        let mut inside = false;
        let mut j = fence.len() - 1;
        for i in 0..fence.len() {
            let (a, b) = (fence[i], fence[j]);
            if (a.lat > point.lat) != (b.lat > point.lat)
                && point.lon < (b.lon - a.lon) * (point.lat - a.lat) / (b.lat - a.lat) + a.lon
            {
                inside = !inside;
            }
            j = i;
        }
        Some(inside)
    }
}

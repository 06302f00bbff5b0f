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

//! Simulated drones flying circles around a point, for exercising the map
//! without a telemetry link.

use std::f64::consts::PI;

use chrono::{DateTime, Utc};
use gcs_map::{GeoPoint, Mission, MissionError, Telemetry};

/// Metres per degree of latitude (approximate).
const METERS_PER_DEGREE: f64 = 111_320.0;

/// A constant-speed circular orbit.
#[derive(Debug, Clone, PartialEq)]
pub struct Orbit {
    center_lat: f64,
    center_lon: f64,
    radius_m: f64,
    altitude_m: f64,
    speed_mps: f64,
    start_angle: f64,
    period_secs: f64,
}

impl Orbit {
    pub fn new(
        center_lat: f64,
        center_lon: f64,
        radius_m: f64,
        altitude_m: f64,
        speed_mps: f64,
        start_angle: f64,
    ) -> Self {
        let period_secs = 2.0 * PI * radius_m / speed_mps.max(f64::EPSILON);
        Self {
            center_lat,
            center_lon,
            radius_m,
            altitude_m,
            speed_mps,
            start_angle,
            period_secs,
        }
    }

    /// `count` orbits of growing radius, evenly spread around the circle.
    pub fn fleet(center_lat: f64, center_lon: f64, count: usize) -> Vec<Self> {
        (0..count)
            .map(|i| {
                let i = i as f64;
                Self::new(
                    center_lat,
                    center_lon,
                    300.0 + 150.0 * i,
                    60.0 + 20.0 * i,
                    12.0,
                    2.0 * PI * i / count as f64,
                )
            })
            .collect()
    }

    /// The point `bearing` radians clockwise from north on this orbit.
    fn point_at(&self, bearing: f64) -> GeoPoint {
        offset(self.center_lat, self.center_lon, self.radius_m, bearing)
    }

    /// Telemetry `elapsed_secs` into the flight.
    pub fn sample(&self, elapsed_secs: f64, timestamp: DateTime<Utc>) -> Telemetry {
        let angle = self.start_angle + 2.0 * PI * elapsed_secs / self.period_secs;

        let position = self.point_at(angle);

        // Angle is a bearing from the centre, so the orbit runs clockwise
        let heading = (angle.to_degrees() + 90.0).rem_euclid(360.0);

        Telemetry {
            lat: position.lat,
            lon: position.lon,
            heading,
            altitude: self.altitude_m,
            speed: self.speed_mps,
            timestamp,
        }
    }
}

fn offset(lat: f64, lon: f64, distance_m: f64, bearing: f64) -> GeoPoint {
    GeoPoint::new(
        lat + distance_m / METERS_PER_DEGREE * bearing.cos(),
        lon + distance_m / (METERS_PER_DEGREE * lat.to_radians().cos()) * bearing.sin(),
    )
}

/// A mission around a fleet: waypoints at the compass points of the outer
/// orbit, a square geofence with a 200 m margin and a rally point at the
/// centre.
pub fn survey_mission(fleet: &[Orbit]) -> Result<Mission, MissionError> {
    let mut mission = Mission::new();
    let Some(outer) = fleet.iter().max_by(|a, b| a.radius_m.total_cmp(&b.radius_m)) else {
        return Ok(mission);
    };

    for i in 0..4 {
        let bearing = f64::from(i) * PI / 2.0;
        mission.add_waypoint(outer.point_at(bearing), outer.altitude_m)?;
    }

    let half = (outer.radius_m + 200.0) * std::f64::consts::SQRT_2;
    let corners = [PI / 4.0, 3.0 * PI / 4.0, 5.0 * PI / 4.0, 7.0 * PI / 4.0]
        .into_iter()
        .map(|bearing| offset(outer.center_lat, outer.center_lon, half, bearing))
        .collect();
    mission.set_geofence(corners)?;
    mission.add_rally_point(GeoPoint::new(outer.center_lat, outer.center_lon))?;
    Ok(mission)
}

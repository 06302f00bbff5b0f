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

//! Drone tracking and flight-path history.
//!
//! [`EntityTracker`] is a keyed registry of [`TrackedEntity`] values fed by a
//! telemetry source. Each entity gets a marker colour from a fixed palette and
//! a bounded flight path. Changes are announced on a broadcast channel.
//!
//! [`TrackerHandle`] shares a tracker between the telemetry writer and the
//! render loop; readers always receive owned snapshots.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::tile::GeoPoint;

/// Flight path length kept per entity unless configured otherwise.
pub const DEFAULT_PATH_CAPACITY: usize = 1000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A marker colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse `#RRGGBB` (the leading `#` is optional).
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if digits.len() != 6 || !digits.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Red, blue, green, yellow, magenta, cyan.
pub const DEFAULT_PALETTE: [Rgb; 6] = [
    Rgb::new(0xFF, 0x00, 0x00),
    Rgb::new(0x00, 0x00, 0xFF),
    Rgb::new(0x00, 0xFF, 0x00),
    Rgb::new(0xFF, 0xFF, 0x00),
    Rgb::new(0xFF, 0x00, 0xFF),
    Rgb::new(0x00, 0xFF, 0xFF),
];

/// What happens when every palette colour is already in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PalettePolicy {
    /// Reuse colours round-robin.
    #[default]
    Cycle,
    /// Refuse to create the entity.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("entity limit of {0} reached")]
    CapacityReached(usize),

    #[error("all {0} marker colours are in use")]
    PaletteExhausted(usize),

    #[error("invalid telemetry for {id}: {reason}")]
    InvalidTelemetry { id: String, reason: String },
}

/// One telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Telemetry {
    pub lat: f64,
    pub lon: f64,
    /// Degrees clockwise from north; any finite value is normalised.
    pub heading: f64,
    /// Metres.
    pub altitude: f64,
    /// Metres per second.
    pub speed: f64,
    pub timestamp: DateTime<Utc>,
}

/// A single flight-path sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionPoint {
    pub lat: f64,
    pub lon: f64,
    pub altitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Tracked drone state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    pub id: String,
    pub color: Rgb,
    pub position: GeoPoint,
    /// Degrees in [0, 360).
    pub heading: f64,
    pub altitude: f64,
    pub speed: f64,
    /// Timestamp of the last accepted telemetry.
    pub last_update: DateTime<Utc>,
    /// Oldest first.
    pub path: VecDeque<PositionPoint>,
    pub home: Option<GeoPoint>,
}

impl TrackedEntity {
    fn new(id: String, color: Rgb, telemetry: &Telemetry) -> Self {
        Self {
            id,
            color,
            position: GeoPoint::new(telemetry.lat, telemetry.lon),
            heading: 0.0,
            altitude: telemetry.altitude,
            speed: telemetry.speed,
            last_update: telemetry.timestamp,
            path: VecDeque::new(),
            home: None,
        }
    }

    /// Apply live fields and extend the path. Returns whether a point was appended.
    fn apply(&mut self, telemetry: &Telemetry, capacity: usize, epsilon: f64) -> bool {
        self.position = GeoPoint::new(telemetry.lat, telemetry.lon);
        self.heading = telemetry.heading.rem_euclid(360.0);
        self.altitude = telemetry.altitude;
        self.speed = telemetry.speed;
        self.last_update = telemetry.timestamp;

        // (0, 0) is what autopilots report before a GPS fix
        if telemetry.lat == 0.0 && telemetry.lon == 0.0 {
            return false;
        }

        let moved = self.path.back().map_or(true, |last| {
            (last.lat - telemetry.lat).abs() > epsilon || (last.lon - telemetry.lon).abs() > epsilon
        });
        if !moved {
            return false;
        }

        self.path.push_back(PositionPoint {
            lat: telemetry.lat,
            lon: telemetry.lon,
            altitude: telemetry.altitude,
            timestamp: telemetry.timestamp,
        });
        while self.path.len() > capacity {
            self.path.pop_front();
        }
        true
    }
}

/// Result of a successful upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

/// Events emitted by the tracker when entity state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerEvent {
    EntityAdded(String),
    PositionUpdated(String),
    EntityRemoved(String),
}

/// Configuration for the entity tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    /// Maximum number of entities; `None` for no limit.
    pub max_entities: Option<usize>,
    /// Flight path points kept per entity.
    pub path_capacity: usize,
    pub palette: Vec<Rgb>,
    pub palette_policy: PalettePolicy,
    /// Movement in degrees below which no path point is added.
    pub path_epsilon_deg: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_entities: Some(2),
            path_capacity: DEFAULT_PATH_CAPACITY,
            palette: DEFAULT_PALETTE.to_vec(),
            palette_policy: PalettePolicy::Cycle,
            path_epsilon_deg: 1e-7,
        }
    }
}

/// Registry of tracked entities, iterated in insertion order.
pub struct EntityTracker {
    entities: HashMap<String, TrackedEntity>,
    order: Vec<String>,
    config: TrackerConfig,
    cycle_index: usize,
    event_tx: broadcast::Sender<TrackerEvent>,
}

impl fmt::Debug for EntityTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityTracker")
            .field("entity_count", &self.entities.len())
            .field("max_entities", &self.config.max_entities)
            .finish_non_exhaustive()
    }
}

impl Default for EntityTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl EntityTracker {
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entities: HashMap::new(),
            order: Vec::new(),
            config,
            cycle_index: 0,
            event_tx,
        }
    }

    /// Create or update an entity from a telemetry sample.
    ///
    /// Late samples are accepted as current.
    pub fn upsert(
        &mut self,
        id: &str,
        telemetry: Telemetry,
    ) -> Result<UpsertOutcome, TrackerError> {
        validate(id, &telemetry)?;

        let capacity = self.config.path_capacity.max(1);
        let epsilon = self.config.path_epsilon_deg;

        if let Some(entity) = self.entities.get_mut(id) {
            entity.apply(&telemetry, capacity, epsilon);
            let _ = self.event_tx.send(TrackerEvent::PositionUpdated(id.to_string()));
            return Ok(UpsertOutcome::Updated);
        }

        if let Some(max) = self.config.max_entities {
            if self.entities.len() >= max {
                return Err(TrackerError::CapacityReached(max));
            }
        }
        let color = self.assign_color()?;

        let mut entity = TrackedEntity::new(id.to_string(), color, &telemetry);
        entity.apply(&telemetry, capacity, epsilon);
        info!("Tracking new entity {} with colour {}", id, color);

        self.entities.insert(id.to_string(), entity);
        self.order.push(id.to_string());
        let _ = self.event_tx.send(TrackerEvent::EntityAdded(id.to_string()));
        Ok(UpsertOutcome::Created)
    }

    fn assign_color(&mut self) -> Result<Rgb, TrackerError> {
        let palette = &self.config.palette;
        if palette.is_empty() {
            return Err(TrackerError::PaletteExhausted(0));
        }

        let unused = palette
            .iter()
            .find(|color| !self.entities.values().any(|e| e.color == **color));
        if let Some(color) = unused {
            return Ok(*color);
        }

        match self.config.palette_policy {
            PalettePolicy::Cycle => {
                let color = palette[self.cycle_index % palette.len()];
                self.cycle_index += 1;
                Ok(color)
            }
            PalettePolicy::Reject => Err(TrackerError::PaletteExhausted(palette.len())),
        }
    }

    /// Remove an entity and its path. Returns the removed entity.
    pub fn remove(&mut self, id: &str) -> Option<TrackedEntity> {
        let entity = self.entities.remove(id)?;
        self.order.retain(|existing| existing != id);
        debug!("Stopped tracking entity {}", id);
        let _ = self.event_tx.send(TrackerEvent::EntityRemoved(id.to_string()));
        Some(entity)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TrackedEntity> {
        self.entities.get(id)
    }

    /// All entities in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<&TrackedEntity> {
        self.order.iter().filter_map(|id| self.entities.get(id)).collect()
    }

    /// Set the home (launch) position. Returns false for unknown ids.
    pub fn set_home(&mut self, id: &str, home: GeoPoint) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.home = Some(home);
                true
            }
            None => false,
        }
    }

    /// Forget the flight path but keep the entity. Returns false for unknown ids.
    pub fn clear_path(&mut self, id: &str) -> bool {
        match self.entities.get_mut(id) {
            Some(entity) => {
                entity.path.clear();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.event_tx.subscribe()
    }
}

fn validate(id: &str, telemetry: &Telemetry) -> Result<(), TrackerError> {
    let invalid = |reason: String| TrackerError::InvalidTelemetry {
        id: id.to_string(),
        reason,
    };

    if !GeoPoint::new(telemetry.lat, telemetry.lon).is_valid() {
        return Err(invalid(format!(
            "position ({}, {}) out of range",
            telemetry.lat, telemetry.lon
        )));
    }
    if !telemetry.heading.is_finite()
        || !telemetry.altitude.is_finite()
        || !telemetry.speed.is_finite()
    {
        return Err(invalid("non-finite heading, altitude or speed".to_string()));
    }
    Ok(())
}

/// Shared, thread-safe access to an [`EntityTracker`].
///
/// Every read returns an owned copy taken under one lock, so position,
/// heading and path always belong to the same update.
#[derive(Debug, Clone, Default)]
pub struct TrackerHandle {
    tracker: Arc<RwLock<EntityTracker>>,
}

impl TrackerHandle {
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            tracker: Arc::new(RwLock::new(EntityTracker::new(config))),
        }
    }

    pub fn upsert(&self, id: &str, telemetry: Telemetry) -> Result<UpsertOutcome, TrackerError> {
        self.tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(id, telemetry)
    }

    pub fn remove(&self, id: &str) -> Option<TrackedEntity> {
        self.tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    pub fn set_home(&self, id: &str, home: GeoPoint) -> bool {
        self.tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_home(id, home)
    }

    pub fn clear_path(&self, id: &str) -> bool {
        self.tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_path(id)
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityTracker> {
        self.tracker.read().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<TrackedEntity> {
        self.read().get(id).cloned()
    }

    #[must_use]
    pub fn all(&self) -> Vec<TrackedEntity> {
        self.read().all().into_iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.read().subscribe()
    }
}

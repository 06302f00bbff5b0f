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

//! Map core for a UAV ground control station.
//!
//! This library provides the non-UI half of a slippy map: tile addressing,
//! a bounded persistent tile cache fed by an async download pool, a registry
//! of tracked drones, and the pan/zoom transform that ties them to the screen.
//! The layers can be used independently or composed together:
//!
//! - **Tile layer**: Web-Mercator addressing ([`tile`])
//! - **Store layer**: LRU-bounded memory and disk storage ([`store`])
//! - **Fetch layer**: Deduplicating download workers with retry and cooldown ([`fetch`])
//! - **Cache layer**: Non-blocking render-loop entry point ([`cache`])
//! - **Tracker layer**: Drone state, colours and flight paths ([`tracker`])
//! - **Mission layer**: Waypoints, geofence and rally points ([`mission`])
//! - **Viewport layer**: Pan/zoom state and screen projection ([`viewport`])
//!
//! # Quick Start
//!
//! ```no_run
//! use gcs_map::{GeoPoint, MapConfig, MapViewport, Mission, Telemetry, TileCache, TrackerHandle};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = MapConfig::default();
//!     let cache = TileCache::from_config(&config).expect("valid config");
//!     let tracker = TrackerHandle::new(config.tracker_config().expect("valid config"));
//!     let viewport = MapViewport::new(&config, 1280, 720);
//!     let mut mission = Mission::new();
//!     mission
//!         .add_waypoint(GeoPoint::new(28.6150, 77.2100), 80.0)
//!         .expect("valid waypoint");
//!
//!     tracker
//!         .upsert(
//!             "drone-1",
//!             Telemetry {
//!                 lat: 28.6139,
//!                 lon: 77.2090,
//!                 heading: 90.0,
//!                 altitude: 120.0,
//!                 speed: 8.0,
//!                 timestamp: chrono::Utc::now(),
//!             },
//!         )
//!         .expect("room for one drone");
//!
//!     // Render loop
//!     loop {
//!         let plan = viewport.render_plan(&cache, &tracker.all(), &mission);
//!         for tile in &plan.tiles {
//!             let placement = &tile.placement;
//!             let ready = tile.result.is_ready();
//!             println!(
//!                 "{} at ({}, {}): ready={}",
//!                 placement.key, placement.x, placement.y, ready
//!             );
//!         }
//!         tokio::time::sleep(Duration::from_millis(16)).await;
//!     }
//! }
//! ```
//!
//! # Using Individual Layers
//!
//! ## Tile Layer Only
//!
//! ```
//! use gcs_map::tile::{to_tile, TileKey, GeoPoint};
//!
//! let (x, y) = to_tile(51.5074, -0.1278, 10).unwrap();
//! assert_eq!((x, y), (511, 340));
//!
//! let london = GeoPoint::new(51.5074, -0.1278);
//! let key = TileKey::containing("OpenStreetMap", london, 10).unwrap();
//! assert!(key.bounds().contains(&london));
//! ```
//!
//! ## Tracker Layer Only
//!
//! ```
//! use gcs_map::tracker::{EntityTracker, Telemetry, TrackerConfig};
//!
//! let mut tracker = EntityTracker::new(TrackerConfig::default());
//! let sample = Telemetry {
//!     lat: 28.6,
//!     lon: 77.2,
//!     heading: 0.0,
//!     altitude: 50.0,
//!     speed: 3.0,
//!     timestamp: chrono::Utc::now(),
//! };
//! tracker.upsert("alpha", sample).unwrap();
//! assert_eq!(tracker.get("alpha").map(|e| e.path.len()), Some(1));
//! ```

pub mod cache;
pub mod config;
pub mod fetch;
pub mod mission;
pub mod store;
pub mod tile;
pub mod tracker;
pub mod viewport;

#[cfg(test)]
mod test_support;

pub use cache::{CacheStats, TileCache, TileEvent, TileResult};
pub use config::{ConfigError, MapConfig};
pub use fetch::{
    FetchError, FetchHandle, FetchStatus, FetcherConfig, HttpTileSource, ProviderRegistry,
    QueuePolicy, TileFetcher, TileProvider, TileSource,
};
pub use mission::{Mission, MissionError, Waypoint};
pub use store::{StoreConfig, StoreError, StoreHealth, TileStore};
pub use tile::{AddressError, GeoPoint, TileKey};
pub use tracker::{
    EntityTracker, PalettePolicy, Rgb, Telemetry, TrackedEntity, TrackerConfig, TrackerError,
    TrackerEvent, TrackerHandle,
};
pub use viewport::{MapViewport, MissionDraw, RenderPlan, WaypointDraw};

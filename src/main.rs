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

//! Headless map driver.
//!
//! Runs the render loop against a virtual screen: fills the tile cache for
//! the requested view, optionally flies simulated drones through the tracker
//! around a survey mission, and reports cache statistics.

mod config;
mod sim;

use std::collections::HashSet;
use std::error::Error;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::Parser;
use gcs_map::{GeoPoint, MapViewport, TileCache, TileEvent, TileResult, TrackerHandle};
use log::{debug, info, warn};

use config::AppConfig;
use sim::{survey_mission, Orbit};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Load map tiles for a view and track simulated drones
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Centre latitude (defaults to the configured view)
    #[arg(long, allow_hyphen_values = true)]
    lat: Option<f64>,

    /// Centre longitude (defaults to the configured view)
    #[arg(long, allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Zoom level
    #[arg(long)]
    zoom: Option<u8>,

    /// Tile provider name
    #[arg(long)]
    provider: Option<String>,

    /// Virtual screen width in pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Virtual screen height in pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Number of simulated drones
    #[arg(long, default_value_t = 0)]
    drones: usize,

    /// Stop after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Empty the tile cache before starting
    #[arg(long)]
    clear_cache: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let app_config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&app_config.log_level),
    )
    .init();

    if let Ok(path) = AppConfig::get_config_path() {
        debug!("Config file: {}", path.display());
    }

    let mut map_config = app_config.map.clone();
    if let Some(provider) = &args.provider {
        map_config.view.default_provider.clone_from(provider);
    }

    if args.print_config {
        println!("{map_config:#?}");
        return Ok(());
    }

    map_config.validate()?;

    let cache = TileCache::from_config(&map_config)?;
    if args.clear_cache {
        cache.clear();
    }

    let center = GeoPoint::new(
        args.lat.unwrap_or(map_config.view.default_lat),
        args.lon.unwrap_or(map_config.view.default_lon),
    );
    let viewport = MapViewport::new(&map_config, args.width, args.height)
        .with_center(center, args.zoom.unwrap_or(map_config.view.default_zoom))?;
    info!(
        "Viewing {} at ({:.5}, {:.5}) zoom {} on a {}x{} screen",
        viewport.provider(),
        viewport.center().lat,
        viewport.center().lon,
        viewport.zoom(),
        args.width,
        args.height
    );

    let tracker = TrackerHandle::new(map_config.tracker_config()?);
    let fleet = Orbit::fleet(viewport.center().lat, viewport.center().lon, args.drones);
    let mission = survey_mission(&fleet)?;
    if !mission.is_empty() {
        info!(
            "Mission: {} waypoints over {:.0} m, {} geofence vertices, {} rally points",
            mission.waypoints().len(),
            mission.route_length_m(),
            mission.geofence().len(),
            mission.rally_points().len()
        );
    }

    let mut events = cache.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TileEvent::Evicted(key)) => debug!("Evicted {}", key),
                Ok(event) => debug!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Missed {} tile events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut rejected = HashSet::new();
    let mut outside = HashSet::new();
    let started = Instant::now();
    let deadline = Duration::from_secs(args.timeout_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(app_config.update_rate_ms.max(1)));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }

        let elapsed = started.elapsed();
        for (i, orbit) in fleet.iter().enumerate() {
            let id = format!("drone-{}", i + 1);
            if let Err(e) = tracker.upsert(&id, orbit.sample(elapsed.as_secs_f64(), Utc::now())) {
                if rejected.insert(id.clone()) {
                    warn!("Dropping telemetry for {}: {}", id, e);
                }
            }
        }

        let entities = tracker.all();
        for entity in &entities {
            if mission.geofence_contains(&entity.position) == Some(false)
                && outside.insert(entity.id.clone())
            {
                warn!("{} left the geofence", entity.id);
            }
        }

        let plan = viewport.render_plan(&cache, &entities, &mission);
        let pending = plan.pending_tiles();
        let failed = plan
            .tiles
            .iter()
            .filter(|t| matches!(t.result, TileResult::Failed(_)))
            .count();
        debug!(
            "Frame: {} tiles ({} pending, {} failed), {} drones",
            plan.tiles.len(),
            pending,
            failed,
            plan.entities.len()
        );

        if pending == 0 && fleet.is_empty() {
            info!(
                "View loaded in {:.1}s ({} tiles, {} failed)",
                elapsed.as_secs_f64(),
                plan.tiles.len(),
                failed
            );
            break;
        }
        if elapsed >= deadline {
            if pending > 0 {
                warn!("Stopped with {} tiles still pending", pending);
            }
            break;
        }
    }

    for entity in tracker.all() {
        info!(
            "{} {} at ({:.5}, {:.5}) heading {:.0} with {} path points",
            entity.id,
            entity.color,
            entity.position.lat,
            entity.position.lon,
            entity.heading,
            entity.path.len()
        );
    }

    let stats = cache.stats();
    info!(
        "Cache: {} tiles, {:.1} MB, hit rate {:.1}%, {:?}",
        stats.tiles,
        stats.total_bytes as f64 / 1_048_576.0,
        stats.hit_rate_percent,
        stats.health
    );
    info!(
        "Downloads: {} ok, {} failed, {} from disk, {} coalesced, {:.0} ms average",
        stats.fetch.succeeded,
        stats.fetch.failed,
        stats.fetch.store_loads,
        stats.fetch.coalesced,
        stats.fetch.average_download_ms
    );

    cache.shutdown();
    Ok(())
}

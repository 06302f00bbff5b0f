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

//! Map core configuration.
//!
//! One [`MapConfig`] is built at startup and handed to the cache, viewport and
//! tracker constructors. Every field has a serde default so partial config
//! files load cleanly.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::provider::{ProviderRegistry, TileProvider, ESRI_WORLD_IMAGERY};
use crate::fetch::{FetcherConfig, QueuePolicy};
use crate::store::StoreConfig;
use crate::tile::{TILE_SIZE, MAX_ZOOM};
use crate::tracker::{PalettePolicy, Rgb, TrackerConfig, DEFAULT_PATH_CAPACITY};

/// Directory name under the platform cache directory.
pub const CACHE_DIR_NAME: &str = "asra-map";

/// Configuration errors. These are the only fatal errors of the map core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("tile cache capacity must be positive, got {0}")]
    CacheExhausted(i64),

    #[error("invalid zoom range: min {min} > max {max}")]
    InvalidZoomRange { min: u8, max: u8 },

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("unknown tile provider: {0}")]
    UnknownProvider(String),
}

/// Initial view and zoom limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewSettings {
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_lat")]
    pub default_lat: f64,

    #[serde(default = "default_lon")]
    pub default_lon: f64,

    #[serde(default = "default_zoom")]
    pub default_zoom: u8,

    #[serde(default = "default_min_zoom")]
    pub min_zoom: u8,

    #[serde(default = "default_max_zoom")]
    pub max_zoom: u8,

    /// Tile edge length in pixels
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
}

/// Tile store sizing and location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Keep tiles on disk between sessions
    #[serde(default = "default_true")]
    pub persistent: bool,

    /// Overrides the platform cache directory
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Signed so that a negative value in a config file is reported, not wrapped
    #[serde(default = "default_max_cache_tiles")]
    pub max_cache_tiles: i64,

    #[serde(default = "default_max_cache_mb")]
    pub max_cache_mb: Option<u64>,

    /// Tiles not used for this many days are removed at startup
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u64>,
}

/// Download pool behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: f64,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_failure_cooldown_secs")]
    pub failure_cooldown_secs: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default)]
    pub queue_policy: QueuePolicy,
}

/// Drone tracking behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// `None` removes the limit
    #[serde(default = "default_max_entities")]
    pub max_entities: Option<usize>,

    #[serde(default = "default_path_capacity")]
    pub path_capacity: usize,

    /// Marker colours as `#RRGGBB`, assigned in order
    #[serde(default = "default_colors")]
    pub colors: Vec<String>,

    #[serde(default)]
    pub palette_policy: PalettePolicy,

    /// Minimum movement in degrees before a path point is appended
    #[serde(default = "default_path_epsilon_deg")]
    pub path_epsilon_deg: f64,
}

/// Configuration for the whole map core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapConfig {
    #[serde(default)]
    pub view: ViewSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub tracker: TrackerSettings,

    /// Additional providers; an entry named like a built-in replaces it
    #[serde(default)]
    pub providers: Vec<TileProvider>,
}

// Default value functions for serde
fn default_provider() -> String {
    ESRI_WORLD_IMAGERY.to_string()
}

fn default_lat() -> f64 {
    28.6139
}

fn default_lon() -> f64 {
    77.2090
}

fn default_zoom() -> u8 {
    12
}

fn default_min_zoom() -> u8 {
    3
}

fn default_max_zoom() -> u8 {
    19
}

fn default_tile_size() -> u32 {
    TILE_SIZE
}

fn default_true() -> bool {
    true
}

fn default_max_cache_tiles() -> i64 {
    400
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an optional field")]
fn default_max_cache_mb() -> Option<u64> {
    Some(500)
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an optional field")]
fn default_max_age_days() -> Option<u64> {
    Some(30)
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_download_timeout_secs() -> f64 {
    5.0
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_failure_cooldown_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "ASRA-GCS/2.0".to_string()
}

#[allow(clippy::unnecessary_wraps, reason = "serde default for an optional field")]
fn default_max_entities() -> Option<usize> {
    Some(2)
}

fn default_path_capacity() -> usize {
    DEFAULT_PATH_CAPACITY
}

fn default_colors() -> Vec<String> {
    ["#FF0000", "#0000FF", "#00FF00", "#FFFF00", "#FF00FF", "#00FFFF"]
        .iter()
        .map(|c| (*c).to_string())
        .collect()
}

fn default_path_epsilon_deg() -> f64 {
    1e-7
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_lat: default_lat(),
            default_lon: default_lon(),
            default_zoom: default_zoom(),
            min_zoom: default_min_zoom(),
            max_zoom: default_max_zoom(),
            tile_size: default_tile_size(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            persistent: true,
            directory: None,
            max_cache_tiles: default_max_cache_tiles(),
            max_cache_mb: default_max_cache_mb(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: default_max_concurrent_downloads(),
            download_timeout_secs: default_download_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            failure_cooldown_secs: default_failure_cooldown_secs(),
            user_agent: default_user_agent(),
            queue_policy: QueuePolicy::default(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_entities: default_max_entities(),
            path_capacity: default_path_capacity(),
            colors: default_colors(),
            palette_policy: PalettePolicy::default(),
            path_epsilon_deg: default_path_epsilon_deg(),
        }
    }
}

impl MapConfig {
    /// Configuration for an in-memory cache, mostly useful in tests.
    #[must_use]
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.cache.persistent = false;
        config
    }

    /// Check every section. Called by the constructors that consume the config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let view = &self.view;
        if view.min_zoom > view.max_zoom || view.max_zoom > MAX_ZOOM {
            return Err(ConfigError::InvalidZoomRange {
                min: view.min_zoom,
                max: view.max_zoom,
            });
        }
        if view.tile_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "view.tile_size",
                value: view.tile_size.to_string(),
            });
        }
        if !view.default_lat.is_finite()
            || !view.default_lon.is_finite()
            || view.default_lat.abs() > 90.0
            || view.default_lon.abs() > 180.0
        {
            return Err(ConfigError::InvalidValue {
                field: "view.default_lat/default_lon",
                value: format!("{}, {}", view.default_lat, view.default_lon),
            });
        }
        if !self.provider_registry().contains(&view.default_provider) {
            return Err(ConfigError::UnknownProvider(view.default_provider.clone()));
        }

        self.store_config()?;
        self.fetcher_config()?;
        self.tracker_config()?;
        Ok(())
    }

    /// Built-in providers merged with the configured ones.
    #[must_use]
    pub fn provider_registry(&self) -> ProviderRegistry {
        ProviderRegistry::with_defaults(&self.providers)
    }

    /// Directory for persisted tiles, or `None` when caching in memory only.
    #[must_use]
    pub fn cache_directory(&self) -> Option<PathBuf> {
        if !self.cache.persistent {
            return None;
        }
        Some(self.cache.directory.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join(CACHE_DIR_NAME)
                .join("tiles")
        }))
    }

    pub fn store_config(&self) -> Result<StoreConfig, ConfigError> {
        let max_tiles = self.cache.max_cache_tiles;
        if max_tiles <= 0 {
            return Err(ConfigError::CacheExhausted(max_tiles));
        }
        let max_tiles = usize::try_from(max_tiles).map_err(|e| ConfigError::InvalidValue {
            field: "cache.max_cache_tiles",
            value: e.to_string(),
        })?;

        let max_bytes = match self.cache.max_cache_mb {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    field: "cache.max_cache_mb",
                    value: "0".to_string(),
                })
            }
            Some(mb) => Some(mb.saturating_mul(1024 * 1024)),
            None => None,
        };

        Ok(StoreConfig {
            directory: self.cache_directory(),
            max_tiles,
            max_bytes,
        })
    }

    /// How long unused tiles are kept on disk.
    #[must_use]
    pub fn max_tile_age(&self) -> Option<Duration> {
        self.cache
            .max_age_days
            .map(|days| Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
    }

    pub fn fetcher_config(&self) -> Result<FetcherConfig, ConfigError> {
        let network = &self.network;
        if network.max_concurrent_downloads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network.max_concurrent_downloads",
                value: "0".to_string(),
            });
        }
        let timeout = Duration::try_from_secs_f64(network.download_timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "network.download_timeout_secs",
                value: network.download_timeout_secs.to_string(),
            })?;

        Ok(FetcherConfig {
            workers: network.max_concurrent_downloads,
            timeout,
            retry_attempts: network.retry_attempts,
            retry_delay: Duration::from_millis(network.retry_delay_ms),
            failure_cooldown: Duration::from_secs(network.failure_cooldown_secs),
            queue_policy: network.queue_policy,
            ..FetcherConfig::default()
        })
    }

    pub fn tracker_config(&self) -> Result<TrackerConfig, ConfigError> {
        let tracker = &self.tracker;
        if tracker.path_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tracker.path_capacity",
                value: "0".to_string(),
            });
        }
        if !tracker.path_epsilon_deg.is_finite() || tracker.path_epsilon_deg < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "tracker.path_epsilon_deg",
                value: tracker.path_epsilon_deg.to_string(),
            });
        }
        if tracker.colors.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tracker.colors",
                value: "[]".to_string(),
            });
        }

        let palette = tracker
            .colors
            .iter()
            .map(|hex| {
                Rgb::from_hex(hex).ok_or_else(|| ConfigError::InvalidValue {
                    field: "tracker.colors",
                    value: hex.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TrackerConfig {
            max_entities: tracker.max_entities,
            path_capacity: tracker.path_capacity,
            palette,
            palette_policy: tracker.palette_policy,
            path_epsilon_deg: tracker.path_epsilon_deg,
        })
    }
}

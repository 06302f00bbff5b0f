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

//! Application configuration management.
//!
//! Settings are stored in TOML through confy. Every field has a serde
//! default so files written by older versions keep loading.

use std::path::{Path, PathBuf};

use gcs_map::MapConfig;
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "asra-map";
const CONFIG_NAME: &str = "config";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Log filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Render loop period in milliseconds
    #[serde(default = "default_update_rate_ms")]
    pub update_rate_ms: u64,

    /// Map core settings
    #[serde(default)]
    pub map: MapConfig,
}

fn default_config_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_update_rate_ms() -> u64 {
    100
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            log_level: default_log_level(),
            update_rate_ms: default_update_rate_ms(),
            map: MapConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the platform config directory, creating it on first run
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self, confy::ConfyError> {
        confy::load_path(path)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "update_rate_ms = 50\n\n\
             [map.view]\ndefault_zoom = 8\n\n\
             [map.cache]\nmax_cache_tiles = 64\n",
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.update_rate_ms, 50);
        assert_eq!(config.map.view.default_zoom, 8);
        assert_eq!(config.map.view.max_zoom, 19);
        assert_eq!(config.map.cache.max_cache_tiles, 64);
        assert_eq!(config.map.network.max_concurrent_downloads, 4);
        assert!(config.map.validate().is_ok());
    }

    #[test]
    fn test_negative_capacity_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[map.cache]\nmax_cache_tiles = -5\n").unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert!(config.map.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());
    }
}

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

//! Tile provider definitions and URL templating.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tile::TileKey;

pub const OPENSTREETMAP: &str = "OpenStreetMap";
pub const OPENSTREETMAP_HOT: &str = "OpenStreetMap HOT";
pub const CARTO_POSITRON: &str = "CartoDB Positron";
pub const CARTO_DARK_MATTER: &str = "CartoDB Dark Matter";
pub const STAMEN_TERRAIN: &str = "Stamen Terrain";
pub const STAMEN_TONER: &str = "Stamen Toner";
pub const ESRI_WORLD_IMAGERY: &str = "Esri World Imagery";

/// A tile server.
///
/// `url_template` uses `{z}`, `{x}`, `{y}` placeholders and an optional `{s}`
/// replaced by one of `subdomains`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileProvider {
    pub name: String,
    pub url_template: String,
    #[serde(default)]
    pub subdomains: Vec<String>,
    #[serde(default)]
    pub attribution: String,
}

impl TileProvider {
    pub fn new(name: &str, url_template: &str, subdomains: &[&str], attribution: &str) -> Self {
        Self {
            name: name.to_string(),
            url_template: url_template.to_string(),
            subdomains: subdomains.iter().map(|s| (*s).to_string()).collect(),
            attribution: attribution.to_string(),
        }
    }

    /// URL for the tile at `zoom/x/y`.
    ///
    /// The subdomain is picked by `(x + y + zoom) % n` so requests spread over
    /// servers while every tile always maps to the same host.
    #[must_use]
    pub fn url(&self, zoom: u8, x: u32, y: u32) -> String {
        let mut url = self
            .url_template
            .replace("{z}", &zoom.to_string())
            .replace("{x}", &x.to_string())
            .replace("{y}", &y.to_string());

        if !self.subdomains.is_empty() {
            let index =
                (u64::from(x) + u64::from(y) + u64::from(zoom)) % self.subdomains.len() as u64;
            url = url.replace("{s}", &self.subdomains[index as usize]);
        }
        url
    }
}

/// The built-in free providers.
#[must_use]
pub fn default_providers() -> Vec<TileProvider> {
    vec![
        TileProvider::new(
            OPENSTREETMAP,
            "https://tile.openstreetmap.org/{z}/{x}/{y}.png",
            &[],
            "© OpenStreetMap contributors",
        ),
        TileProvider::new(
            OPENSTREETMAP_HOT,
            "https://tile-{s}.openstreetmap.fr/hot/{z}/{x}/{y}.png",
            &["a", "b", "c"],
            "© OpenStreetMap contributors, Tiles style by Humanitarian OpenStreetMap Team",
        ),
        TileProvider::new(
            CARTO_POSITRON,
            "https://cartodb-basemaps-{s}.global.ssl.fastly.net/light_all/{z}/{x}/{y}.png",
            &["a", "b", "c", "d"],
            "© OpenStreetMap contributors © CARTO",
        ),
        TileProvider::new(
            CARTO_DARK_MATTER,
            "https://cartodb-basemaps-{s}.global.ssl.fastly.net/dark_all/{z}/{x}/{y}.png",
            &["a", "b", "c", "d"],
            "© OpenStreetMap contributors © CARTO",
        ),
        TileProvider::new(
            STAMEN_TERRAIN,
            "https://stamen-tiles-{s}.a.ssl.fastly.net/terrain/{z}/{x}/{y}.png",
            &["a", "b", "c", "d"],
            "Map tiles by Stamen Design, under CC BY 3.0",
        ),
        TileProvider::new(
            STAMEN_TONER,
            "https://stamen-tiles-{s}.a.ssl.fastly.net/toner/{z}/{x}/{y}.png",
            &["a", "b", "c", "d"],
            "Map tiles by Stamen Design, under CC BY 3.0",
        ),
        TileProvider::new(
            ESRI_WORLD_IMAGERY,
            concat!(
                "https://server.arcgisonline.com/ArcGIS/rest/services/",
                "World_Imagery/MapServer/tile/{z}/{y}/{x}"
            ),
            &[],
            "Tiles © Esri",
        ),
    ]
}

/// Providers by name.
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, TileProvider>,
}

impl ProviderRegistry {
    /// Registry of the built-in providers plus `extra`, which replace
    /// built-ins of the same name.
    #[must_use]
    pub fn with_defaults(extra: &[TileProvider]) -> Self {
        let mut registry = Self::default();
        for provider in default_providers().into_iter().chain(extra.iter().cloned()) {
            registry.insert(provider);
        }
        registry
    }

    pub fn insert(&mut self, provider: TileProvider) {
        self.providers.insert(provider.name.clone(), provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&TileProvider> {
        self.providers.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// URL for `key`, or `None` when the provider is unknown.
    #[must_use]
    pub fn url_for(&self, key: &TileKey) -> Option<String> {
        self.get(&key.provider).map(|p| p.url(key.zoom, key.x, key.y))
    }
}

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

//! Non-blocking tile access for the render loop.
//!
//! [`TileCache`] combines the [`TileStore`] and [`TileFetcher`] behind
//! [`TileCache::get_or_schedule`], which answers from memory or schedules a
//! download and returns at once. Fetch and store failures are reported as
//! [`TileResult::Failed`], never as errors.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::info;
use tokio::sync::broadcast;

use crate::config::{ConfigError, MapConfig};
use crate::fetch::{
    FetchError, FetchHandle, FetchStats, FetchStatus, Focus, HttpTileSource, TileFetcher,
    TileSource,
};
use crate::store::{Lookup, StoreHealth, TileStore};
use crate::tile::TileKey;

pub use crate::fetch::TileEvent;

/// Answer to a render-loop tile query.
#[derive(Debug, Clone, PartialEq)]
pub enum TileResult {
    Ready(Arc<Vec<u8>>),
    /// Scheduled or in flight; ask again later or wait for a [`TileEvent`].
    Pending,
    Failed(FetchError),
}

impl TileResult {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate_percent: f64,
    pub tiles: usize,
    pub total_bytes: u64,
    pub max_tiles: usize,
    pub pending: usize,
    pub health: StoreHealth,
    pub fetch: FetchStats,
}

/// Store plus fetcher behind one non-blocking entry point.
pub struct TileCache<S: TileSource = HttpTileSource> {
    store: Arc<TileStore>,
    fetcher: TileFetcher<S>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<S: TileSource> std::fmt::Debug for TileCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileCache")
            .field("store", &self.store)
            .field("fetcher", &self.fetcher)
            .finish_non_exhaustive()
    }
}

impl TileCache<HttpTileSource> {
    /// Cache that downloads from the configured HTTP providers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_config(config: &MapConfig) -> Result<Self, ConfigError> {
        let source = HttpTileSource::new(config.provider_registry(), &config.network.user_agent)
            .map_err(|e| ConfigError::InvalidValue {
                field: "network",
                value: e.to_string(),
            })?;
        Self::new(config, source)
    }
}

impl<S: TileSource> TileCache<S> {
    /// Build the store and start the fetcher.
    ///
    /// Tiles older than the configured age are purged from the store first.
    /// Must be called from within a tokio runtime.
    pub fn new(config: &MapConfig, source: S) -> Result<Self, ConfigError> {
        config.validate()?;

        let store = Arc::new(TileStore::open(&config.store_config()?)?);
        if let Some(max_age) = config.max_tile_age() {
            let purged = store.purge_older_than(max_age);
            if purged > 0 {
                info!("Removed {} tiles unused for {} days", purged, max_age.as_secs() / 86_400);
            }
        }

        let fetcher = TileFetcher::spawn(config.fetcher_config()?, source, Arc::clone(&store));

        Ok(Self {
            store,
            fetcher,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Return the tile if it is in memory, otherwise make sure it is scheduled.
    ///
    /// Never blocks and never touches disk or network on the calling thread.
    pub fn get_or_schedule(&self, key: &TileKey) -> TileResult {
        if let Lookup::Resident(record) = self.store.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return TileResult::Ready(record.image);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.fetcher.request_tile(key).status() {
            FetchStatus::Done(image) => TileResult::Ready(image),
            FetchStatus::Failed(error) => TileResult::Failed(error),
            FetchStatus::Pending | FetchStatus::InFlight | FetchStatus::Cancelled => {
                TileResult::Pending
            }
        }
    }

    /// Handle for callers that want to await a tile.
    pub fn request(&self, key: &TileKey) -> FetchHandle {
        if let Lookup::Resident(record) = self.store.lookup(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return FetchHandle::resolved(key.clone(), FetchStatus::Done(record.image));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.fetcher.request_tile(key)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.fetcher.subscribe()
    }

    /// Cancel queued requests for tiles no longer in view.
    /// Returns the number cancelled.
    pub fn retain_visible(&self, visible: &HashSet<TileKey>) -> usize {
        self.fetcher.retain(|key| visible.contains(key))
    }

    /// Fetch tiles nearest to this fractional tile position first.
    pub fn focus(&self, zoom: u8, x: f64, y: f64) {
        self.fetcher.set_focus(Some(Focus { zoom, x, y }));
    }

    /// Drop a tile so the next query fetches it again.
    /// Returns whether it was stored.
    pub fn invalidate(&self, key: &TileKey) -> bool {
        self.fetcher.cancel(key);
        self.fetcher.clear_cooldown(key);
        self.store.remove(key)
    }

    /// Remove every stored tile and forget failures.
    pub fn clear(&self) {
        self.store.clear();
        self.fetcher.reset_cooldowns();
        info!("Tile cache cleared");
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    /// Requests pending or in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.fetcher.pending_count()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let cache_hits = self.hits.load(Ordering::Relaxed);
        let cache_misses = self.misses.load(Ordering::Relaxed);
        let total = cache_hits + cache_misses;
        let hit_rate_percent = if total == 0 {
            0.0
        } else {
            cache_hits as f64 / total as f64 * 100.0
        };

        CacheStats {
            cache_hits,
            cache_misses,
            hit_rate_percent,
            tiles: self.store.len(),
            total_bytes: self.store.total_bytes(),
            max_tiles: self.store.max_tiles(),
            pending: self.fetcher.pending_count(),
            health: self.store.health(),
            fetch: self.fetcher.stats(),
        }
    }

    /// Stop downloading and persist the store index.
    pub fn shutdown(&self) {
        self.fetcher.shutdown();
        self.store.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{png_tile, MockSource};

    fn config() -> MapConfig {
        let mut config = MapConfig::in_memory();
        config.network.retry_delay_ms = 1;
        config
    }

    fn esri(x: i64, y: i64) -> TileKey {
        TileKey::new("Esri World Imagery", 15, x, y).unwrap()
    }

    async fn settle<S: TileSource>(cache: &TileCache<S>, key: &TileKey) -> TileResult {
        for _ in 0..500 {
            let result = cache.get_or_schedule(key);
            if !result.is_pending() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tile {key} never settled");
    }

    #[tokio::test]
    async fn test_cold_fetch_then_hit() {
        let source = MockSource::with_delay(Duration::from_millis(10));
        let cache = TileCache::new(&config(), source.clone()).unwrap();
        let key = esri(100, 200);

        assert_eq!(cache.get_or_schedule(&key), TileResult::Pending);

        let ready = settle(&cache, &key).await;
        assert_eq!(ready, TileResult::Ready(Arc::new(png_tile())));

        for _ in 0..10 {
            assert_eq!(cache.get_or_schedule(&key), ready);
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_polling_issues_one_request() {
        let source = MockSource::with_delay(Duration::from_millis(30));
        let cache = TileCache::new(&config(), source.clone()).unwrap();
        let key = esri(1, 2);

        for _ in 0..50 {
            let _ = cache.get_or_schedule(&key);
        }
        assert!(settle(&cache, &key).await.is_ready());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_retried() {
        let source = MockSource::default();
        source.push_response(Err(FetchError::HttpError(404)));
        let cache = TileCache::new(&config(), source.clone()).unwrap();
        let key = esri(3, 4);

        assert_eq!(
            settle(&cache, &key).await,
            TileResult::Failed(FetchError::HttpError(404))
        );
        assert_eq!(
            cache.get_or_schedule(&key),
            TileResult::Failed(FetchError::HttpError(404))
        );
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_refetches() {
        let source = MockSource::default();
        let cache = TileCache::new(&config(), source.clone()).unwrap();
        let key = esri(5, 6);

        assert!(settle(&cache, &key).await.is_ready());
        assert!(cache.invalidate(&key));
        assert_eq!(cache.get_or_schedule(&key), TileResult::Pending);
        assert!(settle(&cache, &key).await.is_ready());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_request_resolves_and_notifies() {
        let cache = TileCache::new(&config(), MockSource::default()).unwrap();
        let mut events = cache.subscribe();
        let key = esri(7, 8);

        let status = cache.request(&key).wait().await;
        assert!(matches!(status, FetchStatus::Done(_)));
        assert_eq!(events.recv().await.unwrap(), TileEvent::Ready(key.clone()));

        // Resident tiles resolve immediately
        assert!(matches!(cache.request(&key).status(), FetchStatus::Done(_)));
    }

    #[tokio::test]
    async fn test_eviction_is_announced() {
        let mut cfg = config();
        cfg.cache.max_cache_tiles = 1;
        let cache = TileCache::new(&cfg, MockSource::default()).unwrap();
        let mut events = cache.subscribe();
        let (old, new) = (esri(9, 10), esri(11, 12));

        cache.request(&old).wait().await;
        assert_eq!(events.recv().await.unwrap(), TileEvent::Ready(old.clone()));

        cache.request(&new).wait().await;
        assert_eq!(events.recv().await.unwrap(), TileEvent::Evicted(old.clone()));
        assert_eq!(events.recv().await.unwrap(), TileEvent::Ready(new.clone()));

        assert!(!cache.store().contains(&old));
        assert_eq!(cache.get_or_schedule(&old), TileResult::Pending);
    }

    #[tokio::test]
    async fn test_retain_visible_cancels_off_screen_tiles() {
        let mut cfg = config();
        cfg.network.max_concurrent_downloads = 1;
        let source = MockSource::with_delay(Duration::from_millis(30));
        let cache = TileCache::new(&cfg, source.clone()).unwrap();

        let mut first = cache.request(&esri(0, 0));
        while first.status() != FetchStatus::InFlight {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let _ = cache.get_or_schedule(&esri(1, 0));
        let _ = cache.get_or_schedule(&esri(2, 0));

        let visible: HashSet<TileKey> = [esri(2, 0)].into_iter().collect();
        assert_eq!(cache.retain_visible(&visible), 1);

        assert!(matches!(first.wait().await, FetchStatus::Done(_)));
        assert!(settle(&cache, &esri(2, 0)).await.is_ready());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_stats_and_clear() {
        let cache = TileCache::new(&config(), MockSource::default()).unwrap();
        let key = esri(9, 9);

        settle(&cache, &key).await;
        let _ = cache.get_or_schedule(&key);

        let stats = cache.stats();
        assert!(stats.cache_hits >= 1);
        assert!(stats.cache_misses >= 1);
        assert!(stats.hit_rate_percent > 0.0 && stats.hit_rate_percent < 100.0);
        assert_eq!(stats.tiles, 1);
        assert_eq!(stats.max_tiles, 400);
        assert_eq!(stats.health, StoreHealth::MemoryOnly { reason: None });

        cache.clear();
        assert_eq!(cache.stats().tiles, 0);
    }

    #[tokio::test]
    async fn test_tiles_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.cache.persistent = true;
        cfg.cache.directory = Some(dir.path().to_path_buf());
        let key = esri(100, 200);

        {
            let cache = TileCache::new(&cfg, MockSource::default()).unwrap();
            assert!(settle(&cache, &key).await.is_ready());
            cache.shutdown();
        }

        let source = MockSource::default();
        let cache = TileCache::new(&cfg, source.clone()).unwrap();
        assert_eq!(cache.stats().health, StoreHealth::Persistent);
        assert_eq!(cache.get_or_schedule(&key), TileResult::Pending);
        assert_eq!(settle(&cache, &key).await, TileResult::Ready(Arc::new(png_tile())));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_is_fatal() {
        let mut cfg = config();
        cfg.cache.max_cache_tiles = 0;
        assert!(matches!(
            TileCache::new(&cfg, MockSource::default()),
            Err(ConfigError::CacheExhausted(0))
        ));
    }
}

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

//! Bounded tile storage with LRU eviction.
//!
//! [`TileStore`] keeps an index of every cached tile in memory. Image bytes
//! are resident for tiles fetched or loaded during this session; tiles known
//! only from a previous session stay on disk until a worker calls
//! [`TileStore::get`].
//!
//! Recency is tracked with a logical access clock rather than wall time, so
//! two accesses never compare equal and the eviction victim is always
//! deterministic.
//!
//! The manifest is rewritten every few inserts and on [`TileStore::flush`]
//! rather than on every change. Tile files written after the last manifest
//! save are removed as orphans on the next open.
//!
//! If the disk backend fails at any point the store logs a warning and keeps
//! running from memory for the rest of the session.

mod disk;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use crate::config::ConfigError;
use crate::tile::TileKey;
use disk::{DiskStore, ManifestEntry};

/// Errors raised by the persistent backend.
///
/// These never reach callers of [`TileStore`]; they trigger the fallback to
/// memory-only operation and are reported through [`TileStore::health`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tile store unavailable: {0}")]
    Unavailable(String),

    #[error("tile store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("tile store manifest unreadable: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Store sizing and location.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Cache root; `None` keeps everything in memory.
    pub directory: Option<PathBuf>,
    /// Maximum number of tiles kept.
    pub max_tiles: usize,
    /// Optional bound on the sum of stored image sizes.
    pub max_bytes: Option<u64>,
}

impl StoreConfig {
    #[must_use]
    pub fn in_memory(max_tiles: usize) -> Self {
        Self {
            directory: None,
            max_tiles,
            max_bytes: None,
        }
    }
}

/// A cached tile image.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    pub key: TileKey,
    pub image: Arc<Vec<u8>>,
    pub last_access: DateTime<Utc>,
    pub size_bytes: u64,
}

/// Result of a non-blocking lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Bytes are in memory.
    Resident(TileRecord),
    /// Known to the store but bytes must be read from disk with [`TileStore::get`].
    OnDisk,
    Absent,
}

/// Whether the persistent backend is in use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreHealth {
    Persistent,
    MemoryOnly { reason: Option<String> },
}

/// Structural changes allowed to accumulate before the manifest is rewritten.
const MANIFEST_BATCH: u64 = 32;

#[derive(Debug)]
struct Entry {
    size_bytes: u64,
    last_access: DateTime<Utc>,
    tick: u64,
    seq: u64,
    image: Option<Arc<Vec<u8>>>,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<TileKey, Entry>,
    /// Access tick -> key, oldest first
    lru: BTreeMap<u64, TileKey>,
    clock: u64,
    next_seq: u64,
    total_bytes: u64,
    disk: Option<Arc<DiskStore>>,
    degraded: Option<String>,
    dirty: bool,
    /// Inserts and removals since the last manifest snapshot
    unsaved: u64,
    /// Snapshot counter; a snapshot older than the last one written is skipped
    generation: u64,
}

/// Disk work decided under the index lock and carried out after releasing it.
#[derive(Default)]
struct DiskWork {
    disk: Option<Arc<DiskStore>>,
    write: Option<(TileKey, Arc<Vec<u8>>)>,
    delete: Vec<TileKey>,
    manifest: Option<(u64, Vec<ManifestEntry>)>,
}

/// Bounded, internally synchronized tile store.
///
/// The index lock only guards in-memory state. File reads, writes and
/// manifest saves happen after it is released, so [`TileStore::lookup`] never
/// waits on the disk.
#[derive(Debug)]
pub struct TileStore {
    inner: Mutex<Inner>,
    /// Generation of the last manifest written; serializes manifest saves
    manifest: Mutex<u64>,
    max_tiles: usize,
    max_bytes: Option<u64>,
}

impl TileStore {
    /// Open the store described by `config`.
    ///
    /// Only a zero capacity is fatal. Disk problems leave the store running in
    /// memory with [`StoreHealth::MemoryOnly`].
    pub fn open(config: &StoreConfig) -> Result<Self, ConfigError> {
        if config.max_tiles == 0 {
            return Err(ConfigError::CacheExhausted(0));
        }
        if config.max_bytes == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "cache.max_cache_mb",
                value: "0".to_string(),
            });
        }

        let mut inner = Inner {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            clock: 0,
            next_seq: 0,
            total_bytes: 0,
            disk: None,
            degraded: None,
            dirty: false,
            unsaved: 0,
            generation: 0,
        };

        if let Some(dir) = &config.directory {
            match DiskStore::open(dir) {
                Ok((disk, mut restored)) => {
                    restored.sort_by_key(|e| (e.tick, e.seq));
                    for entry in restored {
                        inner.restore(entry);
                    }
                    inner.disk = Some(Arc::new(disk));
                }
                Err(e) => {
                    warn!(
                        "Tile store at {} unavailable, caching in memory only: {}",
                        dir.display(),
                        e
                    );
                    inner.degraded = Some(e.to_string());
                }
            }
        }

        let store = Self {
            inner: Mutex::new(inner),
            manifest: Mutex::new(0),
            max_tiles: config.max_tiles,
            max_bytes: config.max_bytes,
        };

        let work = {
            let mut inner = store.lock();
            let evicted = store.evict(&mut inner);
            if evicted.is_empty() {
                DiskWork::default()
            } else {
                debug!("Evicted {} tiles to fit configured bounds", evicted.len());
                DiskWork {
                    disk: inner.disk.clone(),
                    manifest: inner.snapshot(),
                    delete: evicted,
                    ..DiskWork::default()
                }
            }
        };
        store.apply(work);

        Ok(store)
    }

    /// Memory-only store holding up to `max_tiles`.
    pub fn in_memory(max_tiles: usize) -> Result<Self, ConfigError> {
        Self::open(&StoreConfig::in_memory(max_tiles))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves the index consistent enough to keep serving
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Carry out disk work outside the index lock.
    fn apply(&self, work: DiskWork) {
        let Some(disk) = work.disk else {
            return;
        };
        if let Err(e) = self.write_out(&disk, work.write, &work.delete, work.manifest) {
            self.lock().degrade(&e);
        }
    }

    fn write_out(
        &self,
        disk: &DiskStore,
        write: Option<(TileKey, Arc<Vec<u8>>)>,
        delete: &[TileKey],
        manifest: Option<(u64, Vec<ManifestEntry>)>,
    ) -> Result<(), StoreError> {
        if let Some((key, image)) = write {
            disk.write(&key, &image)?;
        }
        for key in delete {
            disk.delete(key)?;
        }
        if let Some((generation, entries)) = manifest {
            let mut written = self.manifest.lock().unwrap_or_else(PoisonError::into_inner);
            if generation > *written {
                disk.save_manifest(entries)?;
                *written = generation;
            }
        }
        Ok(())
    }

    /// Non-blocking lookup. Never reads the disk.
    pub fn lookup(&self, key: &TileKey) -> Lookup {
        let mut inner = self.lock();
        let resident = match inner.entries.get(key) {
            None => return Lookup::Absent,
            Some(entry) => entry.image.is_some(),
        };
        if !resident {
            return Lookup::OnDisk;
        }
        inner.touch(key);
        inner.record(key).map_or(Lookup::Absent, Lookup::Resident)
    }

    /// Fetch a tile, reading it from disk when it is not resident.
    ///
    /// Blocking; call from worker threads only.
    pub fn get(&self, key: &TileKey) -> Option<TileRecord> {
        let disk = {
            let mut inner = self.lock();
            if inner.entries.get(key)?.image.is_some() {
                inner.touch(key);
                return inner.record(key);
            }
            inner.disk.clone()
        };

        let read = match &disk {
            Some(disk) => disk.read(key),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no disk backend")),
        };

        let mut guard = self.lock();
        let inner = &mut *guard;
        match read {
            Ok(bytes) => {
                // Evicted while the file was being read
                let entry = inner.entries.get_mut(key)?;
                if entry.image.is_none() {
                    let size = bytes.len() as u64;
                    inner.total_bytes = inner.total_bytes - entry.size_bytes + size;
                    entry.size_bytes = size;
                    entry.image = Some(Arc::new(bytes));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if inner.entries.get(key).is_some_and(|entry| entry.image.is_none()) {
                    debug!("Tile {} missing from disk, dropping from index", key);
                    inner.forget(key);
                    inner.dirty = true;
                }
                return None;
            }
            Err(e) => {
                inner.degrade(&StoreError::Io(e));
                return None;
            }
        }

        inner.touch(key);
        inner.record(key)
    }

    /// Insert or replace a tile, then evict least-recently-used tiles until
    /// both bounds hold. Returns the evicted keys.
    pub fn put(&self, key: TileKey, image: Arc<Vec<u8>>) -> Vec<TileKey> {
        let (evicted, work) = {
            let mut inner = self.lock();

            inner.forget(&key);
            let size = image.len() as u64;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.entries.insert(
                key.clone(),
                Entry {
                    size_bytes: size,
                    last_access: Utc::now(),
                    tick: 0,
                    seq,
                    image: Some(Arc::clone(&image)),
                },
            );
            inner.total_bytes += size;
            inner.touch(&key);

            let evicted = self.evict(&mut inner);
            inner.unsaved += 1 + evicted.len() as u64;
            let manifest = if inner.unsaved >= MANIFEST_BATCH {
                inner.snapshot()
            } else {
                None
            };

            let work = DiskWork {
                disk: inner.disk.clone(),
                write: Some((key, image)),
                delete: evicted.clone(),
                manifest,
            };
            (evicted, work)
        };

        self.apply(work);
        evicted
    }

    /// Drop least-recently-used entries from the index until both bounds hold.
    /// The most recent entry is never dropped, so a single oversized tile stays.
    fn evict(&self, inner: &mut Inner) -> Vec<TileKey> {
        let mut evicted = Vec::new();
        while inner.entries.len() > 1 {
            let over_count = inner.entries.len() > self.max_tiles;
            let over_bytes = self.max_bytes.is_some_and(|max| inner.total_bytes > max);
            if !over_count && !over_bytes {
                break;
            }

            let Some(victim) = inner.lru.values().next().cloned() else {
                break;
            };
            inner.forget(&victim);
            inner.dirty = true;
            evicted.push(victim);
        }
        evicted
    }

    /// Remove a single tile. Returns whether it was present.
    pub fn remove(&self, key: &TileKey) -> bool {
        let work = {
            let mut inner = self.lock();
            if !inner.forget(key) {
                return false;
            }
            inner.dirty = true;
            DiskWork {
                disk: inner.disk.clone(),
                delete: vec![key.clone()],
                manifest: inner.snapshot(),
                ..DiskWork::default()
            }
        };
        self.apply(work);
        true
    }

    /// Drop every tile from memory and disk.
    pub fn clear(&self) {
        let work = {
            let mut inner = self.lock();
            let keys: Vec<TileKey> = inner.entries.keys().cloned().collect();
            inner.entries.clear();
            inner.lru.clear();
            inner.total_bytes = 0;
            inner.dirty = true;
            DiskWork {
                disk: inner.disk.clone(),
                delete: keys,
                manifest: inner.snapshot(),
                ..DiskWork::default()
            }
        };
        self.apply(work);
    }

    /// Remove tiles not accessed within `max_age`. Returns how many were removed.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - age;

        let work = {
            let mut inner = self.lock();
            let stale: Vec<TileKey> = inner
                .entries
                .iter()
                .filter(|(_, entry)| entry.last_access <= cutoff)
                .map(|(key, _)| key.clone())
                .collect();
            if stale.is_empty() {
                return 0;
            }

            for key in &stale {
                inner.forget(key);
            }
            debug!("Purged {} stale tiles", stale.len());
            inner.dirty = true;
            DiskWork {
                disk: inner.disk.clone(),
                manifest: inner.snapshot(),
                delete: stale,
                ..DiskWork::default()
            }
        };

        let purged = work.delete.len();
        self.apply(work);
        purged
    }

    /// Persist pending index changes to the manifest.
    pub fn flush(&self) {
        let work = {
            let mut inner = self.lock();
            DiskWork {
                disk: inner.disk.clone(),
                manifest: inner.snapshot(),
                ..DiskWork::default()
            }
        };
        self.apply(work);
    }

    #[must_use]
    pub fn contains(&self, key: &TileKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    #[must_use]
    pub fn max_tiles(&self) -> usize {
        self.max_tiles
    }

    /// Keys ordered from least to most recently used.
    #[must_use]
    pub fn lru_order(&self) -> Vec<TileKey> {
        self.lock().lru.values().cloned().collect()
    }

    #[must_use]
    pub fn health(&self) -> StoreHealth {
        let inner = self.lock();
        if inner.disk.is_some() {
            StoreHealth::Persistent
        } else {
            StoreHealth::MemoryOnly {
                reason: inner.degraded.clone(),
            }
        }
    }
}

impl Drop for TileStore {
    fn drop(&mut self) {
        self.flush();
    }
}

impl Inner {
    fn restore(&mut self, entry: ManifestEntry) {
        self.clock += 1;
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.total_bytes += entry.size_bytes;
        self.lru.insert(self.clock, entry.key.clone());
        self.entries.insert(
            entry.key,
            Entry {
                size_bytes: entry.size_bytes,
                last_access: entry.last_access,
                tick: self.clock,
                seq: entry.seq,
                image: None,
            },
        );
    }

    fn touch(&mut self, key: &TileKey) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            entry.last_access = Utc::now();
            self.lru.insert(tick, key.clone());
            self.dirty = true;
        }
    }

    fn record(&self, key: &TileKey) -> Option<TileRecord> {
        let entry = self.entries.get(key)?;
        Some(TileRecord {
            key: key.clone(),
            image: Arc::clone(entry.image.as_ref()?),
            last_access: entry.last_access,
            size_bytes: entry.size_bytes,
        })
    }

    /// Drop `key` from the index. Returns whether it was present.
    fn forget(&mut self, key: &TileKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.lru.remove(&entry.tick);
                self.total_bytes -= entry.size_bytes;
                true
            }
            None => false,
        }
    }

    /// Switch to memory-only operation for the rest of the session.
    fn degrade(&mut self, error: &StoreError) {
        if self.disk.take().is_none() {
            return;
        }
        warn!("Tile store disk failure, continuing in memory only: {}", error);
        self.degraded = Some(error.to_string());

        let unreachable: Vec<TileKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.image.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &unreachable {
            self.forget(key);
        }
    }

    /// Copy the index for the manifest if anything changed since the last copy.
    fn snapshot(&mut self) -> Option<(u64, Vec<ManifestEntry>)> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        self.unsaved = 0;
        self.disk.as_ref()?;

        let entries = self
            .lru
            .values()
            .filter_map(|key| {
                self.entries.get(key).map(|entry| ManifestEntry {
                    key: key.clone(),
                    size_bytes: entry.size_bytes,
                    last_access: entry.last_access,
                    tick: entry.tick,
                    seq: entry.seq,
                })
            })
            .collect();

        self.generation += 1;
        Some((self.generation, entries))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn key(provider: &str, x: u32) -> TileKey {
        TileKey {
            provider: provider.to_string(),
            zoom: 15,
            x,
            y: 200,
        }
    }

    fn bytes(len: usize) -> Arc<Vec<u8>> {
        Arc::new(vec![7u8; len])
    }

    fn persistent(dir: &std::path::Path, max_tiles: usize) -> TileStore {
        TileStore::open(&StoreConfig {
            directory: Some(dir.to_path_buf()),
            max_tiles,
            max_bytes: None,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            TileStore::in_memory(0),
            Err(ConfigError::CacheExhausted(0))
        ));
    }

    #[test]
    fn test_put_then_lookup() {
        let store = TileStore::in_memory(10).unwrap();
        assert_eq!(store.lookup(&key("esri", 1)), Lookup::Absent);

        store.put(key("esri", 1), bytes(4));

        match store.lookup(&key("esri", 1)) {
            Lookup::Resident(record) => {
                assert_eq!(record.size_bytes, 4);
                assert_eq!(*record.image, vec![7u8; 4]);
            }
            other => panic!("expected resident tile, got {other:?}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_replaces_size() {
        let store = TileStore::in_memory(10).unwrap();
        store.put(key("esri", 1), bytes(4));
        store.put(key("esri", 1), bytes(10));

        assert_eq!(store.len(), 1);
        assert_eq!(store.total_bytes(), 10);
    }

    #[test]
    fn test_lru_evicts_exact_victims() {
        let store = TileStore::in_memory(3).unwrap();
        assert!(store.put(key("esri", 1), bytes(1)).is_empty());
        assert!(store.put(key("esri", 2), bytes(1)).is_empty());
        assert!(store.put(key("esri", 3), bytes(1)).is_empty());

        // Touch tile 1 so tile 2 becomes the oldest
        assert!(matches!(store.lookup(&key("esri", 1)), Lookup::Resident(_)));

        assert_eq!(store.put(key("esri", 4), bytes(1)), vec![key("esri", 2)]);
        assert_eq!(store.put(key("esri", 5), bytes(1)), vec![key("esri", 3)]);

        assert_eq!(store.len(), 3);
        assert_eq!(
            store.lru_order(),
            vec![key("esri", 1), key("esri", 4), key("esri", 5)]
        );
    }

    #[test]
    fn test_byte_bound_evicts() {
        let store = TileStore::open(&StoreConfig {
            directory: None,
            max_tiles: 100,
            max_bytes: Some(10),
        })
        .unwrap();

        store.put(key("esri", 1), bytes(4));
        store.put(key("esri", 2), bytes(4));
        let evicted = store.put(key("esri", 3), bytes(4));

        assert_eq!(evicted, vec![key("esri", 1)]);
        assert_eq!(store.total_bytes(), 8);
    }

    #[test]
    fn test_oversized_single_tile_is_kept() {
        let store = TileStore::open(&StoreConfig {
            directory: None,
            max_tiles: 100,
            max_bytes: Some(10),
        })
        .unwrap();

        store.put(key("esri", 1), bytes(4));
        let evicted = store.put(key("esri", 2), bytes(50));

        assert_eq!(evicted, vec![key("esri", 1)]);
        assert!(store.contains(&key("esri", 2)));
    }

    #[test]
    fn test_providers_are_isolated() {
        let store = TileStore::in_memory(2).unwrap();
        store.put(key("esri", 100), Arc::new(b"esri".to_vec()));
        store.put(key("osm", 100), Arc::new(b"osm".to_vec()));
        store.lookup(&key("esri", 100));

        let evicted = store.put(key("osm", 101), Arc::new(b"osm2".to_vec()));
        assert_eq!(evicted, vec![key("osm", 100)]);

        match store.lookup(&key("esri", 100)) {
            Lookup::Resident(record) => assert_eq!(*record.image, b"esri".to_vec()),
            other => panic!("esri tile lost: {other:?}"),
        }
    }

    #[test]
    fn test_remove_and_clear() {
        let store = TileStore::in_memory(10).unwrap();
        store.put(key("esri", 1), bytes(3));
        store.put(key("esri", 2), bytes(3));

        assert!(store.remove(&key("esri", 1)));
        assert!(!store.remove(&key("esri", 1)));
        assert_eq!(store.total_bytes(), 3);

        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.total_bytes(), 0);
    }

    #[test]
    fn test_purge_older_than() {
        let store = TileStore::in_memory(10).unwrap();
        store.put(key("esri", 1), bytes(3));

        assert_eq!(store.purge_older_than(Duration::from_secs(3600)), 0);
        assert_eq!(store.purge_older_than(Duration::ZERO), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = persistent(dir.path(), 10);
            assert_eq!(store.health(), StoreHealth::Persistent);
            store.put(key("esri", 1), Arc::new(b"one".to_vec()));
            store.put(key("osm", 1), Arc::new(b"two".to_vec()));
        }

        let store = persistent(dir.path(), 10);
        assert_eq!(store.len(), 2);
        assert_eq!(store.lookup(&key("esri", 1)), Lookup::OnDisk);

        let record = store.get(&key("esri", 1)).unwrap();
        assert_eq!(*record.image, b"one".to_vec());
        assert!(matches!(store.lookup(&key("esri", 1)), Lookup::Resident(_)));
    }

    #[test]
    fn test_access_order_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = persistent(dir.path(), 3);
            store.put(key("esri", 1), bytes(1));
            store.put(key("esri", 2), bytes(1));
            store.put(key("esri", 3), bytes(1));
            store.lookup(&key("esri", 1));
        }

        let store = persistent(dir.path(), 3);
        assert_eq!(store.put(key("esri", 4), bytes(1)), vec![key("esri", 2)]);
    }

    #[test]
    fn test_reopen_with_smaller_capacity_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = persistent(dir.path(), 5);
            for x in 1..=5 {
                store.put(key("esri", x), bytes(1));
            }
        }

        let store = persistent(dir.path(), 2);
        assert_eq!(store.lru_order(), vec![key("esri", 4), key("esri", 5)]);
    }

    #[test]
    fn test_unusable_directory_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let store = TileStore::open(&StoreConfig {
            directory: Some(blocker),
            max_tiles: 10,
            max_bytes: None,
        })
        .unwrap();

        assert!(matches!(store.health(), StoreHealth::MemoryOnly { reason: Some(_) }));
        store.put(key("esri", 1), bytes(2));
        assert!(matches!(store.lookup(&key("esri", 1)), Lookup::Resident(_)));
    }

    #[test]
    fn test_disk_failure_mid_session_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = persistent(dir.path(), 10);
        store.put(key("esri", 1), bytes(2));

        let tiles_dir = dir.path().join("tiles");
        std::fs::remove_dir_all(&tiles_dir).unwrap();
        std::fs::write(&tiles_dir, b"blocked").unwrap();

        store.put(key("esri", 2), bytes(2));

        assert!(matches!(store.health(), StoreHealth::MemoryOnly { .. }));
        assert!(matches!(store.lookup(&key("esri", 2)), Lookup::Resident(_)));
        assert!(matches!(store.lookup(&key("esri", 1)), Lookup::Resident(_)));
    }

    #[test]
    fn test_manifest_written_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("index.json");
        let store = persistent(dir.path(), 100);

        store.put(key("esri", 0), bytes(1));
        assert!(!manifest.exists());

        for x in 1..MANIFEST_BATCH as u32 {
            store.put(key("esri", x), bytes(1));
        }
        assert!(manifest.exists());

        store.put(key("esri", 999), bytes(1));
        store.flush();
        drop(store);

        let store = persistent(dir.path(), 100);
        assert_eq!(store.len(), MANIFEST_BATCH as usize + 1);
        assert_eq!(store.lookup(&key("esri", 999)), Lookup::OnDisk);
    }

    #[test]
    fn test_lookup_not_blocked_by_manifest_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(persistent(dir.path(), 100));

        // Stall every manifest save until released
        let stalled = store.manifest.lock().unwrap();

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for x in 0..MANIFEST_BATCH as u32 {
                    store.put(key("esri", x), bytes(16));
                }
            })
        };

        let deadline = Instant::now() + Duration::from_secs(10);
        while store.len() < MANIFEST_BATCH as usize {
            assert!(Instant::now() < deadline, "writer never finished inserting");
            std::thread::sleep(Duration::from_millis(1));
        }

        // The last put is now waiting to save the manifest
        let (tx, rx) = std::sync::mpsc::channel();
        {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let _ = tx.send(store.lookup(&key("esri", 0)));
            });
        }
        let found = rx.recv_timeout(Duration::from_secs(2));
        assert!(matches!(found, Ok(Lookup::Resident(_))), "lookup waited on disk: {found:?}");

        drop(stalled);
        writer.join().unwrap();
    }

    #[test]
    fn test_lookup_latency_during_persistent_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(persistent(dir.path(), 5000));
        for x in 0..1000 {
            store.put(key("esri", x), bytes(64));
        }

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for x in 1000..1200 {
                    store.put(key("esri", x), bytes(20 * 1024));
                }
            })
        };

        let mut worst = Duration::ZERO;
        while !writer.is_finished() {
            let start = Instant::now();
            let _ = store.lookup(&key("esri", 500));
            worst = worst.max(start.elapsed());
        }
        writer.join().unwrap();

        assert!(worst < Duration::from_millis(50), "worst lookup took {worst:?}");
        assert_eq!(store.len(), 1200);
    }

    #[test]
    fn test_concurrent_puts_respect_bound() {
        let store = Arc::new(TileStore::in_memory(16).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for x in 0..50 {
                        store.put(key("esri", t * 100 + x), bytes(1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 16);
        assert_eq!(store.total_bytes(), 16);
    }
}

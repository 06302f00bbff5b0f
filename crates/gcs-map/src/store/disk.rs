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

//! File-based tile persistence.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/index.json          manifest: key, size, access order
//! <root>/tiles/<sha256>.tile one file per tile
//! ```
//!
//! Tile files are named by the SHA-256 of the tile key so provider names with
//! spaces or slashes never reach the filesystem.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::StoreError;
use crate::tile::TileKey;

const MANIFEST_FILE: &str = "index.json";
const TILES_DIR: &str = "tiles";
const TILE_EXTENSION: &str = "tile";
const MANIFEST_VERSION: u32 = 1;

/// One persisted record as stored in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ManifestEntry {
    pub key: TileKey,
    pub size_bytes: u64,
    pub last_access: DateTime<Utc>,
    /// Logical access clock value at the time of the last access.
    pub tick: u64,
    /// Insertion sequence number.
    pub seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug)]
pub(crate) struct DiskStore {
    tiles_dir: PathBuf,
    manifest_path: PathBuf,
}

impl DiskStore {
    /// Open (or create) the store at `root` and return the surviving entries.
    ///
    /// Entries whose files vanished are dropped and tile files the manifest
    /// does not know about are deleted.
    pub(crate) fn open(root: &Path) -> Result<(Self, Vec<ManifestEntry>), StoreError> {
        let store = Self {
            tiles_dir: root.join(TILES_DIR),
            manifest_path: root.join(MANIFEST_FILE),
        };
        fs::create_dir_all(&store.tiles_dir)?;

        let mut entries = match fs::read(&store.manifest_path) {
            Ok(raw) => {
                let manifest: Manifest = serde_json::from_slice(&raw)?;
                if manifest.version != MANIFEST_VERSION {
                    return Err(StoreError::Unavailable(format!(
                        "unsupported manifest version {}",
                        manifest.version
                    )));
                }
                manifest.entries
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // Drop entries whose tile file is gone, refreshing sizes from disk
        entries.retain_mut(|entry| match fs::metadata(store.tile_path(&entry.key)) {
            Ok(metadata) => {
                entry.size_bytes = metadata.len();
                true
            }
            Err(_) => false,
        });

        store.remove_orphans(&entries)?;

        info!(
            "Opened tile store at {} ({} tiles)",
            root.display(),
            entries.len()
        );

        Ok((store, entries))
    }

    fn remove_orphans(&self, entries: &[ManifestEntry]) -> Result<(), StoreError> {
        let known: HashSet<PathBuf> = entries.iter().map(|e| self.tile_path(&e.key)).collect();

        for dir_entry in fs::read_dir(&self.tiles_dir)?.flatten() {
            let path = dir_entry.path();
            if !known.contains(&path) {
                debug!("Removing orphaned tile file {:?}", path);
                let _ = fs::remove_file(&path);
            }
        }
        Ok(())
    }

    /// Path of the file backing `key`.
    pub(crate) fn tile_path(&self, key: &TileKey) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{}/{}/{}", key.zoom, key.x, key.y).as_bytes());
        let hash = hasher.finalize();

        self.tiles_dir.join(format!("{hash:x}.{TILE_EXTENSION}"))
    }

    pub(crate) fn read(&self, key: &TileKey) -> io::Result<Vec<u8>> {
        fs::read(self.tile_path(key))
    }

    /// Write via a temporary file so readers never see a partial tile.
    pub(crate) fn write(&self, key: &TileKey, bytes: &[u8]) -> io::Result<()> {
        let path = self.tile_path(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)
    }

    pub(crate) fn delete(&self, key: &TileKey) -> io::Result<()> {
        match fs::remove_file(self.tile_path(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    pub(crate) fn save_manifest(&self, entries: Vec<ManifestEntry>) -> Result<(), StoreError> {
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            entries,
        };
        let raw = serde_json::to_vec(&manifest)?;

        let tmp = self.manifest_path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.manifest_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(provider: &str, x: u32) -> TileKey {
        TileKey {
            provider: provider.to_string(),
            zoom: 15,
            x,
            y: 200,
        }
    }

    #[test]
    fn test_paths_differ_per_provider() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = DiskStore::open(dir.path()).unwrap();

        assert_ne!(store.tile_path(&key("esri", 100)), store.tile_path(&key("osm", 100)));
        assert_eq!(store.tile_path(&key("esri", 100)), store.tile_path(&key("esri", 100)));
    }

    #[test]
    fn test_orphans_removed_on_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = DiskStore::open(dir.path()).unwrap();
            store.write(&key("esri", 1), b"tile").unwrap();
            // No manifest written, so the file is an orphan on next open
        }

        let (store, entries) = DiskStore::open(dir.path()).unwrap();
        assert!(entries.is_empty());
        assert!(!store.tile_path(&key("esri", 1)).exists());
    }

    #[test]
    fn test_manifest_round_trip_drops_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (store, _) = DiskStore::open(dir.path()).unwrap();
            store.write(&key("esri", 1), b"abc").unwrap();
            let entries = vec![
                ManifestEntry {
                    key: key("esri", 1),
                    size_bytes: 0,
                    last_access: Utc::now(),
                    tick: 1,
                    seq: 0,
                },
                ManifestEntry {
                    key: key("esri", 2),
                    size_bytes: 10,
                    last_access: Utc::now(),
                    tick: 2,
                    seq: 1,
                },
            ];
            store.save_manifest(entries).unwrap();
        }

        let (_, entries) = DiskStore::open(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key("esri", 1));
        assert_eq!(entries[0].size_bytes, 3);
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MANIFEST_FILE), b"{ not json").unwrap();

        assert!(matches!(DiskStore::open(dir.path()), Err(StoreError::Manifest(_))));
    }
}

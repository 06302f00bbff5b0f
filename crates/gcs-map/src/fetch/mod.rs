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

//! Asynchronous tile download pipeline.
//!
//! [`TileFetcher`] runs a fixed pool of tokio worker tasks that pull requests
//! from a shared queue. At most one request per [`TileKey`] is pending or in
//! flight; later callers receive a [`FetchHandle`] onto the same request.
//!
//! Each worker first tries the store's disk tier, then the network through a
//! [`TileSource`]. Downloaded bytes are validated as an image and written to
//! the [`TileStore`] before any waiter is resolved, so a caller that sees
//! [`FetchStatus::Done`] will also find the tile in the store.
//!
//! Failures are retried with exponential backoff when transient (timeouts,
//! transport errors, HTTP 429 and 5xx). A key whose final attempt failed is
//! not requested again until its cooldown expires.

pub mod http;
pub mod provider;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use image::ImageFormat;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::store::TileStore;
use crate::tile::{tiles_per_axis, TileKey};

pub use http::HttpTileSource;
pub use provider::{ProviderRegistry, TileProvider};

/// Errors from a tile download.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("tile request timed out")]
    Timeout,

    #[error("tile server returned HTTP {0}")]
    HttpError(u16),

    #[error("tile image invalid: {0}")]
    DecodeError(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unknown tile provider: {0}")]
    UnknownProvider(String),
}

impl FetchError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::HttpError(code) => *code == 429 || (500..=599).contains(code),
            Self::DecodeError(_) | Self::UnknownProvider(_) => false,
        }
    }
}

/// Where tile bytes come from.
pub trait TileSource: Send + Sync + 'static {
    fn fetch(&self, key: &TileKey) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send;
}

/// Order in which queued requests are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Closest to the focus point first, FIFO among equals.
    #[default]
    NearestFirst,
    Fifo,
}

/// Fractional tile position that nearest-first ordering measures from,
/// normally the viewport centre.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Focus {
    pub zoom: u8,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Number of worker tasks.
    pub workers: usize,
    /// Limit for a single network attempt.
    pub timeout: Duration,
    /// Extra attempts after a transient failure.
    pub retry_attempts: u32,
    /// Delay before the first retry, doubled for each further one.
    pub retry_delay: Duration,
    /// How long a failed key is refused before it may be requested again.
    pub failure_cooldown: Duration,
    pub queue_policy: QueuePolicy,
    /// Capacity of the completion event channel.
    pub event_capacity: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_delay: Duration::from_millis(100),
            failure_cooldown: Duration::from_secs(30),
            queue_policy: QueuePolicy::NearestFirst,
            event_capacity: 256,
        }
    }
}

/// State of a tile request.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchStatus {
    Pending,
    InFlight,
    Done(Arc<Vec<u8>>),
    Failed(FetchError),
    Cancelled,
}

impl FetchStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_) | Self::Cancelled)
    }
}

/// Completion notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum TileEvent {
    Ready(TileKey),
    Failed { key: TileKey, error: FetchError },
    Cancelled(TileKey),
    /// Dropped from the store to respect its bounds.
    Evicted(TileKey),
}

/// Observer of one tile request.
#[derive(Debug, Clone)]
pub struct FetchHandle {
    key: TileKey,
    rx: watch::Receiver<FetchStatus>,
}

impl FetchHandle {
    /// A handle that is already in its final state.
    pub(crate) fn resolved(key: TileKey, status: FetchStatus) -> Self {
        let (_, rx) = watch::channel(status);
        Self { key, rx }
    }

    #[must_use]
    pub fn key(&self) -> &TileKey {
        &self.key
    }

    /// Current status without waiting.
    #[must_use]
    pub fn status(&self) -> FetchStatus {
        self.rx.borrow().clone()
    }

    /// Wait until the request is done, failed or cancelled.
    pub async fn wait(&mut self) -> FetchStatus {
        if let Ok(status) = self.rx.wait_for(FetchStatus::is_terminal).await {
            return status.clone();
        }
        // Fetcher went away before resolving this request
        let status = self.rx.borrow().clone();
        if status.is_terminal() {
            status
        } else {
            FetchStatus::Cancelled
        }
    }
}

/// Snapshot of fetcher counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchStats {
    pub requested: u64,
    pub coalesced: u64,
    pub network_calls: u64,
    pub store_loads: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_download_ms: f64,
}

#[derive(Debug, Default)]
struct Counters {
    requested: AtomicU64,
    coalesced: AtomicU64,
    network_calls: AtomicU64,
    store_loads: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    downloads: AtomicU64,
    download_ms_total: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug)]
struct Request {
    status: watch::Sender<FetchStatus>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Queue {
    items: VecDeque<(TileKey, u64)>,
    next_seq: u64,
    focus: Option<Focus>,
}

impl Queue {
    fn push(&mut self, key: TileKey) {
        self.items.push_back((key, self.next_seq));
        self.next_seq += 1;
    }

    fn remove(&mut self, key: &TileKey) {
        self.items.retain(|(queued, _)| queued != key);
    }

    fn pop(&mut self, policy: QueuePolicy) -> Option<TileKey> {
        let index = match (policy, self.focus) {
            (QueuePolicy::NearestFirst, Some(focus)) => self
                .items
                .iter()
                .enumerate()
                .min_by(|(_, (a, a_seq)), (_, (b, b_seq))| {
                    distance_sq(a, focus)
                        .total_cmp(&distance_sq(b, focus))
                        .then(a_seq.cmp(b_seq))
                })
                .map(|(index, _)| index)?,
            _ => 0,
        };
        self.items.remove(index).map(|(key, _)| key)
    }
}

/// Squared distance in tiles from the focus; other zoom levels sort last.
fn distance_sq(key: &TileKey, focus: Focus) -> f64 {
    if key.zoom != focus.zoom {
        return f64::INFINITY;
    }
    let n = f64::from(tiles_per_axis(key.zoom));
    let mut dx = (f64::from(key.x) + 0.5 - focus.x).abs() % n;
    if dx > n / 2.0 {
        dx = n - dx;
    }
    let dy = f64::from(key.y) + 0.5 - focus.y;
    dx * dx + dy * dy
}

struct Shared<S> {
    config: FetcherConfig,
    source: S,
    store: Arc<TileStore>,
    // Lock order: requests, then queue
    requests: Mutex<HashMap<TileKey, Request>>,
    queue: Mutex<Queue>,
    cooldown: Mutex<HashMap<TileKey, (Instant, FetchError)>>,
    notify: Notify,
    events: broadcast::Sender<TileEvent>,
    counters: Counters,
    shutdown: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Deduplicating tile download pool.
pub struct TileFetcher<S: TileSource> {
    shared: Arc<Shared<S>>,
    workers: Vec<JoinHandle<()>>,
}

impl<S: TileSource> std::fmt::Debug for TileFetcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileFetcher")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl<S: TileSource> TileFetcher<S> {
    /// Start the worker pool. Must be called from within a tokio runtime.
    pub fn spawn(config: FetcherConfig, source: S, store: Arc<TileStore>) -> Self {
        let worker_count = config.workers.max(1);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let shared = Arc::new(Shared {
            config,
            source,
            store,
            requests: Mutex::new(HashMap::new()),
            queue: Mutex::new(Queue::default()),
            cooldown: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            events,
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });

        let workers = (0..worker_count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { worker_loop(shared, id).await })
            })
            .collect();

        info!("Tile fetcher started with {} workers", worker_count);

        Self { shared, workers }
    }

    /// Request a tile.
    ///
    /// Joins an existing pending or in-flight request for the same key.
    /// Inside the failure cooldown the handle is already failed.
    pub fn request_tile(&self, key: &TileKey) -> FetchHandle {
        let shared = &self.shared;
        bump(&shared.counters.requested);

        if shared.shutdown.is_cancelled() {
            return FetchHandle::resolved(key.clone(), FetchStatus::Cancelled);
        }

        // The cooldown is set and the request removed under this lock
        let mut requests = lock(&shared.requests);
        if let Some(error) = shared.cooling_down(key) {
            return FetchHandle::resolved(key.clone(), FetchStatus::Failed(error));
        }
        if let Some(request) = requests.get(key) {
            bump(&shared.counters.coalesced);
            return FetchHandle {
                key: key.clone(),
                rx: request.status.subscribe(),
            };
        }

        let (status, rx) = watch::channel(FetchStatus::Pending);
        requests.insert(
            key.clone(),
            Request {
                status,
                cancel: shared.shutdown.child_token(),
            },
        );
        lock(&shared.queue).push(key.clone());
        drop(requests);

        shared.notify.notify_one();

        FetchHandle {
            key: key.clone(),
            rx,
        }
    }

    /// Cancel a request that has not started. Returns whether one was cancelled.
    pub fn cancel(&self, key: &TileKey) -> bool {
        let shared = &self.shared;
        let mut requests = lock(&shared.requests);
        let queued = requests
            .get(key)
            .is_some_and(|r| *r.status.borrow() == FetchStatus::Pending);
        if !queued {
            return false;
        }
        lock(&shared.queue).remove(key);
        let request = requests.remove(key);
        drop(requests);
        if let Some(request) = request {
            shared.resolve_cancelled(key, &request);
        }
        true
    }

    /// Cancel every not-yet-started request whose key fails `keep`.
    /// Returns the number cancelled.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&TileKey) -> bool,
    {
        let shared = &self.shared;
        let mut requests = lock(&shared.requests);
        let mut queue = lock(&shared.queue);

        let mut dropped = Vec::new();
        queue.items.retain(|(key, _)| {
            if keep(key) {
                true
            } else {
                dropped.push(key.clone());
                false
            }
        });
        drop(queue);

        let removed: Vec<(TileKey, Request)> = dropped
            .into_iter()
            .filter_map(|key| requests.remove(&key).map(|request| (key, request)))
            .collect();
        drop(requests);

        for (key, request) in &removed {
            shared.resolve_cancelled(key, request);
        }
        if !removed.is_empty() {
            debug!("Cancelled {} queued tile requests", removed.len());
        }
        removed.len()
    }

    /// Steer nearest-first ordering. `None` falls back to FIFO.
    pub fn set_focus(&self, focus: Option<Focus>) {
        lock(&self.shared.queue).focus = focus;
    }

    /// Forget a key's failure cooldown.
    pub fn clear_cooldown(&self, key: &TileKey) {
        lock(&self.shared.cooldown).remove(key);
    }

    /// Forget every failure cooldown.
    pub fn reset_cooldowns(&self) {
        lock(&self.shared.cooldown).clear();
    }

    /// Requests pending or in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.requests).len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending_count() == 0
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TileStore> {
        &self.shared.store
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TileEvent> {
        self.shared.events.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> FetchStats {
        let c = &self.shared.counters;
        let downloads = c.downloads.load(Ordering::Relaxed);
        let average_download_ms = if downloads == 0 {
            0.0
        } else {
            c.download_ms_total.load(Ordering::Relaxed) as f64 / downloads as f64
        };

        FetchStats {
            requested: c.requested.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            network_calls: c.network_calls.load(Ordering::Relaxed),
            store_loads: c.store_loads.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            average_download_ms,
        }
    }

    /// Stop the workers. Queued requests resolve as cancelled; in-flight
    /// network attempts are abandoned.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();

        let mut requests = lock(&self.shared.requests);
        let mut queue = lock(&self.shared.queue);
        let queued: Vec<TileKey> = queue.items.drain(..).map(|(key, _)| key).collect();
        drop(queue);
        let removed: Vec<(TileKey, Request)> = queued
            .into_iter()
            .filter_map(|key| requests.remove(&key).map(|request| (key, request)))
            .collect();
        drop(requests);

        for (key, request) in &removed {
            self.shared.resolve_cancelled(key, request);
        }
        info!("Tile fetcher shut down");
    }
}

impl<S: TileSource> Drop for TileFetcher<S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<S: TileSource> Shared<S> {
    fn cooling_down(&self, key: &TileKey) -> Option<FetchError> {
        let mut cooldown = lock(&self.cooldown);
        match cooldown.get(key) {
            Some((until, error)) if Instant::now() < *until => Some(error.clone()),
            Some(_) => {
                cooldown.remove(key);
                None
            }
            None => None,
        }
    }

    fn resolve_cancelled(&self, key: &TileKey, request: &Request) {
        request.cancel.cancel();
        request.status.send_replace(FetchStatus::Cancelled);
        bump(&self.counters.cancelled);
        let _ = self.events.send(TileEvent::Cancelled(key.clone()));
    }

    /// Take the next queued request and mark it in flight.
    fn next_job(&self) -> Option<(TileKey, CancellationToken)> {
        let requests = lock(&self.requests);
        let mut queue = lock(&self.queue);
        while let Some(key) = queue.pop(self.config.queue_policy) {
            if let Some(request) = requests.get(&key) {
                request.status.send_replace(FetchStatus::InFlight);
                return Some((key, request.cancel.clone()));
            }
        }
        None
    }

    /// Resolve every waiter on `key` and announce the outcome.
    fn complete(&self, key: &TileKey, result: Result<Arc<Vec<u8>>, FetchError>) {
        let (status, event) = match result {
            Ok(image) => {
                bump(&self.counters.succeeded);
                (FetchStatus::Done(image), TileEvent::Ready(key.clone()))
            }
            Err(error) => {
                bump(&self.counters.failed);
                (
                    FetchStatus::Failed(error.clone()),
                    TileEvent::Failed {
                        key: key.clone(),
                        error,
                    },
                )
            }
        };

        let mut requests = lock(&self.requests);
        if let FetchStatus::Failed(error) = &status {
            let until = Instant::now() + self.config.failure_cooldown;
            lock(&self.cooldown).insert(key.clone(), (until, error.clone()));
        }
        if let Some(request) = requests.remove(key) {
            request.status.send_replace(status);
        }
        drop(requests);
        let _ = self.events.send(event);
    }

    async fn process(&self, key: TileKey, cancel: CancellationToken) {
        let store = Arc::clone(&self.store);
        let disk_key = key.clone();
        let stored = tokio::task::spawn_blocking(move || store.get(&disk_key))
            .await
            .ok()
            .flatten();
        if let Some(record) = stored {
            debug!("Loaded tile {} from store", key);
            bump(&self.counters.store_loads);
            self.complete(&key, Ok(record.image));
            return;
        }

        match self.download(&key, &cancel).await {
            None => {
                if let Some(request) = lock(&self.requests).remove(&key) {
                    self.resolve_cancelled(&key, &request);
                }
            }
            Some(Ok(bytes)) => {
                let image = Arc::new(bytes);
                let store = Arc::clone(&self.store);
                let put_key = key.clone();
                let put_image = Arc::clone(&image);
                let evicted = tokio::task::spawn_blocking(move || store.put(put_key, put_image))
                    .await
                    .unwrap_or_default();
                for victim in evicted {
                    let _ = self.events.send(TileEvent::Evicted(victim));
                }
                self.complete(&key, Ok(image));
            }
            Some(Err(error)) => {
                warn!("Failed to fetch tile {}: {}", key, error);
                self.complete(&key, Err(error));
            }
        }
    }

    /// Network fetch with timeout, retries and validation.
    /// `None` when shutdown interrupted it.
    async fn download(
        &self,
        key: &TileKey,
        cancel: &CancellationToken,
    ) -> Option<Result<Vec<u8>, FetchError>> {
        let mut attempt = 0;
        loop {
            bump(&self.counters.network_calls);
            let started = Instant::now();

            let result = tokio::select! {
                result = tokio::time::timeout(self.config.timeout, self.source.fetch(key)) => {
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(FetchError::Timeout),
                    }
                }
                () = cancel.cancelled() => return None,
            };

            match result {
                Ok(bytes) => {
                    let elapsed = started.elapsed().as_millis() as u64;
                    self.counters.downloads.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .download_ms_total
                        .fetch_add(elapsed, Ordering::Relaxed);
                    return Some(validated(bytes).await);
                }
                Err(error) if error.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = self
                        .config
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempt));
                    debug!(
                        "Tile {} attempt {} failed ({}), retrying in {:?}",
                        key,
                        attempt + 1,
                        error,
                        delay
                    );
                    attempt += 1;
                    tokio::select! {
                        () = sleep(delay) => {}
                        () = cancel.cancelled() => return None,
                    }
                }
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

async fn worker_loop<S: TileSource>(shared: Arc<Shared<S>>, id: usize) {
    debug!("Tile worker {} started", id);
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match shared.next_job() {
            Some((key, cancel)) => {
                if cancel.is_cancelled() {
                    continue;
                }
                shared.process(key, cancel).await;
            }
            None => {
                tokio::select! {
                    () = shared.notify.notified() => {}
                    () = shared.shutdown.cancelled() => break,
                }
            }
        }
    }
    debug!("Tile worker {} stopped", id);
}

/// Decode off the async threads and keep only PNG, JPEG and WebP images.
async fn validated(bytes: Vec<u8>) -> Result<Vec<u8>, FetchError> {
    tokio::task::spawn_blocking(move || validate_image(&bytes).map(|()| bytes))
        .await
        .unwrap_or_else(|e| Err(FetchError::DecodeError(e.to_string())))
}

pub(crate) fn validate_image(bytes: &[u8]) -> Result<(), FetchError> {
    if bytes.is_empty() {
        return Err(FetchError::DecodeError("empty response".to_string()));
    }

    let format =
        image::guess_format(bytes).map_err(|e| FetchError::DecodeError(e.to_string()))?;
    if !matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP
    ) {
        return Err(FetchError::DecodeError(format!(
            "unsupported image format {format:?}"
        )));
    }

    image::load_from_memory_with_format(bytes, format)
        .map(|_| ())
        .map_err(|e| FetchError::DecodeError(e.to_string()))
}

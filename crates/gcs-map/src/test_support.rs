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

//! Shared helpers for unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{ImageFormat, Rgba, RgbaImage};

use crate::fetch::{FetchError, TileSource};
use crate::tile::TileKey;

/// A small valid PNG.
pub(crate) fn png_tile() -> Vec<u8> {
    let image = RgbaImage::from_pixel(4, 4, Rgba([30, 120, 200, 255]));
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png).unwrap();
    buffer.into_inner()
}

/// Scripted tile source that counts calls.
///
/// Responses are served in order; once the script is empty every call
/// returns [`png_tile`].
#[derive(Debug, Clone, Default)]
pub(crate) struct MockSource {
    calls: Arc<AtomicUsize>,
    order: Arc<Mutex<Vec<TileKey>>>,
    responses: Arc<Mutex<VecDeque<Result<Vec<u8>, FetchError>>>>,
    delay: Duration,
}

impl MockSource {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub(crate) fn push_response(&self, response: Result<Vec<u8>, FetchError>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn order(&self) -> Vec<TileKey> {
        self.order.lock().unwrap().clone()
    }
}

impl TileSource for MockSource {
    fn fetch(&self, key: &TileKey) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.order.lock().unwrap().push(key.clone());
        let response = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(png_tile()));
        let delay = self.delay;

        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            response
        }
    }
}

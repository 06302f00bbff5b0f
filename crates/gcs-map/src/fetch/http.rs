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

//! HTTP tile source backed by `reqwest`.

use std::future::Future;
use std::sync::Arc;

use log::debug;
use reqwest::header::ACCEPT;

use super::provider::ProviderRegistry;
use super::{FetchError, TileSource};
use crate::tile::TileKey;

/// Downloads tiles from the providers in a [`ProviderRegistry`].
///
/// Timeouts are applied by the fetcher, not by the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTileSource {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
}

impl HttpTileSource {
    pub fn new(registry: ProviderRegistry, user_agent: &str) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            client,
            registry: Arc::new(registry),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }
}

impl TileSource for HttpTileSource {
    fn fetch(&self, key: &TileKey) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let url = self.registry.url_for(key);
        let client = self.client.clone();
        let provider = key.provider.clone();

        async move {
            let url = url.ok_or(FetchError::UnknownProvider(provider))?;
            debug!("Downloading tile {}", url);

            let response = client
                .get(&url)
                .header(ACCEPT, "image/*")
                .send()
                .await
                .map_err(|e| classify(&e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::HttpError(status.as_u16()));
            }

            let bytes = response.bytes().await.map_err(|e| classify(&e))?;
            Ok(bytes.to_vec())
        }
    }
}

fn classify(error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(error.to_string())
    }
}

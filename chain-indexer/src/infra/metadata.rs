// This file is part of flowindex.
// Copyright (C) 2025 Flowindex Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::queue::{MetadataFetcher, PriceSource};
use indexer_common::error::BoxError;
use serde::Deserialize;
use std::time::Duration;

/// HTTP implementations of the queue-worker side effects: NFT metadata documents and the
/// token price sample.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    price_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Endpoint returning `{ "price": <f64> }`.
    pub price_url: String,

    #[serde(default = "request_timeout_default", with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: Config) -> Result<Self, BoxError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            price_url: config.price_url,
        })
    }
}

impl MetadataFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<serde_json::Value, BoxError> {
        let response = self.client.get(uri).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

impl PriceSource for HttpFetcher {
    async fn current_price(&self) -> Result<f64, BoxError> {
        let response = self
            .client
            .get(&self.price_url)
            .send()
            .await?
            .error_for_status()?;
        let price: PriceResponse = response.json().await?;
        Ok(price.price)
    }
}

fn request_timeout_default() -> Duration {
    Duration::from_secs(30)
}

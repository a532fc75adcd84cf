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

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{fmt::Debug, time::Duration};

/// Configuration for the Postgres connection pool. `url` is the `DB_URL` connection string.
#[derive(Clone, Deserialize)]
pub struct Config {
    pub url: SecretString,

    #[serde(default = "max_connections_default")]
    pub max_connections: u32,

    #[serde(default = "acquire_timeout_default", with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

/// A cloneable Postgres connection pool; saturation surfaces as acquire timeouts which
/// callers treat as retryable.
#[derive(Debug, Clone, derive_more::Deref)]
pub struct PostgresPool(PgPool);

impl PostgresPool {
    pub async fn new(config: Config) -> Result<Self, sqlx::Error> {
        let Config {
            url,
            max_connections,
            acquire_timeout,
        } = config;

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url.expose_secret())
            .await?;

        Ok(Self(pool))
    }
}

fn max_connections_default() -> u32 {
    10
}

fn acquire_timeout_default() -> Duration {
    Duration::from_secs(30)
}

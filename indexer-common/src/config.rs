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

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::Deserialize;
use std::env;

/// Well-known plain environment names and the config paths they map onto. These predate the
/// nested `FLOWINDEX__` scheme and are kept for operator compatibility.
const PLAIN_ENV_MAPPINGS: &[(&str, &str)] = &[
    ("DB_URL", "infra.storage.url"),
    ("FLOW_ACCESS_NODE", "infra.node.url"),
    ("FLOW_HISTORIC_ACCESS_NODES", "infra.node.historic"),
    ("BACKFILL_START", "application.backfill.start"),
    ("BACKFILL_END", "application.backfill.end"),
    ("BACKFILL_BATCH_BLOCKS", "application.backfill.batch_blocks"),
    ("BACKFILL_WORKERS", "application.backfill.workers"),
    ("BACKFILL_DRY_RUN", "application.backfill.dry_run"),
    ("REPAIR_LIMIT", "application.repair.limit"),
    ("REPAIR_TIMEOUT_SEC", "application.repair.timeout_sec"),
];

/// Extension trait to load a configuration from `config.yaml` (or `$CONFIG_FILE`), overlaid
/// with `FLOWINDEX__` prefixed environment variables and the well-known plain names.
pub trait ConfigExt
where
    Self: for<'de> Deserialize<'de>,
{
    fn load() -> Result<Self, figment::Error> {
        let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yaml".to_string());

        let mut figment = Figment::new()
            .merge(Yaml::file(config_file))
            .merge(Env::prefixed("FLOWINDEX__").split("__").lowercase(true));

        for (name, path) in PLAIN_ENV_MAPPINGS {
            figment = figment.merge(Env::raw().only(&[*name]).map(|_| (*path).into()).split("."));
        }

        figment.extract()
    }
}

impl<T> ConfigExt for T where T: for<'de> Deserialize<'de> {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct TestConfig {
        infra: Infra,
    }

    #[derive(Debug, Deserialize)]
    struct Infra {
        storage: Storage,
    }

    #[derive(Debug, Deserialize)]
    struct Storage {
        url: String,
    }

    #[test]
    fn test_plain_env_mapping() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DB_URL", "postgres://indexer@localhost/flowindex");
            let config = TestConfig::load().expect("config loads");
            assert_eq!(config.infra.storage.url, "postgres://indexer@localhost/flowindex");
            Ok(())
        });
    }

    #[test]
    fn test_prefixed_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                "infra:\n  storage:\n    url: postgres://from-yaml\n",
            )?;
            jail.set_env("FLOWINDEX__INFRA__STORAGE__URL", "postgres://from-env");
            let config = TestConfig::load().expect("config loads");
            assert_eq!(config.infra.storage.url, "postgres://from-env");
            Ok(())
        });
    }
}

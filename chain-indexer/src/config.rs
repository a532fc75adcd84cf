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

use crate::{application, infra};
use indexer_common::{infra::pool, telemetry};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "run_migrations_default")]
    pub run_migrations: bool,

    #[serde(rename = "application")]
    pub application_config: application::Config,

    #[serde(rename = "infra")]
    pub infra_config: InfraConfig,

    #[serde(rename = "telemetry")]
    pub telemetry_config: telemetry::Config,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfraConfig {
    #[serde(rename = "storage")]
    pub storage_config: pool::postgres::Config,

    #[serde(rename = "node")]
    pub node_config: infra::flow_node::Config,

    #[serde(rename = "fetchers")]
    pub fetcher_config: infra::metadata::Config,
}

fn run_migrations_default() -> bool {
    true
}

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

use anyhow::Context;
use chain_indexer::{
    application,
    config::Config,
    infra::{flow_node::FlowNode, metadata::HttpFetcher, storage::PostgresStorage},
};
use indexer_common::{config::ConfigExt, infra::{migrations, pool}, telemetry};
use log::{error, info};
use std::panic;
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() {
    telemetry::init_logging();
    panic::set_hook(Box::new(|panic| error!(panic:%; "process panicked")));

    let config = match Config::load().context("load configuration") {
        Ok(config) => config,
        Err(error) => {
            error!(error:% = format!("{error:#}"); "invalid configuration");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(config).await {
        let backtrace = error.backtrace();
        let error = format!("{error:#}");
        error!(error, backtrace:%; "process exited with ERROR");
        std::process::exit(2);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(config:?; "starting");

    let Config {
        run_migrations,
        application_config,
        infra_config,
        telemetry_config:
            telemetry::Config {
                tracing_config,
                metrics_config,
            },
    } = config;

    telemetry::init_tracing(tracing_config);
    telemetry::init_metrics(metrics_config);

    let sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;

    let pool = pool::postgres::PostgresPool::new(infra_config.storage_config)
        .await
        .context("create DB pool for Postgres")?;

    if run_migrations {
        migrations::postgres::run(&pool)
            .await
            .context("run Postgres migrations")?;
    }

    let node = FlowNode::new(infra_config.node_config)
        .map_err(|error| anyhow::anyhow!("create access node client: {error}"))?;
    let store = PostgresStorage::new(pool);
    let fetcher = HttpFetcher::new(infra_config.fetcher_config)
        .map_err(|error| anyhow::anyhow!("create HTTP fetcher: {error}"))?;

    application::run(application_config, node, store, fetcher, sigterm)
        .await
        .context("run chain-indexer application")
}

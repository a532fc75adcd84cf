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

mod metrics;

use crate::domain::{
    derive::{DeriverConfig, run_deriver},
    ingest::{IngesterConfig, run_ingester},
    lease::LeaseStore,
    node::Node,
    processor::Processor,
    processors::{
        AccountsProcessor, ContractsProcessor, DailyBalancesProcessor, DefiProcessor,
        EvmProcessor, FtHoldingsProcessor, NftOwnershipProcessor, StakingProcessor,
        TokenProcessor, TxMetricsProcessor,
    },
    queue::{
        JobStore, MetadataFetcher, PricePollerConfig, PriceSource, QueueConfig,
        run_nft_metadata_worker, run_price_poller, run_queue_scan, run_reconcile_worker,
    },
    storage::Storage,
};
use anyhow::Context;
use indexer_common::domain::{Direction, MAIN_INGESTER, history_deriver, history_worker};
use log::{info, warn};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tokio::{select, signal::unix::Signal, task::JoinSet, time::interval};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The height indexing begins at: forward workers walk up from here, history workers
    /// walk down from here (or their window starts).
    pub start_height: u64,

    pub forward: ForwardConfig,

    /// One entry per spork window, processed by `history_s1`, `history_s2`, ...
    #[serde(default)]
    pub history: Vec<HistoryWindowConfig>,

    pub history_defaults: IngestDefaults,

    pub live_derivers: DeriverDefaults,

    pub history_derivers: DeriverDefaults,

    pub queue: QueueConfig,

    pub price: PricePollerConfig,

    #[serde(default = "sweep_interval_default", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Per-worker enable flags and chunk-size overrides, keyed by worker name.
    #[serde(default)]
    pub worker_config: BTreeMap<String, WorkerConfig>,

    /// Parameters of the external backfill tool; validated here so misconfiguration fails
    /// the process early.
    #[serde(default)]
    pub backfill: Option<BackfillConfig>,

    /// Parameters of the external repair tool.
    #[serde(default)]
    pub repair: Option<RepairConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForwardConfig {
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub chunk_size: u64,
    pub fetch_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tip_poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryWindowConfig {
    /// Highest height of the window (exclusive); the frontier starts here.
    pub start: u64,
    /// Lowest height of the window (inclusive).
    pub stop: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestDefaults {
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub chunk_size: u64,
    pub fetch_concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeriverDefaults {
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    pub chunk_size: u64,
    pub safety_margin: u64,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    pub enabled: Option<bool>,
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackfillConfig {
    pub start: u64,
    pub end: u64,
    pub batch_blocks: u64,
    pub workers: u32,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepairConfig {
    pub limit: u32,
    pub timeout_sec: u64,
}

/// Wire up and run every worker of the indexing pipeline: the forward ingester, the history
/// ingesters, the two-direction derivers, the lease sweeper and the queue workers. Workers
/// coordinate solely through the store, so any number of processes can run this.
pub async fn run<N, S, F>(
    config: Config,
    node: N,
    store: S,
    fetcher: F,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    N: Node,
    S: Storage + LeaseStore + JobStore,
    F: MetadataFetcher + PriceSource,
{
    if let Some(backfill) = &config.backfill {
        anyhow::ensure!(
            backfill.start <= backfill.end && backfill.batch_blocks > 0 && backfill.workers > 0,
            "invalid backfill parameters: {backfill:?}"
        );
    }
    if let Some(repair) = &config.repair {
        anyhow::ensure!(
            repair.limit > 0 && repair.timeout_sec > 0,
            "invalid repair parameters: {repair:?}"
        );
    }

    let mut tasks = JoinSet::<anyhow::Result<()>>::new();
    let worker_config = |name: &str| config.worker_config.get(name).cloned().unwrap_or_default();
    let enabled = |name: &str, default: bool| worker_config(name).enabled.unwrap_or(default);

    // Forward raw ingester.
    if enabled(MAIN_INGESTER, config.forward.enabled) {
        let ingester_config = IngesterConfig {
            worker_name: MAIN_INGESTER.to_string(),
            direction: Direction::Forward,
            start_height: config.start_height,
            stop_height: None,
            chunk_size: worker_config(MAIN_INGESTER)
                .chunk_size
                .unwrap_or(config.forward.chunk_size),
            fetch_concurrency: config.forward.fetch_concurrency,
            fetch_timeout: config.forward.fetch_timeout,
            tip_poll_interval: config.forward.tip_poll_interval,
            lease_ttl: config.forward.lease_ttl,
            max_attempts: config.forward.max_attempts,
        };
        tasks.spawn(run_ingester(
            ingester_config,
            node.clone(),
            store.clone(),
            store.clone(),
        ));
    }

    // History raw ingesters, one per spork window.
    for (slot, window) in config.history.iter().enumerate() {
        let worker_name = history_worker(slot + 1);
        if !enabled(&worker_name, config.history_defaults.enabled) {
            continue;
        }

        let ingester_config = IngesterConfig {
            worker_name: worker_name.clone(),
            direction: Direction::Backward,
            start_height: window.start,
            stop_height: Some(window.stop),
            chunk_size: worker_config(&worker_name)
                .chunk_size
                .unwrap_or(config.history_defaults.chunk_size),
            fetch_concurrency: config.history_defaults.fetch_concurrency,
            fetch_timeout: config.history_defaults.fetch_timeout,
            tip_poll_interval: Duration::from_secs(1),
            lease_ttl: config.history_defaults.lease_ttl,
            max_attempts: config.history_defaults.max_attempts,
        };
        tasks.spawn(run_ingester(
            ingester_config,
            node.clone(),
            store.clone(),
            store.clone(),
        ));
    }

    // Derivers: every processor runs a live (forward) and a history (backward) instance.
    spawn_derivers(&config, &mut tasks, &store, TokenProcessor);
    spawn_derivers(&config, &mut tasks, &store, EvmProcessor);
    spawn_derivers(&config, &mut tasks, &store, ContractsProcessor);
    spawn_derivers(&config, &mut tasks, &store, AccountsProcessor);
    spawn_derivers(&config, &mut tasks, &store, TxMetricsProcessor);
    spawn_derivers(&config, &mut tasks, &store, StakingProcessor);
    spawn_derivers(&config, &mut tasks, &store, DefiProcessor);
    spawn_derivers(&config, &mut tasks, &store, FtHoldingsProcessor);
    spawn_derivers(&config, &mut tasks, &store, NftOwnershipProcessor);
    spawn_derivers(&config, &mut tasks, &store, DailyBalancesProcessor);

    // Expired-lease sweeper; recovers leases whose holder crashed without release.
    tasks.spawn({
        let store = store.clone();
        let sweep_interval = config.sweep_interval;
        async move {
            let mut ticker = interval(sweep_interval);
            loop {
                ticker.tick().await;
                let leases = LeaseStore::reclaim_expired(&store)
                    .await
                    .context("reclaim expired leases")?;
                let jobs = JobStore::reclaim_expired(&store)
                    .await
                    .context("reclaim expired jobs")?;
                if leases + jobs > 0 {
                    info!(leases, jobs; "reclaimed expired leases");
                }
            }
        }
    });

    // Queue workers.
    if enabled("queue", true) {
        tasks.spawn(run_queue_scan(
            config.queue.clone(),
            store.clone(),
            store.clone(),
        ));
        tasks.spawn(run_nft_metadata_worker(
            config.queue.clone(),
            store.clone(),
            store.clone(),
            fetcher.clone(),
        ));
        tasks.spawn(run_reconcile_worker(
            config.queue.clone(),
            store.clone(),
            store.clone(),
        ));
    }
    if enabled("price", true) {
        tasks.spawn(run_price_poller(
            config.price.clone(),
            store.clone(),
            fetcher.clone(),
        ));
    }

    // Checkpoint gauges for the metrics endpoint.
    tasks.spawn(metrics::run_metrics_loop(
        store.clone(),
        config.history.len(),
    ));

    info!(tasks = tasks.len(); "pipeline started");

    // Workers run until SIGTERM. A worker finishing cleanly (an exhausted history window)
    // is fine; a worker error is fatal.
    loop {
        select! {
            joined = tasks.join_next() => match joined {
                Some(result) => {
                    result
                        .context("worker task panicked")?
                        .context("worker task failed")?;
                    info!("worker finished");
                }
                None => {
                    warn!("all workers finished");
                    return Ok(());
                }
            },

            _ = sigterm.recv() => {
                warn!("SIGTERM received");
                return Ok(());
            }
        }
    }
}

fn spawn_derivers<S, P>(
    config: &Config,
    tasks: &mut JoinSet<anyhow::Result<()>>,
    store: &S,
    processor: P,
) where
    S: Storage + LeaseStore + JobStore,
    P: Processor + Clone,
{
    let worker_config = |name: &str| config.worker_config.get(name).cloned().unwrap_or_default();

    let live_name = processor.name().to_string();
    if worker_config(&live_name)
        .enabled
        .unwrap_or(config.live_derivers.enabled)
    {
        let deriver_config = DeriverConfig {
            direction: Direction::Forward,
            chunk_size: worker_config(&live_name)
                .chunk_size
                .unwrap_or(config.live_derivers.chunk_size),
            safety_margin: config.live_derivers.safety_margin,
            start_height: config.start_height,
            poll_interval: config.live_derivers.poll_interval,
            lease_ttl: config.live_derivers.lease_ttl,
            max_attempts: config.live_derivers.max_attempts,
        };
        tasks.spawn(run_deriver(
            processor.clone(),
            deriver_config,
            store.clone(),
            store.clone(),
        ));
    }

    let history_name = history_deriver(processor.name());
    if worker_config(&history_name)
        .enabled
        .unwrap_or(config.history_derivers.enabled)
    {
        let deriver_config = DeriverConfig {
            direction: Direction::Backward,
            chunk_size: worker_config(&history_name)
                .chunk_size
                .unwrap_or(config.history_derivers.chunk_size),
            safety_margin: config.history_derivers.safety_margin,
            start_height: config.start_height,
            poll_interval: config.history_derivers.poll_interval,
            lease_ttl: config.history_derivers.lease_ttl,
            max_attempts: config.history_derivers.max_attempts,
        };
        tasks.spawn(run_deriver(
            processor,
            deriver_config,
            store.clone(),
            store.clone(),
        ));
    }
}

fn enabled_default() -> bool {
    true
}

fn sweep_interval_default() -> Duration {
    Duration::from_secs(30)
}

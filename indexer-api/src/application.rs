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

use crate::domain::{
    status::{SpeedTracker, StatusInputs, StatusReport, WorkerSettings, build_report},
    storage::Storage,
};
use anyhow::Context;
use indexer_common::domain::{CHAIN_TIP, HISTORY_PREFIX};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, Instant},
};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{select, signal::unix::Signal, sync::broadcast, task, time::interval};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Start height of the deployment; forward progress is measured from here.
    pub start_height: u64,

    #[serde(default = "enabled_default")]
    pub forward_enabled: bool,

    #[serde(default = "enabled_default")]
    pub history_enabled: bool,

    /// Mirror of the pipeline's per-worker settings, surfaced in the status document.
    #[serde(default)]
    pub worker_config: BTreeMap<String, WorkerConfigEntry>,

    #[serde(default = "poll_interval_default", with = "humantime_serde")]
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfigEntry {
    pub enabled: Option<bool>,
    pub chunk_size: Option<u64>,
}

/// The shared, eventually consistent status state: a cache refreshed every poll interval
/// and a broadcast channel pushing material changes to websocket subscribers.
#[derive(Clone)]
pub struct StatusHub {
    pub cache: Arc<RwLock<Option<StatusReport>>>,
    pub updates: broadcast::Sender<StatusReport>,
}

impl StatusHub {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            cache: Arc::new(RwLock::new(None)),
            updates,
        }
    }
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the status aggregation loop next to the HTTP surface until SIGTERM.
pub async fn run<S, F>(
    config: Config,
    storage: S,
    hub: StatusHub,
    serve: F,
    mut sigterm: Signal,
) -> anyhow::Result<()>
where
    S: Storage,
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let aggregate_task = task::spawn({
        let hub = hub.clone();
        async move {
            let mut speeds = SpeedTracker::default();
            let mut ticker = interval(config.poll_interval);

            loop {
                ticker.tick().await;

                let report = match aggregate(&config, &storage, &mut speeds).await {
                    Ok(report) => report,
                    Err(error) => {
                        warn!(error:% = format!("{error:#}"); "status aggregation failed");
                        continue;
                    }
                };

                let material = hub
                    .cache
                    .read()
                    .as_ref()
                    .is_none_or(|last| !last.material_eq(&report));

                *hub.cache.write() = Some(report.clone());

                if material {
                    debug!(indexed_height = report.indexed_height; "status changed");
                    // Send fails only without subscribers, which is fine.
                    let _ = hub.updates.send(report);
                }
            }
        }
    });

    let serve_task = task::spawn(serve);

    info!("status aggregator started");

    select! {
        result = aggregate_task => result.context("aggregate_task panicked")?,

        result = serve_task => result
            .context("serve_task panicked")?
            .context("serve_task failed"),

        _ = sigterm.recv() => {
            warn!("SIGTERM received");
            Ok(())
        }
    }
}

async fn aggregate<S>(
    config: &Config,
    storage: &S,
    speeds: &mut SpeedTracker,
) -> anyhow::Result<StatusReport>
where
    S: Storage,
{
    let checkpoints = storage.checkpoints().await.context("read checkpoints")?;
    let raw_done_ranges = storage
        .raw_done_ranges()
        .await
        .context("read done ranges")?;
    let totals = storage.totals().await.context("read totals")?;
    let unresolved_errors = storage
        .unresolved_errors_by_worker()
        .await
        .context("read unresolved errors")?;
    let dead_leases = storage
        .dead_leases_by_worker()
        .await
        .context("read dead leases")?;

    let now = Instant::now();
    for row in &checkpoints {
        if row.worker_name != CHAIN_TIP {
            speeds.record(&row.worker_name, row.height, now);
        }
    }

    let worker_enabled = config
        .worker_config
        .iter()
        .map(|(worker, entry)| {
            let default = if worker.starts_with(HISTORY_PREFIX) {
                config.history_enabled
            } else {
                config.forward_enabled
            };
            (worker.clone(), entry.enabled.unwrap_or(default))
        })
        .collect();
    let worker_config = config
        .worker_config
        .iter()
        .map(|(worker, entry)| {
            (
                worker.clone(),
                WorkerSettings {
                    enabled: entry.enabled.unwrap_or(true),
                    chunk_size: entry.chunk_size,
                },
            )
        })
        .collect();

    let generated_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    Ok(build_report(
        StatusInputs {
            start_height: config.start_height,
            forward_enabled: config.forward_enabled,
            history_enabled: config.history_enabled,
            worker_enabled,
            worker_config,
            checkpoints,
            raw_done_ranges,
            totals,
            unresolved_errors,
            dead_leases,
            generated_at,
        },
        speeds,
    ))
}

fn enabled_default() -> bool {
    true
}

fn poll_interval_default() -> Duration {
    Duration::from_secs(3)
}

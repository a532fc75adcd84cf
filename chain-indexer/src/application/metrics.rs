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
    processors::{PHASE_1, PHASE_2},
    storage::Storage,
};
use indexer_common::domain::{CHAIN_TIP, MAIN_INGESTER, history_deriver, history_worker};
use metrics::gauge;
use std::time::Duration;
use tokio::time::interval;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

/// Periodically export per-worker checkpoint heights as gauges.
pub(crate) async fn run_metrics_loop<S>(storage: S, history_windows: usize) -> anyhow::Result<()>
where
    S: Storage,
{
    let mut workers = vec![MAIN_INGESTER.to_string(), CHAIN_TIP.to_string()];
    workers.extend((1..=history_windows).map(history_worker));
    for processor in PHASE_1.iter().chain(PHASE_2) {
        workers.push((*processor).to_string());
        workers.push(history_deriver(processor));
    }

    let mut ticker = interval(SAMPLE_INTERVAL);

    loop {
        ticker.tick().await;

        for worker in &workers {
            if let Some(height) = storage.checkpoint_of(worker).await? {
                gauge!("flowindex_checkpoint_height", "worker" => worker.clone())
                    .set(height as f64);
            }
        }
    }
}

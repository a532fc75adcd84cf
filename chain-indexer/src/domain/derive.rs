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
    ingest::Backoff,
    lease::{ClaimRequest, Lease, LeaseStore},
    processor::{Processor, RangeInput},
    storage::{CheckpointUpdate, Storage},
};
use anyhow::{Context, bail};
use indexer_common::domain::{Direction, ErrorKind, MAIN_INGESTER, NewIndexingError, history_deriver};
use log::{debug, info, warn};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct DeriverConfig {
    pub direction: Direction,
    /// Blocks per claim; small for live derivation, large for history.
    pub chunk_size: u64,
    /// How far the claim ceiling stays below the forward raw checkpoint.
    pub safety_margin: u64,
    /// The height indexing began at; forward cursors start here, backward ones walk down
    /// from here.
    pub start_height: u64,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

/// Run one deriver worker: claim ranges for the processor honoring the two-phase DAG, read
/// the raw rows, derive, and write rows plus checkpoint in one transaction. Phase-2 workers
/// never claim past the checkpoints of their phase-1 dependencies.
pub async fn run_deriver<P, S, L>(
    processor: P,
    config: DeriverConfig,
    storage: S,
    leases: L,
) -> anyhow::Result<()>
where
    P: Processor,
    S: Storage,
    L: LeaseStore,
{
    let worker_name = match config.direction {
        Direction::Forward => processor.name().to_string(),
        Direction::Backward => history_deriver(processor.name()),
    };
    let holder_id = Uuid::new_v4();
    let mut backoff = Backoff::default();

    info!(
        worker = worker_name.as_str(),
        direction:% = config.direction,
        dependencies:? = processor.dependencies();
        "deriver starting"
    );

    loop {
        let Some(limit) = claim_limit(&processor, &worker_name, &config, &storage).await? else {
            sleep(config.poll_interval).await;
            continue;
        };

        let request = ClaimRequest {
            worker_name: worker_name.clone(),
            holder_id,
            direction: config.direction,
            batch_size: config.chunk_size,
            start: config.start_height,
            limit: Some(limit),
            // Forward derivation advances in full chunks; the backward tail may be shorter.
            min_span: match config.direction {
                Direction::Forward => config.chunk_size,
                Direction::Backward => 1,
            },
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_attempts,
        };

        match leases.claim_next(&request).await? {
            Some(lease) => {
                match process_lease(&processor, &worker_name, &config, &storage, &lease).await {
                    Ok(()) => {
                        leases.complete(&lease, config.direction).await?;
                        metrics::counter!("flowindex_ranges_derived", "worker" => worker_name.clone())
                            .increment(1);
                        debug!(worker = worker_name.as_str(), range:% = lease.range; "range derived");
                        backoff.reset();
                    }

                    Err(error) => {
                        warn!(
                            worker = worker_name.as_str(),
                            range:% = lease.range,
                            error:% = error;
                            "derivation failed"
                        );

                        storage
                            .log_indexing_error(&NewIndexingError::new(
                                worker_name.as_str(),
                                lease.range.from,
                                ErrorKind::SaveFailed,
                                error.to_string(),
                            ))
                            .await?;
                        leases.fail(&lease, config.max_attempts).await?;
                        backoff.sleep().await;
                    }
                }
            }

            // Caught up to the claimable region; sleep until raw workers advance.
            None => sleep(config.poll_interval).await,
        }
    }
}

/// The inclusive bound of claimable heights for this worker, or `None` when nothing is
/// derivable yet. Detects the fatal case of a phase-2 checkpoint beyond a dependency.
async fn claim_limit<P, S>(
    processor: &P,
    worker_name: &str,
    config: &DeriverConfig,
    storage: &S,
) -> anyhow::Result<Option<u64>>
where
    P: Processor,
    S: Storage,
{
    let own_checkpoint = storage
        .checkpoint_of(worker_name)
        .await
        .context("get own checkpoint")?;

    match config.direction {
        Direction::Forward => {
            let Some(raw_checkpoint) = storage
                .checkpoint_of(MAIN_INGESTER)
                .await
                .context("get raw checkpoint")?
            else {
                return Ok(None);
            };
            let mut limit = raw_checkpoint.saturating_sub(config.safety_margin);

            for dependency in processor.dependencies() {
                let Some(dependency_checkpoint) = storage
                    .checkpoint_of(dependency)
                    .await
                    .context("get dependency checkpoint")?
                else {
                    return Ok(None);
                };

                if own_checkpoint.is_some_and(|own| own > dependency_checkpoint) {
                    bail!(
                        "checkpoint of {worker_name} is past its dependency {dependency} \
                         ({own_checkpoint:?} > {dependency_checkpoint}); refusing to continue"
                    );
                }

                limit = limit.min(dependency_checkpoint);
            }

            Ok(Some(limit))
        }

        Direction::Backward => {
            let mut floor = storage
                .history_covered_floor(config.start_height)
                .await
                .context("get covered raw floor")?;

            for dependency in processor.dependencies() {
                let Some(dependency_frontier) = storage
                    .checkpoint_of(&history_deriver(dependency))
                    .await
                    .context("get dependency frontier")?
                else {
                    return Ok(None);
                };

                if own_checkpoint.is_some_and(|own| own < dependency_frontier) {
                    bail!(
                        "frontier of {worker_name} is past its dependency {dependency} \
                         ({own_checkpoint:?} < {dependency_frontier}); refusing to continue"
                    );
                }

                floor = floor.max(dependency_frontier);
            }

            Ok(Some(floor))
        }
    }
}

async fn process_lease<P, S>(
    processor: &P,
    worker_name: &str,
    config: &DeriverConfig,
    storage: &S,
    lease: &Lease,
) -> Result<(), sqlx::Error>
where
    P: Processor,
    S: Storage,
{
    let wanted = processor.inputs();
    let mut input = RangeInput::default();
    if wanted.transactions {
        input.transactions = storage.get_transactions_in_range(lease.range).await?;
    }
    if wanted.events {
        input.events = storage.get_events_in_range(lease.range).await?;
    }
    if wanted.token_transfers {
        input.token_transfers = storage.get_token_transfers_in_range(lease.range).await?;
    }

    let derived = processor.derive(lease.range, &input);

    let checkpoint = CheckpointUpdate::for_range(worker_name, config.direction, lease.range);
    storage
        .save_derived(lease.range, &derived.output, &checkpoint)
        .await?;

    // One bad event must not block a range; decode failures only reach the ledger.
    for error in derived.errors {
        storage.log_indexing_error(&error).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        BlockRange,
        processors::{FtHoldingsProcessor, TokenProcessor},
        testing::MemoryCoordinator,
    };
    use indexer_common::error::BoxError;

    fn config(direction: Direction, chunk_size: u64) -> DeriverConfig {
        DeriverConfig {
            direction,
            chunk_size,
            safety_margin: 0,
            start_height: 0,
            poll_interval: Duration::from_millis(10),
            lease_ttl: Duration::from_secs(60),
            max_attempts: 20,
        }
    }

    #[tokio::test]
    async fn test_phase1_limit_tracks_raw_checkpoint() -> Result<(), BoxError> {
        let coordinator = MemoryCoordinator::default();
        let config = config(Direction::Forward, 10);

        // No raw rows yet: nothing derivable.
        assert_eq!(
            claim_limit(&TokenProcessor, "token", &config, &coordinator).await?,
            None
        );

        coordinator.set_checkpoint(MAIN_INGESTER, 1_000);
        assert_eq!(
            claim_limit(&TokenProcessor, "token", &config, &coordinator).await?,
            Some(1_000)
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_phase2_barrier() -> Result<(), BoxError> {
        let coordinator = MemoryCoordinator::default();
        coordinator.set_checkpoint(MAIN_INGESTER, 1_000);
        coordinator.set_checkpoint("token", 600);
        coordinator.set_checkpoint("ft_holdings", 499);

        let config = config(Direction::Forward, 100);
        let limit = claim_limit(&FtHoldingsProcessor, "ft_holdings", &config, &coordinator)
            .await?
            .expect("a limit");
        assert_eq!(limit, 600, "phase-2 ceiling is the token checkpoint");

        // A full chunk fits below the dependency: [500, 600) is claimable.
        let request = ClaimRequest {
            worker_name: "ft_holdings".to_string(),
            holder_id: Uuid::new_v4(),
            direction: Direction::Forward,
            batch_size: 100,
            start: 0,
            limit: Some(limit),
            min_span: 100,
            lease_ttl: Duration::from_secs(60),
            max_attempts: 20,
        };
        let lease = coordinator.claim_next(&request).await?.expect("a lease");
        assert_eq!(lease.range, BlockRange::new(500, 600));
        coordinator.complete(&lease, Direction::Forward).await?;

        // [600, 700) is not claimable until token advances further.
        assert_eq!(coordinator.claim_next(&request).await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_phase2_past_dependency_is_fatal() {
        let coordinator = MemoryCoordinator::default();
        coordinator.set_checkpoint(MAIN_INGESTER, 1_000);
        coordinator.set_checkpoint("token", 500);
        coordinator.set_checkpoint("ft_holdings", 700);

        let config = config(Direction::Forward, 100);
        let result = claim_limit(&FtHoldingsProcessor, "ft_holdings", &config, &coordinator).await;
        assert!(result.is_err());
    }
}

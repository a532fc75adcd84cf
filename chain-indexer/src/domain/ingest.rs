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
    BlockData, BlockRange,
    lease::{ClaimRequest, Lease, LeaseError, LeaseState, LeaseStore},
    node::{Node, NodeError},
    storage::{CheckpointUpdate, RawBatch, Storage},
};
use futures::{StreamExt, stream};
use indexer_common::domain::{CHAIN_TIP, Direction, ErrorKind, NewIndexingError};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Per-call deadline of the raw batch write.
const SAVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Exponential backoff with jitter for empty-claim polls and transient failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Sleep the current delay with ±25% jitter, then double it up to the cap.
    pub async fn sleep(&mut self) {
        let jitter = rand::rng().random_range(0.75..=1.25);
        sleep(self.current.mul_f64(jitter)).await;
        self.current = (self.current * 2).min(self.max);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngesterConfig {
    pub worker_name: String,
    pub direction: Direction,
    /// First height to index (forward) or the window start to walk down from (backward).
    pub start_height: u64,
    /// Window floor for backward instances; the instance refuses to mint a lease crossing it.
    pub stop_height: Option<u64>,
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

#[derive(Debug, Error)]
enum IngestError {
    #[error("cannot fetch block {0}")]
    Fetch(u64, #[source] NodeError),

    #[error("cannot save range {0}")]
    Save(BlockRange, #[source] sqlx::Error),

    #[error("cannot renew lease over range {0}")]
    Renew(BlockRange, #[source] LeaseError),
}

impl IngestError {
    fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Fetch(_, _) => ErrorKind::FetchFailed,
            IngestError::Save(_, _) | IngestError::Renew(_, _) => ErrorKind::SaveFailed,
        }
    }

    fn height(&self) -> u64 {
        match self {
            IngestError::Fetch(height, _) => *height,
            IngestError::Save(range, _) | IngestError::Renew(range, _) => range.from,
        }
    }
}

/// Run one raw ingester instance until its work is exhausted (backward windows) or
/// forever (forward). Errors are local to a lease: the worker reports to the ledger and
/// continues with the next claim.
pub async fn run_ingester<N, S, L>(
    config: IngesterConfig,
    node: N,
    storage: S,
    leases: L,
) -> anyhow::Result<()>
where
    N: Node,
    S: Storage,
    L: LeaseStore,
{
    let holder_id = Uuid::new_v4();
    let mut backoff = Backoff::default();
    let mut caught_up = false;

    info!(
        worker = config.worker_name.as_str(),
        direction:% = config.direction,
        holder_id:% = holder_id;
        "ingester starting"
    );

    loop {
        let limit = match config.direction {
            Direction::Forward => match node.latest_height().await {
                Ok(height) => {
                    storage.record_height(CHAIN_TIP, height).await?;
                    Some(height)
                }
                Err(error) => {
                    warn!(
                        worker = config.worker_name.as_str(),
                        error:% = error;
                        "cannot observe chain tip"
                    );
                    backoff.sleep().await;
                    continue;
                }
            },

            Direction::Backward => Some(config.stop_height.unwrap_or_default()),
        };

        let request = ClaimRequest {
            worker_name: config.worker_name.clone(),
            holder_id,
            direction: config.direction,
            batch_size: config.chunk_size,
            start: config.start_height,
            limit,
            min_span: 1,
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_attempts,
        };

        match leases.claim_next(&request).await? {
            Some(lease) => {
                if caught_up {
                    caught_up = false;
                    info!(worker = config.worker_name.as_str(); "caught-up status changed");
                }

                match process_range(&config, &node, &storage, &leases, &lease).await {
                    Ok(()) => {
                        leases.complete(&lease, config.direction).await?;
                        metrics::counter!("flowindex_ranges_completed", "worker" => config.worker_name.clone())
                            .increment(1);
                        debug!(
                            worker = config.worker_name.as_str(),
                            range:% = lease.range;
                            "range ingested"
                        );
                        backoff.reset();
                    }

                    Err(error) => {
                        warn!(
                            worker = config.worker_name.as_str(),
                            range:% = lease.range,
                            error:% = error;
                            "range failed"
                        );

                        storage
                            .log_indexing_error(&NewIndexingError::new(
                                config.worker_name.as_str(),
                                error.height(),
                                error.kind(),
                                format!("{error:#}", error = anyhow::Error::new(error)),
                            ))
                            .await?;

                        let state = leases.fail(&lease, config.max_attempts).await?;
                        metrics::counter!("flowindex_ranges_failed", "worker" => config.worker_name.clone())
                            .increment(1);
                        if state == LeaseState::Dead {
                            warn!(
                                worker = config.worker_name.as_str(),
                                range:% = lease.range,
                                attempts = lease.attempts + 1;
                                "lease dead, requires manual resolution"
                            );
                        }

                        backoff.sleep().await;
                    }
                }
            }

            None => match config.direction {
                Direction::Forward => {
                    if !caught_up {
                        caught_up = true;
                        info!(worker = config.worker_name.as_str(); "caught-up status changed");
                    }
                    sleep(config.tip_poll_interval).await;
                }

                Direction::Backward => {
                    let frontier = storage.checkpoint_of(&config.worker_name).await?;
                    let stop = config.stop_height.unwrap_or_default();
                    if frontier.unwrap_or(config.start_height) <= stop {
                        info!(
                            worker = config.worker_name.as_str(),
                            stop;
                            "history window exhausted"
                        );
                        return Ok(());
                    }

                    backoff.sleep().await;
                }
            },
        }
    }
}

/// Fetch every height of a claimed range with bounded concurrency and write the raw rows in
/// one batch. Structural anomalies (nil blocks, decode failures, suspicious counts) are
/// logged but do not fail the range; transient failures do.
async fn process_range<N, S, L>(
    config: &IngesterConfig,
    node: &N,
    storage: &S,
    leases: &L,
    lease: &Lease,
) -> Result<(), IngestError>
where
    N: Node,
    S: Storage,
    L: LeaseStore,
{
    let range = lease.range;
    storage
        .ensure_partitions(range)
        .await
        .map_err(|error| IngestError::Save(range, error))?;

    let mut fetches = stream::iter(range.heights().map(|height| {
        let node = node.clone();
        let fetch_timeout = config.fetch_timeout;
        async move {
            let result = match timeout(fetch_timeout, node.fetch_block_data(height)).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout),
            };
            (height, result)
        }
    }))
    .buffer_unordered(config.fetch_concurrency);

    let mut batch = RawBatch::default();
    let mut anomalies = Vec::new();

    while let Some((height, result)) = fetches.next().await {
        match result {
            Ok(block_data) => {
                anomalies.extend(check_block(&config.worker_name, &block_data));

                let BlockData {
                    block,
                    transactions,
                    events,
                } = block_data;
                batch.blocks.push(block);
                batch.transactions.extend(transactions);
                batch.events.extend(events);
            }

            Err(error) if error.is_retryable() => return Err(IngestError::Fetch(height, error)),

            // Structural: the source returned what it returned; record and move on.
            Err(error) => {
                let kind = match &error {
                    NodeError::NilBlock(_) => ErrorKind::NilBlock,
                    _ => ErrorKind::DecodeFailed,
                };
                anomalies.push(NewIndexingError::new(
                    config.worker_name.as_str(),
                    height,
                    kind,
                    error.to_string(),
                ));
            }
        }
    }
    drop(fetches);

    // Long fetches can eat into the lease; touch it before the write.
    leases
        .renew(lease, config.lease_ttl)
        .await
        .map_err(|error| IngestError::Renew(range, error))?;

    let checkpoint = CheckpointUpdate::for_range(&config.worker_name, config.direction, range);
    timeout(SAVE_TIMEOUT, storage.save_batch(&batch, &checkpoint))
        .await
        .map_err(|_| IngestError::Save(range, sqlx::Error::PoolTimedOut))?
        .map_err(|error| IngestError::Save(range, error))?;

    for anomaly in anomalies {
        warn!(
            worker = config.worker_name.as_str(),
            block_height = anomaly.block_height,
            error_hash = anomaly.kind.hash();
            "structural anomaly"
        );
        storage
            .log_indexing_error(&anomaly)
            .await
            .map_err(|error| IngestError::Save(range, error))?;
    }

    Ok(())
}

/// Structural consistency checks on one fetched block.
fn check_block(worker_name: &str, block_data: &BlockData) -> Vec<NewIndexingError> {
    let block = &block_data.block;
    let mut anomalies = Vec::new();

    if block.collection_count > 0 && block_data.transactions.is_empty() {
        anomalies.push(NewIndexingError::new(
            worker_name,
            block.height,
            ErrorKind::EmptyBlockWithCollections,
            format!(
                "block {} has {} collections but no transactions",
                block.height, block.collection_count
            ),
        ));
    }

    if block.tx_count as usize != block_data.transactions.len() {
        anomalies.push(NewIndexingError::new(
            worker_name,
            block.height,
            ErrorKind::BlockTxCountMismatch,
            format!(
                "block {} declares {} transactions but carries {}",
                block.height,
                block.tx_count,
                block_data.transactions.len()
            ),
        ));
    }

    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Block,
        testing::{MemoryCoordinator, MockNode, empty_block_data},
    };
    use indexer_common::{domain::MAIN_INGESTER, error::BoxError};

    fn forward_config(worker_name: &str) -> IngesterConfig {
        IngesterConfig {
            worker_name: worker_name.to_string(),
            direction: Direction::Forward,
            start_height: 0,
            stop_height: None,
            chunk_size: 10,
            fetch_concurrency: 4,
            fetch_timeout: Duration::from_secs(120),
            tip_poll_interval: Duration::from_secs(2),
            lease_ttl: Duration::from_secs(60),
            max_attempts: 20,
        }
    }

    fn claim_request(config: &IngesterConfig, holder_id: Uuid, limit: u64) -> ClaimRequest {
        ClaimRequest {
            worker_name: config.worker_name.clone(),
            holder_id,
            direction: config.direction,
            batch_size: config.chunk_size,
            start: config.start_height,
            limit: Some(limit),
            min_span: 1,
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_attempts,
        }
    }

    #[tokio::test]
    async fn test_tip_follow() -> Result<(), BoxError> {
        let config = forward_config(MAIN_INGESTER);
        let coordinator = MemoryCoordinator::default();
        coordinator.set_checkpoint(MAIN_INGESTER, 100);
        let node = MockNode::with_empty_blocks(101..=110);

        // The source advanced to 110: one claim covers the gap.
        let request = claim_request(&config, Uuid::new_v4(), 110);
        let lease = coordinator.claim_next(&request).await?.expect("a lease");
        assert_eq!(lease.range, BlockRange::new(101, 111));

        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        coordinator.complete(&lease, Direction::Forward).await?;

        assert_eq!(coordinator.checkpoint(MAIN_INGESTER), Some(110));
        assert_eq!(coordinator.state().blocks.len(), 10);

        // Caught up: claiming at checkpoint == latest returns none.
        assert_eq!(coordinator.claim_next(&request).await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_crash_recovery() -> Result<(), BoxError> {
        let config = forward_config(MAIN_INGESTER);
        let coordinator = MemoryCoordinator::default();
        coordinator.set_checkpoint(MAIN_INGESTER, 199);
        let node = MockNode::with_empty_blocks(200..=209);

        // First holder claims [200, 210) and crashes without completing.
        let crashed = claim_request(&config, Uuid::new_v4(), 209);
        let lost = coordinator.claim_next(&crashed).await?.expect("a lease");
        assert_eq!(lost.range, BlockRange::new(200, 210));

        // After the TTL the sweep returns the lease to open; sweeping again is a no-op.
        coordinator.expire_held_leases();
        assert_eq!(coordinator.reclaim_expired().await?, 1);
        assert_eq!(coordinator.reclaim_expired().await?, 0);

        // Another instance claims the same range and finishes it.
        let request = claim_request(&config, Uuid::new_v4(), 209);
        let lease = coordinator.claim_next(&request).await?.expect("a lease");
        assert_eq!(lease.range, BlockRange::new(200, 210));

        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        // Re-writing what the crashed holder may have partially written is a no-op.
        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        coordinator.complete(&lease, Direction::Forward).await?;

        assert_eq!(coordinator.checkpoint(MAIN_INGESTER), Some(209));
        assert_eq!(coordinator.state().blocks.len(), 10);

        Ok(())
    }

    #[tokio::test]
    async fn test_structural_anomaly_completes_range() -> Result<(), BoxError> {
        let config = forward_config(MAIN_INGESTER);
        let coordinator = MemoryCoordinator::default();
        coordinator.set_checkpoint(MAIN_INGESTER, 554);
        let node = MockNode::with_empty_blocks([555]);
        node.state()
            .blocks
            .get_mut(&555)
            .expect("block 555")
            .block
            .collection_count = 3;

        let request = claim_request(&config, Uuid::new_v4(), 555);
        let lease = coordinator.claim_next(&request).await?.expect("a lease");

        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        coordinator.complete(&lease, Direction::Forward).await?;

        // Raw rows saved, error ledger entry created, lease done.
        assert!(coordinator.state().blocks.contains_key(&555));
        let errors = coordinator.state().errors.clone();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, ErrorKind::EmptyBlockWithCollections);
        assert_eq!(errors[0].block_height, 555);
        assert_eq!(
            coordinator.lease_states(MAIN_INGESTER),
            vec![(BlockRange::new(555, 556), LeaseState::Done)]
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_transient_failure_fails_lease() -> Result<(), BoxError> {
        let config = forward_config(MAIN_INGESTER);
        let coordinator = MemoryCoordinator::default();
        let node = MockNode::with_empty_blocks(0..=9);
        node.state().failing.insert(5);

        let request = claim_request(&config, Uuid::new_v4(), 9);
        let lease = coordinator.claim_next(&request).await?.expect("a lease");

        let result = process_range(&config, &node, &coordinator, &coordinator, &lease).await;
        assert!(result.is_err());

        let state = coordinator.fail(&lease, config.max_attempts).await?;
        assert_eq!(state, LeaseState::Open);
        assert_eq!(coordinator.checkpoint(MAIN_INGESTER), None);

        // The retry succeeds once the endpoint recovers.
        node.state().failing.clear();
        let lease = coordinator.claim_next(&request).await?.expect("the same lease");
        assert_eq!(lease.range, BlockRange::new(0, 10));
        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        coordinator.complete(&lease, Direction::Forward).await?;
        assert_eq!(coordinator.checkpoint(MAIN_INGESTER), Some(9));

        Ok(())
    }

    #[tokio::test]
    async fn test_attempts_reaching_threshold_kill_the_lease() -> Result<(), BoxError> {
        let mut config = forward_config(MAIN_INGESTER);
        config.max_attempts = 2;
        let coordinator = MemoryCoordinator::default();
        let node = MockNode::with_empty_blocks(0..=9);
        node.state().failing.insert(3);

        let request = claim_request(&config, Uuid::new_v4(), 9);
        for expected in [LeaseState::Open, LeaseState::Dead] {
            let lease = coordinator.claim_next(&request).await?.expect("a lease");
            let result = process_range(&config, &node, &coordinator, &coordinator, &lease).await;
            assert!(result.is_err());
            assert_eq!(coordinator.fail(&lease, config.max_attempts).await?, expected);
        }

        // Dead leases stay dead and are never claimable again.
        assert_eq!(coordinator.claim_next(&request).await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_history_window() -> Result<(), BoxError> {
        let config = IngesterConfig {
            worker_name: "history_s1".to_string(),
            direction: Direction::Backward,
            start_height: 12_020_337,
            stop_height: Some(7_601_063),
            ..forward_config("history_s1")
        };
        let coordinator = MemoryCoordinator::default();
        let node = MockNode::with_empty_blocks(12_020_327..12_020_337);

        let request = ClaimRequest {
            worker_name: config.worker_name.clone(),
            holder_id: Uuid::new_v4(),
            direction: Direction::Backward,
            batch_size: config.chunk_size,
            start: config.start_height,
            limit: config.stop_height,
            min_span: 1,
            lease_ttl: config.lease_ttl,
            max_attempts: config.max_attempts,
        };

        let lease = coordinator.claim_next(&request).await?.expect("a lease");
        assert_eq!(lease.range, BlockRange::new(12_020_327, 12_020_337));

        process_range(&config, &node, &coordinator, &coordinator, &lease).await?;
        coordinator.complete(&lease, Direction::Backward).await?;
        assert_eq!(coordinator.checkpoint("history_s1"), Some(12_020_327));

        // At the stop the claim returns none.
        coordinator.set_checkpoint("history_s1", 7_601_063);
        assert_eq!(coordinator.claim_next(&request).await?, None);

        Ok(())
    }

    fn block_data(height: u64, collection_count: u32, tx_count: u32) -> BlockData {
        BlockData {
            block: Block {
                height,
                id: Default::default(),
                parent_id: Default::default(),
                timestamp: 0,
                collection_count,
                tx_count,
                event_count: 0,
            },
            transactions: Vec::new(),
            events: Vec::new(),
        }
    }

    #[test]
    fn test_check_block_empty_with_collections() {
        let anomalies = check_block("main_ingester", &block_data(555, 3, 0));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, ErrorKind::EmptyBlockWithCollections);
        assert_eq!(anomalies[0].block_height, 555);
    }

    #[test]
    fn test_check_block_tx_count_mismatch() {
        let anomalies = check_block("main_ingester", &block_data(556, 0, 2));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, ErrorKind::BlockTxCountMismatch);
    }

    #[test]
    fn test_check_block_clean() {
        assert!(check_block("main_ingester", &block_data(557, 0, 0)).is_empty());
    }
}

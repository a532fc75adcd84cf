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

//! Background work that is not naturally range-sliced reuses the lease primitive with
//! leases keyed by opaque job ids: NFT metadata fetching, ownership reconciliation, and the
//! price poller feeding the status price history.

use crate::domain::{ingest::Backoff, storage::Storage};
use indexer_common::error::BoxError;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::time::{interval, sleep};
use uuid::Uuid;

pub const NFT_METADATA_QUEUE: &str = "nft_metadata";
pub const NFT_RECONCILE_QUEUE: &str = "nft_reconcile";

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub job_id: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct JobClaim {
    pub queue: String,
    pub holder_id: Uuid,
    pub lease_ttl: Duration,
}

/// Job-keyed leases with the same claim/complete/fail/sweep semantics as block ranges.
#[trait_variant::make(Send)]
pub trait JobStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// Insert a job if it does not exist yet; idempotent on (queue, job id).
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), sqlx::Error>;

    async fn claim_next(&self, claim: &JobClaim) -> Result<Option<Job>, sqlx::Error>;

    async fn complete(&self, job: &Job, holder_id: Uuid) -> Result<(), sqlx::Error>;

    async fn fail(&self, job: &Job, holder_id: Uuid, max_attempts: u32)
    -> Result<(), sqlx::Error>;

    async fn reclaim_expired(&self) -> Result<u64, sqlx::Error>;
}

/// Fetches a metadata document by URI; HTTP in production, canned in tests.
#[trait_variant::make(Send)]
pub trait MetadataFetcher
where
    Self: Clone + Send + Sync + 'static,
{
    async fn fetch(&self, uri: &str) -> Result<serde_json::Value, BoxError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// URI template for item metadata with `{contract}` and `{token_id}` placeholders.
    pub nft_metadata_uri_template: String,
    pub scan_batch_size: u32,
    #[serde(with = "humantime_serde")]
    pub scan_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

/// Stable job id for one NFT item.
fn nft_job_id(contract: &str, token_id: &str) -> String {
    let digest = Sha256::digest(format!("{contract}:{token_id}"));
    const_hex::encode(&digest[..16])
}

/// Periodically scan for NFTs needing work and enqueue jobs; enqueueing is idempotent, so
/// rescanning the same items is harmless.
pub async fn run_queue_scan<S, J>(config: QueueConfig, storage: S, jobs: J) -> anyhow::Result<()>
where
    S: Storage,
    J: JobStore,
{
    let mut ticker = interval(config.scan_interval);

    loop {
        ticker.tick().await;

        for (contract, token_id) in storage.nft_missing_metadata(config.scan_batch_size).await? {
            let uri = config
                .nft_metadata_uri_template
                .replace("{contract}", contract.as_str())
                .replace("{token_id}", &token_id);
            jobs.enqueue(
                NFT_METADATA_QUEUE,
                &nft_job_id(contract.as_str(), &token_id),
                &json!({ "contract": contract, "token_id": token_id, "uri": uri }),
            )
            .await?;
        }

        for (contract, token_id) in storage.nft_in_flight(config.scan_batch_size).await? {
            jobs.enqueue(
                NFT_RECONCILE_QUEUE,
                &nft_job_id(contract.as_str(), &token_id),
                &json!({ "contract": contract, "token_id": token_id }),
            )
            .await?;
        }
    }
}

/// Claim and execute NFT metadata jobs.
pub async fn run_nft_metadata_worker<S, J, F>(
    config: QueueConfig,
    storage: S,
    jobs: J,
    fetcher: F,
) -> anyhow::Result<()>
where
    S: Storage,
    J: JobStore,
    F: MetadataFetcher,
{
    let holder_id = Uuid::new_v4();
    let claim = JobClaim {
        queue: NFT_METADATA_QUEUE.to_string(),
        holder_id,
        lease_ttl: config.lease_ttl,
    };
    let mut backoff = Backoff::default();

    info!(holder_id:%; "nft metadata worker starting");

    loop {
        match jobs.claim_next(&claim).await? {
            Some(job) => {
                match handle_metadata_job(&storage, &fetcher, &job).await {
                    Ok(()) => {
                        jobs.complete(&job, holder_id).await?;
                        backoff.reset();
                    }
                    Err(error) => {
                        warn!(job_id = job.job_id.as_str(), error:% = error; "metadata job failed");
                        jobs.fail(&job, holder_id, config.max_attempts).await?;
                        backoff.sleep().await;
                    }
                }
            }
            None => backoff.sleep().await,
        }
    }
}

async fn handle_metadata_job<S, F>(storage: &S, fetcher: &F, job: &Job) -> Result<(), BoxError>
where
    S: Storage,
    F: MetadataFetcher,
{
    let contract = job
        .payload
        .get("contract")
        .and_then(serde_json::Value::as_str)
        .ok_or("job payload misses contract")?;
    let token_id = job
        .payload
        .get("token_id")
        .and_then(serde_json::Value::as_str)
        .ok_or("job payload misses token_id")?;
    let uri = job
        .payload
        .get("uri")
        .and_then(serde_json::Value::as_str)
        .ok_or("job payload misses uri")?;

    let metadata = fetcher.fetch(uri).await?;
    storage
        .save_nft_metadata(&contract.into(), token_id, Some(uri), &metadata)
        .await?;

    debug!(contract, token_id; "nft metadata fetched");
    Ok(())
}

/// Claim and execute ownership reconciliation jobs.
pub async fn run_reconcile_worker<S, J>(config: QueueConfig, storage: S, jobs: J) -> anyhow::Result<()>
where
    S: Storage,
    J: JobStore,
{
    let holder_id = Uuid::new_v4();
    let claim = JobClaim {
        queue: NFT_RECONCILE_QUEUE.to_string(),
        holder_id,
        lease_ttl: config.lease_ttl,
    };
    let mut backoff = Backoff::default();

    info!(holder_id:%; "ownership reconciler starting");

    loop {
        match jobs.claim_next(&claim).await? {
            Some(job) => {
                let contract = job
                    .payload
                    .get("contract")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();
                let token_id = job
                    .payload
                    .get("token_id")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default();

                match storage.recompute_nft_owner(&contract.into(), token_id).await {
                    Ok(()) => {
                        jobs.complete(&job, holder_id).await?;
                        backoff.reset();
                    }
                    Err(error) => {
                        warn!(job_id = job.job_id.as_str(), error:% = error; "reconcile job failed");
                        jobs.fail(&job, holder_id, config.max_attempts).await?;
                        backoff.sleep().await;
                    }
                }
            }
            None => backoff.sleep().await,
        }
    }
}

/// Samples the token price; HTTP in production, canned in tests.
#[trait_variant::make(Send)]
pub trait PriceSource
where
    Self: Clone + Send + Sync + 'static,
{
    async fn current_price(&self) -> Result<f64, BoxError>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricePollerConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Periodically sample the token price into the store; failures only delay the next sample.
pub async fn run_price_poller<S, P>(
    config: PricePollerConfig,
    storage: S,
    source: P,
) -> anyhow::Result<()>
where
    S: Storage,
    P: PriceSource,
{
    loop {
        match source.current_price().await {
            Ok(price) => {
                storage.save_token_price(price).await?;
                debug!(price; "price sampled");
            }
            Err(error) => warn!(error:% = error; "cannot sample price"),
        }

        sleep(config.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::testing::MemoryCoordinator;
    use indexer_common::domain::Address;
    use serde_json::json;

    #[derive(Clone)]
    struct CannedFetcher;

    impl MetadataFetcher for CannedFetcher {
        async fn fetch(&self, _uri: &str) -> Result<serde_json::Value, BoxError> {
            Ok(json!({ "name": "Item #7" }))
        }
    }

    #[tokio::test]
    async fn test_metadata_job_round_trip() {
        let coordinator = MemoryCoordinator::default();
        let contract = Address::normalize("0x1d7e57aa55817448");
        coordinator
            .state()
            .nft_missing_metadata
            .push((contract.clone(), "7".to_string()));

        let job = Job {
            id: 1,
            queue: NFT_METADATA_QUEUE.to_string(),
            job_id: nft_job_id(contract.as_str(), "7"),
            payload: json!({
                "contract": contract,
                "token_id": "7",
                "uri": "https://metadata.example/1d7e57aa55817448/7"
            }),
            attempts: 0,
        };

        handle_metadata_job(&coordinator, &CannedFetcher, &job)
            .await
            .expect("job succeeds");

        let state = coordinator.state();
        assert!(state.nft_missing_metadata.is_empty());
        assert_eq!(state.nft_metadata.len(), 1);
        assert_eq!(state.nft_metadata[0].1, "7");
    }

    #[test]
    fn test_nft_job_id_is_stable() {
        assert_eq!(nft_job_id("a", "1"), nft_job_id("a", "1"));
        assert_ne!(nft_job_id("a", "1"), nft_job_id("a", "2"));
    }
}

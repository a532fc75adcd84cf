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

use crate::domain::BlockRange;
use indexer_common::domain::Direction;
use std::{
    fmt::{self, Display},
    time::Duration,
};
use thiserror::Error;
use uuid::Uuid;

/// A lease: the assertion by a worker over a block range that it will process that range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: i64,
    pub worker_name: String,
    pub range: BlockRange,
    pub state: LeaseState,
    pub holder_id: Uuid,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Open,
    Held,
    Done,
    Failed,
    Dead,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Open => "open",
            LeaseState::Held => "held",
            LeaseState::Done => "done",
            LeaseState::Failed => "failed",
            LeaseState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(LeaseState::Open),
            "held" => Some(LeaseState::Held),
            "done" => Some(LeaseState::Done),
            "failed" => Some(LeaseState::Failed),
            "dead" => Some(LeaseState::Dead),
            _ => None,
        }
    }
}

impl Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub worker_name: String,
    pub holder_id: Uuid,
    pub direction: Direction,
    /// Blocks per minted lease.
    pub batch_size: u64,
    /// Where the cursor starts when no checkpoint exists yet: the configured start height
    /// (forward) or the window/history anchor (backward).
    pub start: u64,
    /// Inclusive bound of mintable heights: the ceiling for forward workers, the stop
    /// (window floor) for backward ones. `None` means unbounded.
    pub limit: Option<u64>,
    /// Minimum mintable span; derivers require a full chunk, ingesters accept partials so
    /// they can chase the tip.
    pub min_span: u64,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
}

impl ClaimRequest {
    /// Compute the next range to mint, given the worker's checkpoint and the furthest
    /// boundary of already-minted live leases. Returns `None` when there is no work: the
    /// cursor reached its bound, or the remaining span is below `min_span`.
    pub fn mint_range(&self, checkpoint: Option<u64>, minted_edge: Option<u64>) -> Option<BlockRange> {
        match self.direction {
            Direction::Forward => {
                let from = checkpoint.map(|c| c + 1).unwrap_or(self.start);
                let from = minted_edge.map_or(from, |edge| from.max(edge));
                let bound = self.limit?.checked_add(1)?;
                if from >= bound || bound - from < self.min_span {
                    return None;
                }
                Some(BlockRange::new(from, bound.min(from + self.batch_size)))
            }

            Direction::Backward => {
                let frontier = checkpoint.unwrap_or(self.start);
                let frontier = minted_edge.map_or(frontier, |edge| frontier.min(edge));
                let stop = self.limit.unwrap_or(0);
                if frontier <= stop || frontier - stop < self.min_span {
                    return None;
                }
                Some(BlockRange::new(
                    stop.max(frontier.saturating_sub(self.batch_size)),
                    frontier,
                ))
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("lease store operation failed")]
    Store(#[from] sqlx::Error),

    #[error("lease {lease_id} is not held by {holder_id}")]
    HolderMismatch { lease_id: i64, holder_id: Uuid },
}

/// The coordination primitive every ingester and processor consults before doing work.
/// Implemented as transactional updates on the leases table of the Persistent Store; when
/// multiple claimants race, exactly one held transition wins and losers observe `None`.
#[trait_variant::make(Send)]
pub trait LeaseStore
where
    Self: Clone + Send + Sync + 'static,
{
    /// Claim the next open lease for the worker, or mint a new one past the worker's
    /// checkpoint. `None` means no work is currently claimable.
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Lease>, LeaseError>;

    /// Extend the expiry of a held lease; fails on holder mismatch.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError>;

    /// Transition held → done and advance the worker's checkpoint in the same transaction.
    async fn complete(&self, lease: &Lease, direction: Direction) -> Result<(), LeaseError>;

    /// Increment the attempt count; the lease returns to open, or to dead once the attempt
    /// threshold is reached. Returns the resulting state.
    async fn fail(&self, lease: &Lease, max_attempts: u32) -> Result<LeaseState, LeaseError>;

    /// Return every held lease whose expiry passed back to open, preserving attempt counts.
    /// Idempotent; returns the number of reclaimed leases.
    async fn reclaim_expired(&self) -> Result<u64, LeaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(direction: Direction, start: u64, limit: Option<u64>, min_span: u64) -> ClaimRequest {
        ClaimRequest {
            worker_name: "test".to_string(),
            holder_id: Uuid::new_v4(),
            direction,
            batch_size: 10,
            start,
            limit,
            min_span,
            lease_ttl: Duration::from_secs(60),
            max_attempts: 20,
        }
    }

    #[test]
    fn test_mint_forward() {
        let request = request(Direction::Forward, 0, Some(110), 1);

        // Fresh worker starts at the configured start.
        assert_eq!(request.mint_range(None, None), Some(BlockRange::new(0, 10)));

        // Past a checkpoint of 100 with tip 110: the next full chunk.
        assert_eq!(
            request.mint_range(Some(100), None),
            Some(BlockRange::new(101, 111))
        );

        // Caught up: checkpoint at the tip.
        assert_eq!(request.mint_range(Some(110), None), None);

        // Partial chunk while chasing the tip.
        let near_tip = request.mint_range(Some(105), None).unwrap();
        assert_eq!(near_tip, BlockRange::new(106, 111));
    }

    #[test]
    fn test_mint_forward_full_chunk_only() {
        let request = request(Direction::Forward, 500, Some(600), 100);

        // Exactly one full chunk fits below the dependency checkpoint.
        assert_eq!(
            request.mint_range(None, None),
            Some(BlockRange::new(500, 600))
        );

        // The next chunk does not fit until the dependency advances.
        assert_eq!(request.mint_range(Some(599), None), None);
    }

    #[test]
    fn test_mint_backward_window() {
        let request = request(Direction::Backward, 12_020_337, Some(7_601_063), 1);

        // First claim walks down from the window start.
        assert_eq!(
            request.mint_range(None, None),
            Some(BlockRange::new(12_020_327, 12_020_337))
        );

        // Frontier reached the stop: no more work.
        assert_eq!(request.mint_range(Some(7_601_063), None), None);

        // The tail is clamped to the stop.
        assert_eq!(
            request.mint_range(Some(7_601_066), None),
            Some(BlockRange::new(7_601_063, 7_601_066))
        );
    }

    #[test]
    fn test_mint_skips_live_leases() {
        let forward = request(Direction::Forward, 0, Some(1_000), 1);
        assert_eq!(
            forward.mint_range(Some(100), Some(121)),
            Some(BlockRange::new(121, 131)),
            "minting continues past held ranges"
        );

        let backward = request(Direction::Backward, 1_000, Some(0), 1);
        assert_eq!(
            backward.mint_range(Some(900), Some(880)),
            Some(BlockRange::new(870, 880))
        );
    }
}

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
    Block, BlockRange, Event, Transaction, processor::DerivedOutput, token::TokenTransfer,
};
use indexer_common::domain::{Address, Direction, NewIndexingError};

/// The raw rows of one ingested range, written in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct RawBatch {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
}

/// A checkpoint advance bundled with a derived write. Forward checkpoints only move up,
/// backward frontiers only move down, so re-applying an update is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointUpdate {
    pub worker_name: String,
    pub direction: Direction,
    pub height: u64,
}

impl CheckpointUpdate {
    /// The checkpoint a worker reaches by completing `range`: its highest height going
    /// forward, its lowest going backward.
    pub fn for_range(worker_name: impl Into<String>, direction: Direction, range: BlockRange) -> Self {
        let height = match direction {
            Direction::Forward => range.max_height(),
            Direction::Backward => range.from,
        };

        Self {
            worker_name: worker_name.into(),
            direction,
            height,
        }
    }
}

/// Persistent Store gateway. All writes are idempotent under the same input; every
/// ledger-advancing write is atomic with its checkpoint update, so a derived row for a
/// height exists only if the raw rows for that height are durably written.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Create range partitions covering the given heights if missing. Declarative and
    /// idempotent.
    async fn ensure_partitions(&self, range: BlockRange) -> Result<(), sqlx::Error>;

    /// Write the raw rows of a range and advance the worker's checkpoint (its frontier for
    /// backward workers), all in one transaction. Idempotent on primary keys.
    async fn save_batch(
        &self,
        batch: &RawBatch,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error>;

    async fn get_transactions_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<Transaction>, sqlx::Error>;

    async fn get_events_in_range(&self, range: BlockRange) -> Result<Vec<Event>, sqlx::Error>;

    async fn get_token_transfers_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<TokenTransfer>, sqlx::Error>;

    async fn checkpoint_of(&self, worker_name: &str) -> Result<Option<u64>, sqlx::Error>;

    /// Unconditionally record a height under a worker name; used for the observed chain
    /// tip, which moves independently of any lease.
    async fn record_height(&self, worker_name: &str, height: u64) -> Result<(), sqlx::Error>;

    /// Append an entry to the error ledger.
    async fn log_indexing_error(&self, error: &NewIndexingError) -> Result<(), sqlx::Error>;

    /// Upsert the derived rows of one range together with the processor's checkpoint, in a
    /// single transaction.
    async fn save_derived(
        &self,
        range: BlockRange,
        output: &DerivedOutput,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error>;

    /// The lowest height `h` such that `[h, anchor)` is contiguously covered by completed
    /// history leases; `anchor` when nothing below it is covered. Bounds backward
    /// derivation so derived rows never outrun raw ones.
    async fn history_covered_floor(&self, anchor: u64) -> Result<u64, sqlx::Error>;

    /// NFTs whose metadata has not been fetched yet.
    async fn nft_missing_metadata(&self, limit: u32) -> Result<Vec<(Address, String)>, sqlx::Error>;

    /// NFTs whose owner is currently unknown (withdrawn without a matching deposit).
    async fn nft_in_flight(&self, limit: u32) -> Result<Vec<(Address, String)>, sqlx::Error>;

    async fn save_nft_metadata(
        &self,
        contract: &Address,
        token_id: &str,
        uri: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<(), sqlx::Error>;

    /// Recompute an item's owner from its full transfer history and repair the ownership
    /// row if it drifted.
    async fn recompute_nft_owner(&self, contract: &Address, token_id: &str)
    -> Result<(), sqlx::Error>;

    /// Record a price sample backing the status price history.
    async fn save_token_price(&self, price: f64) -> Result<(), sqlx::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_for_range() {
        let range = BlockRange::new(100, 110);

        let forward = CheckpointUpdate::for_range("w", Direction::Forward, range);
        assert_eq!(forward.height, 109);

        let backward = CheckpointUpdate::for_range("w", Direction::Backward, range);
        assert_eq!(backward.height, 100);
    }
}

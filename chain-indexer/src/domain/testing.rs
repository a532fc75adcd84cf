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

//! In-memory reference implementation of the store and the lease manager, mirroring the
//! Postgres semantics for tests: the same state holds results and the work queue.

use crate::domain::{
    Block, BlockData, BlockRange, Event, Transaction,
    lease::{ClaimRequest, Lease, LeaseError, LeaseState, LeaseStore},
    node::{Node, NodeError},
    processor::DerivedOutput,
    storage::{CheckpointUpdate, RawBatch, Storage},
    token::TokenTransfer,
};
use indexer_common::domain::{
    Address, BlockHash, Direction, HISTORY_PREFIX, NewIndexingError, covered_floor,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use uuid::Uuid;

#[derive(Debug)]
pub struct MemoryLease {
    pub id: i64,
    pub worker_name: String,
    pub range: BlockRange,
    pub state: LeaseState,
    pub holder_id: Option<Uuid>,
    pub attempts: u32,
    pub expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct MemoryState {
    pub blocks: BTreeMap<u64, Block>,
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
    pub checkpoints: BTreeMap<String, u64>,
    pub errors: Vec<NewIndexingError>,
    pub leases: Vec<MemoryLease>,
    pub derived: Vec<(String, BlockRange, DerivedOutput)>,
    pub nft_missing_metadata: Vec<(Address, String)>,
    pub nft_in_flight: Vec<(Address, String)>,
    pub nft_metadata: Vec<(Address, String, Option<String>, serde_json::Value)>,
    pub token_prices: Vec<f64>,
    next_lease_id: i64,
}

impl MemoryState {
    fn apply_checkpoint(&mut self, update: &CheckpointUpdate) {
        let entry = self
            .checkpoints
            .entry(update.worker_name.clone())
            .or_insert(update.height);
        *entry = match update.direction {
            Direction::Forward => (*entry).max(update.height),
            Direction::Backward => (*entry).min(update.height),
        };
    }
}

/// Both [Storage] and [LeaseStore] over one shared in-memory state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator(Arc<Mutex<MemoryState>>);

impl MemoryCoordinator {
    pub fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.0.lock().expect("state lock is not poisoned")
    }

    pub fn set_checkpoint(&self, worker_name: &str, height: u64) {
        self.state().checkpoints.insert(worker_name.to_string(), height);
    }

    pub fn checkpoint(&self, worker_name: &str) -> Option<u64> {
        self.state().checkpoints.get(worker_name).copied()
    }

    /// Force every held lease past its expiry, as if its holder crashed.
    pub fn expire_held_leases(&self) {
        let mut state = self.state();
        for lease in &mut state.leases {
            if lease.state == LeaseState::Held {
                lease.expires_at = Some(Instant::now() - Duration::from_secs(1));
            }
        }
    }

    pub fn lease_states(&self, worker_name: &str) -> Vec<(BlockRange, LeaseState)> {
        self.state()
            .leases
            .iter()
            .filter(|lease| lease.worker_name == worker_name)
            .map(|lease| (lease.range, lease.state))
            .collect()
    }
}

impl Storage for MemoryCoordinator {
    async fn ensure_partitions(&self, _range: BlockRange) -> Result<(), sqlx::Error> {
        Ok(())
    }

    async fn save_batch(
        &self,
        batch: &RawBatch,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state();

        for block in &batch.blocks {
            state.blocks.insert(block.height, block.clone());
        }
        for transaction in &batch.transactions {
            let exists = state
                .transactions
                .iter()
                .any(|t| t.id == transaction.id && t.block_height == transaction.block_height);
            if !exists {
                state.transactions.push(transaction.clone());
            }
        }
        for event in &batch.events {
            let exists = state.events.iter().any(|e| {
                e.transaction_id == event.transaction_id && e.event_index == event.event_index
            });
            if !exists {
                state.events.push(event.clone());
            }
        }

        state.apply_checkpoint(checkpoint);
        Ok(())
    }

    async fn get_transactions_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        Ok(self
            .state()
            .transactions
            .iter()
            .filter(|t| t.block_height >= range.from && t.block_height < range.to)
            .cloned()
            .collect())
    }

    async fn get_events_in_range(&self, range: BlockRange) -> Result<Vec<Event>, sqlx::Error> {
        Ok(self
            .state()
            .events
            .iter()
            .filter(|e| e.block_height >= range.from && e.block_height < range.to)
            .cloned()
            .collect())
    }

    async fn get_token_transfers_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<TokenTransfer>, sqlx::Error> {
        let transfers = self
            .state()
            .derived
            .iter()
            .filter_map(|(_, _, output)| match output {
                DerivedOutput::TokenTransfers(transfers) => Some(transfers.clone()),
                _ => None,
            })
            .flatten()
            .filter(|t| t.block_height >= range.from && t.block_height < range.to)
            .collect();
        Ok(transfers)
    }

    async fn checkpoint_of(&self, worker_name: &str) -> Result<Option<u64>, sqlx::Error> {
        Ok(self.checkpoint(worker_name))
    }

    async fn record_height(&self, worker_name: &str, height: u64) -> Result<(), sqlx::Error> {
        self.state().checkpoints.insert(worker_name.to_string(), height);
        Ok(())
    }

    async fn log_indexing_error(&self, error: &NewIndexingError) -> Result<(), sqlx::Error> {
        self.state().errors.push(error.clone());
        Ok(())
    }

    async fn save_derived(
        &self,
        range: BlockRange,
        output: &DerivedOutput,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state();

        // Re-running a range replaces its prior output, as the Postgres upserts do.
        state
            .derived
            .retain(|(worker, r, _)| !(worker == &checkpoint.worker_name && *r == range));
        state
            .derived
            .push((checkpoint.worker_name.clone(), range, output.clone()));

        state.apply_checkpoint(checkpoint);
        Ok(())
    }

    async fn history_covered_floor(&self, anchor: u64) -> Result<u64, sqlx::Error> {
        let ranges = self
            .state()
            .leases
            .iter()
            .filter(|lease| {
                lease.state == LeaseState::Done && lease.worker_name.starts_with(HISTORY_PREFIX)
            })
            .map(|lease| (lease.range.from, lease.range.to))
            .collect();
        Ok(covered_floor(ranges, anchor))
    }

    async fn nft_missing_metadata(
        &self,
        limit: u32,
    ) -> Result<Vec<(Address, String)>, sqlx::Error> {
        let mut missing = self.state().nft_missing_metadata.clone();
        missing.truncate(limit as usize);
        Ok(missing)
    }

    async fn nft_in_flight(&self, limit: u32) -> Result<Vec<(Address, String)>, sqlx::Error> {
        let mut in_flight = self.state().nft_in_flight.clone();
        in_flight.truncate(limit as usize);
        Ok(in_flight)
    }

    async fn save_nft_metadata(
        &self,
        contract: &Address,
        token_id: &str,
        uri: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let mut state = self.state();
        state
            .nft_missing_metadata
            .retain(|(c, t)| !(c == contract && t == token_id));
        state.nft_metadata.push((
            contract.clone(),
            token_id.to_string(),
            uri.map(ToString::to_string),
            metadata.clone(),
        ));
        Ok(())
    }

    async fn recompute_nft_owner(
        &self,
        contract: &Address,
        token_id: &str,
    ) -> Result<(), sqlx::Error> {
        self.state()
            .nft_in_flight
            .retain(|(c, t)| !(c == contract && t == token_id));
        Ok(())
    }

    async fn save_token_price(&self, price: f64) -> Result<(), sqlx::Error> {
        self.state().token_prices.push(price);
        Ok(())
    }
}

impl LeaseStore for MemoryCoordinator {
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Lease>, LeaseError> {
        let mut state = self.state();

        // Prefer an existing open lease.
        let open = state
            .leases
            .iter_mut()
            .filter(|lease| {
                lease.worker_name == request.worker_name && lease.state == LeaseState::Open
            })
            .min_by_key(|lease| match request.direction {
                Direction::Forward => lease.range.from as i64,
                Direction::Backward => -(lease.range.from as i64),
            });

        if let Some(lease) = open {
            lease.state = LeaseState::Held;
            lease.holder_id = Some(request.holder_id);
            lease.expires_at = Some(Instant::now() + request.lease_ttl);
            return Ok(Some(Lease {
                id: lease.id,
                worker_name: lease.worker_name.clone(),
                range: lease.range,
                state: lease.state,
                holder_id: request.holder_id,
                attempts: lease.attempts,
            }));
        }

        // Otherwise mint one past the checkpoint and the furthest minted boundary.
        let checkpoint = state.checkpoints.get(&request.worker_name).copied();
        let minted_edge = state
            .leases
            .iter()
            .filter(|lease| lease.worker_name == request.worker_name)
            .map(|lease| match request.direction {
                Direction::Forward => lease.range.to,
                Direction::Backward => lease.range.from,
            })
            .reduce(|a, b| match request.direction {
                Direction::Forward => a.max(b),
                Direction::Backward => a.min(b),
            });

        let Some(range) = request.mint_range(checkpoint, minted_edge) else {
            return Ok(None);
        };

        state.next_lease_id += 1;
        let id = state.next_lease_id;
        state.leases.push(MemoryLease {
            id,
            worker_name: request.worker_name.clone(),
            range,
            state: LeaseState::Held,
            holder_id: Some(request.holder_id),
            attempts: 0,
            expires_at: Some(Instant::now() + request.lease_ttl),
        });

        Ok(Some(Lease {
            id,
            worker_name: request.worker_name.clone(),
            range,
            state: LeaseState::Held,
            holder_id: request.holder_id,
            attempts: 0,
        }))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<(), LeaseError> {
        let mut state = self.state();
        let stored = state
            .leases
            .iter_mut()
            .find(|l| l.id == lease.id && l.holder_id == Some(lease.holder_id))
            .ok_or(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            })?;
        stored.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn complete(&self, lease: &Lease, direction: Direction) -> Result<(), LeaseError> {
        let mut state = self.state();
        let stored = state
            .leases
            .iter_mut()
            .find(|l| {
                l.id == lease.id
                    && l.holder_id == Some(lease.holder_id)
                    && l.state == LeaseState::Held
            })
            .ok_or(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            })?;
        stored.state = LeaseState::Done;

        let update = CheckpointUpdate::for_range(lease.worker_name.clone(), direction, lease.range);
        state.apply_checkpoint(&update);
        Ok(())
    }

    async fn fail(&self, lease: &Lease, max_attempts: u32) -> Result<LeaseState, LeaseError> {
        let mut state = self.state();
        let stored = state
            .leases
            .iter_mut()
            .find(|l| {
                l.id == lease.id
                    && l.holder_id == Some(lease.holder_id)
                    && l.state == LeaseState::Held
            })
            .ok_or(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            })?;

        stored.attempts += 1;
        stored.state = if stored.attempts >= max_attempts {
            LeaseState::Dead
        } else {
            LeaseState::Open
        };
        stored.holder_id = None;
        Ok(stored.state)
    }

    async fn reclaim_expired(&self) -> Result<u64, LeaseError> {
        let now = Instant::now();
        let mut reclaimed = 0;

        let mut state = self.state();
        for lease in &mut state.leases {
            if lease.state == LeaseState::Held
                && lease.expires_at.is_some_and(|expires| expires < now)
            {
                lease.state = LeaseState::Open;
                lease.holder_id = None;
                lease.expires_at = None;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }
}

fn hash_for(height: u64) -> BlockHash {
    let mut bytes = [0; 32];
    bytes[..8].copy_from_slice(&height.to_be_bytes());
    BlockHash::from(bytes)
}

/// A sealed block with no transactions, identified by its height.
pub fn empty_block_data(height: u64) -> BlockData {
    BlockData {
        block: Block {
            height,
            id: hash_for(height),
            parent_id: hash_for(height.wrapping_sub(1)),
            timestamp: height * 1_000,
            collection_count: 0,
            tx_count: 0,
            event_count: 0,
        },
        transactions: Vec::new(),
        events: Vec::new(),
    }
}

#[derive(Debug, Default)]
pub struct MockNodeState {
    pub latest: u64,
    pub blocks: BTreeMap<u64, BlockData>,
    pub failing: BTreeSet<u64>,
}

/// A Block Source over a fixed set of blocks; heights in `failing` return a retryable
/// error, missing heights a nil block.
#[derive(Debug, Clone, Default)]
pub struct MockNode(Arc<Mutex<MockNodeState>>);

impl MockNode {
    pub fn with_empty_blocks(heights: impl IntoIterator<Item = u64>) -> Self {
        let node = Self::default();
        {
            let mut state = node.state();
            for height in heights {
                state.latest = state.latest.max(height);
                state.blocks.insert(height, empty_block_data(height));
            }
        }
        node
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, MockNodeState> {
        self.0.lock().expect("state lock is not poisoned")
    }
}

impl Node for MockNode {
    async fn fetch_block_data(&self, height: u64) -> Result<BlockData, NodeError> {
        let state = self.state();

        if state.failing.contains(&height) {
            return Err(NodeError::Http("connection reset".into()));
        }

        state
            .blocks
            .get(&height)
            .cloned()
            .ok_or(NodeError::NilBlock(height))
    }

    async fn latest_height(&self) -> Result<u64, NodeError> {
        Ok(self.state().latest)
    }
}

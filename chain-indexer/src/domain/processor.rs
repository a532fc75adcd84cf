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

use crate::domain::{BlockRange, Event, Transaction, token::TokenTransfer};
use indexer_common::domain::{Address, NewIndexingError, TransactionHash};

/// Which raw inputs a processor reads for a range. The deriver only loads what is needed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Inputs {
    pub transactions: bool,
    pub events: bool,
    pub token_transfers: bool,
}

impl Inputs {
    pub const TRANSACTIONS: Inputs = Inputs {
        transactions: true,
        events: false,
        token_transfers: false,
    };
    pub const EVENTS: Inputs = Inputs {
        transactions: false,
        events: true,
        token_transfers: false,
    };
    pub const TRANSACTIONS_AND_EVENTS: Inputs = Inputs {
        transactions: true,
        events: true,
        token_transfers: false,
    };
    pub const TOKEN_TRANSFERS: Inputs = Inputs {
        transactions: false,
        events: false,
        token_transfers: true,
    };
}

/// The raw rows of one range, loaded according to [Inputs].
#[derive(Debug, Clone, Default)]
pub struct RangeInput {
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
    pub token_transfers: Vec<TokenTransfer>,
}

/// One derived EVM transaction, extracted from an `EVM.TransactionExecuted` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmTransaction {
    pub transaction_id: TransactionHash,
    pub event_index: u32,
    pub evm_hash: String,
    pub from: Address,
    pub to: Address,
    pub value: String,
    pub gas_used: u64,
    pub block_height: u64,
}

/// A contract deployment or update observed on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    pub address: Address,
    pub name: String,
    pub source: Option<String>,
    pub deployed_at_height: u64,
}

/// The mapping between a transaction and a contract its events touched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionContract {
    pub transaction_id: TransactionHash,
    pub contract_address: Address,
    pub contract_name: String,
    pub block_height: u64,
}

/// Per-range activity of one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTouch {
    pub address: Address,
    pub first_seen_height: u64,
    pub last_seen_height: u64,
    pub tx_count: u64,
}

/// Aggregate counters of one range, keyed by its start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxMetricsRow {
    pub range_start: u64,
    pub range_end: u64,
    pub tx_count: u64,
    pub event_count: u64,
    pub failed_count: u64,
    pub gas_total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakingEvent {
    pub transaction_id: TransactionHash,
    pub event_index: u32,
    pub event_type: String,
    pub node_id: Option<String>,
    pub delegator_id: Option<String>,
    pub amount: Option<String>,
    pub block_height: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefiEvent {
    pub transaction_id: TransactionHash,
    pub event_index: u32,
    pub protocol: Address,
    pub kind: String,
    pub details: serde_json::Value,
    pub block_height: u64,
}

/// A signed balance change of one (address, token) pair; applied with a version guard so
/// re-runs are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldingDelta {
    pub address: Address,
    pub contract: Address,
    /// Decimal string; negative for outflows.
    pub delta: String,
    pub version: u64,
}

/// The owner of an NFT after the last transfer within a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    pub contract: Address,
    pub token_id: String,
    pub owner: Address,
    pub version: u64,
}

/// One day's signed flow of one (address, token) pair; the store folds these into per-day
/// net-change rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyFlow {
    pub address: Address,
    pub contract: Address,
    /// Decimal string; negative for outflows.
    pub delta: String,
    /// Unix epoch millis of the transfer; the store derives the calendar day.
    pub timestamp: u64,
    pub version: u64,
}

/// The rows a processor derived for one range. Each variant maps onto one derived table;
/// the store writes a variant and the processor's checkpoint in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedOutput {
    TokenTransfers(Vec<TokenTransfer>),
    EvmTransactions(Vec<EvmTransaction>),
    Contracts {
        contracts: Vec<Contract>,
        transaction_contracts: Vec<TransactionContract>,
    },
    AccountTouches(Vec<AccountTouch>),
    TxMetrics(TxMetricsRow),
    StakingEvents(Vec<StakingEvent>),
    DefiEvents(Vec<DefiEvent>),
    FtHoldings(Vec<HoldingDelta>),
    NftOwnership(Vec<OwnershipChange>),
    DailyBalances(Vec<DailyFlow>),
}

/// What a processor produced for a range: the derived rows plus any per-event decode
/// failures, which are logged to the error ledger without blocking the range.
#[derive(Debug, Clone)]
pub struct Derived {
    pub output: DerivedOutput,
    pub errors: Vec<NewIndexingError>,
}

/// A derivation stage: reads raw rows of a range and produces one derived table.
///
/// Derivation must be pure and deterministic: the same input range always yields the same
/// rows, so re-running a range is a no-op on outputs. Phase-2 processors declare the
/// phase-1 processors they depend on; the deriver never claims past a dependency's
/// checkpoint.
pub trait Processor
where
    Self: Send + Sync + 'static,
{
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    fn inputs(&self) -> Inputs;

    fn derive(&self, range: BlockRange, input: &RangeInput) -> Derived;
}

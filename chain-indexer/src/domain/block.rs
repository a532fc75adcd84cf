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

use indexer_common::domain::{Address, BlockHash, TransactionHash};
use std::fmt::{self, Display};

/// A sealed block as written to the raw store. Raw rows are written once per height and then
/// immutable; the chain source is finalized, so there is no reorg handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub height: u64,
    pub id: BlockHash,
    pub parent_id: BlockHash,
    /// Unix epoch millis.
    pub timestamp: u64,
    pub collection_count: u32,
    pub tx_count: u32,
    pub event_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Sealed,
    Expired,
    Pending,
    Error,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Sealed => "SEALED",
            TransactionStatus::Expired => "EXPIRED",
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SEALED" => Some(TransactionStatus::Sealed),
            "EXPIRED" => Some(TransactionStatus::Expired),
            "PENDING" => Some(TransactionStatus::Pending),
            "ERROR" => Some(TransactionStatus::Error),
            _ => None,
        }
    }
}

impl Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: TransactionHash,
    pub block_height: u64,
    pub tx_index: u32,
    pub payer: Address,
    pub proposer: Address,
    pub authorizers: Vec<Address>,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub gas_used: u64,
    pub fee: Option<String>,
    /// Unix epoch millis of the containing block.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub transaction_id: TransactionHash,
    pub event_index: u32,
    pub block_height: u64,
    /// Fully qualified type, e.g. `A.7e60df042a9c0868.FlowToken.TokensWithdrawn`.
    pub event_type: String,
    /// Canonical JSON-Cadence payload.
    pub payload: serde_json::Value,
    /// Derived from the type string when not carried explicitly.
    pub contract_address: Address,
    pub timestamp: u64,
}

impl Event {
    /// The contract address part of a fully qualified event type, e.g. `7e60df042a9c0868`
    /// for `A.7e60df042a9c0868.FlowToken.TokensWithdrawn`. System events (`flow.*`) have no
    /// address part.
    pub fn contract_address_of(event_type: &str) -> Address {
        let mut parts = event_type.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("A"), Some(address), Some(_)) => Address::normalize(address),
            _ => Address::default(),
        }
    }

    /// The contract name part of a fully qualified event type, e.g. `FlowToken`.
    pub fn contract_name_of(event_type: &str) -> Option<&str> {
        let mut parts = event_type.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("A"), Some(_), Some(name)) => Some(name),
            _ => None,
        }
    }
}

/// Everything the Block Source returns for one height.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
}

/// A half-open block range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// Highest height inside the range.
    pub fn max_height(&self) -> u64 {
        self.to - 1
    }

    pub fn heights(&self) -> impl Iterator<Item = u64> + use<> {
        self.from..self.to
    }
}

impl Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_address_of() {
        assert_eq!(
            Event::contract_address_of("A.7e60df042a9c0868.FlowToken.TokensWithdrawn").as_str(),
            "7e60df042a9c0868"
        );
        assert!(Event::contract_address_of("flow.AccountCreated").is_empty());
    }

    #[test]
    fn test_contract_name_of() {
        assert_eq!(
            Event::contract_name_of("A.7e60df042a9c0868.FlowToken.TokensWithdrawn"),
            Some("FlowToken")
        );
        assert_eq!(Event::contract_name_of("flow.AccountCreated"), None);
    }

    #[test]
    fn test_block_range() {
        let range = BlockRange::new(100, 110);
        assert_eq!(range.len(), 10);
        assert_eq!(range.max_height(), 109);
        assert_eq!(range.heights().count(), 10);
    }
}

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
    BlockRange,
    processor::{Derived, DerivedOutput, Inputs, OwnershipChange, Processor, RangeInput},
};
use indexer_common::domain::Address;
use std::collections::BTreeMap;

/// Replays the range's NFT transfers in order and emits the resulting owner per item. A
/// trailing withdrawal leaves the owner empty (in flight) until a later deposit lands.
#[derive(Debug, Clone, Copy, Default)]
pub struct NftOwnershipProcessor;

impl Processor for NftOwnershipProcessor {
    fn name(&self) -> &'static str {
        "nft_ownership"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["token"]
    }

    fn inputs(&self) -> Inputs {
        Inputs::TOKEN_TRANSFERS
    }

    fn derive(&self, range: BlockRange, input: &RangeInput) -> Derived {
        let version = range.max_height();

        let mut transfers = input
            .token_transfers
            .iter()
            .filter(|transfer| transfer.is_nft && transfer.token_id.is_some())
            .collect::<Vec<_>>();
        transfers.sort_by_key(|transfer| {
            (
                transfer.block_height,
                transfer.transaction_id,
                transfer.event_index,
            )
        });

        let mut owners: BTreeMap<(Address, String), Address> = BTreeMap::new();
        for transfer in transfers {
            let Some(token_id) = transfer.token_id.clone() else {
                continue;
            };
            let key = (transfer.contract.clone(), token_id);

            let owner = if !transfer.to.is_empty() {
                transfer.to.clone()
            } else {
                Address::default()
            };
            owners.insert(key, owner);
        }

        let changes = owners
            .into_iter()
            .map(|((contract, token_id), owner)| OwnershipChange {
                contract,
                token_id,
                owner,
                version,
            })
            .collect();

        Derived {
            output: DerivedOutput::NftOwnership(changes),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::TokenTransfer;
    use indexer_common::domain::TransactionHash;

    fn transfer(height: u64, index: u32, token_id: &str, from: &str, to: &str) -> TokenTransfer {
        TokenTransfer {
            transaction_id: TransactionHash::default(),
            event_index: index,
            contract: Address::normalize("0x1d7e57aa55817448"),
            from: Address::normalize(from),
            to: Address::normalize(to),
            amount: "1".to_string(),
            token_id: Some(token_id.to_string()),
            is_nft: true,
            block_height: height,
            timestamp: 0,
        }
    }

    #[test]
    fn test_last_transfer_wins() {
        let input = RangeInput {
            token_transfers: vec![
                transfer(101, 0, "7", "0x1", ""),
                transfer(101, 1, "7", "", "0x2"),
                transfer(105, 0, "7", "0x2", ""),
                transfer(105, 1, "7", "", "0x3"),
            ],
            ..Default::default()
        };

        let derived = NftOwnershipProcessor.derive(BlockRange::new(100, 110), &input);
        let DerivedOutput::NftOwnership(changes) = derived.output else {
            panic!("wrong output variant");
        };

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].owner, Address::normalize("0x3"));
        assert_eq!(changes[0].version, 109);
    }

    #[test]
    fn test_trailing_withdrawal_leaves_item_in_flight() {
        let input = RangeInput {
            token_transfers: vec![transfer(101, 0, "9", "0x1", "")],
            ..Default::default()
        };

        let derived = NftOwnershipProcessor.derive(BlockRange::new(100, 110), &input);
        let DerivedOutput::NftOwnership(changes) = derived.output else {
            panic!("wrong output variant");
        };

        assert_eq!(changes.len(), 1);
        assert!(changes[0].owner.is_empty());
    }
}

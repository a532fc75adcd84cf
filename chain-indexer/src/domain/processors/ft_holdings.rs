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
    processor::{Derived, DerivedOutput, HoldingDelta, Inputs, Processor, RangeInput},
};

/// Turns the range's fungible transfers into signed balance deltas per (address, token).
/// The store sums and applies them under a version guard, so re-running a range leaves
/// balances untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct FtHoldingsProcessor;

impl Processor for FtHoldingsProcessor {
    fn name(&self) -> &'static str {
        "ft_holdings"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["token"]
    }

    fn inputs(&self) -> Inputs {
        Inputs::TOKEN_TRANSFERS
    }

    fn derive(&self, range: BlockRange, input: &RangeInput) -> Derived {
        let version = range.max_height();
        let mut deltas = Vec::new();

        for transfer in input.token_transfers.iter().filter(|t| !t.is_nft) {
            if !transfer.from.is_empty() {
                deltas.push(HoldingDelta {
                    address: transfer.from.clone(),
                    contract: transfer.contract.clone(),
                    delta: format!("-{}", transfer.amount),
                    version,
                });
            }

            if !transfer.to.is_empty() {
                deltas.push(HoldingDelta {
                    address: transfer.to.clone(),
                    contract: transfer.contract.clone(),
                    delta: transfer.amount.clone(),
                    version,
                });
            }
        }

        Derived {
            output: DerivedOutput::FtHoldings(deltas),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::TokenTransfer;
    use indexer_common::domain::Address;

    fn transfer(from: &str, to: &str, amount: &str, is_nft: bool) -> TokenTransfer {
        TokenTransfer {
            transaction_id: Default::default(),
            event_index: 0,
            contract: Address::normalize("0x7e60df042a9c0868"),
            from: Address::normalize(from),
            to: Address::normalize(to),
            amount: amount.to_string(),
            token_id: None,
            is_nft,
            block_height: 100,
            timestamp: 0,
        }
    }

    #[test]
    fn test_deltas_signed_and_versioned() {
        let input = RangeInput {
            token_transfers: vec![
                transfer("0x1", "", "2.5", false),
                transfer("", "0x2", "2.5", false),
                transfer("0x1", "", "1", true), // NFTs are not holdings
            ],
            ..Default::default()
        };

        let derived = FtHoldingsProcessor.derive(BlockRange::new(100, 110), &input);
        let DerivedOutput::FtHoldings(deltas) = derived.output else {
            panic!("wrong output variant");
        };

        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[0].delta, "-2.5");
        assert_eq!(deltas[1].delta, "2.5");
        assert!(deltas.iter().all(|d| d.version == 109));
    }
}

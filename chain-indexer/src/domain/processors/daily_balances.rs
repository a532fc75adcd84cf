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
    processor::{DailyFlow, Derived, DerivedOutput, Inputs, Processor, RangeInput},
};

/// Emits the signed daily flow per (address, token) from the range's fungible transfers;
/// the store folds them into per-day net-change rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct DailyBalancesProcessor;

impl Processor for DailyBalancesProcessor {
    fn name(&self) -> &'static str {
        "daily_balances"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["token"]
    }

    fn inputs(&self) -> Inputs {
        Inputs::TOKEN_TRANSFERS
    }

    fn derive(&self, range: BlockRange, input: &RangeInput) -> Derived {
        let version = range.max_height();
        let mut flows = Vec::new();

        for transfer in input.token_transfers.iter().filter(|t| !t.is_nft) {
            if !transfer.from.is_empty() {
                flows.push(DailyFlow {
                    address: transfer.from.clone(),
                    contract: transfer.contract.clone(),
                    delta: format!("-{}", transfer.amount),
                    timestamp: transfer.timestamp,
                    version,
                });
            }

            if !transfer.to.is_empty() {
                flows.push(DailyFlow {
                    address: transfer.to.clone(),
                    contract: transfer.contract.clone(),
                    delta: transfer.amount.clone(),
                    timestamp: transfer.timestamp,
                    version,
                });
            }
        }

        Derived {
            output: DerivedOutput::DailyBalances(flows),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::token::TokenTransfer;
    use indexer_common::domain::Address;

    #[test]
    fn test_flows_carry_timestamps() {
        let transfer = TokenTransfer {
            transaction_id: Default::default(),
            event_index: 0,
            contract: Address::normalize("0x7e60df042a9c0868"),
            from: Address::normalize("0x1"),
            to: Address::default(),
            amount: "4.2".to_string(),
            token_id: None,
            is_nft: false,
            block_height: 100,
            timestamp: 1_700_000_000_000,
        };

        let derived = DailyBalancesProcessor.derive(
            BlockRange::new(100, 110),
            &RangeInput {
                token_transfers: vec![transfer],
                ..Default::default()
            },
        );

        let DerivedOutput::DailyBalances(flows) = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].delta, "-4.2");
        assert_eq!(flows[0].timestamp, 1_700_000_000_000);
    }
}

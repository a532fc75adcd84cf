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
    processor::{AccountTouch, Derived, DerivedOutput, Inputs, Processor, RangeInput},
};
use indexer_common::domain::Address;
use std::collections::{BTreeMap, BTreeSet};

/// Tracks which addresses a range's transactions touched: payer, proposer and authorizers,
/// each counted once per transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountsProcessor;

impl Processor for AccountsProcessor {
    fn name(&self) -> &'static str {
        "accounts"
    }

    fn inputs(&self) -> Inputs {
        Inputs::TRANSACTIONS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let mut touches: BTreeMap<Address, AccountTouch> = BTreeMap::new();

        for transaction in &input.transactions {
            let addresses = [&transaction.payer, &transaction.proposer]
                .into_iter()
                .chain(transaction.authorizers.iter())
                .filter(|address| !address.is_empty())
                .collect::<BTreeSet<_>>();

            for address in addresses {
                touches
                    .entry(address.clone())
                    .and_modify(|touch| {
                        touch.first_seen_height = touch.first_seen_height.min(transaction.block_height);
                        touch.last_seen_height = touch.last_seen_height.max(transaction.block_height);
                        touch.tx_count += 1;
                    })
                    .or_insert_with(|| AccountTouch {
                        address: address.clone(),
                        first_seen_height: transaction.block_height,
                        last_seen_height: transaction.block_height,
                        tx_count: 1,
                    });
            }
        }

        Derived {
            output: DerivedOutput::AccountTouches(touches.into_values().collect()),
            errors: Vec::new(),
        }
    }
}

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
    BlockRange, TransactionStatus,
    processor::{Derived, DerivedOutput, Inputs, Processor, RangeInput, TxMetricsRow},
};

/// Aggregates per-range transaction counters; a single row keyed by the range start, so
/// re-running a range replaces the same row.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetricsProcessor;

impl Processor for TxMetricsProcessor {
    fn name(&self) -> &'static str {
        "tx_metrics"
    }

    fn inputs(&self) -> Inputs {
        Inputs::TRANSACTIONS_AND_EVENTS
    }

    fn derive(&self, range: BlockRange, input: &RangeInput) -> Derived {
        let failed_count = input
            .transactions
            .iter()
            .filter(|transaction| transaction.status == TransactionStatus::Error)
            .count() as u64;
        let gas_total = input
            .transactions
            .iter()
            .map(|transaction| transaction.gas_used)
            .sum();

        Derived {
            output: DerivedOutput::TxMetrics(TxMetricsRow {
                range_start: range.from,
                range_end: range.to,
                tx_count: input.transactions.len() as u64,
                event_count: input.events.len() as u64,
                failed_count,
                gas_total,
            }),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Transaction;
    use indexer_common::domain::Address;

    #[test]
    fn test_metrics_row() {
        let transaction = |status, gas_used| Transaction {
            id: Default::default(),
            block_height: 5,
            tx_index: 0,
            payer: Address::default(),
            proposer: Address::default(),
            authorizers: Vec::new(),
            status,
            error_message: None,
            gas_used,
            fee: None,
            timestamp: 0,
        };

        let input = RangeInput {
            transactions: vec![
                transaction(TransactionStatus::Sealed, 10),
                transaction(TransactionStatus::Error, 20),
            ],
            ..Default::default()
        };

        let derived = TxMetricsProcessor.derive(BlockRange::new(5, 15), &input);
        let DerivedOutput::TxMetrics(row) = derived.output else {
            panic!("wrong output variant");
        };

        assert_eq!(row.range_start, 5);
        assert_eq!(row.range_end, 15);
        assert_eq!(row.tx_count, 2);
        assert_eq!(row.failed_count, 1);
        assert_eq!(row.gas_total, 30);
    }
}

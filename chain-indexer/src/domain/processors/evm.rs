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
    BlockRange, Event,
    cadence::CadenceValue,
    processor::{Derived, DerivedOutput, EvmTransaction, Inputs, Processor, RangeInput},
};
use indexer_common::domain::{Address, ErrorKind, NewIndexingError};

const EVM_EXECUTED_SUFFIX: &str = ".EVM.TransactionExecuted";

/// Extracts executed EVM transactions from the `EVM.TransactionExecuted` events emitted by
/// the EVM gateway contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmProcessor;

impl EvmProcessor {
    fn decode(&self, event: &Event) -> Result<EvmTransaction, String> {
        let payload = CadenceValue::decode(&event.payload).map_err(|error| error.to_string())?;

        let evm_hash = payload
            .field("hash")
            .and_then(CadenceValue::as_string)
            .ok_or("missing hash")?;
        let from = payload
            .field("from")
            .and_then(CadenceValue::as_address)
            .unwrap_or_default();
        let to = payload
            .field("to")
            .and_then(CadenceValue::as_address)
            .unwrap_or_default();
        let value = payload
            .field("value")
            .and_then(CadenceValue::as_string)
            .unwrap_or_else(|| "0".to_string());
        let gas_used = payload
            .field("gasConsumed")
            .and_then(CadenceValue::as_string)
            .and_then(|gas| gas.parse().ok())
            .unwrap_or_default();

        Ok(EvmTransaction {
            transaction_id: event.transaction_id,
            event_index: event.event_index,
            evm_hash: Address::normalize(&evm_hash).as_str().to_string(),
            from,
            to,
            value,
            gas_used,
            block_height: event.block_height,
        })
    }
}

impl Processor for EvmProcessor {
    fn name(&self) -> &'static str {
        "evm"
    }

    fn inputs(&self) -> Inputs {
        Inputs::EVENTS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let mut transactions = Vec::new();
        let mut errors = Vec::new();

        for event in &input.events {
            if !event.event_type.ends_with(EVM_EXECUTED_SUFFIX) {
                continue;
            }

            match self.decode(event) {
                Ok(transaction) => transactions.push(transaction),
                Err(message) => errors.push(NewIndexingError::new(
                    self.name(),
                    event.block_height,
                    ErrorKind::DecodeFailed,
                    format!(
                        "event {}/{}: {message}",
                        event.transaction_id, event.event_index
                    ),
                )),
            }
        }

        Derived {
            output: DerivedOutput::EvmTransactions(transactions),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_evm_transaction() {
        let event_type = "A.e467b9dd11fa00df.EVM.TransactionExecuted";
        let event = Event {
            transaction_id: Default::default(),
            event_index: 2,
            block_height: 42,
            event_type: event_type.to_string(),
            contract_address: Event::contract_address_of(event_type),
            payload: json!({
                "type": "Event",
                "value": { "id": "x", "fields": [
                    { "name": "hash", "value": { "type": "String", "value": "0xAB12" } },
                    { "name": "from", "value": { "type": "String", "value": "0x00000000000000000000000212ed17c2a6de18f1" } },
                    { "name": "to", "value": { "type": "String", "value": "" } },
                    { "name": "value", "value": { "type": "UInt256", "value": "1000" } },
                    { "name": "gasConsumed", "value": { "type": "UInt64", "value": "21000" } }
                ] }
            }),
            timestamp: 0,
        };

        let derived = EvmProcessor.derive(
            BlockRange::new(42, 43),
            &RangeInput {
                events: vec![event],
                ..Default::default()
            },
        );

        let DerivedOutput::EvmTransactions(transactions) = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].gas_used, 21_000);
        assert_eq!(transactions[0].value, "1000");
        assert!(transactions[0].to.is_empty());
        assert!(derived.errors.is_empty());
    }
}

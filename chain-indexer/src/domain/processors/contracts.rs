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
    processor::{Contract, Derived, DerivedOutput, Inputs, Processor, RangeInput, TransactionContract},
};
use indexer_common::domain::{ErrorKind, NewIndexingError};
use itertools::Itertools;

/// Derives contract deployments from the `flow.AccountContractAdded`/`Updated` system
/// events, and the transaction ↔ contract mapping from every contract-scoped event type.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContractsProcessor;

impl Processor for ContractsProcessor {
    fn name(&self) -> &'static str {
        "contracts"
    }

    fn inputs(&self) -> Inputs {
        Inputs::EVENTS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let mut contracts = Vec::new();
        let mut errors = Vec::new();

        for event in &input.events {
            if event.event_type != "flow.AccountContractAdded"
                && event.event_type != "flow.AccountContractUpdated"
            {
                continue;
            }

            match decode_contract(event) {
                Ok(contract) => contracts.push(contract),
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

        let transaction_contracts = input
            .events
            .iter()
            .filter_map(|event| {
                let name = Event::contract_name_of(&event.event_type)?;
                Some(TransactionContract {
                    transaction_id: event.transaction_id,
                    contract_address: event.contract_address.clone(),
                    contract_name: name.to_string(),
                    block_height: event.block_height,
                })
            })
            .unique()
            .collect();

        Derived {
            output: DerivedOutput::Contracts {
                contracts,
                transaction_contracts,
            },
            errors,
        }
    }
}

fn decode_contract(event: &Event) -> Result<Contract, String> {
    let payload = CadenceValue::decode(&event.payload).map_err(|error| error.to_string())?;

    let address = payload
        .field("address")
        .and_then(CadenceValue::as_address)
        .ok_or("missing address")?;
    let name = payload
        .field("contract")
        .and_then(CadenceValue::as_string)
        .ok_or("missing contract name")?;

    Ok(Contract {
        address,
        name,
        source: None,
        deployed_at_height: event.block_height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            transaction_id: Default::default(),
            event_index: 0,
            block_height: 99,
            event_type: event_type.to_string(),
            contract_address: Event::contract_address_of(event_type),
            payload,
            timestamp: 0,
        }
    }

    #[test]
    fn test_contract_added() {
        let added = event(
            "flow.AccountContractAdded",
            json!({
                "type": "Event",
                "value": { "id": "flow.AccountContractAdded", "fields": [
                    { "name": "address", "value": { "type": "Address", "value": "0x1654653399040a61" } },
                    { "name": "contract", "value": { "type": "String", "value": "FlowToken" } }
                ] }
            }),
        );

        let derived = ContractsProcessor.derive(
            BlockRange::new(99, 100),
            &RangeInput {
                events: vec![added],
                ..Default::default()
            },
        );

        let DerivedOutput::Contracts { contracts, .. } = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].name, "FlowToken");
        assert_eq!(contracts[0].deployed_at_height, 99);
    }

    #[test]
    fn test_transaction_contract_mapping_deduplicated() {
        let payload = json!({ "type": "Event", "value": { "id": "x", "fields": [] } });
        let first = event("A.7e60df042a9c0868.FlowToken.TokensDeposited", payload.clone());
        let second = Event {
            event_index: 1,
            ..event("A.7e60df042a9c0868.FlowToken.TokensWithdrawn", payload)
        };

        let derived = ContractsProcessor.derive(
            BlockRange::new(99, 100),
            &RangeInput {
                events: vec![first, second],
                ..Default::default()
            },
        );

        let DerivedOutput::Contracts {
            transaction_contracts,
            ..
        } = derived.output
        else {
            panic!("wrong output variant");
        };
        // Same (transaction, contract) pair appears once.
        assert_eq!(transaction_contracts.len(), 1);
        assert_eq!(transaction_contracts[0].contract_name, "FlowToken");
    }
}

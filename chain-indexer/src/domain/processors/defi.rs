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
    processor::{DefiEvent, Derived, DerivedOutput, Inputs, Processor, RangeInput},
};

/// Event-name suffixes of the DEX/AMM protocols tracked as DeFi activity.
const DEFI_SUFFIXES: &[&str] = &[".Swap", ".Trade", ".SwapPair.Swapped", ".PoolCreated"];

/// Captures DeFi activity (swaps, trades, pool creation) with the raw payload preserved for
/// downstream protocol-specific interpretation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefiProcessor;

impl Processor for DefiProcessor {
    fn name(&self) -> &'static str {
        "defi"
    }

    fn inputs(&self) -> Inputs {
        Inputs::EVENTS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let defi_events = input
            .events
            .iter()
            .filter(|event| {
                DEFI_SUFFIXES
                    .iter()
                    .any(|suffix| event.event_type.ends_with(suffix))
            })
            .map(|event| {
                let kind = event
                    .event_type
                    .rsplit('.')
                    .next()
                    .unwrap_or(&event.event_type)
                    .to_string();

                DefiEvent {
                    transaction_id: event.transaction_id,
                    event_index: event.event_index,
                    protocol: event.contract_address.clone(),
                    kind,
                    details: event.payload.clone(),
                    block_height: event.block_height,
                }
            })
            .collect();

        Derived {
            output: DerivedOutput::DefiEvents(defi_events),
            errors: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use serde_json::json;

    #[test]
    fn test_swap_captured() {
        let event_type = "A.b063c16cac85dbd1.SwapPair.Swapped";
        let event = Event {
            transaction_id: Default::default(),
            event_index: 0,
            block_height: 7,
            event_type: event_type.to_string(),
            contract_address: Event::contract_address_of(event_type),
            payload: json!({ "type": "Event", "value": { "id": "x", "fields": [] } }),
            timestamp: 0,
        };

        let derived = DefiProcessor.derive(
            BlockRange::new(7, 8),
            &RangeInput {
                events: vec![event],
                ..Default::default()
            },
        );

        let DerivedOutput::DefiEvents(events) = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "Swapped");
        assert_eq!(events[0].protocol.as_str(), "b063c16cac85dbd1");
    }
}

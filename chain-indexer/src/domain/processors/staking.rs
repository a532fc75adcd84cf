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
    cadence::CadenceValue,
    processor::{Derived, DerivedOutput, Inputs, Processor, RangeInput, StakingEvent},
};
use indexer_common::domain::{ErrorKind, NewIndexingError};

const STAKING_CONTRACT: &str = ".FlowIDTableStaking.";

/// Extracts staking-table events (rewards, commitments, delegations) emitted by the
/// identity-table staking contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct StakingProcessor;

impl Processor for StakingProcessor {
    fn name(&self) -> &'static str {
        "staking"
    }

    fn inputs(&self) -> Inputs {
        Inputs::EVENTS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let mut staking_events = Vec::new();
        let mut errors = Vec::new();

        for event in &input.events {
            if !event.event_type.contains(STAKING_CONTRACT) {
                continue;
            }

            match CadenceValue::decode(&event.payload) {
                Ok(payload) => {
                    let event_name = event
                        .event_type
                        .rsplit('.')
                        .next()
                        .unwrap_or(&event.event_type);

                    staking_events.push(StakingEvent {
                        transaction_id: event.transaction_id,
                        event_index: event.event_index,
                        event_type: event_name.to_string(),
                        node_id: payload.field("nodeID").and_then(CadenceValue::as_string),
                        delegator_id: payload
                            .field("delegatorID")
                            .and_then(CadenceValue::as_string),
                        amount: payload.field("amount").and_then(CadenceValue::as_string),
                        block_height: event.block_height,
                    });
                }

                Err(error) => errors.push(NewIndexingError::new(
                    self.name(),
                    event.block_height,
                    ErrorKind::DecodeFailed,
                    format!(
                        "event {}/{}: {error}",
                        event.transaction_id, event.event_index
                    ),
                )),
            }
        }

        Derived {
            output: DerivedOutput::StakingEvents(staking_events),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Event;
    use serde_json::json;

    #[test]
    fn test_rewards_paid() {
        let event_type = "A.8624b52f9ddcd04a.FlowIDTableStaking.DelegatorRewardsPaid";
        let event = Event {
            transaction_id: Default::default(),
            event_index: 0,
            block_height: 1000,
            event_type: event_type.to_string(),
            contract_address: Event::contract_address_of(event_type),
            payload: json!({
                "type": "Event",
                "value": { "id": "x", "fields": [
                    { "name": "nodeID", "value": { "type": "String", "value": "abcd" } },
                    { "name": "delegatorID", "value": { "type": "UInt32", "value": "7" } },
                    { "name": "amount", "value": { "type": "UFix64", "value": "12.5" } }
                ] }
            }),
            timestamp: 0,
        };

        let derived = StakingProcessor.derive(
            BlockRange::new(1000, 1001),
            &RangeInput {
                events: vec![event],
                ..Default::default()
            },
        );

        let DerivedOutput::StakingEvents(events) = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "DelegatorRewardsPaid");
        assert_eq!(events[0].delegator_id.as_deref(), Some("7"));
        assert_eq!(events[0].amount.as_deref(), Some("12.5"));
    }
}

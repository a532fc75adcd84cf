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
    processor::{Derived, DerivedOutput, Inputs, Processor, RangeInput},
    token,
};
use indexer_common::domain::{ErrorKind, NewIndexingError};

/// Extracts token transfers from deposit/withdrawal events. A malformed payload skips that
/// one event and lands in the error ledger; it never blocks the range.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenProcessor;

impl Processor for TokenProcessor {
    fn name(&self) -> &'static str {
        "token"
    }

    fn inputs(&self) -> Inputs {
        Inputs::EVENTS
    }

    fn derive(&self, _range: BlockRange, input: &RangeInput) -> Derived {
        let mut transfers = Vec::new();
        let mut errors = Vec::new();

        for event in &input.events {
            match token::classify(event) {
                Ok(Some(transfer)) => transfers.push(transfer),
                Ok(None) => {}
                Err(error) => errors.push(NewIndexingError::new(
                    self.name(),
                    event.block_height,
                    ErrorKind::DecodeFailed,
                    format!(
                        "event {}/{} of type {}: {error}",
                        event.transaction_id, event.event_index, event.event_type
                    ),
                )),
            }
        }

        Derived {
            output: DerivedOutput::TokenTransfers(transfers),
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
    fn test_bad_event_is_skipped_not_fatal() {
        let good = Event {
            transaction_id: Default::default(),
            event_index: 0,
            block_height: 10,
            event_type: "A.7e60df042a9c0868.FlowToken.TokensDeposited".to_string(),
            contract_address: Event::contract_address_of(
                "A.7e60df042a9c0868.FlowToken.TokensDeposited",
            ),
            payload: json!({
                "type": "Event",
                "value": { "id": "x", "fields": [
                    { "name": "amount", "value": { "type": "UFix64", "value": "3.0" } },
                    { "name": "to", "value": { "type": "Address", "value": "0x1" } }
                ] }
            }),
            timestamp: 0,
        };
        let bad = Event {
            event_index: 1,
            payload: json!("not a cadence value"),
            ..good.clone()
        };

        let derived = TokenProcessor.derive(
            BlockRange::new(10, 11),
            &RangeInput {
                events: vec![good, bad],
                ..Default::default()
            },
        );

        let DerivedOutput::TokenTransfers(transfers) = derived.output else {
            panic!("wrong output variant");
        };
        assert_eq!(transfers.len(), 1);
        assert_eq!(derived.errors.len(), 1);
        assert_eq!(derived.errors[0].kind, ErrorKind::DecodeFailed);
    }
}

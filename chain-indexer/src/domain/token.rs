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
    Event,
    cadence::{CadenceDecodeError, CadenceValue},
};
use indexer_common::domain::{Address, TransactionHash};

/// A token movement derived from a deposit or withdrawal event. Each event carries at most
/// one side; the other stays empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenTransfer {
    pub transaction_id: TransactionHash,
    pub event_index: u32,
    pub contract: Address,
    pub from: Address,
    pub to: Address,
    /// Decimal string, precision preserved.
    pub amount: String,
    pub token_id: Option<String>,
    pub is_nft: bool,
    pub block_height: u64,
    pub timestamp: u64,
}

enum TokenEventKind {
    NftDeposit,
    NftWithdraw,
    FtDeposit,
    FtWithdraw,
}

fn kind_of(event_type: &str) -> Option<TokenEventKind> {
    if event_type.ends_with("NonFungibleToken.Deposited") {
        Some(TokenEventKind::NftDeposit)
    } else if event_type.ends_with("NonFungibleToken.Withdrawn") {
        Some(TokenEventKind::NftWithdraw)
    } else if event_type.ends_with("FungibleToken.Deposited")
        || event_type.ends_with(".TokensDeposited")
    {
        Some(TokenEventKind::FtDeposit)
    } else if event_type.ends_with("FungibleToken.Withdrawn")
        || event_type.ends_with(".TokensWithdrawn")
    {
        Some(TokenEventKind::FtWithdraw)
    } else {
        None
    }
}

/// Classify an event as a token transfer, or `None` if it is not one or fails the transfer
/// rules (fungible transfers without an amount and transfers with neither side are dropped).
pub fn classify(event: &Event) -> Result<Option<TokenTransfer>, CadenceDecodeError> {
    let Some(kind) = kind_of(&event.event_type) else {
        return Ok(None);
    };

    let payload = CadenceValue::decode(&event.payload)?;

    let amount = payload
        .field("amount")
        .and_then(CadenceValue::as_string)
        .filter(|amount| !amount.is_empty());
    let address_field = |name: &str| {
        payload
            .field(name)
            .and_then(CadenceValue::as_address)
            .unwrap_or_default()
    };
    let token_id = payload.field("id").and_then(CadenceValue::as_string);

    let (is_nft, from, to, amount) = match kind {
        TokenEventKind::NftDeposit => {
            (true, Address::default(), address_field("to"), amount.unwrap_or_else(|| "1".to_string()))
        }
        TokenEventKind::NftWithdraw => {
            (true, address_field("from"), Address::default(), amount.unwrap_or_else(|| "1".to_string()))
        }
        TokenEventKind::FtDeposit => {
            let Some(amount) = amount else {
                return Ok(None);
            };
            (false, Address::default(), address_field("to"), amount)
        }
        TokenEventKind::FtWithdraw => {
            let Some(amount) = amount else {
                return Ok(None);
            };
            (false, address_field("from"), Address::default(), amount)
        }
    };

    if from.is_empty() && to.is_empty() {
        return Ok(None);
    }

    Ok(Some(TokenTransfer {
        transaction_id: event.transaction_id,
        event_index: event.event_index,
        contract: event.contract_address.clone(),
        from,
        to,
        amount,
        token_id: token_id.filter(|_| is_nft),
        is_nft,
        block_height: event.block_height,
        timestamp: event.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, payload: serde_json::Value) -> Event {
        Event {
            transaction_id: TransactionHash::default(),
            event_index: 0,
            block_height: 555,
            event_type: event_type.to_string(),
            contract_address: Event::contract_address_of(event_type),
            payload,
            timestamp: 1_700_000_000_000,
        }
    }

    fn fields(fields: Vec<(&str, serde_json::Value)>) -> serde_json::Value {
        let fields = fields
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect::<Vec<_>>();
        json!({ "type": "Event", "value": { "id": "test", "fields": fields } })
    }

    #[test]
    fn test_fungible_withdraw_kept_with_one_side() {
        let event = event(
            "A.7e60df042a9c0868.FlowToken.TokensWithdrawn",
            fields(vec![
                ("amount", json!({ "type": "UFix64", "value": "1.50000000" })),
                (
                    "from",
                    json!({
                        "type": "Optional",
                        "value": { "type": "Address", "value": "0xabc" }
                    }),
                ),
            ]),
        );

        let transfer = classify(&event).unwrap().expect("a transfer");
        assert!(!transfer.is_nft);
        assert_eq!(transfer.amount, "1.50000000");
        assert_eq!(transfer.from.as_str(), "0000000000000abc");
        assert!(transfer.to.is_empty());
        assert_eq!(transfer.contract.as_str(), "7e60df042a9c0868");
    }

    #[test]
    fn test_fungible_without_amount_dropped() {
        let event = event(
            "A.7e60df042a9c0868.FlowToken.TokensDeposited",
            fields(vec![(
                "to",
                json!({ "type": "Address", "value": "0xdef" }),
            )]),
        );

        assert_eq!(classify(&event).unwrap(), None);
    }

    #[test]
    fn test_nft_deposit_defaults_amount() {
        let event = event(
            "A.1d7e57aa55817448.NonFungibleToken.Deposited",
            fields(vec![
                ("id", json!({ "type": "UInt64", "value": "77" })),
                ("to", json!({ "type": "Address", "value": "0x0b2a3299cc857e29" })),
            ]),
        );

        let transfer = classify(&event).unwrap().expect("a transfer");
        assert!(transfer.is_nft);
        assert_eq!(transfer.amount, "1");
        assert_eq!(transfer.token_id.as_deref(), Some("77"));
        assert_eq!(transfer.to.as_str(), "0b2a3299cc857e29");
    }

    #[test]
    fn test_both_sides_empty_dropped() {
        let event = event(
            "A.7e60df042a9c0868.FlowToken.TokensWithdrawn",
            fields(vec![
                ("amount", json!({ "type": "UFix64", "value": "2.0" })),
                ("from", json!({ "type": "Optional", "value": null })),
            ]),
        );

        assert_eq!(classify(&event).unwrap(), None);
    }

    #[test]
    fn test_unrelated_event_ignored() {
        let event = event("flow.AccountCreated", json!({ "type": "Event", "value": { "id": "x", "fields": [] } }));
        assert_eq!(classify(&event).unwrap(), None);
    }
}

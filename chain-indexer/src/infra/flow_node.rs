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
    Block, BlockData, Event, Transaction, TransactionStatus,
    node::{Node, NodeError},
};
use indexer_common::domain::Address;
use serde::Deserialize;
use std::{ops::RangeInclusive, sync::Arc, time::Duration};
use tokio::sync::Semaphore;

/// How long a request may wait for an endpoint permit before failing as saturated.
const PERMIT_WAIT: Duration = Duration::from_secs(10);

/// Historical eras use different access endpoints; an entry covers a height range.
#[derive(Debug, Clone)]
pub struct SporkEndpoint {
    pub heights: RangeInclusive<u64>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Default (tip) access endpoint.
    pub url: String,

    /// Comma-separated `from-to:url` entries for historical eras, selected by height.
    #[serde(default)]
    pub historic: Option<String>,

    #[serde(default = "endpoint_concurrency_default")]
    pub endpoint_concurrency: usize,

    #[serde(default = "request_timeout_default", with = "humantime_serde")]
    pub request_timeout: Duration,
}

/// Block Source over the HTTP Access API, dispatching per height across spork endpoints.
/// Each endpoint carries its own concurrency cap to avoid rate limiting; requests above the
/// cap queue on the semaphore.
#[derive(Clone)]
pub struct FlowNode {
    client: reqwest::Client,
    tip: Endpoint,
    historic: Arc<Vec<(RangeInclusive<u64>, Endpoint)>>,
}

#[derive(Clone)]
struct Endpoint {
    url: Arc<str>,
    permits: Arc<Semaphore>,
}

impl FlowNode {
    pub fn new(config: Config) -> Result<Self, NodeError> {
        let Config {
            url,
            historic,
            endpoint_concurrency,
            request_timeout,
        } = config;

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| NodeError::Http(error.into()))?;

        let endpoint = |url: String| Endpoint {
            url: url.trim_end_matches('/').into(),
            permits: Arc::new(Semaphore::new(endpoint_concurrency)),
        };

        let historic = historic
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(|entry| {
                let (range, url) = parse_spork_entry(entry)?;
                Ok((range, endpoint(url)))
            })
            .collect::<Result<Vec<_>, NodeError>>()?;

        Ok(Self {
            client,
            tip: endpoint(url),
            historic: Arc::new(historic),
        })
    }

    fn endpoint_for(&self, height: u64) -> &Endpoint {
        self.historic
            .iter()
            .find(|(heights, _)| heights.contains(&height))
            .map(|(_, endpoint)| endpoint)
            .unwrap_or(&self.tip)
    }

    async fn get_json(
        &self,
        endpoint: &Endpoint,
        path: &str,
    ) -> Result<serde_json::Value, NodeError> {
        // Queue on the per-endpoint cap, but only so long; saturation is retryable.
        let _permit = tokio::time::timeout(PERMIT_WAIT, endpoint.permits.acquire())
            .await
            .map_err(|_| NodeError::Saturated)?
            .map_err(|_| NodeError::Saturated)?;

        let url = format!("{}{path}", endpoint.url);
        let response = self.client.get(&url).send().await.map_err(|error| {
            if error.is_timeout() {
                NodeError::Timeout
            } else {
                NodeError::Http(error.into())
            }
        })?;

        let response = response
            .error_for_status()
            .map_err(|error| NodeError::Http(error.into()))?;

        response
            .json()
            .await
            .map_err(|error| NodeError::Decode(error.into()))
    }
}

impl Node for FlowNode {
    async fn fetch_block_data(&self, height: u64) -> Result<BlockData, NodeError> {
        let endpoint = self.endpoint_for(height).clone();

        let blocks: Vec<BlockResponse> = serde_json::from_value(
            self.get_json(
                &endpoint,
                &format!("/v1/blocks?height={height}&expand=payload"),
            )
            .await?,
        )
        .map_err(|error| NodeError::Decode(error.into()))?;

        let Some(block) = blocks.into_iter().next() else {
            return Err(NodeError::NilBlock(height));
        };

        let transactions: Vec<TransactionResponse> = serde_json::from_value(
            self.get_json(
                &endpoint,
                &format!("/v1/blocks/{}/transactions?expand=result", block.header.id),
            )
            .await?,
        )
        .map_err(|error| NodeError::Decode(error.into()))?;

        block.into_block_data(height, transactions).ok_or_else(|| {
            NodeError::Decode(format!("malformed block document at height {height}").into())
        })
    }

    async fn latest_height(&self) -> Result<u64, NodeError> {
        let blocks: Vec<BlockResponse> = serde_json::from_value(
            self.get_json(&self.tip, "/v1/blocks?height=sealed")
                .await?,
        )
        .map_err(|error| NodeError::Decode(error.into()))?;

        blocks
            .first()
            .and_then(|block| block.header.height.parse().ok())
            .ok_or(NodeError::Decode("sealed block carries no height".into()))
    }
}

fn parse_spork_entry(entry: &str) -> Result<(RangeInclusive<u64>, String), NodeError> {
    let entry = entry.trim();
    let invalid = || NodeError::Decode(format!("invalid historic endpoint entry: {entry}").into());

    let (range, url) = entry.split_once(':').ok_or_else(invalid)?;
    let (from, to) = range.split_once('-').ok_or_else(invalid)?;
    let from = from.parse().map_err(|_| invalid())?;
    let to = to.parse().map_err(|_| invalid())?;

    Ok((from..=to, url.to_string()))
}

#[derive(Debug, Deserialize)]
struct BlockResponse {
    header: BlockHeader,
    #[serde(default)]
    payload: Option<BlockPayload>,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    id: String,
    parent_id: String,
    height: String,
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
struct BlockPayload {
    #[serde(default)]
    collection_guarantees: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
    id: String,
    payer: String,
    proposal_key: ProposalKey,
    #[serde(default)]
    authorizers: Vec<String>,
    result: TransactionResult,
}

#[derive(Debug, Deserialize)]
struct ProposalKey {
    address: String,
}

#[derive(Debug, Deserialize)]
struct TransactionResult {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    computation_used: Option<String>,
    #[serde(default)]
    events: Vec<EventResponse>,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    #[serde(rename = "type")]
    event_type: String,
    event_index: String,
    payload: serde_json::Value,
}

impl BlockResponse {
    fn into_block_data(
        self,
        height: u64,
        transactions: Vec<TransactionResponse>,
    ) -> Option<BlockData> {
        let id = self.header.id.parse().ok()?;
        let parent_id = self.header.parent_id.parse().ok()?;
        let timestamp = parse_timestamp_millis(&self.header.timestamp)?;
        let collection_count = self
            .payload
            .as_ref()
            .map(|payload| payload.collection_guarantees.len() as u32)
            .unwrap_or_default();

        let mut domain_transactions = Vec::with_capacity(transactions.len());
        let mut domain_events = Vec::new();

        for (tx_index, transaction) in transactions.into_iter().enumerate() {
            let transaction_id = transaction.id.parse().ok()?;
            let status = TransactionStatus::parse(&transaction.result.status)
                .unwrap_or(TransactionStatus::Pending);

            for event in &transaction.result.events {
                domain_events.push(Event {
                    transaction_id,
                    event_index: event.event_index.parse().ok()?,
                    block_height: height,
                    contract_address: Event::contract_address_of(&event.event_type),
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                    timestamp,
                });
            }

            domain_transactions.push(Transaction {
                id: transaction_id,
                block_height: height,
                tx_index: tx_index as u32,
                payer: Address::normalize(&transaction.payer),
                proposer: Address::normalize(&transaction.proposal_key.address),
                authorizers: transaction
                    .authorizers
                    .iter()
                    .map(|address| Address::normalize(address))
                    .collect(),
                status,
                error_message: transaction.result.error_message.filter(|m| !m.is_empty()),
                gas_used: transaction
                    .result
                    .computation_used
                    .as_deref()
                    .and_then(|gas| gas.parse().ok())
                    .unwrap_or_default(),
                fee: None,
                timestamp,
            });
        }

        let tx_count = domain_transactions.len() as u32;
        let event_count = domain_events.len() as u32;

        Some(BlockData {
            block: Block {
                height,
                id,
                parent_id,
                timestamp,
                collection_count,
                tx_count,
                event_count,
            },
            transactions: domain_transactions,
            events: domain_events,
        })
    }
}

/// Parse an RFC 3339 timestamp (`2023-01-01T12:00:00.000000000Z`) into epoch millis.
fn parse_timestamp_millis(timestamp: &str) -> Option<u64> {
    use time::{OffsetDateTime, format_description::well_known::Rfc3339};

    let parsed = OffsetDateTime::parse(timestamp, &Rfc3339).ok()?;
    u64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spork_entry() {
        let (range, url) =
            parse_spork_entry("7601063-12020337:https://access-001.candidate4.nodes.example")
                .unwrap();
        assert_eq!(range, 7_601_063..=12_020_337);
        assert_eq!(url, "https://access-001.candidate4.nodes.example");

        assert!(parse_spork_entry("nonsense").is_err());
    }

    #[test]
    fn test_endpoint_dispatch_by_height() {
        let node = FlowNode::new(Config {
            url: "https://tip.example".to_string(),
            historic: Some(
                "0-100:https://spork1.example,101-200:https://spork2.example".to_string(),
            ),
            endpoint_concurrency: 4,
            request_timeout: Duration::from_secs(120),
        })
        .unwrap();

        assert_eq!(&*node.endpoint_for(50).url, "https://spork1.example");
        assert_eq!(&*node.endpoint_for(150).url, "https://spork2.example");
        assert_eq!(&*node.endpoint_for(10_000).url, "https://tip.example");
    }

    #[test]
    fn test_parse_timestamp_millis() {
        assert_eq!(
            parse_timestamp_millis("1970-01-01T00:00:01Z"),
            Some(1_000)
        );
        assert_eq!(parse_timestamp_millis("not a timestamp"), None);
    }
}

fn endpoint_concurrency_default() -> usize {
    8
}

fn request_timeout_default() -> Duration {
    Duration::from_secs(120)
}

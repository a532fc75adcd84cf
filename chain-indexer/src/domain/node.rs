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

use crate::domain::BlockData;
use indexer_common::error::BoxError;
use thiserror::Error;

/// Block Source abstraction: fetches sealed block data by height from one of several
/// historical access endpoints.
#[trait_variant::make(Send)]
pub trait Node
where
    Self: Clone + Send + Sync + 'static,
{
    /// Fetch the block, its transactions and its events for the given height.
    async fn fetch_block_data(&self, height: u64) -> Result<BlockData, NodeError>;

    /// The highest sealed height known to the tip endpoint.
    async fn latest_height(&self) -> Result<u64, NodeError>;
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("request to access node failed")]
    Http(#[source] BoxError),

    #[error("request to access node timed out")]
    Timeout,

    #[error("access node concurrency cap saturated")]
    Saturated,

    #[error("access node returned no block for height {0}")]
    NilBlock(u64),

    #[error("cannot decode access node response")]
    Decode(#[source] BoxError),

    #[error("no access node endpoint covers height {0}")]
    NoEndpoint(u64),
}

impl NodeError {
    /// Transient errors fail the lease so the range is retried; structural ones are logged
    /// to the error ledger without blocking the range.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Http(_) | NodeError::Timeout | NodeError::Saturated
        )
    }
}

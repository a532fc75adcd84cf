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

use serde::Serialize;

/// One worker's checkpoint with its last-update time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRow {
    pub worker_name: String,
    pub height: u64,
    /// ISO 8601.
    pub updated_at: String,
}

/// A completed lease range of a raw ingester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoneRange {
    pub from: u64,
    pub to: u64,
}

/// Row counts across the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub blocks: u64,
    pub transactions: u64,
    pub events: u64,
    pub contracts: u64,
    pub addresses: u64,
}

/// A price sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePoint {
    pub as_of: String,
    pub price: f64,
}

/// Read side of the Persistent Store backing status aggregation.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    async fn checkpoints(&self) -> Result<Vec<CheckpointRow>, sqlx::Error>;

    /// Completed lease ranges of the raw ingesters (forward and history).
    async fn raw_done_ranges(&self) -> Result<Vec<DoneRange>, sqlx::Error>;

    async fn totals(&self) -> Result<Totals, sqlx::Error>;

    /// Unresolved error-ledger entries per worker.
    async fn unresolved_errors_by_worker(&self) -> Result<Vec<(String, u64)>, sqlx::Error>;

    /// Dead leases per worker.
    async fn dead_leases_by_worker(&self) -> Result<Vec<(String, u64)>, sqlx::Error>;

    /// Most recent price samples, newest first.
    async fn price_history(&self, limit: u32) -> Result<Vec<PricePoint>, sqlx::Error>;
}

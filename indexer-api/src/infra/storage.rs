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

use crate::domain::storage::{CheckpointRow, DoneRange, PricePoint, Storage, Totals};
use fastrace::trace;
use indexer_common::infra::pool::postgres::PostgresPool;
use indoc::indoc;
use time::format_description::well_known::Rfc3339;

/// Postgres based implementation of the status read side.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PostgresPool,
}

impl PostgresStorage {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

impl Storage for PostgresStorage {
    #[trace]
    async fn checkpoints(&self) -> Result<Vec<CheckpointRow>, sqlx::Error> {
        let query = indoc! {"
            SELECT worker_name, height, updated_at
            FROM coord.checkpoints
            ORDER BY worker_name
        "};

        let rows = sqlx::query_as::<_, (String, i64, time::OffsetDateTime)>(query)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(worker_name, height, updated_at)| CheckpointRow {
                worker_name,
                height: height as u64,
                updated_at: updated_at.format(&Rfc3339).unwrap_or_default(),
            })
            .collect())
    }

    #[trace]
    async fn raw_done_ranges(&self) -> Result<Vec<DoneRange>, sqlx::Error> {
        let query = indoc! {"
            SELECT range_from, range_to
            FROM coord.leases
            WHERE state = 'done'
              AND (worker_name = 'main_ingester' OR worker_name LIKE 'history\\_%')
        "};

        let rows = sqlx::query_as::<_, (i64, i64)>(query)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(from, to)| DoneRange {
                from: from as u64,
                to: to as u64,
            })
            .collect())
    }

    #[trace]
    async fn totals(&self) -> Result<Totals, sqlx::Error> {
        let count = async |query: &str| -> Result<u64, sqlx::Error> {
            let (count,) = sqlx::query_as::<_, (i64,)>(query)
                .fetch_one(&*self.pool)
                .await?;
            Ok(count as u64)
        };

        Ok(Totals {
            blocks: count("SELECT count(*) FROM raw.blocks").await?,
            transactions: count("SELECT count(*) FROM raw.transactions").await?,
            events: count("SELECT count(*) FROM raw.events").await?,
            contracts: count("SELECT count(*) FROM app.contracts").await?,
            addresses: count("SELECT count(*) FROM app.accounts").await?,
        })
    }

    #[trace]
    async fn unresolved_errors_by_worker(&self) -> Result<Vec<(String, u64)>, sqlx::Error> {
        let query = indoc! {"
            SELECT worker_name, count(*)
            FROM raw.indexing_errors
            WHERE NOT resolved
            GROUP BY worker_name
        "};

        let rows = sqlx::query_as::<_, (String, i64)>(query)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(worker, count)| (worker, count as u64))
            .collect())
    }

    #[trace]
    async fn dead_leases_by_worker(&self) -> Result<Vec<(String, u64)>, sqlx::Error> {
        let query = indoc! {"
            SELECT worker_name, count(*)
            FROM coord.leases
            WHERE state = 'dead'
            GROUP BY worker_name
        "};

        let rows = sqlx::query_as::<_, (String, i64)>(query)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(worker, count)| (worker, count as u64))
            .collect())
    }

    #[trace]
    async fn price_history(&self, limit: u32) -> Result<Vec<PricePoint>, sqlx::Error> {
        let query = indoc! {"
            SELECT as_of, price
            FROM app.token_prices
            ORDER BY as_of DESC
            LIMIT $1
        "};

        let rows = sqlx::query_as::<_, (time::OffsetDateTime, f64)>(query)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(as_of, price)| PricePoint {
                as_of: as_of.format(&Rfc3339).unwrap_or_default(),
                price,
            })
            .collect())
    }
}

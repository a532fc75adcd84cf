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
    Block, BlockRange, Event, Transaction, TransactionStatus,
    lease::{ClaimRequest, Lease, LeaseError, LeaseState, LeaseStore},
    processor::DerivedOutput,
    queue::{Job, JobClaim, JobStore},
    storage::{CheckpointUpdate, RawBatch, Storage},
    token::TokenTransfer,
};
use fastrace::trace;
use indexer_common::{
    domain::{Address, Direction, NewIndexingError, covered_floor},
    infra::pool::postgres::PostgresPool,
};
use indoc::indoc;
use itertools::Itertools;
use sqlx::{Postgres, QueryBuilder, Row, postgres::PgRow};
use time::OffsetDateTime;
use uuid::Uuid;

type Tx = sqlx::Transaction<'static, Postgres>;

/// Rows per multi-row insert, staying well below the Postgres bind-parameter cap.
const INSERT_CHUNK: usize = 500;

/// Heights per raw-table partition.
const PARTITION_SPAN: u64 = 100_000;

/// Postgres based implementation of [Storage], [LeaseStore] and [JobStore]: the same store
/// that holds results holds the work queue.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PostgresPool,
}

impl PostgresStorage {
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

fn millis_to_timestamp(millis: u64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn timestamp_to_millis(timestamp: OffsetDateTime) -> u64 {
    (timestamp.unix_timestamp_nanos() / 1_000_000)
        .try_into()
        .unwrap_or_default()
}

fn decode_hash(row: &PgRow, column: &str) -> Result<indexer_common::domain::ByteArray<32>, sqlx::Error> {
    row.try_get::<Vec<u8>, _>(column)?
        .try_into()
        .map_err(|_| sqlx::Error::Decode(format!("cannot convert {column} into 32-byte array").into()))
}

async fn apply_checkpoint(update: &CheckpointUpdate, tx: &mut Tx) -> Result<(), sqlx::Error> {
    let query = match update.direction {
        Direction::Forward => indoc! {"
            INSERT INTO coord.checkpoints (worker_name, height, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (worker_name) DO UPDATE
            SET height = GREATEST(coord.checkpoints.height, EXCLUDED.height),
                updated_at = now()
        "},
        Direction::Backward => indoc! {"
            INSERT INTO coord.checkpoints (worker_name, height, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (worker_name) DO UPDATE
            SET height = LEAST(coord.checkpoints.height, EXCLUDED.height),
                updated_at = now()
        "},
    };

    sqlx::query(query)
        .bind(&update.worker_name)
        .bind(update.height as i64)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

impl Storage for PostgresStorage {
    #[trace]
    async fn ensure_partitions(&self, range: BlockRange) -> Result<(), sqlx::Error> {
        if range.is_empty() {
            return Ok(());
        }

        for index in range.from / PARTITION_SPAN..=range.max_height() / PARTITION_SPAN {
            let from = index * PARTITION_SPAN;
            let to = from + PARTITION_SPAN;

            for table in ["blocks", "transactions", "events"] {
                let query = format!(
                    "CREATE TABLE IF NOT EXISTS raw.{table}_p{index} \
                     PARTITION OF raw.{table} FOR VALUES FROM ({from}) TO ({to})"
                );
                sqlx::query(&query).execute(&*self.pool).await?;
            }
        }

        Ok(())
    }

    #[trace]
    async fn save_batch(
        &self,
        batch: &RawBatch,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        for blocks in batch.blocks.chunks(INSERT_CHUNK) {
            let query = indoc! {"
                INSERT INTO raw.blocks (
                    height,
                    id,
                    parent_id,
                    timestamp,
                    collection_count,
                    tx_count,
                    event_count
                )
            "};

            QueryBuilder::new(query)
                .push_values(blocks, |mut q, block| {
                    let Block {
                        height,
                        id,
                        parent_id,
                        timestamp,
                        collection_count,
                        tx_count,
                        event_count,
                    } = block;
                    q.push_bind(*height as i64)
                        .push_bind(id.as_ref())
                        .push_bind(parent_id.as_ref())
                        .push_bind(millis_to_timestamp(*timestamp))
                        .push_bind(*collection_count as i32)
                        .push_bind(*tx_count as i32)
                        .push_bind(*event_count as i32);
                })
                .push(" ON CONFLICT (height) DO NOTHING")
                .build()
                .execute(&mut *tx)
                .await?;
        }

        for transactions in batch.transactions.chunks(INSERT_CHUNK) {
            let query = indoc! {"
                INSERT INTO raw.transactions (
                    id,
                    block_height,
                    tx_index,
                    payer,
                    proposer,
                    authorizers,
                    status,
                    error_message,
                    gas_used,
                    fee,
                    timestamp
                )
            "};

            QueryBuilder::new(query)
                .push_values(transactions, |mut q, transaction| {
                    let authorizers = transaction
                        .authorizers
                        .iter()
                        .map(|address| address.as_str().to_string())
                        .collect::<Vec<_>>();
                    q.push_bind(transaction.id.as_ref())
                        .push_bind(transaction.block_height as i64)
                        .push_bind(transaction.tx_index as i32)
                        .push_bind(transaction.payer.as_str())
                        .push_bind(transaction.proposer.as_str())
                        .push_bind(authorizers)
                        .push_bind(transaction.status.as_str())
                        .push_bind(&transaction.error_message)
                        .push_bind(transaction.gas_used as i64)
                        .push_bind(&transaction.fee)
                        .push_bind(millis_to_timestamp(transaction.timestamp));
                })
                .push(" ON CONFLICT (block_height, id) DO NOTHING")
                .build()
                .execute(&mut *tx)
                .await?;
        }

        for events in batch.events.chunks(INSERT_CHUNK) {
            let query = indoc! {"
                INSERT INTO raw.events (
                    transaction_id,
                    event_index,
                    block_height,
                    type,
                    payload,
                    contract_address,
                    timestamp
                )
            "};

            QueryBuilder::new(query)
                .push_values(events, |mut q, event| {
                    q.push_bind(event.transaction_id.as_ref())
                        .push_bind(event.event_index as i32)
                        .push_bind(event.block_height as i64)
                        .push_bind(&event.event_type)
                        .push_bind(&event.payload)
                        .push_bind(event.contract_address.as_str())
                        .push_bind(millis_to_timestamp(event.timestamp));
                })
                .push(" ON CONFLICT (block_height, transaction_id, event_index) DO NOTHING")
                .build()
                .execute(&mut *tx)
                .await?;
        }

        apply_checkpoint(checkpoint, &mut tx).await?;
        tx.commit().await
    }

    #[trace]
    async fn get_transactions_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<Transaction>, sqlx::Error> {
        let query = indoc! {"
            SELECT
                id,
                block_height,
                tx_index,
                payer,
                proposer,
                authorizers,
                status,
                error_message,
                gas_used,
                fee,
                timestamp
            FROM raw.transactions
            WHERE block_height >= $1 AND block_height < $2
            ORDER BY block_height, tx_index
        "};

        sqlx::query(query)
            .bind(range.from as i64)
            .bind(range.to as i64)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(|row| {
                let status = row.try_get::<String, _>("status")?;
                let status = TransactionStatus::parse(&status).ok_or_else(|| {
                    sqlx::Error::Decode(format!("unknown transaction status {status}").into())
                })?;

                Ok(Transaction {
                    id: decode_hash(&row, "id")?,
                    block_height: row.try_get::<i64, _>("block_height")? as u64,
                    tx_index: row.try_get::<i32, _>("tx_index")? as u32,
                    payer: Address::normalize(&row.try_get::<String, _>("payer")?),
                    proposer: Address::normalize(&row.try_get::<String, _>("proposer")?),
                    authorizers: row
                        .try_get::<Vec<String>, _>("authorizers")?
                        .iter()
                        .map(|address| Address::normalize(address))
                        .collect(),
                    status,
                    error_message: row.try_get("error_message")?,
                    gas_used: row.try_get::<i64, _>("gas_used")? as u64,
                    fee: row.try_get("fee")?,
                    timestamp: timestamp_to_millis(row.try_get("timestamp")?),
                })
            })
            .collect()
    }

    #[trace]
    async fn get_events_in_range(&self, range: BlockRange) -> Result<Vec<Event>, sqlx::Error> {
        let query = indoc! {"
            SELECT
                transaction_id,
                event_index,
                block_height,
                type,
                payload,
                contract_address,
                timestamp
            FROM raw.events
            WHERE block_height >= $1 AND block_height < $2
            ORDER BY block_height, transaction_id, event_index
        "};

        sqlx::query(query)
            .bind(range.from as i64)
            .bind(range.to as i64)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(|row| {
                Ok(Event {
                    transaction_id: decode_hash(&row, "transaction_id")?,
                    event_index: row.try_get::<i32, _>("event_index")? as u32,
                    block_height: row.try_get::<i64, _>("block_height")? as u64,
                    event_type: row.try_get("type")?,
                    payload: row.try_get("payload")?,
                    contract_address: Address::normalize(
                        &row.try_get::<String, _>("contract_address")?,
                    ),
                    timestamp: timestamp_to_millis(row.try_get("timestamp")?),
                })
            })
            .collect()
    }

    #[trace]
    async fn get_token_transfers_in_range(
        &self,
        range: BlockRange,
    ) -> Result<Vec<TokenTransfer>, sqlx::Error> {
        let query = indoc! {"
            SELECT
                transaction_id,
                event_index,
                contract,
                from_address,
                to_address,
                amount,
                token_id,
                is_nft,
                block_height,
                timestamp
            FROM app.token_transfers
            WHERE block_height >= $1 AND block_height < $2
            ORDER BY block_height, transaction_id, event_index
        "};

        sqlx::query(query)
            .bind(range.from as i64)
            .bind(range.to as i64)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(|row| {
                Ok(TokenTransfer {
                    transaction_id: decode_hash(&row, "transaction_id")?,
                    event_index: row.try_get::<i32, _>("event_index")? as u32,
                    contract: Address::normalize(&row.try_get::<String, _>("contract")?),
                    from: Address::normalize(&row.try_get::<String, _>("from_address")?),
                    to: Address::normalize(&row.try_get::<String, _>("to_address")?),
                    amount: row.try_get("amount")?,
                    token_id: row.try_get("token_id")?,
                    is_nft: row.try_get("is_nft")?,
                    block_height: row.try_get::<i64, _>("block_height")? as u64,
                    timestamp: timestamp_to_millis(row.try_get("timestamp")?),
                })
            })
            .collect()
    }

    #[trace]
    async fn checkpoint_of(&self, worker_name: &str) -> Result<Option<u64>, sqlx::Error> {
        let query = indoc! {"
            SELECT height
            FROM coord.checkpoints
            WHERE worker_name = $1
        "};

        let height = sqlx::query_as::<_, (i64,)>(query)
            .bind(worker_name)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(height.map(|(height,)| height as u64))
    }

    #[trace]
    async fn record_height(&self, worker_name: &str, height: u64) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO coord.checkpoints (worker_name, height, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (worker_name) DO UPDATE
            SET height = EXCLUDED.height, updated_at = now()
        "};

        sqlx::query(query)
            .bind(worker_name)
            .bind(height as i64)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn log_indexing_error(&self, error: &NewIndexingError) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO raw.indexing_errors (worker_name, block_height, error_hash, message)
            VALUES ($1, $2, $3, $4)
        "};

        sqlx::query(query)
            .bind(&error.worker_name)
            .bind(error.block_height as i64)
            .bind(error.kind.hash())
            .bind(&error.message)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn save_derived(
        &self,
        range: BlockRange,
        output: &DerivedOutput,
        checkpoint: &CheckpointUpdate,
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        save_derived_output(range, output, &mut tx).await?;
        apply_checkpoint(checkpoint, &mut tx).await?;
        tx.commit().await
    }

    #[trace]
    async fn history_covered_floor(&self, anchor: u64) -> Result<u64, sqlx::Error> {
        let query = indoc! {"
            SELECT range_from, range_to
            FROM coord.leases
            WHERE state = 'done' AND worker_name LIKE 'history\\_%'
        "};

        let ranges = sqlx::query_as::<_, (i64, i64)>(query)
            .fetch_all(&*self.pool)
            .await?
            .into_iter()
            .map(|(from, to)| (from as u64, to as u64))
            .collect();

        Ok(covered_floor(ranges, anchor))
    }

    #[trace]
    async fn nft_missing_metadata(
        &self,
        limit: u32,
    ) -> Result<Vec<(Address, String)>, sqlx::Error> {
        let query = indoc! {"
            SELECT o.contract, o.token_id
            FROM app.nft_ownership o
            LEFT JOIN app.nft_metadata m USING (contract, token_id)
            WHERE m.contract IS NULL AND o.owner <> ''
            LIMIT $1
        "};

        let rows = sqlx::query_as::<_, (String, String)>(query)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(contract, token_id)| (Address::normalize(&contract), token_id))
            .collect())
    }

    #[trace]
    async fn nft_in_flight(&self, limit: u32) -> Result<Vec<(Address, String)>, sqlx::Error> {
        let query = indoc! {"
            SELECT contract, token_id
            FROM app.nft_ownership
            WHERE owner = ''
            LIMIT $1
        "};

        let rows = sqlx::query_as::<_, (String, String)>(query)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(contract, token_id)| (Address::normalize(&contract), token_id))
            .collect())
    }

    #[trace]
    async fn save_nft_metadata(
        &self,
        contract: &Address,
        token_id: &str,
        uri: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO app.nft_metadata (contract, token_id, uri, metadata, fetched_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (contract, token_id) DO UPDATE
            SET uri = EXCLUDED.uri, metadata = EXCLUDED.metadata, fetched_at = now()
        "};

        sqlx::query(query)
            .bind(contract.as_str())
            .bind(token_id)
            .bind(uri)
            .bind(metadata)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn recompute_nft_owner(
        &self,
        contract: &Address,
        token_id: &str,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE app.nft_ownership n
            SET owner = last.to_address
            FROM (
                SELECT to_address
                FROM app.token_transfers
                WHERE contract = $1 AND token_id = $2 AND is_nft
                ORDER BY block_height DESC, event_index DESC
                LIMIT 1
            ) last
            WHERE n.contract = $1 AND n.token_id = $2
        "};

        sqlx::query(query)
            .bind(contract.as_str())
            .bind(token_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn save_token_price(&self, price: f64) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO app.token_prices (as_of, price)
            VALUES (now(), $1)
            ON CONFLICT (as_of) DO UPDATE SET price = EXCLUDED.price
        "};

        sqlx::query(query).bind(price).execute(&*self.pool).await?;

        Ok(())
    }
}

async fn save_derived_output(
    range: BlockRange,
    output: &DerivedOutput,
    tx: &mut Tx,
) -> Result<(), sqlx::Error> {
    match output {
        DerivedOutput::TokenTransfers(transfers) => {
            for transfers in transfers.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.token_transfers (
                        transaction_id,
                        event_index,
                        contract,
                        from_address,
                        to_address,
                        amount,
                        token_id,
                        is_nft,
                        block_height,
                        timestamp
                    )
                "};

                QueryBuilder::new(query)
                    .push_values(transfers, |mut q, transfer| {
                        q.push_bind(transfer.transaction_id.as_ref())
                            .push_bind(transfer.event_index as i32)
                            .push_bind(transfer.contract.as_str())
                            .push_bind(transfer.from.as_str())
                            .push_bind(transfer.to.as_str())
                            .push_bind(&transfer.amount)
                            .push_bind(&transfer.token_id)
                            .push_bind(transfer.is_nft)
                            .push_bind(transfer.block_height as i64)
                            .push_bind(millis_to_timestamp(transfer.timestamp));
                    })
                    .push(" ON CONFLICT (transaction_id, event_index) DO NOTHING")
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::EvmTransactions(transactions) => {
            for transactions in transactions.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.evm_transactions (
                        transaction_id,
                        event_index,
                        evm_hash,
                        from_address,
                        to_address,
                        value,
                        gas_used,
                        block_height
                    )
                "};

                QueryBuilder::new(query)
                    .push_values(transactions, |mut q, transaction| {
                        q.push_bind(transaction.transaction_id.as_ref())
                            .push_bind(transaction.event_index as i32)
                            .push_bind(&transaction.evm_hash)
                            .push_bind(transaction.from.as_str())
                            .push_bind(transaction.to.as_str())
                            .push_bind(&transaction.value)
                            .push_bind(transaction.gas_used as i64)
                            .push_bind(transaction.block_height as i64);
                    })
                    .push(" ON CONFLICT (transaction_id, event_index) DO NOTHING")
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::Contracts {
            contracts,
            transaction_contracts,
        } => {
            for contract in contracts {
                let query = indoc! {"
                    INSERT INTO app.contracts (address, name, source, deployed_at_height)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (address, name) DO UPDATE
                    SET deployed_at_height =
                        LEAST(app.contracts.deployed_at_height, EXCLUDED.deployed_at_height)
                "};

                sqlx::query(query)
                    .bind(contract.address.as_str())
                    .bind(&contract.name)
                    .bind(&contract.source)
                    .bind(contract.deployed_at_height as i64)
                    .execute(&mut **tx)
                    .await?;
            }

            for mappings in transaction_contracts.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.transaction_contracts (
                        transaction_id,
                        contract_address,
                        contract_name,
                        block_height
                    )
                "};

                QueryBuilder::new(query)
                    .push_values(mappings, |mut q, mapping| {
                        q.push_bind(mapping.transaction_id.as_ref())
                            .push_bind(mapping.contract_address.as_str())
                            .push_bind(&mapping.contract_name)
                            .push_bind(mapping.block_height as i64);
                    })
                    .push(
                        " ON CONFLICT (transaction_id, contract_address, contract_name) DO NOTHING",
                    )
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::AccountTouches(touches) => {
            for touch in touches {
                let query = indoc! {"
                    INSERT INTO app.accounts (
                        address,
                        first_seen_height,
                        last_seen_height,
                        tx_count
                    )
                    VALUES ($1, $2, $3, 0)
                    ON CONFLICT (address) DO UPDATE
                    SET first_seen_height =
                            LEAST(app.accounts.first_seen_height, EXCLUDED.first_seen_height),
                        last_seen_height =
                            GREATEST(app.accounts.last_seen_height, EXCLUDED.last_seen_height)
                "};

                sqlx::query(query)
                    .bind(touch.address.as_str())
                    .bind(touch.first_seen_height as i64)
                    .bind(touch.last_seen_height as i64)
                    .execute(&mut **tx)
                    .await?;

                let query = indoc! {"
                    INSERT INTO app.account_activity (address, range_start, tx_count)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (address, range_start) DO UPDATE
                    SET tx_count = EXCLUDED.tx_count
                "};

                sqlx::query(query)
                    .bind(touch.address.as_str())
                    .bind(range.from as i64)
                    .bind(touch.tx_count as i64)
                    .execute(&mut **tx)
                    .await?;
            }

            let addresses = touches
                .iter()
                .map(|touch| touch.address.as_str().to_string())
                .collect::<Vec<_>>();

            let query = indoc! {"
                UPDATE app.accounts a
                SET tx_count = s.total
                FROM (
                    SELECT address, SUM(tx_count) AS total
                    FROM app.account_activity
                    WHERE address = ANY($1)
                    GROUP BY address
                ) s
                WHERE a.address = s.address
            "};

            sqlx::query(query).bind(&addresses).execute(&mut **tx).await?;
        }

        DerivedOutput::TxMetrics(row) => {
            let query = indoc! {"
                INSERT INTO app.tx_metrics (
                    range_start,
                    range_end,
                    tx_count,
                    event_count,
                    failed_count,
                    gas_total
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (range_start) DO UPDATE
                SET range_end = EXCLUDED.range_end,
                    tx_count = EXCLUDED.tx_count,
                    event_count = EXCLUDED.event_count,
                    failed_count = EXCLUDED.failed_count,
                    gas_total = EXCLUDED.gas_total
            "};

            sqlx::query(query)
                .bind(row.range_start as i64)
                .bind(row.range_end as i64)
                .bind(row.tx_count as i64)
                .bind(row.event_count as i64)
                .bind(row.failed_count as i64)
                .bind(row.gas_total as i64)
                .execute(&mut **tx)
                .await?;
        }

        DerivedOutput::StakingEvents(events) => {
            for events in events.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.staking_events (
                        transaction_id,
                        event_index,
                        type,
                        node_id,
                        delegator_id,
                        amount,
                        block_height
                    )
                "};

                QueryBuilder::new(query)
                    .push_values(events, |mut q, event| {
                        q.push_bind(event.transaction_id.as_ref())
                            .push_bind(event.event_index as i32)
                            .push_bind(&event.event_type)
                            .push_bind(&event.node_id)
                            .push_bind(&event.delegator_id)
                            .push_bind(&event.amount)
                            .push_bind(event.block_height as i64);
                    })
                    .push(" ON CONFLICT (transaction_id, event_index) DO NOTHING")
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::DefiEvents(events) => {
            for events in events.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.defi_events (
                        transaction_id,
                        event_index,
                        protocol,
                        kind,
                        details,
                        block_height
                    )
                "};

                QueryBuilder::new(query)
                    .push_values(events, |mut q, event| {
                        q.push_bind(event.transaction_id.as_ref())
                            .push_bind(event.event_index as i32)
                            .push_bind(event.protocol.as_str())
                            .push_bind(&event.kind)
                            .push_bind(&event.details)
                            .push_bind(event.block_height as i64);
                    })
                    .push(" ON CONFLICT (transaction_id, event_index) DO NOTHING")
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::FtHoldings(deltas) => {
            if deltas.is_empty() {
                return Ok(());
            }

            let query = indoc! {"
                INSERT INTO app.ft_holdings AS h (address, contract, balance, version)
                SELECT v.address, v.contract, SUM(v.delta::NUMERIC), MAX(v.version)
                FROM (
            "};

            QueryBuilder::new(query)
                .push_values(deltas, |mut q, delta| {
                    q.push_bind(delta.address.as_str())
                        .push_bind(delta.contract.as_str())
                        .push_bind(&delta.delta)
                        .push_bind(delta.version as i64);
                })
                .push(indoc! {"
                    ) AS v(address, contract, delta, version)
                    GROUP BY v.address, v.contract
                    ON CONFLICT (address, contract) DO UPDATE
                    SET balance = h.balance + EXCLUDED.balance,
                        version = EXCLUDED.version
                    WHERE h.version < EXCLUDED.version
                "})
                .build()
                .execute(&mut **tx)
                .await?;
        }

        DerivedOutput::NftOwnership(changes) => {
            for changes in changes.chunks(INSERT_CHUNK) {
                let query = indoc! {"
                    INSERT INTO app.nft_ownership AS n (contract, token_id, owner, version)
                "};

                QueryBuilder::new(query)
                    .push_values(changes, |mut q, change| {
                        q.push_bind(change.contract.as_str())
                            .push_bind(&change.token_id)
                            .push_bind(change.owner.as_str())
                            .push_bind(change.version as i64);
                    })
                    .push(indoc! {"
                         ON CONFLICT (contract, token_id) DO UPDATE
                        SET owner = EXCLUDED.owner, version = EXCLUDED.version
                        WHERE n.version < EXCLUDED.version
                    "})
                    .build()
                    .execute(&mut **tx)
                    .await?;
            }
        }

        DerivedOutput::DailyBalances(flows) => {
            if flows.is_empty() {
                return Ok(());
            }

            let query = indoc! {"
                INSERT INTO app.daily_balances AS d (address, contract, day, net_change, version)
                SELECT
                    v.address,
                    v.contract,
                    to_timestamp(v.ts / 1000.0)::date,
                    SUM(v.delta::NUMERIC),
                    MAX(v.version)
                FROM (
            "};

            QueryBuilder::new(query)
                .push_values(flows, |mut q, flow| {
                    q.push_bind(flow.address.as_str())
                        .push_bind(flow.contract.as_str())
                        .push_bind(&flow.delta)
                        .push_bind(flow.timestamp as i64)
                        .push_bind(flow.version as i64);
                })
                .push(indoc! {"
                    ) AS v(address, contract, delta, ts, version)
                    GROUP BY v.address, v.contract, to_timestamp(v.ts / 1000.0)::date
                    ON CONFLICT (address, contract, day) DO UPDATE
                    SET net_change = d.net_change + EXCLUDED.net_change,
                        version = EXCLUDED.version
                    WHERE d.version < EXCLUDED.version
                "})
                .build()
                .execute(&mut **tx)
                .await?;
        }
    }

    Ok(())
}

impl LeaseStore for PostgresStorage {
    #[trace]
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Lease>, LeaseError> {
        let mut tx = self.pool.begin().await?;

        // Prefer an existing open lease; SKIP LOCKED keeps racing claimants apart.
        let order = match request.direction {
            Direction::Forward => "ASC",
            Direction::Backward => "DESC",
        };
        let query = format!(
            "SELECT id, range_from, range_to, attempts \
             FROM coord.leases \
             WHERE worker_name = $1 AND state = 'open' \
             ORDER BY range_from {order} \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        );

        if let Some(row) = sqlx::query(&query)
            .bind(&request.worker_name)
            .fetch_optional(&mut *tx)
            .await?
        {
            let id = row.try_get::<i64, _>("id").map_err(LeaseError::from)?;
            let range_from = row
                .try_get::<i64, _>("range_from")
                .map_err(LeaseError::from)?;
            let range_to = row.try_get::<i64, _>("range_to").map_err(LeaseError::from)?;
            let attempts = row.try_get::<i32, _>("attempts").map_err(LeaseError::from)?;

            let query = indoc! {"
                UPDATE coord.leases
                SET state = 'held',
                    holder_id = $2,
                    expires_at = now() + make_interval(secs => $3)
                WHERE id = $1
            "};
            sqlx::query(query)
                .bind(id)
                .bind(request.holder_id)
                .bind(request.lease_ttl.as_secs_f64())
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            return Ok(Some(Lease {
                id,
                worker_name: request.worker_name.clone(),
                range: BlockRange::new(range_from as u64, range_to as u64),
                state: LeaseState::Held,
                holder_id: request.holder_id,
                attempts: attempts as u32,
            }));
        }

        // Nothing open: mint past the checkpoint and the furthest minted boundary.
        let checkpoint = sqlx::query_as::<_, (i64,)>(
            "SELECT height FROM coord.checkpoints WHERE worker_name = $1",
        )
        .bind(&request.worker_name)
        .fetch_optional(&mut *tx)
        .await?
        .map(|(height,)| height as u64);

        let edge_expr = match request.direction {
            Direction::Forward => "MAX(range_to)",
            Direction::Backward => "MIN(range_from)",
        };
        let query =
            format!("SELECT {edge_expr} FROM coord.leases WHERE worker_name = $1");
        let minted_edge = sqlx::query_as::<_, (Option<i64>,)>(&query)
            .bind(&request.worker_name)
            .fetch_one(&mut *tx)
            .await?
            .0
            .map(|edge| edge as u64);

        let Some(range) = request.mint_range(checkpoint, minted_edge) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let query = indoc! {"
            INSERT INTO coord.leases (
                worker_name,
                range_from,
                range_to,
                state,
                holder_id,
                expires_at
            )
            VALUES ($1, $2, $3, 'held', $4, now() + make_interval(secs => $5))
            ON CONFLICT (worker_name, range_from, range_to) DO NOTHING
            RETURNING id
        "};

        let minted = sqlx::query(query)
            .bind(&request.worker_name)
            .bind(range.from as i64)
            .bind(range.to as i64)
            .bind(request.holder_id)
            .bind(request.lease_ttl.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        // A lost mint race is a lost claim; the caller retries with backoff.
        Ok(minted
            .map(|row| {
                let id = row.try_get::<i64, _>("id")?;
                Ok::<_, sqlx::Error>(Lease {
                    id,
                    worker_name: request.worker_name.clone(),
                    range,
                    state: LeaseState::Held,
                    holder_id: request.holder_id,
                    attempts: 0,
                })
            })
            .transpose()?)
    }

    #[trace]
    async fn renew(&self, lease: &Lease, ttl: std::time::Duration) -> Result<(), LeaseError> {
        let query = indoc! {"
            UPDATE coord.leases
            SET expires_at = now() + make_interval(secs => $3)
            WHERE id = $1 AND holder_id = $2 AND state = 'held'
        "};

        let result = sqlx::query(query)
            .bind(lease.id)
            .bind(lease.holder_id)
            .bind(ttl.as_secs_f64())
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            });
        }

        Ok(())
    }

    #[trace]
    async fn complete(&self, lease: &Lease, direction: Direction) -> Result<(), LeaseError> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            UPDATE coord.leases
            SET state = 'done', expires_at = NULL
            WHERE id = $1 AND holder_id = $2 AND state = 'held'
        "};

        let result = sqlx::query(query)
            .bind(lease.id)
            .bind(lease.holder_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            });
        }

        let update = CheckpointUpdate::for_range(lease.worker_name.clone(), direction, lease.range);
        apply_checkpoint(&update, &mut tx).await?;

        tx.commit().await?;
        Ok(())
    }

    #[trace]
    async fn fail(&self, lease: &Lease, max_attempts: u32) -> Result<LeaseState, LeaseError> {
        let query = indoc! {"
            UPDATE coord.leases
            SET attempts = attempts + 1,
                holder_id = NULL,
                expires_at = NULL,
                state = CASE WHEN attempts + 1 >= $3 THEN 'dead' ELSE 'open' END
            WHERE id = $1 AND holder_id = $2 AND state = 'held'
            RETURNING state
        "};

        let row = sqlx::query(query)
            .bind(lease.id)
            .bind(lease.holder_id)
            .bind(max_attempts as i32)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or(LeaseError::HolderMismatch {
                lease_id: lease.id,
                holder_id: lease.holder_id,
            })?;

        let state = row.try_get::<String, _>("state").map_err(LeaseError::from)?;
        LeaseState::parse(&state)
            .ok_or_else(|| sqlx::Error::Decode(format!("unknown lease state {state}").into()).into())
    }

    #[trace]
    async fn reclaim_expired(&self) -> Result<u64, LeaseError> {
        let query = indoc! {"
            UPDATE coord.leases
            SET state = 'open', holder_id = NULL, expires_at = NULL
            WHERE state = 'held' AND expires_at < now()
        "};

        let result = sqlx::query(query).execute(&*self.pool).await?;
        Ok(result.rows_affected())
    }
}

impl JobStore for PostgresStorage {
    #[trace]
    async fn enqueue(
        &self,
        queue: &str,
        job_id: &str,
        payload: &serde_json::Value,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO coord.job_leases (queue, job_id, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (queue, job_id) DO NOTHING
        "};

        sqlx::query(query)
            .bind(queue)
            .bind(job_id)
            .bind(payload)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn claim_next(&self, claim: &JobClaim) -> Result<Option<Job>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let query = indoc! {"
            SELECT id, job_id, payload, attempts
            FROM coord.job_leases
            WHERE queue = $1 AND state = 'open'
            ORDER BY id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        "};

        let Some(row) = sqlx::query(query)
            .bind(&claim.queue)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.rollback().await?;
            return Ok(None);
        };

        let id = row.try_get::<i64, _>("id")?;
        let job_id = row.try_get::<String, _>("job_id")?;
        let payload = row
            .try_get::<Option<serde_json::Value>, _>("payload")?
            .unwrap_or_default();
        let attempts = row.try_get::<i32, _>("attempts")?;

        let query = indoc! {"
            UPDATE coord.job_leases
            SET state = 'held',
                holder_id = $2,
                expires_at = now() + make_interval(secs => $3)
            WHERE id = $1
        "};
        sqlx::query(query)
            .bind(id)
            .bind(claim.holder_id)
            .bind(claim.lease_ttl.as_secs_f64())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(Job {
            id,
            queue: claim.queue.clone(),
            job_id,
            payload,
            attempts: attempts as u32,
        }))
    }

    #[trace]
    async fn complete(&self, job: &Job, holder_id: Uuid) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE coord.job_leases
            SET state = 'done', expires_at = NULL
            WHERE id = $1 AND holder_id = $2 AND state = 'held'
        "};

        sqlx::query(query)
            .bind(job.id)
            .bind(holder_id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn fail(
        &self,
        job: &Job,
        holder_id: Uuid,
        max_attempts: u32,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            UPDATE coord.job_leases
            SET attempts = attempts + 1,
                holder_id = NULL,
                expires_at = NULL,
                state = CASE WHEN attempts + 1 >= $3 THEN 'dead' ELSE 'open' END
            WHERE id = $1 AND holder_id = $2 AND state = 'held'
        "};

        sqlx::query(query)
            .bind(job.id)
            .bind(holder_id)
            .bind(max_attempts as i32)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn reclaim_expired(&self) -> Result<u64, sqlx::Error> {
        let query = indoc! {"
            UPDATE coord.job_leases
            SET state = 'open', holder_id = NULL, expires_at = NULL
            WHERE state = 'held' AND expires_at < now()
        "};

        let result = sqlx::query(query).execute(&*self.pool).await?;
        Ok(result.rows_affected())
    }
}

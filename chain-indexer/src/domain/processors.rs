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

//! The derivation stages. Phase 1 reads raw rows, phase 2 reads the token processor's
//! output; each stage writes exactly one derived table.

mod accounts;
mod contracts;
mod daily_balances;
mod defi;
mod evm;
mod ft_holdings;
mod nft_ownership;
mod staking;
mod token;
mod tx_metrics;

pub use accounts::AccountsProcessor;
pub use contracts::ContractsProcessor;
pub use daily_balances::DailyBalancesProcessor;
pub use defi::DefiProcessor;
pub use evm::EvmProcessor;
pub use ft_holdings::FtHoldingsProcessor;
pub use nft_ownership::NftOwnershipProcessor;
pub use staking::StakingProcessor;
pub use token::TokenProcessor;
pub use tx_metrics::TxMetricsProcessor;

/// Phase-1 processor names; independent of each other.
pub const PHASE_1: &[&str] = &[
    "token",
    "evm",
    "contracts",
    "accounts",
    "tx_metrics",
    "staking",
    "defi",
];

/// Phase-2 processor names; each depends on phase-1 `token` output.
pub const PHASE_2: &[&str] = &["ft_holdings", "nft_ownership", "daily_balances"];

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

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// The forward (tip-following) raw ingester.
pub const MAIN_INGESTER: &str = "main_ingester";

/// Reserved checkpoint name under which the forward ingester records the last observed
/// node tip; lets other processes see the tip without node access.
pub const CHAIN_TIP: &str = "chain_tip";

/// Prefix of the history (backfilling) raw ingester instances, e.g. `history_s1`.
pub const HISTORY_PREFIX: &str = "history_";

/// Worker name of a history ingester instance bounded to one spork window.
pub fn history_worker(slot: usize) -> String {
    format!("{HISTORY_PREFIX}s{slot}")
}

/// Worker name of the backward ("history") instance of a deriver.
pub fn history_deriver(processor: &str) -> String {
    format!("{processor}_history")
}

/// Which way a worker walks the block space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Backward => write!(f, "backward"),
        }
    }
}

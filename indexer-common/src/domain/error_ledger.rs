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

/// Classification of an indexing failure; its stable string form is the `error_hash` column
/// of the error ledger, which repair tooling groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FetchFailed,
    NilBlock,
    SaveFailed,
    EmptyBlockWithCollections,
    BlockTxCountMismatch,
    DecodeFailed,
}

impl ErrorKind {
    pub fn hash(&self) -> &'static str {
        match self {
            ErrorKind::FetchFailed => "fetch_failed",
            ErrorKind::NilBlock => "nil_block",
            ErrorKind::SaveFailed => "save_failed",
            ErrorKind::EmptyBlockWithCollections => "empty_block_with_collections",
            ErrorKind::BlockTxCountMismatch => "block_tx_count_mismatch",
            ErrorKind::DecodeFailed => "decode_failed",
        }
    }

    /// Whether a range observing this error may still complete. Transient failures must fail
    /// the lease instead.
    pub fn is_structural(&self) -> bool {
        !matches!(self, ErrorKind::FetchFailed | ErrorKind::SaveFailed)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash())
    }
}

/// A new entry for the append-only error ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIndexingError {
    pub worker_name: String,
    pub block_height: u64,
    pub kind: ErrorKind,
    pub message: String,
}

impl NewIndexingError {
    pub fn new(
        worker_name: impl Into<String>,
        block_height: u64,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            block_height,
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_hashes() {
        assert_eq!(ErrorKind::NilBlock.hash(), "nil_block");
        assert_eq!(
            ErrorKind::EmptyBlockWithCollections.hash(),
            "empty_block_with_collections"
        );
        assert!(ErrorKind::NilBlock.is_structural());
        assert!(!ErrorKind::FetchFailed.is_structural());
    }
}

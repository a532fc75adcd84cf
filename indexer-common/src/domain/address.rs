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

/// Canonical hex length of a native (8-byte) address.
const NATIVE_LEN: usize = 16;

/// Canonical hex length of an EVM-compatible (20-byte) address.
const EVM_LEN: usize = 40;

/// A chain address in canonical form: lowercase hex, no `0x` prefix, left-padded with zeros
/// to 16 chars (native) or 40 chars (EVM-compatible). The empty address stays empty; it marks
/// a missing side of a transfer (mint or burn).
#[derive(
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::AsRef,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Normalize a raw address string into canonical form.
    pub fn normalize(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        let hex = lower.strip_prefix("0x").unwrap_or(&lower);

        if hex.is_empty() {
            return Self(String::new());
        }

        let target = if hex.len() <= NATIVE_LEN {
            NATIVE_LEN
        } else {
            EVM_LEN
        };
        let mut canonical = String::with_capacity(target);
        for _ in hex.len()..target {
            canonical.push('0');
        }
        canonical.push_str(hex);

        Self(canonical)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_native() {
        assert_eq!(
            Address::normalize("0xABC").as_str(),
            "0000000000000abc",
            "lowercased, unprefixed, left-padded to 16"
        );
        assert_eq!(
            Address::normalize("7e60df042a9c0868").as_str(),
            "7e60df042a9c0868"
        );
    }

    #[test]
    fn test_normalize_evm() {
        let evm = "0x00000000000000000000000212Ed17C2a6DE18F1";
        assert_eq!(Address::normalize(evm).as_str().len(), 40);
        assert!(Address::normalize(evm).as_str().ends_with("12ed17c2a6de18f1"));
    }

    #[test]
    fn test_empty_stays_empty() {
        assert!(Address::normalize("").is_empty());
        assert!(Address::normalize("0x").is_empty());
    }
}

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

mod address;
mod bytes;
mod error_ledger;
mod ranges;
mod worker;

pub use address::*;
pub use bytes::*;
pub use error_ledger::*;
pub use ranges::*;
pub use worker::*;

pub type BlockHash = ByteArray<32>;
pub type TransactionHash = ByteArray<32>;

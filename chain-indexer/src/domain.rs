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

pub mod cadence;
pub mod derive;
pub mod ingest;
pub mod lease;
pub mod node;
pub mod processor;
pub mod processors;
pub mod queue;
pub mod storage;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

mod block;

pub use block::*;

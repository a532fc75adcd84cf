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

use crate::domain::storage::{CheckpointRow, DoneRange, Totals};
use indexer_common::domain::{
    CHAIN_TIP, Direction, HISTORY_PREFIX, MAIN_INGESTER, covered_measure, merge_ranges,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

/// Sliding-window speed estimation over checkpoint samples. Backward workers walk down, so
/// their speed is the height descended per second.
#[derive(Debug)]
pub struct SpeedTracker {
    window: Duration,
    samples: BTreeMap<String, VecDeque<(Instant, u64)>>,
}

impl SpeedTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, worker_name: &str, height: u64, at: Instant) {
        let samples = self.samples.entry(worker_name.to_string()).or_default();
        samples.push_back((at, height));

        while samples
            .front()
            .is_some_and(|(t, _)| at.duration_since(*t) > self.window)
        {
            samples.pop_front();
        }
    }

    /// Blocks per second over the window, or `None` without enough samples.
    pub fn speed(&self, worker_name: &str, direction: Direction) -> Option<f64> {
        let samples = self.samples.get(worker_name)?;
        let (oldest_at, oldest_height) = samples.front()?;
        let (newest_at, newest_height) = samples.back()?;

        let elapsed = newest_at.duration_since(*oldest_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let blocks = match direction {
            Direction::Forward => newest_height.saturating_sub(*oldest_height),
            Direction::Backward => oldest_height.saturating_sub(*newest_height),
        };

        Some(blocks as f64 / elapsed)
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HeightRangeJson {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub unresolved_errors: u64,
    pub dead_leases: u64,
    pub errors_by_worker: BTreeMap<String, u64>,
    pub dead_leases_by_worker: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSettings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,
}

/// The live progress document served as `/status` and pushed over `/ws/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub start_height: u64,
    pub indexed_height: u64,
    pub latest_height: u64,
    pub min_height: u64,
    pub history_height: u64,
    pub forward_enabled: bool,
    pub history_enabled: bool,
    pub checkpoints: BTreeMap<String, u64>,
    pub checkpoint_timestamps: BTreeMap<String, String>,
    pub worker_enabled: BTreeMap<String, bool>,
    pub worker_config: BTreeMap<String, WorkerSettings>,
    pub indexed_ranges: Vec<HeightRangeJson>,
    pub forward_progress_percent: f64,
    pub history_progress_percent: f64,
    pub blocks_per_second: BTreeMap<String, f64>,
    pub eta_seconds: BTreeMap<String, u64>,
    pub total_blocks: u64,
    pub total_transactions: u64,
    pub total_events: u64,
    pub total_contracts: u64,
    pub total_addresses: u64,
    pub error_summary: ErrorSummary,
    pub generated_at: String,
}

impl StatusReport {
    /// Whether two reports differ in anything beyond clocks and instant speeds; only
    /// material changes are pushed to status subscribers.
    pub fn material_eq(&self, other: &Self) -> bool {
        self.indexed_height == other.indexed_height
            && self.latest_height == other.latest_height
            && self.min_height == other.min_height
            && self.history_height == other.history_height
            && self.checkpoints == other.checkpoints
            && self.indexed_ranges == other.indexed_ranges
            && self.total_blocks == other.total_blocks
            && self.total_transactions == other.total_transactions
            && self.total_events == other.total_events
            && self.total_contracts == other.total_contracts
            && self.total_addresses == other.total_addresses
            && self.error_summary == other.error_summary
    }
}

/// Everything the aggregation needs besides the speed tracker.
#[derive(Debug, Clone, Default)]
pub struct StatusInputs {
    pub start_height: u64,
    pub forward_enabled: bool,
    pub history_enabled: bool,
    pub worker_enabled: BTreeMap<String, bool>,
    pub worker_config: BTreeMap<String, WorkerSettings>,
    pub checkpoints: Vec<CheckpointRow>,
    pub raw_done_ranges: Vec<DoneRange>,
    pub totals: Totals,
    pub unresolved_errors: Vec<(String, u64)>,
    pub dead_leases: Vec<(String, u64)>,
    pub generated_at: String,
}

fn direction_of(worker_name: &str) -> Direction {
    if worker_name.starts_with(HISTORY_PREFIX) || worker_name.ends_with("_history") {
        Direction::Backward
    } else {
        Direction::Forward
    }
}

/// Compute the status document from one round of store reads.
pub fn build_report(inputs: StatusInputs, speeds: &SpeedTracker) -> StatusReport {
    let StatusInputs {
        start_height,
        forward_enabled,
        history_enabled,
        worker_enabled,
        worker_config,
        checkpoints,
        raw_done_ranges,
        totals,
        unresolved_errors,
        dead_leases,
        generated_at,
    } = inputs;

    let checkpoint_heights = checkpoints
        .iter()
        .map(|row| (row.worker_name.clone(), row.height))
        .collect::<BTreeMap<_, _>>();
    let checkpoint_timestamps = checkpoints
        .iter()
        .map(|row| (row.worker_name.clone(), row.updated_at.clone()))
        .collect::<BTreeMap<_, _>>();

    let indexed_height = checkpoint_heights.get(MAIN_INGESTER).copied().unwrap_or(0);
    let latest_height = checkpoint_heights
        .get(CHAIN_TIP)
        .copied()
        .unwrap_or(indexed_height);

    // The history frontier is the lowest height any history worker reached.
    let history_height = checkpoint_heights
        .iter()
        .filter(|(worker, _)| worker.starts_with(HISTORY_PREFIX))
        .map(|(_, height)| *height)
        .min()
        .unwrap_or(start_height);

    let merged = merge_ranges(
        raw_done_ranges
            .iter()
            .map(|range| (range.from, range.to))
            .collect(),
    );
    let min_height = merged.first().map(|(from, _)| *from).unwrap_or(indexed_height);
    let indexed_ranges = merged
        .iter()
        .map(|&(from, to)| HeightRangeJson { from, to })
        .collect::<Vec<_>>();

    let forward_progress_percent = if latest_height > start_height {
        let done = indexed_height.saturating_sub(start_height) as f64;
        (done / (latest_height - start_height) as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        100.0
    };

    let covered_blocks = covered_measure(
        raw_done_ranges
            .iter()
            .filter(|range| range.to <= start_height.max(1))
            .map(|range| (range.from, range.to))
            .collect(),
    );
    let history_progress_percent = if latest_height > 0 {
        (covered_blocks as f64 / latest_height as f64 * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };

    let mut blocks_per_second = BTreeMap::new();
    let mut eta_seconds = BTreeMap::new();
    for (worker, height) in &checkpoint_heights {
        if worker == CHAIN_TIP {
            continue;
        }

        let direction = direction_of(worker);
        let Some(speed) = speeds.speed(worker, direction) else {
            continue;
        };
        blocks_per_second.insert(worker.clone(), speed);

        let remaining = match direction {
            Direction::Forward => latest_height.saturating_sub(*height),
            Direction::Backward => *height,
        };
        if speed > 0.0 {
            eta_seconds.insert(worker.clone(), (remaining as f64 / speed) as u64);
        }
    }

    let error_summary = ErrorSummary {
        unresolved_errors: unresolved_errors.iter().map(|(_, count)| count).sum(),
        dead_leases: dead_leases.iter().map(|(_, count)| count).sum(),
        errors_by_worker: unresolved_errors.into_iter().collect(),
        dead_leases_by_worker: dead_leases.into_iter().collect(),
    };

    StatusReport {
        start_height,
        indexed_height,
        latest_height,
        min_height,
        history_height,
        forward_enabled,
        history_enabled,
        checkpoints: checkpoint_heights,
        checkpoint_timestamps,
        worker_enabled,
        worker_config,
        indexed_ranges,
        forward_progress_percent,
        history_progress_percent,
        blocks_per_second,
        eta_seconds,
        total_blocks: totals.blocks,
        total_transactions: totals.transactions,
        total_events: totals.events,
        total_contracts: totals.contracts,
        total_addresses: totals.addresses,
        error_summary,
        generated_at,
    }
}

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

//! Half-open `[from, to)` height interval arithmetic, used for covered-range bookkeeping.

/// Merge overlapping and adjacent intervals into a sorted disjoint set.
pub fn merge_ranges(mut ranges: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    ranges.retain(|(from, to)| from < to);
    ranges.sort_unstable();

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (from, to) in ranges {
        match merged.last_mut() {
            Some((_, last_to)) if from <= *last_to => *last_to = (*last_to).max(to),
            _ => merged.push((from, to)),
        }
    }

    merged
}

/// The total number of heights covered by the (not necessarily disjoint) intervals.
pub fn covered_measure(ranges: Vec<(u64, u64)>) -> u64 {
    merge_ranges(ranges)
        .into_iter()
        .map(|(from, to)| to - from)
        .sum()
}

/// The lowest height `h` such that `[h, anchor)` is fully covered; `anchor` itself when
/// nothing below it is covered.
pub fn covered_floor(ranges: Vec<(u64, u64)>, anchor: u64) -> u64 {
    let merged = merge_ranges(ranges);

    let mut floor = anchor;
    for (from, to) in merged.into_iter().rev() {
        if to >= floor && from < floor {
            floor = from;
        }
    }

    floor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_ranges() {
        assert_eq!(
            merge_ranges(vec![(10, 20), (0, 5), (18, 30), (30, 35)]),
            vec![(0, 5), (10, 35)]
        );
        assert_eq!(merge_ranges(vec![(7, 7)]), vec![]);
    }

    #[test]
    fn test_covered_measure() {
        assert_eq!(covered_measure(vec![(0, 10), (5, 15), (20, 25)]), 20);
    }

    #[test]
    fn test_covered_floor() {
        // Contiguous coverage below the anchor.
        assert_eq!(covered_floor(vec![(80, 90), (90, 100)], 100), 80);

        // A gap stops the walk.
        assert_eq!(covered_floor(vec![(50, 60), (70, 100)], 100), 70);

        // Nothing covered below the anchor.
        assert_eq!(covered_floor(vec![(200, 300)], 100), 100);
    }
}

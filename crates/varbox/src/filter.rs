// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Approximate read/write footprints for conflict detection. A filter is one
//! to two orders of magnitude smaller than the key set it stands in for; the
//! price is false-positive conflicts (spurious retries), never missed ones.

pub(crate) const FILTER_PROBES: u32 = 7;
const FILTER_WORDS: usize = 64;
const FILTER_BITS: u32 = (FILTER_WORDS as u32) * 64;

/// 4096-bit probabilistic set over variable identities, with a 64-bit
/// summary (one bit per word) kept as an O(1) intersection pre-filter.
///
/// Each key sets [`FILTER_PROBES`] bits at `base + i * step` for probe index
/// `i`, with the step forced odd: an odd stride is invertible mod 4096, so
/// one key's probes land on pairwise-distinct bits and two filters sharing a
/// key always share at least `FILTER_PROBES` set bits. That is what makes the
/// popcount short-circuit in [`might_intersect`](Self::might_intersect) sound.
#[derive(Clone)]
pub(crate) struct ConflictFilter {
    words: [u64; FILTER_WORDS],
    summary: u64,
}

impl ConflictFilter {
    pub(crate) fn new() -> Self {
        Self {
            words: [0; FILTER_WORDS],
            summary: 0,
        }
    }

    fn probe(key: u64, i: u32) -> usize {
        let base = key as u32;
        let step = (key >> 32) as u32 | 1;
        (base.wrapping_add(i.wrapping_mul(step)) & (FILTER_BITS - 1)) as usize
    }

    pub(crate) fn insert(&mut self, key: u64) {
        for i in 1..=FILTER_PROBES {
            let bit = Self::probe(key, i);
            let word = bit >> 6;
            self.words[word] |= 1 << (bit & 63);
            self.summary |= 1 << word;
        }
    }

    /// Nothing was ever inserted. An empty write filter is how a pure-read
    /// transaction skips validation entirely.
    pub(crate) fn is_empty(&self) -> bool {
        self.summary == 0
    }

    /// Could the key sets behind these two filters overlap? Summaries first,
    /// then a popcount scan that declares intersection once the running count
    /// reaches the probe count. Never a false negative.
    pub(crate) fn might_intersect(&self, other: &Self) -> bool {
        if self.summary & other.summary == 0 {
            return false;
        }
        let mut shared = 0u32;
        for (a, b) in self.words.iter().zip(other.words.iter()) {
            shared += (a & b).count_ones();
            if shared >= FILTER_PROBES {
                return true;
            }
        }
        false
    }

    pub(crate) fn clear(&mut self) {
        self.words = [0; FILTER_WORDS];
        self.summary = 0;
    }
}

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

//! The global commit history: an append-only, lock-free chain of per-commit
//! records. Validation walks it forward from a transaction's snapshot; the
//! chain prefix that no snapshot can reach anymore simply drops off the
//! `Arc` graph.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::Timestamp;
use crate::filter::ConflictFilter;

/// Progress of a record through the commit protocol. Transitions are
/// monotonic: `Valid` → `Committed` → `Finalized`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum Status {
    /// Validated and linked into the chain; write-back not yet complete.
    Valid = 0,
    /// Written back; not yet globally visible.
    Committed = 1,
    /// Globally visible. Every predecessor in commit order has finalized.
    Finalized = 2,
}

/// Metadata for one commit: its stamp, the approximate footprint of its
/// writes, and a single-assignment link to the record that extends it.
pub(crate) struct CommitRecord {
    pub(crate) stamp: Timestamp,
    write_filter: ConflictFilter,
    status: AtomicU8,
    next: OnceLock<Arc<CommitRecord>>,
}

impl CommitRecord {
    /// The pre-history record a fresh chain starts from: stamp 0, empty
    /// footprint, already finalized.
    pub(crate) fn root() -> Self {
        Self {
            stamp: Timestamp(0),
            write_filter: ConflictFilter::new(),
            status: AtomicU8::new(Status::Finalized as u8),
            next: OnceLock::new(),
        }
    }

    pub(crate) fn new(stamp: Timestamp, write_filter: ConflictFilter) -> Self {
        Self {
            stamp,
            write_filter,
            status: AtomicU8::new(Status::Valid as u8),
            next: OnceLock::new(),
        }
    }

    pub(crate) fn write_filter(&self) -> &ConflictFilter {
        &self.write_filter
    }

    pub(crate) fn next(&self) -> Option<Arc<CommitRecord>> {
        self.next.get().cloned()
    }

    /// Claim the slot after this record. Written exactly once; the loser of a
    /// race gets its record back and must re-walk from the new tail.
    pub(crate) fn link(&self, next: Arc<CommitRecord>) -> Result<(), Arc<CommitRecord>> {
        self.next.set(next)
    }

    pub(crate) fn status(&self) -> Status {
        match self.status.load(Ordering::Acquire) {
            0 => Status::Valid,
            1 => Status::Committed,
            _ => Status::Finalized,
        }
    }

    /// Move the record forward. `fetch_max` keeps the transition monotonic.
    pub(crate) fn advance(&self, status: Status) {
        self.status.fetch_max(status as u8, Ordering::AcqRel);
    }
}

impl Drop for CommitRecord {
    fn drop(&mut self) {
        // Unlink the suffix iteratively; a freed prefix of the chain would
        // otherwise drop recursively, one stack frame per record.
        let mut next = self.next.take();
        while let Some(record) = next {
            match Arc::try_unwrap(record) {
                Ok(mut owned) => next = owned.next.take(),
                // Still reachable from a snapshot or the head.
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_is_single_assignment() {
        let root = Arc::new(CommitRecord::root());
        let first = Arc::new(CommitRecord::new(Timestamp(1), ConflictFilter::new()));
        let second = Arc::new(CommitRecord::new(Timestamp(1), ConflictFilter::new()));

        assert!(root.link(first.clone()).is_ok());
        assert!(root.link(second).is_err());
        assert_eq!(root.next().unwrap().stamp, Timestamp(1));
        assert!(Arc::ptr_eq(&root.next().unwrap(), &first));
    }

    #[test]
    fn status_never_moves_backward() {
        let record = CommitRecord::new(Timestamp(1), ConflictFilter::new());
        assert_eq!(record.status(), Status::Valid);
        record.advance(Status::Committed);
        assert_eq!(record.status(), Status::Committed);
        record.advance(Status::Valid);
        assert_eq!(record.status(), Status::Committed);
        record.advance(Status::Finalized);
        assert_eq!(record.status(), Status::Finalized);
    }

    #[test]
    fn root_is_finalized_at_stamp_zero() {
        let root = CommitRecord::root();
        assert_eq!(root.stamp, Timestamp(0));
        assert_eq!(root.status(), Status::Finalized);
        assert!(root.next().is_none());
    }
}

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

//! Transactions and the optimistic commit protocol.
//!
//! A read-write transaction buffers writes privately and tracks approximate
//! read/write footprints. `validate` replays the commit history appended
//! since the transaction's snapshot against the read footprint and, if clean,
//! claims the next stamp by appending a commit record; `commit` then writes
//! the buffer back and publishes, with two cooperative ordering barriers
//! (write-back and finalization) decided by chain position, never by timing.

use std::hint;
use std::sync::Arc;
use std::thread;

use tracing::trace;

use crate::filter::ConflictFilter;
use crate::record::{CommitRecord, Status};
use crate::var::TxVar;
use crate::vb::VarBoxInner;
use crate::write_set::WriteSet;
use crate::{Error, Timestamp};

/// A transaction over the variables of one `VarBox`.
///
/// The caller drives the lifecycle: begin, work, `validate`, and on success
/// `commit`; on validation failure `reset` and `start` again from a fresh
/// snapshot, discarding everything observed in the failed attempt.
pub enum Transaction<V> {
    ReadOnly(ReadOnlyTransaction<V>),
    ReadWrite(ReadWriteTransaction<V>),
}

impl<V: Clone> Transaction<V> {
    /// Snapshot the currently published chain head. No-op if already started.
    pub fn start(&mut self) {
        match self {
            Transaction::ReadOnly(tx) => tx.start(),
            Transaction::ReadWrite(tx) => tx.start(),
        }
    }

    /// Read a variable at this transaction's snapshot. A read-write
    /// transaction sees its own pending write first.
    pub fn read(&mut self, var: &TxVar<V>) -> Result<V, Error> {
        match self {
            Transaction::ReadOnly(tx) => tx.read(var),
            Transaction::ReadWrite(tx) => tx.read(var),
        }
    }

    /// Buffer a write. Nothing is visible to anyone until commit.
    pub fn write(&mut self, var: &TxVar<V>, value: V) -> Result<(), Error> {
        match self {
            Transaction::ReadOnly(tx) => {
                tx.check_owner(var)?;
                Err(Error::ReadOnly)
            }
            Transaction::ReadWrite(tx) => tx.write(var, value),
        }
    }

    /// Read-with-intent-to-write: folds the variable into both footprints so
    /// a concurrent writer is guaranteed to conflict, without buffering a
    /// value. The read-modify-write idiom is protect, read, then write.
    pub fn protect(&mut self, var: &TxVar<V>) -> Result<(), Error> {
        match self {
            Transaction::ReadOnly(tx) => {
                tx.check_owner(var)?;
                Err(Error::ReadOnly)
            }
            Transaction::ReadWrite(tx) => tx.protect(var),
        }
    }

    /// Check the reads of this transaction against every commit appended
    /// since its snapshot, claiming a commit record on success. `false` is
    /// the expected outcome of contention, not an error: the caller must
    /// discard all work since `start` and retry from a fresh snapshot.
    /// After `true`, `commit` must follow.
    pub fn validate(&mut self) -> bool {
        match self {
            Transaction::ReadOnly(_) => true,
            Transaction::ReadWrite(tx) => tx.validate(),
        }
    }

    pub fn commit(&mut self) {
        match self {
            Transaction::ReadOnly(tx) => tx.reset(),
            Transaction::ReadWrite(tx) => tx.commit(),
        }
    }

    pub fn abort(&mut self) {
        self.reset();
    }

    /// Return the transaction to a reusable pre-start state: release the
    /// snapshot and clear footprints and buffered writes.
    pub fn reset(&mut self) {
        match self {
            Transaction::ReadOnly(tx) => tx.reset(),
            Transaction::ReadWrite(tx) => tx.reset(),
        }
    }
}

/// Fixed-snapshot reader: no footprints, no write set, validation trivially
/// succeeds. Writes and protects are refused.
pub struct ReadOnlyTransaction<V> {
    vb: Arc<VarBoxInner<V>>,
    snapshot: Option<Arc<CommitRecord>>,
}

impl<V> ReadOnlyTransaction<V> {
    pub(crate) fn new(vb: Arc<VarBoxInner<V>>) -> Self {
        Self { vb, snapshot: None }
    }

    fn start(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.vb.begin_snapshot());
        }
    }

    fn check_owner(&self, var: &TxVar<V>) -> Result<(), Error> {
        if var.owner() != self.vb.instance_id() {
            return Err(Error::ForeignInstance);
        }
        Ok(())
    }

    fn reset(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.vb.release_snapshot(snapshot.stamp);
        }
    }
}

impl<V: Clone> ReadOnlyTransaction<V> {
    fn read(&self, var: &TxVar<V>) -> Result<V, Error> {
        self.check_owner(var)?;
        let snapshot = self
            .snapshot
            .as_ref()
            .expect("read on a transaction that was never started");
        Ok(var.read_at(snapshot.stamp))
    }
}

impl<V> Drop for ReadOnlyTransaction<V> {
    fn drop(&mut self) {
        self.reset();
    }
}

/// Optimistic writer: buffers writes, tracks read/write footprints, and runs
/// the full validate/commit protocol.
pub struct ReadWriteTransaction<V> {
    vb: Arc<VarBoxInner<V>>,
    snapshot: Option<Arc<CommitRecord>>,
    read_filter: ConflictFilter,
    write_filter: ConflictFilter,
    writes: WriteSet<V>,
    /// The record claimed by a successful `validate`, consumed by `commit`.
    commit_record: Option<Arc<CommitRecord>>,
}

impl<V> ReadWriteTransaction<V> {
    pub(crate) fn new(vb: Arc<VarBoxInner<V>>) -> Self {
        Self {
            vb,
            snapshot: None,
            read_filter: ConflictFilter::new(),
            write_filter: ConflictFilter::new(),
            writes: WriteSet::new(),
            commit_record: None,
        }
    }

    fn start(&mut self) {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.vb.begin_snapshot());
        }
    }

    fn check_owner(&self, var: &TxVar<V>) -> Result<(), Error> {
        if var.owner() != self.vb.instance_id() {
            return Err(Error::ForeignInstance);
        }
        Ok(())
    }

    fn reset(&mut self) {
        // A claimed record is already linked into the chain and cannot be
        // unlinked; an abandoned one must not stay VALID or every later
        // finalization would wait on it forever. Neutralize it as an empty
        // commit. Its footprint stays in the history, which can only cause
        // spurious conflicts, never missed ones.
        if let Some(record) = self.commit_record.take() {
            record.advance(Status::Committed);
            record.advance(Status::Finalized);
        }
        if let Some(snapshot) = self.snapshot.take() {
            self.vb.release_snapshot(snapshot.stamp);
        }
        self.read_filter.clear();
        self.write_filter.clear();
        self.writes.clear();
    }
}

impl<V: Clone> ReadWriteTransaction<V> {
    fn read(&mut self, var: &TxVar<V>) -> Result<V, Error> {
        self.check_owner(var)?;
        self.read_filter.insert(var.id());
        if let Some(pending) = self.writes.lookup(var.id()) {
            return Ok(pending.clone());
        }
        let snapshot = self
            .snapshot
            .as_ref()
            .expect("read on a transaction that was never started");
        Ok(var.read_at(snapshot.stamp))
    }

    fn write(&mut self, var: &TxVar<V>, value: V) -> Result<(), Error> {
        self.check_owner(var)?;
        self.write_filter.insert(var.id());
        self.writes.insert(var.clone(), value);
        Ok(())
    }

    fn protect(&mut self, var: &TxVar<V>) -> Result<(), Error> {
        self.check_owner(var)?;
        self.write_filter.insert(var.id());
        self.read_filter.insert(var.id());
        Ok(())
    }

    fn validate(&mut self) -> bool {
        if self.write_filter.is_empty() {
            // Pure readers never conflict and claim no stamp.
            return true;
        }
        let mut tail = self
            .snapshot
            .clone()
            .expect("validate on a transaction that was never started");
        loop {
            while let Some(next) = tail.next() {
                tail = next;
                if self.read_filter.might_intersect(tail.write_filter()) {
                    return false;
                }
            }
            let record = Arc::new(CommitRecord::new(
                Timestamp(tail.stamp.0 + 1),
                self.write_filter.clone(),
            ));
            match tail.link(record.clone()) {
                Ok(()) => {
                    self.commit_record = Some(record);
                    return true;
                }
                Err(_) => {
                    // Another commit claimed the slot; everything it and any
                    // successors wrote still has to be validated against.
                    trace!("commit record append raced, revalidating from the new tail");
                }
            }
        }
    }

    fn commit(&mut self) {
        if let Some(commit_record) = self.commit_record.take() {
            let snapshot = self
                .snapshot
                .as_ref()
                .expect("commit on a transaction that was never started")
                .clone();

            // Write-back ordering barrier: a conflicting predecessor still in
            // write-back must land all of its versions before ours go in.
            // Who waits is decided by chain position, not timing; we already
            // validated past every record on this stretch.
            let mut current = snapshot.clone();
            while !Arc::ptr_eq(&current, &commit_record) {
                if current.status() == Status::Valid
                    && self.write_filter.might_intersect(current.write_filter())
                {
                    thread::yield_now();
                    continue;
                }
                current = current
                    .next()
                    .expect("commit record chain gap below a claimed record");
            }

            for (var, value) in self.writes.drain() {
                var.push_version(commit_record.stamp, value);
            }
            commit_record.advance(Status::Committed);

            // Finalization barrier: records become globally visible strictly
            // in stamp order, so an observer of the head never sees a value
            // whose causal history is incomplete.
            let mut current = snapshot;
            while !Arc::ptr_eq(&current, &commit_record) {
                if current.status() == Status::Finalized {
                    current = current
                        .next()
                        .expect("commit record chain gap below a claimed record");
                } else {
                    hint::spin_loop();
                }
            }
            self.vb.publish_head(commit_record.clone());
            commit_record.advance(Status::Finalized);
        }
        if let Some(snapshot) = self.snapshot.take() {
            self.vb.release_snapshot(snapshot.stamp);
        }
        self.read_filter.clear();
        self.write_filter.clear();
        self.writes.clear();
    }
}

impl<V> Drop for ReadWriteTransaction<V> {
    fn drop(&mut self) {
        self.reset();
    }
}

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

//! The coordinator for one transactional memory instance: the published head
//! of the commit record chain, the registry of live variables, the table of
//! active snapshots, and the background reclamation task that trims version
//! history nobody can read anymore.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::record::CommitRecord;
use crate::transaction::{ReadOnlyTransaction, ReadWriteTransaction, Transaction};
use crate::var::{TxVar, VarInner};
use crate::{Error, Timestamp};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// One transactional memory instance. Cheap to clone and share; variables
/// and transactions belong to the instance that created them.
pub struct VarBox<V> {
    inner: Arc<VarBoxInner<V>>,
}

impl<V> Clone for VarBox<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct VarBoxInner<V> {
    instance_id: u64,
    /// Always a FINALIZED record: the snapshot every new transaction takes.
    head: ArcSwap<CommitRecord>,
    /// Weakly-held live variables; dead registrations are pruned during
    /// reclamation passes.
    vars: Mutex<Vec<Weak<VarInner<V>>>>,
    /// Stamp → number of active transactions snapshotted at it. The smallest
    /// key is the reclamation watermark.
    epochs: Mutex<BTreeMap<u64, usize>>,
    reclaim_wake: flume::Sender<()>,
}

impl<V: Clone + Send + Sync + 'static> VarBox<V> {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = flume::unbounded();
        let inner = Arc::new(VarBoxInner {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            head: ArcSwap::from_pointee(CommitRecord::root()),
            vars: Mutex::new(Vec::new()),
            epochs: Mutex::new(BTreeMap::new()),
            reclaim_wake: wake_tx,
        });
        // The task holds only a weak reference; when the last handle (and
        // transaction) goes away the channel disconnects and the task exits.
        let reclaimer = Arc::downgrade(&inner);
        std::thread::Builder::new()
            .name("varbox-reclaim".to_string())
            .spawn(move || reclaim_loop(reclaimer, wake_rx))
            .expect("failed to spawn reclamation thread");
        Self { inner }
    }

    /// Create a transactional variable holding `initial` as its stamp-0
    /// version.
    pub fn new_var(&self, initial: V) -> TxVar<V> {
        let var = TxVar::new(self.inner.instance_id, initial);
        self.inner.vars.lock().push(Arc::downgrade(&var.inner));
        var
    }

    pub fn begin_read_only(&self) -> Transaction<V> {
        let mut tx = Transaction::ReadOnly(ReadOnlyTransaction::new(self.inner.clone()));
        tx.start();
        tx
    }

    pub fn begin_read_write(&self) -> Transaction<V> {
        let mut tx = Transaction::ReadWrite(ReadWriteTransaction::new(self.inner.clone()));
        tx.start();
        tx
    }

    /// The begin → body → validate → commit-or-retry loop, packaged. The body
    /// runs again from a fresh snapshot after every validation failure, so it
    /// must be free of side effects beyond the transaction itself. An `Err`
    /// from the body aborts and propagates.
    pub fn atomically<R>(
        &self,
        mut body: impl FnMut(&mut Transaction<V>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut tx = self.begin_read_write();
        loop {
            match body(&mut tx) {
                Ok(result) => {
                    if tx.validate() {
                        tx.commit();
                        return Ok(result);
                    }
                    tx.reset();
                    tx.start();
                }
                Err(e) => {
                    tx.abort();
                    return Err(e);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reclaim_now(&self) {
        self.inner.reclaim_pass();
    }

    #[cfg(test)]
    pub(crate) fn head_stamp(&self) -> Timestamp {
        self.inner.head.load().stamp
    }

    #[cfg(test)]
    pub(crate) fn registered_vars(&self) -> usize {
        self.inner.vars.lock().len()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for VarBox<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> VarBoxInner<V> {
    pub(crate) fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Snapshot the head and register its stamp. The head is loaded under the
    /// epoch lock so the watermark can never pass a snapshot that is about to
    /// register.
    pub(crate) fn begin_snapshot(&self) -> Arc<CommitRecord> {
        let mut epochs = self.epochs.lock();
        let snapshot = self.head.load_full();
        *epochs.entry(snapshot.stamp.0).or_insert(0) += 1;
        snapshot
    }

    pub(crate) fn release_snapshot(&self, stamp: Timestamp) {
        {
            let mut epochs = self.epochs.lock();
            if let Some(active) = epochs.get_mut(&stamp.0) {
                *active -= 1;
                if *active == 0 {
                    epochs.remove(&stamp.0);
                }
            }
        }
        let _ = self.reclaim_wake.send(());
    }

    pub(crate) fn publish_head(&self, record: Arc<CommitRecord>) {
        self.head.store(record);
        let _ = self.reclaim_wake.send(());
    }

    /// Oldest stamp any live transaction might still read.
    fn watermark(&self) -> Timestamp {
        let epochs = self.epochs.lock();
        match epochs.keys().next() {
            Some(&oldest) => Timestamp(oldest),
            None => self.head.load().stamp,
        }
    }

    pub(crate) fn reclaim_pass(&self) {
        let watermark = self.watermark();
        let live = {
            let mut vars = self.vars.lock();
            let mut live = Vec::with_capacity(vars.len());
            vars.retain(|weak| match weak.upgrade() {
                Some(var) => {
                    live.push(var);
                    true
                }
                None => false,
            });
            live
        };
        let mut dropped = 0;
        for var in &live {
            dropped += var.trim(watermark);
        }
        if dropped > 0 {
            debug!(watermark = watermark.0, dropped, "trimmed version history");
        }
    }
}

fn reclaim_loop<V>(vb: Weak<VarBoxInner<V>>, wake: flume::Receiver<()>) {
    while wake.recv().is_ok() {
        // Coalesce a burst of wakes into a single pass.
        while wake.try_recv().is_ok() {}
        let Some(vb) = vb.upgrade() else { break };
        vb.reclaim_pass();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomically_retries_to_success() {
        let vb = VarBox::new();
        let x = vb.new_var(0i64);
        let result = vb
            .atomically(|tx| {
                let seen = tx.read(&x)?;
                tx.write(&x, seen + 1)?;
                Ok(seen + 1)
            })
            .unwrap();
        assert_eq!(result, 1);
        assert_eq!(x.read(), 1);
    }

    #[test]
    fn atomically_propagates_body_errors() {
        let vb = VarBox::new();
        let other = VarBox::new();
        let x = vb.new_var(0i64);
        let foreign = other.new_var(0i64);

        let result = vb.atomically(|tx| {
            tx.write(&x, 9)?;
            tx.write(&foreign, 9)?;
            Ok(())
        });
        assert_eq!(result.unwrap_err(), Error::ForeignInstance);
        // The aborted attempt left nothing behind.
        assert_eq!(x.read(), 0);
    }

    #[test]
    fn dead_variables_are_pruned_from_the_registry() {
        let vb: VarBox<i64> = VarBox::new();
        let keep = vb.new_var(1);
        let drop_me = vb.new_var(2);
        let drop_me_too = vb.new_var(3);
        assert_eq!(vb.registered_vars(), 3);

        drop(drop_me);
        drop(drop_me_too);
        vb.reclaim_now();
        assert_eq!(vb.registered_vars(), 1);
        assert_eq!(keep.read(), 1);
    }

    #[test]
    fn instances_are_distinct() {
        let a: VarBox<i64> = VarBox::new();
        let b: VarBox<i64> = VarBox::new();
        assert_ne!(a.inner.instance_id, b.inner.instance_id);
        // A clone is the same instance.
        let a2 = a.clone();
        assert_eq!(a.inner.instance_id, a2.inner.instance_id);
    }
}

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

//! Optimistic, multi-version transactional memory.
//!
//! A [`VarBox`] coordinates a set of transactional variables ([`TxVar`]) read
//! and written by concurrent [`Transaction`]s. Committed transactions are
//! serializable, readers always see a consistent snapshot, and of two
//! conflicting concurrent writers exactly one fails validation and retries.
//!
//! There is no global lock. Each variable carries a newest-first chain of
//! stamped version boxes; each commit appends a record to a lock-free global
//! chain carrying an approximate (Bloom-style) footprint of its writes, and
//! new transactions validate their reads against every record appended since
//! their snapshot. A background task trims version history that no active
//! snapshot can still reach.
//!
//! The caller owns the retry loop: begin, work, `validate`, and on `false`
//! reset and start over from a fresh snapshot. [`VarBox::atomically`] packages
//! that loop for the common case.

mod filter;
mod record;
mod transaction;
mod var;
mod vb;
mod write_set;


pub use transaction::{ReadOnlyTransaction, ReadWriteTransaction, Transaction};
pub use var::TxVar;
pub use vb::VarBox;

/// Commit sequence number. Stamp 0 is the pre-history root record every
/// chain begins with; variables are born at stamp 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd)]
pub struct Timestamp(pub u64);

/// Protocol misuse, detected immediately and locally. Contention is not an
/// error; it is the `false` arm of [`Transaction::validate`].
#[derive(Debug, Clone, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("can't write in read-only transaction")]
    ReadOnly,
    #[error("variable belongs to a different transactional memory instance")]
    ForeignInstance,
}

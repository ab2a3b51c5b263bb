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

//! Single-threaded, uncontended cost of the commit protocol and of snapshot
//! reads. Does not measure contention; the concurrent tests cover behavior
//! under contention, this covers the fast path.

use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use varbox::VarBox;

fn commit_protocol(c: &mut Criterion) {
    let vb: VarBox<i64> = VarBox::new();
    let x = vb.new_var(0i64);
    c.bench_function("read_write_increment_commit", |b| {
        b.iter(|| {
            let mut tx = vb.begin_read_write();
            let seen = tx.read(&x).unwrap();
            tx.write(&x, seen + 1).unwrap();
            assert!(tx.validate());
            tx.commit();
        });
    });

    let vb: VarBox<i64> = VarBox::new();
    let vars: Vec<_> = (0..16).map(|_| vb.new_var(0i64)).collect();
    c.bench_function("commit_16_var_write_set", |b| {
        b.iter(|| {
            let mut tx = vb.begin_read_write();
            for var in &vars {
                let seen = tx.read(var).unwrap();
                tx.write(var, seen + 1).unwrap();
            }
            assert!(tx.validate());
            tx.commit();
        });
    });
}

fn snapshot_reads(c: &mut Criterion) {
    let vb: VarBox<i64> = VarBox::new();
    let x = vb.new_var(7i64);

    c.bench_function("read_only_snapshot_read", |b| {
        b.iter(|| {
            let mut tx = vb.begin_read_only();
            let value = tx.read(&x).unwrap();
            tx.commit();
            black_box(value)
        });
    });

    c.bench_function("non_transactional_read", |b| {
        b.iter(|| black_box(x.read()));
    });
}

criterion_group!(benches, commit_protocol, snapshot_reads);
criterion_main!(benches);

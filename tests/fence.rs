//! `fence` / `fence_with` drive a reader-writer lock whose shared side is
//! nothing but sequence operations, mirroring how sharded read-mostly
//! structures use the fences in practice.

mod common;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use test_log::test;
use urseq::{CpuLocal, Value};

use common::try_pin;

/// Spin-based RW lock: readers count themselves per shard inside
/// sequences; the writer flips a gate, fences the shards, and waits for
/// the counts to drain.
struct SeqRwLock {
    readers_may_begin: AtomicBool,
    reader_counts: CpuLocal<Value<i64>>,
    /// Fence only this shard on write-lock; `None` fences all shards.
    fence_shard: Option<usize>,
}

struct RacyPair(UnsafeCell<[u64; 2]>);

// Guarded by SeqRwLock.
unsafe impl Sync for RacyPair {}

impl SeqRwLock {
    fn new(fence_shard: Option<usize>) -> Self {
        Self {
            readers_may_begin: AtomicBool::new(true),
            reader_counts: CpuLocal::new(),
            fence_shard,
        }
    }

    fn lock(&self) {
        while !self.readers_may_begin.swap(false, Ordering::SeqCst) {
            std::hint::spin_loop();
        }
        // After the fence, every reader either saw the closed gate or has
        // its count visible to us.
        match self.fence_shard {
            Some(shard) => urseq::fence_with(shard),
            None => urseq::fence(),
        }
        loop {
            let sum: i64 = self
                .reader_counts
                .iter()
                .map(|count| count.load(Ordering::SeqCst))
                .sum();
            if sum == 0 {
                break;
            }
            std::hint::spin_loop();
        }
    }

    fn unlock(&self) {
        self.readers_may_begin.store(true, Ordering::SeqCst);
    }

    fn lock_shared(&self) {
        loop {
            let shard = urseq::begin();
            if !self.readers_may_begin.load(Ordering::SeqCst) {
                continue;
            }
            let count = self.reader_counts.for_cpu(shard);
            let seen = count.load(Ordering::SeqCst);
            if urseq::store(count, seen + 1) {
                return;
            }
        }
    }

    fn unlock_shared(&self) {
        loop {
            let shard = urseq::begin();
            let count = self.reader_counts.for_cpu(shard);
            let seen = count.load(Ordering::SeqCst);
            if urseq::store(count, seen - 1) {
                return;
            }
        }
    }
}

fn run_fence_test(
    num_readers: usize,
    read_locks_per_reader: usize,
    write_locks: usize,
    tie_readers_to_one_cpu: bool,
) {
    if !try_pin(0) {
        return;
    }

    let reader_cpu = if urseq::num_cpus() > 1 { 1 } else { 0 };
    if tie_readers_to_one_cpu && !try_pin(reader_cpu) {
        return;
    }

    let fence_shard = tie_readers_to_one_cpu.then_some(reader_cpu);
    let lock = Arc::new(SeqRwLock::new(fence_shard));
    let pair = Arc::new(RacyPair(UnsafeCell::new([0, 0])));

    let readers: Vec<_> = (0..num_readers)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let pair = Arc::clone(&pair);
            std::thread::spawn(move || {
                // Untied readers roam: fence() must catch them wherever the
                // scheduler put them.
                if tie_readers_to_one_cpu {
                    urseq::switch_to_cpu(reader_cpu);
                }
                for _ in 0..read_locks_per_reader {
                    lock.lock_shared();
                    let seen = unsafe { &*pair.0.get() };
                    assert_eq!(seen[0], seen[1]);
                    lock.unlock_shared();
                }
            })
        })
        .collect();

    urseq::switch_to_cpu(0);
    for _ in 0..write_locks {
        lock.lock();
        unsafe {
            let values = &mut *pair.0.get();
            assert_eq!(values[0], values[1]);
            values[0] += 1;
            values[1] += 1;
        }
        lock.unlock();
    }

    for reader in readers {
        reader.join().unwrap();
    }

    let values = unsafe { &*pair.0.get() };
    assert_eq!(values[0], write_locks as u64);
    assert_eq!(values[1], write_locks as u64);
}

#[test]
fn fence_with_orders_a_single_shard() {
    run_fence_test(4, 5_000, 20_000, true);
}

#[test]
fn fence_orders_every_shard() {
    run_fence_test(8, 2_000, 5_000, false);
}

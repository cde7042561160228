#![allow(dead_code)]

use std::sync::atomic::Ordering;

use urseq::{CpuLocal, Value};

/// One begin/load/store retry cycle adding 1 to the caller's shard counter.
pub fn increment(counters: &CpuLocal<Value<u64>>) {
    loop {
        let shard = urseq::begin();
        let counter = counters.for_cpu(shard);
        let seen = counter.load(Ordering::Relaxed);
        if urseq::store(counter, seen + 1) {
            return;
        }
    }
}

pub fn counter_sum(counters: &CpuLocal<Value<u64>>) -> u64 {
    counters.iter().map(|counter| counter.load(Ordering::SeqCst)).sum()
}

/// Whether this process is allowed to pin threads to `cpu`. Restricted
/// cpusets make affinity a fatal error, so probe on a throwaway thread.
pub fn try_pin(cpu: usize) -> bool {
    std::thread::spawn(move || {
        std::panic::catch_unwind(|| urseq::switch_to_cpu(cpu)).is_ok()
    })
    .join()
    .unwrap()
}

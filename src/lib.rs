//! # urseq
//!
//! A userspace take on the kernel's restartable-sequences idea: per-CPU
//! sharded data updated with plain loads and stores, no bus-locked
//! instructions and no barriers on the fast path. A thread brackets its
//! work with [begin], which returns a shard index; every subsequent [load],
//! [store], or [store_fence] either executes as an ordinary memory
//! operation and succeeds, or reports that the sequence was revoked and the
//! thread must retry from [begin]. Revocation happens exactly when another
//! thread may have taken ownership of the same shard in between.
//!
//! The usual consumers are per-CPU counters, allocator caches, and other
//! sharded structures that would otherwise pay for a compare-and-swap per
//! update. Replacing the CAS with a plain store is where the throughput
//! comes from.
//!
//! # Example
//!
//! A per-CPU counter incremented without atomic read-modify-writes:
//!
//! ```
//! use std::sync::atomic::Ordering;
//! use urseq::{CpuLocal, Value};
//!
//! let counters: CpuLocal<Value<u64>> = CpuLocal::new();
//! for _ in 0..1000 {
//!     loop {
//!         let shard = urseq::begin();
//!         let counter = counters.for_cpu(shard);
//!         let seen = counter.load(Ordering::Relaxed);
//!         if urseq::store(counter, seen + 1) {
//!             break;
//!         }
//!     }
//! }
//! let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
//! assert_eq!(total, 1000);
//! ```
//!
//! # Memory model
//!
//! Sequences that received the same shard index from [begin] are totally
//! ordered: the stores done inside an earlier sequence on shard `n` are
//! visible to every later sequence on shard `n`. Sequences on different
//! shards are unordered unless you use [store_fence], [fence_with], or
//! [fence]. A sequence may end at any time, even spuriously, so a reader
//! that wants a consistent view must confirm the sequence is still live
//! ([validate], or any successful operation) after its reads.
//!
//! # How revocation works
//!
//! Each thread operates through a small block of generated code it owns.
//! An evictor revokes a sequence by atomically patching the entry points of
//! the victim's block into jumps to a failure path, then making the patch
//! visible with an asymmetric fence (usually elided by consulting the
//! kernel's view of where the victim is running). The victim pays nothing
//! on its fast path; the cost all lands on the thread doing the eviction.
//!
//! # Caveats
//!
//! - x86-64 Linux only; the design leans on total-store-order and on
//!   cross-modifying a single aligned instruction word.
//! - Values are at most eight bytes.
//! - How long a sequence lasts is a quality-of-implementation matter, not
//!   an API guarantee; the library tries to keep one live until the thread
//!   is descheduled, nothing more.

#![warn(missing_debug_implementations, missing_docs)]

cfg_if::cfg_if! {
    if #[cfg(not(all(target_arch = "x86_64", target_os = "linux")))] {
        compile_error!("urseq requires x86-64 Linux: the generated code and \
                        the eviction protocol are specific to both");
    }
}

mod barrier;
mod cleanup;
mod code;
mod cpu;
mod err;
mod ids;
mod os;
mod registry;
mod seq;
mod value;

pub use cpu::{current_cpu, num_cpus, switch_to_cpu, CpuLocal};
pub use err::{
    fatal_error_handler, set_fatal_error_handler, AbortOnError, FatalError, FatalErrorHandler,
};
pub use value::{begin, end, fence, fence_with, load, store, store_fence, validate, Value};

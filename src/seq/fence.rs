//! Sequence-ordering fences.
//!
//! `fence_with(shard)` inserts a synchronization point into one shard's
//! sequence order: stores visible to sequences on that shard before the
//! point are visible to the caller afterward, and the caller's stores are
//! visible to sequences after the point. `fence()` is the same against
//! every shard, still with a single heavy barrier at the end.

use core::sync::atomic::{fence as atomic_fence, Ordering};

use crate::barrier;
use crate::cpu;
use crate::registry::ThreadControl;

use super::{ensure_thread_control, ownership};

/// Blocks the current owner of `shard` (without installing anyone in its
/// place), ending that owner's sequence once the blocking stores reach it.
fn evict_owner(me: &ThreadControl, shard_index: usize) {
    let shard = ownership().for_cpu(shard_index);
    let current = shard.load();
    if current.owner == 0 {
        return;
    }

    // SeqCst claim, then re-check: if the owner is unchanged after the
    // claim is published, the owner's teardown scan cannot have completed
    // yet, so the record stays alive while we patch it.
    me.accessing().store(current.owner, Ordering::SeqCst);
    if shard.load().owner != current.owner {
        me.accessing().store(0, Ordering::Relaxed);
        return;
    }

    let victim = unsafe { &*ThreadControl::for_id(current.owner) };
    victim.block_seq_ops();

    me.accessing().store(0, Ordering::Relaxed);
}

#[cfg_attr(feature = "tracing", tracing::instrument)]
pub(crate) fn fence_with(shard_index: usize) {
    atomic_fence(Ordering::SeqCst);
    let me = unsafe { &*ensure_thread_control() };
    evict_owner(me, shard_index);
    barrier::heavy();
}

#[cfg_attr(feature = "tracing", tracing::instrument)]
pub(crate) fn fence() {
    atomic_fence(Ordering::SeqCst);
    let me = unsafe { &*ensure_thread_control() };
    for shard_index in 0..cpu::num_cpus() {
        evict_owner(me, shard_index);
    }
    barrier::heavy();
}

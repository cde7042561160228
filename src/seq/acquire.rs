//! Shard acquisition, including eviction of the current owner.

use core::sync::atomic::Ordering;

use crate::barrier;
use crate::cpu;
use crate::registry::ThreadControl;

use super::{ownership, set_cached_cpu, OwnerAndEvictor, LAST_CPU};

/// Takes ownership of the calling thread's current CPU shard, evicting the
/// present owner if there is one, and returns the shard index.
///
/// Loops until a CAS installs us as owner. Every retry re-reads
/// `sched_getcpu`, so migration mid-protocol just moves the fight to the
/// new shard.
#[cfg_attr(feature = "tracing", tracing::instrument)]
pub(super) fn acquire_cpu_ownership(me: &ThreadControl) -> i32 {
    loop {
        let cpu = cpu::current_cpu();
        LAST_CPU.with(|cell| cell.set(cpu));
        set_cached_cpu(cpu);

        let shard = ownership().for_cpu(cpu as usize);
        let current = shard.load();

        if current.owner == 0 {
            if shard.cas(
                current,
                OwnerAndEvictor {
                    owner: me.id(),
                    evictor: 0,
                },
            ) {
                return cpu;
            }
            continue;
        }

        // Occupied. Publish a claim on the owner before taking the evictor
        // slot; from here until the claim clears, the victim's record
        // cannot be torn down under us.
        me.accessing().store(current.owner, Ordering::Relaxed);
        let contested = OwnerAndEvictor {
            owner: current.owner,
            evictor: me.id(),
        };
        if !shard.cas(current, contested) {
            me.accessing().store(0, Ordering::Relaxed);
            continue;
        }

        let victim = unsafe { &*ThreadControl::for_id(contested.owner) };
        victim.block_seq_ops(); // A

        if cpu != cpu::current_cpu() {
            // B: we were migrated after blocking. The fence-elision logic
            // below reasons about the victim through our own CPU; with the
            // co-location gone the reasoning is void, so start over.
            me.accessing().store(0, Ordering::Relaxed);
            continue;
        }

        // We wrote the blocking stores (A) and then saw ourselves still on
        // `cpu` (B), so those stores are visible to whatever runs on `cpu`
        // next. If the victim's kernel-reported CPU is `cpu`, the victim is
        // such a thread: either it already ran here (then it CASed the
        // evictor slot back to zero and our install below fails), or it has
        // not run since A and will observe the blocking stores without any
        // help. Only when the victim may be running elsewhere do we need
        // the heavy fence to push A out to it.
        if victim.cur_cpu() != cpu {
            barrier::heavy();
        }

        me.accessing().store(0, Ordering::Relaxed);

        if shard.cas(
            contested,
            OwnerAndEvictor {
                owner: me.id(),
                evictor: 0,
            },
        ) {
            return cpu;
        }
        // Someone interposed between the block and the install; the
        // evictor field in the expected word makes sure we notice.
    }
}

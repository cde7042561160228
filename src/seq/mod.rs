//! Shard ownership and the sequence lifecycle.
//!
//! One 64-bit word per CPU shard is the serialization point for the whole
//! crate. It packs `(owner_id, evictor_id)` and moves only by CAS:
//!
//! | owner | evictor | meaning                                  |
//! |-------|---------|------------------------------------------|
//! | 0     | 0       | shard free                               |
//! | O     | 0       | O owns the shard                         |
//! | O     | E       | O owns the shard, E is evicting O        |
//!
//! The evictor half exists to close an ABA hole: a victim that is blocked,
//! leaves its sequence, sees the shard freed, and reacquires it could
//! otherwise race the evictor's final install CAS. With the evictor id in
//! the word, any interposition makes that CAS fail.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::cleanup;
use crate::code::{SeqLoadFn, SeqStoreFn};
use crate::cpu::CpuLocal;
use crate::registry::ThreadControl;

mod acquire;
mod fence;

pub(crate) use fence::{fence, fence_with};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct OwnerAndEvictor {
    pub(crate) owner: u32,
    pub(crate) evictor: u32,
}

impl OwnerAndEvictor {
    pub(crate) const FREE: Self = Self { owner: 0, evictor: 0 };

    fn pack(self) -> u64 {
        (self.owner as u64) << 32 | self.evictor as u64
    }

    fn unpack(repr: u64) -> Self {
        Self {
            owner: (repr >> 32) as u32,
            evictor: repr as u32,
        }
    }
}

/// The ownership word. A plain `AtomicU64` underneath so its lock-freedom
/// does not depend on how any wrapper type gets laid out.
#[derive(Debug, Default)]
pub(crate) struct AtomicOwnerAndEvictor {
    repr: AtomicU64,
}

impl AtomicOwnerAndEvictor {
    pub(crate) fn load(&self) -> OwnerAndEvictor {
        OwnerAndEvictor::unpack(self.repr.load(Ordering::SeqCst))
    }

    pub(crate) fn cas(&self, expected: OwnerAndEvictor, desired: OwnerAndEvictor) -> bool {
        self.repr
            .compare_exchange(
                expected.pack(),
                desired.pack(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

// Never torn down: exiting threads touch it from their destructors.
static OWNERSHIP: OnceLock<CpuLocal<AtomicOwnerAndEvictor>> = OnceLock::new();

fn ownership() -> &'static CpuLocal<AtomicOwnerAndEvictor> {
    OWNERSHIP.get_or_init(CpuLocal::new)
}

unsafe extern "C" fn load_unavailable(_dst: *mut u64, _src: *const u64) -> i32 {
    1
}

unsafe extern "C" fn store_unavailable(_dst: *mut u64, _val: u64) -> i32 {
    1
}

thread_local! {
    /// The shard this thread believes it owns; -1 when it owns nothing.
    /// Its address is baked into this thread's generated failure tail and
    /// handed to evictors, so the cell must live as long as the thread.
    static CACHED_CPU: AtomicI32 = const { AtomicI32::new(-1) };

    /// The shard index of the most recent acquire, kept even after the
    /// cached CPU is cleared so `end` knows which word to release.
    static LAST_CPU: Cell<i32> = const { Cell::new(0) };

    static ME: Cell<*mut ThreadControl> = const { Cell::new(ptr::null_mut()) };

    // Entry points into this thread's generated code. Until the first
    // acquire they point at stubs that report revocation, so operations
    // issued before `begin` fail safely instead of being undefined.
    static LOAD_TRAMPOLINE: Cell<SeqLoadFn> = const { Cell::new(load_unavailable as SeqLoadFn) };
    static STORE_TRAMPOLINE: Cell<SeqStoreFn> = const { Cell::new(store_unavailable as SeqStoreFn) };
    static STORE_FENCE_TRAMPOLINE: Cell<SeqStoreFn> =
        const { Cell::new(store_unavailable as SeqStoreFn) };
}

pub(crate) fn cached_cpu_cell() -> *const AtomicI32 {
    CACHED_CPU.with(|cell| cell as *const AtomicI32)
}

#[inline]
pub(crate) fn cached_cpu() -> i32 {
    CACHED_CPU.with(|cell| cell.load(Ordering::Relaxed))
}

fn set_cached_cpu(cpu: i32) {
    CACHED_CPU.with(|cell| cell.store(cpu, Ordering::Relaxed));
}

#[inline]
pub(crate) fn load_trampoline() -> SeqLoadFn {
    LOAD_TRAMPOLINE.with(|cell| cell.get())
}

#[inline]
pub(crate) fn store_trampoline() -> SeqStoreFn {
    STORE_TRAMPOLINE.with(|cell| cell.get())
}

#[inline]
pub(crate) fn store_fence_trampoline() -> SeqStoreFn {
    STORE_FENCE_TRAMPOLINE.with(|cell| cell.get())
}

/// The calling thread's control record, built on first use. Building it
/// also wires the trampolines and schedules exit cleanup.
fn ensure_thread_control() -> *mut ThreadControl {
    let existing = ME.with(|me| me.get());
    if !existing.is_null() {
        return existing;
    }

    let record = ThreadControl::current(cached_cpu_cell());
    ME.with(|me| me.set(record));

    let code = unsafe { (*record).code() };
    LOAD_TRAMPOLINE.with(|cell| cell.set(code.load_entry()));
    STORE_TRAMPOLINE.with(|cell| cell.set(code.store_entry()));
    STORE_FENCE_TRAMPOLINE.with(|cell| cell.set(code.store_fence_entry()));

    // Runs before the control record's own cleanup; see `cleanup`.
    cleanup::set_seq_cleanup(seq_cleanup);

    let _ = ownership();
    record
}

fn seq_cleanup() {
    release_ownership();
    // If a later TLS destructor starts another sequence, first use must
    // rebuild everything rather than trust these stale pointers.
    ME.with(|me| me.set(ptr::null_mut()));
    LOAD_TRAMPOLINE.with(|cell| cell.set(load_unavailable as SeqLoadFn));
    STORE_TRAMPOLINE.with(|cell| cell.set(store_unavailable as SeqStoreFn));
    STORE_FENCE_TRAMPOLINE.with(|cell| cell.set(store_unavailable as SeqStoreFn));
}

/// The slow half of `begin`: releases whatever was owned before, revives
/// this thread's generated code, and runs the acquisition protocol.
#[cfg_attr(feature = "tracing", tracing::instrument)]
pub(crate) fn begin_slow_path() -> i32 {
    let me = ensure_thread_control();
    release_ownership();
    unsafe {
        (*me).unblock_seq_ops();
    }
    acquire::acquire_cpu_ownership(unsafe { &*me })
}

/// Ends the calling thread's sequence, if any. Idempotent, and a no-op on
/// threads that never began one.
pub(crate) fn release_ownership() {
    set_cached_cpu(-1);
    let me = ME.with(|me| me.get());
    if me.is_null() {
        return;
    }
    let my_id = unsafe { (*me).id() };
    let shard = ownership().for_cpu(LAST_CPU.with(|cell| cell.get()) as usize);
    loop {
        let current = shard.load();
        if current.owner != my_id {
            break;
        }
        if shard.cas(current, OwnerAndEvictor::FREE) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn words_pack_and_unpack_symmetrically() {
        let cases = [
            OwnerAndEvictor::FREE,
            OwnerAndEvictor { owner: 1, evictor: 0 },
            OwnerAndEvictor { owner: 7, evictor: 9 },
            OwnerAndEvictor { owner: u32::MAX, evictor: u32::MAX },
        ];
        for case in cases {
            assert_eq!(OwnerAndEvictor::unpack(case.pack()), case);
        }
        assert_eq!(OwnerAndEvictor::FREE.pack(), 0);
    }

    #[test]
    fn cas_is_the_only_transition() {
        let word = AtomicOwnerAndEvictor::default();
        assert_eq!(word.load(), OwnerAndEvictor::FREE);

        let owned = OwnerAndEvictor { owner: 3, evictor: 0 };
        assert!(word.cas(OwnerAndEvictor::FREE, owned));
        assert!(!word.cas(OwnerAndEvictor::FREE, owned));

        let contested = OwnerAndEvictor { owner: 3, evictor: 5 };
        assert!(word.cas(owned, contested));
        assert_eq!(word.load(), contested);

        // A stale expectation must lose.
        assert!(!word.cas(owned, OwnerAndEvictor::FREE));
        assert_eq!(word.load(), contested);
    }

    #[test]
    fn release_without_begin_is_a_no_op() {
        std::thread::spawn(|| {
            release_ownership();
            release_ownership();
            assert_eq!(cached_cpu(), -1);
        })
        .join()
        .unwrap();
    }
}

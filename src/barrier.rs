//! Asymmetric thread fences.
//!
//! The heavy side makes every other running thread execute a full memory
//! barrier before it returns; the light side is free. The pairing works
//! because x86 total-store-order already gives hardware ordering on the
//! light side, so the light fence only has to stop the compiler.
//!
//! Two heavy implementations, picked once at startup:
//!
//! - `membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED)`, when the kernel
//!   supports it and registration succeeds. This is the primitive purpose-
//!   built for exactly this pattern.
//! - Flipping a private page's protection from read+write down to
//!   read-only. Dropping permissions on a dirty mapped page forces the
//!   kernel to broadcast a TLB shoot-down IPI to every CPU running this
//!   process, and interrupt entry is a full barrier.

use core::sync::atomic::{compiler_fence, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::err::{self, FatalError};
use crate::os;

// Not exposed by the libc crate; values from the kernel uapi header.
const MEMBARRIER_CMD_QUERY: libc::c_int = 0;
const MEMBARRIER_CMD_PRIVATE_EXPEDITED: libc::c_int = 1 << 3;
const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED: libc::c_int = 1 << 4;

fn membarrier(cmd: libc::c_int) -> libc::c_long {
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, 0 as libc::c_int) }
}

fn membarrier_works() -> bool {
    let supported = membarrier(MEMBARRIER_CMD_QUERY);
    if supported < 0
        || supported & MEMBARRIER_CMD_PRIVATE_EXPEDITED as libc::c_long == 0
        || supported & MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED as libc::c_long == 0
    {
        return false;
    }
    membarrier(MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED) >= 0
}

struct ProtectionFlip {
    page: *mut u8,
    page_size: usize,
    mu: Mutex<()>,
}

unsafe impl Send for ProtectionFlip {}
unsafe impl Sync for ProtectionFlip {}

impl ProtectionFlip {
    fn new() -> Self {
        let page_size = os::page_size();
        let page = os::allocate(page_size);
        // If the page were paged out between the two mprotect calls, the
        // second one would have no TLB entries to shoot down.
        unsafe {
            libc::mlock(page.cast(), page_size);
        }
        Self {
            page,
            page_size,
            mu: Mutex::new(()),
        }
    }

    fn issue(&self) {
        let _guard = self.mu.lock();
        unsafe {
            if libc::mprotect(
                self.page.cast(),
                self.page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                err::fatal(FatalError::BarrierProtectFailed);
            }

            // The page must be dirty, and mapped on this CPU, for the
            // downgrade below to broadcast.
            let word = &*(self.page as *const AtomicUsize);
            word.fetch_add(1, Ordering::SeqCst);

            if libc::mprotect(self.page.cast(), self.page_size, libc::PROT_READ) != 0 {
                err::fatal(FatalError::BarrierProtectFailed);
            }
        }
    }
}

enum Heavy {
    Membarrier,
    Mprotect(ProtectionFlip),
}

static HEAVY: OnceLock<Heavy> = OnceLock::new();

fn heavy_impl() -> &'static Heavy {
    HEAVY.get_or_init(|| {
        if membarrier_works() {
            Heavy::Membarrier
        } else {
            Heavy::Mprotect(ProtectionFlip::new())
        }
    })
}

/// The peer-side fence. Compiles to nothing: total-store-order supplies the
/// hardware ordering, this only pins the compiler's ordering.
#[inline]
pub(crate) fn light() {
    compiler_fence(Ordering::SeqCst);
}

/// On return, every other thread that existed before the call has executed
/// a full memory barrier. The caller pays the whole cost.
pub(crate) fn heavy() {
    match heavy_impl() {
        Heavy::Membarrier => {
            if membarrier(MEMBARRIER_CMD_PRIVATE_EXPEDITED) < 0 {
                err::fatal(FatalError::MembarrierFailed);
            }
        }
        Heavy::Mprotect(flip) => flip.issue(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use test_log::test;

    #[test]
    fn heavy_fence_completes() {
        for _ in 0..100 {
            heavy();
        }
    }

    #[test]
    fn protection_flip_completes_without_membarrier() {
        let flip = ProtectionFlip::new();
        for _ in 0..100 {
            flip.issue();
        }
    }

    #[test]
    fn heavy_fence_tolerates_contention() {
        let stop = Arc::new(AtomicBool::new(false));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let stop = stop.clone();
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        heavy();
                    }
                })
            })
            .collect();
        for _ in 0..200 {
            heavy();
        }
        stop.store(true, Ordering::Relaxed);
        for thread in threads {
            thread.join().unwrap();
        }
    }
}

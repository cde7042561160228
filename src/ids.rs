//! Dense thread-id allocation.
//!
//! Ids are handed out from 1 upward and recycled most-recently-freed first,
//! so the live id range stays as dense as the live thread count allows. Id
//! 0 is reserved to mean "no thread" and is what the zero-initialized
//! ownership words decode to.
//!
//! Allocation and release serialize on a mutex; the id-to-owner lookup is a
//! single wait-free atomic load, because the eviction path performs it
//! while holding nothing but its `accessing` claim on the target.

use core::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::err::{self, FatalError};
use crate::os;

/// Ceiling on live ids, taken from the kernel's thread-count limit. Both
/// the id arena and the code arena reserve this many slots.
pub(crate) const MAX_IDS: u32 = 1 << 22;

pub(crate) struct IdAllocator<T> {
    /// `max_ids + 1` entries; entry 0 is never used. Backed by a lazily
    /// committed anonymous mapping so reserving room for the kernel's
    /// thread limit costs address space, not memory.
    slots: *mut AtomicPtr<T>,
    state: Mutex<FreeList>,
    max_ids: u32,
}

struct FreeList {
    recycled: Vec<u32>,
    next_fresh: u32,
}

unsafe impl<T> Send for IdAllocator<T> {}
unsafe impl<T> Sync for IdAllocator<T> {}

impl<T> IdAllocator<T> {
    pub(crate) fn new(max_ids: u32) -> Self {
        let bytes = Self::arena_bytes(max_ids);
        Self {
            slots: os::allocate(bytes).cast(),
            state: Mutex::new(FreeList {
                recycled: Vec::new(),
                next_fresh: 1,
            }),
            max_ids,
        }
    }

    fn arena_bytes(max_ids: u32) -> usize {
        (max_ids as usize + 1) * core::mem::size_of::<AtomicPtr<T>>()
    }

    /// Reserves an id. The owner slot stays null until [bind](Self::bind),
    /// so the caller can build a record that contains its own id before
    /// other threads can look it up.
    pub(crate) fn allocate(&self) -> u32 {
        let mut state = self.state.lock();
        if let Some(id) = state.recycled.pop() {
            return id;
        }
        if state.next_fresh > self.max_ids {
            err::fatal(FatalError::ThreadIdsExhausted(self.max_ids));
        }
        let id = state.next_fresh;
        state.next_fresh += 1;
        id
    }

    /// Publishes `owner` as the record for `id`.
    pub(crate) fn bind(&self, id: u32, owner: *mut T) {
        self.slot(id).store(owner, Ordering::Release);
    }

    /// Returns `id` to the pool. The binding is cleared first so a stale
    /// lookup observes null rather than a freed record.
    pub(crate) fn free(&self, id: u32) {
        self.slot(id).store(core::ptr::null_mut(), Ordering::Release);
        self.state.lock().recycled.push(id);
    }

    /// Wait-free id-to-owner lookup. Null if `id` is unbound.
    ///
    /// The returned pointer is only safe to dereference under a liveness
    /// protocol (the eviction path's `accessing` claim); nothing here keeps
    /// the owner alive.
    pub(crate) fn lookup(&self, id: u32) -> *mut T {
        self.slot(id).load(Ordering::Acquire)
    }

    fn slot(&self, id: u32) -> &AtomicPtr<T> {
        debug_assert!(id >= 1 && id <= self.max_ids);
        unsafe { &*self.slots.add(id as usize) }
    }
}

impl<T> Drop for IdAllocator<T> {
    fn drop(&mut self) {
        os::release(self.slots.cast(), Self::arena_bytes(self.max_ids));
    }
}

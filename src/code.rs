//! Per-thread generated code.
//!
//! Every thread id owns a small executable block holding the three
//! sequence operations plus a shared failure tail. Each operation's first
//! instruction is either the real load/store (live) or a two-byte relative
//! jump into the failure tail (blocked). Because the first two bytes of
//! every entry point sit at a 16-bit-aligned address, an evictor can swap
//! "do the operation" for "jump to failure" with one aligned 16-bit store,
//! without any cooperation from the thread running the block.
//!
//! The failure tail stores -1 into the owning thread's cached-CPU cell
//! (its address is baked into a `movabs` immediate when the block is
//! initialized) and returns 1. Live entry points return 0.
//!
//! Only the owning thread ever executes its block, so self-modifying-code
//! hazards reduce to making the cross-thread patch visible, which is the
//! eviction protocol's job, not this module's.

use core::cell::UnsafeCell;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU16, Ordering};
use std::sync::OnceLock;

use crossbeam_utils::CachePadded;

use crate::ids::MAX_IDS;
use crate::os;

/// `fn(dst, src)`: copies 8 bytes from `src` to `dst` and returns 0, or
/// writes -1 to the thread's cached-CPU cell and returns 1 if blocked.
pub(crate) type SeqLoadFn = unsafe extern "C" fn(*mut u64, *const u64) -> i32;
/// `fn(dst, val)`: stores `val` to `dst` and returns 0, or writes -1 to the
/// thread's cached-CPU cell and returns 1 if blocked.
pub(crate) type SeqStoreFn = unsafe extern "C" fn(*mut u64, u64) -> i32;

const CODE_SIZE: usize = 54;

const LOAD_OFFSET: usize = 0;
const STORE_OFFSET: usize = 16;
const STORE_FENCE_OFFSET: usize = 24;
const FAILURE_OFFSET: usize = 32;
const CACHED_CPU_IMM_OFFSET: usize = 34;

#[rustfmt::skip]
const CODE_TEMPLATE: [u8; CODE_SIZE] = [
    // 8-byte load: int(dst: *mut u64, src: *const u64), SysV rdi/rsi.
    /*  0 */ 0x48, 0x8b, 0x06,             // mov (%rsi), %rax
    /*  3 */ 0x48, 0x89, 0x07,             // mov %rax, (%rdi)
    /*  6 */ 0x31, 0xc0,                   // xor %eax, %eax
    /*  8 */ 0xc3,                         // retq
    /*  9 */ 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,

    // 8-byte store: int(dst: *mut u64, val: u64).
    /* 16 */ 0x48, 0x89, 0x37,             // mov %rsi, (%rdi)
    /* 19 */ 0x31, 0xc0,                   // xor %eax, %eax
    /* 21 */ 0xc3,                         // retq
    /* 22 */ 0x00, 0x00,

    // 8-byte store-fence: the store is an exchange, which fences.
    /* 24 */ 0x48, 0x87, 0x37,             // xchg %rsi, (%rdi)
    /* 27 */ 0x31, 0xc0,                   // xor %eax, %eax
    /* 29 */ 0xc3,                         // retq
    /* 30 */ 0x00, 0x00,

    // Failure tail, shared by all three entry points. The 0x42 bytes are
    // replaced with the owning thread's cached-CPU cell address.
    /* 32 */ 0x48, 0xb8,                   // movabs $cell, %rax
    /* 34 */ 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42, 0x42,
    /* 42 */ 0xc7, 0x00, 0xff, 0xff, 0xff, 0xff, // movl $-1, (%rax)
    /* 48 */ 0xb8, 0x01, 0x00, 0x00, 0x00, // mov $1, %eax
    /* 53 */ 0xc3,                         // retq
];

const JMP_OPCODE: u16 = 0xeb;

/// The 16-bit word that turns the entry at `offset` into `jmp failure`.
const fn blocked_word(offset: usize) -> u16 {
    JMP_OPCODE | (((FAILURE_OFFSET - offset - 2) as u16) << 8)
}

const LOAD_BLOCKED: u16 = blocked_word(LOAD_OFFSET);
const STORE_BLOCKED: u16 = blocked_word(STORE_OFFSET);
const STORE_FENCE_BLOCKED: u16 = blocked_word(STORE_FENCE_OFFSET);

// First two template bytes of each entry, little-endian.
const LOAD_LIVE: u16 = 0x8b48;
const STORE_LIVE: u16 = 0x8948;
const STORE_FENCE_LIVE: u16 = 0x8748;

/// One thread's generated operations.
#[repr(transparent)]
pub(crate) struct CodeBlock {
    bytes: UnsafeCell<[u8; CODE_SIZE]>,
}

// The only mutation after initialization is the aligned 16-bit entry-word
// stores issued through `block`/`unblock`.
unsafe impl Sync for CodeBlock {}

struct CodeArena {
    base: *mut CachePadded<CodeBlock>,
}

unsafe impl Send for CodeArena {}
unsafe impl Sync for CodeArena {}

static CODE_ARENA: OnceLock<CodeArena> = OnceLock::new();

impl CodeBlock {
    /// (Re)initializes the block for `id` so its failure tail targets
    /// `cached_cpu`, and returns it with all entry points live.
    ///
    /// The arena reserves a slot for every allocatable thread id; pages
    /// are committed lazily, so the reservation costs address space only.
    pub(crate) fn for_id(id: u32, cached_cpu: *const AtomicI32) -> &'static CodeBlock {
        let arena = CODE_ARENA.get_or_init(|| {
            let bytes = (MAX_IDS as usize + 1) * mem::size_of::<CachePadded<CodeBlock>>();
            CodeArena {
                base: os::allocate_executable(bytes).cast(),
            }
        });
        // The slot is private to `id`, and `id` is only handed to one live
        // thread at a time.
        let block: &'static CodeBlock = unsafe { &**arena.base.add(id as usize) };
        unsafe {
            let dst = block.bytes.get().cast::<u8>();
            ptr::copy_nonoverlapping(CODE_TEMPLATE.as_ptr(), dst, CODE_SIZE);
            let cell_addr = cached_cpu as usize;
            ptr::copy_nonoverlapping(
                &cell_addr as *const usize as *const u8,
                dst.add(CACHED_CPU_IMM_OFFSET),
                mem::size_of::<usize>(),
            );
        }
        block
    }

    fn entry_ptr(&self, offset: usize) -> *const u8 {
        unsafe { self.bytes.get().cast::<u8>().add(offset) }
    }

    fn entry_word(&self, offset: usize) -> &AtomicU16 {
        // Entry offsets are all even, and the block itself is
        // cache-line-aligned in the arena, so the cast target is a
        // naturally aligned u16.
        unsafe { &*(self.entry_ptr(offset) as *const AtomicU16) }
    }

    pub(crate) fn load_entry(&self) -> SeqLoadFn {
        unsafe { mem::transmute(self.entry_ptr(LOAD_OFFSET)) }
    }

    pub(crate) fn store_entry(&self) -> SeqStoreFn {
        unsafe { mem::transmute(self.entry_ptr(STORE_OFFSET)) }
    }

    pub(crate) fn store_fence_entry(&self) -> SeqStoreFn {
        unsafe { mem::transmute(self.entry_ptr(STORE_FENCE_OFFSET)) }
    }

    /// Points every entry at the failure tail.
    ///
    /// No fencing here; the caller owns making these stores visible to the
    /// victim before relying on them.
    pub(crate) fn block(&self) {
        self.entry_word(LOAD_OFFSET).store(LOAD_BLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_OFFSET).store(STORE_BLOCKED, Ordering::Relaxed);
        self.entry_word(STORE_FENCE_OFFSET)
            .store(STORE_FENCE_BLOCKED, Ordering::Relaxed);
    }

    /// Restores the live encoding at every entry.
    pub(crate) fn unblock(&self) {
        self.entry_word(LOAD_OFFSET).store(LOAD_LIVE, Ordering::Relaxed);
        self.entry_word(STORE_OFFSET).store(STORE_LIVE, Ordering::Relaxed);
        self.entry_word(STORE_FENCE_OFFSET)
            .store(STORE_FENCE_LIVE, Ordering::Relaxed);
    }
}

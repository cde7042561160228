//! Anonymous-mapping wrappers.
//!
//! Everything here allocates whole private mappings straight from the
//! kernel. Pages are committed lazily, which is what lets the id and code
//! arenas reserve room for the kernel's thread-count limit without paying
//! for it up front.

use core::ptr;

use crate::err::{self, FatalError};

fn map_with_protection(bytes: usize, prot: libc::c_int) -> *mut u8 {
    let alloc = unsafe {
        libc::mmap(
            ptr::null_mut(),
            bytes,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if alloc == libc::MAP_FAILED {
        err::fatal(FatalError::MemoryAllocationFailed(bytes));
    }
    alloc.cast()
}

/// Maps `bytes` of zeroed read+write memory. Fatal on failure.
pub(crate) fn allocate(bytes: usize) -> *mut u8 {
    map_with_protection(bytes, libc::PROT_READ | libc::PROT_WRITE)
}

/// Maps `bytes` of zeroed read+write+execute memory. Fatal on failure.
pub(crate) fn allocate_executable(bytes: usize) -> *mut u8 {
    map_with_protection(
        bytes,
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    )
}

/// Unmaps a region returned by [allocate] or [allocate_executable].
/// Fatal on failure, including a misaligned `ptr`.
pub(crate) fn release(ptr: *mut u8, bytes: usize) {
    if ptr as usize & (page_size() - 1) != 0 {
        err::fatal(FatalError::MisalignedRelease);
    }
    let err = unsafe { libc::munmap(ptr.cast(), bytes) };
    if err != 0 {
        err::fatal(FatalError::MemoryReleaseFailed(bytes));
    }
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn allocations_are_zeroed_and_writable() {
        let bytes = 3 * page_size();
        let mem = allocate(bytes);
        unsafe {
            for i in (0..bytes).step_by(997) {
                assert_eq!(*mem.add(i), 0);
            }
            *mem = 0xab;
            *mem.add(bytes - 1) = 0xcd;
            assert_eq!(*mem, 0xab);
            assert_eq!(*mem.add(bytes - 1), 0xcd);
        }
        release(mem, bytes);
    }

    #[test]
    fn executable_allocations_run() {
        // x86-64: mov eax, 0x2a; ret
        const RETURN_42: [u8; 6] = [0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let bytes = page_size();
        let mem = allocate_executable(bytes);
        let out = unsafe {
            core::ptr::copy_nonoverlapping(RETURN_42.as_ptr(), mem, RETURN_42.len());
            let func: unsafe extern "C" fn() -> i32 = core::mem::transmute(mem);
            func()
        };
        assert_eq!(out, 42);
        release(mem, bytes);
    }
}

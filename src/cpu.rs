//! CPU topology queries and the per-CPU array.

use std::sync::OnceLock;

use crossbeam_utils::CachePadded;

use crate::err::{self, FatalError};

/// The number of logical CPUs, cached on first use.
///
/// `std::thread::available_parallelism` respects affinity masks and cgroup
/// quotas; shard indices come from `sched_getcpu`, which does not. We want
/// the raw online-CPU count.
pub fn num_cpus() -> usize {
    static NUM_CPUS: OnceLock<usize> = OnceLock::new();
    *NUM_CPUS.get_or_init(|| {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        n.max(1) as usize
    })
}

/// The CPU the calling thread is running on right now. Purely advisory: the
/// thread may migrate before the caller looks at the result.
pub fn current_cpu() -> i32 {
    unsafe { libc::sched_getcpu() }
}

/// Pins the calling thread to `cpu`. Fatal if the kernel refuses.
///
/// Exists for tests and benchmarks that need deterministic shard indices.
pub fn switch_to_cpu(cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let err = libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set);
        if err != 0 {
            err::fatal(FatalError::AffinityFailed);
        }
    }
}

/// The kernel task id of the calling thread.
pub(crate) fn kernel_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// A fixed array with one cache-line-isolated slot per logical CPU.
///
/// Indexed by the shard ids that [begin](crate::begin) returns. The
/// isolation matters: neighboring shards are written from different CPUs on
/// the hot path, and false sharing between them would erase the point of
/// per-CPU data.
#[derive(Debug)]
pub struct CpuLocal<T> {
    slots: Box<[CachePadded<T>]>,
}

impl<T: Default> CpuLocal<T> {
    /// One default-initialized slot per CPU.
    pub fn new() -> Self {
        Self {
            slots: (0..num_cpus()).map(|_| CachePadded::new(T::default())).collect(),
        }
    }
}

impl<T: Default> Default for CpuLocal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CpuLocal<T> {
    /// The slot for shard `cpu`. Panics if `cpu >= num_cpus()`.
    #[inline]
    pub fn for_cpu(&self, cpu: usize) -> &T {
        &self.slots[cpu]
    }

    /// Iterates the slots in shard order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().map(|padded| &**padded)
    }

    /// The number of slots, equal to [num_cpus] at construction time.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Never true in practice; present to satisfy the usual pairing.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn counts_at_least_one_cpu() {
        assert!(num_cpus() >= 1);
        assert_eq!(num_cpus(), num_cpus());
    }

    #[test]
    fn current_cpu_is_in_range() {
        let cpu = current_cpu();
        assert!(cpu >= 0);
        assert!((cpu as usize) < num_cpus());
    }

    // Restricted cpusets make affinity a fatal error; probe on a throwaway
    // thread before pinning for real.
    fn can_pin(cpu: usize) -> bool {
        std::thread::spawn(move || std::panic::catch_unwind(|| switch_to_cpu(cpu)).is_ok())
            .join()
            .unwrap()
    }

    #[test]
    fn switch_to_cpu_takes_effect() {
        if !can_pin(0) {
            return;
        }
        switch_to_cpu(0);
        assert_eq!(current_cpu(), 0);

        let last = num_cpus() - 1;
        if last > 0 && can_pin(last) {
            switch_to_cpu(last);
            assert_eq!(current_cpu() as usize, last);
        }
    }

    #[test]
    fn cpu_local_slots_do_not_share_cache_lines() {
        let local: CpuLocal<u64> = CpuLocal::new();
        assert_eq!(local.len(), num_cpus());
        if local.len() > 1 {
            let first = local.for_cpu(0) as *const u64 as usize;
            let second = local.for_cpu(1) as *const u64 as usize;
            assert!(second - first >= 64);
        }
        for slot in local.iter() {
            assert_eq!(*slot, 0);
        }
    }
}

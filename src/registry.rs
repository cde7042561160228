//! Per-thread control records.
//!
//! A `ThreadControl` names a thread by its dense id, routes eviction to its
//! generated code block, and stays alive exactly as long as some thread
//! might be reaching through it. The liveness rule is the `accessing`
//! protocol: while any other registered thread's `accessing` field holds
//! this record's id, the record's teardown waits.

use core::cell::Cell;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::OnceLock;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cleanup;
use crate::code::CodeBlock;
use crate::cpu;
use crate::ids::{IdAllocator, MAX_IDS};

static THREAD_IDS: OnceLock<IdAllocator<ThreadControl>> = OnceLock::new();

fn thread_ids() -> &'static IdAllocator<ThreadControl> {
    THREAD_IDS.get_or_init(|| IdAllocator::new(MAX_IDS))
}

struct RegisteredPtr(*mut ThreadControl);

unsafe impl Send for RegisteredPtr {}

/// Every live record, in registration order. Guarded by its mutex; the
/// critical sections are short (push, remove, one scan per teardown probe).
static REGISTRY: Mutex<Vec<RegisteredPtr>> = Mutex::new(Vec::new());

thread_local! {
    static CURRENT: Cell<*mut ThreadControl> = const { Cell::new(ptr::null_mut()) };
}

pub(crate) struct ThreadControl {
    id: u32,
    tid: libc::pid_t,
    code: &'static CodeBlock,
    /// The owning thread's cached-CPU cell. Written by evictors while they
    /// hold an `accessing` claim on this record.
    cached_cpu: *const AtomicI32,
    /// The id of the record this thread is currently reaching through, or
    /// 0. At most one claim per thread, which is all the eviction protocol
    /// ever needs.
    accessing: AtomicU32,
}

unsafe impl Send for ThreadControl {}
unsafe impl Sync for ThreadControl {}

impl fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadControl")
            .field("id", &self.id)
            .field("tid", &self.tid)
            .field("accessing", &self.accessing.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadControl {
    /// The calling thread's record, built and registered on first use.
    ///
    /// `cached_cpu` must stay valid for the rest of the thread's life; its
    /// address is baked into the generated failure tail.
    pub(crate) fn current(cached_cpu: *const AtomicI32) -> *mut ThreadControl {
        let existing = CURRENT.with(|current| current.get());
        if !existing.is_null() {
            return existing;
        }

        let ids = thread_ids();
        let id = ids.allocate();
        let code = CodeBlock::for_id(id, cached_cpu);
        let record = Box::into_raw(Box::new(ThreadControl {
            id,
            tid: cpu::kernel_tid(),
            code,
            cached_cpu,
            accessing: AtomicU32::new(0),
        }));
        ids.bind(id, record);
        REGISTRY.lock().push(RegisteredPtr(record));
        cleanup::set_control_cleanup(teardown_current);
        CURRENT.with(|current| current.set(record));
        record
    }

    /// Wait-free id lookup. The pointer is only safe to dereference while
    /// the caller's `accessing` claim (or the shard-word CAS protocol)
    /// keeps the record alive.
    pub(crate) fn for_id(id: u32) -> *mut ThreadControl {
        thread_ids().lookup(id)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn code(&self) -> &'static CodeBlock {
        self.code
    }

    pub(crate) fn accessing(&self) -> &AtomicU32 {
        &self.accessing
    }

    /// Revokes this thread's sequence: clears its cached CPU and patches
    /// every generated entry point over to the failure tail.
    ///
    /// No fencing; the caller owns making these stores visible to the
    /// victim before acting on them.
    pub(crate) fn block_seq_ops(&self) {
        unsafe {
            (*self.cached_cpu).store(-1, Ordering::Relaxed);
        }
        self.code.block();
    }

    pub(crate) fn unblock_seq_ops(&self) {
        // The cached-CPU cell is refilled at the owner's next
        // sched_getcpu, not here.
        self.code.unblock();
    }

    /// Best-effort query for the CPU this record's thread is on (or will
    /// next run on). -1 on any I/O or parse failure.
    ///
    /// One ordering guarantee, inherited from how the kernel publishes
    /// migrations: if the calling thread observed itself on CPU `c` and
    /// this then returns `c` for another thread, that thread has not yet
    /// resumed since the stores published to `c` before the observation.
    /// The eviction path uses exactly this to elide the heavy fence.
    pub(crate) fn cur_cpu(&self) -> i32 {
        let path = format!("/proc/self/task/{}/stat", self.tid);
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return -1,
        };

        // Whole file in one read so the fields are from one snapshot.
        let mut contents = [0u8; 1024];
        let mut length = None;
        for _ in 0..10 {
            match file.read(&mut contents) {
                Ok(n) => {
                    length = Some(n);
                    break;
                }
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return -1,
            }
        }
        match length {
            Some(n) => parse_stat_cpu(&contents[..n]).unwrap_or(-1),
            None => -1,
        }
    }
}

/// Extracts the processor field (field 39) from stat-file contents.
///
/// The command field can contain anything, spaces and parentheses
/// included, so field counting starts after the last ')'. Fields 3 through
/// 39 each sit behind one space delimiter, which puts the CPU number after
/// the 37th space.
fn parse_stat_cpu(contents: &[u8]) -> Option<i32> {
    const SPACES_BEFORE_CPU: usize = 37;

    let last_rparen = contents.iter().rposition(|&b| b == b')')?;
    let mut pos = last_rparen + 1;
    let mut spaces = 0;
    while pos < contents.len() && spaces < SPACES_BEFORE_CPU {
        if contents[pos] == b' ' {
            spaces += 1;
        }
        pos += 1;
    }
    if spaces < SPACES_BEFORE_CPU {
        return None;
    }

    let mut cpu: i32 = 0;
    let mut saw_digit = false;
    while pos < contents.len() {
        match contents[pos] {
            b' ' => return saw_digit.then_some(cpu),
            digit @ b'0'..=b'9' => {
                cpu = cpu.checked_mul(10)?.checked_add((digit - b'0') as i32)?;
                saw_digit = true;
            }
            _ => return None,
        }
        pos += 1;
    }
    None
}

/// Unpublishes and frees the calling thread's record. Runs from the
/// pthread destructor, after sequence cleanup.
fn teardown_current() {
    let record = CURRENT.with(|current| current.replace(ptr::null_mut()));
    if record.is_null() {
        return;
    }
    let id = unsafe { (*record).id };

    REGISTRY.lock().retain(|entry| entry.0 != record);

    // Anyone who published an `accessing` claim on us before we unlinked
    // may still be mid-eviction; wait them out. Claims are short (a code
    // patch and at most one proc-file read), so yielding covers the common
    // case and the sleep only triggers if a claimant got descheduled.
    let mut yields = 0;
    loop {
        let being_accessed = REGISTRY
            .lock()
            .iter()
            .any(|entry| unsafe { (*entry.0).accessing.load(Ordering::SeqCst) } == id);
        if !being_accessed {
            break;
        }
        if yields < 100 {
            yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    thread_ids().free(id);
    drop(unsafe { Box::from_raw(record) });
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;
    use tracing::debug;

    #[test]
    fn parses_the_processor_field() {
        let contents = b"1234 (cat) R 1 1234 1234 0 -1 4194304 90 0 0 0 0 0 0 0 \
            20 0 1 0 370431 8351744 174 18446744073709551615 1 1 0 0 0 0 0 0 0 \
            0 0 0 17 3 0 0 0 0 0 0 0 0 0 0 0 0 0";
        assert_eq!(parse_stat_cpu(contents), Some(3));
    }

    #[test]
    fn parses_despite_hostile_command_names() {
        let contents = b"1234 (tmux: server) 7 (x) S 1 1234 1234 0 -1 4194304 90 0 0 0 0 0 0 0 \
            20 0 1 0 370431 8351744 174 18446744073709551615 1 1 0 0 0 0 0 0 0 \
            0 0 0 17 12 0 0 0 0 0 0 0 0 0 0 0 0 0";
        assert_eq!(parse_stat_cpu(contents), Some(12));
    }

    #[test]
    fn rejects_malformed_contents() {
        assert_eq!(parse_stat_cpu(b""), None);
        assert_eq!(parse_stat_cpu(b"no parens here"), None);
        assert_eq!(parse_stat_cpu(b"1 (x) S 2 3"), None);
        let garbage = b"1234 (cat) R 1 1234 1234 0 -1 4194304 90 0 0 0 0 0 0 0 \
            20 0 1 0 370431 8351744 174 18446744073709551615 1 1 0 0 0 0 0 0 0 \
            0 0 0 17 banana 0 0 0 0 0 0 0 0 0 0 0 0 0";
        assert_eq!(parse_stat_cpu(garbage), None);
    }

    #[test]
    fn current_record_is_stable_and_looked_up_by_id() {
        let cell: &AtomicI32 = Box::leak(Box::new(AtomicI32::new(-1)));
        let first = ThreadControl::current(cell);
        let second = ThreadControl::current(cell);
        assert_eq!(first, second);

        let record = unsafe { &*first };
        assert_ne!(record.id(), 0);
        assert_eq!(ThreadControl::for_id(record.id()), first);
        debug!(?record, "registered");
    }

    #[test]
    fn cur_cpu_reports_a_plausible_cpu() {
        let cell: &AtomicI32 = Box::leak(Box::new(AtomicI32::new(-1)));
        let record = unsafe { &*ThreadControl::current(cell) };
        let cpu = record.cur_cpu();
        assert!(cpu >= 0, "stat parse failed for a live thread");
        assert!((cpu as usize) < cpu::num_cpus());
    }

    #[test]
    fn exited_threads_free_their_ids_for_reuse() {
        // Sequential spawn/join cycles must recycle ids rather than mint a
        // fresh one per thread. Other tests allocate concurrently, so allow
        // a little drift instead of demanding exact reuse.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..32 {
            let id = std::thread::spawn(|| {
                let cell: &AtomicI32 = Box::leak(Box::new(AtomicI32::new(-1)));
                unsafe { (*ThreadControl::current(cell)).id() }
            })
            .join()
            .unwrap();
            assert_ne!(id, 0);
            seen.insert(id);
        }
        assert!(seen.len() <= 8, "ids leaked across thread exits: {seen:?}");
    }
}

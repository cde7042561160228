use core::cell::Cell;

use displaydoc::Display;

/// An unrecoverable infrastructure failure.
///
/// These are distinct from sequence revocation, which every data-plane
/// operation reports through its return value and which callers handle by
/// retrying from [begin](crate::begin). A `FatalError` means the OS refused
/// something the library cannot run without.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FatalError {
    /// mmap of {0} bytes failed
    MemoryAllocationFailed(usize),
    /// munmap of {0} bytes failed
    MemoryReleaseFailed(usize),
    /// munmap called with a pointer that is not page-aligned
    MisalignedRelease,
    /// mprotect failed while issuing a process-wide barrier
    BarrierProtectFailed,
    /// membarrier system call failed after successful registration
    MembarrierFailed,
    /// could not register the thread-exit destructor
    DestructorRegistrationFailed,
    /// all {0} thread ids are in use
    ThreadIdsExhausted(u32),
    /// could not set this thread's CPU affinity
    AffinityFailed,
}

/// What to do with a [FatalError]. Must not return.
pub type FatalErrorHandler = fn(FatalError) -> !;

thread_local! {
    static HANDLER: Cell<FatalErrorHandler> = const { Cell::new(panic_handler as FatalErrorHandler) };
}

fn panic_handler(error: FatalError) -> ! {
    panic!("{error}");
}

fn abort_handler(error: FatalError) -> ! {
    eprintln!("urseq: {error}");
    std::process::abort();
}

/// Replaces the calling thread's fatal-error handler, returning the previous
/// one. The default handler panics.
pub fn set_fatal_error_handler(handler: FatalErrorHandler) -> FatalErrorHandler {
    HANDLER.with(|h| h.replace(handler))
}

/// The calling thread's current fatal-error handler.
pub fn fatal_error_handler() -> FatalErrorHandler {
    HANDLER.with(|h| h.get())
}

/// Routes `error` to the calling thread's handler. Never returns.
pub(crate) fn fatal(error: FatalError) -> ! {
    fatal_error_handler()(error)
}

/// While a value of this type is live, fatal errors on the owning thread
/// abort the process instead of panicking.
///
/// Intended to wrap calls made on behalf of callers that must not see an
/// unwind (foreign frames, TLS destructors). If the guard itself is dropped
/// during a panic, the process aborts: the unwind would otherwise escape
/// into frames that cannot handle it, and aborting from here keeps the
/// faulting frame at the top of the core dump.
#[derive(Debug)]
pub struct AbortOnError {
    previous: FatalErrorHandler,
}

impl AbortOnError {
    /// Installs the aborting handler until the guard drops.
    pub fn new() -> Self {
        Self {
            previous: set_fatal_error_handler(abort_handler),
        }
    }
}

impl Default for AbortOnError {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AbortOnError {
    fn drop(&mut self) {
        if std::thread::panicking() {
            eprintln!("urseq: panic escaped an abort-on-error scope");
            std::process::abort();
        }
        set_fatal_error_handler(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn loud_handler(error: FatalError) -> ! {
        panic!("loud: {error}");
    }

    #[test]
    fn handler_is_per_thread_and_replaceable() {
        let previous = set_fatal_error_handler(loud_handler);
        assert_eq!(fatal_error_handler() as usize, loud_handler as usize);

        let result = std::panic::catch_unwind(|| fatal(FatalError::BarrierProtectFailed));
        let message = *result.unwrap_err().downcast::<String>().unwrap();
        assert!(message.starts_with("loud: "), "unexpected message: {message}");

        set_fatal_error_handler(previous);
    }

    #[test]
    fn abort_guard_restores_previous_handler() {
        let previous = fatal_error_handler();
        {
            let _guard = AbortOnError::new();
            assert_ne!(fatal_error_handler() as usize, previous as usize);
        }
        assert_eq!(fatal_error_handler() as usize, previous as usize);
    }

    #[test]
    fn errors_render_their_payload() {
        let rendered = FatalError::ThreadIdsExhausted(4194304).to_string();
        assert!(rendered.contains("4194304"), "unexpected rendering: {rendered}");
    }
}

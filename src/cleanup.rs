//! Ordered per-thread teardown.
//!
//! Thread exit has to release sequence ownership before the control record
//! goes away; tearing down the record first would orphan the shard the
//! thread still owns. Both steps hang off one pthread TLS destructor:
//! sequence cleanup runs first, then control-record cleanup.
//!
//! A pthread key (rather than a Rust TLS destructor) keeps this usable from
//! inside other destructors: if some other TLS destructor starts a sequence
//! after ours already ran, re-initialization re-registers the hook and
//! pthreads runs it again.

use core::cell::Cell;
use core::ffi::c_void;
use std::sync::OnceLock;

use crate::err::{self, AbortOnError, FatalError};

static DESTRUCTOR_KEY: OnceLock<libc::pthread_key_t> = OnceLock::new();

thread_local! {
    static SEQ_CLEANUP: Cell<Option<fn()>> = const { Cell::new(None) };
    static CONTROL_CLEANUP: Cell<Option<fn()>> = const { Cell::new(None) };
    static SCHEDULED: Cell<bool> = const { Cell::new(false) };
}

unsafe extern "C" fn run_cleanups(_value: *mut c_void) {
    // A panic here would unwind into the pthreads runtime.
    let _abort_scope = AbortOnError::new();

    // Cleared first: a sequence started by a later destructor must know it
    // has to re-register.
    SCHEDULED.with(|scheduled| scheduled.set(false));

    let seq = SEQ_CLEANUP.with(|cleanup| cleanup.get());
    let control = CONTROL_CLEANUP.with(|cleanup| cleanup.get());
    if let Some(cleanup) = seq {
        cleanup();
    }
    if let Some(cleanup) = control {
        cleanup();
    }
    SEQ_CLEANUP.with(|cleanup| cleanup.set(None));
    CONTROL_CLEANUP.with(|cleanup| cleanup.set(None));
}

fn ensure_scheduled() {
    let key = DESTRUCTOR_KEY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        let errno = unsafe { libc::pthread_key_create(&mut key, Some(run_cleanups)) };
        if errno != 0 {
            err::fatal(FatalError::DestructorRegistrationFailed);
        }
        key
    });
    if !SCHEDULED.with(|scheduled| scheduled.get()) {
        // The value only exists to make pthreads call the destructor.
        unsafe {
            libc::pthread_setspecific(*key, 1 as *const c_void);
        }
        SCHEDULED.with(|scheduled| scheduled.set(true));
    }
}

/// Registers the sequence-ownership release for this thread's exit.
pub(crate) fn set_seq_cleanup(cleanup: fn()) {
    SEQ_CLEANUP.with(|slot| slot.set(Some(cleanup)));
    ensure_scheduled();
}

/// Registers the control-record teardown for this thread's exit. Runs after
/// the sequence cleanup.
pub(crate) fn set_control_cleanup(cleanup: fn()) {
    CONTROL_CLEANUP.with(|slot| slot.set(Some(cleanup)));
    ensure_scheduled();
}

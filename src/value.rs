//! The typed operation surface.
//!
//! A [Value] is the only thing sequence loads and stores can target. It is
//! always eight bytes wide underneath; narrower types are widened into the
//! representation word on the way in and narrowed back out on the way out,
//! which keeps the generated code a fixed three instructions regardless of
//! `T`.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{size_of, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::barrier;
use crate::seq;

/// An 8-byte cell holding a `T`, usable both as a plain atomic and as the
/// target of sequence operations ([load], [store], [store_fence]).
///
/// The inherent methods mirror the std atomics and are always safe; the
/// free functions are the ones that participate in sequence revocation.
pub struct Value<T> {
    repr: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: Copy> Value<T> {
    const FITS_IN_WORD: () = assert!(
        size_of::<T>() <= 8,
        "Value<T> requires T to be at most 8 bytes"
    );

    /// A cell holding `value`. Fails to compile if `T` is wider than the
    /// 8-byte representation word.
    pub fn new(value: T) -> Self {
        // Referencing the const makes oversized T a compile error rather
        // than a runtime surprise.
        #[allow(clippy::let_unit_value)]
        let () = Self::FITS_IN_WORD;
        Self {
            repr: AtomicU64::new(Self::to_repr(value)),
            _marker: PhantomData,
        }
    }

    pub(crate) fn to_repr(value: T) -> u64 {
        let mut repr = 0u64;
        unsafe {
            ptr::copy_nonoverlapping(
                &value as *const T as *const u8,
                &mut repr as *mut u64 as *mut u8,
                size_of::<T>(),
            );
        }
        repr
    }

    pub(crate) fn from_repr(repr: u64) -> T {
        let mut value = MaybeUninit::<T>::uninit();
        unsafe {
            ptr::copy_nonoverlapping(
                &repr as *const u64 as *const u8,
                value.as_mut_ptr() as *mut u8,
                size_of::<T>(),
            );
            value.assume_init()
        }
    }

    /// The address the generated code operates on.
    pub(crate) fn repr_ptr(&self) -> *mut u64 {
        self.repr.as_ptr()
    }

    /// Atomically reads the value, outside any sequence.
    pub fn load(&self, order: Ordering) -> T {
        Self::from_repr(self.repr.load(order))
    }

    /// Atomically writes the value, outside any sequence.
    pub fn store(&self, value: T, order: Ordering) {
        self.repr.store(Self::to_repr(value), order);
    }

    /// Atomically replaces the value, returning the previous one.
    pub fn swap(&self, value: T, order: Ordering) -> T {
        Self::from_repr(self.repr.swap(Self::to_repr(value), order))
    }

    /// Compare-and-exchange on the representation word.
    pub fn compare_exchange(
        &self,
        current: T,
        new: T,
        success: Ordering,
        failure: Ordering,
    ) -> Result<T, T> {
        self.repr
            .compare_exchange(Self::to_repr(current), Self::to_repr(new), success, failure)
            .map(Self::from_repr)
            .map_err(Self::from_repr)
    }
}

impl<T: Copy + Default> Default for Value<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for Value<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Value").field(&self.load(Ordering::Relaxed)).finish()
    }
}

/// Begins (or continues) a sequence and returns the shard index to use.
///
/// The fast path is one thread-local load. Any other thread that later
/// gets the same index back from `begin` is guaranteed to see all stores
/// this thread's sequence performs before it is revoked.
#[inline]
pub fn begin() -> usize {
    let cached = seq::cached_cpu();
    if cached >= 0 {
        cached as usize
    } else {
        seq::begin_slow_path() as usize
    }
}

/// Reads `src` within the current sequence.
///
/// `Some(value)` means the read happened and the sequence was still live at
/// the time of the read. `None` means the sequence was revoked at some
/// earlier point and nothing was read; retry from [begin].
#[inline]
pub fn load<T: Copy>(src: &Value<T>) -> Option<T> {
    let trampoline = seq::load_trampoline();
    let mut repr: u64 = 0;
    let failed = unsafe { trampoline(&mut repr, src.repr_ptr()) };
    barrier::light();
    (failed == 0).then(|| Value::<T>::from_repr(repr))
}

/// Stores `value` into `dst` within the current sequence, with release
/// semantics.
///
/// `true` means the store happened and the sequence was still live at the
/// time of the store. `false` means the sequence was revoked and no store
/// occurred; retry from [begin].
#[inline]
pub fn store<T: Copy>(dst: &Value<T>, value: T) -> bool {
    let trampoline = seq::store_trampoline();
    let failed = unsafe { trampoline(dst.repr_ptr(), Value::<T>::to_repr(value)) };
    barrier::light();
    failed == 0
}

/// Like [store], but the store is a fencing operation (an exchange), so it
/// is sequentially consistent with respect to other sequences.
#[inline]
pub fn store_fence<T: Copy>(dst: &Value<T>, value: T) -> bool {
    let trampoline = seq::store_fence_trampoline();
    let failed = unsafe { trampoline(dst.repr_ptr(), Value::<T>::to_repr(value)) };
    barrier::light();
    failed == 0
}

/// Reports whether the current sequence is still live, via a store into a
/// throwaway slot.
#[inline]
pub fn validate() -> bool {
    let scratch = Value::new(0u64);
    store(&scratch, 0)
}

/// Ends the current sequence.
///
/// Usually unnecessary: letting the next operation fail is cheaper. Worth
/// calling when this thread is about to sleep, or when a thread elsewhere
/// is known to want this CPU's shard.
pub fn end() {
    seq::release_ownership();
}

/// Inserts a synchronization point into `shard`'s sequence order. See the
/// crate docs for the ordering contract.
pub fn fence_with(shard: usize) {
    seq::fence_with(shard);
}

/// [fence_with] against every shard, paying for one heavy barrier total.
pub fn fence() {
    seq::fence();
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn narrow_types_round_trip_through_the_repr() {
        assert_eq!(Value::<u8>::from_repr(Value::<u8>::to_repr(0xa5)), 0xa5);
        assert_eq!(Value::<i16>::from_repr(Value::<i16>::to_repr(-2)), -2);
        assert_eq!(Value::<u32>::from_repr(Value::<u32>::to_repr(7)), 7);
        assert_eq!(
            Value::<f64>::from_repr(Value::<f64>::to_repr(2.5)),
            2.5
        );
        let value = Value::new(-3i8);
        assert_eq!(value.load(Ordering::Relaxed), -3);
    }

    #[test]
    fn acts_like_an_atomic() {
        let value = Value::new(10u32);
        assert_eq!(value.load(Ordering::Acquire), 10);
        value.store(11, Ordering::Release);
        assert_eq!(value.swap(12, Ordering::AcqRel), 11);
        assert_eq!(
            value.compare_exchange(12, 13, Ordering::AcqRel, Ordering::Acquire),
            Ok(12)
        );
        assert_eq!(
            value.compare_exchange(12, 14, Ordering::AcqRel, Ordering::Acquire),
            Err(13)
        );
    }

    #[test]
    fn operations_before_begin_fail_safely() {
        std::thread::spawn(|| {
            let value = Value::new(5u64);
            assert_eq!(load(&value), None);
            assert!(!store(&value, 6));
            assert!(!store_fence(&value, 7));
            assert!(!validate());
            assert_eq!(value.load(Ordering::Relaxed), 5);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn begin_then_operate_on_own_shard() {
        let shard = begin();
        assert!(shard < crate::num_cpus());

        let value = Value::new(1u64);
        // A live sequence may be revoked at any moment, so a failed
        // operation only means "retry"; eventually one sticks.
        loop {
            let shard_now = begin();
            assert!(shard_now < crate::num_cpus());
            if store(&value, 2) {
                break;
            }
        }
        assert_eq!(value.load(Ordering::Relaxed), 2);

        loop {
            begin();
            if let Some(seen) = load(&value) {
                assert_eq!(seen, 2);
                break;
            }
        }
        end();
    }
}

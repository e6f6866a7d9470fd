//! Paired counters: two 32-bit sub-counters overlapped on a single `u64`.
//!
//! A [`PairedCount`] carries a signed sub-counter `c1` in the high half of
//! the word and an unsigned sub-counter `c2` in the low half. The control
//! block uses one paired counter for strong references (`c2` = global
//! strong count, `c1` = outstanding holds donated by atomic cells) and one
//! for weak references.
//!
//! Keeping both halves in one word lets a single 64-bit atomic operation
//! update them together: `acquire({1,1})` converts a pre-paid hold into a
//! real reference and funds a new handle in one `fetch_add`, and the
//! release path decides destruction from one `fetch_sub`.

use crate::signal;
use core::fmt;
use core::ops::{Add, Sub};
use core::sync::atomic::{AtomicU64, Ordering};

/// A pair of sub-counters packed into one 64-bit word.
///
/// `c2` occupies the low 32 bits, `c1` the high 32 bits. Equality compares
/// the full word; the relational comparison is the conjunction over both
/// sub-counters, so it is a *partial* order ([`PartialOrd::partial_cmp`]
/// returns `None` when the fields disagree).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct PairedCount {
    bits: u64,
}

impl PairedCount {
    /// The `{0, 0}` counter.
    pub const ZERO: Self = Self::new(0, 0);

    /// Packs `c1` (high half, signed) and `c2` (low half, unsigned).
    #[inline]
    pub const fn new(c1: i32, c2: u32) -> Self {
        Self {
            bits: ((c1 as u32 as u64) << 32) | c2 as u64,
        }
    }

    /// Reinterprets a raw 64-bit word as a paired counter.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { bits }
    }

    /// Returns the raw 64-bit word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.bits
    }

    /// The signed high sub-counter.
    #[inline]
    pub const fn c1(self) -> i32 {
        (self.bits >> 32) as i32
    }

    /// The unsigned low sub-counter.
    #[inline]
    pub const fn c2(self) -> u32 {
        self.bits as u32
    }

    /// Returns the counter with `c1` replaced.
    #[inline]
    pub const fn with_c1(self, c1: i32) -> Self {
        Self::new(c1, self.c2())
    }

    /// Returns the counter with `c2` replaced.
    #[inline]
    pub const fn with_c2(self, c2: u32) -> Self {
        Self::new(self.c1(), c2)
    }

    /// `true` if both sub-counters are zero.
    #[inline]
    pub const fn is_zero(self) -> bool {
        self.bits == 0
    }
}

// Per-half arithmetic: each sub-counter wraps independently, no carry
// crosses the half boundary. The atomic fetch-ops below act on the full
// word instead.

impl Add for PairedCount {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(
            self.c1().wrapping_add(rhs.c1()),
            self.c2().wrapping_add(rhs.c2()),
        )
    }
}

impl Sub for PairedCount {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.c1().wrapping_sub(rhs.c1()),
            self.c2().wrapping_sub(rhs.c2()),
        )
    }
}

impl PartialOrd for PairedCount {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        use core::cmp::Ordering::*;
        if self.bits == other.bits {
            return Some(Equal);
        }
        if self.c1() <= other.c1() && self.c2() <= other.c2() {
            return Some(Less);
        }
        if self.c1() >= other.c1() && self.c2() >= other.c2() {
            return Some(Greater);
        }
        None
    }
}

impl fmt::Debug for PairedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairedCount")
            .field("c1", &self.c1())
            .field("c2", &self.c2())
            .finish()
    }
}

/// An atomic [`PairedCount`].
///
/// All operations act on the underlying `AtomicU64`. The fetch-ops are
/// full-word (a carry out of `c2` would run into `c1`; callers never let
/// `c2` wrap in normal operation), while the `_c1`/`_c2` compare-exchange
/// variants target one sub-counter and preserve the other.
#[derive(Default)]
pub struct AtomicPairedCount {
    word: AtomicU64,
}

impl AtomicPairedCount {
    /// Creates a counter initialised to `{c1, c2}`.
    #[inline]
    pub const fn new(c1: i32, c2: u32) -> Self {
        Self {
            word: AtomicU64::new(PairedCount::new(c1, c2).bits()),
        }
    }

    /// Loads the counter.
    #[inline]
    pub fn load(&self, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.load(order))
    }

    /// Stores `value`.
    #[inline]
    pub fn store(&self, value: PairedCount, order: Ordering) {
        self.word.store(value.bits(), order);
    }

    /// Swaps in `value`, returning the previous counter.
    #[inline]
    pub fn swap(&self, value: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.swap(value.bits(), order))
    }

    /// Full-word compare-exchange.
    #[inline]
    pub fn compare_exchange(
        &self,
        current: PairedCount,
        new: PairedCount,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, PairedCount> {
        self.word
            .compare_exchange(current.bits(), new.bits(), success, failure)
            .map(PairedCount::from_bits)
            .map_err(PairedCount::from_bits)
    }

    /// Full-word compare-exchange that may fail spuriously.
    #[inline]
    pub fn compare_exchange_weak(
        &self,
        current: PairedCount,
        new: PairedCount,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, PairedCount> {
        self.word
            .compare_exchange_weak(current.bits(), new.bits(), success, failure)
            .map(PairedCount::from_bits)
            .map_err(PairedCount::from_bits)
    }

    /// Compare-exchange on `c1` alone; `c2` is preserved whatever its value.
    ///
    /// Fails only when the observed `c1` differs from `expected`, returning
    /// the observed `c1`. Churn on `c2` and spurious CAS failures retry, so
    /// the operation succeeds whenever `c1` matches at the linearisation
    /// point. `Ok` carries the full pre-exchange counter.
    pub fn compare_exchange_c1(
        &self,
        expected: i32,
        desired: i32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, i32> {
        let mut cur = self.load(failure);
        loop {
            if cur.c1() != expected {
                return Err(cur.c1());
            }
            match self.compare_exchange(cur, cur.with_c1(desired), success, failure) {
                Ok(prev) => return Ok(prev),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Weak form of [`compare_exchange_c1`](Self::compare_exchange_c1).
    ///
    /// Uses the weak word CAS underneath; the loop still resolves spurious
    /// failures, so the observable contract is the same.
    pub fn compare_exchange_weak_c1(
        &self,
        expected: i32,
        desired: i32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, i32> {
        let mut cur = self.load(failure);
        loop {
            if cur.c1() != expected {
                return Err(cur.c1());
            }
            match self.compare_exchange_weak(cur, cur.with_c1(desired), success, failure) {
                Ok(prev) => return Ok(prev),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Compare-exchange on `c2` alone; `c1` is preserved whatever its value.
    ///
    /// Same contract as [`compare_exchange_c1`](Self::compare_exchange_c1),
    /// keyed on the low sub-counter.
    pub fn compare_exchange_c2(
        &self,
        expected: u32,
        desired: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, u32> {
        let mut cur = self.load(failure);
        loop {
            if cur.c2() != expected {
                return Err(cur.c2());
            }
            match self.compare_exchange(cur, cur.with_c2(desired), success, failure) {
                Ok(prev) => return Ok(prev),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Weak form of [`compare_exchange_c2`](Self::compare_exchange_c2).
    pub fn compare_exchange_weak_c2(
        &self,
        expected: u32,
        desired: u32,
        success: Ordering,
        failure: Ordering,
    ) -> Result<PairedCount, u32> {
        let mut cur = self.load(failure);
        loop {
            if cur.c2() != expected {
                return Err(cur.c2());
            }
            match self.compare_exchange_weak(cur, cur.with_c2(desired), success, failure) {
                Ok(prev) => return Ok(prev),
                Err(seen) => cur = seen,
            }
        }
    }

    /// Adds `arg` to the full word, returning the previous counter.
    #[inline]
    pub fn fetch_add(&self, arg: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.fetch_add(arg.bits(), order))
    }

    /// Subtracts `arg` from the full word, returning the previous counter.
    #[inline]
    pub fn fetch_sub(&self, arg: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.fetch_sub(arg.bits(), order))
    }

    /// Bitwise-and with `arg`, returning the previous counter.
    #[inline]
    pub fn fetch_and(&self, arg: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.fetch_and(arg.bits(), order))
    }

    /// Bitwise-or with `arg`, returning the previous counter.
    #[inline]
    pub fn fetch_or(&self, arg: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.fetch_or(arg.bits(), order))
    }

    /// Bitwise-xor with `arg`, returning the previous counter.
    #[inline]
    pub fn fetch_xor(&self, arg: PairedCount, order: Ordering) -> PairedCount {
        PairedCount::from_bits(self.word.fetch_xor(arg.bits(), order))
    }

    /// Atomically moves `arg` from `c1` to `c2`, returning the previous
    /// counter. The new value is `{c1 - arg, c2 + arg}`.
    ///
    /// With `c2` in the low half this is a single full-word fetch-op for
    /// either sign of `arg`: the add `{-arg, arg}` for `arg >= 0`, the sub
    /// `{arg, -arg}` for `arg < 0`, so the carry/borrow crosses the half
    /// boundary exactly as the subtraction requires.
    #[inline]
    pub fn fetch_transfer(&self, arg: i32, order: Ordering) -> PairedCount {
        if arg >= 0 {
            self.fetch_add(PairedCount::new(arg.wrapping_neg(), arg as u32), order)
        } else {
            self.fetch_sub(PairedCount::new(arg, arg.wrapping_neg() as u32), order)
        }
    }

    /// Blocks until the counter differs from `old`.
    ///
    /// Spurious wake-ups re-check the value; the call returns only once a
    /// load with `order` observes something other than `old`.
    pub fn wait(&self, old: PairedCount, order: Ordering) {
        while self.load(order) == old {
            signal::wait(self as *const Self as usize, || self.load(order) == old);
        }
    }

    /// Wakes one thread blocked in [`wait`](Self::wait) on this counter.
    #[inline]
    pub fn notify_one(&self) {
        signal::notify_one(self as *const Self as usize);
    }

    /// Wakes every thread blocked in [`wait`](Self::wait) on this counter.
    #[inline]
    pub fn notify_all(&self) {
        signal::notify_all(self as *const Self as usize);
    }
}

impl From<PairedCount> for AtomicPairedCount {
    fn from(value: PairedCount) -> Self {
        Self {
            word: AtomicU64::new(value.bits()),
        }
    }
}

impl fmt::Debug for AtomicPairedCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

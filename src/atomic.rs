//! `AtomicShared<T>` — a lock-free atomic cell holding a strong handle.
//!
//! The cell stores a counted pointer `{ctr, hdr}`: the control-block
//! pointer of the resident handle plus a local counter. Exactly one
//! strong reference is pinned on behalf of the cell itself; in addition
//! `ctr` pre-paid holds live in the block's `strong.c1`, one per observer
//! that has entered the cell and not yet converted or returned its hold.
//!
//! The enter/leave protocol around that word is what makes the cell safe:
//!
//! - An observer **enters** by bumping the local counter and reading the
//!   pointer in one `fetch_add`. From that instant the payload cannot
//!   die: either the cell still points at the block (the cell's pin keeps
//!   it alive), or a writer has reassigned the cell — and the writer's
//!   release of `{old_ctr, 1}` force-transferred every outstanding entry
//!   into the block's global counter, leaving `c1` short by exactly the
//!   in-flight entries, which blocks destruction until each of them
//!   repays `{-1, 0}`.
//! - A loader converts its entry with one `acquire({1, 1})`: the hold is
//!   materialised and the returned handle funded in a single step.
//! - A writer exchanges the whole word and returns the departing state's
//!   holds with one `release({old_ctr, 1})`.
//!
//! The local counter is 16 bits; once it reaches `1 << 14` an entering
//! observer opportunistically drains it back into the block's `c1`, so
//! signed 16-bit arithmetic never overflows.

use crate::counted::{AtomicCountedPtr, CountedPtr};
use crate::header::Header;
use crate::paired::PairedCount;
use crate::shared::Shared;
use crate::utils::CacheAligned;
use core::fmt;
use core::sync::atomic::Ordering;
use crossbeam_utils::Backoff;

/// Local counter level that triggers an opportunistic drain.
const DRAIN_THRESHOLD: i16 = 1 << 14;

/// A cache-line-aligned atomic cell holding a [`Shared<T>`].
///
/// Concurrent agents publish, observe and exchange strong handles through
/// the cell without mutual exclusion: every operation is lock-free, and
/// plain loads and stores are wait-free. Handles obtained from the cell
/// are ordinary [`Shared`] values.
///
/// All operations take explicit [`Ordering`] parameters; `SeqCst` is the
/// conservative choice throughout.
///
/// # Examples
///
/// ```rust
/// use ortak::{AtomicShared, Shared};
/// use std::sync::atomic::Ordering;
///
/// let cell = AtomicShared::new(Shared::new(1));
/// assert_eq!(cell.load(Ordering::SeqCst).as_ref(), Some(&1));
///
/// cell.store(Shared::new(2), Ordering::SeqCst);
/// assert_eq!(cell.load(Ordering::SeqCst).as_ref(), Some(&2));
/// ```
pub struct AtomicShared<T> {
    cp: CacheAligned<AtomicCountedPtr<Header<T>>>,
}

// SAFETY: the cell is a single atomic word over a Send + Sync block.
unsafe impl<T: Send + Sync> Send for AtomicShared<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicShared<T> {}

impl<T> AtomicShared<T> {
    /// Creates an empty cell.
    #[inline]
    pub const fn null() -> Self {
        Self {
            cp: CacheAligned::new(AtomicCountedPtr::null()),
        }
    }

    /// Creates a cell holding `value`.
    ///
    /// The handle's counted pointer is absorbed verbatim, local reserve
    /// included; the accounting travels with it.
    #[inline]
    pub fn new(value: Shared<T>) -> Self {
        Self {
            cp: CacheAligned::new(AtomicCountedPtr::new(value.into_cp())),
        }
    }

    /// Loads the resident handle.
    ///
    /// Returns the null handle for an empty cell. The returned handle owns
    /// a full strong reference and is independent of any later store.
    pub fn load(&self, order: Ordering) -> Shared<T> {
        // The acquire pairs with the release of the store that published
        // this block, making its construction visible.
        let cp = self.enter(Ordering::Acquire);
        if cp.ptr().is_null() {
            return Shared::null();
        }
        // Materialise our pre-paid entry and fund the returned handle in
        // one atomic step.
        // SAFETY: the entry pins the block (module docs).
        unsafe { (*cp.ptr()).acquire(PairedCount::new(1, 1), order) };
        Shared::from_header(cp.ptr())
    }

    /// Stores `desired`, releasing the previously resident handle.
    #[inline]
    pub fn store(&self, desired: Shared<T>, order: Ordering) {
        drop(self.swap(desired, order));
    }

    /// Stores `desired` and returns the previously resident handle.
    ///
    /// The departing handle carries the cell's old local counter; its drop
    /// releases `{old_ctr, 1}`, returning every pre-paid hold together
    /// with the cell's pin.
    #[inline]
    pub fn swap(&self, desired: Shared<T>, order: Ordering) -> Shared<T> {
        let old = self.cp.swap(desired.into_cp(), order);
        Shared::from_cp(old)
    }

    /// Compare-exchange: publishes `desired` iff the cell still holds the
    /// same control block as `expected`.
    ///
    /// On success returns the previous cell state as a handle. On failure
    /// `expected` is overwritten with the observed handle and `desired`
    /// is handed back unconsumed, so a retry loop pays no extra
    /// allocation.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ortak::{AtomicShared, Shared};
    /// use std::sync::atomic::Ordering;
    ///
    /// let cell = AtomicShared::new(Shared::new(1));
    /// let mut expected = cell.load(Ordering::SeqCst);
    /// let swapped = cell.compare_exchange(
    ///     &mut expected,
    ///     Shared::new(2),
    ///     Ordering::SeqCst,
    ///     Ordering::SeqCst,
    /// );
    /// assert!(swapped.is_ok());
    /// assert_eq!(cell.load(Ordering::SeqCst).as_ref(), Some(&2));
    /// ```
    pub fn compare_exchange(
        &self,
        expected: &mut Shared<T>,
        desired: Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Shared<T>, Shared<T>> {
        self.compare_exchange_impl(expected, desired, success, failure, false)
    }

    /// Weak form of [`compare_exchange`](Self::compare_exchange); the
    /// underlying word CAS may fail spuriously, which shows up as extra
    /// internal retries rather than extra `Err` returns.
    pub fn compare_exchange_weak(
        &self,
        expected: &mut Shared<T>,
        desired: Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Shared<T>, Shared<T>> {
        self.compare_exchange_impl(expected, desired, success, failure, true)
    }

    /// Compare-exchange that *copies* `desired` into the cell.
    ///
    /// The caller keeps its `desired` handle; on success the cell owns a
    /// fresh reference and the previous cell state has been released
    /// internally. On failure `expected` is updated as in
    /// [`compare_exchange`](Self::compare_exchange).
    pub fn compare_exchange_clone(
        &self,
        expected: &mut Shared<T>,
        desired: &Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), ()> {
        self.compare_exchange_clone_impl(expected, desired, success, failure, false)
    }

    /// Weak form of
    /// [`compare_exchange_clone`](Self::compare_exchange_clone).
    pub fn compare_exchange_weak_clone(
        &self,
        expected: &mut Shared<T>,
        desired: &Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), ()> {
        self.compare_exchange_clone_impl(expected, desired, success, failure, true)
    }

    /// Blocks while the cell holds the same control block as `old`.
    ///
    /// Returns as soon as a different block (or emptiness) is observed.
    /// Writers do not notify implicitly; pair this with
    /// [`notify_one`](Self::notify_one) or
    /// [`notify_all`](Self::notify_all).
    pub fn wait(&self, old: &Shared<T>, order: Ordering) {
        let mut cur = self.enter(order);
        loop {
            if cur.ptr() == old.header() {
                self.cp.wait(cur, Ordering::Relaxed);
            } else {
                self.leave(cur, Ordering::Relaxed);
                return;
            }
            cur = self.reenter(cur, Ordering::Relaxed);
        }
    }

    /// Wakes one thread blocked in [`wait`](Self::wait) on this cell.
    #[inline]
    pub fn notify_one(&self) {
        self.cp.notify_one();
    }

    /// Wakes every thread blocked in [`wait`](Self::wait) on this cell.
    #[inline]
    pub fn notify_all(&self) {
        self.cp.notify_all();
    }

    // ---- enter / leave ----

    /// Bumps the local counter and returns the post-increment snapshot.
    ///
    /// Past the drain threshold the counter is opportunistically folded
    /// back into the block's `c1` so it stays far below `i16::MAX`.
    fn enter(&self, order: Ordering) -> CountedPtr<Header<T>> {
        let prev = self.cp.fetch_ctr_add(1, order);
        let mut cur = prev.with_ctr(prev.ctr().wrapping_add(1));

        if cur.ctr() >= DRAIN_THRESHOLD && !cur.ptr().is_null() {
            let drained = cur.ctr();
            if self
                .cp
                .compare_exchange(cur, cur.with_ctr(0), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: our entry pins the block.
                unsafe { (*cur.ptr()).unhold(drained, Ordering::Relaxed) };
                cur = cur.with_ctr(0);
            }
        }
        cur
    }

    /// Undoes an entry made at snapshot `seen`.
    ///
    /// If the cell was reassigned in the meantime, the departing writer
    /// already transferred the entry into the old block's global counter;
    /// the repayment happens there instead, and may be the subtraction
    /// that destroys the payload.
    fn leave(&self, mut seen: CountedPtr<Header<T>>, order: Ordering) {
        let backoff = Backoff::new();
        loop {
            let step_down = seen.with_ctr(seen.ctr().wrapping_sub(1));
            match self
                .cp
                .compare_exchange_weak(seen, step_down, order, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(cur) => {
                    if cur.ptr() != seen.ptr() {
                        if !seen.ptr().is_null() {
                            // SAFETY: the writer's transfer keeps the block
                            // alive until this repayment lands.
                            unsafe {
                                Header::release(
                                    seen.ptr(),
                                    PairedCount::new(-1, 0),
                                    Ordering::AcqRel,
                                );
                            }
                        }
                        return;
                    }
                    seen = cur;
                    backoff.spin();
                }
            }
        }
    }

    /// Refreshes an entry: keeps it if the cell still holds the same
    /// block, otherwise repays the old entry and enters anew.
    fn reenter(&self, old: CountedPtr<Header<T>>, order: Ordering) -> CountedPtr<Header<T>> {
        let cur = self.cp.load(Ordering::Relaxed);
        if cur.ptr() == old.ptr() {
            return cur;
        }
        if !old.ptr().is_null() {
            // SAFETY: as in leave(); the transfer pins the block.
            unsafe { Header::release(old.ptr(), PairedCount::new(-1, 0), Ordering::AcqRel) };
        }
        self.enter(order)
    }

    fn cas_word(
        &self,
        current: CountedPtr<Header<T>>,
        new: CountedPtr<Header<T>>,
        success: Ordering,
        failure: Ordering,
        weak: bool,
    ) -> Result<CountedPtr<Header<T>>, CountedPtr<Header<T>>> {
        if weak {
            self.cp.compare_exchange_weak(current, new, success, failure)
        } else {
            self.cp.compare_exchange(current, new, success, failure)
        }
    }

    fn compare_exchange_impl(
        &self,
        expected: &mut Shared<T>,
        desired: Shared<T>,
        success: Ordering,
        failure: Ordering,
        weak: bool,
    ) -> Result<Shared<T>, Shared<T>> {
        let expected_ptr = expected.header();
        let desired_cp = CountedPtr::new(desired.local_ctr(), desired.header());

        let mut seen = self.enter(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            if seen.ptr() != expected_ptr {
                // Definitive failure: hand the observed state to the
                // caller. The {1, 1} converts our entry into a global
                // reference and funds the materialised handle; replacing
                // *expected releases the caller's old handle.
                if !seen.ptr().is_null() {
                    // SAFETY: the entry pins the block.
                    unsafe { (*seen.ptr()).acquire(PairedCount::new(1, 1), Ordering::Relaxed) };
                }
                *expected = Shared::from_header(seen.ptr());
                return Err(desired);
            }

            // Pointer matches: we keep no handle from this entry, so fold
            // it into the expected handle's reserve instead.
            expected.set_local_ctr(expected.local_ctr().wrapping_sub(1));

            loop {
                match self.cas_word(seen, desired_cp, success, failure, weak) {
                    Ok(prev) => {
                        // The cell absorbed desired's counted pointer.
                        let _ = desired.into_cp();
                        return Ok(Shared::from_cp(prev));
                    }
                    Err(cur) => {
                        if cur.ptr() == expected_ptr {
                            // Counter churn or a spurious failure.
                            seen = cur;
                            backoff.spin();
                            continue;
                        }
                        // The pointer moved; it may yet move back.
                        seen = self.enter(Ordering::Acquire);
                        break;
                    }
                }
            }
        }
    }

    fn compare_exchange_clone_impl(
        &self,
        expected: &mut Shared<T>,
        desired: &Shared<T>,
        success: Ordering,
        failure: Ordering,
        weak: bool,
    ) -> Result<(), ()> {
        let expected_ptr = expected.header();
        // Copied in with a zero reserve; the cell gets its own reference.
        let desired_cp = CountedPtr::new(0, desired.header());
        let mut acquired_desired = false;

        let mut seen = self.enter(Ordering::Acquire);
        let backoff = Backoff::new();
        loop {
            if seen.ptr() != expected_ptr {
                if acquired_desired && !desired_cp.ptr().is_null() {
                    // SAFETY: the caller's desired handle outlives us, so
                    // this release cannot be the last.
                    unsafe {
                        Header::release(
                            desired_cp.ptr(),
                            PairedCount::new(0, 1),
                            Ordering::AcqRel,
                        );
                    }
                }
                if !seen.ptr().is_null() {
                    // SAFETY: the entry pins the block.
                    unsafe { (*seen.ptr()).acquire(PairedCount::new(1, 1), Ordering::Relaxed) };
                }
                *expected = Shared::from_header(seen.ptr());
                return Err(());
            }

            expected.set_local_ctr(expected.local_ctr().wrapping_sub(1));

            // The cell's reference to desired must exist before the CAS
            // can publish the pointer.
            if !acquired_desired {
                if !desired_cp.ptr().is_null() {
                    // SAFETY: the caller's desired handle pins the block.
                    unsafe { (*desired_cp.ptr()).acquire(PairedCount::new(0, 1), Ordering::Relaxed) };
                }
                acquired_desired = true;
            }

            loop {
                match self.cas_word(seen, desired_cp, success, failure, weak) {
                    Ok(prev) => {
                        if !expected_ptr.is_null() {
                            // Nobody owns the departed cell state, so its
                            // holds and pin are returned right here.
                            // SAFETY: prev held ctr + 1 references on it.
                            unsafe {
                                Header::release(
                                    expected_ptr,
                                    PairedCount::new(prev.ctr() as i32, 1),
                                    Ordering::AcqRel,
                                );
                            }
                        }
                        return Ok(());
                    }
                    Err(cur) => {
                        if cur.ptr() == expected_ptr {
                            seen = cur;
                            backoff.spin();
                            continue;
                        }
                        seen = self.enter(Ordering::Acquire);
                        break;
                    }
                }
            }
        }
    }
}

impl<T> Drop for AtomicShared<T> {
    fn drop(&mut self) {
        let cp = self.cp.load(Ordering::Acquire);
        if !cp.ptr().is_null() {
            // The local counter can be negative if a drain raced with a
            // leave; sign-extension balances the release either way.
            // SAFETY: the cell owns its pin and the outstanding holds.
            unsafe {
                Header::release(
                    cp.ptr(),
                    PairedCount::new(cp.ctr() as i32, 1),
                    Ordering::AcqRel,
                );
            }
        }
    }
}

impl<T> Default for AtomicShared<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Shared<T>> for AtomicShared<T> {
    fn from(value: Shared<T>) -> Self {
        Self::new(value)
    }
}

impl<T> fmt::Debug for AtomicShared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cp = self.cp.load(Ordering::Relaxed);
        f.debug_struct("AtomicShared")
            .field("ptr", &cp.ptr())
            .field("ctr", &cp.ctr())
            .finish()
    }
}

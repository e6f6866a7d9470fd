//! `Weak<T>` — the weak handle.

use crate::counted::CountedPtr;
use crate::header::Header;
use crate::paired::PairedCount;
use crate::shared::Shared;
use core::fmt;
use core::sync::atomic::Ordering;

/// A weak handle: observes a control block without keeping the payload
/// alive.
///
/// A `Weak` can outlive every strong handle; once the payload is gone,
/// [`upgrade`](Self::upgrade) returns the null handle. Weak handles keep
/// only the control block itself alive.
///
/// # Examples
///
/// ```rust
/// use ortak::Shared;
///
/// let strong = Shared::new(7);
/// let weak = strong.downgrade();
/// assert_eq!(weak.upgrade().as_ref(), Some(&7));
///
/// drop(strong);
/// assert!(weak.upgrade().is_null());
/// ```
pub struct Weak<T> {
    cp: CountedPtr<Header<T>>,
}

// SAFETY: same sharing discipline as Shared<T>.
unsafe impl<T: Send + Sync> Send for Weak<T> {}
unsafe impl<T: Send + Sync> Sync for Weak<T> {}

impl<T> Weak<T> {
    /// Creates the null weak handle.
    #[inline]
    pub const fn null() -> Self {
        Self {
            cp: CountedPtr::null(),
        }
    }

    /// `true` if this is the null handle.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.cp.is_null()
    }

    /// Attempts to produce a strong handle.
    ///
    /// Returns the null handle if the payload has already been destroyed;
    /// otherwise the returned handle pins the payload as usual.
    pub fn upgrade(&self) -> Shared<T> {
        let h = self.header();
        if h.is_null() {
            return Shared::null();
        }
        // SAFETY: the weak handle keeps the block (not the payload) alive;
        // weak_lock only hands out a reference while the payload lives.
        if unsafe { (*h).weak_lock(Ordering::Acquire) } {
            Shared::from_header(h)
        } else {
            Shared::null()
        }
    }

    /// `true` if the payload has been destroyed (or the handle is null).
    #[inline]
    pub fn expired(&self) -> bool {
        self.use_count() == 0
    }

    /// The global strong count, or 0 for the null handle.
    #[inline]
    pub fn use_count(&self) -> u32 {
        match self.header() {
            h if h.is_null() => 0,
            // SAFETY: the weak handle keeps the block alive.
            h => unsafe { (*h).use_count() },
        }
    }

    /// The global weak count, or 0 for the null handle.
    #[inline]
    pub fn weak_count(&self) -> u32 {
        match self.header() {
            h if h.is_null() => 0,
            // SAFETY: the weak handle keeps the block alive.
            h => unsafe { (*h).weak_count() },
        }
    }

    /// `true` if both handles observe the same control block (or both are
    /// null).
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.header() == other.header()
    }

    #[inline]
    pub(crate) fn header(&self) -> *mut Header<T> {
        self.cp.ptr()
    }

    /// Wraps a header pointer (which may be null); the caller must have
    /// funded one weak reference for non-null headers.
    #[inline]
    pub(crate) fn from_header(header: *mut Header<T>) -> Self {
        Self {
            cp: CountedPtr::new(0, header),
        }
    }
}

impl<T> Clone for Weak<T> {
    fn clone(&self) -> Self {
        let h = self.header();
        if !h.is_null() {
            // SAFETY: self keeps the block alive across the acquire.
            unsafe { (*h).acquire_weak(Ordering::Relaxed) };
        }
        Self::from_header(h)
    }
}

impl<T> Drop for Weak<T> {
    fn drop(&mut self) {
        let h = self.header();
        if !h.is_null() {
            // SAFETY: this handle owns one weak reference.
            unsafe {
                Header::release_weak(
                    h,
                    PairedCount::new(self.cp.ctr() as i32, 1),
                    Ordering::AcqRel,
                );
            }
        }
    }
}

impl<T> Default for Weak<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Weak({:p})", self.header())
    }
}

//! `Shared<T>` — the strong handle.

use crate::counted::CountedPtr;
use crate::header::{AllocHeader, BlockAlloc, BoxHeader, DeleterHeader, Header, InPlaceHeader, ShareableHeader};
use crate::paired::PairedCount;
use crate::weak::Weak;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::sync::atomic::Ordering;

/// A strong, shared-ownership handle to a heap-resident `T`.
///
/// A `Shared` either owns one strong reference to a control block or is
/// null. Cloning acquires another reference; dropping the last one
/// destroys the payload. Unlike `std::sync::Arc`, a `Shared` can be
/// published into an [`AtomicShared`](crate::AtomicShared) cell and
/// observed lock-free by any number of threads.
///
/// Besides the header pointer, the handle carries a small local counter:
/// the reserve it parked in the atomic cell it most recently came out of.
/// The counter is part of the release accounting and is invisible to
/// ordinary use.
///
/// # Examples
///
/// ```rust
/// use ortak::Shared;
///
/// let a = Shared::new(42);
/// let b = a.clone();
/// assert_eq!(a.use_count(), 2);
/// assert_eq!(b.as_ref(), Some(&42));
/// ```
pub struct Shared<T> {
    cp: CountedPtr<Header<T>>,
}

// SAFETY: the control block is only mutated through its atomic counters;
// the payload is exposed by shared reference only.
unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Creates the null handle.
    #[inline]
    pub const fn null() -> Self {
        Self {
            cp: CountedPtr::null(),
        }
    }

    /// Allocates a control block with `value` stored in place and returns
    /// the first handle to it.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ortak::Shared;
    ///
    /// let s = Shared::new(String::from("hello"));
    /// assert!(s.is_unique());
    /// ```
    #[inline]
    pub fn new(value: T) -> Self {
        Self::from_header(InPlaceHeader::create(value))
    }

    /// Like [`new`](Self::new), but the block is allocated and later freed
    /// through `alloc`. Destruction of the co-located payload and header
    /// is ordered by the shareable state machine.
    #[inline]
    pub fn new_in<A>(value: T, alloc: A) -> Self
    where
        A: BlockAlloc + Send + 'static,
    {
        Self::from_header(ShareableHeader::create(value, alloc))
    }

    /// Adopts a boxed payload into a fresh control block.
    #[inline]
    pub fn from_box(value: Box<T>) -> Self {
        Self::from_header(BoxHeader::create(value))
    }

    /// Adopts a raw payload; the last release calls `deleter` with the
    /// pointer instead of freeing it.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid until the deleter runs, and the deleter must
    /// fully dispose of it.
    #[inline]
    pub unsafe fn from_raw_with<D>(ptr: *mut T, deleter: D) -> Self
    where
        D: FnOnce(*mut T) + Send + 'static,
    {
        Self::from_header(DeleterHeader::create(ptr, deleter))
    }

    /// Adopts a raw payload allocated by `alloc`; the last release drops
    /// the payload in place and returns its memory to `alloc`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a live `T` obtained from `alloc` with
    /// `Layout::new::<T>()`, and must not be freed elsewhere.
    #[inline]
    pub unsafe fn from_raw_in<A>(ptr: *mut T, alloc: A) -> Self
    where
        A: BlockAlloc + Send + 'static,
    {
        Self::from_header(AllocHeader::create(ptr, alloc))
    }

    /// `true` if this is the null handle.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.cp.is_null()
    }

    /// The raw payload pointer, or null for the null handle.
    #[inline]
    pub fn get(&self) -> *mut T {
        match self.header() {
            h if h.is_null() => core::ptr::null_mut(),
            // SAFETY: a non-null handle keeps its block and payload alive.
            h => unsafe { (*h).payload_ptr() },
        }
    }

    /// Borrows the payload, or `None` for the null handle.
    #[inline]
    pub fn as_ref(&self) -> Option<&T> {
        // SAFETY: a non-null handle keeps the payload alive for as long as
        // the handle (and hence the borrow) exists.
        unsafe { self.get().as_ref() }
    }

    /// The global strong count, or 0 for the null handle.
    #[inline]
    pub fn use_count(&self) -> u32 {
        match self.header() {
            h if h.is_null() => 0,
            // SAFETY: non-null handle keeps the block alive.
            h => unsafe { (*h).use_count() },
        }
    }

    /// The global weak count, or 0 for the null handle.
    #[inline]
    pub fn weak_count(&self) -> u32 {
        match self.header() {
            h if h.is_null() => 0,
            // SAFETY: non-null handle keeps the block alive.
            h => unsafe { (*h).weak_count() },
        }
    }

    /// `true` if this handle is the only strong reference.
    #[inline]
    pub fn is_unique(&self) -> bool {
        self.use_count() == 1
    }

    /// `true` if both handles refer to the same control block (or both
    /// are null).
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.header() == other.header()
    }

    /// Creates a weak handle observing the same control block.
    pub fn downgrade(&self) -> Weak<T> {
        let h = self.header();
        if !h.is_null() {
            // SAFETY: non-null handle keeps the block alive.
            unsafe { (*h).acquire_weak(Ordering::Relaxed) };
        }
        Weak::from_header(h)
    }

    // ---- crate-internal plumbing used by the atomic cell ----

    #[inline]
    pub(crate) fn header(&self) -> *mut Header<T> {
        self.cp.ptr()
    }

    #[inline]
    pub(crate) fn local_ctr(&self) -> i16 {
        self.cp.ctr()
    }

    #[inline]
    pub(crate) fn set_local_ctr(&mut self, ctr: i16) {
        self.cp = self.cp.with_ctr(ctr);
    }

    /// Wraps a header pointer (which may be null) without touching any
    /// counter; the caller must have funded one strong reference.
    #[inline]
    pub(crate) fn from_header(header: *mut Header<T>) -> Self {
        Self {
            cp: CountedPtr::new(0, header),
        }
    }

    /// Wraps a raw counted pointer; the caller must own `ctr + 1` strong
    /// references' worth of accounting on the block.
    #[inline]
    pub(crate) fn from_cp(cp: CountedPtr<Header<T>>) -> Self {
        Self { cp }
    }

    /// Dismantles the handle into its counted pointer without releasing.
    #[inline]
    pub(crate) fn into_cp(self) -> CountedPtr<Header<T>> {
        ManuallyDrop::new(self).cp
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        let h = self.header();
        if !h.is_null() {
            // SAFETY: self keeps the block alive across the acquire.
            unsafe { (*h).acquire(PairedCount::new(0, 1), Ordering::Relaxed) };
        }
        Self::from_header(h)
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let h = self.header();
        if !h.is_null() {
            // The local counter rides along: releasing {ctr, 1} returns
            // the reserve parked in whichever cell this handle came from.
            unsafe {
                Header::release(
                    h,
                    PairedCount::new(self.local_ctr() as i32, 1),
                    Ordering::AcqRel,
                );
            }
        }
    }
}

impl<T> Deref for Shared<T> {
    type Target = T;

    /// Panics on the null handle; use [`as_ref`](Self::as_ref) to observe
    /// without risking a panic.
    fn deref(&self) -> &T {
        self.as_ref().expect("dereferenced a null Shared")
    }
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> PartialEq for Shared<T> {
    /// Pointer identity of the payloads, not value equality.
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T> Eq for Shared<T> {}

impl<T: fmt::Debug> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_ref() {
            Some(value) => f.debug_tuple("Shared").field(value).finish(),
            None => f.write_str("Shared(null)"),
        }
    }
}

impl<T> From<Box<T>> for Shared<T> {
    fn from(value: Box<T>) -> Self {
        Self::from_box(value)
    }
}

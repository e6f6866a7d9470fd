//! Control blocks.
//!
//! Every shared payload is owned by one heap-resident `Header<T>` carrying
//! the strong and weak paired counters, the payload pointer, and two
//! type-erased destructor hooks. The hooks are monomorphised function
//! pointers installed by the flavour that allocated the block, so a single
//! non-generic release path can destroy any flavour.
//!
//! Counter protocol:
//!
//! - `strong.c2` is the global strong count; `strong.c1` is the aggregate
//!   of holds donated by atomic cells (observers that entered a cell and
//!   have not yet converted or returned their hold).
//! - A release subtracts its count in one atomic step and destroys the
//!   payload exactly when the subtraction lands on `{0, 0}`. A negative
//!   `c1` therefore pins the payload: in-flight cell observers whose holds
//!   were force-transferred by a reassigning writer keep the block alive
//!   until each of them repays `{-1, 0}`.
//! - `weak.c2` counts weak handles plus one implicit reference owned by
//!   the strong side. The payload-destroying release drops the implicit
//!   reference after the payload destructor returns, so the header is
//!   freed exactly once, strictly afterwards, by whichever weak release
//!   lands on `{0, 0}`.

use crate::paired::{AtomicPairedCount, PairedCount};
use core::alloc::Layout;
use core::mem::{ManuallyDrop, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicU8, Ordering};
use crossbeam_utils::Backoff;
use std::alloc::{alloc as raw_alloc, dealloc as raw_dealloc, handle_alloc_error};

/// Allocation seam for control blocks.
///
/// [`Shared::new_in`](crate::Shared::new_in) and
/// [`Shared::from_raw_in`](crate::Shared::from_raw_in) route every block
/// and payload (de)allocation through an implementation of this trait.
/// The allocator is cloned into the block so the final release can free
/// the memory it came from.
pub trait BlockAlloc: Clone {
    /// Allocates `layout` bytes. Must not return null; the implementation
    /// decides the failure mode (the default heap aborts via
    /// [`handle_alloc_error`]).
    fn allocate(&self, layout: Layout) -> *mut u8;

    /// Deallocates a block previously returned by
    /// [`allocate`](Self::allocate) with the same layout.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with `layout`,
    /// and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout);
}

/// The global heap as a [`BlockAlloc`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Heap;

impl BlockAlloc for Heap {
    fn allocate(&self, layout: Layout) -> *mut u8 {
        assert!(layout.size() != 0, "zero-sized block allocation");
        // SAFETY: layout is non-zero-sized, checked above.
        let ptr = unsafe { raw_alloc(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }
        ptr
    }

    unsafe fn deallocate(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: forwarded caller contract.
        unsafe { raw_dealloc(ptr, layout) };
    }
}

/// Type-erased destructor hook, installed per flavour.
type DropFn<T> = unsafe fn(*mut Header<T>);

/// The control block header. Every flavour embeds this at offset 0.
#[repr(C)]
pub(crate) struct Header<T> {
    strong: AtomicPairedCount,
    weak: AtomicPairedCount,
    /// Immutable between construction and payload destruction.
    payload: *mut T,
    drop_payload: DropFn<T>,
    drop_header: DropFn<T>,
}

impl<T> Header<T> {
    fn new(payload: *mut T, drop_payload: DropFn<T>, drop_header: DropFn<T>) -> Self {
        Self {
            // One strong reference for the initial handle; one weak
            // reference held by the strong side until the payload dies.
            strong: AtomicPairedCount::new(0, 1),
            weak: AtomicPairedCount::new(0, 1),
            payload,
            drop_payload,
            drop_header,
        }
    }

    #[inline]
    pub(crate) fn payload_ptr(&self) -> *mut T {
        self.payload
    }

    /// Adds `count` to the strong counter.
    #[inline]
    pub(crate) fn acquire(&self, count: PairedCount, order: Ordering) {
        self.strong.fetch_add(count, order);
    }

    /// Removes `n` cell-donated holds from `strong.c1`.
    ///
    /// Donations enter `c1` through `acquire({1, 1})` on the load path;
    /// this is the drain direction that takes them back out.
    #[inline]
    pub(crate) fn unhold(&self, n: i16, order: Ordering) {
        self.strong.fetch_sub(PairedCount::new(n as i32, 0), order);
    }

    /// Subtracts `count` from the strong counter; destroys the payload if
    /// the subtraction lands on `{0, 0}`, then releases the implicit weak
    /// reference (which frees the header once the last weak is gone).
    ///
    /// # Safety
    ///
    /// `this` must point to a live header, and the caller must own the
    /// references being subtracted. After the call the pointer must be
    /// considered dangling.
    pub(crate) unsafe fn release(this: *mut Self, count: PairedCount, order: Ordering) {
        // SAFETY: header is live until the counter reaches zero below.
        let old = unsafe { (*this).strong.fetch_sub(count, order) };
        if old == count {
            // Last strong reference and no outstanding holds: the payload
            // dies here, on this thread, before the implicit weak goes.
            unsafe {
                ((*this).drop_payload)(this);
                Self::release_weak(this, PairedCount::new(0, 1), Ordering::AcqRel);
            }
        }
    }

    /// Increments `strong.c2` unless it is zero. Returns `false` if the
    /// payload is already dead.
    pub(crate) fn weak_lock(&self, order: Ordering) -> bool {
        let mut cur = self.strong.load(order);
        let backoff = Backoff::new();
        loop {
            if cur.c2() == 0 {
                return false;
            }
            match self.strong.compare_exchange_weak(
                cur,
                cur.with_c2(cur.c2() + 1),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => {
                    cur = seen;
                    backoff.spin();
                }
            }
        }
    }

    /// Adds one weak reference.
    #[inline]
    pub(crate) fn acquire_weak(&self, order: Ordering) {
        self.weak.fetch_add(PairedCount::new(0, 1), order);
    }

    /// Subtracts `count` from the weak counter; frees the header if the
    /// subtraction lands on `{0, 0}`.
    ///
    /// # Safety
    ///
    /// As for [`release`](Self::release), on the weak counter.
    pub(crate) unsafe fn release_weak(this: *mut Self, count: PairedCount, order: Ordering) {
        // SAFETY: header is live until the counter reaches zero below.
        let old = unsafe { (*this).weak.fetch_sub(count, order) };
        if old == count {
            debug_assert!(unsafe { (*this).strong.load(Ordering::Acquire) }.is_zero());
            // SAFETY: both counters are zero; nobody can reach the block.
            unsafe { ((*this).drop_header)(this) };
        }
    }

    /// The global strong count.
    #[inline]
    pub(crate) fn use_count(&self) -> u32 {
        self.strong.load(Ordering::Relaxed).c2()
    }

    /// The global weak count, with the strong side's implicit reference
    /// hidden while the payload is alive.
    #[inline]
    pub(crate) fn weak_count(&self) -> u32 {
        let weak = self.weak.load(Ordering::Relaxed).c2();
        if self.strong.load(Ordering::Relaxed).c2() > 0 {
            // Saturating: the two relaxed loads are not a snapshot, so the
            // implicit reference may already be gone.
            weak.saturating_sub(1)
        } else {
            weak
        }
    }
}

// ---------------------------------------------------------------------------
// Flavours
// ---------------------------------------------------------------------------
//
// Each flavour is #[repr(C)] with the Header at offset 0 so the erased
// hooks can recover the concrete type from a header pointer.

/// Adopted `Box<T>` payload; payload and header freed through `Box`.
#[repr(C)]
pub(crate) struct BoxHeader<T> {
    hdr: Header<T>,
}

impl<T> BoxHeader<T> {
    pub(crate) fn create(value: Box<T>) -> *mut Header<T> {
        let payload = Box::into_raw(value);
        let block = Box::new(Self {
            hdr: Header::new(payload, Self::drop_payload, Self::drop_header),
        });
        Box::into_raw(block) as *mut Header<T>
    }

    unsafe fn drop_payload(h: *mut Header<T>) {
        // SAFETY: payload was produced by Box::into_raw in create() and is
        // destroyed at most once.
        unsafe { drop(Box::from_raw((*h).payload)) };
    }

    unsafe fn drop_header(h: *mut Header<T>) {
        // SAFETY: h was produced by Box::into_raw in create().
        unsafe { drop(Box::from_raw(h as *mut Self)) };
    }
}

/// Raw payload destroyed by a caller-supplied deleter; header freed
/// through `Box`.
#[repr(C)]
pub(crate) struct DeleterHeader<T, D> {
    hdr: Header<T>,
    deleter: ManuallyDrop<D>,
}

impl<T, D: FnOnce(*mut T)> DeleterHeader<T, D> {
    pub(crate) fn create(payload: *mut T, deleter: D) -> *mut Header<T> {
        let block = Box::new(Self {
            hdr: Header::new(payload, Self::drop_payload, Self::drop_header),
            deleter: ManuallyDrop::new(deleter),
        });
        Box::into_raw(block) as *mut Header<T>
    }

    unsafe fn drop_payload(h: *mut Header<T>) {
        let this = h as *mut Self;
        // SAFETY: the deleter is taken exactly once, here; the header's
        // Box drop below never touches it again (ManuallyDrop).
        unsafe {
            let deleter = ManuallyDrop::take(&mut (*this).deleter);
            deleter((*this).hdr.payload);
        }
    }

    unsafe fn drop_header(h: *mut Header<T>) {
        // SAFETY: h was produced by Box::into_raw in create().
        unsafe { drop(Box::from_raw(h as *mut Self)) };
    }
}

/// Raw payload destroyed in place and deallocated through a
/// [`BlockAlloc`]; header freed through `Box`.
#[repr(C)]
pub(crate) struct AllocHeader<T, A> {
    hdr: Header<T>,
    alloc: A,
}

impl<T, A: BlockAlloc> AllocHeader<T, A> {
    pub(crate) fn create(payload: *mut T, alloc: A) -> *mut Header<T> {
        let block = Box::new(Self {
            hdr: Header::new(payload, Self::drop_payload, Self::drop_header),
            alloc,
        });
        Box::into_raw(block) as *mut Header<T>
    }

    unsafe fn drop_payload(h: *mut Header<T>) {
        let this = h as *mut Self;
        // SAFETY: the payload was allocated with this allocator and the
        // layout of T, per the from_raw_in contract.
        unsafe {
            let payload = (*this).hdr.payload;
            ptr::drop_in_place(payload);
            (*this)
                .alloc
                .deallocate(payload as *mut u8, Layout::new::<T>());
        }
    }

    unsafe fn drop_header(h: *mut Header<T>) {
        // SAFETY: h was produced by Box::into_raw in create(); dropping
        // the Box also drops the allocator.
        unsafe { drop(Box::from_raw(h as *mut Self)) };
    }
}

/// Payload co-located with the header; both allocated in one `Box`.
#[repr(C)]
pub(crate) struct InPlaceHeader<T> {
    hdr: Header<T>,
    payload: MaybeUninit<T>,
}

impl<T> InPlaceHeader<T> {
    pub(crate) fn create(value: T) -> *mut Header<T> {
        let block = Box::new(Self {
            hdr: Header::new(ptr::null_mut(), Self::drop_payload, Self::drop_header),
            payload: MaybeUninit::new(value),
        });
        let raw = Box::into_raw(block);
        // The payload pointer aims back into the block, so it can only be
        // written once the block has its final address.
        unsafe { (*raw).hdr.payload = ptr::addr_of_mut!((*raw).payload) as *mut T };
        raw as *mut Header<T>
    }

    unsafe fn drop_payload(h: *mut Header<T>) {
        // SAFETY: the payload lives inside the block and is destroyed at
        // most once; the memory itself stays until drop_header.
        unsafe { ptr::drop_in_place((*h).payload) };
    }

    unsafe fn drop_header(h: *mut Header<T>) {
        // SAFETY: h was produced by Box::into_raw in create(); the
        // MaybeUninit field does not double-drop the payload.
        unsafe { drop(Box::from_raw(h as *mut Self)) };
    }
}

/// Payload co-located with the header, allocated through a
/// [`BlockAlloc`], destruction ordered by an explicit state machine.
///
/// The machine exists because payload and header destruction can be
/// driven from two sides at once: the state carries
/// `LIVE → DESTROYING → DESTROYED` on the payload axis, `WANT_HEADER`
/// orthogonally, and the block is freed by whichever side observes the
/// second of `{DESTROYED, WANT_HEADER}`.
#[repr(C)]
pub(crate) struct ShareableHeader<T, A> {
    hdr: Header<T>,
    state: AtomicU8,
    alloc: ManuallyDrop<A>,
    payload: MaybeUninit<T>,
}

const DESTROYING: u8 = 1;
const DESTROYED: u8 = 2;
const WANT_HEADER: u8 = 4;

impl<T, A: BlockAlloc> ShareableHeader<T, A> {
    pub(crate) fn create(value: T, alloc: A) -> *mut Header<T> {
        let layout = Layout::new::<Self>();
        let raw = alloc.allocate(layout) as *mut Self;
        // SAFETY: raw is a fresh, exclusive allocation of our own layout.
        unsafe {
            raw.write(Self {
                hdr: Header::new(ptr::null_mut(), Self::drop_payload, Self::drop_header),
                state: AtomicU8::new(0),
                alloc: ManuallyDrop::new(alloc),
                payload: MaybeUninit::new(value),
            });
            (*raw).hdr.payload = ptr::addr_of_mut!((*raw).payload) as *mut T;
        }
        raw as *mut Header<T>
    }

    unsafe fn drop_payload(h: *mut Header<T>) {
        let this = h as *mut Self;
        // SAFETY: called exactly once, by the release that zeroed the
        // strong counter.
        unsafe {
            let old = (*this).state.fetch_or(DESTROYING, Ordering::AcqRel);
            debug_assert_eq!(old & (DESTROYING | DESTROYED), 0);

            ptr::drop_in_place((*this).hdr.payload);

            let old = (*this)
                .state
                .fetch_xor(DESTROYING | DESTROYED, Ordering::AcqRel);
            debug_assert_eq!(old & (DESTROYING | DESTROYED), DESTROYING);

            // A weak release may have claimed header destruction while the
            // payload destructor was running; that burden is now ours.
            if old & WANT_HEADER != 0 {
                Self::free(this);
            }
        }
    }

    unsafe fn drop_header(h: *mut Header<T>) {
        let this = h as *mut Self;
        // SAFETY: called exactly once, by the weak release that zeroed the
        // weak counter.
        unsafe {
            let old = (*this).state.fetch_or(WANT_HEADER, Ordering::AcqRel);
            debug_assert_ne!(old & (DESTROYING | DESTROYED), 0);

            // Payload destructor still running: its thread frees for us.
            if old & DESTROYING != 0 {
                return;
            }
            Self::free(this);
        }
    }

    unsafe fn free(this: *mut Self) {
        // SAFETY: both destruction flags observed; nobody else touches the
        // block. The allocator is moved out before its memory goes away.
        unsafe {
            let alloc = ManuallyDrop::take(&mut (*this).alloc);
            alloc.deallocate(this as *mut u8, Layout::new::<Self>());
        }
    }
}

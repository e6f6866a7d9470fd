//! Thread parking behind the atomic `wait`/`notify` operations.
//!
//! Waiters are keyed by the address of the atomic they block on and kept
//! in a small fixed array of buckets. Each bucket pairs its waiter list
//! with a spin flag; the critical sections only push, scan, or remove a
//! list entry, so contention is a handful of instructions wide and a
//! closure-scoped lock is all the structure that is needed. Parking and
//! waking go through `std::thread::park`/`unpark` with a per-waiter wake
//! flag, so a notify that races with registration is never lost.

use std::cell::UnsafeCell;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

struct Waiter {
    thread: Thread,
    woken: AtomicBool,
}

/// One slot of the registry: a waiter list guarded by a spin flag.
struct Bucket {
    busy: AtomicBool,
    waiters: UnsafeCell<Vec<(usize, Arc<Waiter>)>>,
}

// SAFETY: `waiters` is only touched inside `with_waiters`, which spins on
// `busy` until it holds the flag exclusively.
unsafe impl Sync for Bucket {}

impl Bucket {
    const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            waiters: UnsafeCell::new(Vec::new()),
        }
    }

    /// Runs `f` on the waiter list while holding the bucket's spin flag.
    ///
    /// Waiting on the flag reads relaxed until it looks free, so the line
    /// stays shared between contenders.
    fn with_waiters<R>(&self, f: impl FnOnce(&mut Vec<(usize, Arc<Waiter>)>) -> R) -> R {
        loop {
            while self.busy.load(Ordering::Relaxed) {
                spin_loop();
            }
            if !self.busy.swap(true, Ordering::Acquire) {
                break;
            }
        }
        // SAFETY: the flag is held; no other thread touches the list until
        // the release below.
        let result = f(unsafe { &mut *self.waiters.get() });
        self.busy.store(false, Ordering::Release);
        result
    }
}

const BUCKET_COUNT: usize = 64;

static BUCKETS: [Bucket; BUCKET_COUNT] = {
    const B: Bucket = Bucket::new();
    [B; BUCKET_COUNT]
};

#[inline]
fn bucket_for(addr: usize) -> &'static Bucket {
    // Atomics are at least 8-byte aligned; drop the dead low bits.
    &BUCKETS[(addr >> 3) & (BUCKET_COUNT - 1)]
}

/// Parks the current thread until a notify on `addr` arrives or
/// `still_blocked` turns false.
///
/// `still_blocked` is re-evaluated after registration, so a value change
/// that slips in between the caller's own check and the park cannot be
/// missed. Spurious returns are allowed; callers loop.
pub(crate) fn wait(addr: usize, still_blocked: impl Fn() -> bool) {
    let waiter = Arc::new(Waiter {
        thread: thread::current(),
        woken: AtomicBool::new(false),
    });
    let bucket = bucket_for(addr);
    bucket.with_waiters(|list| list.push((addr, waiter.clone())));

    if still_blocked() {
        while !waiter.woken.load(Ordering::Acquire) {
            thread::park();
            if !still_blocked() {
                break;
            }
        }
    }

    bucket.with_waiters(|list| {
        if let Some(pos) = list.iter().position(|(_, w)| Arc::ptr_eq(w, &waiter)) {
            list.swap_remove(pos);
        }
    });
}

/// Wakes one waiter registered for `addr`.
pub(crate) fn notify_one(addr: usize) {
    bucket_for(addr).with_waiters(|list| {
        for (a, w) in list.iter() {
            if *a == addr && !w.woken.swap(true, Ordering::AcqRel) {
                w.thread.unpark();
                return;
            }
        }
    });
}

/// Wakes every waiter registered for `addr`.
pub(crate) fn notify_all(addr: usize) {
    bucket_for(addr).with_waiters(|list| {
        for (a, w) in list.iter() {
            if *a == addr && !w.woken.swap(true, Ordering::AcqRel) {
                w.thread.unpark();
            }
        }
    });
}

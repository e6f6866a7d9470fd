//! Multi-thread scenario tests.
//!
//! Thread counts stay at 2–4 per test because the harness runs test
//! binaries in parallel; iteration counts carry the load instead. Every
//! scenario uses a drop-counting payload so the final assertion pins the
//! whole reference accounting: created == destroyed, each exactly once.

use ortak::{AtomicShared, Shared};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

/// Increments a counter on drop.
#[derive(Debug)]
struct DropCounter {
    counter: Arc<AtomicUsize>,
}

impl DropCounter {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        Self { counter }
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_n<F>(n: usize, f: F) -> Vec<thread::JoinHandle<()>>
where
    F: Fn(usize) + Send + Sync + 'static,
{
    let f = Arc::new(f);
    (0..n)
        .map(|tid| {
            let f = f.clone();
            thread::spawn(move || f(tid))
        })
        .collect()
}

// ============================================================================
// Scenario: pure load throughput
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn load_throughput_keeps_every_payload_alive() {
    const READERS: usize = 4;
    const CELLS: usize = 8;
    const ITERATIONS: usize = 20_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let cells: Arc<Vec<AtomicShared<DropCounter>>> = Arc::new(
        (0..CELLS)
            .map(|_| AtomicShared::new(Shared::new(DropCounter::new(drops.clone()))))
            .collect(),
    );

    let handles = spawn_n(READERS, {
        let cells = cells.clone();
        move |tid| {
            for i in 0..ITERATIONS {
                let seen = cells[(tid + i) % CELLS].load(Ordering::Acquire);
                assert!(!seen.is_null());
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    // Nothing died while the cells were only being read.
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    for cell in cells.iter() {
        assert!(cell.load(Ordering::SeqCst).use_count() >= 1);
    }

    drop(
        Arc::try_unwrap(cells)
            .ok()
            .expect("readers joined, no other owner"),
    );
    assert_eq!(drops.load(Ordering::SeqCst), CELLS);
}

// ============================================================================
// Scenario: pure store churn
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn store_churn_destroys_each_payload_exactly_once() {
    const WRITERS: usize = 4;
    const CELLS: usize = 4;
    const ITERATIONS: usize = 5_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let cells: Arc<Vec<AtomicShared<DropCounter>>> =
        Arc::new((0..CELLS).map(|_| AtomicShared::null()).collect());

    let handles = spawn_n(WRITERS, {
        let cells = cells.clone();
        let drops = drops.clone();
        move |tid| {
            for i in 0..ITERATIONS {
                let fresh = Shared::new(DropCounter::new(drops.clone()));
                cells[(tid + i) % CELLS].store(fresh, Ordering::Release);
            }
        }
    });
    for h in handles {
        h.join().unwrap();
    }

    let created = WRITERS * ITERATIONS;
    // Exactly the finally-resident payloads are still alive.
    assert_eq!(drops.load(Ordering::SeqCst), created - CELLS);

    drop(
        Arc::try_unwrap(cells)
            .ok()
            .expect("writers joined, no other owner"),
    );
    assert_eq!(drops.load(Ordering::SeqCst), created);
}

// ============================================================================
// Scenario: exchange ring
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn exchange_ring_conserves_payload_count() {
    const THREADS: usize = 4;
    const CELLS: usize = 4;
    const ITERATIONS: usize = 5_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let cells: Arc<Vec<AtomicShared<DropCounter>>> = Arc::new(
        (0..CELLS)
            .map(|_| AtomicShared::new(Shared::new(DropCounter::new(drops.clone()))))
            .collect(),
    );

    let workers: Vec<_> = (0..THREADS)
        .map(|tid| {
            let cells = cells.clone();
            let drops = drops.clone();
            thread::spawn(move || {
                // Each thread circulates one payload through the ring and
                // hands its final handle back to the test.
                let mut local = Shared::new(DropCounter::new(drops.clone()));
                for i in 0..ITERATIONS {
                    local = cells[(tid + i) % CELLS].swap(local, Ordering::AcqRel);
                    // A cell can hand out null only if it was seeded null.
                    assert!(!local.is_null());
                }
                local
            })
        })
        .collect();

    let finals: Vec<Shared<DropCounter>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    // Swapping never creates or destroys: all payloads still live.
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(finals);
    drop(
        Arc::try_unwrap(cells)
            .ok()
            .expect("threads joined, no other owner"),
    );
    assert_eq!(drops.load(Ordering::SeqCst), CELLS + THREADS);
}

// ============================================================================
// Scenario: CAS consensus between two handles
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn cas_consensus_settles_on_one_of_two_payloads() {
    const ITERATIONS: usize = 5_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let a = Shared::new(DropCounter::new(drops.clone()));
    let b = Shared::new(DropCounter::new(drops.clone()));
    let cell = Arc::new(AtomicShared::new(a.clone()));

    let flip = |cell: Arc<AtomicShared<DropCounter>>, from: Shared<DropCounter>, to: Shared<DropCounter>| {
        thread::spawn(move || {
            for _ in 0..ITERATIONS {
                let mut expected = from.clone();
                let _ = cell.compare_exchange_clone(
                    &mut expected,
                    &to,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        })
    };

    let t1 = flip(cell.clone(), a.clone(), b.clone());
    let t2 = flip(cell.clone(), b.clone(), a.clone());
    t1.join().unwrap();
    t2.join().unwrap();

    let resident = cell.load(Ordering::SeqCst);
    assert!(resident.ptr_eq(&a) || resident.ptr_eq(&b));
    // Both payloads survived the whole fight.
    assert_eq!(drops.load(Ordering::SeqCst), 0);

    drop(resident);
    drop(cell.swap(Shared::null(), Ordering::AcqRel));
    drop(a);
    drop(b);
    assert_eq!(drops.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Scenario: weak expiration race
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn weak_upgrades_expire_monotonically() {
    const PROBES: usize = 50_000;

    let strong = Shared::new(7u64);
    let weak = strong.downgrade();
    let release = Arc::new(AtomicBool::new(false));

    let dropper = {
        let release = release.clone();
        thread::spawn(move || {
            while !release.load(Ordering::Acquire) {
                std::hint::spin_loop();
            }
            drop(strong);
        })
    };

    let mut outcomes = Vec::with_capacity(PROBES);
    for i in 0..PROBES {
        if i == PROBES / 4 {
            release.store(true, Ordering::Release);
        }
        outcomes.push(!weak.upgrade().is_null());
    }
    dropper.join().unwrap();

    // Once the payload is gone it can never come back: the outcome
    // sequence is a run of successes followed by a run of failures.
    let first_failure = outcomes.iter().position(|ok| !ok);
    if let Some(pos) = first_failure {
        assert!(outcomes[pos..].iter().all(|ok| !ok), "payload resurrected");
    }
    assert!(weak.upgrade().is_null());
}

// ============================================================================
// Scenario: mixed readers and writers
// ============================================================================

#[test]
#[cfg_attr(miri, ignore)]
fn mixed_load_store_churn_is_leak_free() {
    const READERS: usize = 2;
    const WRITERS: usize = 2;
    const ITERATIONS: usize = 10_000;

    let drops = Arc::new(AtomicUsize::new(0));
    let cell: Arc<AtomicShared<DropCounter>> =
        Arc::new(AtomicShared::new(Shared::new(DropCounter::new(drops.clone()))));

    let mut handles = Vec::new();
    for _ in 0..READERS {
        let cell = cell.clone();
        handles.push(thread::spawn(move || {
            for _ in 0..ITERATIONS {
                let seen = cell.load(Ordering::Acquire);
                // A writer may have stored null; both outcomes are legal,
                // torn state is not.
                drop(seen);
            }
        }));
    }
    for tid in 0..WRITERS {
        let cell = cell.clone();
        let drops = drops.clone();
        handles.push(thread::spawn(move || {
            for i in 0..ITERATIONS {
                if (tid + i) % 16 == 0 {
                    cell.store(Shared::null(), Ordering::Release);
                } else {
                    cell.store(Shared::new(DropCounter::new(drops.clone())), Ordering::Release);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // ITERATIONS is a multiple of 16, so every writer stores null exactly
    // ITERATIONS / 16 times regardless of its tid offset.
    let created = 1 + WRITERS * ITERATIONS - WRITERS * (ITERATIONS / 16);
    let resident = if cell.load(Ordering::SeqCst).is_null() {
        0
    } else {
        1
    };
    assert_eq!(drops.load(Ordering::SeqCst), created - resident);

    drop(
        Arc::try_unwrap(cell)
            .ok()
            .expect("threads joined, no other owner"),
    );
    assert_eq!(drops.load(Ordering::SeqCst), created);
}

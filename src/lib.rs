//! Ortak: lock-free atomic shared pointers with split reference counting.
//!
//! Ortak provides three cooperating handle families — [`Shared<T>`],
//! [`Weak<T>`], and the cache-line-aligned atomic cell
//! [`AtomicShared<T>`] — so that concurrent threads can publish, observe,
//! and exchange shared references to a heap payload without mutual
//! exclusion. The payload is destroyed exactly when the last strong
//! reference disappears.
//!
//! # Key Properties
//!
//! - **Single-word cells**: each cell is one 64-bit atomic carrying a
//!   48-bit pointer and a 16-bit observer counter
//! - **Lock-Free Progress**: no internal locks; plain loads and stores
//!   are wait-free
//! - **Split counting**: per-cell counters amortise control-block traffic
//! - **Exact destruction ordering**: payload first, control block second,
//!   each exactly once under any schedule
//!
//! # Example
//!
//! ```rust
//! use ortak::{AtomicShared, Shared};
//! use std::sync::atomic::Ordering;
//!
//! // A producer publishes a payload.
//! let cell = AtomicShared::new(Shared::new(String::from("config v1")));
//!
//! // Observers turn the cell's counter into fresh strong handles.
//! let seen = cell.load(Ordering::Acquire);
//! assert_eq!(seen.as_ref().map(String::as_str), Some("config v1"));
//!
//! // Publishing a replacement releases the old payload once the last
//! // observer lets go.
//! cell.store(Shared::new(String::from("config v2")), Ordering::Release);
//! assert_eq!(*cell.load(Ordering::Acquire), "config v2");
//! ```

#![warn(missing_docs)]

mod atomic;
mod counted;
mod header;
mod paired;
mod shared;
mod signal;
mod utils;
mod weak;

pub use atomic::AtomicShared;
pub use counted::{AtomicCountedPtr, CountedPtr};
pub use header::{BlockAlloc, Heap};
pub use paired::{AtomicPairedCount, PairedCount};
pub use shared::Shared;
pub use weak::Weak;

// Re-export for convenience
pub use core::sync::atomic::Ordering;

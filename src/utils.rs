//! Cache-line alignment support for the atomic cell.

use core::ops::Deref;

// Cache line sizes per architecture.
// x86/x86_64: 64B, aarch64: 128B (Apple M-series / Neoverse), s390x: 256B.
// Fallback: 64B (most common).

#[cfg(target_arch = "s390x")]
#[repr(align(256))]
#[derive(Debug, Default)]
pub(crate) struct CacheAligned<T> {
    data: T,
}

#[cfg(target_arch = "aarch64")]
#[repr(align(128))]
#[derive(Debug, Default)]
pub(crate) struct CacheAligned<T> {
    data: T,
}

#[cfg(not(any(target_arch = "s390x", target_arch = "aarch64")))]
#[repr(align(64))]
#[derive(Debug, Default)]
pub(crate) struct CacheAligned<T> {
    data: T,
}

impl<T> CacheAligned<T> {
    pub(crate) const fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.data
    }
}

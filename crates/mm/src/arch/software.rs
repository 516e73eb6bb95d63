//! Software backend for testing and development on a host OS.
//!
//! Page tables live in the emulated arena and use the same geometry and entry
//! encoding as the hardware backend, so the walker runs unmodified. There is
//! no TLB; flushes are counted so tests can assert that operations requested
//! the shootdowns they should.

use core::sync::atomic::{AtomicUsize, Ordering};

static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);

/// Records a full-TLB flush request.
#[inline]
pub fn flush_tlb_all() {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

/// Returns the number of full-TLB flushes requested so far.
pub fn tlb_flush_count() -> usize {
    TLB_FLUSHES.load(Ordering::Relaxed)
}

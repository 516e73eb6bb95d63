//! Architecture support for the memory manager.
//!
//! The page-table geometry here is the x86_64 4-level layout and is shared by
//! both backends: the software backend walks identically-shaped tables in an
//! emulated arena, so allocator and walker behavior is the same whether the
//! crate runs on hardware or under `cargo test`. Only the TLB and control
//! register plumbing differs per backend.

mod pte;

pub use pte::PageEntry;

// Use the x86_64 hardware implementation when we're on x86_64 and not testing or
// emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(all(target_arch = "x86_64"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;

/// Log2 of the base page size.
pub const PAGE_SHIFT: usize = 12;

/// Base page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Bits of virtual address consumed by one page-table level.
pub const INDEX_BITS: usize = 9;

/// Number of entries in one page table.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Number of page-table levels (4-level paging).
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of leaf page sizes the walker may map (4 KiB and 2 MiB).
pub const NR_PAGE_SIZES: usize = 2;

/// Large page size in bytes (2 MiB, a level-1 leaf).
pub const HUGE_PAGE_SIZE: usize = level_span(1);

/// Maximum number of bits in a physical address.
///
/// Typically 52 on modern parts; 48 is a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Returns the page-table index for a virtual address at the given level.
///
/// Level 0 is the page table, level 3 the root. Each level consumes 9 bits,
/// starting at bit 12.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    let shift = PAGE_SHIFT + level * INDEX_BITS;
    (address >> shift) & (ENTRIES_PER_TABLE - 1)
}

/// Returns the number of bytes one entry spans at the given level.
///
/// A level-0 entry maps one 4 KiB page, a level-1 entry 2 MiB, and so on.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + level * INDEX_BITS)
}

/// Returns the mask selecting the address bits above one entry's span at the
/// given level.
#[inline]
pub const fn level_mask(level: usize) -> usize {
    !(level_span(level) - 1)
}

/// Sign-extends bit 47 of a virtual address to bits 48-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    ((addr as i64) << (64 - MAX_VIRTUAL_BITS) >> (64 - MAX_VIRTUAL_BITS)) as usize
}

//! Page-table entry encoding.
//!
//! One 64-bit entry either points at a next-level table, maps a leaf page
//! (4 KiB, or 2 MiB when the large flag is set at level 1), or is empty.
//! Bit 9 is a software bit marking copy-on-write mappings. Bit 51 is reserved
//! by the hardware and deliberately set on entries whose permissions have all
//! been revoked, so that the entry stays distinguishable from a never-mapped
//! one while still faulting on access.

use crate::PhysicalAddress;

/// Mask selecting the physical address bits of an entry. Capped at 48 bits
/// so the reserved marker bit above never reads back as part of an address.
const ADDRESS_MASK: u64 = 0x0000_ffff_ffff_f000;

const VALID_BIT: u64 = 1 << 0;
const WRITABLE_BIT: u64 = 1 << 1;
const USER_BIT: u64 = 1 << 2;
const ACCESSED_BIT: u64 = 1 << 5;
const DIRTY_BIT: u64 = 1 << 6;
const LARGE_BIT: u64 = 1 << 7;
const COW_BIT: u64 = 1 << 9;
const RSVD_BIT: u64 = 1 << 51;
const NX_BIT: u64 = 1 << 63;

/// A single page-table entry value.
///
/// This is a plain value type; writing an entry into an actual table slot goes
/// through the walker's slot abstraction so that racing faults use atomic
/// compare-exchange.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// The empty (never mapped) entry.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Reconstructs an entry from its raw bits.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw bits of the entry.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Returns true if the entry has never been mapped.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the entry is present to the hardware.
    #[inline]
    pub const fn valid(self) -> bool {
        self.0 & VALID_BIT != 0
    }

    /// Sets the present bit.
    #[inline]
    pub fn set_valid(&mut self, valid: bool) {
        self.set_bit(VALID_BIT, valid);
    }

    /// Returns true if the mapping is writable.
    #[inline]
    pub const fn writable(self) -> bool {
        self.0 & WRITABLE_BIT != 0
    }

    /// Sets the writable bit.
    #[inline]
    pub fn set_writable(&mut self, writable: bool) {
        self.set_bit(WRITABLE_BIT, writable);
    }

    /// Returns true if the mapping is executable (no-execute bit clear).
    #[inline]
    pub const fn executable(self) -> bool {
        self.0 & NX_BIT == 0
    }

    /// Sets or clears the no-execute bit.
    #[inline]
    pub fn set_executable(&mut self, executable: bool) {
        self.set_bit(NX_BIT, !executable);
    }

    /// Returns true if the mapping is reachable from user mode.
    #[inline]
    pub const fn user(self) -> bool {
        self.0 & USER_BIT != 0
    }

    /// Sets the user-accessible bit.
    #[inline]
    pub fn set_user(&mut self, user: bool) {
        self.set_bit(USER_BIT, user);
    }

    /// Returns true if the hardware has recorded an access.
    #[inline]
    pub const fn accessed(self) -> bool {
        self.0 & ACCESSED_BIT != 0
    }

    /// Sets the accessed bit.
    #[inline]
    pub fn set_accessed(&mut self, accessed: bool) {
        self.set_bit(ACCESSED_BIT, accessed);
    }

    /// Returns true if the hardware has recorded a write.
    #[inline]
    pub const fn dirty(self) -> bool {
        self.0 & DIRTY_BIT != 0
    }

    /// Sets the dirty bit.
    #[inline]
    pub fn set_dirty(&mut self, dirty: bool) {
        self.set_bit(DIRTY_BIT, dirty);
    }

    /// Returns true if the entry maps a large leaf page rather than a table.
    ///
    /// Only meaningful above level 0; at level 0 the bit position encodes a
    /// memory attribute instead and must not be interpreted as large.
    #[inline]
    pub const fn large(self) -> bool {
        self.0 & LARGE_BIT != 0
    }

    /// Sets the large-page bit.
    #[inline]
    pub fn set_large(&mut self, large: bool) {
        self.set_bit(LARGE_BIT, large);
    }

    /// Returns true if the entry is marked copy-on-write.
    #[inline]
    pub const fn cow(self) -> bool {
        self.0 & COW_BIT != 0
    }

    /// Sets the copy-on-write software bit.
    #[inline]
    pub fn set_cow(&mut self, cow: bool) {
        self.set_bit(COW_BIT, cow);
    }

    /// Marks or unmarks the entry copy-on-write, revoking hardware write
    /// permission while marked so the first write faults.
    #[inline]
    pub fn mark_cow(&mut self, cow: bool) {
        if cow {
            self.set_writable(false);
        }
        self.set_cow(cow);
    }

    /// Returns true if the reserved bit is set.
    #[inline]
    pub const fn rsvd(self) -> bool {
        self.0 & RSVD_BIT != 0
    }

    /// Sets the reserved bit, making any access fault while the entry remains
    /// present.
    #[inline]
    pub fn set_rsvd(&mut self, rsvd: bool) {
        self.set_bit(RSVD_BIT, rsvd);
    }

    /// Returns the physical address the entry points at.
    #[inline]
    pub const fn addr(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & ADDRESS_MASK) as usize)
    }

    /// Replaces the physical address bits of the entry.
    #[inline]
    pub fn set_addr(&mut self, addr: PhysicalAddress) {
        debug_assert!(addr.is_aligned(crate::arch::PAGE_SIZE));
        self.0 = (self.0 & !ADDRESS_MASK) | (addr.as_u64() & ADDRESS_MASK);
    }

    /// Builds an entry pointing at a next-level table.
    #[inline]
    pub const fn intermediate(table: PhysicalAddress) -> Self {
        Self(VALID_BIT | WRITABLE_BIT | (table.as_u64() & ADDRESS_MASK))
    }

    /// Builds a bare leaf entry for the given physical address.
    ///
    /// The caller applies permissions afterwards; the entry starts valid and
    /// non-writable.
    #[inline]
    pub const fn leaf(addr: PhysicalAddress, large: bool) -> Self {
        let large_bit = if large { LARGE_BIT } else { 0 };
        Self(VALID_BIT | large_bit | (addr.as_u64() & ADDRESS_MASK))
    }

    #[inline]
    fn set_bit(&mut self, bit: u64, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageEntry")
            .field("raw", &format_args!("{:#x}", self.0))
            .field("valid", &self.valid())
            .field("writable", &self.writable())
            .field("large", &self.large())
            .field("cow", &self.cow())
            .field("addr", &self.addr())
            .finish()
    }
}

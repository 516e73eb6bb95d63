//! Physical and virtual address types and the physical-memory translation seam.
//!
//! Every intrusive structure this crate maintains (free-range headers, pool free
//! lists, page tables) lives inside the physical memory it manages. All pointer
//! access to that memory goes through the [`AddressTranslator`], which is either
//! a fixed-offset direct map on a real kernel or a host-side arena when the
//! crate is built for software emulation.

use core::fmt;

use crate::arch;

/// Implements the operations common to both address newtypes.
macro_rules! impl_address_common {
    ($name:ident) => {
        impl $name {
            /// Creates a new address from a raw value.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            /// The zero address.
            pub const ZERO: Self = Self(0);

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a `u64`.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Returns true if the address is aligned to `align` bytes.
            ///
            /// `align` must be a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the previous multiple of `align`.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the next multiple of `align`.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the address advanced by `offset` bytes.
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// Returns the address moved back by `offset` bytes.
            #[inline]
            pub const fn sub(self, offset: usize) -> Self {
                Self(self.0 - offset)
            }

            /// Returns the distance in bytes from `other` to this address.
            #[inline]
            pub const fn offset_from(self, other: Self) -> usize {
                self.0 - other.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

/// An address in physical memory.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl_address_common!(PhysicalAddress);

impl PhysicalAddress {
    /// Returns the index of the page frame containing this address.
    #[inline]
    pub const fn page_index(self) -> usize {
        self.0 >> arch::PAGE_SHIFT
    }

    /// Returns true if the address fits the architecture's physical address width.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 < (1usize << arch::MAX_PHYSICAL_BITS)
    }
}

/// An address in the kernel's virtual address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl_address_common!(VirtualAddress);

impl VirtualAddress {
    /// Creates a virtual address from a raw pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the address as a const pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns true if the address is canonical for the architecture.
    #[inline]
    pub const fn is_canonical(self) -> bool {
        arch::canonicalize_virtual(self.0) == self.0
    }
}

/// Translates between physical addresses and dereferencable pointers.
///
/// On a real kernel all of physical memory is mapped at a fixed virtual offset
/// (the direct map) and translation is plain offset arithmetic. Under software
/// emulation physical memory is an ordinary host allocation and "physical"
/// addresses are offsets into it. Exactly one translator is installed per
/// kernel (or, in tests, per thread) before any memory is donated to the
/// subsystem.
pub enum AddressTranslator {
    /// Physical memory is linearly mapped at `direct_map_base`.
    Hardware {
        /// Virtual address where physical address zero is mapped.
        direct_map_base: usize,
    },
    /// Physical memory is emulated by a host-side arena.
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map base address.
    ///
    /// The base must be aligned to the largest page size, so that alignment
    /// of a direct-map pointer implies the same alignment of the physical
    /// address behind it.
    pub const fn hardware(direct_map_base: usize) -> Self {
        assert!(direct_map_base % arch::HUGE_PAGE_SIZE == 0);
        Self::Hardware { direct_map_base }
    }

    /// Creates a software-emulated translator backed by a fresh arena of `size` bytes.
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Translates a physical address to a dereferencable pointer.
    #[inline]
    pub fn translate(&self, phys: PhysicalAddress) -> *mut u8 {
        match self {
            Self::Hardware { direct_map_base } => {
                (direct_map_base + phys.as_usize()) as *mut u8
            }
            Self::Emulated(arena) => arena.translate(phys.as_usize()),
        }
    }

    /// Translates a pointer obtained from [`translate`](Self::translate) back to
    /// its physical address.
    #[inline]
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        match self {
            Self::Hardware { direct_map_base } => {
                PhysicalAddress::new(ptr as usize - direct_map_base)
            }
            Self::Emulated(arena) => PhysicalAddress::new(arena.ptr_to_phys(ptr as *const u8)),
        }
    }

    /// Returns true if `ptr` points into translated physical memory.
    ///
    /// Pointers outside this window belong to virtual mappings and must be
    /// resolved through the page tables instead.
    #[inline]
    pub fn contains_ptr<T>(&self, ptr: *const T) -> bool {
        match self {
            Self::Hardware { direct_map_base } => (ptr as usize) >= *direct_map_base,
            Self::Emulated(arena) => arena.contains(ptr as *const u8),
        }
    }

    /// Returns the number of bytes of physical memory the translator can reach,
    /// if bounded.
    pub fn span(&self) -> Option<usize> {
        match self {
            Self::Hardware { .. } => None,
            Self::Emulated(arena) => Some(arena.size()),
        }
    }

    /// Installs the process-wide translator. May only be called once.
    #[cfg(not(any(test, feature = "software-emulation")))]
    pub fn set_current(translator: AddressTranslator) -> &'static AddressTranslator {
        CURRENT.call_once(|| translator)
    }

    /// Installs this thread's translator, leaking it to obtain a `'static`
    /// reference that other threads may [`adopt`](Self::adopt).
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn set_current(translator: AddressTranslator) -> &'static AddressTranslator {
        let leaked: &'static AddressTranslator = alloc::boxed::Box::leak(alloc::boxed::Box::new(translator));
        Self::adopt(leaked);
        leaked
    }

    /// Makes an already-installed translator current for this thread.
    ///
    /// Threads standing in for secondary CPUs share one arena by adopting the
    /// translator the first thread installed.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn adopt(translator: &'static AddressTranslator) {
        CURRENT.with(|current| current.set(Some(translator)));
    }

    /// Returns the installed translator.
    ///
    /// # Panics
    ///
    /// Panics if no translator has been installed.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!("no address translator installed"),
        }
    }

    /// Returns the installed translator, or `None` if none has been installed.
    #[cfg(not(any(test, feature = "software-emulation")))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        CURRENT.get()
    }

    /// Returns this thread's translator, or `None` if none has been installed.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        CURRENT.with(|current| current.get())
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static CURRENT: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static CURRENT: core::cell::Cell<Option<&'static AddressTranslator>> =
        const { core::cell::Cell::new(None) };
}

/// Host-side arena standing in for physical memory.
///
/// Physical addresses are byte offsets into the arena. The arena is only ever
/// accessed through raw pointers handed out by [`translate`](Self::translate),
/// the same way a kernel pokes at direct-mapped physical pages. The usable
/// region starts at a huge-page-aligned host address so that alignment of an
/// arena pointer implies the same alignment of its physical address.
pub struct EmulatedMemory {
    backing: alloc::vec::Vec<u8>,
    base_offset: usize,
    size: usize,
}

impl EmulatedMemory {
    /// Creates an arena of `size` usable bytes, zero-initialized.
    pub fn new(size: usize) -> Self {
        let backing = alloc::vec![0u8; size + arch::HUGE_PAGE_SIZE];
        let misalign = backing.as_ptr() as usize & (arch::HUGE_PAGE_SIZE - 1);
        let base_offset = if misalign == 0 {
            0
        } else {
            arch::HUGE_PAGE_SIZE - misalign
        };
        Self {
            backing,
            base_offset,
            size,
        }
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        unsafe { self.backing.as_ptr().add(self.base_offset) as *mut u8 }
    }

    /// Translates a physical address (arena offset) to a pointer.
    #[inline]
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        unsafe { self.base().add(phys) }
    }

    /// Translates an arena pointer back to its physical address.
    #[inline]
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.base()) };
        assert!(
            offset >= 0 && (offset as usize) < self.size,
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns true if `ptr` points into the arena.
    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.size
    }

    /// Returns the arena size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

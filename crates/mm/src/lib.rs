#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Vela Memory Manager
//!
//! Kernel-level memory management for the Vela operating system. It
//! provides:
//!
//! - Physical page allocation with per-CPU caches over a central range
//!   allocator.
//! - A kernel heap and the C-style allocation surface on top of it.
//! - Demand-paged virtual memory areas with huge-page support.
//! - Watermark-driven reclamation with pluggable shrinkers.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod garbage;
mod human_size;
pub mod malloc;
mod memory_manager;
mod page_ranges;
mod pool;
mod reclaimer;
pub mod sched;
pub mod vma;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use human_size::HumanSize;
pub use memory_manager::{MemoryManager, MemoryParams};
pub use reclaimer::{PressureLevel, ReclaimStats, Reclaimer, Shrinker, ShrinkerId};

#[cfg(any(test, feature = "software-emulation"))]
pub use memory_manager::emulation;

pub use arch::{HUGE_PAGE_SIZE, PAGE_SIZE, PageEntry};

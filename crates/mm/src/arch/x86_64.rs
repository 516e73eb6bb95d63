//! x86_64 hardware backend: TLB maintenance and CR3 interop.

use crate::PhysicalAddress;

/// Flushes the entire TLB on the current CPU by reloading CR3.
///
/// Range operations batch their modifications and call this once at the end
/// rather than issuing per-page invalidations.
#[inline]
pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

/// Returns the physical address of the root page table currently loaded in CR3.
pub fn current_root_table() -> PhysicalAddress {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64() as usize)
}

/// Loads the given root page table into CR3.
///
/// # Safety
///
/// The table must map all memory the kernel is currently executing from, or
/// the processor will fault on the next instruction fetch.
pub unsafe fn load_root_table(root: PhysicalAddress) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
    unsafe { Cr3::write(frame, Cr3Flags::empty()) };
}

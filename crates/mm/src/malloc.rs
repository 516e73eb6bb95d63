//! The heap surface: `malloc`, `free` and relatives.
//!
//! Requests route by size. Anything up to a quarter page comes from the
//! per-CPU pools, anything up to one page gets a whole page, and everything
//! larger becomes a large object: pages from the range allocator with the
//! range header left in place just below the returned pointer, so `free`
//! needs no size argument. Huge non-contiguous requests bypass physical
//! contiguity entirely and live in an anonymous mapping whose first word
//! records the mapped size.
//!
//! `free` works backwards from the bare pointer: pointers outside the
//! physical-memory window belong to mappings, and for everything else the
//! page-kind table names the front-end that handed the page out.

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;

use crate::address::VirtualAddress;
use crate::arch::{HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::human_size::HumanSize;
use crate::memory_manager::MemoryManager;
use crate::page_ranges::{PageKind, PageRange};
use crate::pool::{Pool, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE};
use crate::vma::{self, MmapError, MmapFlags, Perm};

/// Default allocation alignment, the `max_align_t` of this heap.
pub const MALLOC_ALIGNMENT: usize = 16;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Allocates `size` bytes aligned to 16, or to the next power of two above
/// `size` for smaller requests.
pub fn malloc(mm: &MemoryManager, size: usize) -> *mut u8 {
    let alignment = size.next_power_of_two().clamp(1, MALLOC_ALIGNMENT);
    std_malloc(mm, size, alignment)
}

/// Allocates `size` bytes zeroed, checking the element-count product for
/// overflow.
pub fn calloc(mm: &MemoryManager, nmemb: usize, elem_size: usize) -> *mut u8 {
    let Some(bytes) = nmemb.checked_mul(elem_size) else {
        return ptr::null_mut();
    };
    let obj = malloc(mm, bytes);
    if !obj.is_null() {
        unsafe { ptr::write_bytes(obj, 0, bytes) };
    }
    obj
}

/// Allocates with an explicit power-of-two alignment. Returns null for
/// non-power-of-two alignments.
pub fn aligned_alloc(mm: &MemoryManager, alignment: usize, size: usize) -> *mut u8 {
    if !alignment.is_power_of_two() {
        return ptr::null_mut();
    }
    std_malloc(mm, size, alignment)
}

/// POSIX-shaped aligned allocation. The alignment must be a power of two
/// and a multiple of the pointer size.
pub fn posix_memalign(
    mm: &MemoryManager,
    alignment: usize,
    size: usize,
) -> Result<*mut u8, MmapError> {
    if !alignment.is_power_of_two() || alignment % mem::size_of::<usize>() != 0 {
        return Err(MmapError::InvalidArgument);
    }
    let obj = std_malloc(mm, size, alignment);
    if obj.is_null() {
        return Err(MmapError::OutOfMemory);
    }
    Ok(obj)
}

fn std_malloc(mm: &MemoryManager, size: usize, alignment: usize) -> *mut u8 {
    let minimum = size.max(MIN_OBJECT_SIZE);
    let obj = if mm.smp_ready()
        && minimum <= MAX_OBJECT_SIZE
        && alignment <= minimum.next_power_of_two()
    {
        // Pool objects are naturally aligned to their own size class.
        mm.pool_for(minimum).alloc(mm)
    } else if size <= PAGE_SIZE && alignment <= PAGE_SIZE {
        let page = mm.alloc_page();
        mm.note_page_kind(page, PageKind::PageBuffer);
        mm.translator().translate(page)
    } else {
        malloc_large(mm, size, alignment, true, false)
    };
    log::trace!("malloc {} align {} -> {:p}", size, alignment, obj);
    obj
}

/// Byte offset from a large object's range start to the returned pointer.
/// The range header must survive underneath it.
fn large_offset(alignment: usize) -> usize {
    if alignment < PAGE_SIZE {
        align_up(mem::size_of::<PageRange>(), alignment)
    } else {
        PAGE_SIZE
    }
}

/// Recovers a large object's range header: the base of the pointer's own
/// page, or of the page before it when the pointer is page-aligned.
fn large_header(obj: *mut u8) -> *mut PageRange {
    ((obj as usize - 1) & !(PAGE_SIZE - 1)) as *mut PageRange
}

/// Allocates a large object.
///
/// Contiguous requests come from the range allocator, blocking through the
/// reclaimer when `block` is set and failing with null otherwise.
/// Non-contiguous requests fall back to an anonymous mapping, immediately
/// for huge sizes and as a last resort when contiguous memory ran out; the
/// mapping is made outside the range lock.
pub(crate) fn malloc_large(
    mm: &MemoryManager,
    requested: usize,
    alignment: usize,
    block: bool,
    contiguous: bool,
) -> *mut u8 {
    let offset = large_offset(alignment);
    let size = align_up(requested + offset, PAGE_SIZE);

    if size >= HUGE_PAGE_SIZE && !contiguous {
        if let Some(obj) = mapped_malloc_large(mm, size, offset) {
            return obj;
        }
    }

    loop {
        let ranges = mm.lock_ranges();
        let mut ranges = mm.reclaimer().wait_for_minimum_memory(mm, ranges);
        let header = if alignment > PAGE_SIZE {
            ranges.alloc_aligned(size, PAGE_SIZE, alignment, false)
        } else {
            ranges.alloc(size, contiguous)
        };
        if let Some(pr) = header {
            let phys = ranges.range_phys(pr);
            ranges.set_page_kind(phys, PageKind::LargeHead);
            if offset == PAGE_SIZE {
                ranges.set_page_kind(phys.add(PAGE_SIZE), PageKind::LargeBody);
            }
            drop(ranges);
            mm.reclaimer().on_alloc(size);
            let obj = unsafe { (pr as *mut u8).add(offset) };
            log::trace!(
                "malloc_large {} ({} with header) align {} -> {:p}",
                requested,
                size,
                alignment,
                obj
            );
            return obj;
        }
        if !contiguous {
            drop(ranges);
            break;
        }
        if !block {
            return ptr::null_mut();
        }
        mm.reclaimer().wait_for_memory(mm, ranges, size);
    }

    match mapped_malloc_large(mm, size, offset) {
        Some(obj) => obj,
        None => ptr::null_mut(),
    }
}

pub(crate) fn free_large(mm: &MemoryManager, obj: *mut u8) {
    let pr = large_header(obj);
    let size = unsafe { (*pr).size() };
    let mut ranges = mm.lock_ranges();
    ranges.free(pr);
    drop(ranges);
    mm.reclaimer().on_free(size);
}

fn mapped_malloc_large(mm: &MemoryManager, size: usize, offset: usize) -> Option<*mut u8> {
    let addr = vma::map_anon(
        mm,
        None,
        size,
        MmapFlags::POPULATE | MmapFlags::UNINITIALIZED,
        Perm::READ | Perm::WRITE,
    )
    .ok()?;
    // The size word lives at the mapping base. It is read and written
    // through the physical translation, never the mapped address itself.
    let word = vma::translate_mapped(mm, addr)?;
    unsafe { *(word as *mut usize) = size };
    Some((addr.as_usize() + offset) as *mut u8)
}

fn mapped_free_large(mm: &MemoryManager, obj: *mut u8) {
    let base = (obj as usize - 1) & !(PAGE_SIZE - 1);
    let addr = VirtualAddress::new(base);
    let word = match vma::translate_mapped(mm, addr) {
        Some(word) => word,
        None => panic!("free of unmapped pointer {:p}", obj),
    };
    let size = unsafe { *(word as *const usize) };
    if let Err(err) = vma::munmap(mm, addr, size) {
        log::error!("unmap of {} at {:#x} failed: {}", HumanSize(size), base, err);
    }
}

/// Frees any pointer handed out by this heap. Null is a no-op.
///
/// # Panics
///
/// Panics when the pointer is inside managed physical memory but was not
/// handed out by any front-end.
pub fn free(mm: &MemoryManager, obj: *mut u8) {
    if obj.is_null() {
        return;
    }
    log::trace!("free {:p}", obj);
    if !mm.translator().contains_ptr(obj) {
        return mapped_free_large(mm, obj);
    }
    let phys = mm.translator().ptr_to_phys(obj);
    if (obj as usize) % PAGE_SIZE == 0 {
        match mm.page_kind_of(phys) {
            PageKind::PageBuffer => mm.free_page(phys),
            PageKind::LargeBody => free_large(mm, obj),
            kind => panic!("free of untracked pointer {:p} ({:?} page)", obj, kind),
        }
    } else {
        match mm.page_kind_of(phys) {
            PageKind::Pool => Pool::free(obj, mm),
            PageKind::LargeHead => free_large(mm, obj),
            kind => panic!("free of untracked pointer {:p} ({:?} page)", obj, kind),
        }
    }
}

/// Usable bytes behind an allocation, possibly more than was asked for.
pub fn malloc_usable_size(mm: &MemoryManager, obj: *mut u8) -> usize {
    if obj.is_null() {
        return 0;
    }
    if !mm.translator().contains_ptr(obj) {
        let base = (obj as usize - 1) & !(PAGE_SIZE - 1);
        let word = match vma::translate_mapped(mm, VirtualAddress::new(base)) {
            Some(word) => word,
            None => panic!("size query for unmapped pointer {:p}", obj),
        };
        let size = unsafe { *(word as *const usize) };
        return size - (obj as usize - base);
    }
    let phys = mm.translator().ptr_to_phys(obj);
    match mm.page_kind_of(phys) {
        PageKind::Pool => unsafe { (*Pool::from_object(obj)).object_size() },
        PageKind::PageBuffer => PAGE_SIZE,
        PageKind::LargeHead | PageKind::LargeBody => {
            let pr = large_header(obj);
            unsafe { (*pr).size() - (obj as usize - pr as usize) }
        }
        kind => panic!("size query for untracked pointer {:p} ({:?} page)", obj, kind),
    }
}

/// Grows or shrinks an allocation, preserving contents up to the smaller
/// size. Growing within the block's usable size is free; shrinking far below
/// it reallocates so the slack can be returned.
pub fn realloc(mm: &MemoryManager, obj: *mut u8, size: usize) -> *mut u8 {
    if obj.is_null() {
        return malloc(mm, size);
    }
    if size == 0 {
        free(mm, obj);
        return ptr::null_mut();
    }
    let usable = malloc_usable_size(mm, obj);
    if size <= usable && size >= usable / 2 {
        return obj;
    }
    let new_obj = malloc(mm, size);
    if !new_obj.is_null() {
        unsafe { ptr::copy_nonoverlapping(obj, new_obj, usable.min(size)) };
        free(mm, obj);
    }
    new_obj
}

/// `realloc` with an overflow-checked element-count product; overflow fails
/// with null and leaves the original allocation alone.
pub fn reallocarray(mm: &MemoryManager, obj: *mut u8, nmemb: usize, elem_size: usize) -> *mut u8 {
    match nmemb.checked_mul(elem_size) {
        Some(bytes) => realloc(mm, obj, bytes),
        None => ptr::null_mut(),
    }
}

/// Allocates physically contiguous, `align`-aligned memory, for DMA buffers
/// and the like. The size is rounded up to the alignment.
pub fn alloc_phys_contiguous_aligned(
    mm: &MemoryManager,
    size: usize,
    align: usize,
    block: bool,
) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let obj = malloc_large(mm, align_up(size, align), align, block, true);
    debug_assert!(obj.is_null() || obj as usize % align == 0);
    obj
}

pub fn free_phys_contiguous_aligned(mm: &MemoryManager, obj: *mut u8) {
    free_large(mm, obj);
}

/// Adapter exposing this heap to Rust's `alloc` machinery.
///
/// The embedding kernel declares it as its `#[global_allocator]` after the
/// subsystem is installed; this crate never registers it itself.
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        std_malloc(MemoryManager::current(), layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(MemoryManager::current(), ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let obj = std_malloc(MemoryManager::current(), layout.size(), layout.align());
        if !obj.is_null() {
            unsafe { ptr::write_bytes(obj, 0, layout.size()) };
        }
        obj
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let mm = MemoryManager::current();
        if layout.align() <= MALLOC_ALIGNMENT {
            return realloc(mm, ptr, new_size);
        }
        // Plain realloc would lose an over-sized alignment.
        let new_obj = std_malloc(mm, new_size, layout.align());
        if !new_obj.is_null() {
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_obj, layout.size().min(new_size));
            }
            free(mm, ptr);
        }
        new_obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::emulation;

    const MIB: usize = 1 << 20;

    fn free_bytes(mm: &MemoryManager) -> usize {
        mm.stats().free
    }

    #[test]
    fn small_allocations_come_from_pools() {
        let mm = emulation::fresh(16 * MIB);
        let obj = malloc(mm, 40);
        assert!(!obj.is_null());
        // 40 bytes lands in the 64-byte class, naturally aligned.
        assert_eq!(obj as usize % 64, 0);
        assert_eq!(malloc_usable_size(mm, obj), 64);
        unsafe { ptr::write_bytes(obj, 0xa5, 40) };
        free(mm, obj);
    }

    #[test]
    fn zero_size_is_a_valid_object() {
        let mm = emulation::fresh(16 * MIB);
        let obj = malloc(mm, 0);
        assert!(!obj.is_null());
        assert!(malloc_usable_size(mm, obj) >= MIN_OBJECT_SIZE);
        free(mm, obj);
    }

    #[test]
    fn page_sized_allocations_take_whole_pages() {
        let mm = emulation::fresh(16 * MIB);
        // Above the pool ceiling, at or below a page.
        let obj = malloc(mm, 2000);
        assert_eq!(obj as usize % PAGE_SIZE, 0);
        assert_eq!(malloc_usable_size(mm, obj), PAGE_SIZE);
        free(mm, obj);

        let page = malloc(mm, PAGE_SIZE);
        assert_eq!(page as usize % PAGE_SIZE, 0);
        free(mm, page);
    }

    #[test]
    fn large_allocations_keep_their_header_below() {
        let mm = emulation::fresh(16 * MIB);
        let before = free_bytes(mm);

        let obj = malloc(mm, 3 * PAGE_SIZE);
        assert!(!obj.is_null());
        assert_eq!(obj as usize % MALLOC_ALIGNMENT, 0);
        // The pointer sits just past the in-place range header.
        assert_eq!(obj as usize % PAGE_SIZE, 32);
        assert!(malloc_usable_size(mm, obj) >= 3 * PAGE_SIZE);
        unsafe { ptr::write_bytes(obj, 0x5a, 3 * PAGE_SIZE) };

        free(mm, obj);
        assert_eq!(free_bytes(mm), before);
    }

    #[test]
    fn aligned_alloc_beyond_page_alignment() {
        let mm = emulation::fresh(16 * MIB);
        let before = free_bytes(mm);

        let obj = aligned_alloc(mm, 4 * PAGE_SIZE, 3 * PAGE_SIZE);
        assert!(!obj.is_null());
        assert_eq!(obj as usize % (4 * PAGE_SIZE), 0);
        assert!(malloc_usable_size(mm, obj) >= 3 * PAGE_SIZE);

        free(mm, obj);
        assert_eq!(free_bytes(mm), before);
    }

    #[test]
    fn aligned_alloc_rejects_non_power_of_two() {
        let mm = emulation::fresh(16 * MIB);
        assert!(aligned_alloc(mm, 24, 100).is_null());
    }

    #[test]
    fn posix_memalign_validates_alignment() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(
            posix_memalign(mm, 24, 100).unwrap_err(),
            MmapError::InvalidArgument
        );
        assert_eq!(
            posix_memalign(mm, 4, 100).unwrap_err(),
            MmapError::InvalidArgument
        );

        let obj = posix_memalign(mm, 128, 100).unwrap();
        assert_eq!(obj as usize % 128, 0);
        free(mm, obj);
    }

    #[test]
    fn realloc_grows_and_preserves_contents() {
        let mm = emulation::fresh(16 * MIB);
        let obj = realloc(mm, ptr::null_mut(), 64);
        assert!(!obj.is_null());
        for i in 0..64 {
            unsafe { *obj.add(i) = i as u8 };
        }

        let grown = realloc(mm, obj, 2 * PAGE_SIZE);
        assert_ne!(grown, obj);
        for i in 0..64 {
            assert_eq!(unsafe { *grown.add(i) }, i as u8);
        }

        assert!(realloc(mm, grown, 0).is_null());
    }

    #[test]
    fn realloc_within_usable_size_is_in_place() {
        let mm = emulation::fresh(16 * MIB);
        let obj = malloc(mm, 100);
        assert_eq!(malloc_usable_size(mm, obj), 128);
        assert_eq!(realloc(mm, obj, 120), obj);
        assert_eq!(realloc(mm, obj, 80), obj);
        free(mm, obj);
    }

    #[test]
    fn reallocarray_checks_overflow() {
        let mm = emulation::fresh(16 * MIB);
        let obj = malloc(mm, 16);
        assert!(reallocarray(mm, obj, usize::MAX / 8, 16).is_null());
        // The original object survives a failed grow.
        assert_eq!(malloc_usable_size(mm, obj), 16);
        free(mm, obj);
    }

    #[test]
    fn calloc_zeroes_and_checks_overflow() {
        let mm = emulation::fresh(16 * MIB);
        let obj = calloc(mm, 3, 100);
        assert!(!obj.is_null());
        for i in 0..300 {
            assert_eq!(unsafe { *obj.add(i) }, 0);
        }
        free(mm, obj);

        assert!(calloc(mm, usize::MAX, 2).is_null());
    }

    #[test]
    fn phys_contiguous_allocations_round_trip() {
        let mm = emulation::fresh(16 * MIB);
        let before = free_bytes(mm);

        let obj = alloc_phys_contiguous_aligned(mm, 3 * PAGE_SIZE, PAGE_SIZE, true);
        assert!(!obj.is_null());
        assert_eq!(obj as usize % PAGE_SIZE, 0);

        free_phys_contiguous_aligned(mm, obj);
        assert_eq!(free_bytes(mm), before);
    }

    #[test]
    fn huge_allocations_live_in_mappings() {
        let mm = emulation::fresh_central(64 * MIB);
        let before = free_bytes(mm);

        let obj = malloc(mm, 4 * MIB);
        assert!(!obj.is_null());
        // Too big to ask for contiguously: the object lives in an anonymous
        // mapping outside the physical window.
        assert!(!mm.translator().contains_ptr(obj));
        assert_eq!(obj as usize % PAGE_SIZE, 32);
        assert!(malloc_usable_size(mm, obj) >= 4 * MIB);

        let base = VirtualAddress::new(obj as usize - 32);
        assert!(vma::ismapped(mm, base, 4 * MIB));

        free(mm, obj);
        assert!(!vma::ismapped(mm, base, PAGE_SIZE));
        // The mapping's frames come back; its four table pages stay out.
        assert_eq!(free_bytes(mm), before - 4 * PAGE_SIZE);
    }

    #[test]
    fn mixed_lifetimes_release_everything() {
        let mm = emulation::fresh(16 * MIB);
        // Warm the CPU's page cache so page traffic below stays off the
        // central allocator and the large-object accounting comes out exact.
        let warm = malloc(mm, 3000);
        free(mm, warm);
        let before = free_bytes(mm);

        let large_a = malloc(mm, 5 * PAGE_SIZE);
        let page = malloc(mm, 3000);
        let large_b = aligned_alloc(mm, 2 * PAGE_SIZE, 2 * PAGE_SIZE);
        free(mm, large_a);
        free(mm, page);
        free(mm, large_b);

        assert_eq!(free_bytes(mm), before);
        assert_eq!(mm.stats().free, mm.lock_ranges().total_free_bytes());
    }

    #[test]
    fn global_alloc_adapter_round_trips() {
        let mm = emulation::fresh(16 * MIB);
        let _ = mm;
        let heap = KernelHeap;
        let layout = Layout::from_size_align(256, 16).unwrap();
        unsafe {
            let obj = heap.alloc_zeroed(layout);
            assert!(!obj.is_null());
            for i in 0..256 {
                assert_eq!(*obj.add(i), 0);
            }
            let grown = heap.realloc(obj, layout, 4 * PAGE_SIZE);
            assert!(!grown.is_null());
            heap.dealloc(grown, Layout::from_size_align(4 * PAGE_SIZE, 16).unwrap());
        }
    }

    #[test]
    #[should_panic(expected = "larger than all of memory")]
    fn unreasonable_request_aborts() {
        let mm = emulation::fresh(8 * MIB);
        alloc_phys_contiguous_aligned(mm, 64 * MIB, PAGE_SIZE, true);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn unsatisfiable_contiguous_request_aborts() {
        let mm = emulation::fresh(8 * MIB);
        // The first half fits; the second cannot, and with nothing to
        // reclaim the subsystem gives up.
        let first = alloc_phys_contiguous_aligned(mm, 4 * MIB, PAGE_SIZE, true);
        assert!(!first.is_null());
        alloc_phys_contiguous_aligned(mm, 4 * MIB, PAGE_SIZE, true);
    }
}

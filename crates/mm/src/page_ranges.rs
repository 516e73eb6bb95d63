//! Free physical page-range tracking.
//!
//! Free ranges are kept in power-of-two order buckets: bucket `k` holds ranges
//! of `[2^k, 2^(k+1))` pages, and everything at or above the largest bucket
//! lives in a size-sorted overflow list served worst-fit. The range header is
//! written into the first bytes of the free memory itself and the last word of
//! every free range points back at its header, so a range can be found from
//! either end. A boundary bitmap marks the first and last page of every free
//! range, which makes coalescing on free O(1): the neighbor's header is one
//! bitmap probe and one pointer read away.
//!
//! The bitmap (and the page-kind table next to it) is itself carved out of
//! managed memory. When newly donated memory extends past the tracked area,
//! the tables are rebuilt from a fresh allocation and the old storage is freed
//! through a one-shot deferral, avoiding recursion into the allocator while it
//! is mid-rebuild.

use alloc::vec::Vec;
use core::mem;
use core::ptr;

use crate::address::{AddressTranslator, PhysicalAddress};
use crate::arch::{PAGE_SHIFT, PAGE_SIZE};

/// Number of order buckets. Ranges of `2^MAX_ORDER` pages or more (256 MiB)
/// go to the overflow list.
pub(crate) const MAX_ORDER: usize = 16;

/// Header of a free page range, written at the start of the range itself.
///
/// The link fields are meaningful only while the range sits in a free list.
/// After allocation the header's `size` remains in place for allocations that
/// keep it (large objects locate their extent through it).
#[repr(C)]
pub(crate) struct PageRange {
    size: usize,
    prev: *mut PageRange,
    next: *mut PageRange,
}

impl PageRange {
    /// Writes a fresh header for `size` bytes at `at`.
    ///
    /// # Safety
    ///
    /// `at` must point at the start of `size` bytes of writable memory.
    pub(crate) unsafe fn emplace(at: *mut u8, size: usize) -> *mut PageRange {
        let pr = at as *mut PageRange;
        unsafe {
            ptr::write(
                pr,
                PageRange {
                    size,
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                },
            );
        }
        pr
    }

    /// Returns the size of the range in bytes.
    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

/// What a managed page is currently used for.
///
/// `free()` has no size or type parameter; the kind of the page containing the
/// pointer (or, for aligned large objects, the page holding the header just
/// below it) decides how the pointer is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageKind {
    /// Not handed out by any allocator front-end.
    Unknown = 0,
    /// A pool (slab) page; the pool's page header sits at the page base.
    Pool = 1,
    /// A whole page handed out by `alloc_page`.
    PageBuffer = 2,
    /// First page of a large object; the range header sits at the page base.
    LargeHead = 3,
    /// Page right after a large object's header page, for objects aligned up
    /// to a page boundary.
    LargeBody = 4,
}

impl PageKind {
    fn from_byte(byte: u8) -> PageKind {
        match byte {
            1 => PageKind::Pool,
            2 => PageKind::PageBuffer,
            3 => PageKind::LargeHead,
            4 => PageKind::LargeBody,
            _ => PageKind::Unknown,
        }
    }
}

/// Intrusive doubly-linked list of free ranges.
struct RangeList {
    head: *mut PageRange,
    tail: *mut PageRange,
    len: usize,
}

impl RangeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push_front(&mut self, pr: *mut PageRange) {
        unsafe {
            (*pr).prev = ptr::null_mut();
            (*pr).next = self.head;
            if self.head.is_null() {
                self.tail = pr;
            } else {
                (*self.head).prev = pr;
            }
        }
        self.head = pr;
        self.len += 1;
    }

    /// Inserts keeping the list sorted by ascending size.
    unsafe fn insert_sorted(&mut self, pr: *mut PageRange) {
        unsafe {
            let mut cur = self.head;
            while !cur.is_null() && (*cur).size < (*pr).size {
                cur = (*cur).next;
            }
            if cur.is_null() {
                // Largest so far, append at the tail.
                (*pr).prev = self.tail;
                (*pr).next = ptr::null_mut();
                if self.tail.is_null() {
                    self.head = pr;
                } else {
                    (*self.tail).next = pr;
                }
                self.tail = pr;
            } else {
                (*pr).prev = (*cur).prev;
                (*pr).next = cur;
                if (*cur).prev.is_null() {
                    self.head = pr;
                } else {
                    (*(*cur).prev).next = pr;
                }
                (*cur).prev = pr;
            }
        }
        self.len += 1;
    }

    unsafe fn remove(&mut self, pr: *mut PageRange) {
        unsafe {
            if (*pr).prev.is_null() {
                self.head = (*pr).next;
            } else {
                (*(*pr).prev).next = (*pr).next;
            }
            if (*pr).next.is_null() {
                self.tail = (*pr).prev;
            } else {
                (*(*pr).next).prev = (*pr).prev;
            }
            (*pr).prev = ptr::null_mut();
            (*pr).next = ptr::null_mut();
        }
        self.len -= 1;
    }

    fn front(&self) -> *mut PageRange {
        self.head
    }

    fn back(&self) -> *mut PageRange {
        self.tail
    }
}

/// Boundary bitmap over managed pages; bit set = this page is the first or
/// last page of a free range.
struct BoundaryBitmap {
    words: *mut u64,
    nbits: usize,
    storage_bytes: usize,
}

impl BoundaryBitmap {
    const fn empty() -> Self {
        Self {
            words: ptr::null_mut(),
            nbits: 0,
            storage_bytes: 0,
        }
    }

    fn len(&self) -> usize {
        self.nbits
    }

    fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.nbits);
        unsafe { *self.words.add(idx / 64) & (1 << (idx % 64)) != 0 }
    }

    fn set(&mut self, idx: usize, value: bool) {
        debug_assert!(idx < self.nbits);
        unsafe {
            let word = self.words.add(idx / 64);
            if value {
                *word |= 1 << (idx % 64);
            } else {
                *word &= !(1 << (idx % 64));
            }
        }
    }
}

/// Byte-per-page table recording each managed page's [`PageKind`].
struct KindTable {
    bytes: *mut u8,
    npages: usize,
    storage_bytes: usize,
}

impl KindTable {
    const fn empty() -> Self {
        Self {
            bytes: ptr::null_mut(),
            npages: 0,
            storage_bytes: 0,
        }
    }

    fn get(&self, idx: usize) -> PageKind {
        if idx >= self.npages {
            return PageKind::Unknown;
        }
        PageKind::from_byte(unsafe { *self.bytes.add(idx) })
    }

    fn set(&mut self, idx: usize, kind: PageKind) {
        assert!(idx < self.npages, "page outside managed memory");
        unsafe { *self.bytes.add(idx) = kind as u8 };
    }
}

/// The page-range allocator proper. Callers serialize access externally (it
/// sits behind a mutex in the subsystem context).
pub(crate) struct PageRangeAllocator {
    translator: &'static AddressTranslator,
    free: [RangeList; MAX_ORDER],
    free_huge: RangeList,
    not_empty: u32,
    bitmap: BoundaryBitmap,
    kinds: KindTable,
    deferred_free: [Option<*mut PageRange>; 2],
}

// The raw pointers all target translated physical memory owned by the
// allocator itself.
unsafe impl Send for PageRangeAllocator {}

/// Floor log2 of a page count.
fn order_of(npages: usize) -> usize {
    debug_assert!(npages > 0);
    (usize::BITS - 1 - npages.leading_zeros()) as usize
}

/// Ceiling log2 of a page count.
fn order_roundup(npages: usize) -> usize {
    if npages <= 1 {
        0
    } else {
        (usize::BITS - (npages - 1).leading_zeros()) as usize
    }
}

impl PageRangeAllocator {
    pub(crate) fn new(translator: &'static AddressTranslator) -> Self {
        Self {
            translator,
            free: [const { RangeList::new() }; MAX_ORDER],
            free_huge: RangeList::new(),
            not_empty: 0,
            bitmap: BoundaryBitmap::empty(),
            kinds: KindTable::empty(),
            deferred_free: [None, None],
        }
    }

    fn page_index(&self, pr: *mut PageRange) -> usize {
        self.translator.ptr_to_phys(pr).page_index()
    }

    /// Physical address of a range header.
    pub(crate) fn range_phys(&self, pr: *mut PageRange) -> PhysicalAddress {
        self.translator.ptr_to_phys(pr)
    }

    /// Sets or clears the boundary bits of a range: normally only the first
    /// and last page, all pages when `fill` is requested.
    fn set_boundary_bits(&mut self, pr: *mut PageRange, value: bool, fill: bool) {
        let idx = self.page_index(pr);
        let end = (unsafe { (*pr).size } >> PAGE_SHIFT) - 1;
        if fill {
            for i in 0..=end {
                self.bitmap.set(idx + i, value);
            }
        } else {
            self.bitmap.set(idx, value);
            self.bitmap.set(idx + end, value);
        }
    }

    /// Links a free range into its bucket and writes the end back-pointer.
    fn insert(&mut self, pr: *mut PageRange, update_bitmap: bool) {
        let size = unsafe { (*pr).size };
        debug_assert!(size >= PAGE_SIZE && size % PAGE_SIZE == 0);

        unsafe {
            let backlink =
                (pr as *mut u8).add(size - mem::size_of::<*mut PageRange>()) as *mut *mut PageRange;
            *backlink = pr;
        }

        let order = order_of(size >> PAGE_SHIFT);
        if order >= MAX_ORDER {
            unsafe { self.free_huge.insert_sorted(pr) };
            self.not_empty |= 1 << MAX_ORDER;
        } else {
            unsafe { self.free[order].push_front(pr) };
            self.not_empty |= 1 << order;
        }

        if update_bitmap {
            self.set_boundary_bits(pr, true, false);
        }
    }

    /// Unlinks a free range from its bucket.
    fn remove(&mut self, pr: *mut PageRange) {
        let order = order_of(unsafe { (*pr).size } >> PAGE_SHIFT);
        if order >= MAX_ORDER {
            unsafe { self.free_huge.remove(pr) };
            if self.free_huge.is_empty() {
                self.not_empty &= !(1 << MAX_ORDER);
            }
        } else {
            unsafe { self.free[order].remove(pr) };
            if self.free[order].is_empty() {
                self.not_empty &= !(1 << order);
            }
        }
    }

    /// Allocates `size` bytes of physically contiguous pages.
    ///
    /// Scans the smallest bucket guaranteed to fit, falling through to the
    /// worst-fit overflow list. When every such bucket is empty and the
    /// caller insists on contiguity, the next-smaller bucket is scanned
    /// linearly for a member that happens to be big enough; that scan is the
    /// one O(n) path in this allocator.
    pub(crate) fn alloc(&mut self, size: usize, contiguous: bool) -> Option<*mut PageRange> {
        self.alloc_inner(size, contiguous, true)
    }

    /// Like [`alloc`](Self::alloc), but leaves the boundary bitmap alone.
    ///
    /// Used while the bitmap itself is being replaced and must not be
    /// written through.
    fn alloc_inner(
        &mut self,
        size: usize,
        contiguous: bool,
        use_bitmap: bool,
    ) -> Option<*mut PageRange> {
        debug_assert!(size >= PAGE_SIZE && size % PAGE_SIZE == 0);
        let exact_order = order_roundup(size >> PAGE_SHIFT).min(MAX_ORDER);

        let mut candidates = self.not_empty;
        if exact_order > 0 {
            candidates &= !((1u32 << exact_order) - 1);
        }

        let pr = if candidates == 0 {
            if !contiguous || exact_order == 0 || self.free[exact_order - 1].is_empty() {
                return None;
            }
            // Desperate path: a smaller bucket may still hold a range that
            // covers the request.
            let mut cur = self.free[exact_order - 1].front();
            loop {
                if cur.is_null() {
                    return None;
                }
                if unsafe { (*cur).size } >= size {
                    break cur;
                }
                cur = unsafe { (*cur).next };
            }
        } else {
            let order = candidates.trailing_zeros() as usize;
            if order == MAX_ORDER {
                let largest = self.free_huge.back();
                if unsafe { (*largest).size } < size {
                    return None;
                }
                largest
            } else {
                self.free[order].front()
            }
        };

        self.remove(pr);

        unsafe {
            if (*pr).size > size {
                let rest = PageRange::emplace((pr as *mut u8).add(size), (*pr).size - size);
                (*pr).size = size;
                self.insert(rest, use_bitmap);
            }
        }
        if use_bitmap {
            self.set_boundary_bits(pr, false, false);
        }
        Some(pr)
    }

    /// Allocates `size` bytes such that `returned + offset` is aligned to
    /// `alignment`.
    ///
    /// Walks free ranges largest-first looking for one that still covers the
    /// request after trimming for alignment. The allocation is carved from
    /// the back of the range; alignment slack past the carved block goes back
    /// to the free lists as its own range.
    pub(crate) fn alloc_aligned(
        &mut self,
        size: usize,
        offset: usize,
        alignment: usize,
        fill: bool,
    ) -> Option<*mut PageRange> {
        debug_assert!(size >= PAGE_SIZE && size % PAGE_SIZE == 0);
        debug_assert!(alignment.is_power_of_two());

        let min_order = order_of(size >> PAGE_SHIFT).max(1) - 1;
        let mut found = None;

        self.for_each_candidate(min_order, |pr| {
            let header_size = unsafe { (*pr).size };
            let expected_ret = pr as usize + header_size - size + offset;
            let alignment_shift = expected_ret - (expected_ret & !(alignment - 1));
            if header_size >= size + alignment_shift {
                found = Some((pr, alignment_shift));
                false
            } else {
                true
            }
        });

        let (pr, alignment_shift) = found?;
        self.remove(pr);

        unsafe {
            if alignment_shift != 0 {
                debug_assert!(alignment_shift % PAGE_SIZE == 0);
                let slack = PageRange::emplace(
                    (pr as *mut u8).add((*pr).size - alignment_shift),
                    alignment_shift,
                );
                (*pr).size -= alignment_shift;
                self.insert(slack, true);
            }

            let ret = if (*pr).size == size {
                pr
            } else {
                (*pr).size -= size;
                self.insert(pr, true);
                PageRange::emplace((pr as *mut u8).add((*pr).size), size)
            };
            self.set_boundary_bits(ret, false, fill);
            Some(ret)
        }
    }

    /// Returns a range to the free lists, coalescing with the physically
    /// preceding and following free ranges.
    pub(crate) fn free(&mut self, pr: *mut PageRange) {
        let mut pr = pr;
        let idx = self.page_index(pr);

        unsafe {
            if idx > 0 && idx - 1 < self.bitmap.len() && self.bitmap.get(idx - 1) {
                // The previous page ends a free range; its last word points
                // at that range's header.
                let prev = *(pr as *mut *mut PageRange).sub(1);
                self.remove(prev);
                (*prev).size += (*pr).size;
                pr = prev;
            }

            let next_idx = self.page_index(pr) + ((*pr).size >> PAGE_SHIFT);
            if next_idx < self.bitmap.len() && self.bitmap.get(next_idx) {
                let next = (pr as *mut u8).add((*pr).size) as *mut PageRange;
                self.remove(next);
                (*pr).size += (*next).size;
            }
        }

        self.insert(pr, true);
    }

    /// Frees `size` bytes of pages by physical address, writing a fresh
    /// range header first.
    pub(crate) fn free_phys(&mut self, phys: PhysicalAddress, size: usize) {
        let pr = unsafe { PageRange::emplace(self.translator.translate(phys), size) };
        self.free(pr);
    }

    /// Donates boot-discovered memory. Returns the number of bytes newly
    /// consumed by tracking tables, for the caller's accounting.
    ///
    /// If the new range extends past the tracked area, the boundary bitmap
    /// and kind table are rebuilt from a fresh (larger) carve-out of managed
    /// memory; the old storage cannot be freed while the rebuild uses it, so
    /// it is queued and released at the end.
    pub(crate) fn initial_add(&mut self, phys: PhysicalAddress, size: usize) -> usize {
        debug_assert!(phys.is_aligned(PAGE_SIZE) && size % PAGE_SIZE == 0 && size > 0);
        let mut pr = unsafe { PageRange::emplace(self.translator.translate(phys), size) };

        let end_idx = phys.page_index() + (size >> PAGE_SHIFT);
        if end_idx > self.bitmap.len() {
            let idx = phys.page_index();
            if idx > 0 && idx - 1 < self.bitmap.len() && self.bitmap.get(idx - 1) {
                unsafe {
                    let prev = *(pr as *mut *mut PageRange).sub(1);
                    self.remove(prev);
                    (*prev).size += size;
                    pr = prev;
                }
            }
            self.insert(pr, false);
            let tracking_delta = self.grow_tracking(end_idx);

            // Rebuild boundary bits for everything tracked. The bucket heads
            // are snapshotted first so the walk does not hold a borrow of
            // the lists while the bitmap is written.
            let mut heads = [ptr::null_mut(); MAX_ORDER + 1];
            heads[MAX_ORDER] = self.free_huge.front();
            for (order, head) in heads.iter_mut().enumerate().take(MAX_ORDER) {
                *head = self.free[order].front();
            }
            for &head in &heads {
                let mut cur = head;
                while !cur.is_null() {
                    self.set_boundary_bits(cur, true, false);
                    cur = unsafe { (*cur).next };
                }
            }

            for slot in 0..self.deferred_free.len() {
                if let Some(old) = self.deferred_free[slot].take() {
                    self.free(old);
                }
            }
            tracking_delta
        } else {
            self.free(pr);
            0
        }
    }

    /// Replaces the bitmap and kind table with storage covering `npages`.
    /// Returns the growth in tracking-table bytes.
    fn grow_tracking(&mut self, npages: usize) -> usize {
        let bitmap_bytes = (npages.div_ceil(64) * 8 + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let kind_bytes = (npages + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);

        let bitmap_pr = match self.alloc_inner(bitmap_bytes, true, false) {
            Some(pr) => pr,
            None => panic!("no memory for page tracking tables"),
        };
        let kinds_pr = match self.alloc_inner(kind_bytes, true, false) {
            Some(pr) => pr,
            None => panic!("no memory for page tracking tables"),
        };

        let old_bitmap = (self.bitmap.words as *mut u8, self.bitmap.storage_bytes);
        let old_kinds = (self.kinds.bytes, self.kinds.storage_bytes);

        unsafe {
            let words = bitmap_pr as *mut u64;
            ptr::write_bytes(words as *mut u8, 0, bitmap_bytes);
            self.bitmap = BoundaryBitmap {
                words,
                nbits: npages,
                storage_bytes: bitmap_bytes,
            };

            let bytes = kinds_pr as *mut u8;
            ptr::write_bytes(bytes, 0, kind_bytes);
            if !old_kinds.0.is_null() {
                // Kinds persist across growth; only the bitmap is rebuilt
                // from the free lists.
                ptr::copy_nonoverlapping(old_kinds.0, bytes, self.kinds.npages);
            }
            self.kinds = KindTable {
                bytes,
                npages,
                storage_bytes: kind_bytes,
            };

            if !old_bitmap.0.is_null() {
                self.deferred_free[0] = Some(PageRange::emplace(old_bitmap.0, old_bitmap.1));
            }
            if !old_kinds.0.is_null() {
                self.deferred_free[1] = Some(PageRange::emplace(old_kinds.0, old_kinds.1));
            }
        }
        (bitmap_bytes + kind_bytes) - (old_bitmap.1 + old_kinds.1)
    }

    /// Visits free ranges: the overflow list in ascending size order first,
    /// then buckets from largest to `min_order`. Stops when `f` returns
    /// false. `f` may remove the range it was handed, nothing else.
    fn for_each_candidate(&mut self, min_order: usize, mut f: impl FnMut(*mut PageRange) -> bool) {
        let mut cur = self.free_huge.front();
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            if !f(cur) {
                return;
            }
            cur = next;
        }
        for order in (min_order..MAX_ORDER).rev() {
            let mut cur = self.free[order].front();
            while !cur.is_null() {
                let next = unsafe { (*cur).next };
                if !f(cur) {
                    return;
                }
                cur = next;
            }
        }
    }

    /// Visits the byte sizes of all free ranges, largest first. Stops when
    /// `f` returns false.
    pub(crate) fn for_each_free(&mut self, mut f: impl FnMut(usize) -> bool) {
        self.for_each_candidate(0, |pr| f(unsafe { (*pr).size }));
    }

    pub(crate) fn page_kind(&self, phys: PhysicalAddress) -> PageKind {
        self.kinds.get(phys.page_index())
    }

    pub(crate) fn set_page_kind(&mut self, phys: PhysicalAddress, kind: PageKind) {
        self.kinds.set(phys.page_index(), kind);
    }

    /// Sum of all free range sizes, for diagnostics and invariant checks.
    pub(crate) fn total_free_bytes(&mut self) -> usize {
        let mut total = 0;
        self.for_each_candidate(0, |pr| {
            total += unsafe { (*pr).size };
            true
        });
        total
    }

    /// Number of distinct free ranges.
    pub(crate) fn range_count(&mut self) -> usize {
        let mut count = 0;
        self.for_each_candidate(0, |_| {
            count += 1;
            true
        });
        count
    }

    /// Checks that no two free ranges are physically adjacent, for tests.
    #[cfg(test)]
    fn assert_no_adjacent_free_ranges(&mut self) {
        let translator = self.translator;
        let mut bounds = Vec::new();
        self.for_each_candidate(0, |pr| {
            bounds.push((translator.ptr_to_phys(pr).as_usize(), unsafe {
                (*pr).size
            }));
            true
        });
        bounds.sort();
        for pair in bounds.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 < pair[1].0,
                "free ranges {:#x}+{:#x} and {:#x} are adjacent",
                pair[0].0,
                pair[0].1,
                pair[1].0
            );
        }
    }
}

/// Per-CPU cache of single free pages fronting the range allocator.
///
/// `alloc_page` pops from the local cache and refills a batch under the range
/// lock only when the cache is empty; `free_page` pushes locally and spills a
/// batch when full. The batch size is an eighth of the capacity.
pub(crate) struct PageCache {
    pages: Vec<PhysicalAddress>,
    capacity: usize,
}

impl PageCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pages: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub(crate) fn batch(&self) -> usize {
        (self.capacity / 8).max(1)
    }

    pub(crate) fn pop(&mut self) -> Option<PhysicalAddress> {
        self.pages.pop()
    }

    pub(crate) fn push(&mut self, page: PhysicalAddress) -> bool {
        if self.pages.len() >= self.capacity {
            return false;
        }
        self.pages.push(page);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::HUGE_PAGE_SIZE;

    const MIB: usize = 1 << 20;

    /// Builds an allocator over a fresh arena and donates all of it except
    /// page zero.
    fn setup(arena_bytes: usize) -> PageRangeAllocator {
        let translator = AddressTranslator::set_current(AddressTranslator::emulated(arena_bytes));
        let mut ranges = PageRangeAllocator::new(translator);
        ranges.initial_add(
            PhysicalAddress::new(PAGE_SIZE),
            arena_bytes - PAGE_SIZE,
        );
        ranges
    }

    #[test]
    fn bootstrap_carves_tracking_tables() {
        let mut ranges = setup(4 * MIB);
        // The donated memory minus the bitmap and kind-table carve-outs is
        // free, and it is all in one piece.
        let free = ranges.total_free_bytes();
        assert!(free > 3 * MIB);
        assert!(free < 4 * MIB);
        assert_eq!(ranges.range_count(), 1);
        ranges.assert_no_adjacent_free_ranges();
    }

    #[test]
    fn alloc_trims_and_free_coalesces() {
        let mut ranges = setup(4 * MIB);
        let baseline = ranges.total_free_bytes();

        let a = ranges.alloc(3 * PAGE_SIZE, true).unwrap();
        let b = ranges.alloc(5 * PAGE_SIZE, true).unwrap();
        assert_eq!(unsafe { (*a).size() }, 3 * PAGE_SIZE);
        assert_eq!(unsafe { (*b).size() }, 5 * PAGE_SIZE);
        assert_eq!(ranges.total_free_bytes(), baseline - 8 * PAGE_SIZE);

        ranges.free(a);
        ranges.assert_no_adjacent_free_ranges();
        ranges.free(b);
        ranges.assert_no_adjacent_free_ranges();

        assert_eq!(ranges.total_free_bytes(), baseline);
        assert_eq!(ranges.range_count(), 1);
    }

    #[test]
    fn interleaved_frees_coalesce_in_any_order() {
        let mut ranges = setup(4 * MIB);
        let baseline = ranges.total_free_bytes();

        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(ranges.alloc(2 * PAGE_SIZE, true).unwrap());
        }
        // Free even-indexed first so every free range has allocated
        // neighbors, then the odd ones to force both-side merges.
        for idx in (0..held.len()).step_by(2) {
            ranges.free(held[idx]);
            ranges.assert_no_adjacent_free_ranges();
        }
        for idx in (1..held.len()).step_by(2) {
            ranges.free(held[idx]);
            ranges.assert_no_adjacent_free_ranges();
        }

        assert_eq!(ranges.total_free_bytes(), baseline);
        assert_eq!(ranges.range_count(), 1);
    }

    #[test]
    fn equal_sizes_serve_most_recently_freed_first() {
        let mut ranges = setup(4 * MIB);

        let a = ranges.alloc(4 * PAGE_SIZE, true).unwrap();
        let spacer = ranges.alloc(PAGE_SIZE, true).unwrap();
        let b = ranges.alloc(4 * PAGE_SIZE, true).unwrap();
        let spacer2 = ranges.alloc(PAGE_SIZE, true).unwrap();

        ranges.free(a);
        ranges.free(b);

        // Both 4-page ranges sit in the order-2 bucket; the later free is at
        // the front of the list.
        let first = ranges.alloc(4 * PAGE_SIZE, true).unwrap();
        assert_eq!(first, b);
        let second = ranges.alloc(4 * PAGE_SIZE, true).unwrap();
        assert_eq!(second, a);

        ranges.free(first);
        ranges.free(second);
        ranges.free(spacer);
        ranges.free(spacer2);
    }

    #[test]
    fn aligned_alloc_honors_offset() {
        let mut ranges = setup(8 * MIB);

        for &(offset, alignment) in &[
            (0usize, 4 * PAGE_SIZE),
            (PAGE_SIZE, 8 * PAGE_SIZE),
            (0, HUGE_PAGE_SIZE),
        ] {
            let pr = ranges
                .alloc_aligned(4 * PAGE_SIZE, offset, alignment, false)
                .unwrap();
            let phys = ranges.range_phys(pr).as_usize();
            assert_eq!(
                (phys + offset) % alignment,
                0,
                "offset {:#x} alignment {:#x}",
                offset,
                alignment
            );
            ranges.free(pr);
            ranges.assert_no_adjacent_free_ranges();
        }
    }

    #[test]
    fn aligned_alloc_reinserts_slack() {
        let mut ranges = setup(8 * MIB);
        let baseline = ranges.total_free_bytes();

        let pr = ranges
            .alloc_aligned(2 * PAGE_SIZE, 0, HUGE_PAGE_SIZE, false)
            .unwrap();
        assert_eq!(ranges.total_free_bytes(), baseline - 2 * PAGE_SIZE);

        ranges.free(pr);
        assert_eq!(ranges.total_free_bytes(), baseline);
        assert_eq!(ranges.range_count(), 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        // Seed 1 MiB so repeated 400 KiB requests run out of memory.
        let mut ranges = setup(MIB);
        let request = 100 * PAGE_SIZE;

        let a = ranges.alloc(request, true);
        let b = ranges.alloc(request, true);
        let c = ranges.alloc(request, true);
        assert!(a.is_some());
        assert!(b.is_some());
        // Only ~1 MiB donated and some is tracking tables; the third request
        // cannot fit.
        assert!(c.is_none());

        ranges.free(a.unwrap());
        ranges.free(b.unwrap());
        assert_eq!(ranges.range_count(), 1);
    }

    #[test]
    fn oversized_ranges_served_worst_fit() {
        // A range of 2^16 pages or more lands in the overflow list; small
        // allocations from it are carved worst-fit and the remainder stays
        // oversized. The arena is touched sparsely, so the big donation is
        // cheap despite its nominal size.
        let pages = (1 << MAX_ORDER) + 1024;
        let mut ranges = setup((pages + 1) * PAGE_SIZE);
        let baseline = ranges.total_free_bytes();
        assert!(baseline >= (1 << MAX_ORDER) * PAGE_SIZE);

        let pr = ranges.alloc(PAGE_SIZE, true).unwrap();
        assert_eq!(unsafe { (*pr).size() }, PAGE_SIZE);
        assert_eq!(ranges.range_count(), 1);

        // Larger than the largest member: refused, not partially served.
        let too_big = baseline + PAGE_SIZE;
        assert!(ranges.alloc(too_big, true).is_none());

        ranges.free(pr);
        assert_eq!(ranges.total_free_bytes(), baseline);
    }

    #[test]
    fn desperate_scan_finds_oversized_member_in_smaller_bucket() {
        let mut ranges = setup(4 * MIB);

        // Empty the allocator into one holding bin.
        let everything = ranges.total_free_bytes();
        let all = ranges.alloc(everything, true).unwrap();

        // Hand back a single range of 6 pages: order 2, bucket [4, 8).
        let six = unsafe {
            PageRange::emplace((all as *mut u8).add(PAGE_SIZE * 10), 6 * PAGE_SIZE)
        };
        ranges.free(six);

        // A 5-page request rounds up to order 3, whose buckets are all
        // empty; only the desperate scan of order 2 can satisfy it.
        assert!(ranges.alloc(5 * PAGE_SIZE, false).is_none());
        let pr = ranges.alloc(5 * PAGE_SIZE, true).unwrap();
        assert_eq!(unsafe { (*pr).size() }, 5 * PAGE_SIZE);
    }

    #[test]
    fn three_large_contiguous_requests_drain_the_buckets() {
        // Arena sized so exactly 1 MiB is left free, in one piece, after the
        // two tracking pages are carved out.
        let mut ranges = setup(MIB + 3 * PAGE_SIZE);
        assert_eq!(ranges.total_free_bytes(), MIB);
        assert_eq!(ranges.range_count(), 1);

        // 300 KiB is 75 pages. The first request splits the seeded 256-page
        // range and the second the 181-page leftover one bucket down; the
        // third finds the 106-page remainder only by the desperate scan
        // below its guaranteed bucket.
        let request = 75 * PAGE_SIZE;
        let a = ranges.alloc(request, true).unwrap();
        let b = ranges.alloc(request, true).unwrap();
        let c = ranges.alloc(request, true).unwrap();
        for pr in [a, b, c] {
            assert_eq!(unsafe { (*pr).size() }, request);
        }
        assert_eq!(ranges.total_free_bytes(), MIB - 3 * request);

        // The 31 leftover pages cannot fit a fourth request.
        assert!(ranges.alloc(request, true).is_none());

        ranges.free(b);
        ranges.assert_no_adjacent_free_ranges();
        ranges.free(a);
        ranges.free(c);
        assert_eq!(ranges.total_free_bytes(), MIB);
        assert_eq!(ranges.range_count(), 1);
    }

    #[test]
    fn growth_frees_old_tracking_storage_once() {
        let arena = 16 * MIB;
        let translator = AddressTranslator::set_current(AddressTranslator::emulated(arena));
        let mut ranges = PageRangeAllocator::new(translator);

        // Donate in two steps so the second donation must regrow the bitmap.
        ranges.initial_add(PhysicalAddress::new(PAGE_SIZE), 2 * MIB - PAGE_SIZE);
        let after_first = ranges.total_free_bytes();
        assert!(after_first > 0);

        ranges.initial_add(PhysicalAddress::new(2 * MIB), 14 * MIB);
        let after_second = ranges.total_free_bytes();

        // All donated memory is accounted for: nothing leaked to the old
        // tables, nothing double-freed.
        let tracking = (arena - PAGE_SIZE) - after_second;
        assert!(tracking > 0);
        assert!(tracking < 64 * PAGE_SIZE);
        ranges.assert_no_adjacent_free_ranges();

        // The old tables came back as a free island behind the regrown ones,
        // and the two donations coalesced into one span past them.
        assert_eq!(ranges.range_count(), 2);
    }

    #[test]
    fn kind_table_tracks_pages() {
        let mut ranges = setup(4 * MIB);
        let pr = ranges.alloc(PAGE_SIZE, true).unwrap();
        let phys = ranges.range_phys(pr);

        assert_eq!(ranges.page_kind(phys), PageKind::Unknown);
        ranges.set_page_kind(phys, PageKind::PageBuffer);
        assert_eq!(ranges.page_kind(phys), PageKind::PageBuffer);
        ranges.set_page_kind(phys, PageKind::Unknown);
        ranges.free(pr);

        // Pages outside the tracked area read as unknown.
        assert_eq!(
            ranges.page_kind(PhysicalAddress::new(1 << 40)),
            PageKind::Unknown
        );
    }

    #[test]
    fn page_cache_batches() {
        let mut cache = PageCache::new(64);
        assert_eq!(cache.batch(), 8);
        assert!(cache.pop().is_none());

        for i in 0..64 {
            assert!(cache.push(PhysicalAddress::new((i + 1) * PAGE_SIZE)));
        }
        assert!(!cache.push(PhysicalAddress::new(65 * PAGE_SIZE)));
        assert_eq!(cache.len(), 64);
        assert_eq!(cache.pop(), Some(PhysicalAddress::new(64 * PAGE_SIZE)));
    }
}

//! The generic page-table walker.
//!
//! Every page-table manipulation in this crate is a walk: an operation type
//! implements [`WalkOp`], fixing five compile-time policies and a handful of
//! handlers, and [`operate_range`] drives it over a virtual range. The walker
//! owns all the traversal mechanics, so an operation only says what happens at
//! a leaf entry; whether intermediate tables are allocated on demand, whether
//! huge mappings are split or handed over whole, and whether the walk stops
//! after one entry are policy, not code.
//!
//! Walks over a whole entry's span at a leaf-capable level dispatch to the
//! operation at that size, which is how aligned 2 MiB stretches get huge
//! mappings without the operation asking for them. The `slop` granularity lets
//! the linear mapper round a range out to huge-page boundaries so the kernel's
//! direct map uses large entries.

use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::{
    self, PageEntry, ENTRIES_PER_TABLE, NR_PAGE_SIZES, PAGE_SHIFT, PAGE_SIZE, PAGE_TABLE_LEVELS,
};
use crate::memory_manager::MemoryManager;

use super::Perm;

/// Returns true if entries at `level` may be leaves.
#[inline]
pub(crate) const fn leaf_capable(level: usize) -> bool {
    level < NR_PAGE_SIZES
}

/// Returns true if a leaf at `level` would be a large page.
#[inline]
pub(crate) const fn large_capable(level: usize) -> bool {
    level >= 1 && leaf_capable(level)
}

/// A handle to one page-table slot.
///
/// Slots are visited through atomics so that walkers racing under the VMA
/// read lock (concurrent faults) serialize per entry via compare-exchange
/// rather than locks.
#[derive(Clone, Copy)]
pub(crate) struct PtSlot {
    raw: *const AtomicU64,
}

impl PtSlot {
    /// Wraps a bare atomic entry, used for the pseudo-slot above the root
    /// table.
    pub(crate) fn of(cell: &AtomicU64) -> Self {
        Self { raw: cell }
    }

    /// The slot at `idx` inside the table page at `table`.
    fn at(mm: &MemoryManager, table: PhysicalAddress, idx: usize) -> Self {
        debug_assert!(idx < ENTRIES_PER_TABLE);
        let base = mm.translator().translate(table) as *const AtomicU64;
        // Safety: the table is a live page-table page; idx is in bounds.
        Self {
            raw: unsafe { base.add(idx) },
        }
    }

    #[inline]
    pub(crate) fn read(self) -> PageEntry {
        // Safety: the slot points into a live table (or the root pseudo-slot)
        // for the duration of the walk.
        PageEntry::from_raw(unsafe { (*self.raw).load(Ordering::Acquire) })
    }

    #[inline]
    pub(crate) fn write(self, entry: PageEntry) {
        unsafe { (*self.raw).store(entry.raw(), Ordering::Release) }
    }

    /// Installs `new` only if the slot still holds `old`.
    #[inline]
    pub(crate) fn compare_exchange(self, old: PageEntry, new: PageEntry) -> bool {
        unsafe {
            (*self.raw)
                .compare_exchange(old.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }
    }
}

/// One page-table operation.
///
/// The five associated constants select the walker variant; the defaults
/// mirror the common case, so most operations only state how they differ.
pub(crate) trait WalkOp {
    /// Allocate a missing intermediate table instead of skipping its span.
    const ALLOCATE_INTERMEDIATE: bool;
    /// Do not call [`leaf`](Self::leaf) on empty entries.
    const SKIP_EMPTY: bool = true;
    /// Descend into an intermediate table covering a whole large-page span
    /// rather than treating the span as one unit.
    const DESCEND: bool = true;
    /// Visit a single entry and stop.
    const ONCE: bool = false;
    /// Split a huge mapping when the walk needs finer granularity; when
    /// disabled, [`sub_page`](Self::sub_page) is called instead.
    const SPLIT: bool = true;

    /// Number of leaf sizes the operation may map (1 forbids huge leaves).
    fn nr_page_sizes(&self) -> usize {
        NR_PAGE_SIZES
    }

    /// How the walker reads entries on this operation's behalf.
    fn read_slot(&self, slot: PtSlot) -> PageEntry {
        slot.read()
    }

    /// Called on each leaf entry; `offset` is relative to the walk's range
    /// base. Returning false at a large-capable level makes the walker
    /// descend and retry with small pages.
    fn leaf(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) -> bool;

    /// Called instead of splitting when a huge mapping covers more than the
    /// walked sub-range and [`SPLIT`](Self::SPLIT) is off.
    fn sub_page(&mut self, _mm: &MemoryManager, _slot: PtSlot, _level: usize, _offset: usize) {}

    /// Called just before descending through a level-1 slot whose span is
    /// wholly inside the walked range.
    fn intermediate_pre(&mut self, _mm: &MemoryManager, _slot: PtSlot, _offset: usize) {}

    /// Counterpart of [`intermediate_pre`](Self::intermediate_pre), after the
    /// descent returns.
    fn intermediate_post(&mut self, _mm: &MemoryManager, _slot: PtSlot, _offset: usize) {}

    /// Whether the finished walk invalidated mappings other CPUs may have
    /// cached.
    fn tlb_flush_needed(&mut self, _mm: &MemoryManager) -> bool {
        false
    }

    /// Runs after the (possible) TLB flush at the end of [`operate_range`].
    fn finalize(&mut self, _mm: &MemoryManager) {}
}

/// Drives `op` over `[start, start + size)`.
///
/// The range is rounded out to whole pages (at least one). A TLB flush is
/// issued afterwards if the operation asks for one, then the operation's
/// `finalize` hook runs. `vma_start` anchors the offsets handed to the
/// operation's handlers.
pub(crate) fn operate_range<O: WalkOp>(
    mm: &MemoryManager,
    op: &mut O,
    vma_start: VirtualAddress,
    start: VirtualAddress,
    size: usize,
) {
    let start = start.align_down(PAGE_SIZE);
    let size = ((size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)).max(PAGE_SIZE);
    map_range(mm, op, vma_start, start, size, PAGE_SIZE);
    if op.tlb_flush_needed(mm) {
        arch::flush_tlb_all();
    }
    op.finalize(mm);
}

/// Raw walk over an exact range with a caller-chosen clamp granularity.
///
/// No alignment fixups, no flush, no finalize; [`operate_range`] wraps this
/// for the common case. A `slop` above the page size rounds each visited
/// sub-range out to that granularity, allowing larger leaves.
pub(crate) fn map_range<O: WalkOp>(
    mm: &MemoryManager,
    op: &mut O,
    vma_start: VirtualAddress,
    vstart: VirtualAddress,
    size: usize,
    slop: usize,
) {
    debug_assert!(size > 0);
    let mut walk = Walk {
        mm,
        op,
        vma_start: vma_start.as_usize(),
        slop,
    };
    let root = PtSlot::of(mm.root_slot());
    let vstart = vstart.as_usize();
    walk.level(root, PAGE_TABLE_LEVELS, vstart, vstart + size - 1, 0);
}

struct Walk<'a, O: WalkOp> {
    mm: &'a MemoryManager,
    op: &'a mut O,
    vma_start: usize,
    slop: usize,
}

impl<O: WalkOp> Walk<'_, O> {
    fn skip(&self, slot: PtSlot) -> bool {
        O::SKIP_EMPTY && self.op.read_slot(slot).is_empty()
    }

    fn descend(&self, slot: PtSlot) -> bool {
        if !O::DESCEND {
            return false;
        }
        let entry = self.op.read_slot(slot);
        !entry.is_empty() && !entry.large()
    }

    /// Walks the entries of the table behind `parent` that intersect
    /// `[vcur, vend]` (inclusive). `base_virt` is the first address `parent`
    /// spans.
    fn level(&mut self, parent: PtSlot, parent_level: usize, vcur: usize, vend: usize, base_virt: usize) {
        let level = parent_level - 1;
        let entry = self.op.read_slot(parent);
        if !entry.valid() {
            if !O::ALLOCATE_INTERMEDIATE {
                return;
            }
            allocate_intermediate(self.mm, parent);
        } else if entry.large() {
            if O::SPLIT {
                split_large_page(self.mm, parent, parent_level);
            } else {
                if large_capable(parent_level) {
                    self.op
                        .sub_page(self.mm, parent, parent_level, base_virt.wrapping_sub(self.vma_start));
                }
                return;
            }
        }

        let table = self.op.read_slot(parent).addr();
        let step = arch::level_span(level);
        let mut idx = arch::page_index(vcur, level);
        let eidx = arch::page_index(vend, level);
        let mut base_virt = arch::canonicalize_virtual(base_virt + idx * step);

        loop {
            let slot = PtSlot::at(self.mm, table, idx);
            let (vstart1, vend1) = clamp(vcur, vend, base_virt, base_virt + (step - 1), self.slop);
            if level < self.op.nr_page_sizes() && vstart1 == base_virt && vend1 == base_virt + (step - 1) {
                let offset = base_virt.wrapping_sub(self.vma_start);
                if level > 0 {
                    if !self.skip(slot) {
                        if self.descend(slot) || !self.op.leaf(self.mm, slot, level, offset) {
                            self.op.intermediate_pre(self.mm, slot, offset);
                            self.level(slot, level, vstart1, vend1, base_virt);
                            self.op.intermediate_post(self.mm, slot, offset);
                        }
                    }
                } else if !self.skip(slot) {
                    self.op.leaf(self.mm, slot, 0, offset);
                }
            } else if level > 0 {
                self.level(slot, level, vstart1, vend1, base_virt);
            }
            if O::ONCE || idx >= eidx {
                break;
            }
            idx += 1;
            base_virt = base_virt.wrapping_add(step);
        }
    }
}

/// Clips `[vstart, vend]` to the entry span `[lo, hi]`, first rounding the
/// range out to `slop` granularity.
fn clamp(vstart: usize, vend: usize, lo: usize, hi: usize, slop: usize) -> (usize, usize) {
    let vstart = (vstart & !(slop - 1)).max(lo);
    let vend = (vend | (slop - 1)).min(hi);
    (vstart, vend)
}

/// Puts a zeroed table behind an empty slot.
///
/// Walkers race here under the VMA read lock; the compare-exchange arbitrates
/// and the loser returns its page.
fn allocate_intermediate(mm: &MemoryManager, slot: PtSlot) {
    let table = mm.alloc_page();
    // Safety: we own the fresh page until it is published through the slot.
    unsafe { ptr::write_bytes(mm.translator().translate(table), 0, PAGE_SIZE) };
    if !slot.compare_exchange(PageEntry::empty(), PageEntry::intermediate(table)) {
        mm.free_page(table);
    }
}

/// Replaces a huge mapping with a table of small entries covering the same
/// range with the same flags, so a finer-grained operation can proceed. The
/// backing huge page is untouched; its pieces may later be freed page by
/// page.
///
/// Only called under the write lock, so a plain store suffices.
fn split_large_page(mm: &MemoryManager, slot: PtSlot, parent_level: usize) {
    assert!(
        large_capable(parent_level),
        "splitting an entry at level {parent_level}"
    );
    let mut orig = slot.read();
    orig.set_large(false);
    let table = mm.alloc_page();
    let base = mm.translator().translate(table) as *mut u64;
    for i in 0..ENTRIES_PER_TABLE {
        let mut entry = orig;
        entry.set_addr(orig.addr().add(i << PAGE_SHIFT));
        // Safety: the fresh table is unpublished; plain writes are fine.
        unsafe { base.add(i).write(entry.raw()) };
    }
    slot.write(PageEntry::intermediate(table));
}

/// Rewrites the permission bits of a leaf entry in place.
///
/// Any requested permission also grants read: with the present bit off the
/// hardware refuses reads, writes and fetches alike, so an entry that should
/// allow anything must be present. Revoking everything keeps the entry
/// present but sets a reserved physical-address bit, which faults on any
/// access while staying distinguishable from a never-mapped entry.
/// Copy-on-write entries never get hardware write permission; the write
/// fault performs the copy first.
///
/// Returns true if some previously granted permission was taken away, which
/// is exactly when stale TLB entries could still honor it.
pub(crate) fn change_perm(slot: PtSlot, mut perm: Perm) -> bool {
    let mut entry = slot.read();
    let mut old = Perm::empty();
    if entry.valid() {
        old |= Perm::READ;
    }
    if entry.writable() {
        old |= Perm::WRITE;
    }
    if entry.executable() {
        old |= Perm::EXEC;
    }
    if !perm.is_empty() {
        // A present entry is always readable.
        perm |= Perm::READ;
    }
    if entry.cow() {
        perm.remove(Perm::WRITE);
    }
    entry.set_valid(true);
    entry.set_writable(perm.contains(Perm::WRITE));
    entry.set_executable(perm.contains(Perm::EXEC));
    entry.set_rsvd(perm.is_empty());
    slot.write(entry);
    !(old - perm).is_empty()
}

/// Batches mappings torn down by one walk.
///
/// The pages behind removed entries cannot be freed while another CPU's TLB
/// may still map them, so tear-down queues them here and they are freed only
/// after a full flush: either when the batch fills mid-walk or at the final
/// flush.
pub(crate) struct TlbGather {
    pages: [(PhysicalAddress, usize); Self::MAX_PAGES],
    len: usize,
}

impl TlbGather {
    const MAX_PAGES: usize = 20;

    pub(crate) fn new() -> Self {
        Self {
            pages: [(PhysicalAddress::ZERO, 0); Self::MAX_PAGES],
            len: 0,
        }
    }

    /// Queues one page; returns true if the batch was full and had to flush
    /// (covering the new page's mapping as well).
    pub(crate) fn push(&mut self, mm: &MemoryManager, addr: PhysicalAddress, size: usize) -> bool {
        let mut flushed = false;
        if self.len == Self::MAX_PAGES {
            self.flush(mm);
            flushed = true;
        }
        self.pages[self.len] = (addr, size);
        self.len += 1;
        flushed
    }

    /// Flushes the TLB and frees the queued pages. Returns false if there was
    /// nothing queued (and so no flush happened).
    pub(crate) fn flush(&mut self, mm: &MemoryManager) -> bool {
        if self.len == 0 {
            return false;
        }
        arch::flush_tlb_all();
        for &(addr, size) in &self.pages[..self.len] {
            if size == PAGE_SIZE {
                mm.free_page(addr);
            } else {
                mm.free_huge_page(addr);
            }
        }
        self.len = 0;
        true
    }
}

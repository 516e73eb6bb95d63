//! The page-table operations the mapping layer is built from.
//!
//! Each type here implements [`WalkOp`] and encodes one verb: populate,
//! unpopulate, protect, clean dirty bits, translate, map linearly, or free
//! empty tables. The operations that bring pages in and out delegate the
//! actual frames to a [`PageSource`], so the same populate drives anonymous
//! memory, file mappings and shared segments.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::{self, PageEntry, ENTRIES_PER_TABLE, NR_PAGE_SIZES, PAGE_SIZE};
use crate::memory_manager::MemoryManager;

use super::backing::{MappedFile, PageSource};
use super::deferred::DeferredFrees;
use super::walker::{change_perm, PtSlot, TlbGather, WalkOp};
use super::{MmapError, Perm};

/// Outcome of asking a [`PageSource`] to back one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapResult {
    /// The source installed a mapping. `replaced` carries the frame of a
    /// previous mapping the source displaced (a broken copy-on-write page);
    /// the caller frees it once the TLB no longer references it.
    Mapped { replaced: Option<PhysicalAddress> },
    /// The entry was already backed, whether by an earlier walk or a racing
    /// fault. Nothing changed, and in particular the walker must not split
    /// what it found.
    Present,
    /// The source cannot supply a mapping of this granularity; at a
    /// large-capable level the walker descends and retries with small pages.
    Unavailable,
}

/// Builds a leaf entry granting `perm` at `addr`.
///
/// Any grant implies hardware read (the present bit); revoking everything
/// keeps the entry present with the reserved marker set, so it faults on
/// access but stays distinguishable from a hole.
pub(crate) fn leaf_entry(addr: PhysicalAddress, large: bool, perm: Perm) -> PageEntry {
    let mut entry = PageEntry::leaf(addr, large);
    entry.set_writable(perm.contains(Perm::WRITE));
    entry.set_executable(perm.contains(Perm::EXEC));
    entry.set_rsvd(perm.is_empty());
    entry
}

/// Writes identity-offset mappings for a physically contiguous range.
///
/// Used for the direct map and other kernel windows. Entries are written
/// unconditionally and a large-capable exact fit becomes a large leaf, which
/// is what the huge `slop` of [`linear_map`](super::linear_map) arranges.
pub(crate) struct LinearMapper {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl LinearMapper {
    pub(crate) fn new(start: PhysicalAddress, size: usize) -> Self {
        Self {
            start,
            end: start.add(size),
        }
    }
}

impl WalkOp for LinearMapper {
    const ALLOCATE_INTERMEDIATE: bool = true;
    const SKIP_EMPTY: bool = false;
    const DESCEND: bool = false;
    const SPLIT: bool = false;

    fn leaf(&mut self, _mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) -> bool {
        let addr = self.start.add(offset);
        debug_assert!(addr < self.end);
        slot.write(leaf_entry(addr, level > 0, Perm::READ | Perm::WRITE | Perm::EXEC));
        true
    }
}

/// Backs a range with frames from a [`PageSource`].
///
/// Serves both eager mapping and the fault path; `write` distinguishes a
/// write fault, which must break copy-on-write pages that an earlier read
/// fault left in place.
pub(crate) struct Populate<'a, S: PageSource> {
    source: &'a mut S,
    perm: Perm,
    write: bool,
    /// Whether new mappings start with the dirty bit set. File-backed
    /// mappings pass false so write-back can trust the bit.
    map_dirty: bool,
    /// Restricts the walk to small pages regardless of alignment.
    small: bool,
    gather: TlbGather,
    operated: usize,
}

impl<'a, S: PageSource> Populate<'a, S> {
    pub(crate) fn new(source: &'a mut S, perm: Perm, write: bool, map_dirty: bool, small: bool) -> Self {
        Self {
            source,
            perm,
            write,
            map_dirty,
            small,
            gather: TlbGather::new(),
            operated: 0,
        }
    }

    /// Bytes newly backed by this walk.
    pub(crate) fn operated(&self) -> usize {
        self.operated
    }

    fn skip(&self, slot: PtSlot) -> bool {
        let entry = slot.read();
        if entry.is_empty() {
            return false;
        }
        // An existing entry only needs work when a write fault hits a
        // non-writable mapping.
        !self.write || entry.writable()
    }
}

impl<S: PageSource> WalkOp for Populate<'_, S> {
    const ALLOCATE_INTERMEDIATE: bool = true;
    const SKIP_EMPTY: bool = false;

    fn nr_page_sizes(&self) -> usize {
        if self.small {
            1
        } else {
            NR_PAGE_SIZES
        }
    }

    fn leaf(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) -> bool {
        if self.skip(slot) {
            return true;
        }
        let mut proposal = leaf_entry(PhysicalAddress::ZERO, level > 0, self.perm);
        proposal.set_dirty(self.map_dirty || self.write);
        match self.source.map(mm, offset, slot, proposal, level, self.write) {
            MapResult::Mapped { replaced } => {
                self.operated += arch::level_span(level);
                if let Some(old) = replaced {
                    self.gather.push(mm, old, PAGE_SIZE);
                }
                true
            }
            MapResult::Present => true,
            // At level 0 this leaves a hole for a later fault; above it the
            // walker descends and retries small.
            MapResult::Unavailable => false,
        }
    }

    fn tlb_flush_needed(&mut self, mm: &MemoryManager) -> bool {
        // The only mappings a populate invalidates are the originals of
        // broken copy-on-write pages, and the gather's own flush covers
        // those.
        self.gather.flush(mm);
        false
    }
}

/// Tears mappings out of a range, returning the frames to their source.
pub(crate) struct Unpopulate<'a, S: PageSource> {
    source: &'a mut S,
    deferred: &'a DeferredFrees,
    gather: TlbGather,
    do_flush: bool,
    operated: usize,
}

impl<'a, S: PageSource> Unpopulate<'a, S> {
    pub(crate) fn new(source: &'a mut S, deferred: &'a DeferredFrees) -> Self {
        Self {
            source,
            deferred,
            gather: TlbGather::new(),
            do_flush: false,
            operated: 0,
        }
    }

    pub(crate) fn operated(&self) -> usize {
        self.operated
    }
}

impl<S: PageSource> WalkOp for Unpopulate<'_, S> {
    const ALLOCATE_INTERMEDIATE: bool = false;

    fn leaf(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) -> bool {
        // Entries whose permissions were fully revoked still hold a frame
        // and are torn down like any other.
        let addr = slot.read().addr();
        let size = arch::level_span(level);
        if self.source.unmap(mm, addr, offset, slot, level) {
            self.gather.push(mm, addr, size);
        } else {
            // The source kept the frame but the mapping is gone; the TLB
            // still needs shooting down.
            self.do_flush = true;
        }
        self.operated += size;
        true
    }

    fn intermediate_post(&mut self, _mm: &MemoryManager, slot: PtSlot, _offset: usize) {
        // The descent cleared every entry beneath this slot. Readers may
        // still be walking the table, so the slot is emptied first and the
        // table page freed only once they are gone.
        let table = slot.read().addr();
        slot.write(PageEntry::empty());
        self.deferred.free(table);
        self.do_flush = true;
    }

    fn tlb_flush_needed(&mut self, mm: &MemoryManager) -> bool {
        !self.gather.flush(mm) && self.do_flush
    }

    fn finalize(&mut self, mm: &MemoryManager) {
        self.deferred.drain(mm);
    }
}

/// Rewrites the permissions of everything mapped in a range.
pub(crate) struct Protect {
    perm: Perm,
    do_flush: bool,
}

impl Protect {
    pub(crate) fn new(perm: Perm) -> Self {
        Self {
            perm,
            do_flush: false,
        }
    }
}

impl WalkOp for Protect {
    const ALLOCATE_INTERMEDIATE: bool = false;

    fn leaf(&mut self, _mm: &MemoryManager, slot: PtSlot, _level: usize, _offset: usize) -> bool {
        self.do_flush |= change_perm(slot, self.perm);
        true
    }

    fn tlb_flush_needed(&mut self, _mm: &MemoryManager) -> bool {
        self.do_flush
    }
}

/// Consumer of the frames a [`DirtyClean`] walk found dirty.
pub(crate) trait DirtyHandler {
    /// Called for each entry whose dirty bit was cleared, in walk order.
    fn dirty(&mut self, mm: &MemoryManager, phys: PhysicalAddress, offset: usize, size: usize);

    /// Called once after the walk and its TLB flush.
    fn finish(&mut self, mm: &MemoryManager);
}

/// Clears dirty bits over a range and reports the dirty frames.
///
/// Runs under the address-space read lock, so a racing write fault may be
/// setting bits concurrently; each clear goes through compare-exchange and
/// retries until it takes effect on a consistent snapshot.
pub(crate) struct DirtyClean<'a, H: DirtyHandler> {
    handler: &'a mut H,
    do_flush: bool,
}

impl<'a, H: DirtyHandler> DirtyClean<'a, H> {
    pub(crate) fn new(handler: &'a mut H) -> Self {
        Self {
            handler,
            do_flush: false,
        }
    }
}

impl<H: DirtyHandler> WalkOp for DirtyClean<'_, H> {
    const ALLOCATE_INTERMEDIATE: bool = false;

    fn leaf(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) -> bool {
        loop {
            let entry = slot.read();
            if !entry.dirty() {
                return true;
            }
            let mut clean = entry;
            clean.set_dirty(false);
            if slot.compare_exchange(entry, clean) {
                self.do_flush = true;
                self.handler
                    .dirty(mm, entry.addr(), offset, arch::level_span(level));
                return true;
            }
        }
    }

    fn tlb_flush_needed(&mut self, _mm: &MemoryManager) -> bool {
        self.do_flush
    }

    fn finalize(&mut self, mm: &MemoryManager) {
        self.handler.finish(mm);
    }
}

/// Writes the dirty pages of a file mapping back through its file.
///
/// Offsets arrive in walk order, so the resulting writes are issued in
/// ascending file order. A write near the end of the file is clipped to the
/// file's length; the mapped tail past it holds zeros that were never file
/// content. The first I/O error stops the pass and is reported to the
/// caller.
pub(crate) struct DirtySync {
    file: Arc<dyn MappedFile>,
    base_offset: usize,
    file_size: usize,
    queue: Vec<(PhysicalAddress, usize, usize)>,
    synced: usize,
    result: Result<(), MmapError>,
}

impl DirtySync {
    pub(crate) fn new(file: Arc<dyn MappedFile>, base_offset: usize) -> Self {
        let file_size = file.len();
        Self {
            file,
            base_offset,
            file_size,
            queue: Vec::new(),
            synced: 0,
            result: Ok(()),
        }
    }

    pub(crate) fn result(&self) -> Result<(), MmapError> {
        self.result
    }

    /// Bytes queued for write-back; zero means the range had no dirty pages.
    pub(crate) fn synced(&self) -> usize {
        self.synced
    }
}

impl DirtyHandler for DirtySync {
    fn dirty(&mut self, _mm: &MemoryManager, phys: PhysicalAddress, offset: usize, size: usize) {
        let off = self.base_offset + offset;
        let len = size.min(self.file_size.saturating_sub(off));
        if len == 0 {
            return;
        }
        self.synced += len;
        self.queue.push((phys, off, len));
    }

    fn finish(&mut self, mm: &MemoryManager) {
        for &(phys, off, len) in &self.queue {
            // Safety: the frame backs a mapping of this file and stays
            // allocated for as long as the sync holds the address-space
            // lock.
            let data = unsafe {
                core::slice::from_raw_parts(mm.translator().translate(phys) as *const u8, len)
            };
            if let Err(err) = self.file.write(off, data) {
                self.result = Err(err);
                break;
            }
        }
        self.queue.clear();
    }
}

/// Resolves one virtual address to its physical address.
pub(crate) struct ToPhys {
    virt: usize,
    result: Option<PhysicalAddress>,
}

impl ToPhys {
    pub(crate) fn new(virt: VirtualAddress) -> Self {
        Self {
            virt: virt.as_usize(),
            result: None,
        }
    }

    pub(crate) fn result(&self) -> Option<PhysicalAddress> {
        self.result
    }
}

impl WalkOp for ToPhys {
    const ALLOCATE_INTERMEDIATE: bool = false;
    const ONCE: bool = true;
    const SPLIT: bool = false;

    fn leaf(&mut self, _mm: &MemoryManager, slot: PtSlot, level: usize, _offset: usize) -> bool {
        debug_assert!(self.result.is_none());
        let entry = slot.read();
        self.result = Some(PhysicalAddress::new(
            entry.addr().as_usize() | (self.virt & (arch::level_span(level) - 1)),
        ));
        true
    }

    fn sub_page(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) {
        debug_assert!(slot.read().large());
        self.leaf(mm, slot, level, offset);
    }
}

/// Reads the entry mapping one virtual address, along with its level.
pub(crate) struct ToPte {
    result: Option<(PageEntry, usize)>,
}

impl ToPte {
    pub(crate) fn new() -> Self {
        Self { result: None }
    }

    pub(crate) fn result(&self) -> Option<(PageEntry, usize)> {
        self.result
    }
}

impl WalkOp for ToPte {
    const ALLOCATE_INTERMEDIATE: bool = false;
    const ONCE: bool = true;
    const SPLIT: bool = false;

    fn leaf(&mut self, _mm: &MemoryManager, slot: PtSlot, level: usize, _offset: usize) -> bool {
        self.result = Some((slot.read(), level));
        true
    }

    fn sub_page(&mut self, mm: &MemoryManager, slot: PtSlot, level: usize, offset: usize) {
        debug_assert!(slot.read().large());
        self.leaf(mm, slot, level, offset);
    }
}

/// Frees page tables that no longer map anything.
///
/// Counts live entries under each fully covered bottom-level table; a table
/// that comes up empty is verified all-zero, unlinked, and freed once
/// concurrent readers are done with it. Tables partially covered by the
/// walked range are left alone, since their other half may serve a neighbor.
pub(crate) struct CleanupTables<'a> {
    deferred: &'a DeferredFrees,
    live: usize,
    do_flush: bool,
}

impl<'a> CleanupTables<'a> {
    pub(crate) fn new(deferred: &'a DeferredFrees) -> Self {
        Self {
            deferred,
            live: 0,
            do_flush: false,
        }
    }
}

impl WalkOp for CleanupTables<'_> {
    const ALLOCATE_INTERMEDIATE: bool = false;
    const SPLIT: bool = false;

    fn leaf(&mut self, _mm: &MemoryManager, _slot: PtSlot, level: usize, _offset: usize) -> bool {
        if level == 0 {
            self.live += 1;
        }
        true
    }

    fn intermediate_pre(&mut self, _mm: &MemoryManager, _slot: PtSlot, _offset: usize) {
        self.live = 0;
    }

    fn intermediate_post(&mut self, mm: &MemoryManager, slot: PtSlot, _offset: usize) {
        if self.live != 0 {
            return;
        }
        let old = slot.read();
        let table = mm.translator().translate(old.addr()) as *const u64;
        for i in 0..ENTRIES_PER_TABLE {
            assert_eq!(
                unsafe { table.add(i).read() },
                0,
                "table with live entries about to be freed"
            );
        }
        slot.write(PageEntry::empty());
        self.deferred.free(old.addr());
        self.do_flush = true;
    }

    fn tlb_flush_needed(&mut self, _mm: &MemoryManager) -> bool {
        self.do_flush
    }

    fn finalize(&mut self, mm: &MemoryManager) {
        self.deferred.drain(mm);
    }
}

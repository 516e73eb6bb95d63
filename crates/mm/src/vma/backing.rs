//! Page sources: where mapped frames come from and go back to.
//!
//! A [`PageSource`] hands frames to the populate operation and takes them
//! back from unpopulate. The three sources mirror the three mapping kinds:
//! fresh zeroed (or deliberately unzeroed) frames for anonymous memory, file
//! content with copy-on-write for private file mappings, and refcounted huge
//! segments for shared memory. File content itself comes and goes through
//! the [`MappedFile`] trait the embedding kernel implements over its VFS.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::ptr;

use spin::Mutex;

use crate::address::PhysicalAddress;
use crate::arch::{PageEntry, HUGE_PAGE_SIZE, PAGE_SIZE};
use crate::memory_manager::MemoryManager;

use super::ops::MapResult;
use super::walker::PtSlot;
use super::MmapError;

/// Supplies and reclaims the frames behind one mapping.
///
/// `map` receives the entry the populate walk proposes (permissions and
/// dirty state already set, address blank) and installs it with the frame
/// filled in, using compare-exchange so concurrent faults on the same entry
/// resolve to one winner. `unmap` clears the entry and says whether the
/// caller now owns the frame: true means the caller frees it once the TLB is
/// clean, false means the source keeps it.
pub(crate) trait PageSource {
    fn map(
        &mut self,
        mm: &MemoryManager,
        offset: usize,
        slot: PtSlot,
        pte: PageEntry,
        level: usize,
        write: bool,
    ) -> MapResult;

    fn unmap(
        &mut self,
        mm: &MemoryManager,
        addr: PhysicalAddress,
        offset: usize,
        slot: PtSlot,
        level: usize,
    ) -> bool;
}

fn zero_frame(mm: &MemoryManager, addr: PhysicalAddress, size: usize) {
    // Safety: the caller owns the freshly allocated frame.
    unsafe { ptr::write_bytes(mm.translator().translate(addr), 0, size) };
}

/// Anonymous memory: fresh frames, huge when the walk offers the chance.
pub(crate) struct AnonPages {
    uninitialized: bool,
}

impl AnonPages {
    pub(crate) fn new(uninitialized: bool) -> Self {
        Self { uninitialized }
    }
}

impl PageSource for AnonPages {
    fn map(
        &mut self,
        mm: &MemoryManager,
        _offset: usize,
        slot: PtSlot,
        mut pte: PageEntry,
        level: usize,
        _write: bool,
    ) -> MapResult {
        if level > 0 {
            let huge = match mm.alloc_huge_page() {
                Some(huge) => huge,
                None => return MapResult::Unavailable,
            };
            if !self.uninitialized {
                zero_frame(mm, huge, HUGE_PAGE_SIZE);
            }
            pte.set_addr(huge);
            if slot.compare_exchange(PageEntry::empty(), pte) {
                MapResult::Mapped { replaced: None }
            } else {
                mm.free_huge_page(huge);
                MapResult::Present
            }
        } else {
            let page = mm.alloc_page();
            if !self.uninitialized {
                zero_frame(mm, page, PAGE_SIZE);
            }
            pte.set_addr(page);
            if slot.compare_exchange(PageEntry::empty(), pte) {
                MapResult::Mapped { replaced: None }
            } else {
                mm.free_page(page);
                MapResult::Present
            }
        }
    }

    fn unmap(
        &mut self,
        _mm: &MemoryManager,
        _addr: PhysicalAddress,
        _offset: usize,
        slot: PtSlot,
        _level: usize,
    ) -> bool {
        slot.write(PageEntry::empty());
        true
    }
}

/// What the mapping layer needs from an open file.
///
/// The embedding kernel implements this over its VFS; every method may be
/// called with the address-space lock held, so implementations must not
/// call back into the mapping layer.
pub trait MappedFile: Send + Sync {
    /// Current length of the file in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads at `offset` into `buf`, returning the number of bytes read.
    /// A short read means the file ended; the caller zero-fills the rest.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, MmapError>;

    /// Writes `buf` at `offset`. The mapping layer never writes past
    /// [`len`](Self::len).
    fn write(&self, offset: usize, buf: &[u8]) -> Result<(), MmapError>;

    /// Flushes previously written data to storage.
    fn sync(&self) -> Result<(), MmapError>;

    /// Whether the file was opened readable.
    fn readable(&self) -> bool;

    /// Whether the file was opened writable.
    fn writable(&self) -> bool;

    /// Whether mappings of this file must refuse execute permission.
    fn noexec(&self) -> bool {
        false
    }

    /// Device number for the mappings listing.
    fn dev_id(&self) -> u64 {
        0
    }

    /// Inode number for the mappings listing.
    fn inode(&self) -> u64 {
        0
    }

    /// Path for the mappings listing.
    fn path(&self) -> &str {
        ""
    }
}

/// File-backed pages, read on fault.
///
/// Every mapping starts from a read fault that loads the page and maps it
/// read-only: private mappings mark it copy-on-write, shared mappings leave
/// it clean so the first write faults and records a trustworthy dirty bit.
/// The write fault then either breaks the copy-on-write page (new frame,
/// contents carried over, old frame handed back for freeing) or upgrades
/// the shared page in place. Raising permissions in place needs no
/// shoot-down; a stale read-only TLB entry at worst causes one spurious
/// fault, which re-walks the tables.
pub(crate) struct FilePages {
    file: Arc<dyn MappedFile>,
    offset: usize,
    shared: bool,
}

impl FilePages {
    pub(crate) fn new(file: Arc<dyn MappedFile>, offset: usize, shared: bool) -> Self {
        Self {
            file,
            offset,
            shared,
        }
    }
}

impl PageSource for FilePages {
    fn map(
        &mut self,
        mm: &MemoryManager,
        offset: usize,
        slot: PtSlot,
        mut pte: PageEntry,
        level: usize,
        write: bool,
    ) -> MapResult {
        // File content is mapped a page at a time.
        if level > 0 {
            return MapResult::Unavailable;
        }
        let entry = slot.read();
        if entry.is_empty() {
            let foff = self.offset + offset;
            if foff >= self.file.len() {
                // Whole pages past the end of the file stay unmapped;
                // touching them is a bus error, not a zero page.
                return MapResult::Unavailable;
            }
            let page = mm.alloc_page();
            // Safety: the frame is owned by us until published.
            let buf =
                unsafe { core::slice::from_raw_parts_mut(mm.translator().translate(page), PAGE_SIZE) };
            let got = match self.file.read(foff, buf) {
                Ok(got) => got.min(PAGE_SIZE),
                Err(err) => {
                    log::warn!("read of mapped file failed at {foff:#x}: {err}");
                    0
                }
            };
            buf[got..].fill(0);

            pte.set_addr(page);
            if !write {
                // Read faults map the page clean and read-only. The first
                // write then faults, and either breaks the private copy or
                // records the dirtying of the shared one.
                pte.set_dirty(false);
                if self.shared {
                    pte.set_writable(false);
                } else {
                    pte.mark_cow(true);
                }
            }
            if slot.compare_exchange(PageEntry::empty(), pte) {
                MapResult::Mapped { replaced: None }
            } else {
                mm.free_page(page);
                MapResult::Present
            }
        } else if entry.cow() {
            // Write fault on a private page: copy, then swap the entry. The
            // old frame goes back to the caller to free after the flush.
            let new = mm.alloc_page();
            unsafe {
                ptr::copy_nonoverlapping(
                    mm.translator().translate(entry.addr()) as *const u8,
                    mm.translator().translate(new),
                    PAGE_SIZE,
                );
            }
            pte.set_addr(new);
            if slot.compare_exchange(entry, pte) {
                MapResult::Mapped {
                    replaced: Some(entry.addr()),
                }
            } else {
                mm.free_page(new);
                MapResult::Present
            }
        } else {
            // Write fault on a clean shared page: grant write and record
            // the dirtying in place.
            let mut up = entry;
            up.set_writable(true);
            up.set_dirty(true);
            if slot.compare_exchange(entry, up) {
                MapResult::Mapped { replaced: None }
            } else {
                MapResult::Present
            }
        }
    }

    fn unmap(
        &mut self,
        _mm: &MemoryManager,
        _addr: PhysicalAddress,
        _offset: usize,
        slot: PtSlot,
        _level: usize,
    ) -> bool {
        slot.write(PageEntry::empty());
        true
    }
}

/// The huge segments behind one shared-memory object.
///
/// Segments are allocated on first touch, keyed by their huge-aligned
/// offset, and shared by every mapping holding the same `Arc`. They outlive
/// individual mappings; the frames return to the allocator only on
/// [`close`](Self::close), when the last mapping is gone.
pub struct ShmSegments {
    segments: Mutex<BTreeMap<usize, PhysicalAddress>>,
}

impl Default for ShmSegments {
    fn default() -> Self {
        Self::new()
    }
}

impl ShmSegments {
    pub fn new() -> Self {
        Self {
            segments: Mutex::new(BTreeMap::new()),
        }
    }

    /// The segment covering huge-aligned `offset`, allocated and zeroed on
    /// first use.
    fn segment(&self, mm: &MemoryManager, offset: usize) -> PhysicalAddress {
        debug_assert!(offset % HUGE_PAGE_SIZE == 0);
        let mut segments = self.segments.lock();
        if let Some(&seg) = segments.get(&offset) {
            return seg;
        }
        let seg = match mm.alloc_huge_page() {
            Some(seg) => seg,
            None => {
                // Contiguous memory may be sitting in reclaimable caches.
                mm.reclaim_once();
                match mm.alloc_huge_page() {
                    Some(seg) => seg,
                    None => panic!("out of contiguous memory for a shared segment"),
                }
            }
        };
        zero_frame(mm, seg, HUGE_PAGE_SIZE);
        segments.insert(offset, seg);
        seg
    }

    /// Returns every segment to the allocator.
    pub fn close(&self, mm: &MemoryManager) {
        let segments = core::mem::take(&mut *self.segments.lock());
        for (_, seg) in segments {
            mm.free_huge_page(seg);
        }
    }
}

/// One mapping's view into a [`ShmSegments`] object.
pub(crate) struct ShmPages {
    segments: Arc<ShmSegments>,
    base_offset: usize,
}

impl ShmPages {
    pub(crate) fn new(segments: Arc<ShmSegments>, base_offset: usize) -> Self {
        Self {
            segments,
            base_offset,
        }
    }
}

impl PageSource for ShmPages {
    fn map(
        &mut self,
        mm: &MemoryManager,
        offset: usize,
        slot: PtSlot,
        mut pte: PageEntry,
        level: usize,
        _write: bool,
    ) -> MapResult {
        let foff = self.base_offset + offset;
        let seg_off = foff & !(HUGE_PAGE_SIZE - 1);
        let seg = self.segments.segment(mm, seg_off);
        if level > 0 {
            debug_assert_eq!(foff, seg_off);
            pte.set_addr(seg);
        } else {
            pte.set_addr(seg.add(foff - seg_off));
        }
        if slot.compare_exchange(PageEntry::empty(), pte) {
            MapResult::Mapped { replaced: None }
        } else {
            MapResult::Present
        }
    }

    fn unmap(
        &mut self,
        _mm: &MemoryManager,
        addr: PhysicalAddress,
        offset: usize,
        slot: PtSlot,
        _level: usize,
    ) -> bool {
        let seg_off = (self.base_offset + offset) & !(HUGE_PAGE_SIZE - 1);
        debug_assert_eq!(
            Some(addr.align_down(HUGE_PAGE_SIZE)),
            self.segments.segments.lock().get(&seg_off).copied()
        );
        slot.write(PageEntry::empty());
        // The segment keeps the frame for other mappings of the object.
        false
    }
}

/// In-memory file for exercising file mappings.
#[cfg(test)]
pub(crate) struct TestFile {
    data: Mutex<alloc::vec::Vec<u8>>,
    readable: bool,
    writable: bool,
    noexec: bool,
    dev: u64,
    inode: u64,
    path: &'static str,
    fail_writes: bool,
    syncs: core::sync::atomic::AtomicUsize,
    writes: Mutex<alloc::vec::Vec<usize>>,
}

#[cfg(test)]
impl TestFile {
    pub(crate) fn new(data: alloc::vec::Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            readable: true,
            writable: true,
            noexec: false,
            dev: 0,
            inode: 0,
            path: "",
            fail_writes: false,
            syncs: core::sync::atomic::AtomicUsize::new(0),
            writes: Mutex::new(alloc::vec::Vec::new()),
        }
    }

    pub(crate) fn with_perm(data: alloc::vec::Vec<u8>, readable: bool, writable: bool) -> Self {
        Self {
            readable,
            writable,
            ..Self::new(data)
        }
    }

    pub(crate) fn failing_writes(data: alloc::vec::Vec<u8>) -> Self {
        Self {
            fail_writes: true,
            ..Self::new(data)
        }
    }

    pub(crate) fn with_identity(mut self, dev: u64, inode: u64, path: &'static str) -> Self {
        self.dev = dev;
        self.inode = inode;
        self.path = path;
        self
    }

    pub(crate) fn on_noexec_mount(mut self) -> Self {
        self.noexec = true;
        self
    }

    pub(crate) fn contents(&self) -> alloc::vec::Vec<u8> {
        self.data.lock().clone()
    }

    pub(crate) fn sync_count(&self) -> usize {
        self.syncs.load(core::sync::atomic::Ordering::Relaxed)
    }

    /// File offsets of every write, in issue order.
    pub(crate) fn write_offsets(&self) -> alloc::vec::Vec<usize> {
        self.writes.lock().clone()
    }
}

#[cfg(test)]
impl MappedFile for TestFile {
    fn len(&self) -> usize {
        self.data.lock().len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, MmapError> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> Result<(), MmapError> {
        if self.fail_writes {
            return Err(MmapError::AccessDenied);
        }
        let mut data = self.data.lock();
        assert!(offset + buf.len() <= data.len(), "write past end of file");
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.writes.lock().push(offset);
        Ok(())
    }

    fn sync(&self) -> Result<(), MmapError> {
        self.syncs
            .fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn readable(&self) -> bool {
        self.readable
    }

    fn writable(&self) -> bool {
        self.writable
    }

    fn noexec(&self) -> bool {
        self.noexec
    }

    fn dev_id(&self) -> u64 {
        self.dev
    }

    fn inode(&self) -> u64 {
        self.inode
    }

    fn path(&self) -> &str {
        self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_manager::emulation;
    use crate::vma::ops::leaf_entry;
    use crate::vma::Perm;
    use alloc::vec;
    use core::sync::atomic::AtomicU64;

    const MIB: usize = 1 << 20;

    fn proposal(perm: Perm, dirty: bool) -> PageEntry {
        let mut pte = leaf_entry(PhysicalAddress::ZERO, false, perm);
        pte.set_dirty(dirty);
        pte
    }

    fn frame_bytes(mm: &MemoryManager, addr: PhysicalAddress, len: usize) -> &[u8] {
        unsafe { core::slice::from_raw_parts(mm.translator().translate(addr), len) }
    }

    #[test]
    fn anon_pages_come_zeroed() {
        let mm = emulation::fresh(16 * MIB);
        let mut source = AnonPages::new(false);

        // Dirty a frame and hand it back so the next allocation reuses it.
        let recycled = mm.alloc_page();
        unsafe { ptr::write_bytes(mm.translator().translate(recycled), 0xa5, PAGE_SIZE) };
        mm.free_page(recycled);

        let cell = AtomicU64::new(0);
        let result = source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, true),
            0,
            false,
        );
        assert_eq!(result, MapResult::Mapped { replaced: None });
        let pte = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert_eq!(pte.addr(), recycled);
        assert!(frame_bytes(mm, pte.addr(), PAGE_SIZE).iter().all(|&b| b == 0));
    }

    #[test]
    fn uninitialized_anon_pages_skip_the_zeroing() {
        let mm = emulation::fresh(16 * MIB);
        let mut source = AnonPages::new(true);

        let recycled = mm.alloc_page();
        unsafe { ptr::write_bytes(mm.translator().translate(recycled), 0xa5, PAGE_SIZE) };
        mm.free_page(recycled);

        let cell = AtomicU64::new(0);
        source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, true),
            0,
            false,
        );
        let pte = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert_eq!(pte.addr(), recycled);
        assert!(frame_bytes(mm, pte.addr(), PAGE_SIZE).iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn anon_raced_entry_frees_the_loser() {
        let mm = emulation::fresh(16 * MIB);
        let mut source = AnonPages::new(false);

        let winner = PageEntry::leaf(PhysicalAddress::new(0x5000), false);
        let cell = AtomicU64::new(winner.raw());
        let result = source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ, true),
            0,
            false,
        );
        assert_eq!(result, MapResult::Present);
        assert_eq!(
            cell.load(core::sync::atomic::Ordering::Relaxed),
            winner.raw()
        );
    }

    #[test]
    fn private_read_fault_maps_copy_on_write() {
        let mm = emulation::fresh(16 * MIB);
        let mut content = vec![0u8; 6000];
        content[0] = 0x11;
        content[4096] = 0x22;
        let file: Arc<dyn MappedFile> = Arc::new(TestFile::new(content));
        let mut source = FilePages::new(file, 0, false);

        let cell = AtomicU64::new(0);
        source.map(
            mm,
            PAGE_SIZE,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, false),
            0,
            false,
        );
        let pte = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert!(pte.cow());
        assert!(!pte.writable());
        assert!(!pte.dirty());

        // 6000 - 4096 bytes of content, then zeros.
        let bytes = frame_bytes(mm, pte.addr(), PAGE_SIZE);
        assert_eq!(bytes[0], 0x22);
        assert!(bytes[6000 - 4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn private_write_fault_breaks_the_copy() {
        let mm = emulation::fresh(16 * MIB);
        let file: Arc<dyn MappedFile> = Arc::new(TestFile::new(vec![0x33u8; 4096]));
        let mut source = FilePages::new(file, 0, false);

        let cell = AtomicU64::new(0);
        source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, false),
            0,
            false,
        );
        let old = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));

        let write_proposal = proposal(Perm::READ | Perm::WRITE, true);
        let result = source.map(mm, 0, PtSlot::of(&cell), write_proposal, 0, true);
        assert_eq!(
            result,
            MapResult::Mapped {
                replaced: Some(old.addr())
            }
        );

        let new = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert_ne!(new.addr(), old.addr());
        assert!(new.writable());
        assert!(new.dirty());
        assert!(!new.cow());
        assert!(frame_bytes(mm, new.addr(), PAGE_SIZE).iter().all(|&b| b == 0x33));
    }

    #[test]
    fn shared_write_fault_upgrades_in_place() {
        let mm = emulation::fresh(16 * MIB);
        let file: Arc<dyn MappedFile> = Arc::new(TestFile::new(vec![0u8; 4096]));
        let mut source = FilePages::new(file, 0, true);

        let cell = AtomicU64::new(0);
        source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, false),
            0,
            false,
        );
        let clean = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert!(!clean.writable());
        assert!(!clean.cow());
        assert!(!clean.dirty());

        let result = source.map(
            mm,
            0,
            PtSlot::of(&cell),
            proposal(Perm::READ | Perm::WRITE, true),
            0,
            true,
        );
        assert_eq!(result, MapResult::Mapped { replaced: None });
        let dirty = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert_eq!(dirty.addr(), clean.addr());
        assert!(dirty.writable());
        assert!(dirty.dirty());
    }

    #[test]
    fn pages_past_the_end_of_file_stay_unmapped() {
        let mm = emulation::fresh(16 * MIB);
        let file: Arc<dyn MappedFile> = Arc::new(TestFile::new(vec![0u8; 4096]));
        let mut source = FilePages::new(file, 0, false);

        let cell = AtomicU64::new(0);
        let result = source.map(
            mm,
            PAGE_SIZE,
            PtSlot::of(&cell),
            proposal(Perm::READ, false),
            0,
            false,
        );
        assert_eq!(result, MapResult::Unavailable);
        assert_eq!(cell.load(core::sync::atomic::Ordering::Relaxed), 0);
    }

    #[test]
    fn shm_mappings_share_segments() {
        let mm = emulation::fresh_central(16 * MIB);
        let baseline = mm.stats().free;
        let segments = Arc::new(ShmSegments::new());
        let mut a = ShmPages::new(segments.clone(), 0);
        let mut b = ShmPages::new(segments.clone(), 0);

        let cell_a = AtomicU64::new(0);
        a.map(
            mm,
            0,
            PtSlot::of(&cell_a),
            proposal(Perm::READ | Perm::WRITE, true),
            0,
            false,
        );
        let pte_a = PageEntry::from_raw(cell_a.load(core::sync::atomic::Ordering::Relaxed));

        // The other mapping's fault on a nearby page lands in the same
        // segment.
        let cell_b = AtomicU64::new(0);
        b.map(
            mm,
            PAGE_SIZE,
            PtSlot::of(&cell_b),
            proposal(Perm::READ | Perm::WRITE, true),
            0,
            false,
        );
        let pte_b = PageEntry::from_raw(cell_b.load(core::sync::atomic::Ordering::Relaxed));
        assert_eq!(pte_b.addr(), pte_a.addr().add(PAGE_SIZE));
        assert_eq!(mm.stats().free, baseline - HUGE_PAGE_SIZE);

        // Unmapping keeps the frame with the object.
        assert!(!a.unmap(mm, pte_a.addr(), 0, PtSlot::of(&cell_a), 0));
        assert_eq!(cell_a.load(core::sync::atomic::Ordering::Relaxed), 0);
        assert_eq!(mm.stats().free, baseline - HUGE_PAGE_SIZE);

        segments.close(mm);
        assert_eq!(mm.stats().free, baseline);
    }

    #[test]
    fn shm_maps_whole_segments_when_asked_large() {
        let mm = emulation::fresh(16 * MIB);
        let segments = Arc::new(ShmSegments::new());
        let mut source = ShmPages::new(segments.clone(), 0);

        let cell = AtomicU64::new(0);
        let mut large = leaf_entry(PhysicalAddress::ZERO, true, Perm::READ | Perm::WRITE);
        large.set_dirty(true);
        let result = source.map(mm, 0, PtSlot::of(&cell), large, 1, false);
        assert_eq!(result, MapResult::Mapped { replaced: None });

        let pte = PageEntry::from_raw(cell.load(core::sync::atomic::Ordering::Relaxed));
        assert!(pte.large());
        assert!(pte.addr().is_aligned(HUGE_PAGE_SIZE));
        segments.close(mm);
    }

    #[test]
    fn shm_segment_contents_are_zeroed() {
        let mm = emulation::fresh(16 * MIB);
        let segments = Arc::new(ShmSegments::new());
        let seg = segments.segment(mm, 0);
        assert!(frame_bytes(mm, seg, HUGE_PAGE_SIZE).iter().all(|&b| b == 0));
        segments.close(mm);
    }
}

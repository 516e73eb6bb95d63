//! Virtual memory areas and the operations over them.
//!
//! The managed address space is a set of non-overlapping areas ordered by
//! start address, bounded by zero-length guard entries so every search sees
//! a neighbor on each side. Mapping calls take the set's write lock; the
//! fault path takes the read lock, so faults on different areas proceed in
//! parallel and only area creation and teardown serialize them.
//!
//! Pages are not backed at map time unless asked. A fault consults the
//! area's backing source ([`backing`]) and installs entries through the
//! generic table walker ([`walker`]), preferring huge mappings whenever the
//! area, its alignment and its backing allow. Teardown unhooks table pages
//! through a deferred-free list ([`deferred`]) so lock-free translations
//! ([`virt_to_phys`], [`virt_to_pte`]) never walk freed memory.

mod backing;
mod deferred;
mod ops;
mod walker;

pub use backing::{MappedFile, ShmSegments};

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use spin::RwLock;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::{HUGE_PAGE_SIZE, PAGE_SIZE, PageEntry};
use crate::memory_manager::MemoryManager;

use backing::{AnonPages, FilePages, ShmPages};
use deferred::DeferredFrees;
use ops::{
    CleanupTables, DirtyClean, DirtySync, LinearMapper, Populate, Protect, ToPhys, ToPte,
    Unpopulate,
};
use walker::{map_range, operate_range};

/// Lowest address an area may start at; keeps the null page unmapped.
pub const LOWER_VMA_LIMIT: usize = PAGE_SIZE;

/// End of the managed address space. Linear mappings live above it.
pub const UPPER_VMA_LIMIT: usize = 0x4000_0000_0000;

bitflags::bitflags! {
    /// Access permissions of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

bitflags::bitflags! {
    /// Placement and backing options for a new mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Map at exactly the given address, evicting whatever is there.
        const FIXED = 1 << 0;
        /// Back the whole range immediately instead of on fault.
        const POPULATE = 1 << 1;
        /// Writes are visible to other mappings of the same object and,
        /// for files, reach the file on sync.
        const SHARED = 1 << 2;
        /// Skip zero-filling fresh anonymous pages.
        const UNINITIALIZED = 1 << 3;
        /// Never use huge mappings for this area.
        const SMALL = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Options for [`msync`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const ASYNC = 1 << 0;
        const INVALIDATE = 1 << 1;
        const SYNC = 1 << 2;
    }
}

/// Why a mapping operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    /// No room in the address space, or the range is not fully mapped.
    OutOfMemory,
    /// Malformed address, length or flag combination.
    InvalidArgument,
    /// The backing file's open mode refuses the requested access.
    AccessDenied,
    /// Execute permission refused by the backing file.
    NotPermitted,
}

impl MmapError {
    /// The errno value reported to callers.
    pub fn errno(self) -> i32 {
        match self {
            MmapError::OutOfMemory => 12,
            MmapError::InvalidArgument => 22,
            MmapError::AccessDenied => 13,
            MmapError::NotPermitted => 1,
        }
    }
}

impl fmt::Display for MmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MmapError::OutOfMemory => "ENOMEM",
            MmapError::InvalidArgument => "EINVAL",
            MmapError::AccessDenied => "EACCES",
            MmapError::NotPermitted => "EPERM",
        })
    }
}

/// Why a page fault could not be repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// The address is unmapped or the access exceeds the area's permissions.
    Segv,
    /// The access landed on a file mapping past the end of the file.
    Bus,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultError::Segv => "SIGSEGV",
            FaultError::Bus => "SIGBUS",
        })
    }
}

/// The access a leaf entry actually grants.
///
/// Copy-on-write entries report no write permission; the write fault breaks
/// the copy first. Entries with every permission revoked stay present but
/// grant nothing.
pub fn entry_perm(pte: PageEntry) -> Perm {
    if pte.is_empty() || !pte.valid() || pte.rsvd() {
        return Perm::empty();
    }
    let mut perm = Perm::READ;
    if pte.writable() {
        perm |= Perm::WRITE;
    }
    if pte.executable() {
        perm |= Perm::EXEC;
    }
    perm
}

/// What backs an area's pages.
enum VmaKind {
    Anon,
    File {
        file: Arc<dyn MappedFile>,
        offset: usize,
    },
    Shm {
        segments: Arc<ShmSegments>,
        offset: usize,
    },
}

/// One contiguous area of the managed address space.
struct Vma {
    start: usize,
    end: usize,
    perm: Perm,
    flags: MmapFlags,
    kind: VmaKind,
}

impl Vma {
    fn new(start: usize, end: usize, perm: Perm, flags: MmapFlags, kind: VmaKind) -> Self {
        Self {
            start,
            end,
            perm,
            flags,
            kind,
        }
    }

    fn sentinel(at: usize) -> Self {
        Self::new(at, at, Perm::empty(), MmapFlags::empty(), VmaKind::Anon)
    }

    fn is_sentinel(&self) -> bool {
        self.start == self.end
    }

    fn size(&self) -> usize {
        self.end - self.start
    }

    fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Backing offset of `addr` within this area.
    fn offset_of(&self, addr: usize) -> usize {
        let base = match &self.kind {
            VmaKind::Anon => 0,
            VmaKind::File { offset, .. } | VmaKind::Shm { offset, .. } => *offset,
        };
        base + (addr - self.start)
    }

    /// Moves the area to `start` without touching its backing offset.
    fn relocate(&mut self, start: usize) {
        let size = self.size();
        self.start = start;
        self.end = start + size;
    }

    /// Cuts the area at `at`, keeping the head and returning the tail.
    fn split(&mut self, at: usize) -> Vma {
        debug_assert!(self.start < at && at < self.end);
        let delta = at - self.start;
        let kind = match &self.kind {
            VmaKind::Anon => VmaKind::Anon,
            VmaKind::File { file, offset } => VmaKind::File {
                file: file.clone(),
                offset: offset + delta,
            },
            VmaKind::Shm { segments, offset } => VmaKind::Shm {
                segments: segments.clone(),
                offset: offset + delta,
            },
        };
        let tail = Vma::new(at, self.end, self.perm, self.flags, kind);
        self.end = at;
        tail
    }

    /// True when level-1 mappings line up with the backing, so faults in
    /// this area may install huge entries.
    fn huge_capable(&self) -> bool {
        if self.flags.contains(MmapFlags::SMALL) {
            return false;
        }
        match &self.kind {
            VmaKind::Anon | VmaKind::File { .. } => true,
            VmaKind::Shm { offset, .. } => {
                offset % HUGE_PAGE_SIZE == self.start % HUGE_PAGE_SIZE
            }
        }
    }

    /// Checks a requested protection against what the backing allows.
    fn validate_perm(&self, perm: Perm) -> Result<(), MmapError> {
        let VmaKind::File { file, .. } = &self.kind else {
            return Ok(());
        };
        if !file.readable() {
            return Err(MmapError::AccessDenied);
        }
        if perm.contains(Perm::WRITE)
            && self.flags.contains(MmapFlags::SHARED)
            && !file.writable()
        {
            return Err(MmapError::AccessDenied);
        }
        if perm.contains(Perm::EXEC) && file.noexec() {
            return Err(MmapError::NotPermitted);
        }
        Ok(())
    }
}

/// The ordered area set.
struct VmaSet {
    vmas: BTreeMap<usize, Vma>,
}

impl VmaSet {
    fn new() -> Self {
        let mut vmas = BTreeMap::new();
        vmas.insert(0, Vma::sentinel(0));
        vmas.insert(UPPER_VMA_LIMIT, Vma::sentinel(UPPER_VMA_LIMIT));
        Self { vmas }
    }

    /// The area containing `addr`, if any.
    fn find(&self, addr: usize) -> Option<&Vma> {
        self.vmas
            .range(..=addr)
            .next_back()
            .map(|(_, vma)| vma)
            .filter(|vma| vma.contains(addr))
    }

    /// Start keys of every area intersecting `[start, end)`, ascending.
    fn overlapping(&self, start: usize, end: usize) -> Vec<usize> {
        let mut keys: Vec<usize> = self
            .vmas
            .range(..end)
            .rev()
            .take_while(|(_, vma)| vma.end > start)
            .filter(|(_, vma)| !vma.is_sentinel())
            .map(|(&key, _)| key)
            .collect();
        keys.reverse();
        keys
    }

    /// True when every byte of `[start, end)` lies inside some area.
    fn covered(&self, start: usize, end: usize) -> bool {
        let mut at = start;
        while at < end {
            match self.find(at) {
                Some(vma) => at = vma.end,
                None => return false,
            }
        }
        true
    }

    /// Like [`covered`](Self::covered), also requiring read permission.
    fn readable(&self, start: usize, end: usize) -> bool {
        let mut at = start;
        while at < end {
            match self.find(at) {
                Some(vma) if vma.perm.contains(Perm::READ) => at = vma.end,
                _ => return false,
            }
        }
        true
    }

    /// First-fit hole search.
    ///
    /// A non-zero `start` is honored when that exact range is free.
    /// Otherwise the lowest gap that fits wins; requests of huge size or
    /// more prefer a huge-aligned base inside a gap so later faults can use
    /// large mappings, falling back to the first gap when none lines up.
    fn find_hole(&self, start: usize, size: usize) -> Result<usize, MmapError> {
        if start >= LOWER_VMA_LIMIT
            && start + size <= UPPER_VMA_LIMIT
            && self.overlapping(start, start + size).is_empty()
        {
            return Ok(start);
        }
        let small = size < HUGE_PAGE_SIZE;
        let mut good_enough = 0;
        let mut prev: Option<&Vma> = None;
        for vma in self.vmas.values() {
            if let Some(p) = prev {
                let base = p.end.max(LOWER_VMA_LIMIT);
                if vma.start >= base && vma.start - base >= size {
                    if good_enough == 0 {
                        good_enough = base;
                    }
                    if small {
                        return Ok(good_enough);
                    }
                    let aligned = align_up(base, HUGE_PAGE_SIZE);
                    if vma.start.saturating_sub(aligned) >= size {
                        return Ok(aligned);
                    }
                }
            }
            prev = Some(vma);
        }
        if good_enough != 0 {
            Ok(good_enough)
        } else {
            Err(MmapError::OutOfMemory)
        }
    }

    fn insert(&mut self, vma: Vma) {
        debug_assert!(!self.vmas.contains_key(&vma.start));
        self.vmas.insert(vma.start, vma);
    }
}

/// An identity-offset mapping outside the area set, recorded for the
/// mappings dump.
#[derive(Clone, Copy)]
struct LinearVma {
    virt: usize,
    phys: PhysicalAddress,
    size: usize,
    name: &'static str,
}

/// Address-space state hanging off the memory manager.
///
/// `vmas` orders every mapped area; mapping calls write-lock it, faults
/// read-lock it. Translations that take neither lock instead hold a
/// [`DeferredFrees`] read stamp, which keeps unhooked table pages alive
/// until the walk is over.
pub(crate) struct VmState {
    vmas: RwLock<VmaSet>,
    linear: RwLock<Vec<LinearVma>>,
    deferred: DeferredFrees,
}

impl VmState {
    pub(crate) fn new(cpu_count: usize) -> Self {
        Self {
            vmas: RwLock::new(VmaSet::new()),
            linear: RwLock::new(Vec::new()),
            deferred: DeferredFrees::new(cpu_count),
        }
    }
}

const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

const fn align_up(value: usize, align: usize) -> usize {
    align_down(value + align - 1, align)
}

/// Validates addressing arguments shared by every map call and returns the
/// page-rounded `(start, size)`.
fn prepare(
    addr: Option<VirtualAddress>,
    size: usize,
    flags: MmapFlags,
) -> Result<(usize, usize), MmapError> {
    if size == 0 {
        return Err(MmapError::InvalidArgument);
    }
    if size > UPPER_VMA_LIMIT {
        return Err(MmapError::OutOfMemory);
    }
    let size = align_up(size, PAGE_SIZE);
    let fixed = flags.contains(MmapFlags::FIXED);
    let start = match addr {
        Some(addr) => {
            if fixed && !addr.is_aligned(PAGE_SIZE) {
                return Err(MmapError::InvalidArgument);
            }
            addr.align_down(PAGE_SIZE).as_usize()
        }
        None => {
            if fixed {
                return Err(MmapError::InvalidArgument);
            }
            0
        }
    };
    if fixed && (start < LOWER_VMA_LIMIT || start + size > UPPER_VMA_LIMIT) {
        return Err(MmapError::OutOfMemory);
    }
    Ok((start, size))
}

/// Carves out room for `vma` and inserts it. Fixed mappings evict whatever
/// they cover; the rest go to the hole search.
fn place(mm: &MemoryManager, set: &mut VmaSet, mut vma: Vma) -> Result<usize, MmapError> {
    if vma.flags.contains(MmapFlags::FIXED) {
        evacuate(mm, set, vma.start, vma.end);
    } else {
        let start = set.find_hole(vma.start, vma.size())?;
        vma.relocate(start);
    }
    let start = vma.start;
    set.insert(vma);
    Ok(start)
}

/// Splits the area straddling `at`, if one does.
fn split_at(set: &mut VmaSet, at: usize) {
    let straddler = set
        .vmas
        .range(..at)
        .next_back()
        .filter(|(_, vma)| at < vma.end)
        .map(|(&key, _)| key);
    if let Some(key) = straddler {
        if let Some(vma) = set.vmas.get_mut(&key) {
            let tail = vma.split(at);
            set.vmas.insert(tail.start, tail);
        }
    }
}

/// Removes every mapping inside `[start, end)`, splitting areas that
/// straddle the boundaries.
fn evacuate(mm: &MemoryManager, set: &mut VmaSet, start: usize, end: usize) {
    split_at(set, end);
    split_at(set, start);
    let doomed: Vec<usize> = set
        .vmas
        .range(start..end)
        .filter(|(_, vma)| !vma.is_sentinel())
        .map(|(&key, _)| key)
        .collect();
    for key in doomed {
        if let Some(vma) = set.vmas.remove(&key) {
            debug_assert!(vma.end <= end);
            unpopulate_vma(mm, &vma);
        }
    }
}

/// Returns every frame of `vma` to its backing and drops the mappings.
fn unpopulate_vma(mm: &MemoryManager, vma: &Vma) {
    let vm = mm.vm();
    let start = VirtualAddress::new(vma.start);
    match &vma.kind {
        VmaKind::Anon => {
            let mut source = AnonPages::new(false);
            let mut op = Unpopulate::new(&mut source, &vm.deferred);
            operate_range(mm, &mut op, start, start, vma.size());
        }
        VmaKind::File { file, offset } => {
            let mut source =
                FilePages::new(file.clone(), *offset, vma.flags.contains(MmapFlags::SHARED));
            let mut op = Unpopulate::new(&mut source, &vm.deferred);
            operate_range(mm, &mut op, start, start, vma.size());
        }
        VmaKind::Shm { segments, offset } => {
            {
                let mut source = ShmPages::new(segments.clone(), *offset);
                let mut op = Unpopulate::new(&mut source, &vm.deferred);
                operate_range(mm, &mut op, start, start, vma.size());
            }
            // The last mapping of the object takes its segments with it.
            if Arc::strong_count(segments) == 1 {
                segments.close(mm);
            }
        }
    }
}

/// Backs `[start, start + size)` of `vma` with pages from its source.
fn populate_vma(
    mm: &MemoryManager,
    vma: &Vma,
    start: VirtualAddress,
    size: usize,
    write: bool,
) -> usize {
    let anchor = VirtualAddress::new(vma.start);
    let small = !vma.huge_capable();
    match &vma.kind {
        VmaKind::Anon => {
            let mut source = AnonPages::new(vma.flags.contains(MmapFlags::UNINITIALIZED));
            let mut op = Populate::new(&mut source, vma.perm, write, true, small);
            operate_range(mm, &mut op, anchor, start, size);
            op.operated()
        }
        VmaKind::File { file, offset } => {
            let mut source =
                FilePages::new(file.clone(), *offset, vma.flags.contains(MmapFlags::SHARED));
            // File content arrives page by page; huge spans only batch the
            // small mappings.
            let mut op = Populate::new(&mut source, vma.perm, write, false, true);
            operate_range(mm, &mut op, anchor, start, size);
            op.operated()
        }
        VmaKind::Shm { segments, offset } => {
            let mut source = ShmPages::new(segments.clone(), *offset);
            let mut op = Populate::new(&mut source, vma.perm, write, true, small);
            operate_range(mm, &mut op, anchor, start, size);
            op.operated()
        }
    }
}

/// Write-back driver for one file area; clamps to the area and anchors file
/// offsets at the clamped start.
fn sync_vma(mm: &MemoryManager, vma: &Vma, start: usize, end: usize) -> Result<(), MmapError> {
    let VmaKind::File { file, offset } = &vma.kind else {
        return Ok(());
    };
    if !vma.flags.contains(MmapFlags::SHARED) {
        return Err(MmapError::OutOfMemory);
    }
    let from = start.max(vma.start);
    let to = end.min(vma.end);
    let mut handler = DirtySync::new(file.clone(), offset + (from - vma.start));
    {
        let mut op = DirtyClean::new(&mut handler);
        let from = VirtualAddress::new(from);
        operate_range(mm, &mut op, from, from, to - from.as_usize());
    }
    handler.result()?;
    if handler.synced() > 0 {
        file.sync()?;
    }
    Ok(())
}

/// Syncs every file area intersecting `[start, end)`, stopping at the first
/// failure. Areas without write-back sync trivially.
fn sync_span(mm: &MemoryManager, set: &VmaSet, start: usize, end: usize) -> Result<(), MmapError> {
    let mut result = Err(MmapError::OutOfMemory);
    for key in set.overlapping(start, end) {
        let Some(vma) = set.vmas.get(&key) else {
            continue;
        };
        result = sync_vma(mm, vma, start, end);
        if result.is_err() {
            break;
        }
    }
    result
}

/// Maps `size` bytes of zeroed anonymous memory.
///
/// Without [`MmapFlags::FIXED`], `addr` is a hint honored when that exact
/// range is free. Pages are backed on first touch unless
/// [`MmapFlags::POPULATE`] asks for them up front.
pub fn map_anon(
    mm: &MemoryManager,
    addr: Option<VirtualAddress>,
    size: usize,
    flags: MmapFlags,
    perm: Perm,
) -> Result<VirtualAddress, MmapError> {
    let (start, size) = prepare(addr, size, flags)?;
    let vm = mm.vm();
    let mut set = vm.vmas.write();
    let start = place(mm, &mut set, Vma::new(start, start + size, perm, flags, VmaKind::Anon))?;
    if flags.contains(MmapFlags::POPULATE) {
        if let Some(vma) = set.find(start) {
            populate_vma(mm, vma, VirtualAddress::new(start), size, false);
        }
    }
    Ok(VirtualAddress::new(start))
}

/// Maps `size` bytes of `file` starting at page-aligned `offset`.
///
/// The file's open mode bounds the permissions: an unreadable file maps
/// not at all, a read-only file refuses writable shared mappings, and a
/// no-exec file refuses executable ones. Private mappings copy on write;
/// shared mappings carry writes back to the file on [`msync`].
pub fn map_file(
    mm: &MemoryManager,
    addr: Option<VirtualAddress>,
    size: usize,
    flags: MmapFlags,
    perm: Perm,
    file: Arc<dyn MappedFile>,
    offset: usize,
) -> Result<VirtualAddress, MmapError> {
    if offset % PAGE_SIZE != 0 {
        return Err(MmapError::InvalidArgument);
    }
    let (start, size) = prepare(addr, size, flags)?;
    let file_len = file.len();
    let vma = Vma::new(
        start,
        start + size,
        perm,
        flags,
        VmaKind::File { file, offset },
    );
    vma.validate_perm(perm)?;
    let vm = mm.vm();
    let mut set = vm.vmas.write();
    let start = place(mm, &mut set, vma)?;
    if flags.contains(MmapFlags::POPULATE) {
        // Pages wholly past the end of the file have nothing to read.
        let limit = align_up(file_len.saturating_sub(offset), PAGE_SIZE).min(size);
        if limit > 0 {
            if let Some(vma) = set.find(start) {
                populate_vma(mm, vma, VirtualAddress::new(start), limit, false);
            }
        }
    }
    Ok(VirtualAddress::new(start))
}

/// Maps `size` bytes of a shared-memory object starting at page-aligned
/// `offset`. The mapping is always shared; every mapping of the same
/// `segments` sees the same frames.
pub fn map_shm(
    mm: &MemoryManager,
    addr: Option<VirtualAddress>,
    size: usize,
    flags: MmapFlags,
    perm: Perm,
    segments: Arc<ShmSegments>,
    offset: usize,
) -> Result<VirtualAddress, MmapError> {
    if offset % PAGE_SIZE != 0 {
        return Err(MmapError::InvalidArgument);
    }
    let flags = flags | MmapFlags::SHARED;
    let (start, size) = prepare(addr, size, flags)?;
    let vma = Vma::new(
        start,
        start + size,
        perm,
        flags,
        VmaKind::Shm { segments, offset },
    );
    let vm = mm.vm();
    let mut set = vm.vmas.write();
    let start = place(mm, &mut set, vma)?;
    if flags.contains(MmapFlags::POPULATE) {
        if let Some(vma) = set.find(start) {
            populate_vma(mm, vma, VirtualAddress::new(start), size, false);
        }
    }
    Ok(VirtualAddress::new(start))
}

/// Unmaps `[addr, addr + size)`.
///
/// The whole range must be mapped. Dirty shared file pages are written
/// back first on a best-effort basis; a write-back failure does not stop
/// the unmap.
pub fn munmap(mm: &MemoryManager, addr: VirtualAddress, size: usize) -> Result<(), MmapError> {
    if !addr.is_aligned(PAGE_SIZE) || size == 0 {
        return Err(MmapError::InvalidArgument);
    }
    let start = addr.as_usize();
    let end = start + align_up(size, PAGE_SIZE);
    let vm = mm.vm();
    let mut set = vm.vmas.write();
    if !set.covered(start, end) {
        return Err(MmapError::InvalidArgument);
    }
    let _ = sync_span(mm, &set, start, end);
    evacuate(mm, &mut set, start, end);
    Ok(())
}

/// Changes the permissions of `[addr, addr + size)`.
///
/// The whole range must be mapped, and every file area must allow the new
/// permissions; both are checked before any entry changes. Areas partially
/// covered are split at the range boundaries.
pub fn mprotect(
    mm: &MemoryManager,
    addr: VirtualAddress,
    size: usize,
    perm: Perm,
) -> Result<(), MmapError> {
    if !addr.is_aligned(PAGE_SIZE) {
        return Err(MmapError::InvalidArgument);
    }
    let start = addr.as_usize();
    let end = start + align_up(size, PAGE_SIZE);
    let vm = mm.vm();
    let mut set = vm.vmas.write();
    if !set.covered(start, end) {
        return Err(MmapError::OutOfMemory);
    }
    if start == end {
        return Ok(());
    }
    for key in set.overlapping(start, end) {
        if let Some(vma) = set.vmas.get(&key) {
            vma.validate_perm(perm)?;
        }
    }
    split_at(&mut set, end);
    split_at(&mut set, start);
    for key in set.overlapping(start, end) {
        if let Some(vma) = set.vmas.get_mut(&key) {
            vma.perm = perm;
        }
    }
    let mut op = Protect::new(perm);
    operate_range(mm, &mut op, addr, addr, end - start);
    Ok(())
}

/// Writes dirty shared file pages in `[addr, addr + size)` back to their
/// files, in ascending file order, and fsyncs each file that received any.
///
/// The whole range must be mapped; syncing a private file mapping fails
/// with [`MmapError::OutOfMemory`]. Anonymous and shared-memory areas sync
/// trivially.
pub fn msync(
    mm: &MemoryManager,
    addr: VirtualAddress,
    size: usize,
    flags: SyncFlags,
) -> Result<(), MmapError> {
    if flags.contains(SyncFlags::ASYNC) && flags.contains(SyncFlags::SYNC) {
        return Err(MmapError::InvalidArgument);
    }
    if !addr.is_aligned(PAGE_SIZE) {
        return Err(MmapError::InvalidArgument);
    }
    let start = addr.as_usize();
    let end = start + align_up(size, PAGE_SIZE);
    let vm = mm.vm();
    let set = vm.vmas.read();
    if !set.covered(start, end) {
        return Err(MmapError::OutOfMemory);
    }
    if start == end {
        return Ok(());
    }
    sync_span(mm, &set, start, end)
}

/// Reports which pages of `[addr, addr + size)` are resident, one byte per
/// page, `0x01` for resident. The range must be mapped or linear-mapped.
pub fn mincore(
    mm: &MemoryManager,
    addr: VirtualAddress,
    size: usize,
) -> Result<Vec<u8>, MmapError> {
    if !addr.is_aligned(PAGE_SIZE) {
        return Err(MmapError::InvalidArgument);
    }
    let start = addr.as_usize();
    let end = start + align_up(size, PAGE_SIZE);
    let vm = mm.vm();
    let set = vm.vmas.read();
    if !is_linear_mapped(mm, addr, size) && !set.covered(start, end) {
        return Err(MmapError::OutOfMemory);
    }
    let mut residency = Vec::with_capacity((end - start) / PAGE_SIZE);
    for page in (start..end).step_by(PAGE_SIZE) {
        let resident = match pte_of(mm, VirtualAddress::new(page)) {
            Some(pte) => pte.valid() && !pte.rsvd(),
            None => false,
        };
        residency.push(if resident { 0x01 } else { 0x00 });
    }
    Ok(residency)
}

/// Repairs the page fault at `addr`, backing the page (or, when alignment
/// and backing allow, the whole huge span around it) from the area's
/// source.
///
/// Runs under the area read lock, so faults only wait on mapping calls,
/// not on each other.
pub fn vm_fault(mm: &MemoryManager, addr: VirtualAddress, write: bool) -> Result<(), FaultError> {
    let page = addr.align_down(PAGE_SIZE).as_usize();
    let vm = mm.vm();
    let set = vm.vmas.read();
    let Some(vma) = set.find(page) else {
        return Err(FaultError::Segv);
    };
    if !vma.perm.contains(Perm::READ) || (write && !vma.perm.contains(Perm::WRITE)) {
        return Err(FaultError::Segv);
    }
    let (start, size) = fault_extent(vma, page)?;
    populate_vma(mm, vma, VirtualAddress::new(start), size, write);
    Ok(())
}

/// The range a fault at `page` should populate: the surrounding huge span
/// when the area can carry it (for files, only when the span lies entirely
/// within the file), otherwise the single page.
fn fault_extent(vma: &Vma, page: usize) -> Result<(usize, usize), FaultError> {
    let hp_start = align_up(vma.start, HUGE_PAGE_SIZE);
    let hp_end = align_down(vma.end, HUGE_PAGE_SIZE);
    let in_huge = vma.huge_capable() && hp_start <= page && page < hp_end;
    if let VmaKind::File { file, .. } = &vma.kind {
        if vma.offset_of(page) >= file.len() {
            return Err(FaultError::Bus);
        }
        // Huge spans only while the area's last huge boundary is still
        // inside the file; near the end the mapping tails off in small
        // pages.
        if in_huge && vma.offset_of(hp_end) < file.len() {
            return Ok((align_down(page, HUGE_PAGE_SIZE), HUGE_PAGE_SIZE));
        }
        return Ok((page, PAGE_SIZE));
    }
    if in_huge {
        Ok((align_down(page, HUGE_PAGE_SIZE), HUGE_PAGE_SIZE))
    } else {
        Ok((page, PAGE_SIZE))
    }
}

/// One-entry lookup without the area lock; the deferred-free stamp keeps
/// concurrently unhooked tables alive for the walk.
fn pte_of(mm: &MemoryManager, addr: VirtualAddress) -> Option<PageEntry> {
    let vm = mm.vm();
    let _tables = vm.deferred.read_lock();
    let mut op = ToPte::new();
    let base = addr.align_down(PAGE_SIZE);
    operate_range(mm, &mut op, base, base, PAGE_SIZE);
    op.result().map(|(pte, _)| pte)
}

/// The physical address behind `addr`, if it is currently mapped.
pub fn virt_to_phys(mm: &MemoryManager, addr: VirtualAddress) -> Option<PhysicalAddress> {
    let vm = mm.vm();
    let _tables = vm.deferred.read_lock();
    let mut op = ToPhys::new(addr);
    let base = addr.align_down(PAGE_SIZE);
    operate_range(mm, &mut op, base, base, PAGE_SIZE);
    op.result()
}

/// The leaf entry mapping `addr`, if any. Revoked entries are returned
/// too; [`entry_perm`] tells them apart.
pub fn virt_to_pte(mm: &MemoryManager, addr: VirtualAddress) -> Option<PageEntry> {
    pte_of(mm, addr)
}

/// Host-accessible pointer to the memory behind a mapped address.
///
/// Mapped virtual addresses are not themselves dereferenceable under
/// software emulation; going through the translation gives the same code a
/// single shape on hardware and in tests.
pub fn translate_mapped(mm: &MemoryManager, addr: VirtualAddress) -> Option<*mut u8> {
    virt_to_phys(mm, addr).map(|phys| mm.translator().translate(phys))
}

/// Maps `[virt, virt + size)` to `[phys, phys + size)` outside the area
/// set, using huge entries when everything lines up, and records the range
/// for [`sysfs_linear_maps`].
///
/// # Panics
///
/// Panics if `virt` and `phys` disagree on their offset within the chosen
/// mapping granularity.
pub fn linear_map(
    mm: &MemoryManager,
    virt: VirtualAddress,
    phys: PhysicalAddress,
    size: usize,
    name: &'static str,
) {
    let slop = if (virt.as_usize() | phys.as_usize() | size) & (HUGE_PAGE_SIZE - 1) == 0 {
        HUGE_PAGE_SIZE
    } else {
        PAGE_SIZE
    };
    assert_eq!(
        virt.as_usize() & (slop - 1),
        phys.as_usize() & (slop - 1),
        "linear mapping must keep virtual and physical congruent"
    );
    let mut op = LinearMapper::new(phys, size);
    map_range(mm, &mut op, virt, virt, size, slop);
    let vm = mm.vm();
    let mut linear = vm.linear.write();
    let at = linear.partition_point(|v| v.virt < virt.as_usize());
    linear.insert(
        at,
        LinearVma {
            virt: virt.as_usize(),
            phys,
            size,
            name,
        },
    );
}

/// True when `[addr, addr + size)` lies inside one linear mapping.
pub fn is_linear_mapped(mm: &MemoryManager, addr: VirtualAddress, size: usize) -> bool {
    let start = addr.as_usize();
    let end = start + size;
    mm.vm()
        .linear
        .read()
        .iter()
        .any(|v| v.virt <= start && end <= v.virt + v.size)
}

/// True when every byte of `[addr, addr + size)` lies inside mapped areas.
pub fn ismapped(mm: &MemoryManager, addr: VirtualAddress, size: usize) -> bool {
    let start = addr.as_usize();
    mm.vm().vmas.read().covered(start, start + size)
}

/// Like [`ismapped`], also requiring read permission throughout.
pub fn isreadable(mm: &MemoryManager, addr: VirtualAddress, size: usize) -> bool {
    let start = addr.as_usize();
    mm.vm().vmas.read().readable(start, start + size)
}

/// Total bytes covered by mapped areas.
pub fn all_vmas_size(mm: &MemoryManager) -> usize {
    mm.vm().vmas.read().vmas.values().map(Vma::size).sum()
}

/// The `/proc`-style mappings listing, one area per line.
pub fn procfs_maps(mm: &MemoryManager) -> String {
    use core::fmt::Write;

    let mut out = String::new();
    let set = mm.vm().vmas.read();
    for vma in set.vmas.values() {
        if vma.is_sentinel() {
            continue;
        }
        let r = if vma.perm.contains(Perm::READ) { 'r' } else { '-' };
        let w = if vma.perm.contains(Perm::WRITE) { 'w' } else { '-' };
        let x = if vma.perm.contains(Perm::EXEC) { 'x' } else { '-' };
        let _ = write!(out, "{:x}-{:x} {}{}{}p ", vma.start, vma.end, r, w, x);
        match &vma.kind {
            VmaKind::File { file, offset } => {
                let dev = file.dev_id();
                let _ = writeln!(
                    out,
                    "{:08x} {:02x}:{:02x} {} {}",
                    offset,
                    (dev >> 8) & 0xff,
                    dev & 0xff,
                    file.inode(),
                    file.path()
                );
            }
            _ => {
                let _ = writeln!(out, "00000000 00:00 0");
            }
        }
    }
    out
}

/// The linear-mapping dump, one range per line, ascending by address.
pub fn sysfs_linear_maps(mm: &MemoryManager) -> String {
    use core::fmt::Write;

    let mut out = String::new();
    for v in mm.vm().linear.read().iter() {
        let _ = writeln!(
            out,
            "{:#18x} {:#18x} {:12x} rwxp {}",
            v.virt,
            v.phys.as_usize(),
            v.size,
            v.name
        );
    }
    out
}

/// Backs `[addr, addr + size)` with zeroed kernel working pages, outside
/// any area. The caller owns the range; calls for disjoint ranges may run
/// concurrently with faults but not with each other.
pub fn vpopulate(mm: &MemoryManager, addr: VirtualAddress, size: usize) {
    let mut source = AnonPages::new(false);
    let mut op = Populate::new(&mut source, Perm::RWX, false, true, true);
    operate_range(mm, &mut op, addr, addr, size);
}

/// Returns the frames behind a [`vpopulate`]d range.
pub fn vdepopulate(mm: &MemoryManager, addr: VirtualAddress, size: usize) {
    let vm = mm.vm();
    let mut source = AnonPages::new(false);
    let mut op = Unpopulate::new(&mut source, &vm.deferred);
    operate_range(mm, &mut op, addr, addr, size);
}

/// Frees page tables left empty inside `[addr, addr + size)`. Only tables
/// whose whole span lies inside the range are considered.
pub fn vcleanup(mm: &MemoryManager, addr: VirtualAddress, size: usize) {
    let vm = mm.vm();
    let mut op = CleanupTables::new(&vm.deferred);
    operate_range(mm, &mut op, addr, addr, size);
}

/// Frees whatever deferred table pages no active reader can still see.
pub(crate) fn drain_deferred(mm: &MemoryManager) {
    mm.vm().deferred.drain(mm);
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use super::backing::TestFile;
    use super::*;
    use crate::arch;
    use crate::memory_manager::emulation;

    const MIB: usize = 1 << 20;

    fn rw() -> Perm {
        Perm::READ | Perm::WRITE
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    /// Fault the page in for writing and store one byte through the
    /// translation.
    fn poke(mm: &MemoryManager, addr: usize, byte: u8) {
        vm_fault(mm, va(addr), true).unwrap();
        let p = translate_mapped(mm, va(addr)).unwrap();
        unsafe { *p = byte };
    }

    /// Fault the page in for reading and load one byte.
    fn peek(mm: &MemoryManager, addr: usize) -> u8 {
        vm_fault(mm, va(addr), false).unwrap();
        unsafe { *translate_mapped(mm, va(addr)).unwrap() }
    }

    #[test]
    fn mappings_start_above_the_guard_page() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert!(a.as_usize() >= LOWER_VMA_LIMIT);
        // A hint below the floor falls back to the search.
        let b = map_anon(mm, Some(va(0)), PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert!(b.as_usize() >= LOWER_VMA_LIMIT);
        assert_ne!(a, b);
    }

    #[test]
    fn map_rejects_bad_arguments() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(
            map_anon(mm, None, 0, MmapFlags::empty(), rw()),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            map_anon(mm, None, PAGE_SIZE, MmapFlags::FIXED, rw()),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            map_anon(mm, Some(va(0x2000_0000_0001)), PAGE_SIZE, MmapFlags::FIXED, rw()),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            map_anon(mm, Some(va(0)), PAGE_SIZE, MmapFlags::FIXED, rw()),
            Err(MmapError::OutOfMemory)
        );
        assert_eq!(
            map_anon(
                mm,
                Some(va(UPPER_VMA_LIMIT - PAGE_SIZE)),
                2 * PAGE_SIZE,
                MmapFlags::FIXED,
                rw()
            ),
            Err(MmapError::OutOfMemory)
        );
    }

    #[test]
    fn map_hint_is_honored_when_free() {
        let mm = emulation::fresh(16 * MIB);
        let want = va(0x1000_0000_0000);
        let got = map_anon(mm, Some(want), 2 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(got, want);
        // Taken now; the same hint lands elsewhere without evicting.
        let other = map_anon(mm, Some(want), PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_ne!(other, want);
        assert!(ismapped(mm, want, 2 * PAGE_SIZE));
    }

    #[test]
    fn holes_are_reused_first_fit() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        let b = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(b.as_usize(), a.as_usize() + PAGE_SIZE);
        munmap(mm, a, PAGE_SIZE).unwrap();
        let c = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn huge_requests_get_aligned_addresses() {
        let mm = emulation::fresh(16 * MIB);
        map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        let a = map_anon(mm, None, HUGE_PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert!(a.is_aligned(HUGE_PAGE_SIZE));
    }

    #[test]
    fn fixed_mapping_replaces_what_it_covers() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::POPULATE, rw())
            .unwrap()
            .as_usize();
        poke(mm, a, 1);
        poke(mm, a + PAGE_SIZE, 2);
        poke(mm, a + 2 * PAGE_SIZE, 3);

        let mid = va(a + PAGE_SIZE);
        let again = map_anon(mm, Some(mid), PAGE_SIZE, MmapFlags::FIXED, rw()).unwrap();
        assert_eq!(again, mid);

        // The outer pages survive; the middle one is gone until refaulted.
        assert_eq!(mincore(mm, va(a), 3 * PAGE_SIZE).unwrap(), vec![1, 0, 1]);
        assert_eq!(peek(mm, a), 1);
        assert_eq!(peek(mm, a + 2 * PAGE_SIZE), 3);
        assert_eq!(peek(mm, a + PAGE_SIZE), 0);
    }

    #[test]
    fn munmap_rejects_bad_arguments() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(
            munmap(mm, va(0x2000_0000_0001), PAGE_SIZE),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            munmap(mm, va(0x2000_0000_0000), 0),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            munmap(mm, va(0x2000_0000_0000), PAGE_SIZE),
            Err(MmapError::InvalidArgument)
        );
        let a = map_anon(mm, None, 2 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        // Reaching past the mapping leaves the range only partly covered.
        assert_eq!(munmap(mm, a, 3 * PAGE_SIZE), Err(MmapError::InvalidArgument));
        assert!(ismapped(mm, a, 2 * PAGE_SIZE));
    }

    #[test]
    fn munmap_returns_the_frames() {
        let mm = emulation::fresh_central(64 * MIB);
        let a = map_anon(mm, None, 4 * MIB, MmapFlags::POPULATE, rw()).unwrap();
        let populated = mm.stats().free;
        munmap(mm, a, 4 * MIB).unwrap();
        // Every backing frame comes back; table pages stay for reuse.
        assert_eq!(mm.stats().free, populated + 4 * MIB);
        assert!(!ismapped(mm, a, PAGE_SIZE));
        assert_eq!(virt_to_phys(mm, a), None);
    }

    #[test]
    fn munmap_middle_splits_the_area() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::POPULATE, rw())
            .unwrap()
            .as_usize();
        poke(mm, a, 7);
        poke(mm, a + 2 * PAGE_SIZE, 9);
        munmap(mm, va(a + PAGE_SIZE), PAGE_SIZE).unwrap();
        assert!(ismapped(mm, va(a), PAGE_SIZE));
        assert!(!ismapped(mm, va(a + PAGE_SIZE), PAGE_SIZE));
        assert!(ismapped(mm, va(a + 2 * PAGE_SIZE), PAGE_SIZE));
        assert_eq!(peek(mm, a), 7);
        assert_eq!(peek(mm, a + 2 * PAGE_SIZE), 9);
        assert_eq!(all_vmas_size(mm), 2 * PAGE_SIZE);
    }

    #[test]
    fn mprotect_needs_a_mapped_range() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(
            mprotect(mm, va(0x2000_0000_0000), PAGE_SIZE, Perm::READ),
            Err(MmapError::OutOfMemory)
        );
        let a = map_anon(mm, None, 2 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(
            mprotect(mm, a, 4 * PAGE_SIZE, Perm::READ),
            Err(MmapError::OutOfMemory)
        );
    }

    #[test]
    fn mprotect_narrows_and_restores() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::POPULATE, rw()).unwrap();
        let base = a.as_usize();
        poke(mm, base + PAGE_SIZE, 0x42);
        let mid = va(base + PAGE_SIZE);

        // Taking write away must shoot stale entries down.
        let flushes = arch::tlb_flush_count();
        mprotect(mm, mid, PAGE_SIZE, Perm::READ).unwrap();
        assert!(arch::tlb_flush_count() > flushes);
        let pte = virt_to_pte(mm, mid).unwrap();
        assert!(pte.valid() && !pte.writable());
        assert_eq!(entry_perm(pte), Perm::READ);
        assert!(virt_to_pte(mm, va(base)).unwrap().writable());

        // Widening needs none.
        let flushes = arch::tlb_flush_count();
        mprotect(mm, mid, PAGE_SIZE, rw()).unwrap();
        assert_eq!(arch::tlb_flush_count(), flushes);
        assert!(virt_to_pte(mm, mid).unwrap().writable());
        assert_eq!(peek(mm, base + PAGE_SIZE), 0x42);
    }

    #[test]
    fn revoking_everything_keeps_the_page() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, PAGE_SIZE, MmapFlags::POPULATE, rw()).unwrap();
        poke(mm, a.as_usize(), 5);
        mprotect(mm, a, PAGE_SIZE, Perm::empty()).unwrap();
        let pte = virt_to_pte(mm, a).unwrap();
        assert!(pte.rsvd());
        assert_eq!(entry_perm(pte), Perm::empty());
        assert_eq!(vm_fault(mm, a, false), Err(FaultError::Segv));
        assert_eq!(mincore(mm, a, PAGE_SIZE).unwrap(), vec![0]);
        // The content comes back with the permission.
        mprotect(mm, a, PAGE_SIZE, rw()).unwrap();
        assert_eq!(peek(mm, a.as_usize()), 5);
    }

    #[test]
    fn mprotect_splits_only_what_it_changes() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        mprotect(mm, va(a.as_usize() + PAGE_SIZE), PAGE_SIZE, Perm::READ).unwrap();
        let maps = procfs_maps(mm);
        assert_eq!(maps.lines().count(), 3);
        assert!(maps.contains("rw-p"));
        assert!(maps.contains("r--p"));
        assert!(isreadable(mm, a, 3 * PAGE_SIZE));
    }

    #[test]
    fn faults_outside_the_permissions_are_segv() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(
            vm_fault(mm, va(0x3000_0000_0000), false),
            Err(FaultError::Segv)
        );
        let a = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), Perm::READ).unwrap();
        assert_eq!(vm_fault(mm, a, true), Err(FaultError::Segv));
        vm_fault(mm, a, false).unwrap();
    }

    #[test]
    fn fault_maps_a_huge_page_when_it_can() {
        let mm = emulation::fresh_central(64 * MIB);
        let a = map_anon(mm, None, 4 * MIB, MmapFlags::empty(), rw()).unwrap();
        let before = mm.stats().free;
        vm_fault(mm, va(a.as_usize() + 3 * PAGE_SIZE), false).unwrap();
        assert!(virt_to_pte(mm, a).unwrap().large());
        // One huge frame plus the root, level-3 and level-2 tables.
        assert_eq!(before - mm.stats().free, HUGE_PAGE_SIZE + 3 * PAGE_SIZE);
        assert_eq!(mincore(mm, a, 4 * PAGE_SIZE).unwrap(), vec![1; 4]);
        assert_eq!(
            mincore(mm, va(a.as_usize() + HUGE_PAGE_SIZE), PAGE_SIZE).unwrap(),
            vec![0]
        );
    }

    #[test]
    fn small_flag_keeps_faults_to_small_pages() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 4 * MIB, MmapFlags::SMALL, rw()).unwrap();
        vm_fault(mm, a, false).unwrap();
        assert!(!virt_to_pte(mm, a).unwrap().large());
        assert_eq!(mincore(mm, a, 2 * PAGE_SIZE).unwrap(), vec![1, 0]);
    }

    #[test]
    fn private_file_write_breaks_sharing() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![0x11u8; 2 * PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            2 * PAGE_SIZE,
            MmapFlags::empty(),
            rw(),
            file.clone(),
            0,
        )
        .unwrap();
        assert_eq!(peek(mm, a.as_usize()), 0x11);
        let before = virt_to_phys(mm, a).unwrap();
        let pte = virt_to_pte(mm, a).unwrap();
        assert!(pte.cow() && !pte.writable());

        poke(mm, a.as_usize(), 0x99);
        assert_ne!(virt_to_phys(mm, a).unwrap(), before);
        // The write never reaches the file, and private syncs are refused.
        assert!(file.contents().iter().all(|&b| b == 0x11));
        assert_eq!(
            msync(mm, a, 2 * PAGE_SIZE, SyncFlags::empty()),
            Err(MmapError::OutOfMemory)
        );
    }

    #[test]
    fn shared_file_writes_reach_the_file_in_order() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![0u8; 3 * PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            3 * PAGE_SIZE,
            MmapFlags::SHARED,
            rw(),
            file.clone(),
            0,
        )
        .unwrap();
        let base = a.as_usize();
        poke(mm, base + 2 * PAGE_SIZE, 0xcc);
        poke(mm, base, 0xaa);
        assert_eq!(file.sync_count(), 0);

        msync(mm, a, 3 * PAGE_SIZE, SyncFlags::empty()).unwrap();
        assert_eq!(file.sync_count(), 1);
        assert_eq!(file.contents()[0], 0xaa);
        assert_eq!(file.contents()[2 * PAGE_SIZE], 0xcc);
        assert_eq!(file.write_offsets(), vec![0, 2 * PAGE_SIZE]);

        // Nothing is dirty anymore; the next sync does no work.
        msync(mm, a, 3 * PAGE_SIZE, SyncFlags::empty()).unwrap();
        assert_eq!(file.sync_count(), 1);
        assert_eq!(file.write_offsets().len(), 2);
    }

    #[test]
    fn msync_rejects_bad_ranges_and_flags() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(
            msync(mm, a, PAGE_SIZE, SyncFlags::ASYNC | SyncFlags::SYNC),
            Err(MmapError::InvalidArgument)
        );
        assert_eq!(
            msync(mm, va(0x3000_0000_0000), PAGE_SIZE, SyncFlags::empty()),
            Err(MmapError::OutOfMemory)
        );
        msync(mm, a, PAGE_SIZE, SyncFlags::ASYNC).unwrap();
    }

    #[test]
    fn msync_partial_range_uses_the_right_offsets() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![0u8; 4 * PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            4 * PAGE_SIZE,
            MmapFlags::SHARED,
            rw(),
            file.clone(),
            0,
        )
        .unwrap();
        let base = a.as_usize();
        for i in 0..4 {
            poke(mm, base + i * PAGE_SIZE, i as u8 + 1);
        }
        msync(mm, va(base + 2 * PAGE_SIZE), PAGE_SIZE, SyncFlags::empty()).unwrap();
        assert_eq!(file.write_offsets(), vec![2 * PAGE_SIZE]);
        assert_eq!(file.contents()[2 * PAGE_SIZE], 3);
        assert_eq!(file.contents()[0], 0);
    }

    #[test]
    fn msync_applies_the_mapping_offset() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![0u8; 4 * PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            PAGE_SIZE,
            MmapFlags::SHARED,
            rw(),
            file.clone(),
            2 * PAGE_SIZE,
        )
        .unwrap();
        poke(mm, a.as_usize(), 9);
        msync(mm, a, PAGE_SIZE, SyncFlags::empty()).unwrap();
        assert_eq!(file.write_offsets(), vec![2 * PAGE_SIZE]);
        assert_eq!(file.contents()[2 * PAGE_SIZE], 9);
    }

    #[test]
    fn msync_clips_writeback_to_the_file_length() {
        let mm = emulation::fresh(16 * MIB);
        let len = PAGE_SIZE + 1500;
        let file = Arc::new(TestFile::new(vec![7u8; len]));
        let a = map_file(
            mm,
            None,
            2 * PAGE_SIZE,
            MmapFlags::SHARED,
            rw(),
            file.clone(),
            0,
        )
        .unwrap();
        poke(mm, a.as_usize() + PAGE_SIZE, 0xee);
        msync(mm, a, 2 * PAGE_SIZE, SyncFlags::empty()).unwrap();
        let contents = file.contents();
        assert_eq!(contents.len(), len);
        assert_eq!(contents[PAGE_SIZE], 0xee);
        assert_eq!(contents[len - 1], 7);
    }

    #[test]
    fn msync_writes_back_a_fully_dirtied_span_in_order() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![0u8; HUGE_PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            HUGE_PAGE_SIZE,
            MmapFlags::SHARED,
            rw(),
            file.clone(),
            0,
        )
        .unwrap();
        let base = a.as_usize();
        let pages = HUGE_PAGE_SIZE / PAGE_SIZE;
        for i in 0..pages {
            poke(mm, base + i * PAGE_SIZE, (i % 255) as u8 + 1);
        }

        // One pass writes every page back in ascending file offsets and
        // issues a single sync.
        msync(mm, a, HUGE_PAGE_SIZE, SyncFlags::empty()).unwrap();
        let expected: Vec<usize> = (0..pages).map(|i| i * PAGE_SIZE).collect();
        assert_eq!(file.write_offsets(), expected);
        assert_eq!(file.sync_count(), 1);
        assert_eq!(file.contents()[5 * PAGE_SIZE], 6);
    }

    #[test]
    fn msync_reports_write_failures() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::failing_writes(vec![0u8; PAGE_SIZE]));
        let a = map_file(mm, None, PAGE_SIZE, MmapFlags::SHARED, rw(), file.clone(), 0).unwrap();
        poke(mm, a.as_usize(), 1);
        assert_eq!(
            msync(mm, a, PAGE_SIZE, SyncFlags::empty()),
            Err(MmapError::AccessDenied)
        );
        assert_eq!(file.sync_count(), 0);
        // The failure does not stop an unmap.
        munmap(mm, a, PAGE_SIZE).unwrap();
    }

    #[test]
    fn file_faults_past_the_end_are_bus_errors() {
        let mm = emulation::fresh(16 * MIB);
        let file = Arc::new(TestFile::new(vec![1u8; PAGE_SIZE]));
        let a = map_file(
            mm,
            None,
            2 * PAGE_SIZE,
            MmapFlags::empty(),
            Perm::READ,
            file,
            0,
        )
        .unwrap();
        vm_fault(mm, a, false).unwrap();
        assert_eq!(
            vm_fault(mm, va(a.as_usize() + PAGE_SIZE), false),
            Err(FaultError::Bus)
        );
    }

    #[test]
    fn file_mappings_respect_open_modes() {
        let mm = emulation::fresh(16 * MIB);
        let ro: Arc<TestFile> = Arc::new(TestFile::with_perm(vec![0; PAGE_SIZE], true, false));
        assert_eq!(
            map_file(mm, None, PAGE_SIZE, MmapFlags::SHARED, rw(), ro.clone(), 0).err(),
            Some(MmapError::AccessDenied)
        );
        // A private writable mapping of a read-only file is fine.
        map_file(mm, None, PAGE_SIZE, MmapFlags::empty(), rw(), ro.clone(), 0).unwrap();

        let hidden = Arc::new(TestFile::with_perm(vec![0; PAGE_SIZE], false, false));
        assert_eq!(
            map_file(mm, None, PAGE_SIZE, MmapFlags::empty(), Perm::READ, hidden, 0).err(),
            Some(MmapError::AccessDenied)
        );

        let nx = Arc::new(TestFile::new(vec![0; PAGE_SIZE]).on_noexec_mount());
        assert_eq!(
            map_file(
                mm,
                None,
                PAGE_SIZE,
                MmapFlags::empty(),
                Perm::READ | Perm::EXEC,
                nx,
                0
            )
            .err(),
            Some(MmapError::NotPermitted)
        );

        assert_eq!(
            map_file(mm, None, PAGE_SIZE, MmapFlags::empty(), Perm::READ, ro.clone(), 123).err(),
            Some(MmapError::InvalidArgument)
        );

        // Upgrading a shared read-only mapping is caught at mprotect time.
        let a = map_file(mm, None, PAGE_SIZE, MmapFlags::SHARED, Perm::READ, ro, 0).unwrap();
        assert_eq!(mprotect(mm, a, PAGE_SIZE, rw()), Err(MmapError::AccessDenied));
    }

    #[test]
    fn shm_mappings_share_frames() {
        let mm = emulation::fresh_central(64 * MIB);
        let before = mm.stats().free;
        let segments = Arc::new(ShmSegments::new());
        let a = map_shm(mm, None, PAGE_SIZE, MmapFlags::empty(), rw(), segments.clone(), 0)
            .unwrap();
        let b = map_shm(mm, None, PAGE_SIZE, MmapFlags::empty(), rw(), segments.clone(), 0)
            .unwrap();
        assert_ne!(a, b);

        poke(mm, a.as_usize(), 0x5a);
        assert_eq!(peek(mm, b.as_usize()), 0x5a);
        assert_eq!(virt_to_phys(mm, a), virt_to_phys(mm, b));

        // The object outlives individual mappings.
        munmap(mm, a, PAGE_SIZE).unwrap();
        assert_eq!(peek(mm, b.as_usize()), 0x5a);

        // The last unmap closes it and returns the segment; only the four
        // table pages stay out.
        drop(segments);
        munmap(mm, b, PAGE_SIZE).unwrap();
        assert_eq!(mm.stats().free, before - 4 * PAGE_SIZE);
    }

    #[test]
    fn shm_maps_huge_when_aligned() {
        let mm = emulation::fresh(16 * MIB);
        let segments = Arc::new(ShmSegments::new());
        let a = map_shm(
            mm,
            None,
            4 * MIB,
            MmapFlags::empty(),
            rw(),
            segments.clone(),
            0,
        )
        .unwrap();
        assert!(a.is_aligned(HUGE_PAGE_SIZE));
        vm_fault(mm, a, false).unwrap();
        assert!(virt_to_pte(mm, a).unwrap().large());
    }

    #[test]
    fn shm_honors_the_mapping_offset() {
        let mm = emulation::fresh(16 * MIB);
        let segments = Arc::new(ShmSegments::new());
        let a = map_shm(
            mm,
            None,
            PAGE_SIZE,
            MmapFlags::empty(),
            rw(),
            segments.clone(),
            3 * PAGE_SIZE,
        )
        .unwrap();
        poke(mm, a.as_usize(), 0x77);
        let b = map_shm(
            mm,
            None,
            4 * PAGE_SIZE,
            MmapFlags::empty(),
            rw(),
            segments.clone(),
            0,
        )
        .unwrap();
        assert_eq!(peek(mm, b.as_usize() + 3 * PAGE_SIZE), 0x77);
    }

    #[test]
    fn mincore_reports_residency() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(mincore(mm, a, 3 * PAGE_SIZE).unwrap(), vec![0, 0, 0]);
        poke(mm, a.as_usize() + PAGE_SIZE, 1);
        assert_eq!(mincore(mm, a, 3 * PAGE_SIZE).unwrap(), vec![0, 1, 0]);
        assert_eq!(
            mincore(mm, va(0x3000_0000_0000), PAGE_SIZE).err(),
            Some(MmapError::OutOfMemory)
        );
        assert_eq!(
            mincore(mm, va(a.as_usize() + 1), PAGE_SIZE).err(),
            Some(MmapError::InvalidArgument)
        );
    }

    #[test]
    fn linear_mappings_translate_and_dump() {
        let mm = emulation::fresh(16 * MIB);
        let virt = va(0xffff_8000_0000_0000);
        linear_map(mm, virt, PhysicalAddress::new(0), 4 * MIB, "ram");
        assert!(is_linear_mapped(mm, virt, 4 * MIB));
        assert!(!is_linear_mapped(mm, va(virt.as_usize() - PAGE_SIZE), PAGE_SIZE));
        assert!(virt_to_pte(mm, virt).unwrap().large());
        assert_eq!(
            virt_to_phys(mm, va(virt.as_usize() + HUGE_PAGE_SIZE + 5)),
            Some(PhysicalAddress::new(HUGE_PAGE_SIZE + 5))
        );
        assert_eq!(mincore(mm, virt, 2 * PAGE_SIZE).unwrap(), vec![1, 1]);

        // A page-grained tail keeps small entries.
        let mmio = va(0xffff_9000_0000_0000);
        linear_map(mm, mmio, PhysicalAddress::new(HUGE_PAGE_SIZE), 3 * PAGE_SIZE, "mmio");
        assert!(!virt_to_pte(mm, mmio).unwrap().large());

        let dump = sysfs_linear_maps(mm);
        assert_eq!(dump.lines().count(), 2);
        let mut lines = dump.lines();
        assert!(lines.next().unwrap().ends_with("rwxp ram"));
        assert!(lines.next().unwrap().ends_with("rwxp mmio"));
    }

    #[test]
    fn procfs_maps_formats_lines() {
        let mm = emulation::fresh(16 * MIB);
        map_anon(
            mm,
            Some(va(0x2000_0000_0000)),
            2 * PAGE_SIZE,
            MmapFlags::FIXED,
            rw(),
        )
        .unwrap();
        let file = Arc::new(
            TestFile::new(vec![0u8; 2 * PAGE_SIZE]).with_identity(0x0802, 42, "/data/log.bin"),
        );
        map_file(
            mm,
            Some(va(0x2000_0010_0000)),
            PAGE_SIZE,
            MmapFlags::FIXED | MmapFlags::SHARED,
            Perm::READ,
            file,
            PAGE_SIZE,
        )
        .unwrap();
        assert_eq!(
            procfs_maps(mm),
            "200000000000-200000002000 rw-p 00000000 00:00 0\n\
             200000010000-200000011000 r--p 00001000 08:02 42 /data/log.bin\n"
        );
    }

    #[test]
    fn all_vmas_size_tracks_mappings() {
        let mm = emulation::fresh(16 * MIB);
        assert_eq!(all_vmas_size(mm), 0);
        let a = map_anon(mm, None, 3 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        map_anon(mm, None, HUGE_PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert_eq!(all_vmas_size(mm), 3 * PAGE_SIZE + HUGE_PAGE_SIZE);
        munmap(mm, a, PAGE_SIZE).unwrap();
        assert_eq!(all_vmas_size(mm), 2 * PAGE_SIZE + HUGE_PAGE_SIZE);
    }

    #[test]
    fn isreadable_checks_permissions() {
        let mm = emulation::fresh(16 * MIB);
        let a = map_anon(mm, None, 2 * PAGE_SIZE, MmapFlags::empty(), rw()).unwrap();
        assert!(isreadable(mm, a, 2 * PAGE_SIZE));
        assert!(!isreadable(mm, a, 3 * PAGE_SIZE));
        mprotect(mm, a, PAGE_SIZE, Perm::empty()).unwrap();
        assert!(!isreadable(mm, a, 2 * PAGE_SIZE));
        assert!(isreadable(mm, va(a.as_usize() + PAGE_SIZE), PAGE_SIZE));
    }

    #[test]
    fn kernel_ranges_populate_and_clean_up() {
        let mm = emulation::fresh_central(64 * MIB);
        let base = va(0x3000_0000_0000);
        let before = mm.stats().free;

        vpopulate(mm, base, 8 * PAGE_SIZE);
        let p = translate_mapped(mm, base).unwrap();
        unsafe {
            assert_eq!(*p, 0);
            *p = 3;
        }
        let after_pop = mm.stats().free;
        // Eight frames plus root, level-3, level-2 and level-1 tables.
        assert_eq!(before - after_pop, 12 * PAGE_SIZE);

        vdepopulate(mm, base, 8 * PAGE_SIZE);
        assert_eq!(mm.stats().free, after_pop + 8 * PAGE_SIZE);
        assert_eq!(virt_to_phys(mm, base), None);

        // Sweeping the whole table span frees the emptied level-1 table.
        vcleanup(mm, base, HUGE_PAGE_SIZE);
        assert_eq!(mm.stats().free, after_pop + 9 * PAGE_SIZE);
    }

    #[test]
    fn entry_perm_reflects_the_entry() {
        assert_eq!(entry_perm(PageEntry::empty()), Perm::empty());
        let mut pte = PageEntry::leaf(PhysicalAddress::new(0x1000), false);
        pte.set_writable(true);
        pte.set_executable(true);
        assert_eq!(entry_perm(pte), Perm::RWX);
        pte.mark_cow(true);
        assert_eq!(entry_perm(pte), Perm::READ | Perm::EXEC);
        let mut none = PageEntry::leaf(PhysicalAddress::new(0x1000), false);
        none.set_rsvd(true);
        assert_eq!(entry_perm(none), Perm::empty());
    }
}

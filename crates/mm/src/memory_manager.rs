//! The memory subsystem context.
//!
//! A [`MemoryManager`] owns the layers every allocation passes through: the
//! central page-range allocator, the per-CPU page caches in front of it, the
//! object pools for small allocations, the cross-CPU garbage relay and the
//! reclaimer. The embedding kernel creates exactly one at boot, donates the
//! memory ranges it discovered, and installs scheduler hooks; everything else
//! is driven by allocation and fault traffic.
//!
//! Free-memory accounting is tied to the central allocator: pages parked in
//! a per-CPU cache count as allocated. Refills and spills move whole batches
//! so the counters (and the range lock) are touched once per batch, not once
//! per page.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::address::{AddressTranslator, PhysicalAddress};
use crate::arch::{HUGE_PAGE_SIZE, PAGE_SIZE, PageEntry};
use crate::garbage::GarbageRelay;
use crate::page_ranges::{PageCache, PageKind, PageRangeAllocator};
use crate::pool::{Pool, MAX_OBJECT_SIZE, MIN_OBJECT_SIZE};
use crate::reclaimer::{self, ReclaimStats, Reclaimer};
use crate::sched;
use crate::vma::VmState;

/// Pools exist for every power-of-two size class up to a full page; classes
/// above [`MAX_OBJECT_SIZE`] are never routed to.
const POOL_COUNT: usize = 11;

/// Upper bound on a page-cache refill/spill batch.
const MAX_PAGE_BATCH: usize = 64;

fn pool_object_size(class: usize) -> usize {
    (1usize << class).clamp(MIN_OBJECT_SIZE, MAX_OBJECT_SIZE)
}

/// Tunables fixed at construction time. The defaults reproduce the stock
/// behavior; embedders override individual fields.
#[derive(Debug, Clone, Copy)]
pub struct MemoryParams {
    /// Number of CPUs the subsystem will serve.
    pub cpu_count: usize,
    /// Cross-CPU frees on one relay sink before the owning CPU's collector
    /// is nudged.
    pub garbage_signal_threshold: usize,
    /// Pages a per-CPU cache may hold; an eighth of this moves per batch.
    pub page_cache_capacity: usize,
    /// Percentage of total memory below which reclamation starts.
    pub pressure_watermark_percent: usize,
    /// Free bytes kept back for the reclaimer's own allocations.
    pub emergency_reserve: usize,
}

impl Default for MemoryParams {
    fn default() -> Self {
        Self {
            cpu_count: 4,
            garbage_signal_threshold: 256,
            page_cache_capacity: 512,
            pressure_watermark_percent: reclaimer::DEFAULT_WATERMARK_PERCENT,
            emergency_reserve: reclaimer::MIN_EMERGENCY_POOL_SIZE,
        }
    }
}

/// The memory subsystem context. See the module documentation.
pub struct MemoryManager {
    translator: &'static AddressTranslator,
    params: MemoryParams,
    ranges: Mutex<PageRangeAllocator>,
    page_caches: Box<[Mutex<PageCache>]>,
    pools: [Pool; POOL_COUNT],
    relay: GarbageRelay,
    reclaimer: Reclaimer,
    vm: VmState,
    /// Pseudo-entry above the top-level page table; the walker descends from
    /// here. Empty until a root table is allocated or adopted.
    root_pte: AtomicU64,
    smp_ready: AtomicBool,
}

impl MemoryManager {
    pub fn new(translator: &'static AddressTranslator, params: MemoryParams) -> Self {
        assert!(params.cpu_count > 0);
        assert!(params.page_cache_capacity >= 8);
        assert!(params.page_cache_capacity / 8 <= MAX_PAGE_BATCH);

        let mut caches = Vec::with_capacity(params.cpu_count);
        for _ in 0..params.cpu_count {
            caches.push(Mutex::new(PageCache::new(params.page_cache_capacity)));
        }

        Self {
            translator,
            params,
            ranges: Mutex::new(PageRangeAllocator::new(translator)),
            page_caches: caches.into_boxed_slice(),
            pools: core::array::from_fn(|class| {
                Pool::new(pool_object_size(class), params.cpu_count)
            }),
            relay: GarbageRelay::new(params.cpu_count, params.garbage_signal_threshold),
            reclaimer: Reclaimer::new(params.pressure_watermark_percent, params.emergency_reserve),
            vm: VmState::new(params.cpu_count),
            root_pte: AtomicU64::new(0),
            smp_ready: AtomicBool::new(false),
        }
    }

    pub fn translator(&self) -> &'static AddressTranslator {
        self.translator
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    pub(crate) fn garbage_relay(&self) -> &GarbageRelay {
        &self.relay
    }

    pub(crate) fn lock_ranges(&self) -> MutexGuard<'_, PageRangeAllocator> {
        self.ranges.lock()
    }

    pub(crate) fn root_slot(&self) -> &AtomicU64 {
        &self.root_pte
    }

    pub(crate) fn vm(&self) -> &VmState {
        &self.vm
    }

    /// Adopts an existing top-level page table, typically the one the boot
    /// code built, as the root of the managed address space.
    pub fn adopt_root_table(&self, root: PhysicalAddress) {
        self.root_pte
            .store(PageEntry::intermediate(root).raw(), Ordering::Release);
    }

    /// Physical address of the top-level page table, once one exists. This
    /// is the value the embedder loads into the hardware translation root.
    pub fn root_table(&self) -> Option<PhysicalAddress> {
        let entry = PageEntry::from_raw(self.root_pte.load(Ordering::Acquire));
        if entry.is_empty() {
            None
        } else {
            Some(entry.addr())
        }
    }

    pub fn stats(&self) -> ReclaimStats {
        self.reclaimer.stats()
    }

    /// Declares the per-CPU infrastructure live. Until then, allocations
    /// bypass the per-CPU caches and pools and go straight to the central
    /// allocator, which needs no scheduler support.
    pub fn set_smp_ready(&self) {
        self.smp_ready.store(true, Ordering::Release);
    }

    pub(crate) fn smp_ready(&self) -> bool {
        self.smp_ready.load(Ordering::Acquire)
    }

    /// Donates a physical memory range discovered at boot.
    ///
    /// Page zero is never donated, so a null pointer can never alias managed
    /// memory. Partial pages at either end are dropped.
    pub fn free_initial_memory_range(&self, addr: usize, size: usize) {
        if size == 0 {
            return;
        }
        let (mut addr, mut size) = (addr, size);
        if addr == 0 {
            addr += 1;
            size -= 1;
        }
        let start = PhysicalAddress::new(addr).align_up(PAGE_SIZE);
        let end = PhysicalAddress::new(addr + size).align_down(PAGE_SIZE);
        if start >= end {
            return;
        }
        let len = end.offset_from(start);

        let mut ranges = self.lock_ranges();
        self.reclaimer.on_new_memory(len);
        let tracking = ranges.initial_add(start, len);
        if tracking > 0 {
            self.reclaimer.on_alloc(tracking);
        }
        log::info!(
            "donated {} at {}, {} used for tracking",
            crate::human_size::HumanSize(len),
            start,
            crate::human_size::HumanSize(tracking)
        );
    }

    /// Allocates one page frame.
    ///
    /// Post-boot this pops from the current CPU's cache and only refills a
    /// batch from the central allocator when the cache runs dry. Blocks (or
    /// panics) under memory exhaustion rather than failing.
    pub fn alloc_page(&self) -> PhysicalAddress {
        if !self.smp_ready() {
            return self.alloc_page_central();
        }
        {
            let guard = sched::PreemptGuard::new();
            if let Some(page) = self.page_caches[guard.cpu()].lock().pop() {
                return page;
            }
        }
        self.alloc_page_slow()
    }

    fn alloc_page_slow(&self) -> PhysicalAddress {
        let batch = (self.params.page_cache_capacity / 8).max(1);
        let mut pages = [PhysicalAddress::ZERO; MAX_PAGE_BATCH];
        loop {
            let got = {
                let ranges = self.lock_ranges();
                let mut ranges = self.reclaimer.wait_for_minimum_memory(self, ranges);
                let mut got = 0;
                while got < batch {
                    match ranges.alloc(PAGE_SIZE, true) {
                        Some(pr) => {
                            pages[got] = ranges.range_phys(pr);
                            got += 1;
                        }
                        None => break,
                    }
                }
                if got == 0 {
                    self.reclaimer.wait_for_memory(self, ranges, PAGE_SIZE);
                    continue;
                }
                self.reclaimer.on_alloc(got * PAGE_SIZE);
                got
            };

            // Keep the first page, park the rest on the current CPU's cache.
            let guard = sched::PreemptGuard::new();
            let mut cache = self.page_caches[guard.cpu()].lock();
            for &page in &pages[1..got] {
                if !cache.push(page) {
                    // Another thread refilled this cache meanwhile.
                    drop(cache);
                    self.free_page_central(page);
                    cache = self.page_caches[guard.cpu()].lock();
                }
            }
            return pages[0];
        }
    }

    /// Returns one page frame.
    pub fn free_page(&self, page: PhysicalAddress) {
        debug_assert!(page.is_aligned(PAGE_SIZE));
        if !self.smp_ready() {
            return self.free_page_central(page);
        }
        let guard = sched::PreemptGuard::new();
        let mut cache = self.page_caches[guard.cpu()].lock();
        if cache.push(page) {
            return;
        }
        // Cache full: spill a batch back to the central allocator first.
        let batch = cache.batch();
        let mut spilled = 0;
        let mut ranges = self.lock_ranges();
        while spilled < batch {
            match cache.pop() {
                Some(victim) => {
                    ranges.free_phys(victim, PAGE_SIZE);
                    spilled += 1;
                }
                None => break,
            }
        }
        drop(ranges);
        self.reclaimer.on_free(spilled * PAGE_SIZE);
        let pushed = cache.push(page);
        debug_assert!(pushed);
    }

    fn alloc_page_central(&self) -> PhysicalAddress {
        loop {
            let ranges = self.lock_ranges();
            let mut ranges = self.reclaimer.wait_for_minimum_memory(self, ranges);
            if let Some(pr) = ranges.alloc(PAGE_SIZE, true) {
                let phys = ranges.range_phys(pr);
                self.reclaimer.on_alloc(PAGE_SIZE);
                return phys;
            }
            self.reclaimer.wait_for_memory(self, ranges, PAGE_SIZE);
        }
    }

    fn free_page_central(&self, page: PhysicalAddress) {
        self.lock_ranges().free_phys(page, PAGE_SIZE);
        self.reclaimer.on_free(PAGE_SIZE);
    }

    /// Allocates a naturally-aligned huge page, or `None` so the caller can
    /// fall back to small pages.
    pub fn alloc_huge_page(&self) -> Option<PhysicalAddress> {
        let mut ranges = self.lock_ranges();
        let pr = ranges.alloc_aligned(HUGE_PAGE_SIZE, 0, HUGE_PAGE_SIZE, true)?;
        let phys = ranges.range_phys(pr);
        self.reclaimer.on_alloc(HUGE_PAGE_SIZE);
        Some(phys)
    }

    /// Returns a huge page allocated with [`alloc_huge_page`](Self::alloc_huge_page).
    pub fn free_huge_page(&self, page: PhysicalAddress) {
        debug_assert!(page.is_aligned(HUGE_PAGE_SIZE));
        self.lock_ranges().free_phys(page, HUGE_PAGE_SIZE);
        self.reclaimer.on_free(HUGE_PAGE_SIZE);
    }

    /// Translated-pointer variant of [`alloc_page`](Self::alloc_page), for
    /// allocators that work on the direct map.
    pub(crate) fn alloc_page_ptr(&self) -> *mut u8 {
        self.translator.translate(self.alloc_page())
    }

    pub(crate) fn free_page_ptr(&self, ptr: *mut u8) {
        self.free_page(self.translator.ptr_to_phys(ptr));
    }

    /// The pool serving objects of at least `minimum` bytes.
    pub(crate) fn pool_for(&self, minimum: usize) -> &Pool {
        debug_assert!(minimum >= MIN_OBJECT_SIZE && minimum <= MAX_OBJECT_SIZE);
        let class = minimum.next_power_of_two().trailing_zeros() as usize;
        &self.pools[class]
    }

    /// Records what a managed page is used for, so `free()` can route a bare
    /// pointer. Kinds are written when a front-end claims the page and
    /// simply overwritten by the next claimant.
    pub(crate) fn note_page_kind(&self, phys: PhysicalAddress, kind: PageKind) {
        self.lock_ranges().set_page_kind(phys, kind);
    }

    pub(crate) fn page_kind_of(&self, phys: PhysicalAddress) -> PageKind {
        self.lock_ranges().page_kind(phys)
    }

    /// Frees every object other CPUs handed back to the current CPU through
    /// the relay. Called from the per-CPU collector when signalled.
    pub fn collect_garbage(&self) {
        let guard = sched::PreemptGuard::new();
        let cpu = guard.cpu();
        for freer in 0..self.relay.cpu_count() {
            for obj in self.relay.drain(cpu, freer) {
                unsafe { (*Pool::from_object(obj)).free_same_cpu(obj, cpu, self) };
            }
        }
    }

    /// Runs one reclamation pass on the caller's thread. A dedicated
    /// reclaimer thread calls this whenever the wake generation moves.
    pub fn reclaim_once(&self) {
        crate::vma::drain_deferred(self);
        self.reclaimer.run_once(self);
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static MANAGER: spin::Once<MemoryManager> = spin::Once::new();

#[cfg(not(any(test, feature = "software-emulation")))]
impl MemoryManager {
    /// Creates and installs the kernel-wide subsystem. Only the first call
    /// takes effect.
    pub fn install(translator: &'static AddressTranslator, params: MemoryParams) -> &'static Self {
        MANAGER.call_once(|| MemoryManager::new(translator, params))
    }

    /// Returns the installed subsystem.
    ///
    /// # Panics
    ///
    /// Panics if [`install`](Self::install) has not run.
    pub fn current() -> &'static Self {
        match MANAGER.get() {
            Some(mm) => mm,
            None => panic!("memory manager not installed"),
        }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static MANAGER: core::cell::Cell<Option<&'static MemoryManager>> =
        const { core::cell::Cell::new(None) };
}

#[cfg(any(test, feature = "software-emulation"))]
impl MemoryManager {
    /// Installs a subsystem for the calling thread; see [`emulation`].
    pub fn install_for_thread(mm: &'static MemoryManager) {
        MANAGER.with(|current| current.set(Some(mm)));
    }

    /// Returns this thread's subsystem.
    ///
    /// # Panics
    ///
    /// Panics if none has been installed on this thread.
    pub fn current() -> &'static Self {
        match MANAGER.with(|current| current.get()) {
            Some(mm) => mm,
            None => panic!("memory manager not installed"),
        }
    }
}

/// Helpers for standing up a subsystem over emulated physical memory.
#[cfg(any(test, feature = "software-emulation"))]
pub mod emulation {
    use super::*;

    /// Builds a subsystem over a fresh arena, donates everything past page
    /// zero, marks it SMP-ready and installs it for the calling thread.
    pub fn fresh(arena_bytes: usize) -> &'static MemoryManager {
        fresh_with(arena_bytes, MemoryParams::default())
    }

    pub fn fresh_with(arena_bytes: usize, params: MemoryParams) -> &'static MemoryManager {
        let translator = AddressTranslator::set_current(AddressTranslator::emulated(arena_bytes));
        let mm: &'static MemoryManager =
            Box::leak(Box::new(MemoryManager::new(translator, params)));
        mm.free_initial_memory_range(0, arena_bytes);
        mm.set_smp_ready();
        MemoryManager::install_for_thread(mm);
        mm
    }

    /// Like [`fresh`], but leaves the per-CPU layer off so every page moves
    /// through the central allocator and the free counter tracks each page
    /// exactly.
    pub fn fresh_central(arena_bytes: usize) -> &'static MemoryManager {
        let translator = AddressTranslator::set_current(AddressTranslator::emulated(arena_bytes));
        let mm: &'static MemoryManager =
            Box::leak(Box::new(MemoryManager::new(translator, MemoryParams::default())));
        mm.free_initial_memory_range(0, arena_bytes);
        MemoryManager::install_for_thread(mm);
        mm
    }

    /// Makes a thread standing in for another CPU use `mm`'s arena and
    /// subsystem.
    pub fn adopt(mm: &'static MemoryManager) {
        AddressTranslator::adopt(mm.translator());
        MemoryManager::install_for_thread(mm);
    }
}

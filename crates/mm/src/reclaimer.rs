//! Memory accounting, pressure detection and reclamation.
//!
//! Free memory is whatever sits in the page-range allocator; it starts at
//! zero and grows as boot memory is donated. Every allocation that crosses
//! the range-allocator boundary is counted here. When free memory falls under
//! the low watermark (a tenth of total), registered shrinkers are asked to
//! give memory back; allocations that cannot be satisfied at all enqueue
//! themselves and block until a reclaim pass frees enough, or panic when
//! nothing more can be reclaimed.
//!
//! The reclaimer can run on a dedicated thread the embedding kernel provides
//! (wake it via [`Reclaimer::wake`], have it call
//! [`MemoryManager::reclaim_once`](crate::memory_manager::MemoryManager::reclaim_once)),
//! or inline in the allocating thread when no thread has been attached.

use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::human_size::HumanSize;
use crate::memory_manager::MemoryManager;
use crate::page_ranges::PageRangeAllocator;
use crate::sched;

/// Default for the free memory kept aside for the reclaimer's own
/// allocations. Two huge pages worth.
pub const MIN_EMERGENCY_POOL_SIZE: usize = 4 << 20;

/// Default percentage of total memory below which reclamation starts.
pub const DEFAULT_WATERMARK_PERCENT: usize = 10;

/// Memory pressure as seen by the reclaimer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressureLevel {
    /// Free memory is above the low watermark.
    Normal,
    /// Free memory fell under the low watermark; shrinkers should run.
    Pressure,
}

/// Point-in-time snapshot of the reclaimer's counters.
#[derive(Debug, Clone, Copy)]
pub struct ReclaimStats {
    /// Bytes ever donated.
    pub total: usize,
    /// Bytes currently in the central allocator.
    pub free: usize,
    /// Free-byte level below which reclamation starts.
    pub watermark: usize,
    pub level: PressureLevel,
}

/// A subsystem that can give memory back under pressure.
///
/// Implementations must not register further shrinkers from inside
/// [`shrink`](Shrinker::shrink); the registry lock is held across the call.
pub trait Shrinker: Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &str;

    /// Tries to release at least `target` bytes, returning the number of
    /// bytes actually released. A `hard` request means waiters cannot make
    /// progress until memory shows up, so caches should be emptied rather
    /// than trimmed.
    fn shrink(&self, target: usize, hard: bool) -> usize;
}

/// Handle returned by [`Reclaimer::register_shrinker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkerId(usize);

/// A blocked allocation, linked on the waiting thread's own stack.
struct WaitNode {
    bytes: usize,
    satisfied: AtomicBool,
    next: *mut WaitNode,
}

struct WaitList {
    head: *mut WaitNode,
    tail: *mut WaitNode,
}

// Nodes live on the stacks of blocked threads and are only reached while
// the list mutex is held.
unsafe impl Send for WaitList {}

impl WaitList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    unsafe fn push_back(&mut self, node: *mut WaitNode) {
        unsafe {
            (*node).next = ptr::null_mut();
        }
        if self.tail.is_null() {
            self.head = node;
        } else {
            unsafe { (*self.tail).next = node };
        }
        self.tail = node;
    }
}

/// Counters, watermark, shrinker registry and the waiter queue.
pub struct Reclaimer {
    total: AtomicUsize,
    free: AtomicUsize,
    watermark_lo: AtomicUsize,
    watermark_percent: usize,
    emergency_reserve: usize,
    wake_generation: AtomicUsize,
    threaded: AtomicBool,
    waiters: Mutex<WaitList>,
    shrinkers: Mutex<Vec<Option<&'static dyn Shrinker>>>,
}

impl Reclaimer {
    pub(crate) const fn new(watermark_percent: usize, emergency_reserve: usize) -> Self {
        assert!(watermark_percent <= 100);
        Self {
            total: AtomicUsize::new(0),
            free: AtomicUsize::new(0),
            watermark_lo: AtomicUsize::new(0),
            watermark_percent,
            emergency_reserve,
            wake_generation: AtomicUsize::new(0),
            threaded: AtomicBool::new(false),
            waiters: Mutex::new(WaitList::new()),
            shrinkers: Mutex::new(Vec::new()),
        }
    }

    /// Bytes currently in the page-range allocator.
    pub fn free_bytes(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    /// Bytes ever donated to the subsystem.
    pub fn total_bytes(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Memory that can be allocated without triggering reclamation.
    pub fn max_no_reclaim(&self) -> usize {
        self.total_bytes() - self.watermark_lo.load(Ordering::Relaxed)
    }

    pub fn pressure_level(&self) -> PressureLevel {
        if self.free_bytes() < self.watermark_lo.load(Ordering::Relaxed) {
            PressureLevel::Pressure
        } else {
            PressureLevel::Normal
        }
    }

    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            total: self.total_bytes(),
            free: self.free_bytes(),
            watermark: self.watermark_lo.load(Ordering::Relaxed),
            level: self.pressure_level(),
        }
    }

    fn bytes_until_normal(&self) -> usize {
        let watermark = self.watermark_lo.load(Ordering::Relaxed);
        watermark.saturating_sub(self.free_bytes())
    }

    pub(crate) fn on_alloc(&self, bytes: usize) {
        let watermark = self.watermark_lo.load(Ordering::Relaxed);
        let now = self.free.fetch_sub(bytes, Ordering::Relaxed) - bytes;
        if now < watermark {
            if now + bytes >= watermark {
                log::warn!(
                    "memory pressure: {} free, watermark {}",
                    HumanSize(now),
                    HumanSize(watermark)
                );
            }
            self.wake();
        }
    }

    pub(crate) fn on_free(&self, bytes: usize) {
        let watermark = self.watermark_lo.load(Ordering::Relaxed);
        let was = self.free.fetch_add(bytes, Ordering::Relaxed);
        if was < watermark && was + bytes >= watermark {
            log::warn!("memory pressure relieved: {} free", HumanSize(was + bytes));
        }
    }

    pub(crate) fn on_new_memory(&self, bytes: usize) {
        let total = self.total.fetch_add(bytes, Ordering::Relaxed) + bytes;
        self.watermark_lo
            .store(total * self.watermark_percent / 100, Ordering::Relaxed);
        self.free.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Asks the reclaimer to run. With an attached thread this only bumps
    /// the wake generation; the thread notices and calls back in.
    pub fn wake(&self) {
        self.wake_generation.fetch_add(1, Ordering::Release);
    }

    /// Monotonic counter incremented by every [`wake`](Self::wake); a
    /// reclaimer thread compares it against the last value it handled.
    pub fn wake_generation(&self) -> usize {
        self.wake_generation.load(Ordering::Acquire)
    }

    /// Declares that a dedicated thread now services reclamation. Blocked
    /// allocations stop reclaiming inline and wait for that thread instead.
    pub fn attach_thread(&self) {
        self.threaded.store(true, Ordering::Release);
    }

    /// Adds a shrinker to the registry.
    pub fn register_shrinker(&self, shrinker: &'static dyn Shrinker) -> ShrinkerId {
        let mut shrinkers = self.shrinkers.lock();
        log::debug!("registered shrinker {:?}", shrinker.name());
        shrinkers.push(Some(shrinker));
        ShrinkerId(shrinkers.len() - 1)
    }

    /// Removes a shrinker; its slot is retired, not reused.
    pub fn unregister_shrinker(&self, id: ShrinkerId) {
        self.shrinkers.lock()[id.0] = None;
    }

    fn have_shrinkers(&self) -> bool {
        self.shrinkers.lock().iter().any(Option::is_some)
    }

    /// Keeps a minimum emergency pool free for the reclaimer's own use.
    ///
    /// Ordinary allocations entering the range allocator pass through here
    /// and block while free memory is below the emergency floor. Emergency
    /// allocations (made while reclaiming) are exempt, as is everything when
    /// no shrinker could produce memory anyway.
    pub(crate) fn wait_for_minimum_memory<'a>(
        &self,
        mm: &'a MemoryManager,
        guard: MutexGuard<'a, PageRangeAllocator>,
    ) -> MutexGuard<'a, PageRangeAllocator> {
        if sched::cpus().emergency_depth() > 0 {
            return guard;
        }
        let free = self.free_bytes();
        if free < self.emergency_reserve {
            if !self.have_shrinkers() {
                // Nothing could possibly give memory back; may as well use
                // up the last of it.
                return guard;
            }
            self.wait_for_memory(mm, guard, self.emergency_reserve - free);
            return mm.lock_ranges();
        }
        guard
    }

    /// Blocks the caller until `bytes` of memory may be available, releasing
    /// the range lock for the duration.
    ///
    /// # Panics
    ///
    /// Panics immediately when `bytes` exceeds all memory (the request can
    /// never succeed), or during reclaim when nothing can be freed for the
    /// waiters.
    pub(crate) fn wait_for_memory(
        &self,
        mm: &MemoryManager,
        guard: MutexGuard<'_, PageRangeAllocator>,
        bytes: usize,
    ) {
        if bytes > self.total_bytes() {
            panic!(
                "allocation of {} is larger than all of memory",
                HumanSize(bytes)
            );
        }

        let mut node = WaitNode {
            bytes,
            satisfied: AtomicBool::new(false),
            next: ptr::null_mut(),
        };
        unsafe { self.waiters.lock().push_back(&mut node) };
        drop(guard);

        if self.threaded.load(Ordering::Acquire) {
            self.wake();
        } else {
            self.run_once(mm);
        }
        while !node.satisfied.load(Ordering::Acquire) {
            sched::cpus().relax();
        }
    }

    /// One reclamation pass: run shrinkers toward the watermark, then wake
    /// every waiter whose request now fits in some free range.
    pub(crate) fn run_once(&self, mm: &MemoryManager) {
        let _emergency = sched::EmergencyGuard::new();

        let target = self.bytes_until_normal();
        if target > 0 {
            log::debug!("reclaiming, {} short of the watermark", HumanSize(target));
            let released = self.shrink_pass(target, false);
            if released < target {
                self.shrink_pass(target - released, true);
            }
        }

        let mut ranges = mm.lock_ranges();
        if !self.wake_waiters(&mut ranges) {
            self.oom();
        }
    }

    fn shrink_pass(&self, target: usize, hard: bool) -> usize {
        let mut released = 0;
        for shrinker in self.shrinkers.lock().iter().flatten() {
            if released >= target {
                break;
            }
            let got = shrinker.shrink(target - released, hard);
            log::debug!("shrinker {:?} released {}", shrinker.name(), HumanSize(got));
            released += got;
        }
        released
    }

    /// Wakes waiters that now have a chance to succeed.
    ///
    /// Allocations are simulated against each free range so that four
    /// waiters do not all wake up believing the same ten megabytes are
    /// theirs. Returns false if waiters remain and none could be woken.
    fn wake_waiters(&self, ranges: &mut PageRangeAllocator) -> bool {
        let mut list = self.waiters.lock();
        let mut woken = false;
        ranges.for_each_free(|pr_size| {
            if list.is_empty() {
                woken = true;
                return false;
            }
            let mut budget = pr_size;
            let mut prev: *mut WaitNode = ptr::null_mut();
            let mut cur = list.head;
            while !cur.is_null() {
                unsafe {
                    let next = (*cur).next;
                    if budget >= (*cur).bytes {
                        budget -= (*cur).bytes;
                        // Unlink and wake.
                        if prev.is_null() {
                            list.head = next;
                        } else {
                            (*prev).next = next;
                        }
                        if next.is_null() {
                            list.tail = prev;
                        }
                        (*cur).satisfied.store(true, Ordering::Release);
                        woken = true;
                    } else {
                        prev = cur;
                    }
                    cur = next;
                }
            }
            true
        });
        woken || list.is_empty()
    }

    fn oom(&self) -> ! {
        let free = self.free_bytes();
        log::error!(
            "out of memory: could not reclaim any further, {} still free",
            HumanSize(free)
        );
        panic!("out of memory");
    }
}

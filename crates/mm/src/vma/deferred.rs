//! Deferred reclamation of page-table pages.
//!
//! Table pages freed while lock-free lookups may still be walking them are
//! not returned to the page allocator immediately. Instead every lookup holds
//! a read guard stamped with the generation counter at entry, and a freed
//! table page is queued under the *next* generation. A queued page is released
//! only once no guard from an earlier generation remains, so an in-flight
//! walker can never be handed back a table it might still dereference.
//!
//! Callers must clear the table's slot *before* queueing the page: a walker
//! entering afterwards then cannot load the stale pointer, and one that
//! already did carries an older generation stamp and blocks the release.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::address::PhysicalAddress;
use crate::memory_manager::MemoryManager;
use crate::sched;

/// Reader-slot value meaning "no read guard held on this CPU".
const IDLE: usize = usize::MAX;

/// The deferred-free queue and its reader registry.
pub(crate) struct DeferredFrees {
    generation: AtomicUsize,
    /// Per-CPU generation stamp of the oldest guard held there, or [`IDLE`].
    readers: Box<[AtomicUsize]>,
    queue: Mutex<VecDeque<(usize, PhysicalAddress)>>,
}

impl DeferredFrees {
    pub(crate) fn new(cpu_count: usize) -> Self {
        let mut readers = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            readers.push(AtomicUsize::new(IDLE));
        }
        Self {
            generation: AtomicUsize::new(0),
            readers: readers.into_boxed_slice(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Enters a read-side critical section on the current CPU.
    ///
    /// Guards nest; only the outermost one publishes a generation stamp.
    /// Preemption stays disabled while the guard lives, pinning the caller to
    /// its reader slot.
    pub(crate) fn read_lock(&self) -> DeferredReadGuard<'_> {
        let preempt = sched::PreemptGuard::new();
        let cpu = preempt.cpu();
        let slot = &self.readers[cpu];
        let mut published = false;
        if slot.load(Ordering::Relaxed) == IDLE {
            // Publish the stamp, then confirm the generation did not move
            // past us while we were doing so.
            loop {
                let r#gen = self.generation.load(Ordering::SeqCst);
                slot.store(r#gen, Ordering::SeqCst);
                if self.generation.load(Ordering::SeqCst) == r#gen {
                    break;
                }
            }
            published = true;
        }
        DeferredReadGuard {
            owner: self,
            cpu,
            published,
            _preempt: preempt,
        }
    }

    /// Queues a table page for release once all current readers are done.
    ///
    /// The caller must already have cleared every slot pointing at the page.
    pub(crate) fn free(&self, page: PhysicalAddress) {
        let r#gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.queue.lock().push_back((r#gen, page));
    }

    /// Releases every queued page no reader can still observe.
    pub(crate) fn drain(&self, mm: &MemoryManager) {
        let safe = self
            .readers
            .iter()
            .map(|slot| slot.load(Ordering::SeqCst))
            .min()
            .unwrap_or(IDLE);
        loop {
            let page = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some(&(r#gen, page)) if r#gen <= safe => {
                        queue.pop_front();
                        page
                    }
                    _ => break,
                }
            };
            mm.free_page(page);
        }
    }

    /// Number of pages still queued, for diagnostics.
    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Read-side critical section; see [`DeferredFrees::read_lock`].
pub(crate) struct DeferredReadGuard<'a> {
    owner: &'a DeferredFrees,
    cpu: usize,
    published: bool,
    _preempt: sched::PreemptGuard,
}

impl Drop for DeferredReadGuard<'_> {
    fn drop(&mut self) {
        if self.published {
            self.owner.readers[self.cpu].store(IDLE, Ordering::Release);
        }
    }
}

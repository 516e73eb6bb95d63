//! Cross-CPU free relay.
//!
//! Objects freed on a CPU other than the one that allocated them are not
//! pushed onto the foreign pool directly. Instead each (owner, freer) CPU
//! pair has a dedicated lock-free sink: the freeing CPU pushes with a
//! compare-exchange, and the owning CPU's collector detaches the whole chain
//! with a single swap and hands every object back to its pool. One producer
//! and one consumer per sink keeps the contract simple; the stack order of
//! drained objects is irrelevant because they all return to a free list.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::pool::FreeObject;
use crate::sched;

/// One lock-free sink carrying frees from a single CPU to a single owner.
struct GarbageSink {
    head: AtomicPtr<FreeObject>,
    pushed_since_signal: AtomicUsize,
}

impl GarbageSink {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pushed_since_signal: AtomicUsize::new(0),
        }
    }

    fn push(&self, obj: *mut FreeObject) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*obj).next = head;
            }
            if self
                .head
                .compare_exchange(head, obj, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn drain(&self) -> Drain {
        Drain {
            next: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }
}

/// Iterator over a detached chain of freed objects.
pub(crate) struct Drain {
    next: *mut FreeObject,
}

impl Iterator for Drain {
    type Item = *mut FreeObject;

    fn next(&mut self) -> Option<*mut FreeObject> {
        if self.next.is_null() {
            return None;
        }
        let obj = self.next;
        self.next = unsafe { (*obj).next };
        Some(obj)
    }
}

/// All sinks for all CPU pairs.
pub(crate) struct GarbageRelay {
    sinks: Box<[GarbageSink]>,
    cpu_count: usize,
    signal_threshold: usize,
}

impl GarbageRelay {
    /// Creates sinks for `cpu_count` CPUs with the given collector signal
    /// threshold.
    pub(crate) fn new(cpu_count: usize, signal_threshold: usize) -> Self {
        let mut sinks = Vec::with_capacity(cpu_count * cpu_count);
        for _ in 0..cpu_count * cpu_count {
            sinks.push(GarbageSink::new());
        }
        Self {
            sinks: sinks.into_boxed_slice(),
            cpu_count,
            signal_threshold,
        }
    }

    /// Relays an object freed by `freer_cpu` back to its owner.
    ///
    /// Signals the owner's collector once more than the threshold of frees
    /// have accumulated since the last signal.
    pub(crate) fn free(&self, owner_cpu: usize, freer_cpu: usize, obj: *mut FreeObject) {
        let sink = self.sink(owner_cpu, freer_cpu);
        sink.push(obj);
        let pushed = sink.pushed_since_signal.fetch_add(1, Ordering::Relaxed) + 1;
        if pushed > self.signal_threshold {
            sched::cpus().wake_collector(owner_cpu);
            sink.pushed_since_signal.store(0, Ordering::Relaxed);
        }
    }

    /// Detaches everything queued for `owner_cpu` from `freer_cpu`.
    pub(crate) fn drain(&self, owner_cpu: usize, freer_cpu: usize) -> Drain {
        self.sink(owner_cpu, freer_cpu).drain()
    }

    /// Returns the number of CPUs the relay was sized for.
    pub(crate) fn cpu_count(&self) -> usize {
        self.cpu_count
    }

    fn sink(&self, owner_cpu: usize, freer_cpu: usize) -> &GarbageSink {
        &self.sinks[owner_cpu * self.cpu_count + freer_cpu]
    }
}

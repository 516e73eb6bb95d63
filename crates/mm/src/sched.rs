//! Scheduler services consumed by the allocator.
//!
//! The memory manager needs very little from the scheduler: the identity of
//! the executing CPU, preemption control around per-CPU critical sections, a
//! thread-local emergency-allocation depth, and a way to nudge the garbage
//! collector on another CPU. The embedding kernel implements [`CpuOps`] and
//! installs it once at boot; host tests get an implementation backed by
//! thread-local state so threads can stand in for CPUs.

use core::marker::PhantomData;

/// The scheduler contract.
pub trait CpuOps: Sync {
    /// Returns the index of the CPU the caller is running on.
    fn current_cpu(&self) -> usize;

    /// Disables preemption on the current CPU. Nests.
    fn preempt_disable(&self);

    /// Re-enables preemption on the current CPU.
    fn preempt_enable(&self);

    /// Returns the current thread's emergency-allocation depth.
    ///
    /// Allocations made at non-zero depth are on behalf of the reclaimer
    /// itself and must never block waiting for memory.
    fn emergency_depth(&self) -> usize;

    /// Enters an emergency-allocation section on the current thread.
    fn emergency_enter(&self);

    /// Leaves an emergency-allocation section on the current thread.
    fn emergency_exit(&self);

    /// Hints that the caller is spinning.
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Requests that the garbage collector on `cpu` run soon.
    fn wake_collector(&self, _cpu: usize) {}
}

static CPUS: spin::Once<&'static dyn CpuOps> = spin::Once::new();

/// Installs the scheduler implementation. Only the first call takes effect.
pub fn install(ops: &'static dyn CpuOps) {
    CPUS.call_once(|| ops);
}

/// Returns the installed scheduler implementation.
///
/// # Panics
///
/// Panics if the embedding kernel has not installed one.
#[cfg(not(any(test, feature = "software-emulation")))]
pub fn cpus() -> &'static dyn CpuOps {
    match CPUS.get() {
        Some(ops) => *ops,
        None => panic!("no cpu operations installed"),
    }
}

/// Returns the installed scheduler implementation, defaulting to the
/// host-thread implementation.
#[cfg(any(test, feature = "software-emulation"))]
pub fn cpus() -> &'static dyn CpuOps {
    *CPUS.call_once(|| &HOST_CPUS)
}

/// Disables preemption for the lifetime of the guard.
pub struct PreemptGuard {
    _not_send: PhantomData<*const ()>,
}

impl PreemptGuard {
    /// Disables preemption on the current CPU.
    pub fn new() -> Self {
        cpus().preempt_disable();
        Self {
            _not_send: PhantomData,
        }
    }

    /// The CPU the caller is pinned to for the guard's lifetime.
    pub fn cpu(&self) -> usize {
        cpus().current_cpu()
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        cpus().preempt_enable();
    }
}

/// Marks the current thread as performing emergency allocations for the
/// lifetime of the guard.
pub struct EmergencyGuard {
    _not_send: PhantomData<*const ()>,
}

impl EmergencyGuard {
    /// Enters an emergency-allocation section.
    pub fn new() -> Self {
        cpus().emergency_enter();
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for EmergencyGuard {
    fn drop(&mut self) {
        cpus().emergency_exit();
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use host::HostCpus;

#[cfg(any(test, feature = "software-emulation"))]
static HOST_CPUS: HostCpus = HostCpus;

#[cfg(any(test, feature = "software-emulation"))]
mod host {
    use super::CpuOps;
    use core::cell::Cell;
    use core::sync::atomic::{AtomicBool, Ordering};

    /// Largest CPU index a test thread may assume.
    pub const MAX_CPUS: usize = 64;

    std::thread_local! {
        static CPU_ID: Cell<usize> = const { Cell::new(0) };
        static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
        static EMERGENCY_DEPTH: Cell<usize> = const { Cell::new(0) };
    }

    static COLLECTOR_WAKES: [AtomicBool; MAX_CPUS] =
        [const { AtomicBool::new(false) }; MAX_CPUS];

    /// Host implementation of [`CpuOps`] for tests and emulation.
    ///
    /// Each thread plays the role of one CPU; the CPU index defaults to 0 and
    /// can be assigned per thread. Preemption control only tracks nesting.
    pub struct HostCpus;

    impl HostCpus {
        /// Assigns the calling thread's CPU index.
        pub fn set_current_cpu(cpu: usize) {
            assert!(cpu < MAX_CPUS);
            CPU_ID.with(|id| id.set(cpu));
        }

        /// Consumes a pending collector wake for `cpu`, returning whether one
        /// was pending.
        pub fn take_collector_wake(cpu: usize) -> bool {
            COLLECTOR_WAKES[cpu].swap(false, Ordering::Relaxed)
        }
    }

    impl CpuOps for HostCpus {
        fn current_cpu(&self) -> usize {
            CPU_ID.with(|id| id.get())
        }

        fn preempt_disable(&self) {
            PREEMPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
        }

        fn preempt_enable(&self) {
            PREEMPT_DEPTH.with(|depth| {
                let current = depth.get();
                assert!(current > 0, "unbalanced preempt enable");
                depth.set(current - 1);
            });
        }

        fn emergency_depth(&self) -> usize {
            EMERGENCY_DEPTH.with(|depth| depth.get())
        }

        fn emergency_enter(&self) {
            EMERGENCY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        }

        fn emergency_exit(&self) {
            EMERGENCY_DEPTH.with(|depth| {
                let current = depth.get();
                assert!(current > 0, "unbalanced emergency exit");
                depth.set(current - 1);
            });
        }

        fn relax(&self) {
            std::thread::yield_now();
        }

        fn wake_collector(&self, cpu: usize) {
            COLLECTOR_WAKES[cpu].store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cpu_is_zero() {
        assert_eq!(cpus().current_cpu(), 0);
    }

    #[test]
    fn cpu_identity_is_per_thread() {
        HostCpus::set_current_cpu(0);
        let other = std::thread::spawn(|| {
            HostCpus::set_current_cpu(3);
            cpus().current_cpu()
        });
        assert_eq!(other.join().unwrap(), 3);
        assert_eq!(cpus().current_cpu(), 0);
    }

    #[test]
    fn preempt_guard_nests() {
        let outer = PreemptGuard::new();
        let inner = PreemptGuard::new();
        drop(inner);
        drop(outer);
    }

    #[test]
    fn emergency_guard_tracks_depth() {
        assert_eq!(cpus().emergency_depth(), 0);
        {
            let _guard = EmergencyGuard::new();
            assert_eq!(cpus().emergency_depth(), 1);
            {
                let _nested = EmergencyGuard::new();
                assert_eq!(cpus().emergency_depth(), 2);
            }
            assert_eq!(cpus().emergency_depth(), 1);
        }
        assert_eq!(cpus().emergency_depth(), 0);
    }

    #[test]
    fn collector_wakes_latch_per_cpu() {
        cpus().wake_collector(7);
        assert!(HostCpus::take_collector_wake(7));
        assert!(!HostCpus::take_collector_wake(7));
    }
}

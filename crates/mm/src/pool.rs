//! Per-CPU object pools for small allocations.
//!
//! Objects smaller than a quarter page are served from pools, one pool per
//! power-of-two size class. Each pool keeps a per-CPU list of pages; a page
//! starts with a [`PageHeader`] naming its owning pool and home CPU, followed
//! by the objects themselves, chained through a [`FreeObject`] link while
//! free. Allocation always happens on the current CPU's list with preemption
//! disabled, so the common path takes no shared lock. Freeing on the object's
//! home CPU is equally cheap; freeing from another CPU hands the object to
//! the garbage relay for the home CPU to collect.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem;
use core::ptr;

use spin::Mutex;

use crate::arch::PAGE_SIZE;
use crate::memory_manager::MemoryManager;
use crate::page_ranges::PageKind;
use crate::sched;

/// Largest object size served from pools.
pub(crate) const MAX_OBJECT_SIZE: usize = PAGE_SIZE / 4;

/// Smallest object size; anything below still occupies this much.
pub(crate) const MIN_OBJECT_SIZE: usize = mem::size_of::<FreeObject>();

/// Link written into an object while it sits on a free list.
#[repr(C)]
pub(crate) struct FreeObject {
    pub(crate) next: *mut FreeObject,
}

/// Header at the base of every pool page.
#[repr(C)]
pub(crate) struct PageHeader {
    owner: *const Pool,
    cpu_id: usize,
    nalloc: usize,
    local_free: *mut FreeObject,
    prev: *mut PageHeader,
    next: *mut PageHeader,
}

/// Intrusive list of pool pages. A page is linked here exactly while it has
/// at least one free object.
struct PageList {
    head: *mut PageHeader,
    tail: *mut PageHeader,
}

impl PageList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn front(&self) -> *mut PageHeader {
        self.head
    }

    fn back(&self) -> *mut PageHeader {
        self.tail
    }

    unsafe fn push_front(&mut self, header: *mut PageHeader) {
        unsafe {
            (*header).prev = ptr::null_mut();
            (*header).next = self.head;
            if self.head.is_null() {
                self.tail = header;
            } else {
                (*self.head).prev = header;
            }
        }
        self.head = header;
    }

    unsafe fn push_back(&mut self, header: *mut PageHeader) {
        unsafe {
            (*header).next = ptr::null_mut();
            (*header).prev = self.tail;
            if self.tail.is_null() {
                self.head = header;
            } else {
                (*self.tail).next = header;
            }
        }
        self.tail = header;
    }

    unsafe fn erase(&mut self, header: *mut PageHeader) {
        unsafe {
            if (*header).prev.is_null() {
                self.head = (*header).next;
            } else {
                (*(*header).prev).next = (*header).next;
            }
            if (*header).next.is_null() {
                self.tail = (*header).prev;
            } else {
                (*(*header).next).prev = (*header).prev;
            }
            (*header).prev = ptr::null_mut();
            (*header).next = ptr::null_mut();
        }
    }

    /// A full page (no object allocated) parks at the back of the list.
    fn has_full_back(&self) -> bool {
        !self.is_empty() && unsafe { (*self.tail).nalloc == 0 }
    }
}

/// A pool of equally-sized objects.
pub(crate) struct Pool {
    size: usize,
    free_lists: Box<[Mutex<PageList>]>,
}

// Page pointers are only reached through the per-CPU mutexes.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    pub(crate) fn new(size: usize, cpu_count: usize) -> Self {
        assert!(size + mem::size_of::<PageHeader>() <= PAGE_SIZE);
        assert!(size >= MIN_OBJECT_SIZE);
        let mut lists = Vec::with_capacity(cpu_count);
        for _ in 0..cpu_count {
            lists.push(Mutex::new(PageList::new()));
        }
        Self {
            size,
            free_lists: lists.into_boxed_slice(),
        }
    }

    pub(crate) fn object_size(&self) -> usize {
        self.size
    }

    fn to_header<T>(obj: *mut T) -> *mut PageHeader {
        (obj as usize & !(PAGE_SIZE - 1)) as *mut PageHeader
    }

    /// Recovers the owning pool from any object it handed out.
    pub(crate) fn from_object<T>(obj: *mut T) -> *const Pool {
        unsafe { (*Self::to_header(obj)).owner }
    }

    /// Allocates one object, adding a page to the current CPU's list if it
    /// ran dry. The new page is allocated with preemption enabled, so on
    /// rare occasions it lands on a different CPU's list and the loop just
    /// tries again.
    pub(crate) fn alloc(&self, mm: &MemoryManager) -> *mut u8 {
        loop {
            {
                let guard = sched::PreemptGuard::new();
                let mut list = self.free_lists[guard.cpu()].lock();
                if !list.is_empty() {
                    let header = list.front();
                    unsafe {
                        let obj = (*header).local_free;
                        (*header).nalloc += 1;
                        (*header).local_free = (*obj).next;
                        if (*header).local_free.is_null() {
                            list.erase(header);
                        }
                        return obj as *mut u8;
                    }
                }
            }
            self.add_page(mm);
        }
    }

    /// Allocates a fresh page and chains its objects onto the current CPU's
    /// list.
    fn add_page(&self, mm: &MemoryManager) {
        let page = mm.alloc_page_ptr();
        mm.note_page_kind(mm.translator().ptr_to_phys(page), PageKind::Pool);
        let guard = sched::PreemptGuard::new();
        let cpu = guard.cpu();
        unsafe {
            let header = page as *mut PageHeader;
            ptr::write(
                header,
                PageHeader {
                    owner: self as *const Pool,
                    cpu_id: cpu,
                    nalloc: 0,
                    local_free: ptr::null_mut(),
                    prev: ptr::null_mut(),
                    next: ptr::null_mut(),
                },
            );
            // Objects are anchored at the end of the page and chained from
            // the top down, so the lowest one ends up first on the list.
            let floor = header.add(1) as *mut u8;
            let mut at = page.add(PAGE_SIZE - self.size);
            while at >= floor {
                let obj = at as *mut FreeObject;
                (*obj).next = (*header).local_free;
                (*header).local_free = obj;
                at = at.sub(self.size);
            }
            self.free_lists[cpu].lock().push_back(header);
        }
    }

    /// Frees an object, routing it home if it was allocated on another CPU.
    pub(crate) fn free(obj: *mut u8, mm: &MemoryManager) {
        let guard = sched::PreemptGuard::new();
        let cur_cpu = guard.cpu();
        let obj = obj as *mut FreeObject;
        let header = Self::to_header(obj);
        let obj_cpu = unsafe { (*header).cpu_id };
        if obj_cpu == cur_cpu {
            unsafe { (*(*header).owner).free_same_cpu(obj, cur_cpu, mm) };
        } else {
            mm.garbage_relay().free(obj_cpu, cur_cpu, obj);
        }
    }

    /// Returns an object to its page on the page's home CPU.
    ///
    /// When this drops the page's allocation count to zero and a full page
    /// is already parked at the back of the list, the page itself goes back
    /// to the page allocator instead of keeping both around.
    pub(crate) fn free_same_cpu(&self, obj: *mut FreeObject, cpu: usize, mm: &MemoryManager) {
        let header = Self::to_header(obj);
        let mut list = self.free_lists[cpu].lock();
        unsafe {
            (*header).nalloc -= 1;
            if (*header).nalloc == 0 && list.has_full_back() {
                if !(*header).local_free.is_null() {
                    list.erase(header);
                }
                drop(list);
                mm.free_page_ptr(header as *mut u8);
            } else {
                if (*header).local_free.is_null() {
                    if (*header).nalloc > 0 {
                        list.push_front(header);
                    } else {
                        // Keep full pages at the back so they are refilled
                        // last and found quickly by has_full_back().
                        list.push_back(header);
                    }
                }
                (*obj).next = (*header).local_free;
                (*header).local_free = obj;
            }
        }
    }

    /// True if the current CPU's list for this pool is empty, meaning the
    /// pool holds no pages here.
    #[cfg(test)]
    fn is_empty_on(&self, cpu: usize) -> bool {
        self.free_lists[cpu].lock().is_empty()
    }
}

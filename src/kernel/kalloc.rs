// Physical memory allocator: 4096-byte pages kept on a free list
// threaded through the pages themselves. The early phase frees
// the memory between the end of the kernel and the boot mappings
// before locking works; the rest arrives once the full kernel
// page table is up.

use crate::memlayout::{phys_top, v2p};
use crate::spinlock::Mutex;
use crate::x86::{pg_round_up, PGSIZE};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

#[repr(C)]
struct Run {
    next: *mut Run,
}

struct Freelist {
    head: *mut Run,
    npages: usize,
}

unsafe impl Send for Freelist {}

pub struct Kmem {
    freelist: Mutex<Freelist>,
    use_lock: AtomicBool,
}

pub static KMEM: Kmem = Kmem {
    freelist: Mutex::new(
        Freelist {
            head: ptr::null_mut(),
            npages: 0,
        },
        "kmem",
    ),
    use_lock: AtomicBool::new(false),
};

impl Kmem {
    // Run f on the free list, honoring the two-phase bring-up:
    // before kinit2 the single boot cpu runs lockless.
    fn with_list<R>(&self, f: impl FnOnce(&mut Freelist) -> R) -> R {
        if self.use_lock.load(Ordering::Acquire) {
            f(&mut self.freelist.lock())
        } else {
            f(unsafe { self.freelist.get_mut() })
        }
    }
}

unsafe fn free_range(vstart: *mut u8, vend: *mut u8) {
    let mut p = pg_round_up(vstart as usize) as *mut u8;
    while p.add(PGSIZE) <= vend {
        kfree(p);
        p = p.add(PGSIZE);
    }
}

// Early bring-up, boot cpu only, locking not yet required.
//
// # Safety
// The range must be unused kernel virtual memory.
#[cfg(target_os = "none")]
pub unsafe fn kinit1(vstart: *mut u8, vend: *mut u8) {
    free_range(vstart, vend);
}

// The rest of physical memory; locking from here on.
//
// # Safety
// As kinit1.
#[cfg(target_os = "none")]
pub unsafe fn kinit2(vstart: *mut u8, vend: *mut u8) {
    free_range(vstart, vend);
    KMEM.use_lock.store(true, Ordering::Release);
}

// Free the page of physical memory at v. Fatal unless v was
// returned by kalloc (or carved out by the bring-up ranges).
pub fn kfree(v: *mut u8) {
    if (v as usize) % PGSIZE != 0 || v2p(v) >= phys_top() {
        panic!("kfree");
    }

    unsafe {
        // catch dangling references
        ptr::write_bytes(v, 1, PGSIZE);

        KMEM.with_list(|list| {
            let r = v as *mut Run;
            (*r).next = list.head;
            list.head = r;
            list.npages += 1;
        });
    }
}

// Allocate one page of physical memory; None when memory is
// exhausted. The page is not zeroed.
pub fn kalloc() -> Option<*mut u8> {
    KMEM.with_list(|list| {
        if list.head.is_null() {
            return None;
        }
        unsafe {
            let r = list.head;
            list.head = (*r).next;
            list.npages -= 1;
            Some(r as *mut u8)
        }
    })
}

// Pages currently on the free list.
pub fn free_pages() -> usize {
    KMEM.with_list(|list| list.npages)
}

// The kernel's own heap (Arc'd inodes, file-table entries,
// process names) rides on whole pages from the free list. Wasteful
// for small allocations, but this kernel makes few and keeps them.
#[cfg(target_os = "none")]
mod heap {
    use super::*;
    use core::alloc::{GlobalAlloc, Layout};

    struct KernelHeap;

    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            assert!(
                layout.size() <= PGSIZE && layout.align() <= PGSIZE,
                "kheap: oversized allocation"
            );
            kalloc().unwrap_or(core::ptr::null_mut())
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            kfree(ptr);
        }
    }

    #[global_allocator]
    static HEAP: KernelHeap = KernelHeap;
}

// Hosted bring-up: lease one page-aligned window from the host
// allocator and run the real free list inside it. Idempotent, so
// every test can call it first.
#[cfg(not(target_os = "none"))]
pub fn host_init() {
    use std::sync::Once;

    const HOST_PHYS_SIZE: usize = 32 << 20;

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let layout = std::alloc::Layout::from_size_align(HOST_PHYS_SIZE, PGSIZE).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        assert!(!base.is_null(), "host_init: out of memory");
        crate::memlayout::set_phys_window(base, HOST_PHYS_SIZE);
        unsafe { free_range(base, base.add(HOST_PHYS_SIZE)) };
        KMEM.use_lock.store(true, Ordering::Release);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_distinct_aligned_pages() {
        host_init();
        let a = kalloc().unwrap();
        let b = kalloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(a as usize % PGSIZE, 0);
        assert_eq!(b as usize % PGSIZE, 0);
        kfree(a);
        kfree(b);
    }

    #[test]
    fn freed_pages_are_poisoned() {
        host_init();
        let p = kalloc().unwrap();
        unsafe { ptr::write_bytes(p, 0xAB, PGSIZE) };
        kfree(p);
        // the free-list link occupies the first words; the rest
        // must carry the poison byte
        let q = kalloc().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q, PGSIZE) };
        assert!(bytes[core::mem::size_of::<Run>()..].iter().all(|&b| b == 1));
        kfree(q);
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn unaligned_free_is_fatal() {
        host_init();
        let p = kalloc().unwrap();
        // misaligned by one byte
        kfree(unsafe { p.add(1) });
    }
}

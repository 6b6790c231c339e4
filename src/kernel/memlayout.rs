// Memory layout.
//
// The kernel and every process share one address-space split: user
// memory in [0, KERNBASE), the kernel mapped identically above it.
// Physical addresses are 32 bits and travel through page-table
// entries; P2V/V2P translate between them and kernel pointers.
//
// Hosted builds have no fixed physical window, so the translation
// base is installed at test bring-up instead of being a constant.

pub const EXTMEM: usize = 0x10_0000; // start of extended memory
pub const PHYSTOP: u32 = 0xE00_0000; // top of physical memory
pub const DEVSPACE: usize = 0xFE00_0000; // other devices are at high addresses

pub const KERNBASE: usize = 0x8000_0000; // first kernel virtual address
pub const KERNLINK: usize = KERNBASE + EXTMEM; // address where kernel is linked

#[cfg(target_os = "none")]
mod xlate {
    use super::KERNBASE;

    #[inline]
    pub fn p2v(pa: u32) -> *mut u8 {
        (pa as usize + KERNBASE) as *mut u8
    }

    #[inline]
    pub fn v2p(va: *const u8) -> u32 {
        (va as usize - KERNBASE) as u32
    }

    // End of physical memory backing the page allocator.
    pub fn phys_top() -> u32 {
        super::PHYSTOP
    }
}

#[cfg(not(target_os = "none"))]
mod xlate {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static PHYS_BASE: AtomicUsize = AtomicUsize::new(0);
    static PHYS_SIZE: AtomicUsize = AtomicUsize::new(0);

    // Install the simulated physical window. Called once by the
    // hosted allocator bring-up before any translation.
    pub fn set_phys_window(base: *mut u8, size: usize) {
        PHYS_BASE.store(base as usize, Ordering::SeqCst);
        PHYS_SIZE.store(size, Ordering::SeqCst);
    }

    #[inline]
    pub fn p2v(pa: u32) -> *mut u8 {
        let base = PHYS_BASE.load(Ordering::Relaxed);
        assert!(base != 0, "p2v: no physical window");
        assert!((pa as usize) < PHYS_SIZE.load(Ordering::Relaxed), "p2v");
        (base + pa as usize) as *mut u8
    }

    #[inline]
    pub fn v2p(va: *const u8) -> u32 {
        let base = PHYS_BASE.load(Ordering::Relaxed);
        let off = (va as usize).wrapping_sub(base);
        assert!(off < PHYS_SIZE.load(Ordering::Relaxed), "v2p");
        off as u32
    }

    pub fn phys_top() -> u32 {
        PHYS_SIZE.load(Ordering::Relaxed) as u32
    }
}

pub use xlate::*;

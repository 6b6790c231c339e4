use crate::fs::IData;
use crate::kalloc::{kalloc, kfree};
use crate::memlayout::{p2v, v2p, KERNBASE};
#[cfg(target_os = "none")]
use crate::memlayout::{DEVSPACE, EXTMEM, KERNLINK, PHYSTOP};
use crate::proc::CPUS;
#[cfg(target_os = "none")]
use crate::proc::ProcData;
use crate::sleeplock::SleepLockGuard;
#[cfg(target_os = "none")]
use crate::sync::OnceLock;
use crate::x86::{pg_round_down, pg_round_up, PGSIZE};
use bitflags::bitflags;
use core::cmp::min;
use core::ptr;

// The x86 maps virtual to physical through a two-level tree: a
// page directory of 1024 entries, each naming a page table of
// 1024 entries, each naming a 4096-byte frame. One PageDir per
// process; the kernel half is identical in all of them.

pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

const PDXSHIFT: usize = 22;
const PTXSHIFT: usize = 12;

// page directory / page table index of a virtual address
#[inline]
fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & 0x3FF
}

#[inline]
fn ptx(va: usize) -> usize {
    (va >> PTXSHIFT) & 0x3FF
}

bitflags! {
    pub struct PteFlags: u32 {
        const P = 0x001; // present
        const W = 0x002; // writeable
        const U = 0x004; // user-accessible
    }
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(u32);

impl Pte {
    fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    fn is_user(&self) -> bool {
        self.0 & PteFlags::U.bits() != 0
    }

    fn addr(&self) -> u32 {
        self.0 & !0xFFF
    }

    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn set(&mut self, pa: u32, perm: PteFlags) {
        self.0 = pa | perm.bits() | PteFlags::P.bits();
    }

    fn clear(&mut self) {
        self.0 = 0;
    }

    fn clear_user(&mut self) {
        self.0 &= !PteFlags::U.bits();
    }
}

// A page directory: one physical page of Ptes, addressed through
// the kernel window. Plain-old-data on purpose; freevm is the
// explicit destructor, and a process owns its directory through
// ProcData.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageDir {
    pd: *mut Pte,
}

unsafe impl Send for PageDir {}
unsafe impl Sync for PageDir {}

impl PageDir {
    fn alloc() -> Option<PageDir> {
        let pd = kalloc()? as *mut Pte;
        unsafe { ptr::write_bytes(pd as *mut u8, 0, PGSIZE) };
        Some(PageDir { pd })
    }

    #[cfg(target_os = "none")]
    fn pa(&self) -> u32 {
        v2p(self.pd as *const u8)
    }
}

// Addresses handed to the byte-copy routines: either a user
// virtual address interpreted through the current process's page
// table, or a kernel pointer used directly.
#[derive(Debug, Clone, Copy)]
pub enum VirtAddr {
    User(usize),
    Kernel(usize),
}

impl core::ops::Add<usize> for VirtAddr {
    type Output = Self;
    fn add(self, rhs: usize) -> Self {
        match self {
            VirtAddr::User(a) => VirtAddr::User(a + rhs),
            VirtAddr::Kernel(a) => VirtAddr::Kernel(a + rhs),
        }
    }
}

// Return the PTE in pgdir that corresponds to virtual address va,
// allocating a page-table page if alloc is set and none exists.
fn walkpgdir(pgdir: PageDir, va: usize, alloc: bool) -> Option<*mut Pte> {
    unsafe {
        let pde = pgdir.pd.add(pdx(va));
        let pgtab: *mut Pte;
        if (*pde).is_present() {
            pgtab = p2v((*pde).addr()) as *mut Pte;
        } else {
            if !alloc {
                return None;
            }
            let mem = kalloc()? as *mut Pte;
            // make sure all those PTE_P bits are zero
            ptr::write_bytes(mem as *mut u8, 0, PGSIZE);
            // The permissions here are overly generous, but they
            // can be further restricted by the permissions in the
            // page-table entries, if necessary.
            (*pde).set(v2p(mem as *const u8), PteFlags::W | PteFlags::U);
            pgtab = mem;
        }
        Some(pgtab.add(ptx(va)))
    }
}

// Create PTEs for virtual addresses starting at va that refer to
// physical addresses starting at pa. Fatal if a target PTE is
// already present.
fn mappages(pgdir: PageDir, va: usize, size: usize, mut pa: u32, perm: PteFlags) -> Result<(), ()> {
    assert!(size > 0, "mappages: size");

    let mut a = pg_round_down(va);
    let last = pg_round_down(va + size - 1);
    loop {
        let pte = walkpgdir(pgdir, a, true).ok_or(())?;
        unsafe {
            if (*pte).is_present() {
                panic!("remap");
            }
            (*pte).set(pa, perm);
        }
        if a == last {
            break Ok(());
        }
        a += PGSIZE;
        pa += PGSIZE as u32;
    }
}

// There is one page table per process, plus one that is used when
// a cpu is not running any process (kpgdir). A process's page
// table holds mappings for both user memory and, above KERNBASE,
// the kernel ranges below, so that kernel code can run on it
// after a trap.
#[cfg(target_os = "none")]
static KPGDIR: OnceLock<PageDir> = OnceLock::new();

#[cfg(target_os = "none")]
struct Kmap {
    virt: usize,
    start: u32,
    end: u32,
    perm: PteFlags,
}

#[cfg(target_os = "none")]
fn kmap() -> [Kmap; 4] {
    extern "C" {
        // linker-provided: start of kernel rw data, end of text
        static data: u8;
    }
    let data_va = unsafe { &data as *const u8 as usize };
    [
        Kmap {
            // I/O space
            virt: KERNBASE,
            start: 0,
            end: EXTMEM as u32,
            perm: PteFlags::W,
        },
        Kmap {
            // kernel text + rodata
            virt: KERNLINK,
            start: (KERNLINK - KERNBASE) as u32,
            end: v2p(data_va as *const u8),
            perm: PteFlags::empty(),
        },
        Kmap {
            // kernel data + free memory
            virt: data_va,
            start: v2p(data_va as *const u8),
            end: PHYSTOP,
            perm: PteFlags::W,
        },
        Kmap {
            // memory-mapped devices up to the top of the space
            virt: DEVSPACE,
            start: DEVSPACE as u32,
            end: u32::MAX - (PGSIZE as u32) + 1,
            perm: PteFlags::W,
        },
    ]
}

// Set up the kernel part of a page table: an empty directory plus
// the fixed kernel ranges.
pub fn setupkvm() -> Option<PageDir> {
    let pgdir = PageDir::alloc()?;

    #[cfg(target_os = "none")]
    for k in kmap().iter() {
        if mappages(
            pgdir,
            k.virt,
            (k.end - k.start) as usize,
            k.start,
            k.perm,
        )
        .is_err()
        {
            freevm(pgdir);
            return None;
        }
    }

    Some(pgdir)
}

// Allocate one page table for the machine for the scheduler
// context, which runs kernel code only.
#[cfg(target_os = "none")]
pub fn kvmalloc() {
    KPGDIR
        .set(setupkvm().expect("kvmalloc"))
        .ok()
        .expect("kvmalloc: twice");
    switchkvm();
}

// Switch the hardware page table register to the kernel-only page
// table, for when no process is running.
#[cfg(target_os = "none")]
pub fn switchkvm() {
    unsafe { crate::x86::lcr3(KPGDIR.get().expect("switchkvm").pa()) };
}

// Switch the MMU and the task-state segment to process p, so the
// next trap from user mode lands on p's kernel stack.
#[cfg(target_os = "none")]
pub fn switchuvm(d: &ProcData) {
    use crate::param::KSTACKSIZE;
    use crate::x86::{ltr, lcr3, TaskState, SEG_KDATA, SEG_TSS, STS_T32A};

    assert!(!d.trapframe.is_null(), "switchuvm: no trapframe");
    let pgdir = d.pgdir.expect("switchuvm: no pgdir");

    let _intr = CPUS.intr_lock();
    unsafe {
        let c = CPUS.my_cpu();
        c.ts = TaskState::new(
            (SEG_KDATA << 3) as u16,
            (d.kstack + KSTACKSIZE) as u32,
        );
        c.gdt[SEG_TSS] = TaskState::descriptor(&c.ts, STS_T32A);
        ltr((SEG_TSS << 3) as u16);
        lcr3(pgdir.pa());
    }
}

// Load the initcode binary into address 0 of pgdir, for the very
// first process. The image must be smaller than a page.
pub fn inituvm(pgdir: PageDir, src: &[u8]) {
    assert!(src.len() < PGSIZE, "inituvm: more than a page");
    let mem = kalloc().expect("inituvm: out of memory");
    unsafe {
        ptr::write_bytes(mem, 0, PGSIZE);
        mappages(
            pgdir,
            0,
            PGSIZE,
            v2p(mem),
            PteFlags::W | PteFlags::U,
        )
        .expect("inituvm");
        ptr::copy_nonoverlapping(src.as_ptr(), mem, src.len());
    }
}

// Load a program segment into pgdir at virtual address va, which
// must be page-aligned; [va, va+sz) must already be mapped.
pub fn loaduvm(
    pgdir: PageDir,
    va: usize,
    ip: &mut SleepLockGuard<'_, IData>,
    off: u32,
    sz: usize,
) -> Result<(), ()> {
    assert!(va % PGSIZE == 0, "loaduvm: addr must be page aligned");

    let mut i = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, va + i, false).expect("loaduvm: address should exist");
        let pa = unsafe { (*pte).addr() };
        let n = min(sz - i, PGSIZE);
        let dst = VirtAddr::Kernel(p2v(pa) as usize);
        if ip.read(dst, off + i as u32, n) != Ok(n) {
            return Err(());
        }
        i += PGSIZE;
    }
    Ok(())
}

// Allocate page tables and physical memory to grow the process
// from oldsz to newsz; neither needs to be page-aligned. Returns
// None on failure with any partial allocation undone.
pub fn allocuvm(pgdir: PageDir, oldsz: usize, newsz: usize) -> Option<usize> {
    if newsz >= KERNBASE {
        return None;
    }
    if newsz < oldsz {
        return Some(oldsz);
    }

    let mut a = pg_round_up(oldsz);
    while a < newsz {
        let mem = match kalloc() {
            Some(mem) => mem,
            None => {
                crate::println!("allocuvm out of memory");
                deallocuvm(pgdir, newsz, oldsz);
                return None;
            }
        };
        unsafe { ptr::write_bytes(mem, 0, PGSIZE) };
        if mappages(pgdir, a, PGSIZE, v2p(mem), PteFlags::W | PteFlags::U).is_err() {
            crate::println!("allocuvm out of memory (2)");
            deallocuvm(pgdir, newsz, oldsz);
            kfree(mem);
            return None;
        }
        a += PGSIZE;
    }
    Some(newsz)
}

// Deallocate user pages to bring the process size from oldsz down
// to newsz, skipping regions whose page table was never created.
// Returns the new size.
pub fn deallocuvm(pgdir: PageDir, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }

    let mut a = pg_round_up(newsz);
    while a < oldsz {
        match walkpgdir(pgdir, a, false) {
            None => {
                // no page table here; skip to the next directory slot
                a = pg_round_up((pdx(a) + 1) << PDXSHIFT);
                continue;
            }
            Some(pte) => unsafe {
                if (*pte).is_present() {
                    let pa = (*pte).addr();
                    assert!(pa != 0, "deallocuvm");
                    kfree(p2v(pa));
                    (*pte).clear();
                }
            },
        }
        a += PGSIZE;
    }
    newsz
}

// Free all user pages, then the page-table pages, then the
// directory itself.
pub fn freevm(pgdir: PageDir) {
    assert!(!pgdir.pd.is_null(), "freevm: no pgdir");
    deallocuvm(pgdir, KERNBASE, 0);
    for i in 0..NPDENTRIES {
        unsafe {
            let pde = pgdir.pd.add(i);
            if (*pde).is_present() {
                kfree(p2v((*pde).addr()));
            }
        }
    }
    kfree(pgdir.pd as *mut u8);
}

// Clear the user bit on the page at va, making it inaccessible
// from user mode. Used for the stack guard page.
pub fn clearpteu(pgdir: PageDir, va: usize) {
    let pte = walkpgdir(pgdir, va, false).expect("clearpteu");
    unsafe { (*pte).clear_user() };
}

// Given a parent's page table, make a child's with a copy of the
// parent's memory in fresh physical pages.
pub fn copyuvm(pgdir: PageDir, sz: usize) -> Option<PageDir> {
    let new = setupkvm()?;

    let mut i = 0;
    while i < sz {
        let pte = walkpgdir(pgdir, i, false).expect("copyuvm: pte should exist");
        unsafe {
            assert!((*pte).is_present(), "copyuvm: page not present");
            let pa = (*pte).addr();
            let flags = (*pte).flags();
            let mem = match kalloc() {
                Some(mem) => mem,
                None => {
                    freevm(new);
                    return None;
                }
            };
            ptr::copy_nonoverlapping(p2v(pa) as *const u8, mem, PGSIZE);
            if mappages(new, i, PGSIZE, v2p(mem), flags - PteFlags::P).is_err() {
                kfree(mem);
                freevm(new);
                return None;
            }
        }
        i += PGSIZE;
    }
    Some(new)
}

// Map user virtual address to kernel address; None for addresses
// that are unmapped or not user-accessible.
pub fn uva2ka(pgdir: PageDir, uva: usize) -> Option<*mut u8> {
    let pte = walkpgdir(pgdir, uva, false)?;
    unsafe {
        if !(*pte).is_present() || !(*pte).is_user() {
            return None;
        }
        Some(p2v((*pte).addr()))
    }
}

// Copy bytes from the kernel into user virtual address va in
// pgdir, page by page. Fails on any unmapped or kernel-only page.
pub fn copyout(pgdir: PageDir, va: usize, src: &[u8]) -> Result<(), ()> {
    let mut len = src.len();
    let mut off = 0;
    let mut va = va;
    while len > 0 {
        let va0 = pg_round_down(va);
        let ka0 = uva2ka(pgdir, va0).ok_or(())?;
        let n = min(PGSIZE - (va - va0), len);
        unsafe { ptr::copy(src.as_ptr().add(off), ka0.add(va - va0), n) };
        len -= n;
        off += n;
        va = va0 + PGSIZE;
    }
    Ok(())
}

// Copy bytes from user virtual address va in pgdir into dst.
pub fn copyin(pgdir: PageDir, dst: &mut [u8], va: usize) -> Result<(), ()> {
    let mut len = dst.len();
    let mut off = 0;
    let mut va = va;
    while len > 0 {
        let va0 = pg_round_down(va);
        let ka0 = uva2ka(pgdir, va0).ok_or(())?;
        let n = min(PGSIZE - (va - va0), len);
        unsafe { ptr::copy(ka0.add(va - va0), dst.as_mut_ptr().add(off), n) };
        len -= n;
        off += n;
        va = va0 + PGSIZE;
    }
    Ok(())
}

// Copy a NUL-terminated string from user space, stopping at the
// terminator or the end of dst. Returns the string without the
// terminator.
pub fn copyinstr<'a>(pgdir: PageDir, dst: &'a mut [u8], va: usize) -> Result<&'a str, ()> {
    let mut max = dst.len();
    let mut off = 0;
    let mut va = va;
    while max > 0 {
        let va0 = pg_round_down(va);
        let ka0 = uva2ka(pgdir, va0).ok_or(())?;
        let n = min(PGSIZE - (va - va0), max);
        let src = unsafe { core::slice::from_raw_parts(ka0.add(va - va0), n) };
        match src.iter().position(|&c| c == 0) {
            Some(i) => {
                dst[off..off + i].copy_from_slice(&src[..i]);
                return core::str::from_utf8(&dst[..off + i]).or(Err(()));
            }
            None => {
                dst[off..off + n].copy_from_slice(src);
                max -= n;
                off += n;
                va = va0 + PGSIZE;
            }
        }
    }
    Err(())
}

// Copy to either a user address in the current process's page
// table, or a kernel address.
pub fn either_copyout(dst: VirtAddr, src: &[u8]) -> Result<(), ()> {
    match dst {
        VirtAddr::User(va) => {
            let p = CPUS.my_proc().ok_or(())?;
            let pgdir = unsafe { p.data() }.pgdir.ok_or(())?;
            copyout(pgdir, va, src)
        }
        VirtAddr::Kernel(va) => {
            unsafe { ptr::copy(src.as_ptr(), va as *mut u8, src.len()) };
            Ok(())
        }
    }
}

// Copy from either a user address or a kernel address.
pub fn either_copyin(dst: &mut [u8], src: VirtAddr) -> Result<(), ()> {
    match src {
        VirtAddr::User(va) => {
            let p = CPUS.my_proc().ok_or(())?;
            let pgdir = unsafe { p.data() }.pgdir.ok_or(())?;
            copyin(pgdir, dst, va)
        }
        VirtAddr::Kernel(va) => {
            unsafe { ptr::copy(va as *const u8, dst.as_mut_ptr(), dst.len()) };
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::host_init;

    #[test]
    fn grow_zeroes_and_shrink_unmaps() {
        host_init();
        let pgdir = setupkvm().unwrap();

        let sz = allocuvm(pgdir, 0, 3 * PGSIZE + 7).unwrap();
        assert_eq!(sz, 3 * PGSIZE + 7);

        // fresh pages read back zeroed
        let mut buf = [0xFFu8; 64];
        copyin(pgdir, &mut buf, 2 * PGSIZE + 100).unwrap();
        assert!(buf.iter().all(|&b| b == 0));

        let sz = deallocuvm(pgdir, sz, PGSIZE);
        assert_eq!(sz, PGSIZE);
        // the shrunk range is gone from the page table
        assert!(uva2ka(pgdir, 2 * PGSIZE).is_none());
        assert!(uva2ka(pgdir, 0).is_some());
        freevm(pgdir);
    }

    #[test]
    fn refuses_to_grow_into_kernel_half() {
        host_init();
        let pgdir = setupkvm().unwrap();
        assert!(allocuvm(pgdir, 0, KERNBASE).is_none());
        assert!(allocuvm(pgdir, 0, KERNBASE + PGSIZE).is_none());
        freevm(pgdir);
    }

    #[test]
    fn copyout_copyin_round_trip_across_pages() {
        host_init();
        let pgdir = setupkvm().unwrap();
        allocuvm(pgdir, 0, 2 * PGSIZE).unwrap();

        let msg: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let va = PGSIZE - 300; // straddles the page boundary
        copyout(pgdir, va, &msg).unwrap();

        let mut back = vec![0u8; msg.len()];
        copyin(pgdir, &mut back, va).unwrap();
        assert_eq!(back, msg);
        freevm(pgdir);
    }

    #[test]
    fn copyout_fails_on_unmapped_and_guard_pages() {
        host_init();
        let pgdir = setupkvm().unwrap();
        allocuvm(pgdir, 0, 2 * PGSIZE).unwrap();

        // beyond the mapped region
        assert!(copyout(pgdir, 3 * PGSIZE, b"x").is_err());

        // guard page: mapped but not user-accessible
        clearpteu(pgdir, 0);
        assert!(copyout(pgdir, 10, b"x").is_err());
        assert!(copyout(pgdir, PGSIZE + 10, b"x").is_ok());
        freevm(pgdir);
    }

    #[test]
    fn fork_copy_is_deep() {
        host_init();
        let parent = setupkvm().unwrap();
        allocuvm(parent, 0, 2 * PGSIZE).unwrap();
        copyout(parent, 100, b"parent bytes").unwrap();

        let child = copyuvm(parent, 2 * PGSIZE).unwrap();

        // identical contents right after the copy
        let mut a = [0u8; 12];
        let mut b = [0u8; 12];
        copyin(parent, &mut a, 100).unwrap();
        copyin(child, &mut b, 100).unwrap();
        assert_eq!(a, b);

        // a later write on one side is invisible on the other
        copyout(child, 100, b"child  bytes").unwrap();
        copyin(parent, &mut a, 100).unwrap();
        assert_eq!(&a, b"parent bytes");

        freevm(parent);
        freevm(child);
    }

    #[test]
    fn copyinstr_stops_at_nul() {
        host_init();
        let pgdir = setupkvm().unwrap();
        allocuvm(pgdir, 0, PGSIZE).unwrap();
        copyout(pgdir, 50, b"hello\0trailing").unwrap();

        let mut buf = [0u8; 32];
        let s = copyinstr(pgdir, &mut buf, 50).unwrap();
        assert_eq!(s, "hello");
        freevm(pgdir);
    }
}

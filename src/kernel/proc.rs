use crate::file::File;
use crate::fs::{Inode, Path};
use crate::kalloc;
use crate::log::LOG;
#[cfg(target_os = "none")]
use crate::param::NCPU;
use crate::param::{KSTACKSIZE, NOFILE, NPROC};
use crate::spinlock::{Mutex, MutexGuard};
#[cfg(target_os = "none")]
use crate::swtch::swtch;
use crate::sync::OnceLock;
use crate::trap::Trapframe;
use crate::vm::{self, PageDir};
use crate::x86::{self, PGSIZE};
use array_macro::array;
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub static CPUS: Cpus = Cpus::new();
pub static PTABLE: Ptable = Ptable::new();

// slot index of process 1, set once by user_init
static INITPROC: OnceLock<usize> = OnceLock::new();

static NEXT_PID: AtomicUsize = AtomicUsize::new(1);

const NO_PARENT: usize = NPROC;

// Saved registers for kernel context switches: the callee-saved
// set plus the return address. The stack pointer is implicit, a
// context always lives at the bottom of the owner's live stack.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

// Fields every cpu may inspect; the process-table lock guards
// every one of them, including each state transition.
#[derive(Clone, Copy)]
pub struct ProcShared {
    pub state: ProcState,
    pub pid: usize,
    pub parent: usize, // slot index, NO_PARENT for none
    pub chan: usize,   // if Sleeping, the channel slept on
    pub killed: bool,
}

impl ProcShared {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            parent: NO_PARENT,
            chan: 0,
            killed: false,
        }
    }
}

// Per-process state private to the process itself: no lock is
// needed once the slot has left Unused, except that wait() may
// tear a Zombie child's data down under the table lock.
pub struct ProcData {
    pub kstack: usize,                 // bottom of kernel stack
    pub sz: usize,                     // size of process memory (bytes)
    pub pgdir: Option<PageDir>,        // page table
    pub trapframe: *mut Trapframe,     // trap frame for current syscall, on kstack
    pub context: *mut Context,         // swtch() here to run process
    pub name: [u8; 16],                // process name (debugging)
    pub ofile: [Option<File>; NOFILE], // open files
    pub cwd: Option<Inode>,            // current directory
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            sz: 0,
            pgdir: None,
            trapframe: ptr::null_mut(),
            context: ptr::null_mut(),
            name: [0; 16],
            ofile: array![_ => None; NOFILE],
            cwd: None,
        }
    }

    pub fn set_name(&mut self, name: &str) {
        let n = core::cmp::min(name.len(), self.name.len() - 1);
        self.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        self.name[n..].iter_mut().for_each(|b| *b = 0);
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(0);
        core::str::from_utf8(&self.name[..end]).unwrap_or("?")
    }
}

type Pool = [ProcShared; NPROC];
type PoolGuard<'a> = MutexGuard<'a, Pool>;

pub struct Ptable {
    pub shared: Mutex<Pool>,
    data: [UnsafeCell<ProcData>; NPROC],
}

unsafe impl Sync for Ptable {}

// Handle to the process running on the calling cpu.
#[derive(Clone, Copy)]
pub struct CurProc {
    idx: usize,
}

// Per-cpu state. Only the owning cpu touches its entry, and only
// with interrupts disabled.
#[cfg(target_os = "none")]
pub struct Cpu {
    pub proc: Option<usize>,            // slot index of the running process
    pub scheduler: *mut Context,        // swtch() here to enter the dispatch loop
    pub gdt: [u64; x86::NSEGS],         // segment descriptors, TSS slot live
    pub ts: x86::TaskState,             // for finding the kernel stack on traps
    noff: isize,                        // depth of intr_lock nesting
    intena: bool,                       // were interrupts enabled before the first push?
}

#[cfg(target_os = "none")]
impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            scheduler: ptr::null_mut(),
            gdt: [0; x86::NSEGS],
            ts: x86::TaskState::zeroed(),
            noff: 0,
            intena: false,
        }
    }
}

#[cfg(target_os = "none")]
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

#[cfg(target_os = "none")]
unsafe impl Sync for Cpus {}

#[cfg(not(target_os = "none"))]
pub struct Cpus;

#[cfg(not(target_os = "none"))]
mod hosted {
    use core::cell::Cell;

    // Hosted stand-in for per-cpu state: each test thread is its
    // own cpu, bound to at most one process slot by the harness.
    std::thread_local! {
        pub static NOFF: Cell<isize> = Cell::new(0);
        pub static INTENA: Cell<bool> = Cell::new(false);
        pub static CURPROC: Cell<Option<usize>> = Cell::new(None);
    }
}

// Interrupt-disable nesting (pushcli/popcli). Constructing one
// disables interrupts; dropping the outermost restores whatever
// the first construction saw.
pub struct IntrLock {
    _not_send: PhantomData<*const ()>,
}

impl Cpus {
    #[cfg(target_os = "none")]
    const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    #[cfg(not(target_os = "none"))]
    const fn new() -> Self {
        Self
    }

    // Must be called with interrupts disabled on the metal, to
    // prevent a race with being moved to a different cpu.
    #[inline]
    pub fn cpu_id() -> usize {
        x86::cpu_id()
    }

    // Return this cpu's state. Interrupts must be disabled.
    #[cfg(target_os = "none")]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn my_cpu(&self) -> &mut Cpu {
        &mut *self.0[Self::cpu_id() % NCPU].get()
    }

    pub fn intr_lock(&self) -> IntrLock {
        let old = x86::intr_get();
        x86::intr_off();
        #[cfg(target_os = "none")]
        unsafe {
            let c = self.my_cpu();
            if c.noff == 0 {
                c.intena = old;
            }
            c.noff += 1;
        }
        #[cfg(not(target_os = "none"))]
        {
            hosted::NOFF.with(|n| {
                if n.get() == 0 {
                    hosted::INTENA.with(|i| i.set(old));
                }
                n.set(n.get() + 1);
            });
        }
        IntrLock { _not_send: PhantomData }
    }

    // The matching pop. Only IntrLock::drop and force_unlock may
    // call this.
    pub(crate) unsafe fn intr_unlock(&self) {
        assert!(!x86::intr_get(), "intr_unlock - interruptible");
        #[cfg(target_os = "none")]
        {
            let c = self.my_cpu();
            assert!(c.noff >= 1, "intr_unlock");
            c.noff -= 1;
            if c.noff == 0 && c.intena {
                x86::intr_on();
            }
        }
        #[cfg(not(target_os = "none"))]
        {
            let reenable = hosted::NOFF.with(|n| {
                assert!(n.get() >= 1, "intr_unlock");
                n.set(n.get() - 1);
                n.get() == 0 && hosted::INTENA.with(|i| i.get())
            });
            if reenable {
                x86::intr_on();
            }
        }
    }

    // The process running on this cpu, or None.
    pub fn my_proc(&self) -> Option<CurProc> {
        let _intr = self.intr_lock();
        self.current_slot().map(|idx| CurProc { idx })
    }

    // Interrupts must be disabled.
    #[cfg(target_os = "none")]
    fn current_slot(&self) -> Option<usize> {
        unsafe { self.my_cpu().proc }
    }

    #[cfg(not(target_os = "none"))]
    fn current_slot(&self) -> Option<usize> {
        hosted::CURPROC.with(|c| c.get())
    }

    // Bind a process slot to the calling thread. Hosted harness
    // only; the metal scheduler assigns processes to cpus itself.
    #[cfg(not(target_os = "none"))]
    pub fn adopt_proc(&self, idx: Option<usize>) {
        hosted::CURPROC.with(|c| c.set(idx));
    }
}

impl Drop for IntrLock {
    fn drop(&mut self) {
        unsafe { CPUS.intr_unlock() }
    }
}

impl Ptable {
    const fn new() -> Self {
        Self {
            shared: Mutex::new(array![_ => ProcShared::new(); NPROC], "ptable"),
            data: array![_ => UnsafeCell::new(ProcData::new()); NPROC],
        }
    }

    // Private per-process state. The caller must either be the
    // process itself, or hold the table lock with the slot in a
    // state that cannot run (Embryo, Zombie).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self, idx: usize) -> &mut ProcData {
        &mut *self.data[idx].get()
    }

    // The channel a parent sleeps on in wait(): the slot address
    // is stable for the life of the kernel.
    pub fn wait_chan(&self, idx: usize) -> usize {
        &self.data[idx] as *const _ as usize
    }

    // Wake up all processes sleeping on chan.
    pub fn wakeup(&self, chan: usize) {
        let mut table = self.shared.lock();
        Self::wakeup1(&mut table, chan);
    }

    // Wake up sleepers on chan with the table lock already held.
    fn wakeup1(table: &mut Pool, chan: usize) {
        for p in table.iter_mut() {
            if p.state == ProcState::Sleeping && p.chan == chan {
                p.state = ProcState::Runnable;
            }
        }
    }

    // Kill the process with the given pid. The victim won't exit
    // until it next crosses the user/kernel boundary.
    pub fn kill(&self, pid: usize) -> Result<(), ()> {
        let mut table = self.shared.lock();
        for p in table.iter_mut() {
            if p.pid == pid && p.state != ProcState::Unused {
                p.killed = true;
                if p.state == ProcState::Sleeping {
                    // wake it from sleep() so it can notice
                    p.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }
}

// Look in the process table for an Unused slot and prepare it to
// run in the kernel: kernel stack, trap-return frame, and a
// context that makes the first swtch land in fork_ret.
pub fn alloc_proc() -> Option<usize> {
    let idx = {
        let mut table = PTABLE.shared.lock();
        let idx = table.iter().position(|p| p.state == ProcState::Unused)?;
        table[idx].state = ProcState::Embryo;
        table[idx].pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
        idx
    };

    let d = unsafe { PTABLE.data(idx) };
    let kstack = match kalloc::kalloc() {
        Some(page) => page as usize,
        None => {
            let mut table = PTABLE.shared.lock();
            table[idx] = ProcShared::new();
            return None;
        }
    };
    d.kstack = kstack;
    let mut sp = kstack + KSTACKSIZE;

    // leave room for the trap frame
    sp -= size_of::<Trapframe>();
    d.trapframe = sp as *mut Trapframe;

    // the new process returns to user space through trapret
    sp -= size_of::<u32>();
    unsafe { *(sp as *mut u32) = trapret_addr() };

    sp -= size_of::<Context>();
    d.context = sp as *mut Context;
    unsafe {
        ptr::write_bytes(d.context as *mut u8, 0, size_of::<Context>());
        (*d.context).eip = fork_ret as usize as u32;
    }
    Some(idx)
}

#[cfg(target_os = "none")]
fn trapret_addr() -> u32 {
    extern "C" {
        // tail of the trap entry path; pops a Trapframe and irets
        fn trapret();
    }
    trapret as usize as u32
}

#[cfg(not(target_os = "none"))]
fn trapret_addr() -> u32 {
    0
}

// First program run by process 1: exec("/init"). Hand-assembled
// so the kernel does not depend on the user build.
//
//   start: push $argv; push $init; push $0
//          mov eax, SYS_exec; int 0x40
//   exit:  mov eax, SYS_exit; int 0x40; jmp exit
//   init:  "/init\0"
//   argv:  .long init, 0
static INITCODE: [u8; 44] = [
    0x68, 0x24, 0x00, 0x00, 0x00, 0x68, 0x1c, 0x00, 0x00, 0x00, 0x6a, 0x00, 0xb8, 0x07, 0x00,
    0x00, 0x00, 0xcd, 0x40, 0xb8, 0x02, 0x00, 0x00, 0x00, 0xcd, 0x40, 0xeb, 0xf7, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0x00, 0x00, 0x00, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

// Set up the first user process.
pub fn user_init() {
    let idx = alloc_proc().expect("user_init: no proc slot");
    INITPROC.set(idx).expect("user_init: called twice");

    let d = unsafe { PTABLE.data(idx) };
    let pgdir = vm::setupkvm().expect("user_init: out of memory");
    vm::inituvm(pgdir, &INITCODE);
    d.pgdir = Some(pgdir);
    d.sz = PGSIZE;
    unsafe {
        let tf = &mut *d.trapframe;
        *tf = Trapframe::zeroed();
        tf.cs = Trapframe::UCODE_SEL;
        tf.ds = Trapframe::UDATA_SEL;
        tf.es = tf.ds;
        tf.ss = tf.ds;
        tf.eflags = x86::FL_IF as u32;
        tf.esp = PGSIZE as u32;
        tf.eip = 0; // beginning of initcode
    }
    d.set_name("initcode");
    d.cwd = Path::new("/").namei().map(|(_, ip)| ip);

    PTABLE.shared.lock()[idx].state = ProcState::Runnable;
}

impl CurProc {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn pid(&self) -> usize {
        PTABLE.shared.lock()[self.idx].pid
    }

    pub fn killed(&self) -> bool {
        PTABLE.shared.lock()[self.idx].killed
    }

    // Private state of the running process.
    //
    // # Safety
    // Only one mutable view may be live at a time; callers must
    // not hold another across a call that takes one again.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        PTABLE.data(self.idx)
    }

    // Atomically release lk and sleep on chan; reacquire lk when
    // awakened. The table lock is held across the state change,
    // which is what closes the missed-wakeup window.
    pub fn sleep<'a, T>(&self, chan: usize, lk: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mut table = PTABLE.shared.lock();
        let mutex = Mutex::unlock(lk); // safe to release once ptable is held

        table[self.idx].chan = chan;
        table[self.idx].state = ProcState::Sleeping;

        let mut table = suspend(table, self.idx);

        table[self.idx].chan = 0;
        drop(table);
        mutex.lock()
    }

    // Grow or shrink user memory by n bytes.
    pub fn grow_proc(&self, n: isize) -> Result<(), ()> {
        let d = unsafe { self.data() };
        let pgdir = d.pgdir.expect("grow_proc: no pgdir");
        let mut sz = d.sz;
        if n > 0 {
            sz = vm::allocuvm(pgdir, sz, sz + n as usize).ok_or(())?;
        } else if n < 0 {
            sz = vm::deallocuvm(pgdir, sz, (sz as isize + n) as usize);
        }
        d.sz = sz;
        #[cfg(target_os = "none")]
        vm::switchuvm(d);
        Ok(())
    }

    // Create a new process copying this one. Sets up the child
    // kernel stack to return as if from the fork() system call.
    pub fn fork(&self) -> Result<usize, ()> {
        let d = unsafe { self.data() };
        let cidx = alloc_proc().ok_or(())?;
        let nd = unsafe { PTABLE.data(cidx) };

        // duplicate the whole address space
        let pgdir = match vm::copyuvm(d.pgdir.expect("fork: no pgdir"), d.sz) {
            Some(pgdir) => pgdir,
            None => {
                kalloc::kfree(nd.kstack as *mut u8);
                nd.kstack = 0;
                nd.trapframe = ptr::null_mut();
                nd.context = ptr::null_mut();
                PTABLE.shared.lock()[cidx] = ProcShared::new();
                return Err(());
            }
        };
        nd.pgdir = Some(pgdir);
        nd.sz = d.sz;

        unsafe {
            *nd.trapframe = *d.trapframe;
            // fork returns 0 in the child
            (*nd.trapframe).eax = 0;
        }

        for (nf, f) in nd.ofile.iter_mut().zip(d.ofile.iter()) {
            if let Some(f) = f {
                nf.replace(f.clone());
            }
        }
        nd.cwd = d.cwd.as_ref().map(|c| c.dup());
        nd.name = d.name;

        let mut table = PTABLE.shared.lock();
        table[cidx].parent = self.idx;
        let pid = table[cidx].pid;
        table[cidx].state = ProcState::Runnable;
        Ok(pid)
    }

    // Exit the current process; it stays a Zombie until the
    // parent calls wait(). Does not return.
    pub fn exit(&self) -> ! {
        assert!(
            Some(&self.idx) != INITPROC.get(),
            "init exiting"
        );

        let d = unsafe { self.data() };
        // close all open files
        for f in d.ofile.iter_mut() {
            f.take();
        }

        // release the working directory inside a transaction
        LOG.begin_op();
        d.cwd.take();
        LOG.end_op();

        let mut table = PTABLE.shared.lock();
        let parent = table[self.idx].parent;

        // parent might be sleeping in wait()
        Ptable::wakeup1(&mut table, PTABLE.wait_chan(parent));

        // pass abandoned children to init
        let init = *INITPROC.get().expect("exit: no init process");
        for i in 0..NPROC {
            if table[i].parent == self.idx {
                table[i].parent = init;
                if table[i].state == ProcState::Zombie {
                    Ptable::wakeup1(&mut table, PTABLE.wait_chan(init));
                }
            }
        }

        table[self.idx].state = ProcState::Zombie;
        let _ = unsafe { sched(table, self.idx) };
        panic!("zombie exit");
    }

    // Wait for a child to exit and return its pid, or None if
    // this process has no children.
    pub fn wait(&self) -> Option<usize> {
        let mut table = PTABLE.shared.lock();
        loop {
            let mut havekids = false;
            for i in 0..NPROC {
                if table[i].parent != self.idx {
                    continue;
                }
                havekids = true;
                if table[i].state == ProcState::Zombie {
                    // found one: reclaim its resources
                    let pid = table[i].pid;
                    let cd = unsafe { PTABLE.data(i) };
                    kalloc::kfree(cd.kstack as *mut u8);
                    cd.kstack = 0;
                    cd.trapframe = ptr::null_mut();
                    cd.context = ptr::null_mut();
                    if let Some(pgdir) = cd.pgdir.take() {
                        vm::freevm(pgdir);
                    }
                    cd.sz = 0;
                    cd.name = [0; 16];
                    table[i] = ProcShared::new();
                    return Some(pid);
                }
            }

            // no point waiting if we don't have any children
            if !havekids || table[self.idx].killed {
                return None;
            }

            // wait for a child to exit
            table[self.idx].chan = PTABLE.wait_chan(self.idx);
            table[self.idx].state = ProcState::Sleeping;
            table = suspend(table, self.idx);
            table[self.idx].chan = 0;
        }
    }

    // Give up the cpu for one scheduling round.
    pub fn yielding(&self) {
        let mut table = PTABLE.shared.lock();
        table[self.idx].state = ProcState::Runnable;
        let table = suspend(table, self.idx);
        drop(table);
    }
}

// Enter the scheduler with the table lock held and the state
// already changed; return when this process next runs. On the
// metal this is a context switch into the per-cpu dispatch loop;
// hosted callers just step aside and take the slot back.
#[cfg(target_os = "none")]
fn suspend(table: PoolGuard<'_>, idx: usize) -> PoolGuard<'_> {
    unsafe { sched(table, idx) }
}

#[cfg(not(target_os = "none"))]
fn suspend(table: PoolGuard<'_>, idx: usize) -> PoolGuard<'_> {
    drop(table);
    x86::pause();
    let mut table = PTABLE.shared.lock();
    table[idx].chan = 0;
    table[idx].state = ProcState::Running;
    table
}

// Switch to the per-cpu scheduler context. Must hold only the
// process-table lock and have already changed the slot's state.
// Saves and restores intena because it is a property of this
// kernel thread, not this cpu.
#[cfg(target_os = "none")]
unsafe fn sched(table: PoolGuard<'_>, idx: usize) -> PoolGuard<'_> {
    let c = CPUS.my_cpu();
    assert!(table.holding(), "sched ptable lock");
    assert!(c.noff == 1, "sched locks");
    assert!(table[idx].state != ProcState::Running, "sched running");
    assert!(!x86::intr_get(), "sched interruptible");

    let intena = c.intena;
    let d = PTABLE.data(idx);
    swtch(&mut d.context, c.scheduler);
    CPUS.my_cpu().intena = intena;
    table
}

#[cfg(not(target_os = "none"))]
#[allow(dead_code)]
unsafe fn sched(table: PoolGuard<'_>, _idx: usize) -> PoolGuard<'_> {
    drop(table);
    panic!("sched: no scheduler on the host");
}

// Per-cpu process dispatch loop, entered once per cpu at boot and
// never left. Round-robin over the table by slot order.
#[cfg(target_os = "none")]
pub fn scheduler() -> ! {
    let c = unsafe { CPUS.my_cpu() };
    c.proc = None;

    loop {
        // enable interrupts on this processor
        x86::intr_on();

        let mut table = PTABLE.shared.lock();
        for idx in 0..NPROC {
            if table[idx].state != ProcState::Runnable {
                continue;
            }

            // Switch to the chosen process. It is its job to
            // release the table lock and reacquire it before
            // jumping back here.
            let d = unsafe { PTABLE.data(idx) };
            c.proc = Some(idx);
            vm::switchuvm(d);
            table[idx].state = ProcState::Running;

            unsafe { swtch(&mut c.scheduler, d.context) };
            vm::switchkvm();

            // the process is done running for now
            c.proc = None;
        }
        drop(table);
    }
}

// Atomically release lk and sleep, regardless of whether the
// caller has a process context. Early boot and the hosted test
// harness reach the spin path; everything after the first user
// process sleeps for real.
pub fn sleep<'a, T>(chan: usize, lk: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match CPUS.my_proc() {
        Some(p) => p.sleep(chan, lk),
        None => sleep_without_proc(chan, lk),
    }
}

#[cfg(target_os = "none")]
fn sleep_without_proc<'a, T>(_chan: usize, _lk: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    panic!("sleep: no process");
}

// Hosted threads without a bound slot step aside and re-check
// their condition, which is all a wakeup means to them.
#[cfg(not(target_os = "none"))]
fn sleep_without_proc<'a, T>(_chan: usize, lk: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    let mutex = Mutex::unlock(lk);
    x86::pause();
    mutex.lock()
}

// A fork child's very first scheduling by scheduler() switches
// here, still holding the process-table lock.
pub extern "C" fn fork_ret() {
    static FIRST: AtomicBool = AtomicBool::new(true);

    unsafe { PTABLE.shared.force_unlock() };

    if FIRST.swap(false, Ordering::AcqRel) {
        // Some initialization must run in the context of a
        // regular process (it sleeps on disk I/O), so it cannot
        // run from main(): bring up the on-disk side now.
        crate::fs::init(crate::param::ROOTDEV);
    }

    // returns into trapret, which pops the prepared trap frame
}

// Print a process listing to the console: one line per active
// slot. No locks, so a stuck machine can still be inspected.
pub fn procdump() {
    let table = unsafe { PTABLE.shared.get_mut() };
    for (i, p) in table.iter().enumerate() {
        if p.state == ProcState::Unused {
            continue;
        }
        let d = unsafe { PTABLE.data(i) };
        crate::println!("{} {:?} {}", p.pid, p.state, d.name_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserve() -> usize {
        crate::kalloc::host_init();
        alloc_proc().expect("no slot")
    }

    fn release(idx: usize) {
        let d = unsafe { PTABLE.data(idx) };
        kalloc::kfree(d.kstack as *mut u8);
        d.kstack = 0;
        d.trapframe = ptr::null_mut();
        d.context = ptr::null_mut();
        PTABLE.shared.lock()[idx] = ProcShared::new();
    }

    #[test]
    fn alloc_assigns_increasing_pids() {
        let a = reserve();
        let b = reserve();
        let (pa, pb) = {
            let t = PTABLE.shared.lock();
            (t[a].pid, t[b].pid)
        };
        assert!(pb > pa);
        assert_ne!(a, b);
        release(a);
        release(b);
    }

    #[test]
    fn alloc_prepares_first_switch_into_fork_ret() {
        let idx = reserve();
        let d = unsafe { PTABLE.data(idx) };
        assert_eq!(PTABLE.shared.lock()[idx].state, ProcState::Embryo);
        assert!(!d.context.is_null());
        let eip = unsafe { (*d.context).eip };
        assert_eq!(eip, fork_ret as usize as u32);
        // trap frame sits at the top of the stack page
        assert_eq!(
            d.trapframe as usize + size_of::<Trapframe>(),
            d.kstack + KSTACKSIZE
        );
        release(idx);
    }

    #[test]
    fn kill_wakes_a_sleeper() {
        let idx = reserve();
        let pid = {
            let mut t = PTABLE.shared.lock();
            t[idx].state = ProcState::Sleeping;
            t[idx].chan = 0xdead;
            t[idx].pid
        };
        PTABLE.kill(pid).unwrap();
        {
            let t = PTABLE.shared.lock();
            assert!(t[idx].killed);
            assert_eq!(t[idx].state, ProcState::Runnable);
        }
        release(idx);
    }

    #[test]
    fn kill_unknown_pid_fails() {
        assert!(PTABLE.kill(usize::MAX).is_err());
    }

    #[test]
    fn wakeup_is_channel_selective() {
        let a = reserve();
        let b = reserve();
        {
            let mut t = PTABLE.shared.lock();
            t[a].state = ProcState::Sleeping;
            t[a].chan = 1;
            t[b].state = ProcState::Sleeping;
            t[b].chan = 2;
        }
        PTABLE.wakeup(1);
        {
            let t = PTABLE.shared.lock();
            assert_eq!(t[a].state, ProcState::Runnable);
            assert_eq!(t[b].state, ProcState::Sleeping);
        }
        PTABLE.wakeup(2);
        release(a);
        release(b);
    }

    #[test]
    fn wait_without_children_returns_none() {
        let idx = reserve();
        CPUS.adopt_proc(Some(idx));
        {
            let mut t = PTABLE.shared.lock();
            t[idx].state = ProcState::Running;
        }
        let me = CPUS.my_proc().unwrap();
        assert_eq!(me.wait(), None);
        CPUS.adopt_proc(None);
        release(idx);
    }
}

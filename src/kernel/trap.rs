use crate::proc::{Cpus, ProcState, CPUS, PTABLE};
use crate::spinlock::Mutex;
use crate::sync::OnceLock;
use crate::syscall;
use crate::x86;
use array_macro::array;

// x86 trap and interrupt numbers
pub const T_DIVIDE: u32 = 0; // divide error
pub const T_DEBUG: u32 = 1;
pub const T_NMI: u32 = 2;
pub const T_BRKPT: u32 = 3;
pub const T_OFLOW: u32 = 4;
pub const T_BOUND: u32 = 5;
pub const T_ILLOP: u32 = 6; // invalid opcode
pub const T_DEVICE: u32 = 7;
pub const T_DBLFLT: u32 = 8;
pub const T_TSS: u32 = 10;
pub const T_SEGNP: u32 = 11;
pub const T_STACKSEG: u32 = 12;
pub const T_GPFLT: u32 = 13; // general protection fault
pub const T_PGFLT: u32 = 14; // page fault
pub const T_FPERR: u32 = 16;

pub const T_SYSCALL: u32 = 64; // system call

pub const T_IRQ0: u32 = 32; // IRQ 0 corresponds to int T_IRQ0

pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_COM1: u32 = 4;
pub const IRQ_MOUSE: u32 = 12;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_SPURIOUS: u32 = 31;

const DPL_USER: u16 = 3;

const SEG_UCODE: u16 = 3;
const SEG_UDATA: u16 = 4;

// Layout of the stack after the common trap entry pushes every
// register: pusha block first, then segment registers, then the
// vector number, with the hardware-pushed words on top. Popping
// it with trapret resumes the interrupted user code unchanged.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Trapframe {
    // registers as pushed by pusha
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // useless & ignored
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,

    pub gs: u16,
    pub padding1: u16,
    pub fs: u16,
    pub padding2: u16,
    pub es: u16,
    pub padding3: u16,
    pub ds: u16,
    pub padding4: u16,
    pub trapno: u32,

    // below here defined by x86 hardware
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding5: u16,
    pub eflags: u32,

    // below here only when crossing rings
    pub esp: u32,
    pub ss: u16,
    pub padding6: u16,
}

impl Trapframe {
    pub const UCODE_SEL: u16 = (SEG_UCODE << 3) | DPL_USER;
    pub const UDATA_SEL: u16 = (SEG_UDATA << 3) | DPL_USER;

    pub fn zeroed() -> Self {
        // all-integer struct, all-zero is valid
        unsafe { core::mem::zeroed() }
    }

    fn from_user(&self) -> bool {
        self.cs & 3 == DPL_USER
    }
}

pub static TICKS: Mutex<usize> = Mutex::new(0, "time");

// the channel tick-sleepers wait on
pub fn ticks_chan() -> usize {
    &TICKS as *const _ as usize
}

// Keyboard, serial and mouse belong to external drivers; they
// register their handlers here at boot, the trap layer dispatches
// and acknowledges the interrupt.
static IRQ_HANDLERS: [OnceLock<fn()>; 16] = array![_ => OnceLock::new(); 16];

pub fn register_irq(irq: u32, handler: fn()) {
    assert!((irq as usize) < IRQ_HANDLERS.len(), "register_irq");
    if IRQ_HANDLERS[irq as usize].set(handler).is_err() {
        panic!("register_irq: irq {} taken", irq);
    }
}

fn run_irq(irq: u32) {
    if let Some(h) = IRQ_HANDLERS[irq as usize].get() {
        h();
    }
}

fn clock_intr() {
    let mut ticks = TICKS.lock();
    *ticks += 1;
    drop(ticks);
    PTABLE.wakeup(ticks_chan());
}

// All traps, interrupts and syscalls funnel here from the common
// entry stub with every register captured in tf.
pub fn trap(tf: &mut Trapframe) {
    if tf.trapno == T_SYSCALL {
        let p = CPUS.my_proc().expect("syscall: no process");
        if p.killed() {
            p.exit();
        }
        unsafe { p.data().trapframe = tf as *mut Trapframe };
        syscall::syscall();
        if p.killed() {
            p.exit();
        }
        return;
    }

    match tf.trapno {
        t if t == T_IRQ0 + IRQ_TIMER => {
            if Cpus::cpu_id() == 0 {
                clock_intr();
            }
            x86::lapic_eoi();
        }
        t if t == T_IRQ0 + IRQ_IDE => {
            crate::ide::IDE.intr();
            x86::lapic_eoi();
        }
        t if t == T_IRQ0 + IRQ_KBD || t == T_IRQ0 + IRQ_COM1 || t == T_IRQ0 + IRQ_MOUSE => {
            run_irq(t - T_IRQ0);
            x86::lapic_eoi();
        }
        t if t == T_IRQ0 + 7 || t == T_IRQ0 + IRQ_SPURIOUS => {
            crate::println!("cpu{}: spurious interrupt at eip {:#x}", Cpus::cpu_id(), tf.eip);
            x86::lapic_eoi();
        }
        _ => {
            let p = CPUS.my_proc();
            if p.is_none() || !tf.from_user() {
                // faults inside the kernel are always bugs
                crate::println!(
                    "unexpected trap {} from cpu {} eip {:#x} err {:#x}",
                    tf.trapno,
                    Cpus::cpu_id(),
                    tf.eip,
                    tf.err,
                );
                panic!("trap");
            }
            // misbehaving user process
            let p = p.unwrap();
            crate::println!(
                "pid {} {}: trap {} err {:#x} on cpu {} eip {:#x} -- kill proc",
                p.pid(),
                unsafe { p.data().name_str() },
                tf.trapno,
                tf.err,
                Cpus::cpu_id(),
                tf.eip,
            );
            PTABLE.shared.lock()[p.idx()].killed = true;
        }
    }

    // Force the process to exit if it has been killed and is in
    // user space; if it is still in the kernel it exits the next
    // time it reaches trap return.
    if let Some(p) = CPUS.my_proc() {
        if p.killed() && tf.from_user() {
            p.exit();
        }

        // preempt on a clock tick
        if tf.trapno == T_IRQ0 + IRQ_TIMER
            && PTABLE.shared.lock()[p.idx()].state == ProcState::Running
        {
            p.yielding();
        }

        // the yield may have taken a while; recheck
        if p.killed() && tf.from_user() {
            p.exit();
        }
    }
}

// The IDT, shared by all cpus: every vector funnels through the
// entry stubs generated alongside trapret. Syscalls keep
// interrupts enabled and are callable from user mode.
#[cfg(target_os = "none")]
mod idt {
    use super::*;
    use core::cell::UnsafeCell;

    extern "C" {
        // from the vector stubs; array of 256 entry points
        static vectors: [u32; 256];
    }

    const SEG_KCODE: u16 = 1;

    struct Idt(UnsafeCell<[u64; 256]>);
    unsafe impl Sync for Idt {}

    static IDT: Idt = Idt(UnsafeCell::new([0; 256]));

    fn gate(istrap: bool, sel: u16, off: u32, dpl: u16) -> u64 {
        let lo = (off as u64 & 0xFFFF) | ((sel as u64) << 16);
        let hi = (off as u64 & 0xFFFF_0000)
            | 0x8000
            | ((dpl as u64) << 13)
            | if istrap { 0x0F00 } else { 0x0E00 };
        lo | (hi << 32)
    }

    // build the table; runs once on the boot cpu
    pub fn trap_init() {
        let idt = unsafe { &mut *IDT.0.get() };
        for (i, slot) in idt.iter_mut().enumerate() {
            *slot = gate(false, SEG_KCODE << 3, unsafe { vectors[i] }, 0);
        }
        // syscalls do not disable interrupts and may come from user mode
        idt[T_SYSCALL as usize] = gate(
            true,
            SEG_KCODE << 3,
            unsafe { vectors[T_SYSCALL as usize] },
            DPL_USER,
        );
    }

    // load it; runs on every cpu
    pub fn trap_init_hart() {
        unsafe {
            x86::lidt(
                IDT.0.get() as u32,
                (core::mem::size_of::<[u64; 256]>() - 1) as u16,
            )
        };
    }
}

#[cfg(target_os = "none")]
pub use idt::{trap_init, trap_init_hart};

//! xv86: a small SMP teaching kernel for 32-bit x86 in the Unix
//! V6 lineage, written in Rust.
//!
//! The library holds the whole core: locking, processes and the
//! scheduler, two-level paged virtual memory, the crash-safe file
//! system stack (buffer cache, write-ahead log, inodes, paths,
//! files, pipes), traps and system calls. Platform bring-up lives
//! outside: the boot path is expected to run, on the first cpu,
//!
//!   kalloc::kinit1 -> vm::kvmalloc -> trap::trap_init ->
//!   bio::init -> ide::init -> proc::user_init ->
//!   kalloc::kinit2 -> proc::scheduler
//!
//! and on every further cpu trap::trap_init_hart plus
//! proc::scheduler. Device drivers register their interrupt
//! handlers through trap::register_irq and their file-side
//! methods through file::DEVSW.
//!
//! Hardware-specific pieces are gated on `target_os = "none"`;
//! hosted builds of the same sources back the test suite with a
//! simulated physical window, RAM disks, and thread-per-cpu
//! stand-ins.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub use array_macro::array;

#[macro_use]
pub mod printf;

pub mod bio;
pub mod defs;
pub mod elf;
pub mod exec;
pub mod fcntl;
pub mod file;
pub mod fs;
pub mod ide;
pub mod kalloc;
pub mod log;
pub mod memlayout;
#[cfg(not(target_os = "none"))]
pub mod mkfs;
pub mod param;
pub mod pipe;
pub mod proc;
pub mod sleeplock;
pub mod spinlock;
pub mod stat;
pub mod swtch;
pub mod sync;
pub mod syscall;
pub mod sysfile;
pub mod sysproc;
pub mod trap;
pub mod vm;
pub mod x86;

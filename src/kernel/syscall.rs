// System call dispatch and user argument fetching.
//
// User code passes arguments on its stack: the n'th word-sized
// argument sits at esp + 4 + 4*n at the moment of the trap. All
// fetches go through the process page table with bounds checks
// against the process size, so a bad pointer costs the caller -1,
// never the kernel.

use crate::file::File;
use crate::proc::{ProcData, CPUS};
use crate::sysfile::*;
use crate::sysproc::*;
use crate::vm::{copyin, copyinstr};
use core::mem::size_of;

#[derive(Copy, Clone, Debug)]
#[repr(usize)]
pub enum SysCalls {
    Invalid = 0,
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Exec = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
    Gettime = 22,
    Ioctl = 23,
}

pub type SysResult = Result<usize, ()>;

impl SysCalls {
    const TABLE: [fn() -> SysResult; 24] = [
        Self::invalid,
        sys_fork,
        sys_exit,
        sys_wait,
        sys_pipe,
        sys_read,
        sys_kill,
        sys_exec,
        sys_fstat,
        sys_chdir,
        sys_dup,
        sys_getpid,
        sys_sbrk,
        sys_sleep,
        sys_uptime,
        sys_open,
        sys_write,
        sys_mknod,
        sys_unlink,
        sys_link,
        sys_mkdir,
        sys_close,
        sys_gettime,
        sys_ioctl,
    ];

    fn invalid() -> SysResult {
        unreachable!()
    }

    fn from_usize(n: usize) -> Self {
        match n {
            1 => Self::Fork,
            2 => Self::Exit,
            3 => Self::Wait,
            4 => Self::Pipe,
            5 => Self::Read,
            6 => Self::Kill,
            7 => Self::Exec,
            8 => Self::Fstat,
            9 => Self::Chdir,
            10 => Self::Dup,
            11 => Self::Getpid,
            12 => Self::Sbrk,
            13 => Self::Sleep,
            14 => Self::Uptime,
            15 => Self::Open,
            16 => Self::Write,
            17 => Self::Mknod,
            18 => Self::Unlink,
            19 => Self::Link,
            20 => Self::Mkdir,
            21 => Self::Close,
            22 => Self::Gettime,
            23 => Self::Ioctl,
            _ => Self::Invalid,
        }
    }
}

// Decode and run the system call named by eax; the result goes
// back in eax, with every failure flattened to -1.
pub fn syscall() {
    let p = CPUS.my_proc().expect("syscall: no process");
    let data = unsafe { p.data() };
    let tf = unsafe { &mut *data.trapframe };
    let num = tf.eax as usize;

    tf.eax = match SysCalls::from_usize(num) {
        SysCalls::Invalid => {
            crate::println!("{} {}: unknown sys call {}", p.pid(), data.name_str(), num);
            u32::MAX
        }
        sc => match SysCalls::TABLE[sc as usize]() {
            Ok(v) => v as u32,
            Err(()) => u32::MAX,
        },
    };
}

pub type RawFd = usize;

impl ProcData {
    // Fetch a word from the given user virtual address.
    pub fn fetch_int(&self, addr: usize) -> Result<u32, ()> {
        // both checks needed, in case of overflow
        if addr >= self.sz || addr.wrapping_add(size_of::<u32>()) > self.sz {
            return Err(());
        }
        let mut b = [0u8; 4];
        copyin(self.pgdir.ok_or(())?, &mut b, addr)?;
        Ok(u32::from_le_bytes(b))
    }

    // Fetch the NUL-terminated string at the user address.
    pub fn fetch_str<'a>(&self, addr: usize, buf: &'a mut [u8]) -> Result<&'a str, ()> {
        if addr >= self.sz {
            return Err(());
        }
        copyinstr(self.pgdir.ok_or(())?, buf, addr)
    }

    // The n'th word-sized system call argument.
    pub fn arg_raw(&self, n: usize) -> Result<u32, ()> {
        let esp = unsafe { (*self.trapframe).esp } as usize;
        self.fetch_int(esp + 4 + 4 * n)
    }

    pub fn arg_int(&self, n: usize) -> Result<i32, ()> {
        Ok(self.arg_raw(n)? as i32)
    }

    // The n'th argument as a pointer to a block of size bytes,
    // checked to lie inside the process.
    pub fn arg_ptr(&self, n: usize, size: usize) -> Result<usize, ()> {
        let addr = self.arg_raw(n)? as usize;
        if addr >= self.sz || addr + size > self.sz {
            return Err(());
        }
        Ok(addr)
    }

    // The n'th argument as a string, copied into buf.
    pub fn arg_str<'a>(&self, n: usize, buf: &'a mut [u8]) -> Result<&'a str, ()> {
        let addr = self.arg_raw(n)? as usize;
        self.fetch_str(addr, buf)
    }

    // The n'th argument as a file descriptor: the number and the
    // open file it names.
    pub fn arg_fd(&self, n: usize) -> Result<(RawFd, &File), ()> {
        let fd = self.arg_raw(n)? as usize;
        match self.ofile.get(fd) {
            Some(Some(f)) => Ok((fd, f)),
            _ => Err(()),
        }
    }

    // Install a file in the lowest free descriptor slot.
    pub fn fd_alloc(&mut self, file: File) -> Result<RawFd, ()> {
        for (fd, f) in self.ofile.iter_mut().enumerate() {
            if f.is_none() {
                f.replace(file);
                return Ok(fd);
            }
        }
        Err(())
    }
}

// Process-related system calls.

use crate::proc::{self, CPUS, PTABLE};
use crate::stat::RtcDate;
use crate::syscall::SysResult;
use crate::trap::{ticks_chan, TICKS};
use crate::vm::{either_copyout, VirtAddr};
use crate::x86;
use core::mem::size_of;

pub fn sys_fork() -> SysResult {
    CPUS.my_proc().ok_or(())?.fork()
}

pub fn sys_exit() -> SysResult {
    CPUS.my_proc().ok_or(())?.exit()
    // not reached
}

pub fn sys_wait() -> SysResult {
    CPUS.my_proc().ok_or(())?.wait().ok_or(())
}

pub fn sys_kill() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let pid = unsafe { p.data() }.arg_int(0)?;
    if pid < 0 {
        return Err(());
    }
    PTABLE.kill(pid as usize).and(Ok(0))
}

pub fn sys_getpid() -> SysResult {
    Ok(CPUS.my_proc().ok_or(())?.pid())
}

// Grow (or shrink) the process; returns the old program break.
pub fn sys_sbrk() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let n = data.arg_int(0)? as isize;
    let addr = data.sz;
    p.grow_proc(n)?;
    Ok(addr)
}

// Pause for about n clock ticks.
pub fn sys_sleep() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let n = unsafe { p.data() }.arg_int(0)?;
    if n < 0 {
        return Err(());
    }
    let n = n as usize;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;
    while *ticks - ticks0 < n {
        if p.killed() {
            return Err(());
        }
        ticks = proc::sleep(ticks_chan(), ticks);
    }
    Ok(0)
}

// Clock tick count since boot.
pub fn sys_uptime() -> SysResult {
    Ok(*TICKS.lock())
}

// Current wall-clock time from the RTC, copied to a user
// rtcdate.
pub fn sys_gettime() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let addr = unsafe { p.data() }.arg_ptr(0, size_of::<RtcDate>())?;
    let d = x86::cmostime();
    either_copyout(VirtAddr::User(addr), unsafe { crate::defs::as_bytes(&d) })?;
    Ok(0)
}

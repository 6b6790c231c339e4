// File-system system calls, mostly argument decoding plus calls
// into fs.rs and file.rs.

use crate::exec::exec;
use crate::fcntl::OMode;
use crate::file::{FType, FTABLE};
use crate::fs::{self, Path};
use crate::log::LOG;
use crate::param::{MAXARG, MAXPATH};
use crate::pipe::Pipe;
use crate::proc::CPUS;
use crate::stat::IType;
use crate::syscall::SysResult;
use crate::vm::{either_copyout, VirtAddr};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::mem::size_of;

pub fn sys_dup() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let f = {
        let (_, f) = data.arg_fd(0)?;
        f.clone()
    };
    data.fd_alloc(f)
}

pub fn sys_read() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let n = data.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = data.arg_ptr(1, n as usize)?;
    let (_, f) = data.arg_fd(0)?;
    f.read(VirtAddr::User(addr), n as usize)
}

pub fn sys_write() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let n = data.arg_int(2)?;
    if n < 0 {
        return Err(());
    }
    let addr = data.arg_ptr(1, n as usize)?;
    let (_, f) = data.arg_fd(0)?;
    f.write(VirtAddr::User(addr), n as usize)
}

pub fn sys_close() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let (fd, _) = data.arg_fd(0)?;
    data.ofile[fd].take();
    Ok(0)
}

pub fn sys_fstat() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let addr = data.arg_ptr(1, size_of::<crate::stat::Stat>())?;
    let (_, f) = data.arg_fd(0)?;
    f.stat(VirtAddr::User(addr)).and(Ok(0))
}

// Create the path new as a link to the same inode as old.
pub fn sys_link() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut old = [0u8; MAXPATH];
    let mut new = [0u8; MAXPATH];
    let old = data.arg_str(0, &mut old)?;
    let new = data.arg_str(1, &mut new)?;

    LOG.begin_op();
    let res = fs::link(Path::new(old), Path::new(new));
    LOG.end_op();
    res.and(Ok(0))
}

pub fn sys_unlink() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;

    LOG.begin_op();
    let res = fs::unlink(Path::new(path));
    LOG.end_op();
    res.and(Ok(0))
}

pub fn sys_open() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    let omode = OMode::from_usize(data.arg_int(1)? as usize);

    LOG.begin_op();
    let fd = FTABLE
        .alloc(omode, FType::Node(Path::new(path)))
        .and_then(|f| data.fd_alloc(f).ok());
    LOG.end_op();
    fd.ok_or(())
}

pub fn sys_mkdir() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;

    LOG.begin_op();
    // the handle from create is released inside the transaction
    let res = fs::create(Path::new(path), IType::Dir, 0, 0).map(|_| 0).ok_or(());
    LOG.end_op();
    res
}

pub fn sys_mknod() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    let major = data.arg_int(1)? as u16;
    let minor = data.arg_int(2)? as u16;

    LOG.begin_op();
    let res = fs::create(Path::new(path), IType::Device, major, minor)
        .map(|_| 0)
        .ok_or(());
    LOG.end_op();
    res
}

pub fn sys_chdir() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;

    LOG.begin_op();
    let res = (|| {
        let (_, ip) = Path::new(path).namei().ok_or(())?;
        if ip.lock().itype() != IType::Dir {
            return Err(());
        }
        // the old cwd reference is dropped inside the transaction
        data.cwd.replace(ip);
        Ok(0)
    })();
    LOG.end_op();
    res
}

pub fn sys_exec() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let mut path = [0u8; MAXPATH];
    let path = data.arg_str(0, &mut path)?;
    let uargv = data.arg_raw(1)? as usize;

    let mut argv: Vec<String> = Vec::new();
    for i in 0..=MAXARG {
        if i == MAXARG {
            return Err(());
        }
        let uarg = data.fetch_int(uargv + 4 * i)? as usize;
        if uarg == 0 {
            break;
        }
        let mut buf = [0u8; MAXPATH];
        argv.push(data.fetch_str(uarg, &mut buf)?.to_string());
    }

    let argv: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    exec(Path::new(path), &argv)
}

pub fn sys_pipe() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    // user pointer to an array of two fds
    let addr = data.arg_ptr(0, 2 * size_of::<u32>())?;

    let (rf, wf) = Pipe::alloc().ok_or(())?;
    let fd0 = data.fd_alloc(rf)?;
    let fd1 = match data.fd_alloc(wf) {
        Ok(fd) => fd,
        Err(()) => {
            data.ofile[fd0].take();
            return Err(());
        }
    };

    let fds = [fd0 as u32, fd1 as u32];
    if either_copyout(VirtAddr::User(addr), unsafe { crate::defs::as_bytes(&fds) }).is_err() {
        data.ofile[fd0].take();
        data.ofile[fd1].take();
        return Err(());
    }
    Ok(0)
}

// Device control. The argument is one 32-bit record, validated
// and copied through the page table both ways; the driver never
// sees the user pointer.
pub fn sys_ioctl() -> SysResult {
    let p = CPUS.my_proc().ok_or(())?;
    let data = unsafe { p.data() };
    let req = data.arg_int(1)? as usize;
    let addr = data.arg_ptr(2, size_of::<u32>())?;

    let mut rec = [0u8; 4];
    crate::vm::either_copyin(&mut rec, VirtAddr::User(addr))?;
    let mut arg = u32::from_le_bytes(rec);

    let res = {
        let (_, f) = data.arg_fd(0)?;
        f.ioctl(req, &mut arg)?
    };

    either_copyout(VirtAddr::User(addr), &arg.to_le_bytes())?;
    Ok(res)
}

// Open-file objects and the device switch.
//
// A File is one handle on a system-wide open-file table entry;
// clones made by dup share the entry (and so the offset), the
// last drop releases it. The table entry dispatches on kind:
// a disk-backed inode, a device node, or one end of a pipe.

use crate::fcntl::OMode;
use crate::fs::{create, IData, Inode, Path, BSIZE};
use crate::log::LOG;
use crate::param::{MAXOPBLOCKS, NDEV, NFILE};
use crate::pipe::Pipe;
use crate::sleeplock::SleepLockGuard;
use crate::spinlock::Mutex;
use crate::stat::{IType, Stat};
use crate::sync::OnceLock;
use crate::vm::{either_copyout, VirtAddr};
use alloc::sync::Arc;
use array_macro::array;
use core::cell::UnsafeCell;
use core::cmp::min;
use core::ops::Deref;

pub static DEVSW: DevSW = DevSW::new();
pub static FTABLE: FTable = Mutex::new(array![_ => None; NFILE], "ftable");

pub type FTable = Mutex<[Option<Arc<VFile>>; NFILE]>;

#[derive(Default, Clone)]
pub struct File {
    f: Option<Arc<VFile>>,
    readable: bool,
    writable: bool,
    append: bool,
}

#[derive(Debug)]
pub enum VFile {
    Device(DNod),
    Inode(FNod),
    Pipe(Arc<Pipe>),
}

// device node
#[derive(Debug)]
pub struct DNod {
    driver: &'static dyn Device,
    ip: Inode,
}

// file and directory node: an inode plus the shared read/write
// offset. The offset is only touched with the inode lock held,
// which is what makes it safe to share between dup'd handles.
#[derive(Debug)]
pub struct FNod {
    off: UnsafeCell<u32>,
    ip: Inode,
}

unsafe impl Send for FNod {}
unsafe impl Sync for FNod {}

// Device methods, dispatched by major number. The ioctl argument
// is a fixed-size record copied in and out by the syscall layer;
// drivers never see a user pointer.
pub trait Device: Send + Sync {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()>;
    fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()>;
    fn ioctl(&self, _req: usize, _arg: &mut u32) -> Result<usize, ()> {
        Err(())
    }
    fn major(&self) -> u16;
}

impl core::fmt::Debug for dyn Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "device {}", self.major())
    }
}

impl FNod {
    fn new(ip: Inode) -> Self {
        Self {
            off: UnsafeCell::new(0),
            ip,
        }
    }

    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut ig = self.ip.lock();
        let off = unsafe { &mut *self.off.get() };
        match ig.read(dst, *off, n) {
            Ok(r) => {
                *off += r as u32;
                Ok(r)
            }
            Err(_) => Err(()),
        }
    }

    fn write(&self, src: VirtAddr, n: usize, append: bool) -> Result<usize, ()> {
        // Write a few blocks at a time to avoid exceeding the
        // maximum log transaction size, including inode, indirect
        // block, allocation blocks, and 2 blocks of slop for
        // non-aligned writes. This really belongs lower down,
        // since writei might be writing a device like the
        // console.
        let max = ((MAXOPBLOCKS - 1 - 1 - 2) / 2) * BSIZE;
        let mut i = 0;
        while i < n {
            let n1 = min(n - i, max);
            let r;
            {
                LOG.begin_op();
                let mut ig = self.ip.lock();
                let off = unsafe { &mut *self.off.get() };
                if append {
                    *off = ig.size;
                }
                r = ig.write(src + i, *off, n1).unwrap_or(0);
                *off += r as u32;
                LOG.end_op();
            }
            if r != n1 {
                // error from writei
                break;
            }
            i += r;
        }
        if i == n {
            Ok(n)
        } else {
            Err(())
        }
    }
}

impl VFile {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.read(dst, n),
            VFile::Inode(f) => f.read(dst, n),
            VFile::Pipe(p) => p.read(dst, n),
        }
    }

    fn write(&self, src: VirtAddr, n: usize, append: bool) -> Result<usize, ()> {
        match self {
            VFile::Device(d) => d.driver.write(src, n),
            VFile::Inode(f) => f.write(src, n, append),
            VFile::Pipe(p) => p.write(src, n),
        }
    }

    // Get metadata about the file into the (possibly user)
    // address addr.
    pub fn stat(&self, addr: VirtAddr) -> Result<(), ()> {
        let mut stat = Stat::default();
        match self {
            VFile::Device(DNod { driver: _, ip }) | VFile::Inode(FNod { off: _, ip }) => {
                ip.lock().stat(&mut stat);
                either_copyout(addr, unsafe { crate::defs::as_bytes(&stat) })
            }
            _ => Err(()),
        }
    }
}

impl File {
    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    // Read from the file into dst.
    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.readable {
            return Err(());
        }
        self.f.as_ref().unwrap().read(dst, n)
    }

    // Write src to the file.
    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        if !self.writable {
            return Err(());
        }
        self.f.as_ref().unwrap().write(src, n, self.append)
    }

    // Device-dependent control. The argument record is copied
    // both ways by the caller.
    pub fn ioctl(&self, req: usize, arg: &mut u32) -> Result<usize, ()> {
        match self.f.as_ref().unwrap().deref() {
            VFile::Device(d) => d.driver.ioctl(req, arg),
            _ => Err(()),
        }
    }

    pub fn stat(&self, addr: VirtAddr) -> Result<(), ()> {
        self.f.as_ref().unwrap().stat(addr)
    }
}

impl Deref for File {
    type Target = Arc<VFile>;
    fn deref(&self) -> &Arc<VFile> {
        self.f.as_ref().unwrap()
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let f = match self.f.take() {
            Some(f) => f,
            None => return, // a Default-constructed placeholder
        };
        if Arc::strong_count(&f) < 2 {
            panic!("file drop");
        }

        if Arc::strong_count(&f) == 2 {
            // last handle: the other reference is the table's
            let mut guard = FTABLE.lock();
            for slot in guard.iter_mut() {
                match slot {
                    Some(vf) if Arc::ptr_eq(&f, vf) => {
                        slot.take();
                    }
                    _ => (),
                }
            }
        }

        match Arc::try_unwrap(f) {
            Ok(VFile::Inode(FNod { off: _, ip }) | VFile::Device(DNod { driver: _, ip })) => {
                // the inode release may touch the disk
                LOG.begin_op();
                drop(ip);
                LOG.end_op();
            }
            Ok(VFile::Pipe(p)) => p.close(self.writable),
            _ => (),
        }
    }
}

// What to allocate a file table entry for.
pub enum FType<'a> {
    Node(&'a Path),
    Pipe(Arc<Pipe>),
}

impl FTable {
    // Allocate a file object. Must be called inside a transaction
    // when ftype is Node.
    pub fn alloc(&self, opts: OMode, ftype: FType<'_>) -> Option<File> {
        let inner: Arc<VFile> = Arc::new(match ftype {
            FType::Node(path) => {
                let ip: Inode;
                let ig: SleepLockGuard<'_, IData>;

                if opts.is_create() {
                    ip = create(path, IType::File, 0, 0)?;
                    ig = ip.lock();
                } else {
                    ip = path.namei()?.1;
                    let g = ip.lock();
                    if g.itype() == IType::Dir && !opts.is_rdonly() {
                        return None;
                    }
                    ig = g;
                }

                match ig.itype() {
                    IType::Device => {
                        let driver = DEVSW.get(ig.major)?;
                        drop(ig);
                        VFile::Device(DNod { driver, ip })
                    }
                    IType::Dir | IType::File => {
                        let mut ig = ig;
                        if opts.is_trunc() && ig.itype() == IType::File {
                            ig.trunc();
                        }
                        drop(ig);
                        VFile::Inode(FNod::new(ip))
                    }
                    IType::None => return None,
                }
            }
            FType::Pipe(p) => VFile::Pipe(p),
        });

        let mut guard = self.lock();
        let slot = guard.iter_mut().find(|f| f.is_none())?;
        slot.replace(Arc::clone(&inner));
        Some(File {
            f: Some(inner),
            readable: opts.is_read(),
            writable: opts.is_write(),
            append: opts.is_append(),
        })
    }
}

// Table mapping major device numbers to their drivers; devices
// register at boot.
pub struct DevSW {
    table: [OnceLock<&'static dyn Device>; NDEV],
}

impl DevSW {
    pub const fn new() -> Self {
        Self {
            table: array![_ => OnceLock::new(); NDEV],
        }
    }

    pub fn set(&self, major: u16, dev: &'static dyn Device) -> Result<(), ()> {
        if major as usize >= NDEV {
            return Err(());
        }
        self.table[major as usize].set(dev).or(Err(()))
    }

    pub fn get(&self, major: u16) -> Option<&'static dyn Device> {
        self.table.get(major as usize)?.get().copied()
    }
}

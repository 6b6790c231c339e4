// File system implementation. Five layers:
//   + Blocks: allocator for raw disk blocks.
//   + Log: crash recovery for multi-step updates.
//   + Files: inode allocator, reading, writing, metadata.
//   + Directories: inode with special contents (list of other inodes!)
//   + Names: paths like /usr/rtm/xv86/fs.rs for convenient naming.
//
// This file contains the low-level file system manipulation
// routines. The (higher-level) system call implementations are in
// sysfile.rs.

use crate::bio::BCACHE;
use crate::log::LOG;
use crate::param::{NINODE, ROOTDEV};
use crate::proc::CPUS;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::Mutex;
use crate::stat::{IType, RtcDate, Stat};
use crate::sync::OnceLock;
use crate::vm::{either_copyin, either_copyout, VirtAddr};
use crate::x86;
use alloc::sync::Arc;
use array_macro::array;
use core::cmp::min;
use core::mem::size_of;
use core::ops::Deref;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

pub const ROOTINO: u32 = 1; // root i-number
pub const BSIZE: usize = 512; // block size

// On-disk layout revision: NDIRECT == 18 with an mtime stamp in
// every inode.
pub const FSVERSION: u32 = 2;

pub const NDIRECT: usize = 18;
pub const NINDIRECT: usize = BSIZE / size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

// there should be one superblock per disk device, but we run with
// only one device
pub static SB: OnceLock<SuperBlock> = OnceLock::new();

// Disk layout:
// [ boot block | super block | log | inode blocks |
//                                  free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file
// system. The super block describes the disk layout:
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
pub struct SuperBlock {
    pub size: u32,       // size of file system image (blocks)
    pub ninodes: u32,    // number of inodes
    pub nlog: u32,       // number of log blocks
    pub ndata: u32,      // number of data blocks
    pub logstart: u32,   // block number of first log block
    pub inodestart: u32, // block number of first inode block
    pub bmapstart: u32,  // block number of first free map block
    pub version: u32,    // on-disk format revision
}

// On-disk inode structure
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
pub struct DInode {
    pub itype: i16,                // file type
    pub major: i16,                // major device number (T_DEV only)
    pub minor: i16,                // minor device number (T_DEV only)
    pub nlink: i16,                // number of links to inode in file system
    pub size: u32,                 // size of data (bytes)
    pub addrs: [u32; NDIRECT + 1], // data block addresses
    pub mtime: RtcDate,            // time of last modification
    pad: [u32; 3],                 // keep the size dividing BSIZE
}

// inodes per block
pub const IPB: usize = BSIZE / size_of::<DInode>();

// bitmap bits per block
pub const BPB: u32 = (BSIZE * 8) as u32;

const_assert!(size_of::<DInode>() == 128);
const_assert!(BSIZE % size_of::<DInode>() == 0);

// Directory is a file containing a sequence of dirent structures.
pub const FILENAMESZ: usize = 14;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
pub struct DirEnt {
    pub inum: u16,
    pub name: [u8; FILENAMESZ], // NUL-padded when shorter
}

const_assert!(size_of::<DirEnt>() == 16);

impl SuperBlock {
    fn read(dev: u32) -> Self {
        let bp = BCACHE.read(dev, 1);
        bp.align_to::<SuperBlock>()[0]
    }

    // block containing inode i
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    // block of free map containing the bit for block b
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

// Mount the file system on dev: read the superblock and recover
// the log. Must run in a process context on the metal, because
// recovery sleeps on disk I/O.
pub fn init(dev: u32) {
    let sb = SuperBlock::read(dev);
    assert!(sb.version == FSVERSION, "fs: unsupported disk format");
    SB.set(sb).expect("fs: init twice");
    LOG.init(dev, SB.get().unwrap());
}

// Zero a block.
fn bzero(dev: u32, bno: u32) {
    let mut bp = BCACHE.read(dev, bno);
    bp.data.iter_mut().for_each(|b| *b = 0);
    LOG.write(bp);
}

// Blocks.

// Allocate a zeroed disk block.
fn balloc(dev: u32) -> u32 {
    let sb = SB.get().expect("balloc: no superblock");
    for b in (0..sb.size).step_by(BPB as usize) {
        let mut bp = BCACHE.read(dev, sb.bblock(b));
        let mut bi = 0;
        while bi < BPB && b + bi < sb.size {
            let m = 1u8 << (bi % 8);
            if bp.data[(bi / 8) as usize] & m == 0 {
                // the block is free
                bp.data[(bi / 8) as usize] |= m;
                LOG.write(bp);
                bzero(dev, b + bi);
                return b + bi;
            }
            bi += 1;
        }
    }
    panic!("balloc: out of blocks");
}

// Free a disk block.
fn bfree(dev: u32, b: u32) {
    let sb = SB.get().expect("bfree: no superblock");
    let mut bp = BCACHE.read(dev, sb.bblock(b));
    let bi = b % BPB;
    let m = 1u8 << (bi % 8);
    assert!(bp.data[(bi / 8) as usize] & m != 0, "freeing free block");
    bp.data[(bi / 8) as usize] &= !m;
    LOG.write(bp);
}

// Inodes.
//
// An inode describes a single unnamed file. The on-disk structure
// holds metadata: the file's type, its size, the number of links
// referring to it, and the list of blocks holding its content.
//
// The inodes are laid out sequentially on disk at sb.inodestart.
// Each inode has a number, indicating its position on disk.
//
// The kernel keeps a table of in-memory inodes to synchronize
// access to inodes shared by multiple processes. The in-memory
// copies carry bookkeeping that is not on disk: the reference
// count (the Arc strong count) and valid.
//
// * Allocation: an inode is allocated if its on-disk type is
//   non-zero. ITABLE.alloc() allocates; the drop path frees if
//   the reference and link counts have both fallen to zero.
//
// * Referencing in table: an entry is free when no Inode handle
//   points at it. ITABLE.get() finds or creates an entry;
//   dropping the Inode releases it, possibly truncating the
//   on-disk file.
//
// * Valid: the fields in an entry are only correct once valid is
//   set, which happens on the first lock().
//
// * Locked: file system code may only examine and modify the
//   fields of an inode after locking it.
//
// Thus a typical sequence is:
//   let ip = ITABLE.get(dev, inum);
//   let mut guard = ip.lock();
//   ... examine and modify guard ...
//
// lock() is separate from get() so that system calls can keep a
// long-term reference to an inode (as an open file does) and only
// lock it for short periods (e.g., in read()). The separation
// also helps avoid deadlock and races during path lookup.
//
// All calls that may drop the last reference (and every write
// path) must be inside a transaction: truncation and freeing
// touch the disk.

pub static ITABLE: ITable = Mutex::new(array![_ => None; NINODE], "itable");

pub type ITable = Mutex<[Option<Arc<MInode>>; NINODE]>;

// Handle on a cached inode; clones share the cache entry, the
// last drop releases it (iput).
#[derive(Debug)]
pub struct Inode {
    ip: Option<Arc<MInode>>,
}

// In-memory inode: identity plus the sleeplocked on-disk fields.
#[derive(Debug)]
pub struct MInode {
    dev: u32,
    inum: u32,
    data: SleepLock<IData>,
}

#[derive(Debug, Default)]
pub struct IData {
    dev: u32,
    inum: u32,
    valid: bool,
    itype: IType,
    pub major: u16,
    pub minor: u16,
    pub nlink: i16,
    pub size: u32,
    addrs: [u32; NDIRECT + 1],
    pub mtime: RtcDate,
}

impl MInode {
    fn new(dev: u32, inum: u32) -> Self {
        Self {
            dev,
            inum,
            data: SleepLock::new(
                IData {
                    dev,
                    inum,
                    ..Default::default()
                },
                "inode",
            ),
        }
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    // Lock the inode, reading it from disk on first touch.
    pub fn lock(&self) -> SleepLockGuard<'_, IData> {
        let mut guard = self.data.lock();
        if !guard.valid {
            let sb = SB.get().expect("ilock: no superblock");
            let bp = BCACHE.read(self.dev, sb.iblock(self.inum));
            let dip = &bp.align_to::<DInode>()[self.inum as usize % IPB];
            guard.itype = IType::from_i16(dip.itype);
            guard.major = dip.major as u16;
            guard.minor = dip.minor as u16;
            guard.nlink = dip.nlink;
            guard.size = dip.size;
            guard.addrs.copy_from_slice(&dip.addrs);
            guard.mtime = dip.mtime;
            drop(bp);
            guard.valid = true;
            assert!(guard.itype != IType::None, "ilock: no type");
        }
        guard
    }
}

impl Inode {
    fn new(ip: Arc<MInode>) -> Self {
        Self { ip: Some(ip) }
    }

    // Another reference to the same cached inode, the
    // `let ip2 = ip.dup()` idiom.
    pub fn dup(&self) -> Self {
        Self { ip: self.ip.clone() }
    }
}

impl Deref for Inode {
    type Target = MInode;
    fn deref(&self) -> &MInode {
        self.ip.as_ref().unwrap()
    }
}

impl Drop for Inode {
    // iput: must be inside a transaction in case this is the last
    // reference to an unlinked inode.
    fn drop(&mut self) {
        ITABLE.put(self.ip.take().unwrap());
    }
}

impl ITable {
    // Allocate an inode on device dev, marking it in use by
    // giving it a type. Returns an unlocked but referenced inode.
    pub fn alloc(&self, dev: u32, itype: IType) -> Option<Inode> {
        let sb = SB.get().expect("ialloc: no superblock");
        for inum in 1..sb.ninodes {
            let mut bp = BCACHE.read(dev, sb.iblock(inum));
            let dip = &mut bp.align_to_mut::<DInode>()[inum as usize % IPB];
            if dip.itype == IType::None as i16 {
                // a free inode
                *dip = DInode::default();
                dip.itype = itype as i16;
                dip.mtime = x86::cmostime();
                LOG.write(bp);
                return Some(self.get(dev, inum));
            }
        }
        crate::println!("ialloc: no inodes");
        None
    }

    // Find the inode with number inum on device dev and return
    // its in-memory copy. Does not lock it and does not read it
    // from disk.
    pub fn get(&self, dev: u32, inum: u32) -> Inode {
        let mut guard = self.lock();

        let mut empty: Option<usize> = None;
        for (i, slot) in guard.iter().enumerate() {
            match slot {
                Some(ip) if ip.dev == dev && ip.inum == inum => {
                    return Inode::new(Arc::clone(ip));
                }
                None if empty.is_none() => empty = Some(i),
                _ => (),
            }
        }

        // recycle an unused entry
        let slot = match empty {
            Some(i) => i,
            None => panic!("iget: no inodes"),
        };
        let ip = Arc::new(MInode::new(dev, inum));
        guard[slot].replace(Arc::clone(&ip));
        Inode::new(ip)
    }

    // Drop a reference to an in-memory inode. If that was the
    // last reference and the inode has no links, free it (and its
    // content) on disk. Must be inside a transaction for that
    // reason.
    fn put(&self, inode: Arc<MInode>) {
        let guard = self.lock();

        if Arc::strong_count(&inode) == 2 {
            // Only the table and this handle remain, so nobody
            // else can have it locked; this lock won't block.
            let mut idata = inode.data.lock();
            let itable = Mutex::unlock(guard);

            if idata.valid && idata.nlink == 0 {
                // no links and no other references: free it
                idata.trunc();
                idata.itype = IType::None;
                idata.update();
                idata.valid = false;
            }
            drop(idata);

            let mut guard = itable.lock();
            for slot in guard.iter_mut() {
                match slot {
                    Some(ip) if Arc::ptr_eq(&inode, ip) => {
                        slot.take();
                    }
                    _ => (),
                }
            }
        }
    }
}

impl IData {
    pub fn itype(&self) -> IType {
        self.itype
    }

    pub fn set_type(&mut self, itype: IType) {
        self.itype = itype;
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn inum(&self) -> u32 {
        self.inum
    }

    // Copy a modified in-memory inode to disk, inside the current
    // transaction. Must be called after every change to a field
    // that lives on disk.
    pub fn update(&self) {
        let sb = SB.get().expect("iupdate: no superblock");
        let mut bp = BCACHE.read(self.dev, sb.iblock(self.inum));
        let dip = &mut bp.align_to_mut::<DInode>()[self.inum as usize % IPB];
        dip.itype = self.itype as i16;
        dip.major = self.major as i16;
        dip.minor = self.minor as i16;
        dip.nlink = self.nlink;
        dip.size = self.size;
        dip.addrs.copy_from_slice(&self.addrs);
        dip.mtime = self.mtime;
        LOG.write(bp);
    }

    // Truncate the inode: discard all content blocks.
    pub fn trunc(&mut self) {
        for addr in self.addrs.iter_mut().take(NDIRECT) {
            if *addr > 0 {
                bfree(self.dev, *addr);
                *addr = 0;
            }
        }

        if self.addrs[NDIRECT] > 0 {
            let bp = BCACHE.read(self.dev, self.addrs[NDIRECT]);
            for &addr in bp.align_to::<u32>().iter() {
                if addr > 0 {
                    bfree(self.dev, addr);
                }
            }
            drop(bp);
            bfree(self.dev, self.addrs[NDIRECT]);
            self.addrs[NDIRECT] = 0;
        }

        self.size = 0;
        self.update();
    }

    // Inode content.
    //
    // The first NDIRECT blocks of a file live in addrs directly;
    // the next NINDIRECT are listed in the block at addrs[NDIRECT].
    //
    // Return the disk block address of the bn'th block of this
    // file, allocating it if there is none.
    fn bmap(&mut self, bn: u32) -> Result<u32, &'static str> {
        let mut bn = bn as usize;

        if bn < NDIRECT {
            let mut addr = self.addrs[bn];
            if addr == 0 {
                addr = balloc(self.dev);
                self.addrs[bn] = addr;
            }
            return Ok(addr);
        }
        bn -= NDIRECT;

        if bn < NINDIRECT {
            // load the indirect block, allocating if necessary
            let mut addr = self.addrs[NDIRECT];
            if addr == 0 {
                addr = balloc(self.dev);
                self.addrs[NDIRECT] = addr;
            }
            let mut bp = BCACHE.read(self.dev, addr);
            let a = bp.align_to_mut::<u32>();
            addr = a[bn];
            if addr == 0 {
                addr = balloc(self.dev);
                a[bn] = addr;
                LOG.write(bp);
            }
            return Ok(addr);
        }

        Err("bmap: out of range")
    }

    // Copy stat information from the inode. Caller must hold the
    // sleeplock.
    pub fn stat(&self, st: &mut Stat) {
        st.dev = self.dev;
        st.ino = self.inum;
        st.itype = self.itype;
        st.nlink = self.nlink;
        st.size = self.size;
        st.mtime = self.mtime;
    }

    // Read data from the inode. Caller must hold the sleeplock.
    pub fn read(&mut self, mut dst: VirtAddr, off: u32, mut n: usize) -> Result<usize, &'static str> {
        let mut off = off as usize;

        if off > self.size as usize {
            return Err("readi: offset beyond end of file");
        }
        if off + n > self.size as usize {
            n = self.size as usize - off;
        }

        let mut tot = 0;
        while tot < n {
            let bp = BCACHE.read(self.dev, self.bmap((off / BSIZE) as u32)?);
            let m = min(n - tot, BSIZE - off % BSIZE);
            either_copyout(dst, &bp.data[off % BSIZE..off % BSIZE + m])
                .or(Err("readi: copyout failed"))?;
            tot += m;
            off += m;
            dst = dst + m;
        }
        Ok(tot)
    }

    // Write data to the inode, growing it if the write passes the
    // end. Caller must hold the sleeplock and be inside a
    // transaction. Returns the number of bytes written; anything
    // short of the request means an error.
    pub fn write(&mut self, mut src: VirtAddr, off: u32, n: usize) -> Result<usize, &'static str> {
        let mut off = off as usize;

        if off > self.size as usize {
            return Err("writei: offset beyond end of file");
        }
        if off + n > MAXFILE * BSIZE {
            return Err("writei: file too large");
        }

        let mut tot = 0;
        while tot < n {
            let mut bp = BCACHE.read(self.dev, self.bmap((off / BSIZE) as u32)?);
            let m = min(n - tot, BSIZE - off % BSIZE);
            either_copyin(&mut bp.data[off % BSIZE..off % BSIZE + m], src)
                .or(Err("writei: copyin failed"))?;
            LOG.write(bp);
            tot += m;
            off += m;
            src = src + m;
        }

        if off > self.size as usize {
            self.size = off as u32;
        }
        self.mtime = x86::cmostime();

        // Write the inode back even if the size didn't change,
        // because bmap() may have added a block to addrs.
        self.update();

        Ok(tot)
    }

    // Directories.

    fn name_matches(entry: &[u8; FILENAMESZ], name: &str) -> bool {
        let name = name.as_bytes();
        if name.len() > FILENAMESZ {
            return false;
        }
        entry[..name.len()] == *name && entry[name.len()..].iter().all(|&b| b == 0)
    }

    // Look for a directory entry; on a hit return the referenced
    // inode and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &str) -> Option<(Inode, u32)> {
        assert!(self.itype == IType::Dir, "dirlookup not DIR");

        let mut de = DirEnt::default();
        for off in (0..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("dirlookup read");
            if de.inum == 0 {
                continue;
            }
            if Self::name_matches(&de.name, name) {
                // entry matches path element
                return Some((ITABLE.get(self.dev, de.inum as u32), off));
            }
        }
        None
    }

    // Write a new directory entry (name, inum) into this
    // directory, reusing the first free slot or appending.
    pub fn dirlink(&mut self, name: &str, inum: u32) -> Result<(), &'static str> {
        assert!(self.itype == IType::Dir, "dirlink not DIR");
        assert!(name.len() <= FILENAMESZ, "dirlink: name too long");

        // the name must not already be present
        if self.dirlookup(name).is_some() {
            return Err("dirlink: name exists");
        }

        // look for a free entry
        let mut de = DirEnt::default();
        let mut off = self.size;
        for o in (0..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                o,
                size_of::<DirEnt>(),
            )
            .expect("dirlink read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        de.inum = inum as u16;
        de.name = [0; FILENAMESZ];
        de.name[..name.len()].copy_from_slice(name.as_bytes());
        match self.write(
            VirtAddr::Kernel(&de as *const _ as usize),
            off,
            size_of::<DirEnt>(),
        ) {
            Ok(n) if n == size_of::<DirEnt>() => Ok(()),
            _ => Err("dirlink: write failed"),
        }
    }

    // Is the directory empty except for "." and ".."?
    pub fn is_dir_empty(&mut self) -> bool {
        let mut de = DirEnt::default();
        let first = 2 * size_of::<DirEnt>() as u32;
        for off in (first..self.size).step_by(size_of::<DirEnt>()) {
            self.read(
                VirtAddr::Kernel(&mut de as *mut _ as usize),
                off,
                size_of::<DirEnt>(),
            )
            .expect("isdirempty read");
            if de.inum != 0 {
                return false;
            }
        }
        true
    }
}

// Create the path new as a link to the same inode as old.
// Caller must be inside a transaction.
pub fn link(old: &Path, new: &Path) -> Result<(), ()> {
    let (_, ip) = old.namei().ok_or(())?;

    {
        let mut ig = ip.lock();
        if ig.itype == IType::Dir {
            return Err(());
        }
        ig.nlink += 1;
        ig.update();
    }

    let linked = (|| {
        let (name, dp) = new.nameiparent().ok_or(())?;
        let mut dg = dp.lock();
        if dp.dev != ip.dev {
            return Err(());
        }
        dg.dirlink(name, ip.inum).or(Err(()))
    })();

    if linked.is_err() {
        let mut ig = ip.lock();
        ig.nlink -= 1;
        ig.update();
    }
    linked
}

// Remove the directory entry named by path; the inode itself goes
// once the last reference drops. Caller must be inside a
// transaction.
pub fn unlink(path: &Path) -> Result<(), ()> {
    let (name, dp) = path.nameiparent().ok_or(())?;
    let mut dg = dp.lock();

    // cannot unlink "." or ".."
    if name == "." || name == ".." {
        return Err(());
    }

    let (ip, off) = dg.dirlookup(name).ok_or(())?;
    let mut ig = ip.lock();

    assert!(ig.nlink >= 1, "unlink: nlink < 1");
    if ig.itype == IType::Dir && !ig.is_dir_empty() {
        return Err(());
    }

    let de = DirEnt::default();
    let n = dg
        .write(
            VirtAddr::Kernel(&de as *const _ as usize),
            off,
            size_of::<DirEnt>(),
        )
        .expect("unlink: writei");
    assert!(n == size_of::<DirEnt>(), "unlink: short write");

    if ig.itype == IType::Dir {
        // the child's ".." no longer references dp
        dg.nlink -= 1;
        dg.update();
    }

    ig.nlink -= 1;
    ig.update();
    Ok(())
}

// Look up path and create a fresh inode of the given type there,
// or return the existing one when that is compatible. Returns the
// inode unlocked. Caller must be inside a transaction.
pub fn create(path: &Path, itype: IType, major: u16, minor: u16) -> Option<Inode> {
    let (name, dp) = path.nameiparent()?;
    let mut dg = dp.lock();

    if let Some((ip, _)) = dg.dirlookup(name) {
        drop(dg);
        let ig = ip.lock();
        match itype {
            IType::File if ig.itype == IType::File || ig.itype == IType::Device => {
                drop(ig);
                return Some(ip);
            }
            _ => return None,
        }
    }

    let ip = ITABLE.alloc(dp.dev, itype)?;
    let mut ig = ip.lock();
    ig.major = major;
    ig.minor = minor;
    ig.nlink = 1;
    ig.update();

    if itype == IType::Dir {
        // . and .. entries; no extra nlink for "." to avoid a
        // cyclic reference count
        ig.dirlink(".", ip.inum).expect("create dots");
        ig.dirlink("..", dp.inum).expect("create dots");
    }

    dg.dirlink(name, ip.inum).expect("create: dirlink");

    if itype == IType::Dir {
        dg.nlink += 1; // for ".."
        dg.update();
    }

    drop(ig);
    drop(dg);
    Some(ip)
}

// Paths.

// A path slice, a thin wrapper over str the way Path wraps OsStr
// in std.
#[repr(transparent)]
pub struct Path {
    inner: str,
}

impl AsRef<Path> for str {
    fn as_ref(&self) -> &Path {
        Path::new(self)
    }
}

impl Path {
    pub fn new<S: AsRef<str> + ?Sized>(s: &S) -> &Path {
        unsafe { &*(s.as_ref() as *const str as *const Path) }
    }

    // The final component, for naming the process after exec.
    pub fn file_name(&self) -> &str {
        self.inner
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.inner)
    }

    // Split off the next path element.
    //
    //   skip_elem("a/bb/c")  == (Some("a"), Some("bb/c"))
    //   skip_elem("///a//bb") == (Some("a"), Some("/bb"))
    //   skip_elem("a")       == (Some("a"), None)
    //   skip_elem("")        == skip_elem("////") == (None, None)
    //
    // Components longer than FILENAMESZ fail the walk.
    fn skip_elem(&self) -> (Option<&str>, Option<&Path>) {
        let s = self.inner.trim_start_matches('/');
        if s.is_empty() {
            return (None, None);
        }
        match s.split_once('/') {
            Some((name, rest)) if name.len() <= FILENAMESZ => {
                (Some(name), Some(Path::new(rest)))
            }
            None if s.len() <= FILENAMESZ => (Some(s), None),
            _ => (None, None),
        }
    }

    // Walk the path from the root or the current directory,
    // holding each directory's lock only for the lookup of the
    // next component. If parent is set, stop one level early and
    // return the final name alongside the directory.
    //
    // Must be called inside a transaction, since dropping Inode
    // handles may write.
    fn namex(&self, parent: bool) -> Option<(&str, Inode)> {
        let mut ip = if self.inner.starts_with('/') {
            ITABLE.get(ROOTDEV, ROOTINO)
        } else {
            CPUS.my_proc()
                .and_then(|p| unsafe { p.data() }.cwd.as_ref().map(|c| c.dup()))?
        };

        let mut path = self;
        loop {
            let (name, rest) = path.skip_elem();
            let name = match name {
                Some(n) => n,
                // ran out of components
                None => {
                    return if parent { None } else { Some(("", ip)) };
                }
            };

            let mut dg = ip.lock();
            if dg.itype != IType::Dir {
                return None;
            }
            if parent && rest.is_none() {
                // stop one level early
                drop(dg);
                return Some((name, ip));
            }
            let (next, _) = dg.dirlookup(name)?;
            drop(dg);
            ip = next;
            path = rest.unwrap_or_else(|| Path::new(""));
        }
    }

    pub fn namei(&self) -> Option<(&str, Inode)> {
        self.namex(false)
    }

    pub fn nameiparent(&self) -> Option<(&str, Inode)> {
        self.namex(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mkfs::mount_test_image;

    fn with_op<R>(f: impl FnOnce() -> R) -> R {
        LOG.begin_op();
        let r = f();
        LOG.end_op();
        r
    }

    fn pattern(bn: usize) -> [u8; BSIZE] {
        let mut buf = [0u8; BSIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = (bn * 7 + i) as u8;
        }
        buf
    }

    #[test]
    fn round_trip_across_direct_and_indirect_blocks() {
        mount_test_image();
        let ip = with_op(|| create(Path::new("/bigfile"), IType::File, 0, 0).unwrap());

        // 22 blocks crosses from the direct range into the
        // indirect block; one transaction per block stays far
        // inside the log budget
        for bn in 0..22usize {
            with_op(|| {
                let mut ig = ip.lock();
                let buf = pattern(bn);
                assert_eq!(
                    ig.write(
                        VirtAddr::Kernel(buf.as_ptr() as usize),
                        (bn * BSIZE) as u32,
                        BSIZE
                    ),
                    Ok(BSIZE)
                );
            });
        }

        {
            let mut ig = ip.lock();
            assert_eq!(ig.size as usize, 22 * BSIZE);
            for &bn in &[0usize, 5, 17, 18, 21] {
                let mut back = [0u8; BSIZE];
                assert_eq!(
                    ig.read(
                        VirtAddr::Kernel(back.as_mut_ptr() as usize),
                        (bn * BSIZE) as u32,
                        BSIZE
                    ),
                    Ok(BSIZE)
                );
                assert_eq!(back[..], pattern(bn)[..]);
            }
        }
        with_op(|| drop(ip));
    }

    #[test]
    fn unaligned_io_spans_block_boundaries() {
        mount_test_image();
        let ip = with_op(|| create(Path::new("/straddle"), IType::File, 0, 0).unwrap());

        let zeroes = [0u8; BSIZE];
        with_op(|| {
            let mut ig = ip.lock();
            ig.write(VirtAddr::Kernel(zeroes.as_ptr() as usize), 0, BSIZE)
                .unwrap();
            ig.write(
                VirtAddr::Kernel(b"hello".as_ptr() as usize),
                (BSIZE - 2) as u32,
                5,
            )
            .unwrap();
        });

        let mut back = [0u8; 5];
        let mut ig = ip.lock();
        assert_eq!(
            ig.read(
                VirtAddr::Kernel(back.as_mut_ptr() as usize),
                (BSIZE - 2) as u32,
                5
            ),
            Ok(5)
        );
        assert_eq!(&back, b"hello");
        assert_eq!(ig.size as usize, BSIZE + 3);
        drop(ig);
        with_op(|| drop(ip));
    }

    #[test]
    fn trunc_releases_every_block() {
        mount_test_image();
        let ip = with_op(|| create(Path::new("/doomed"), IType::File, 0, 0).unwrap());

        for bn in 0..(NDIRECT + 2) {
            with_op(|| {
                let mut ig = ip.lock();
                let buf = pattern(bn);
                ig.write(
                    VirtAddr::Kernel(buf.as_ptr() as usize),
                    (bn * BSIZE) as u32,
                    BSIZE,
                )
                .unwrap();
            });
        }

        with_op(|| {
            let mut ig = ip.lock();
            assert!(ig.addrs[NDIRECT] != 0); // the indirect block exists
            ig.trunc();
            assert_eq!(ig.size, 0);
            assert!(ig.addrs.iter().all(|&a| a == 0));
        });
        with_op(|| drop(ip));
    }

    #[test]
    fn mtime_moves_forward_on_write() {
        mount_test_image();
        let ip = with_op(|| create(Path::new("/stamped"), IType::File, 0, 0).unwrap());
        with_op(|| {
            let mut ig = ip.lock();
            ig.write(VirtAddr::Kernel(b"x".as_ptr() as usize), 0, 1)
                .unwrap();
            // the RTC has a real date in it
            assert!(ig.mtime.year >= 2000);
        });
        with_op(|| drop(ip));
    }

    #[test]
    fn dirlookup_reports_entry_offsets() {
        mount_test_image();
        let dp = with_op(|| create(Path::new("/dltest"), IType::Dir, 0, 0).unwrap());
        let f = with_op(|| create(Path::new("/dltest/child"), IType::File, 0, 0).unwrap());

        let mut dg = dp.lock();
        // "." and ".." occupy the first two slots
        let (dot, off) = dg.dirlookup(".").unwrap();
        assert_eq!(dot.inum(), dp.inum());
        assert_eq!(off, 0);
        let (child, off) = dg.dirlookup("child").unwrap();
        assert_eq!(child.inum(), f.inum());
        assert_eq!(off as usize % size_of::<DirEnt>(), 0);
        assert!(dg.dirlookup("absent").is_none());
        drop(dg);

        with_op(|| {
            drop(child);
            drop(dot);
            drop(f);
            drop(dp);
        });
    }

    #[test]
    fn namei_walks_and_respects_dotdot() {
        mount_test_image();
        with_op(|| {
            create(Path::new("/nw1"), IType::Dir, 0, 0).unwrap();
            create(Path::new("/nw1/nw2"), IType::Dir, 0, 0).unwrap();
            create(Path::new("/nw1/nw2/leaf"), IType::File, 0, 0).unwrap();
        });

        with_op(|| {
            let (_, leaf) = Path::new("/nw1/nw2/leaf").namei().unwrap();
            let (name, parent) = Path::new("/nw1/nw2/leaf").nameiparent().unwrap();
            assert_eq!(name, "leaf");
            let (via_dotdot, _) = {
                let mut pg = parent.lock();
                let hit = pg.dirlookup("leaf").unwrap();
                drop(pg);
                hit
            };
            assert_eq!(via_dotdot.inum(), leaf.inum());

            // .. climbs back up through the directory entry
            let (_, again) = Path::new("/nw1/nw2/../nw2/leaf").namei().unwrap();
            assert_eq!(again.inum(), leaf.inum());

            assert!(Path::new("/nw1/missing").namei().is_none());
            // root resolves, and has no parent to name
            assert!(Path::new("/").namei().is_some());
            assert!(Path::new("/").nameiparent().is_none());
        });
    }

    #[test]
    fn link_then_unlink_keeps_content_reachable() {
        mount_test_image();
        let ip = with_op(|| create(Path::new("/ln_a"), IType::File, 0, 0).unwrap());
        with_op(|| {
            let mut ig = ip.lock();
            ig.write(VirtAddr::Kernel(b"x".as_ptr() as usize), 0, 1)
                .unwrap();
        });
        with_op(|| drop(ip));

        with_op(|| link(Path::new("/ln_a"), Path::new("/ln_b")).unwrap());
        with_op(|| {
            let (_, ip) = Path::new("/ln_b").namei().unwrap();
            assert_eq!(ip.lock().nlink, 2);
        });

        with_op(|| unlink(Path::new("/ln_a")).unwrap());
        with_op(|| assert!(Path::new("/ln_a").namei().is_none()));

        with_op(|| {
            let (_, ip) = Path::new("/ln_b").namei().unwrap();
            let mut ig = ip.lock();
            assert_eq!(ig.nlink, 1);
            let mut b = [0u8; 1];
            assert_eq!(
                ig.read(VirtAddr::Kernel(b.as_mut_ptr() as usize), 0, 1),
                Ok(1)
            );
            assert_eq!(&b, b"x");
        });
        with_op(|| unlink(Path::new("/ln_b")).unwrap());
    }

    #[test]
    fn linking_a_directory_is_refused() {
        mount_test_image();
        with_op(|| {
            create(Path::new("/ld_dir"), IType::Dir, 0, 0).unwrap();
            assert!(link(Path::new("/ld_dir"), Path::new("/ld_alias")).is_err());
            assert!(Path::new("/ld_alias").namei().is_none());
        });
    }

    #[test]
    fn unlink_refuses_nonempty_directories() {
        mount_test_image();
        with_op(|| {
            create(Path::new("/ud"), IType::Dir, 0, 0).unwrap();
            create(Path::new("/ud/f"), IType::File, 0, 0).unwrap();
        });

        with_op(|| assert!(unlink(Path::new("/ud")).is_err()));
        with_op(|| unlink(Path::new("/ud/f")).unwrap());
        with_op(|| unlink(Path::new("/ud")).unwrap());
        with_op(|| assert!(Path::new("/ud").namei().is_none()));
    }

    #[test]
    fn inode_cache_holds_one_entry_per_inum() {
        mount_test_image();
        with_op(|| {
            let (_, a) = Path::new("/").namei().unwrap();
            let (_, b) = Path::new("/").namei().unwrap();
            // both handles resolve to the same cached inode
            assert!(Arc::ptr_eq(a.ip.as_ref().unwrap(), b.ip.as_ref().unwrap()));
            let cached = ITABLE
                .lock()
                .iter()
                .filter(|e| match e {
                    Some(ip) => ip.dev == ROOTDEV && ip.inum == ROOTINO,
                    None => false,
                })
                .count();
            assert_eq!(cached, 1);
        });
    }

    #[test]
    fn skip_elem_grammar() {
        let cases: &[(&str, Option<&str>, Option<&str>)] = &[
            ("a/bb/c", Some("a"), Some("bb/c")),
            ("///a//bb", Some("a"), Some("/bb")),
            ("a", Some("a"), None),
            ("", None, None),
            ("////", None, None),
            ("averylongname14", None, None), // 15 chars: too long
        ];
        for &(input, name, rest) in cases {
            let (n, r) = Path::new(input).skip_elem();
            assert_eq!(n, name, "input {:?}", input);
            assert_eq!(r.map(|p| &p.inner), rest, "input {:?}", input);
        }
    }
}

// Disk request queue.
//
// iderw queues a locked buffer and sleeps until the completion
// handler has satisfied it; the head of the queue is the one
// request in flight. On the metal the backend is the PIO ATA
// interface and completions arrive as IRQ 14; hosted builds
// drive a RAM-backed block store and complete requests in line.

use crate::bio::{BufData, BufGuard, BCACHE};
use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::proc::{self, PTABLE};
use crate::spinlock::Mutex;
use core::ptr::{addr_of, addr_of_mut};
use core::sync::atomic::Ordering;

pub static IDE: Ide = Ide {
    queue: Mutex::new(Queue::new(), "ide"),
};

pub struct Ide {
    queue: Mutex<Queue>,
}

#[derive(Clone, Copy)]
struct Request {
    idx: usize, // buffer slot, for the dirty flag
    dev: u32,
    blockno: u32,
    write: bool,
    data: *mut BufData,
}

// FIFO of pending requests; the element at head is on the wire.
struct Queue {
    reqs: [Option<Request>; NBUF],
    head: usize,
    len: usize,
}

unsafe impl Send for Queue {}

impl Queue {
    const fn new() -> Self {
        Self {
            reqs: [None; NBUF],
            head: 0,
            len: 0,
        }
    }

    fn push(&mut self, r: Request) {
        assert!(self.len < NBUF, "ide queue overflow");
        self.reqs[(self.head + self.len) % NBUF] = Some(r);
        self.len += 1;
    }

    fn front(&self) -> Option<Request> {
        if self.len == 0 {
            None
        } else {
            self.reqs[self.head]
        }
    }

    fn pop(&mut self) {
        assert!(self.len > 0, "ide queue underflow");
        self.reqs[self.head] = None;
        self.head = (self.head + 1) % NBUF;
        self.len -= 1;
    }
}

// The requester owns the buffer's sleeplock for the whole wait,
// so nobody else touches the payload; the completion handler is
// the one writer in between, reaching it through the raw pointer
// captured at enqueue time. valid goes through volatile accesses
// for that reason.
fn buf_valid(data: *mut BufData) -> bool {
    unsafe { addr_of!((*data).valid).read_volatile() }
}

fn set_buf_valid(data: *mut BufData) {
    unsafe { addr_of_mut!((*data).valid).write_volatile(true) };
}

impl Ide {
    // Sync the locked buffer b with the disk: a write if write is
    // set, otherwise a read into the buffer. Returns once the
    // buffer is valid and no longer owed to the disk.
    pub fn rw(&self, b: &mut BufGuard, write: bool) {
        let data: *mut BufData = {
            let d: &mut BufData = &mut *b;
            d as *mut BufData
        };
        let req = Request {
            idx: b.index(),
            dev: b.dev(),
            blockno: b.blockno(),
            write,
            data,
        };

        if !BCACHE.dirty_flag(req.idx).load(Ordering::Acquire) && buf_valid(data) {
            panic!("iderw: nothing to do");
        }

        let mut q = self.queue.lock();
        let was_empty = q.len == 0;
        q.push(req);
        if was_empty {
            start(&mut q);
        }

        // wait for the completion handler to finish with the buffer
        while !(buf_valid(data) && !BCACHE.dirty_flag(req.idx).load(Ordering::Acquire)) {
            q = proc::sleep(data as usize, q);
        }
    }

    // Completion interrupt: the head request is done. Finish it,
    // wake its waiters, put the next one on the wire.
    #[cfg(target_os = "none")]
    pub fn intr(&self) {
        let mut q = self.queue.lock();
        let req = match q.front() {
            Some(req) => req,
            None => return,
        };
        q.pop();

        if !req.write && hw::wait_ready(true).is_ok() {
            unsafe {
                crate::x86::insl(
                    hw::REG_DATA,
                    addr_of_mut!((*req.data).data) as *mut u32,
                    BSIZE / 4,
                )
            };
        }
        set_buf_valid(req.data);
        BCACHE.dirty_flag(req.idx).store(false, Ordering::Release);
        PTABLE.wakeup(req.data as usize);

        if q.front().is_some() {
            start(&mut q);
        }
    }

    // Hosted builds have no disk interrupt; completions happen in
    // start(). The trap path still compiles against intr().
    #[cfg(not(target_os = "none"))]
    pub fn intr(&self) {}
}

#[cfg(target_os = "none")]
mod hw {
    use super::*;
    use crate::param::FSSIZE;
    use crate::x86::{inb, outb, outsl};

    pub const REG_DATA: u16 = 0x1F0;

    const IDE_BSY: u8 = 0x80;
    const IDE_DRDY: u8 = 0x40;
    const IDE_DF: u8 = 0x20;
    const IDE_ERR: u8 = 0x01;

    const IDE_CMD_READ: u8 = 0x20;
    const IDE_CMD_WRITE: u8 = 0x30;

    // Poll the status register until the drive is ready.
    pub fn wait_ready(checkerr: bool) -> Result<(), ()> {
        loop {
            let r = unsafe { inb(0x1F7) };
            if r & (IDE_BSY | IDE_DRDY) == IDE_DRDY {
                if checkerr && r & (IDE_DF | IDE_ERR) != 0 {
                    return Err(());
                }
                return Ok(());
            }
        }
    }

    pub fn init() {
        let _ = wait_ready(false);
        // disk 0 must be there, the kernel booted off it; probing
        // disk 1 is the platform's business.
    }

    // Put the request at the head of the queue on the wire.
    // Caller holds the queue lock.
    pub fn start(q: &mut Queue) {
        let req = q.front().expect("idestart");
        assert!(req.blockno < FSSIZE as u32, "idestart: incorrect blockno");

        let sector = req.blockno; // BSIZE == sector size
        let _ = wait_ready(false);
        unsafe {
            outb(0x3F6, 0); // generate interrupt
            outb(0x1F2, 1); // number of sectors
            outb(0x1F3, (sector & 0xFF) as u8);
            outb(0x1F4, ((sector >> 8) & 0xFF) as u8);
            outb(0x1F5, ((sector >> 16) & 0xFF) as u8);
            outb(
                0x1F6,
                0xE0 | (((req.dev & 1) << 4) as u8) | (((sector >> 24) & 0x0F) as u8),
            );
            if req.write {
                outb(0x1F7, IDE_CMD_WRITE);
                outsl(REG_DATA, addr_of!((*req.data).data) as *const u32, BSIZE / 4);
            } else {
                outb(0x1F7, IDE_CMD_READ);
            }
        }
    }
}

#[cfg(target_os = "none")]
use hw::start;

#[cfg(target_os = "none")]
pub use hw::init;

// Hosted backend: RAM-backed block stores, one per device
// number, installed by the test bring-up. A store can be told to
// start dropping writes, which is how the crash tests freeze the
// on-disk state at an arbitrary point mid-commit.
#[cfg(not(target_os = "none"))]
mod hosted {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::vec::Vec;

    pub struct RamDisk {
        inner: StdMutex<RamInner>,
    }

    struct RamInner {
        blocks: Vec<[u8; BSIZE]>,
        // None: reliable. Some(n): n more writes land, the rest
        // are silently lost, as if the machine lost power.
        writes_left: Option<usize>,
    }

    impl RamDisk {
        pub fn new(nblocks: usize) -> Self {
            Self {
                inner: StdMutex::new(RamInner {
                    blocks: vec![[0; BSIZE]; nblocks],
                    writes_left: None,
                }),
            }
        }

        pub fn from_image(img: &[u8]) -> Self {
            assert!(img.len() % BSIZE == 0, "ramdisk: ragged image");
            let blocks = img
                .chunks_exact(BSIZE)
                .map(|c| {
                    let mut b = [0u8; BSIZE];
                    b.copy_from_slice(c);
                    b
                })
                .collect();
            Self {
                inner: StdMutex::new(RamInner {
                    blocks,
                    writes_left: None,
                }),
            }
        }

        // Let n more writes through, then drop everything.
        pub fn fail_after(&self, n: usize) {
            self.inner.lock().unwrap().writes_left = Some(n);
        }

        pub fn heal(&self) {
            self.inner.lock().unwrap().writes_left = None;
        }

        pub fn read_block(&self, bn: u32, dst: &mut [u8; BSIZE]) {
            let inner = self.inner.lock().unwrap();
            dst.copy_from_slice(&inner.blocks[bn as usize]);
        }

        pub fn write_block(&self, bn: u32, src: &[u8; BSIZE]) {
            let mut inner = self.inner.lock().unwrap();
            match inner.writes_left {
                Some(0) => return, // power is gone
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            inner.blocks[bn as usize].copy_from_slice(src);
        }
    }

    const NDISKS: usize = 8;
    static RAMDISKS: StdMutex<[Option<Arc<RamDisk>>; NDISKS]> =
        StdMutex::new([None, None, None, None, None, None, None, None]);

    pub fn install_ramdisk(dev: u32, disk: Arc<RamDisk>) {
        let mut disks = RAMDISKS.lock().unwrap();
        assert!(
            disks[dev as usize].is_none(),
            "ide: dev {} already installed",
            dev
        );
        disks[dev as usize] = Some(disk);
    }

    fn disk(dev: u32) -> Arc<RamDisk> {
        RAMDISKS.lock().unwrap()[dev as usize]
            .as_ref()
            .expect("ide: no disk for dev")
            .clone()
    }

    pub fn init() {}

    // Drain the queue synchronously; each request completes
    // before the next starts, like the interrupt path would.
    pub fn start(q: &mut Queue) {
        while let Some(req) = q.front() {
            let d = disk(req.dev);
            unsafe {
                let buf = &mut *addr_of_mut!((*req.data).data);
                if req.write {
                    d.write_block(req.blockno, buf);
                } else {
                    d.read_block(req.blockno, buf);
                }
            }
            set_buf_valid(req.data);
            BCACHE.dirty_flag(req.idx).store(false, Ordering::Release);
            PTABLE.wakeup(req.data as usize);
            q.pop();
        }
    }
}

#[cfg(not(target_os = "none"))]
use hosted::start;

#[cfg(not(target_os = "none"))]
pub use hosted::{init, install_ramdisk, RamDisk};

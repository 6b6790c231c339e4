// Buffer cache.
//
// The buffer cache holds cached copies of disk block contents in
// a fixed arena of NBUF slots. Caching disk blocks in memory
// reduces the number of disk reads and also provides a
// synchronization point for blocks used by multiple processes.
//
// Interface:
// * To get a buffer for a particular disk block, call BCACHE.read.
// * After changing buffer data, call BufGuard::write to queue it
//   for the disk.
// * Dropping the guard releases the buffer; do not keep buffers
//   longer than necessary.
//
// The recency list is threaded through index arrays with slot
// NBUF acting as the sentinel: next[] runs most-recently used
// first, prev[] runs least-recently used first. One spinlock
// guards the list and the reference counts; a sleeplock per slot
// guards the payload bytes.

use crate::fs::BSIZE;
use crate::ide::IDE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::Mutex;
use array_macro::array;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub static BCACHE: Bcache = Bcache::new();

const SENTINEL: usize = NBUF;

pub struct Bcache {
    ctl: Mutex<Ctl>,
    bufs: [BufSlot; NBUF],
}

pub(crate) struct BufSlot {
    data: SleepLock<BufData>,
    // Pinned or queued for the disk; cleared by the completion
    // handler. Lives outside the sleeplock so the recycler and
    // the interrupt path can read it.
    dirty: AtomicBool,
}

// repr(C): the disk backend reaches the payload through a raw
// pointer while the requester sleeps. The alignment lets callers
// view the payload as the on-disk structures it holds.
#[repr(C, align(8))]
pub struct BufData {
    pub data: [u8; BSIZE],
    pub valid: bool, // has data been read from disk?
}

#[derive(Clone, Copy)]
struct Meta {
    dev: u32,
    blockno: u32,
    refcnt: usize,
}

struct Ctl {
    meta: [Meta; NBUF],
    next: [usize; NBUF + 1],
    prev: [usize; NBUF + 1],
    linked: bool,
}

impl BufData {
    const fn new() -> Self {
        Self {
            data: [0; BSIZE],
            valid: false,
        }
    }
}

impl Deref for BufData {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Ctl {
    const fn new() -> Self {
        Self {
            meta: [Meta { dev: 0, blockno: 0, refcnt: 0 }; NBUF],
            next: [SENTINEL; NBUF + 1],
            prev: [SENTINEL; NBUF + 1],
            linked: false,
        }
    }

    fn unlink(&mut self, i: usize) {
        let (p, n) = (self.prev[i], self.next[i]);
        self.next[p] = n;
        self.prev[n] = p;
    }

    fn push_front(&mut self, i: usize) {
        let n = self.next[SENTINEL];
        self.next[i] = n;
        self.prev[i] = SENTINEL;
        self.prev[n] = i;
        self.next[SENTINEL] = i;
    }
}

// A locked buffer: holding one is exclusive access to the block's
// bytes. Dropping it is brelse.
pub struct BufGuard {
    idx: usize,
    dev: u32,
    blockno: u32,
    guard: Option<SleepLockGuard<'static, BufData>>,
}

impl Deref for BufGuard {
    type Target = BufData;
    fn deref(&self) -> &BufData {
        self.guard.as_ref().unwrap()
    }
}

impl DerefMut for BufGuard {
    fn deref_mut(&mut self) -> &mut BufData {
        self.guard.as_mut().unwrap()
    }
}

impl BufGuard {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    // Write the buffer's content to disk and wait for it.
    pub fn write(&mut self) {
        BCACHE.bufs[self.idx].dirty.store(true, Ordering::Release);
        IDE.rw(self, true);
    }

    // Keep the slot from being recycled until the block reaches
    // its home location: the dirty bit doubles as the pin, the
    // disk completion after commit drops it.
    pub(crate) fn pin(&self) {
        BCACHE.bufs[self.idx].dirty.store(true, Ordering::Release);
    }

    pub(crate) fn index(&self) -> usize {
        self.idx
    }

    // View the payload as a slice of on-disk records.
    pub fn align_to<U>(&self) -> &[U] {
        let (head, body, _) = unsafe { self.data.align_to::<U>() };
        assert!(head.is_empty(), "buffer data was not aligned");
        body
    }

    pub fn align_to_mut<U>(&mut self) -> &mut [U] {
        let (head, body, _) = unsafe { self.guard.as_mut().unwrap().data.align_to_mut::<U>() };
        assert!(head.is_empty(), "buffer data was not aligned");
        body
    }
}

impl Drop for BufGuard {
    fn drop(&mut self) {
        // release the payload first, then the list state
        drop(self.guard.take());
        let mut ctl = BCACHE.ctl.lock();
        let m = &mut ctl.meta[self.idx];
        m.refcnt -= 1;
        if m.refcnt == 0 {
            // no one is waiting for it; most recently used now
            ctl.unlink(self.idx);
            ctl.push_front(self.idx);
        }
    }
}

impl Bcache {
    const fn new() -> Self {
        Self {
            ctl: Mutex::new(Ctl::new(), "bcache"),
            bufs: array![_ => BufSlot {
                data: SleepLock::new(BufData::new(), "buffer"),
                dirty: AtomicBool::new(false),
            }; NBUF],
        }
    }

    pub(crate) fn dirty_flag(&self, idx: usize) -> &AtomicBool {
        &self.bufs[idx].dirty
    }

    // Look through the cache for block on device dev, recycling
    // the least recently used clean buffer on a miss.
    fn get(&self, dev: u32, blockno: u32) -> (usize, bool) {
        let mut ctl = self.ctl.lock();
        assert!(ctl.linked, "bcache: not initialized");

        // Is the block already cached?
        let mut i = ctl.next[SENTINEL];
        while i != SENTINEL {
            if ctl.meta[i].dev == dev && ctl.meta[i].blockno == blockno {
                ctl.meta[i].refcnt += 1;
                return (i, true);
            }
            i = ctl.next[i];
        }

        // Not cached; recycle from the cold end. Buffers that are
        // referenced or still owed to the disk are off limits.
        let mut i = ctl.prev[SENTINEL];
        while i != SENTINEL {
            if ctl.meta[i].refcnt == 0 && !self.bufs[i].dirty.load(Ordering::Acquire) {
                ctl.meta[i] = Meta { dev, blockno, refcnt: 1 };
                return (i, false);
            }
            i = ctl.prev[i];
        }
        panic!("bget: no buffers");
    }

    // Return a locked buffer with the contents of the indicated
    // block.
    pub fn read(&'static self, dev: u32, blockno: u32) -> BufGuard {
        let (idx, cached) = self.get(dev, blockno);
        let mut guard = self.bufs[idx].data.lock();
        if !cached {
            guard.valid = false;
        }
        let mut b = BufGuard {
            idx,
            dev,
            blockno,
            guard: Some(guard),
        };
        if !b.valid {
            IDE.rw(&mut b, false);
            assert!(b.valid, "bread");
        }
        b
    }
}

// Hand every buffer to the recency list. No-op after the first
// call so each hosted test can run the bring-up.
pub fn init() {
    let mut ctl = BCACHE.ctl.lock();
    if ctl.linked {
        return;
    }
    for i in 0..NBUF {
        ctl.push_front(i);
    }
    ctl.linked = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ide::RamDisk;
    use std::sync::Arc;

    const DEV: u32 = 7;

    fn setup() {
        crate::kalloc::host_init();
        init();
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            crate::ide::install_ramdisk(DEV, Arc::new(RamDisk::new(64)));
        });
    }

    #[test]
    fn cache_key_is_unique_per_block() {
        setup();
        // while referenced, exactly one slot may carry the key
        let a = BCACHE.read(DEV, 3);
        assert_eq!((a.dev(), a.blockno()), (DEV, 3));
        let ctl = BCACHE.ctl.lock();
        let matches = (0..NBUF)
            .filter(|&i| ctl.meta[i].dev == DEV && ctl.meta[i].blockno == 3)
            .count();
        assert_eq!(matches, 1);
    }

    #[test]
    fn written_blocks_survive_eviction() {
        setup();
        {
            let mut b = BCACHE.read(DEV, 10);
            b.data[0..4].copy_from_slice(b"abcd");
            b.write();
        }
        // touch enough other blocks to push block 10 out
        for bn in 20..20 + NBUF as u32 {
            let _ = BCACHE.read(DEV, bn);
        }
        let b = BCACHE.read(DEV, 10);
        assert_eq!(&b.data[0..4], b"abcd");
    }

    #[test]
    fn pinned_buffers_are_never_recycled() {
        setup();
        {
            let mut b = BCACHE.read(DEV, 12);
            b.data[0] = 0x5A; // cache-only marker
            b.pin();
        }
        // a full sweep of other blocks must leave the pinned slot
        for bn in 20..20 + NBUF as u32 {
            let _ = BCACHE.read(DEV, bn);
        }
        let b = BCACHE.read(DEV, 12);
        assert_eq!(b.data[0], 0x5A);
        // unpin so the slot returns to the pool
        BCACHE.dirty_flag(b.index()).store(false, Ordering::Release);
    }

    #[test]
    fn exclusive_while_held() {
        setup();
        let mut a = BCACHE.read(DEV, 55);
        a.data[0] = 1;
        let t = {
            let h = std::thread::spawn(|| {
                let mut b = BCACHE.read(DEV, 55);
                b.data[0] = 2;
                b.blockno()
            });
            std::thread::sleep(std::time::Duration::from_millis(10));
            // still ours: the writer is parked on the sleeplock
            assert_eq!(a.data[0], 1);
            drop(a);
            h
        };
        assert_eq!(t.join().unwrap(), 55);
        let b = BCACHE.read(DEV, 55);
        assert_eq!(b.data[0], 2);
    }
}

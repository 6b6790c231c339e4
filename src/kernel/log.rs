// Simple logging that allows concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system
// calls. The logging system only commits when there are no FS
// system calls active. Thus there is never any reasoning required
// about whether a commit might write an uncommitted system call's
// updates to disk.
//
// A system call should call begin_op()/end_op() to mark its start
// and end. Usually begin_op() just increments the count of
// in-progress FS system calls and returns. But if it thinks the
// log is close to running out, it sleeps until the last
// outstanding end_op() commits.
//
// The log is a physical re-do log containing disk blocks. The
// on-disk format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

use crate::bio::{BufGuard, BCACHE};
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS};
use crate::proc::{self, PTABLE};
use crate::spinlock::Mutex;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

pub static LOG: Log = Log::new();

// Contents of the header block, used both on disk and to track
// logged block numbers in memory before commit. n > 0 on disk
// means a committed transaction is waiting to be installed.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeader>() <= BSIZE);

impl LogHeader {
    const fn empty() -> Self {
        Self {
            n: 0,
            block: [0; LOGSIZE],
        }
    }
}

struct LogState {
    start: u32,
    size: u32,
    dev: u32,
    outstanding: u32, // how many FS sys calls are executing
    committing: bool, // in commit(), please wait
    lh: LogHeader,
}

pub struct Log {
    state: Mutex<LogState>,
}

impl Log {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(
                LogState {
                    start: 0,
                    size: 0,
                    dev: 0,
                    outstanding: 0,
                    committing: false,
                    lh: LogHeader::empty(),
                },
                "log",
            ),
        }
    }

    fn chan(&self) -> usize {
        self as *const _ as usize
    }

    // Bind the log to its on-disk window and run crash recovery.
    pub fn init(&self, dev: u32, sb: &SuperBlock) {
        {
            let mut st = self.state.lock();
            st.start = sb.logstart;
            st.size = sb.nlog;
            st.dev = dev;
        }
        self.recover();
    }

    fn recover(&self) {
        let (dev, start) = {
            let st = self.state.lock();
            (st.dev, st.start)
        };
        let lh = read_head(dev, start);
        // if committed, copy from log to disk
        install_trans(dev, start, &lh);
        // clear the log
        write_head(dev, start, &LogHeader::empty());
    }

    // Called at the start of each FS system call.
    pub fn begin_op(&self) {
        let mut st = self.state.lock();
        loop {
            if st.committing {
                st = proc::sleep(self.chan(), st);
            } else if st.lh.n as usize + (st.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
                // this op might exhaust log space; wait for commit
                st = proc::sleep(self.chan(), st);
            } else {
                st.outstanding += 1;
                break;
            }
        }
    }

    // Called at the end of each FS system call; commits if this
    // was the last outstanding operation.
    pub fn end_op(&self) {
        let mut pending = None;

        {
            let mut st = self.state.lock();
            st.outstanding -= 1;
            assert!(!st.committing, "log.committing");
            if st.outstanding == 0 {
                st.committing = true;
                pending = Some((st.dev, st.start, st.lh));
            } else {
                // begin_op() may be waiting for log space, and
                // decrementing outstanding has decreased the
                // amount of reserved space.
                PTABLE.wakeup(self.chan());
            }
        }

        if let Some((dev, start, lh)) = pending {
            // commit without holding locks, since sleeping with
            // a spinlock held is not allowed
            commit(dev, start, &lh);
            let mut st = self.state.lock();
            st.lh.n = 0;
            st.committing = false;
            drop(st);
            PTABLE.wakeup(self.chan());
        }
    }

    // Caller has modified b's data and is done with the buffer;
    // record its block number and pin it in the cache until the
    // commit installs it. A typical use is:
    //   let mut bp = BCACHE.read(...);
    //   // modify bp.data
    //   LOG.write(bp);
    pub fn write(&self, b: BufGuard) {
        let mut st = self.state.lock();
        assert!(
            (st.lh.n as usize) < LOGSIZE && st.lh.n < st.size - 1,
            "too big a transaction"
        );
        assert!(st.outstanding >= 1, "log write outside of trans");

        let blockno = b.blockno();
        for i in 0..st.lh.n as usize {
            if st.lh.block[i] == blockno {
                // log absorption: one slot per block per transaction
                return;
            }
        }
        let n = st.lh.n as usize;
        st.lh.block[n] = blockno;
        st.lh.n += 1;
        b.pin();
    }
}

// Read the log header from disk.
fn read_head(dev: u32, start: u32) -> LogHeader {
    let buf = BCACHE.read(dev, start);
    buf.align_to::<LogHeader>()[0]
}

// Write the in-memory header to disk. This is the point at which
// the current transaction commits.
fn write_head(dev: u32, start: u32, lh: &LogHeader) {
    let mut buf = BCACHE.read(dev, start);
    buf.align_to_mut::<LogHeader>()[0] = *lh;
    buf.write();
}

// Copy modified blocks from the cache to their log slots.
fn write_log(dev: u32, start: u32, lh: &LogHeader) {
    for tail in 0..lh.n {
        let from = BCACHE.read(dev, lh.block[tail as usize]); // cache block
        let mut to = BCACHE.read(dev, start + tail + 1); // log slot
        to.data.copy_from_slice(&from.data);
        to.write();
    }
}

// Copy committed blocks from their log slots to their home
// locations. The disk write that lands each home block also
// clears its dirty pin.
fn install_trans(dev: u32, start: u32, lh: &LogHeader) {
    for tail in 0..lh.n {
        let lbuf = BCACHE.read(dev, start + tail + 1); // log block
        let mut dbuf = BCACHE.read(dev, lh.block[tail as usize]); // dst
        dbuf.data.copy_from_slice(&lbuf.data);
        dbuf.write();
    }
}

fn commit(dev: u32, start: u32, lh: &LogHeader) {
    if lh.n > 0 {
        write_log(dev, start, lh); // modified blocks from cache to log
        write_head(dev, start, lh); // header to disk -- the real commit
        install_trans(dev, start, lh); // now install to home locations
        write_head(dev, start, &LogHeader::empty()); // erase the transaction
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ide::{install_ramdisk, RamDisk};
    use std::sync::Arc;

    const LOGSTART: u32 = 2;

    fn test_sb() -> SuperBlock {
        let mut sb = SuperBlock::default();
        sb.logstart = LOGSTART;
        sb.nlog = (LOGSIZE + 1) as u32;
        sb
    }

    fn bring_up(dev: u32) -> Arc<RamDisk> {
        crate::kalloc::host_init();
        crate::bio::init();
        let disk = Arc::new(RamDisk::new(128));
        install_ramdisk(dev, Arc::clone(&disk));
        disk
    }

    #[test]
    fn commit_installs_blocks_and_clears_header() {
        const DEV: u32 = 5;
        let disk = bring_up(DEV);
        let log = Log::new();
        log.init(DEV, &test_sb());

        log.begin_op();
        {
            let mut b = BCACHE.read(DEV, 50);
            b.data[0] = 0xAA;
            log.write(b);
        }
        {
            // a second write to the same block is absorbed
            let mut b = BCACHE.read(DEV, 50);
            b.data[1] = 0xBB;
            log.write(b);
            assert_eq!(log.state.lock().lh.n, 1);
        }
        log.end_op();

        // home block carries both bytes
        let mut home = [0u8; BSIZE];
        disk.read_block(50, &mut home);
        assert_eq!((home[0], home[1]), (0xAA, 0xBB));

        // the log slot matches the home location exactly
        let mut slot = [0u8; BSIZE];
        disk.read_block(LOGSTART + 1, &mut slot);
        assert_eq!(&slot[..], &home[..]);

        // and the on-disk header was cleared again
        let mut head = [0u8; BSIZE];
        disk.read_block(LOGSTART, &mut head);
        assert_eq!(&head[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn recovery_replays_a_committed_transaction() {
        const DEV: u32 = 6;
        let disk = bring_up(DEV);

        // Fabricate the disk as a crash between commit point and
        // install would leave it: home block stale, log slot new,
        // header naming the block with n == 1.
        let mut old = [0u8; BSIZE];
        old[..4].copy_from_slice(b"old!");
        disk.write_block(60, &old);

        let mut new = [0u8; BSIZE];
        new[..4].copy_from_slice(b"new!");
        disk.write_block(LOGSTART + 1, &new);

        let mut lh = LogHeader::empty();
        lh.n = 1;
        lh.block[0] = 60;
        let mut head = [0u8; BSIZE];
        head[..core::mem::size_of::<LogHeader>()].copy_from_slice(lh.as_bytes());
        disk.write_block(LOGSTART, &head);

        // "reboot": recovery must install the committed block
        let log = Log::new();
        log.init(DEV, &test_sb());

        let mut home = [0u8; BSIZE];
        disk.read_block(60, &mut home);
        assert_eq!(&home[..4], b"new!");

        let mut head = [0u8; BSIZE];
        disk.read_block(LOGSTART, &mut head);
        assert_eq!(&head[0..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn uncommitted_transaction_is_invisible_after_crash() {
        const DEV: u32 = 4;
        let disk = bring_up(DEV);
        let log = Log::new();
        log.init(DEV, &test_sb());

        let mut before = [0u8; BSIZE];
        disk.read_block(70, &mut before);

        // lose power before end_op ever writes the commit header
        disk.fail_after(0);
        log.begin_op();
        {
            let mut b = BCACHE.read(DEV, 70);
            b.data[0] = 0x77;
            log.write(b);
        }
        log.end_op();
        disk.heal();

        // recovery finds n == 0 and replays nothing
        let log2 = Log::new();
        log2.init(DEV, &test_sb());
        let mut after = [0u8; BSIZE];
        disk.read_block(70, &mut after);
        assert_eq!(&after[..], &before[..]);
    }
}

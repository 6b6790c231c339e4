// The cache is sized for the workload; a kernel that pins more
// buffers than exist is broken, and bget says so loudly.

use kernel::bio::{BufGuard, BCACHE};
use kernel::ide::{install_ramdisk, RamDisk};
use kernel::param::NBUF;
use std::sync::Arc;

const DEV: u32 = 7;

#[test]
#[should_panic(expected = "bget: no buffers")]
fn holding_every_buffer_starves_bget() {
    kernel::kalloc::host_init();
    kernel::bio::init();
    install_ramdisk(DEV, Arc::new(RamDisk::new(256)));

    // one guard per slot, all live at once
    let _guards: Vec<BufGuard> = (0..NBUF as u32).map(|bn| BCACHE.read(DEV, bn)).collect();

    // no slot has refcnt == 0: nothing can be recycled
    let _ = BCACHE.read(DEV, 200);
}

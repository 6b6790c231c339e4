// Pipes: a bounded circular byte buffer with a reader end and a
// writer end. nread and nwrite count bytes ever moved, so the
// buffer is empty when they are equal and full when they differ
// by PIPESIZE.

use crate::fcntl::{OMode, O_WRONLY};
use crate::file::{FType, File, FTABLE};
use crate::param::PIPESIZE;
use crate::proc::{self, CPUS, PTABLE};
use crate::spinlock::Mutex;
use crate::vm::{either_copyin, either_copyout, VirtAddr};
use alloc::sync::Arc;

pub struct Pipe {
    inner: Mutex<PipeInner>,
}

struct PipeInner {
    data: [u8; PIPESIZE],
    nread: u32,     // number of bytes read
    nwrite: u32,    // number of bytes written
    readopen: bool, // read fd is still open
    writeopen: bool, // write fd is still open
}

impl core::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pipe")
    }
}

fn killed() -> bool {
    CPUS.my_proc().map_or(false, |p| p.killed())
}

impl Pipe {
    fn new() -> Self {
        Self {
            inner: Mutex::new(
                PipeInner {
                    data: [0; PIPESIZE],
                    nread: 0,
                    nwrite: 0,
                    readopen: true,
                    writeopen: true,
                },
                "pipe",
            ),
        }
    }

    // Allocate a pipe and its two file objects: read end, write
    // end.
    pub fn alloc() -> Option<(File, File)> {
        let p = Arc::new(Pipe::new());
        let f0 = FTABLE.alloc(OMode::read_only(), FType::Pipe(Arc::clone(&p)))?;
        let f1 = FTABLE.alloc(OMode::from_usize(O_WRONLY), FType::Pipe(p))?;
        Some((f0, f1))
    }

    // Sleep channels: the reader and writer queues need distinct
    // identities, carved out of the pipe's stable address.
    fn read_chan(&self) -> usize {
        &self.inner as *const _ as usize
    }

    fn write_chan(&self) -> usize {
        self.read_chan() + 1
    }

    pub fn write(&self, src: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut g = self.inner.lock();
        let mut i = 0;
        while i < n {
            // while full
            while g.nwrite == g.nread.wrapping_add(PIPESIZE as u32) {
                if !g.readopen || killed() {
                    return Err(());
                }
                PTABLE.wakeup(self.read_chan());
                g = proc::sleep(self.write_chan(), g);
            }
            if !g.readopen || killed() {
                return Err(());
            }

            let mut ch = [0u8; 1];
            if either_copyin(&mut ch, src + i).is_err() {
                break;
            }
            let at = (g.nwrite as usize) % PIPESIZE;
            g.data[at] = ch[0];
            g.nwrite = g.nwrite.wrapping_add(1);
            i += 1;
        }
        drop(g);
        PTABLE.wakeup(self.read_chan());
        Ok(i)
    }

    pub fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let mut g = self.inner.lock();
        // wait for data, unless every writer is gone
        while g.nread == g.nwrite && g.writeopen {
            if killed() {
                return Err(());
            }
            g = proc::sleep(self.read_chan(), g);
        }

        // drain up to n bytes without further blocking
        let mut i = 0;
        while i < n {
            if g.nread == g.nwrite {
                break;
            }
            let ch = [g.data[(g.nread as usize) % PIPESIZE]];
            g.nread = g.nread.wrapping_add(1);
            if either_copyout(dst + i, &ch).is_err() {
                break;
            }
            i += 1;
        }
        drop(g);
        PTABLE.wakeup(self.write_chan());
        Ok(i)
    }

    // Close one end. The buffer itself is freed when the last
    // file handle drops its reference.
    pub fn close(&self, writable: bool) {
        let mut g = self.inner.lock();
        if writable {
            g.writeopen = false;
            drop(g);
            PTABLE.wakeup(self.read_chan());
        } else {
            g.readopen = false;
            drop(g);
            PTABLE.wakeup(self.write_chan());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn bytes_flow_in_order() {
        let p = Arc::new(Pipe::new());
        let w = Arc::clone(&p);
        let t = thread::spawn(move || {
            w.write(VirtAddr::Kernel(b"hello".as_ptr() as usize), 5)
        });
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            let r = p
                .read(VirtAddr::Kernel(buf[got..].as_ptr() as usize), 5 - got)
                .unwrap();
            got += r;
        }
        assert_eq!(&buf, b"hello");
        assert_eq!(t.join().unwrap(), Ok(5));
    }

    #[test]
    fn writer_blocks_when_full() {
        let p = Arc::new(Pipe::new());
        let payload = vec![7u8; PIPESIZE + 16];
        let w = Arc::clone(&p);
        let src = payload.clone();
        let t = thread::spawn(move || {
            w.write(VirtAddr::Kernel(src.as_ptr() as usize), src.len())
        });

        // the writer can place at most PIPESIZE bytes before we read
        thread::sleep(Duration::from_millis(30));
        {
            let g = p.inner.lock();
            assert_eq!(g.nwrite.wrapping_sub(g.nread), PIPESIZE as u32);
        }

        let mut buf = vec![0u8; payload.len()];
        let mut got = 0;
        while got < buf.len() {
            let r = p
                .read(
                    VirtAddr::Kernel(buf[got..].as_ptr() as usize),
                    buf.len() - got,
                )
                .unwrap();
            got += r;
        }
        assert_eq!(buf, payload);
        assert_eq!(t.join().unwrap(), Ok(payload.len()));
    }

    #[test]
    fn occupancy_never_exceeds_capacity() {
        let p = Arc::new(Pipe::new());
        let w = Arc::clone(&p);
        let t = thread::spawn(move || {
            let junk = [3u8; 97];
            for _ in 0..50 {
                w.write(VirtAddr::Kernel(junk.as_ptr() as usize), junk.len())
                    .unwrap();
            }
        });
        let mut drained = 0;
        let mut buf = [0u8; 64];
        while drained < 97 * 50 {
            {
                let g = p.inner.lock();
                let used = g.nwrite.wrapping_sub(g.nread);
                assert!(used <= PIPESIZE as u32);
            }
            drained += p
                .read(VirtAddr::Kernel(buf.as_ptr() as usize), buf.len())
                .unwrap();
        }
        t.join().unwrap();
    }

    #[test]
    fn read_sees_eof_after_writer_closes() {
        let p = Arc::new(Pipe::new());
        p.write(VirtAddr::Kernel(b"Q".as_ptr() as usize), 1).unwrap();
        p.close(true); // writer gone

        let mut buf = [0u8; 8];
        let r = p.read(VirtAddr::Kernel(buf.as_ptr() as usize), 8).unwrap();
        assert_eq!(r, 1);
        assert_eq!(buf[0], b'Q');
        // drained and no writer: EOF
        let r = p.read(VirtAddr::Kernel(buf.as_ptr() as usize), 8).unwrap();
        assert_eq!(r, 0);
    }

    #[test]
    fn write_fails_once_reader_closes() {
        let p = Arc::new(Pipe::new());
        p.close(false); // reader gone
        assert!(p
            .write(VirtAddr::Kernel(b"x".as_ptr() as usize), 1)
            .is_err());
    }
}

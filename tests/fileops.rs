// End-to-end file operations against a freshly built image,
// driven through the open-file layer.

use kernel::fcntl::{OMode, O_APPEND, O_CREATE, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY};
use kernel::file::{FType, File, FTABLE};
use kernel::fs::Path;
use kernel::log::LOG;
use kernel::mkfs::mount_test_image;
use kernel::stat::{IType, Stat};
use kernel::vm::VirtAddr;

fn open(path: &str, mode: usize) -> Option<File> {
    LOG.begin_op();
    let f = FTABLE.alloc(OMode::from_usize(mode), FType::Node(Path::new(path)));
    LOG.end_op();
    f
}

fn kaddr<T: ?Sized>(r: &T) -> VirtAddr {
    VirtAddr::Kernel(r as *const T as *const u8 as usize)
}

#[test]
fn open_write_read_round_trip() {
    mount_test_image();

    let f = open("/t", O_CREATE | O_RDWR).expect("create /t");
    assert_eq!(f.write(kaddr(&b"hello"[..]), 5), Ok(5));
    drop(f);

    let f = open("/t", O_RDONLY).expect("open /t");
    let b = [0u8; 5];
    assert_eq!(f.read(kaddr(&b[..]), 5), Ok(5));
    assert_eq!(&b, b"hello");

    // at end of file a read returns 0
    assert_eq!(f.read(kaddr(&b[..]), 5), Ok(0));
    // and a read-only handle refuses writes
    assert!(f.write(kaddr(&b[..]), 5).is_err());
    drop(f);
}

#[test]
fn truncate_empties_an_existing_file() {
    mount_test_image();

    let f = open("/trunced", O_CREATE | O_RDWR).unwrap();
    assert_eq!(f.write(kaddr(&b"some payload"[..]), 12), Ok(12));
    drop(f);

    let f = open("/trunced", O_WRONLY | O_TRUNC).unwrap();
    let mut st = Stat::default();
    f.stat(kaddr(&mut st)).unwrap();
    assert_eq!(st.size, 0);
    assert_eq!(st.itype, IType::File);
    drop(f);

    let f = open("/trunced", O_RDONLY).unwrap();
    let b = [0u8; 8];
    assert_eq!(f.read(kaddr(&b[..]), 8), Ok(0));
    drop(f);
}

#[test]
fn dup_handles_share_one_offset() {
    mount_test_image();

    let f = open("/shared", O_CREATE | O_RDWR).unwrap();
    assert_eq!(f.write(kaddr(&b"abcdef"[..]), 6), Ok(6));
    drop(f);

    let f = open("/shared", O_RDONLY).unwrap();
    let f2 = f.clone(); // dup

    let b = [0u8; 3];
    assert_eq!(f.read(kaddr(&b[..]), 3), Ok(3));
    assert_eq!(&b, b"abc");
    // the clone continues where the original stopped
    assert_eq!(f2.read(kaddr(&b[..]), 3), Ok(3));
    assert_eq!(&b, b"def");
    drop(f2);
    drop(f);
}

#[test]
fn append_mode_writes_at_the_end() {
    mount_test_image();

    let f = open("/applog", O_CREATE | O_WRONLY).unwrap();
    assert_eq!(f.write(kaddr(&b"abc"[..]), 3), Ok(3));
    drop(f);

    let f = open("/applog", O_WRONLY | O_APPEND).unwrap();
    assert_eq!(f.write(kaddr(&b"def"[..]), 3), Ok(3));
    drop(f);

    let f = open("/applog", O_RDONLY).unwrap();
    let b = [0u8; 6];
    assert_eq!(f.read(kaddr(&b[..]), 6), Ok(6));
    assert_eq!(&b, b"abcdef");
    drop(f);
}

#[test]
fn bad_opens_fail_cleanly() {
    mount_test_image();

    assert!(open("/does-not-exist", O_RDONLY).is_none());
    // directories open read-only at most
    assert!(open("/", O_WRONLY).is_none());
    assert!(open("/", O_RDONLY).is_some());
}

// A trivial device driver, enough to see the switch dispatch and
// the copied ioctl record.
struct EchoDev;

static ECHO_DEV: EchoDev = EchoDev;
const ECHO_MAJOR: u16 = 5;

impl kernel::file::Device for EchoDev {
    fn read(&self, dst: VirtAddr, n: usize) -> Result<usize, ()> {
        let src = vec![b'e'; n];
        kernel::vm::either_copyout(dst, &src)?;
        Ok(n)
    }

    fn write(&self, _src: VirtAddr, n: usize) -> Result<usize, ()> {
        Ok(n) // swallow everything
    }

    fn ioctl(&self, req: usize, arg: &mut u32) -> Result<usize, ()> {
        match req {
            1 => {
                *arg = arg.wrapping_mul(2);
                Ok(0)
            }
            _ => Err(()),
        }
    }

    fn major(&self) -> u16 {
        ECHO_MAJOR
    }
}

#[test]
fn device_nodes_dispatch_through_the_switch() {
    mount_test_image();
    let _ = kernel::file::DEVSW.set(ECHO_MAJOR, &ECHO_DEV);

    LOG.begin_op();
    let made = kernel::fs::create(
        Path::new("/echodev"),
        IType::Device,
        ECHO_MAJOR,
        0,
    )
    .map(|_| ());
    LOG.end_op();
    made.expect("mknod /echodev");

    let f = open("/echodev", O_RDWR).expect("open device");
    let b = [0u8; 4];
    assert_eq!(f.read(kaddr(&b[..]), 4), Ok(4));
    assert_eq!(&b, b"eeee");
    assert_eq!(f.write(kaddr(&b[..]), 4), Ok(4));

    // the ioctl argument record is copied both ways
    let mut arg = 21u32;
    assert_eq!(f.ioctl(1, &mut arg), Ok(0));
    assert_eq!(arg, 42);
    assert!(f.ioctl(99, &mut arg).is_err());
    drop(f);

    // ioctl on a plain file is refused
    let f = open("/t-dev-plain", O_CREATE | O_RDWR).unwrap();
    let mut arg = 0u32;
    assert!(f.ioctl(1, &mut arg).is_err());
    drop(f);
}

#[test]
fn stat_reports_links_and_size() {
    mount_test_image();

    let f = open("/statme", O_CREATE | O_RDWR).unwrap();
    assert_eq!(f.write(kaddr(&b"123456789"[..]), 9), Ok(9));

    let mut st = Stat::default();
    f.stat(kaddr(&mut st)).unwrap();
    assert_eq!(st.size, 9);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.itype, IType::File);
    assert!(st.mtime.year >= 2000);
    drop(f);
}

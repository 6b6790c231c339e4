// A pipe shared between two threads standing in for the
// parent/child pair: one byte goes through, then the closed
// writer turns into end-of-file.

use kernel::pipe::Pipe;
use kernel::vm::VirtAddr;
use std::thread;

#[test]
fn one_byte_through_the_pipe_then_eof() {
    let (rf, wf) = Pipe::alloc().expect("pipe");

    let writer = thread::spawn(move || {
        assert_eq!(wf.write(VirtAddr::Kernel(b"Q".as_ptr() as usize), 1), Ok(1));
        // wf drops here, closing the write end
    });

    let b = [0u8; 1];
    assert_eq!(rf.read(VirtAddr::Kernel(b.as_ptr() as usize), 1), Ok(1));
    assert_eq!(b[0], b'Q');
    writer.join().unwrap();

    // no writers left: read sees end of file
    assert_eq!(rf.read(VirtAddr::Kernel(b.as_ptr() as usize), 1), Ok(0));
}

#[test]
fn write_fails_after_reader_is_gone() {
    let (rf, wf) = Pipe::alloc().expect("pipe");
    drop(rf);
    assert!(wf.write(VirtAddr::Kernel(b"x".as_ptr() as usize), 1).is_err());
}

#[test]
fn large_transfer_survives_blocking_both_ways() {
    let (rf, wf) = Pipe::alloc().expect("pipe");
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let expect = payload.clone();

    let writer = thread::spawn(move || {
        assert_eq!(
            wf.write(VirtAddr::Kernel(payload.as_ptr() as usize), payload.len()),
            Ok(payload.len())
        );
    });

    let mut got = Vec::new();
    let buf = [0u8; 333];
    loop {
        let n = rf
            .read(VirtAddr::Kernel(buf.as_ptr() as usize), buf.len())
            .unwrap();
        if n == 0 && got.len() == expect.len() {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, expect);
    writer.join().unwrap();
}

// exec() against a hand-built ELF image stored in the test file
// system: the new address space must carry the argument frame a
// C runtime expects (fake return address, argc, argv, strings).

use core::mem::size_of;
use kernel::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use kernel::exec::exec;
use kernel::fcntl::{OMode, O_CREATE, O_RDWR};
use kernel::file::{FType, FTABLE};
use kernel::fs::Path;
use kernel::log::LOG;
use kernel::mkfs::mount_test_image;
use kernel::proc::{alloc_proc, CPUS};
use kernel::vm::{copyin, copyout, VirtAddr};
use kernel::x86::PGSIZE;
use zerocopy::AsBytes;

const CODE: [u8; 16] = [0x90; 16]; // nops; never actually run

fn echo_image() -> Vec<u8> {
    let elf = ElfHdr {
        magic: ELF_MAGIC,
        elf: [0; 12],
        etype: 2,   // EXEC
        machine: 3, // EM_386
        version: 1,
        entry: 0,
        phoff: size_of::<ElfHdr>() as u32,
        shoff: 0,
        flags: 0,
        ehsize: size_of::<ElfHdr>() as u16,
        phentsize: size_of::<ProgHdr>() as u16,
        phnum: 1,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    let ph = ProgHdr {
        ptype: ELF_PROG_LOAD,
        off: 512,
        vaddr: 0,
        paddr: 0,
        filesz: CODE.len() as u32,
        memsz: CODE.len() as u32,
        flags: 0,
        align: PGSIZE as u32,
    };

    let mut img = vec![0u8; 512 + CODE.len()];
    img[..size_of::<ElfHdr>()].copy_from_slice(elf.as_bytes());
    img[size_of::<ElfHdr>()..size_of::<ElfHdr>() + size_of::<ProgHdr>()]
        .copy_from_slice(ph.as_bytes());
    img[512..].copy_from_slice(&CODE);
    img
}

fn read_word(pgdir: kernel::vm::PageDir, va: usize) -> u32 {
    let mut b = [0u8; 4];
    copyin(pgdir, &mut b, va).expect("user word");
    u32::from_le_bytes(b)
}

fn read_str(pgdir: kernel::vm::PageDir, va: usize) -> String {
    let mut out = Vec::new();
    let mut b = [0u8; 1];
    let mut va = va;
    loop {
        copyin(pgdir, &mut b, va).expect("user byte");
        if b[0] == 0 {
            break;
        }
        out.push(b[0]);
        va += 1;
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn exec_builds_the_argument_frame() {
    mount_test_image();

    // install /echo
    let img = echo_image();
    LOG.begin_op();
    let f = FTABLE
        .alloc(
            OMode::from_usize(O_CREATE | O_RDWR),
            FType::Node(Path::new("/echo")),
        )
        .expect("create /echo");
    LOG.end_op();
    assert_eq!(
        f.write(VirtAddr::Kernel(img.as_ptr() as usize), img.len()),
        Ok(img.len())
    );
    drop(f);

    // run it from a process slot bound to this thread
    let idx = alloc_proc().expect("proc slot");
    CPUS.adopt_proc(Some(idx));
    let p = CPUS.my_proc().unwrap();

    assert_eq!(exec(Path::new("/echo"), &["echo", "a", "bb"]), Ok(0));

    let data = unsafe { p.data() };
    let pgdir = data.pgdir.expect("new image");
    let tf = unsafe { &*data.trapframe };

    // control transfers to the ELF entry point
    assert_eq!(tf.eip, 0);
    assert_eq!(data.name_str(), "echo");

    // frame: fake return address, argc, argv
    let sp = tf.esp as usize;
    assert_eq!(read_word(pgdir, sp), 0xFFFF_FFFF);
    let argc = read_word(pgdir, sp + 4) as usize;
    assert_eq!(argc, 3);
    let argv = read_word(pgdir, sp + 8) as usize;

    let expect = ["echo", "a", "bb"];
    for (i, want) in expect.iter().enumerate() {
        let arg_ptr = read_word(pgdir, argv + 4 * i) as usize;
        assert_eq!(read_str(pgdir, arg_ptr), *want);
    }
    // the argv array is NULL-terminated
    assert_eq!(read_word(pgdir, argv + 4 * argc), 0);

    // below the stack page sits the inaccessible guard page
    assert!(copyout(pgdir, data.sz - 2 * PGSIZE, b"x").is_err());
    assert!(copyout(pgdir, data.sz - PGSIZE, b"x").is_ok());

    // a bad image leaves the current one untouched
    assert!(exec(Path::new("/echo-missing"), &["x"]).is_err());
    assert_eq!(data.pgdir, Some(pgdir));

    CPUS.adopt_proc(None);
}

use crate::elf::{ElfHdr, ProgHdr, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::Path;
use crate::log::LOG;
use crate::param::MAXARG;
use crate::proc::CPUS;
use crate::vm::{
    allocuvm, clearpteu, copyout, freevm, loaduvm, setupkvm, PageDir, VirtAddr,
};
use crate::x86::{pg_round_up, PGSIZE};
use core::mem::size_of;

// Replace the current process's image with the program at path.
// The new page directory is built off to the side and swapped in
// only when nothing can fail anymore, so an error always returns
// -1 to the old, intact image.
pub fn exec(path: &Path, argv: &[&str]) -> Result<usize, ()> {
    let p = CPUS.my_proc().ok_or(())?;

    // Load the program segments with the inode locked inside one
    // transaction.
    LOG.begin_op();
    let loaded = load_image(path);
    LOG.end_op();
    let (pgdir, sz, entry) = loaded?;

    // Build the user stack: a guard page, a stack page, and the
    // argument frame. The old image is still live; any failure
    // from here tears down only the new one.
    let prepared = (|| {
        let mut sz = pg_round_up(sz);
        sz = allocuvm(pgdir, sz, sz + 2 * PGSIZE).ok_or(())?;
        clearpteu(pgdir, sz - 2 * PGSIZE);
        let mut sp = sz;

        if argv.len() > MAXARG {
            return Err(());
        }

        // push argument strings, remembering their addresses
        let mut ustack = [0u32; 3 + MAXARG + 1];
        for (i, arg) in argv.iter().enumerate() {
            sp -= arg.len() + 1;
            sp &= !3; // keep the words below aligned
            copyout(pgdir, sp, arg.as_bytes())?;
            copyout(pgdir, sp + arg.len(), &[0u8])?;
            ustack[3 + i] = sp as u32;
        }
        ustack[3 + argv.len()] = 0;

        ustack[0] = 0xFFFF_FFFF; // fake return PC
        ustack[1] = argv.len() as u32;
        ustack[2] = (sp - (argv.len() + 1) * 4) as u32; // argv pointer

        let nwords = 3 + argv.len() + 1;
        sp -= nwords * 4;
        copyout(pgdir, sp, unsafe {
            crate::defs::as_bytes(&ustack[..nwords])
        })?;
        Ok((sz, sp))
    })();

    match prepared {
        Ok((sz, sp)) => {
            // commit to the new image
            let data = unsafe { p.data() };
            data.set_name(path.file_name());
            let oldpgdir = data.pgdir.replace(pgdir);
            data.sz = sz;
            unsafe {
                let tf = &mut *data.trapframe;
                tf.eip = entry;
                tf.esp = sp as u32;
            }
            #[cfg(target_os = "none")]
            crate::vm::switchuvm(data);
            if let Some(old) = oldpgdir {
                freevm(old);
            }
            Ok(0)
        }
        Err(()) => {
            freevm(pgdir);
            Err(())
        }
    }
}

// Read the ELF image into a fresh page directory. Runs with the
// inode locked; the caller owns the transaction.
fn load_image(path: &Path) -> Result<(PageDir, usize, u32), ()> {
    let (_, ip) = path.namei().ok_or(())?;
    let mut ig = ip.lock();

    let mut elf = ElfHdr::default();
    if ig.read(
        VirtAddr::Kernel(&mut elf as *mut _ as usize),
        0,
        size_of::<ElfHdr>(),
    ) != Ok(size_of::<ElfHdr>())
    {
        return Err(());
    }
    if elf.magic != ELF_MAGIC {
        return Err(());
    }

    let pgdir = setupkvm().ok_or(())?;

    let r = (|| {
        let mut sz = 0usize;
        for i in 0..elf.phnum as usize {
            let off = elf.phoff as usize + i * size_of::<ProgHdr>();
            let mut ph = ProgHdr::default();
            if ig.read(
                VirtAddr::Kernel(&mut ph as *mut _ as usize),
                off as u32,
                size_of::<ProgHdr>(),
            ) != Ok(size_of::<ProgHdr>())
            {
                return Err(());
            }
            if ph.ptype != ELF_PROG_LOAD {
                continue;
            }
            if ph.memsz < ph.filesz {
                return Err(());
            }
            let end = match ph.vaddr.checked_add(ph.memsz) {
                Some(end) => end,
                None => return Err(()), // would wrap around
            };
            if ph.vaddr as usize % PGSIZE != 0 {
                return Err(());
            }
            sz = allocuvm(pgdir, sz, end as usize).ok_or(())?;
            loaduvm(pgdir, ph.vaddr as usize, &mut ig, ph.off, ph.filesz as usize)?;
        }
        Ok(sz)
    })();

    match r {
        Ok(sz) => Ok((pgdir, sz, elf.entry)),
        Err(()) => {
            freevm(pgdir);
            Err(())
        }
    }
}

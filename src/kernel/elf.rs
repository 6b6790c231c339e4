// ELF32 executable format, the subset exec needs.

use zerocopy::{AsBytes, FromBytes};

pub const ELF_MAGIC: u32 = 0x464C_457F; // "\x7FELF" in little endian

// program section types
pub const ELF_PROG_LOAD: u32 = 1;

// file header
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
pub struct ElfHdr {
    pub magic: u32, // must equal ELF_MAGIC
    pub elf: [u8; 12],
    pub etype: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

// program section header
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes)]
pub struct ProgHdr {
    pub ptype: u32,
    pub off: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

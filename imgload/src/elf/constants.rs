//! ELF Constants
//!
//! Numeric values from the ELF specification and the IA-32 / x86-64 psABI
//! supplements that the loader reads or dispatches on.

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// e_ident index of the class byte
pub const EI_CLASS: usize = 4;
/// e_ident index of the data encoding byte
pub const EI_DATA: usize = 5;

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;
/// ELF class: 64-bit
pub const ELFCLASS64: u8 = 2;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;
/// ELF data encoding: big endian
pub const ELFDATA2MSB: u8 = 2;

/// Current ELF version
pub const EV_CURRENT: u32 = 1;

/// ELF type: relocatable object
pub const ET_REL: u16 = 1;
/// ELF type: executable
pub const ET_EXEC: u16 = 2;
/// ELF type: shared object
pub const ET_DYN: u16 = 3;
/// ELF type: core dump
pub const ET_CORE: u16 = 4;

/// Machine type: Intel 80386
pub const EM_386: u16 = 3;
/// Machine type: x86-64
pub const EM_X86_64: u16 = 62;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;
/// Program header type: note
pub const PT_NOTE: u32 = 4;

/// Section type: inactive
pub const SHT_NULL: u32 = 0;
/// Section type: program data
pub const SHT_PROGBITS: u32 = 1;
/// Section type: string table
pub const SHT_STRTAB: u32 = 3;
/// Section type: relocations with explicit addends
pub const SHT_RELA: u32 = 4;
/// Section type: relocations without addends
pub const SHT_REL: u32 = 9;

// IA-32 relocation types
pub const R_386_NONE: u32 = 0;
pub const R_386_32: u32 = 1;
pub const R_386_PC32: u32 = 2;

// x86-64 relocation types
pub const R_X86_64_NONE: u32 = 0;
pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_PC32: u32 = 2;
pub const R_X86_64_PLT32: u32 = 4;
pub const R_X86_64_GOTPCREL: u32 = 9;
pub const R_X86_64_32: u32 = 10;
pub const R_X86_64_GOTPCRELX: u32 = 41;
pub const R_X86_64_REX_GOTPCRELX: u32 = 42;

bitflags::bitflags! {
    /// Section header flags (`sh_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u64 {
        const WRITE = 1 << 0;
        const ALLOC = 1 << 1;
        const EXECINSTR = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Program header flags (`p_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

/// Get segment permissions as string representation
pub fn segment_permissions(flags: SegmentFlags) -> &'static str {
    let r = flags.contains(SegmentFlags::READ);
    let w = flags.contains(SegmentFlags::WRITE);
    let x = flags.contains(SegmentFlags::EXECUTE);
    match (r, w, x) {
        (false, false, false) => "---",
        (true, false, false) => "R--",
        (false, true, false) => "-W-",
        (false, false, true) => "--X",
        (true, true, false) => "RW-",
        (true, false, true) => "R-X",
        (false, true, true) => "-WX",
        (true, true, true) => "RWX",
    }
}

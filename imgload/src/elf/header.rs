//! ELF Header Validation
//!
//! Classifies a memory blob as a supported ELF image and decodes the file
//! header. Layout differences between ELF32 and ELF64 are confined to
//! [`WordClass`] and [`FieldReader`]: every record the loader reads keeps the
//! same field order in both classes, only the width of address-sized fields
//! changes (program headers are the one exception, handled where they are
//! decoded).

use super::constants::*;
use crate::error::{ElfError, ElfResult, Reject};

/// ELF word class, fixed when an image is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordClass {
    Elf32,
    Elf64,
}

impl WordClass {
    fn from_ident(class: u8) -> Option<Self> {
        match class {
            ELFCLASS32 => Some(WordClass::Elf32),
            ELFCLASS64 => Some(WordClass::Elf64),
            _ => None,
        }
    }

    /// Width of an address-sized field in bytes.
    pub const fn word_size(self) -> usize {
        match self {
            WordClass::Elf32 => 4,
            WordClass::Elf64 => 8,
        }
    }

    /// Size of the file header.
    pub const fn header_size(self) -> usize {
        match self {
            WordClass::Elf32 => 52,
            WordClass::Elf64 => 64,
        }
    }

    /// Natural size of one section header.
    pub const fn section_header_size(self) -> usize {
        match self {
            WordClass::Elf32 => 40,
            WordClass::Elf64 => 64,
        }
    }

    /// Natural size of one program header.
    pub const fn program_header_size(self) -> usize {
        match self {
            WordClass::Elf32 => 32,
            WordClass::Elf64 => 56,
        }
    }

    /// Natural size of one relocation entry; `with_addend` selects RELA.
    pub const fn reloc_entry_size(self, with_addend: bool) -> usize {
        let words = if with_addend { 3 } else { 2 };
        words * self.word_size()
    }
}

/// Supported target instruction sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    /// 32-bit Intel architecture (EM_386)
    Ia32,
    /// x86-64 (EM_X86_64)
    X64,
}

impl Machine {
    /// The raw `e_machine` value.
    pub const fn elf_machine(self) -> u16 {
        match self {
            Machine::Ia32 => EM_386,
            Machine::X64 => EM_X86_64,
        }
    }

    /// The only word class images for this machine may use.
    pub const fn word_class(self) -> WordClass {
        match self {
            Machine::Ia32 => WordClass::Elf32,
            Machine::X64 => WordClass::Elf64,
        }
    }

    fn from_elf(e_machine: u16, class: WordClass) -> Option<Self> {
        let machine = match e_machine {
            EM_386 => Machine::Ia32,
            EM_X86_64 => Machine::X64,
            _ => return None,
        };
        (machine.word_class() == class).then_some(machine)
    }
}

/// ELF object type accepted by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Executable,
    SharedObject,
}

/// Result of a successful classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub class: WordClass,
    pub machine: Machine,
    pub kind: ObjectKind,
}

/// Classify `bytes` as a supported ELF image.
///
/// Checks, in order: magic, class, data encoding, machine, object type and
/// version. The first failing check is reported in [`Reject`]. Only reads.
///
/// # Arguments
///
/// * `bytes` - At least the file header of the image
pub fn classify(bytes: &[u8]) -> ElfResult<ImageInfo> {
    let reject = |reason: Reject| -> ElfResult<ImageInfo> { Err(ElfError::NotRecognized(reason)) };

    if bytes.len() < ELF_MAGIC.len() {
        return reject(Reject::Truncated);
    }
    if bytes[..4] != ELF_MAGIC {
        return reject(Reject::BadMagic);
    }

    let class = match bytes.get(EI_CLASS).copied().and_then(WordClass::from_ident) {
        Some(class) => class,
        None if bytes.len() <= EI_CLASS => return reject(Reject::Truncated),
        None => return reject(Reject::BadClass),
    };
    if bytes.len() < class.header_size() {
        return reject(Reject::Truncated);
    }

    // Big-endian images are rejected outright
    if bytes[EI_DATA] != ELFDATA2LSB {
        return reject(Reject::BadEncoding);
    }

    let header = FileHeader::decode(bytes, class)?;

    let machine = match Machine::from_elf(header.machine, class) {
        Some(machine) => machine,
        None => return reject(Reject::BadMachine),
    };

    let kind = match header.e_type {
        ET_EXEC => ObjectKind::Executable,
        ET_DYN => ObjectKind::SharedObject,
        _ => return reject(Reject::BadType),
    };

    if header.version != EV_CURRENT {
        return reject(Reject::BadVersion);
    }

    Ok(ImageInfo { class, machine, kind })
}

/// Check if `bytes` start with a loadable ELF image.
pub fn is_elf_image(bytes: &[u8]) -> bool {
    classify(bytes).is_ok()
}

/// Decoded ELF file header, widths normalized to 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub e_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

impl FileHeader {
    pub fn decode(bytes: &[u8], class: WordClass) -> ElfResult<Self> {
        let mut r = FieldReader::new(bytes, class);
        r.skip(16)?;
        let e_type = r.u16()?;
        let machine = r.u16()?;
        let version = r.u32()?;
        let entry = r.word()?;
        let phoff = r.word()?;
        let shoff = r.word()?;
        let _flags = r.u32()?;
        let _ehsize = r.u16()?;
        Ok(FileHeader {
            e_type,
            machine,
            version,
            entry,
            phoff,
            shoff,
            phentsize: r.u16()?,
            phnum: r.u16()?,
            shentsize: r.u16()?,
            shnum: r.u16()?,
            shstrndx: r.u16()?,
        })
    }
}

/// Sequential little-endian field decoder.
///
/// `word()` reads 4 or 8 bytes depending on the class and widens to `u64`.
/// Running past the end of the buffer is `CorruptImage`.
pub(crate) struct FieldReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    class: WordClass,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8], class: WordClass) -> Self {
        FieldReader { bytes, pos: 0, class }
    }

    fn take<const N: usize>(&mut self) -> ElfResult<[u8; N]> {
        let end = self.pos.checked_add(N).ok_or(ElfError::CorruptImage)?;
        let field = self
            .bytes
            .get(self.pos..end)
            .ok_or(ElfError::CorruptImage)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(field);
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> ElfResult<()> {
        let end = self.pos.checked_add(n).ok_or(ElfError::CorruptImage)?;
        if end > self.bytes.len() {
            return Err(ElfError::CorruptImage);
        }
        self.pos = end;
        Ok(())
    }

    pub fn u8(&mut self) -> ElfResult<u8> {
        self.take::<1>().map(|[b]| b)
    }

    pub fn u16(&mut self) -> ElfResult<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> ElfResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub fn u64(&mut self) -> ElfResult<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    /// Address-sized field.
    pub fn word(&mut self) -> ElfResult<u64> {
        match self.class {
            WordClass::Elf32 => self.u32().map(u64::from),
            WordClass::Elf64 => self.u64(),
        }
    }

    /// Signed address-sized field (RELA addends).
    pub fn sword(&mut self) -> ElfResult<i64> {
        match self.class {
            WordClass::Elf32 => self.u32().map(|v| v as i32 as i64),
            WordClass::Elf64 => self.u64().map(|v| v as i64),
        }
    }
}

//! ELF Structural Access
//!
//! [`ElfImage`] is the parse context for one image: where it sits in memory,
//! its word class, header counts and the section-name string table. Section
//! and program headers are decoded on demand from the address space, so the
//! context stays a small value type the caller owns.

use super::constants::*;
use super::header::{classify, FieldReader, FileHeader, ImageInfo, Machine, WordClass};
use crate::error::{ElfError, ElfResult, Reject};
use crate::memory::AddressSpace;

/// Coarse section classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// Allocatable, read-only
    Code,
    /// Allocatable, writable
    Data,
    /// REL or RELA entries
    Relocation,
    Other,
}

/// ELF section header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Offset of the name in the section-name string table
    pub name: u32,
    /// Section type
    pub sh_type: u32,
    /// Section flags
    pub flags: SectionFlags,
    /// Link-time virtual address
    pub addr: u64,
    /// File offset
    pub offset: u64,
    /// Section size
    pub size: u64,
    /// Link to another section
    pub link: u32,
    /// For relocation sections, index of the section being relocated
    pub info: u32,
    /// Section alignment
    pub addralign: u64,
    /// Entry size if section holds table
    pub entsize: u64,
}

impl SectionHeader {
    fn decode(bytes: &[u8], class: WordClass) -> ElfResult<Self> {
        let mut r = FieldReader::new(bytes, class);
        Ok(SectionHeader {
            name: r.u32()?,
            sh_type: r.u32()?,
            flags: SectionFlags::from_bits_retain(r.word()?),
            addr: r.word()?,
            offset: r.word()?,
            size: r.word()?,
            link: r.u32()?,
            info: r.u32()?,
            addralign: r.word()?,
            entsize: r.word()?,
        })
    }

    pub fn kind(&self) -> SectionKind {
        if self.is_relocation() {
            return SectionKind::Relocation;
        }
        let mapped = self.flags & (SectionFlags::ALLOC | SectionFlags::WRITE);
        if mapped == SectionFlags::ALLOC {
            SectionKind::Code
        } else if mapped == SectionFlags::ALLOC | SectionFlags::WRITE {
            SectionKind::Data
        } else {
            SectionKind::Other
        }
    }

    /// Check if the section occupies memory at run time
    pub fn is_allocatable(&self) -> bool {
        self.flags.contains(SectionFlags::ALLOC)
    }

    pub fn is_relocation(&self) -> bool {
        self.sh_type == SHT_REL || self.sh_type == SHT_RELA
    }

    /// Check if the link-time address `addr` falls inside this section
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }
}

/// ELF program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment flags
    pub flags: SegmentFlags,
    /// Segment file offset
    pub offset: u64,
    /// Segment virtual address
    pub vaddr: u64,
    /// Segment physical address (the load target)
    pub paddr: u64,
    /// Size of segment data in file
    pub filesz: u64,
    /// Size of segment in memory
    pub memsz: u64,
    /// Alignment requirement
    pub align: u64,
}

impl ProgramHeader {
    fn decode(bytes: &[u8], class: WordClass) -> ElfResult<Self> {
        let mut r = FieldReader::new(bytes, class);
        let p_type = r.u32()?;
        // p_flags moved next to p_type in ELF64 to keep the words aligned
        match class {
            WordClass::Elf64 => {
                let flags = SegmentFlags::from_bits_retain(r.u32()?);
                Ok(ProgramHeader {
                    p_type,
                    flags,
                    offset: r.word()?,
                    vaddr: r.word()?,
                    paddr: r.word()?,
                    filesz: r.word()?,
                    memsz: r.word()?,
                    align: r.word()?,
                })
            }
            WordClass::Elf32 => {
                let offset = r.word()?;
                let vaddr = r.word()?;
                let paddr = r.word()?;
                let filesz = r.word()?;
                let memsz = r.word()?;
                let flags = SegmentFlags::from_bits_retain(r.u32()?);
                Ok(ProgramHeader {
                    p_type,
                    flags,
                    offset,
                    vaddr,
                    paddr,
                    filesz,
                    memsz,
                    align: r.word()?,
                })
            }
        }
    }

    /// Check if this is a PT_LOAD segment
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Check if the segment must be materialized by copying: it is
    /// loadable, reserves memory and has backing data in the file.
    pub fn needs_copy(&self) -> bool {
        self.is_load() && self.memsz != 0 && self.offset != 0
    }
}

/// File position of a section
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPos {
    pub offset: u64,
    pub length: u64,
}

/// Load information of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInfo {
    /// File offset of the segment data
    pub offset: u64,
    /// Bytes of data in the file
    pub length: u64,
    /// Bytes reserved in memory
    pub mem_len: u64,
    /// Physical load address
    pub mem_addr: u64,
}

/// Parse context of one ELF image.
///
/// Only `entry_point` and `rebase_delta` change after parsing; they are
/// updated by segment loading and relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfImage {
    pub(super) image_base: u64,
    pub(super) info: ImageInfo,
    pub(super) header: FileHeader,
    pub(super) string_table_offset: u64,
    pub(super) string_table_length: u64,
    pub(super) entry_point: u64,
    pub(super) rebase_delta: Option<i64>,
}

impl ElfImage {
    /// Parse the ELF image mapped at `image_base`.
    ///
    /// Validates the header, checks that both header tables lie inside the
    /// address space with entry sizes at least as large as the records the
    /// word class needs, and resolves the section-name string table.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::NotRecognized)` - Header validation failed
    /// * `Err(ElfError::Unsupported)` - Header tables or string table unusable
    pub fn parse<M: AddressSpace + ?Sized>(mem: &M, image_base: u64) -> ElfResult<Self> {
        let mut buf = [0u8; 64];
        mem.read(image_base, &mut buf[..16])
            .map_err(|_| ElfError::NotRecognized(Reject::Truncated))?;
        let want = if buf[EI_CLASS] == ELFCLASS64 { 64 } else { 52 };
        let len = if mem.read(image_base, &mut buf[..want]).is_ok() { want } else { 16 };

        let info = classify(&buf[..len])?;
        let header = FileHeader::decode(&buf[..len], info.class)?;

        check_table(
            mem,
            image_base,
            header.shoff,
            header.shnum,
            header.shentsize,
            info.class.section_header_size(),
        )?;
        check_table(
            mem,
            image_base,
            header.phoff,
            header.phnum,
            header.phentsize,
            info.class.program_header_size(),
        )?;

        let mut image = ElfImage {
            image_base,
            info,
            header,
            string_table_offset: 0,
            string_table_length: 0,
            entry_point: header.entry,
            rebase_delta: None,
        };

        let strtab = image
            .section_by_index(mem, header.shstrndx as usize)
            .ok_or(ElfError::Unsupported)?;
        let backed = image_base
            .checked_add(strtab.offset)
            .is_some_and(|start| mem.contains(start, strtab.size));
        if !backed {
            log::warn!(
                "[ELF] String table {:#x}+{:#x} lies outside the image",
                strtab.offset,
                strtab.size
            );
            return Err(ElfError::Unsupported);
        }
        image.string_table_offset = strtab.offset;
        image.string_table_length = strtab.size;

        log::debug!(
            "[ELF] {:?} {:?} image at {:#x}: entry={:#x}, {} sections, {} segments",
            info.class,
            info.machine,
            image_base,
            header.entry,
            header.shnum,
            header.phnum
        );

        Ok(image)
    }

    /// Address of the first byte of the image
    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn info(&self) -> ImageInfo {
        self.info
    }

    pub fn class(&self) -> WordClass {
        self.info.class
    }

    pub fn machine(&self) -> Machine {
        self.info.machine
    }

    pub fn section_count(&self) -> usize {
        self.header.shnum as usize
    }

    pub fn segment_count(&self) -> usize {
        self.header.phnum as usize
    }

    /// Offset of the section-name string table, relative to the image base
    pub fn string_table_offset(&self) -> u64 {
        self.string_table_offset
    }

    pub fn string_table_length(&self) -> u64 {
        self.string_table_length
    }

    /// Entry point as recorded in the file header
    pub fn link_entry(&self) -> u64 {
        self.header.entry
    }

    /// Address to transfer control to, valid after loading or relocation
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// Offset applied to every segment by the last load, `None` while the
    /// image has only ever lived in its own buffer
    pub fn rebase_delta(&self) -> Option<i64> {
        self.rebase_delta
    }

    /// Get the section header at `index`, `None` if out of range
    pub fn section_by_index<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        index: usize,
    ) -> Option<SectionHeader> {
        if index >= self.section_count() {
            return None;
        }
        let addr = self.image_base
            + self.header.shoff
            + index as u64 * self.header.shentsize as u64;
        let mut buf = [0u8; 64];
        let len = self.class().section_header_size();
        mem.read(addr, &mut buf[..len]).ok()?;
        SectionHeader::decode(&buf[..len], self.class()).ok()
    }

    /// Get the program header at `index`, `None` if out of range
    pub fn segment_by_index<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        index: usize,
    ) -> Option<ProgramHeader> {
        if index >= self.segment_count() {
            return None;
        }
        let addr = self.image_base
            + self.header.phoff
            + index as u64 * self.header.phentsize as u64;
        let mut buf = [0u8; 56];
        let len = self.class().program_header_size();
        mem.read(addr, &mut buf[..len]).ok()?;
        ProgramHeader::decode(&buf[..len], self.class()).ok()
    }

    /// Iterate over all section headers in index order
    pub fn sections<'a, M: AddressSpace + ?Sized>(
        &'a self,
        mem: &'a M,
    ) -> impl Iterator<Item = (usize, SectionHeader)> + 'a {
        (0..self.section_count()).filter_map(move |i| Some((i, self.section_by_index(mem, i)?)))
    }

    /// Iterate over all program headers in index order
    pub fn segments<'a, M: AddressSpace + ?Sized>(
        &'a self,
        mem: &'a M,
    ) -> impl Iterator<Item = ProgramHeader> + 'a {
        (0..self.segment_count()).filter_map(move |i| self.segment_by_index(mem, i))
    }

    /// Address of byte `offset` of the string table. Its range was checked
    /// by [`Self::parse`].
    fn string_addr(&self, offset: u64) -> u64 {
        self.image_base
            .wrapping_add(self.string_table_offset)
            .wrapping_add(offset)
    }

    /// Name offset of section `index` inside the string table, if it resolves
    fn name_offset<M: AddressSpace + ?Sized>(&self, mem: &M, index: usize) -> Option<u64> {
        let section = self.section_by_index(mem, index)?;
        let offset = section.name as u64;
        // Guards against corrupt or truncated string tables
        (offset < self.string_table_length).then_some(offset)
    }

    /// Read the name of section `index` into `buf`.
    ///
    /// Names longer than `buf` are truncated.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::NotFound)` - Index out of range, or the name offset
    ///   lies outside the string table
    pub fn section_name<'b, M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        index: usize,
        buf: &'b mut [u8],
    ) -> ElfResult<&'b [u8]> {
        let offset = self.name_offset(mem, index).ok_or(ElfError::NotFound)?;
        let avail = (self.string_table_length - offset).min(buf.len() as u64) as usize;
        mem.read(self.string_addr(offset), &mut buf[..avail])?;
        let len = buf[..avail].iter().position(|&b| b == 0).unwrap_or(avail);
        Ok(&buf[..len])
    }

    fn name_matches<M: AddressSpace + ?Sized>(&self, mem: &M, index: usize, name: &str) -> bool {
        let Some(offset) = self.name_offset(mem, index) else {
            return false;
        };
        let name = name.as_bytes();
        // The name and its terminator must both lie inside the table
        if self.string_table_length - offset < name.len() as u64 + 1 {
            return false;
        }
        let mut addr = self.string_addr(offset);
        let mut chunk = [0u8; 32];
        for expected in name.chunks(chunk.len()) {
            let got = &mut chunk[..expected.len()];
            if mem.read(addr, got).is_err() || got != expected {
                return false;
            }
            addr = addr.wrapping_add(expected.len() as u64);
        }
        let mut nul = [0xFFu8; 1];
        mem.read(addr, &mut nul).is_ok() && nul[0] == 0
    }

    /// Find the first section named exactly `name`
    pub fn section_by_name<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        name: &str,
    ) -> Option<(usize, SectionHeader)> {
        (0..self.section_count())
            .find(|&i| self.name_matches(mem, i, name))
            .and_then(|i| Some((i, self.section_by_index(mem, i)?)))
    }

    /// File position of section `index`
    ///
    /// Resolves under the same string-table bound as [`Self::section_name`].
    pub fn section_position<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        index: usize,
    ) -> Option<SectionPos> {
        self.name_offset(mem, index)?;
        let section = self.section_by_index(mem, index)?;
        Some(SectionPos {
            offset: section.offset,
            length: section.size,
        })
    }

    /// Load information of segment `index`
    pub fn segment_info<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        index: usize,
    ) -> Option<SegmentInfo> {
        let segment = self.segment_by_index(mem, index)?;
        Some(SegmentInfo {
            offset: segment.offset,
            length: segment.filesz,
            mem_len: segment.memsz,
            mem_addr: segment.paddr,
        })
    }
}

/// Validate a header table's entry size and placement
fn check_table<M: AddressSpace + ?Sized>(
    mem: &M,
    image_base: u64,
    offset: u64,
    count: u16,
    entsize: u16,
    natural: usize,
) -> ElfResult<()> {
    if count == 0 {
        return Ok(());
    }
    if (entsize as usize) < natural {
        return Err(ElfError::Unsupported);
    }
    let start = image_base
        .checked_add(offset)
        .ok_or(ElfError::Unsupported)?;
    let len = count as u64 * entsize as u64;
    if !mem.contains(start, len) {
        return Err(ElfError::Unsupported);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryWindow;
    use crate::testing::{place, ElfBuilder, IMAGE_BASE, RAM_SIZE};

    fn sample(machine: Machine) -> Vec<u8> {
        let mut b = ElfBuilder::new(machine).entry(0x0040_0010);
        let text = b.data(&[0x90; 0x40]);
        let data = b.data(&[0x11; 0x20]);
        b.section(".text", SHT_PROGBITS, SectionFlags::ALLOC | SectionFlags::EXECINSTR, 0x0040_0000, text, 0x40);
        b.section(".data", SHT_PROGBITS, SectionFlags::ALLOC | SectionFlags::WRITE, 0x0040_1000, data, 0x20);
        b.section(".comment", SHT_PROGBITS, SectionFlags::empty(), 0, data, 0x20);
        b.section(".data", SHT_PROGBITS, SectionFlags::ALLOC, 0x0040_2000, data, 0x10);
        b.segment(PT_LOAD, text, 0x0040_0000, 0x40, 0x40, SegmentFlags::READ | SegmentFlags::EXECUTE);
        b.segment(PT_LOAD, data, 0x0040_1000, 0x20, 0x100, SegmentFlags::READ | SegmentFlags::WRITE);
        b.build()
    }

    #[test]
    fn test_parse_both_classes() {
        for machine in [Machine::Ia32, Machine::X64] {
            let mut ram = place(&sample(machine));
            let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
            let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
            assert_eq!(image.class(), machine.word_class());
            assert_eq!(image.machine(), machine);
            // null + 4 named + string table
            assert_eq!(image.section_count(), 6);
            assert_eq!(image.segment_count(), 2);
            assert_eq!(image.link_entry(), 0x0040_0010);
            assert_eq!(image.entry_point(), 0x0040_0010);
            assert_eq!(image.rebase_delta(), None);
            assert!(image.string_table_length() > 0);
        }
    }

    #[test]
    fn test_section_by_index_bounds() {
        let mut ram = place(&sample(Machine::X64));
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        let count = image.section_count();
        assert!(image.section_by_index(&mem, count).is_none());
        let last = image.section_by_index(&mem, count - 1).unwrap();
        assert_eq!(last.sh_type, SHT_STRTAB);
    }

    #[test]
    fn test_segment_by_index_bounds() {
        let mut ram = place(&sample(Machine::Ia32));
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        assert!(image.segment_by_index(&mem, 2).is_none());
        let seg = image.segment_by_index(&mem, 1).unwrap();
        assert!(seg.is_load());
        assert_eq!(seg.paddr, 0x0040_1000);
        assert_eq!(seg.filesz, 0x20);
        assert_eq!(seg.memsz, 0x100);
        assert_eq!(seg.flags, SegmentFlags::READ | SegmentFlags::WRITE);

        let info = image.segment_info(&mem, 1).unwrap();
        assert_eq!(info.mem_addr, 0x0040_1000);
        assert_eq!(info.length, 0x20);
        assert_eq!(info.mem_len, 0x100);
    }

    #[test]
    fn test_section_by_name_first_match_wins() {
        let mut ram = place(&sample(Machine::X64));
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        let (index, data) = image.section_by_name(&mem, ".data").unwrap();
        assert_eq!(index, 2);
        assert_eq!(data.addr, 0x0040_1000);
        assert!(image.section_by_name(&mem, ".dat").is_none());
        assert!(image.section_by_name(&mem, ".data.rel").is_none());
        assert!(image.section_by_name(&mem, ".bss").is_none());
    }

    #[test]
    fn test_section_name() {
        let mut ram = place(&sample(Machine::Ia32));
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(image.section_name(&mem, 1, &mut buf).unwrap(), b".text");
        let mut small = [0u8; 3];
        assert_eq!(image.section_name(&mem, 1, &mut small).unwrap(), b".te");
        assert_eq!(
            image.section_name(&mem, image.section_count(), &mut buf),
            Err(ElfError::NotFound)
        );
    }

    #[test]
    fn test_section_name_outside_string_table() {
        let elf = sample(Machine::X64);
        let mut ram = place(&elf);
        let mut mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        // Point .text's name one past the end of the string table
        let shoff = image.header.shoff;
        let sh_name = IMAGE_BASE + shoff + image.header.shentsize as u64;
        mem.write_u32(sh_name, image.string_table_length() as u32).unwrap();

        let mut buf = [0u8; 32];
        assert_eq!(image.section_name(&mem, 1, &mut buf), Err(ElfError::NotFound));
        assert!(image.section_position(&mem, 1).is_none());
        assert!(image.section_by_name(&mem, ".text").is_none());
        assert!(image.section_position(&mem, 2).is_some());
    }

    #[test]
    fn test_section_kinds() {
        let mut ram = place(&sample(Machine::X64));
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        let kinds: Vec<_> = image.sections(&mem).map(|(_, s)| s.kind()).collect();
        assert_eq!(
            kinds,
            [
                SectionKind::Other,
                SectionKind::Code,
                SectionKind::Data,
                SectionKind::Other,
                SectionKind::Code,
                SectionKind::Other
            ]
        );
    }

    #[test]
    fn test_missing_string_table_is_unsupported() {
        let mut elf = sample(Machine::Ia32);
        // e_shstrndx past the table
        elf[50..52].copy_from_slice(&100u16.to_le_bytes());
        let mut ram = place(&elf);
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Err(ElfError::Unsupported));
    }

    /// Address of byte `field` of the string table's section header
    fn strtab_field(image: &ElfImage, field: u64) -> u64 {
        let index = image.section_count() as u64 - 1;
        IMAGE_BASE + image.header.shoff + index * image.header.shentsize as u64 + field
    }

    #[test]
    fn test_string_table_outside_image_is_unsupported() {
        let mut ram = place(&sample(Machine::X64));
        let mut mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        let image = ElfImage::parse(&mem, IMAGE_BASE).unwrap();
        // Elf64_Shdr: sh_offset at 24, sh_size at 32
        let sh_offset = strtab_field(&image, 24);
        let sh_size = strtab_field(&image, 32);

        mem.write_u64(sh_offset, u64::MAX - 0x10).unwrap();
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Err(ElfError::Unsupported));

        mem.write_u64(sh_offset, image.string_table_offset()).unwrap();
        mem.write_u64(sh_size, RAM_SIZE as u64).unwrap();
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Err(ElfError::Unsupported));

        mem.write_u64(sh_size, image.string_table_length()).unwrap();
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Ok(image));
    }

    #[test]
    fn test_truncated_section_table_is_unsupported() {
        let elf = sample(Machine::X64);
        // Section headers sit at the end of the file; cut the last one off
        let mut ram = elf[..elf.len() - 8].to_vec();
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Err(ElfError::Unsupported));
    }

    #[test]
    fn test_short_entry_size_is_unsupported() {
        let mut elf = sample(Machine::X64);
        // e_shentsize smaller than an Elf64_Shdr
        elf[58..60].copy_from_slice(&40u16.to_le_bytes());
        let mut ram = place(&elf);
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        assert_eq!(ElfImage::parse(&mem, IMAGE_BASE), Err(ElfError::Unsupported));
    }

    #[test]
    fn test_parse_not_elf() {
        let mut ram = vec![0u8; 0x100];
        let mem = MemoryWindow::new(IMAGE_BASE, &mut ram);
        assert_eq!(
            ElfImage::parse(&mem, IMAGE_BASE),
            Err(ElfError::NotRecognized(Reject::BadMagic))
        );
        assert_eq!(
            ElfImage::parse(&mem, 0),
            Err(ElfError::NotRecognized(Reject::Truncated))
        );
    }
}

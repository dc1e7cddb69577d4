//! Synthetic image builders for unit tests.
//!
//! [`ElfBuilder`] lays an image out as: file header at 0, program headers
//! right after it, section data from 0x1000 on, then the section-name
//! string table and finally the section header table. Section 0 is the
//! null section and the string table is always the last section.

use crate::elf::constants::*;
use crate::elf::{Machine, WordClass};

/// Physical address tests map images at.
pub const IMAGE_BASE: u64 = 0x0010_0000;

/// Size of the RAM window tests load into, starting at [`IMAGE_BASE`].
pub const RAM_SIZE: usize = 0x0040_0000;

const DATA_START: u64 = 0x1000;

/// RAM of [`RAM_SIZE`] bytes with `image` copied to its start.
pub fn place(image: &[u8]) -> Vec<u8> {
    let mut ram = vec![0u8; RAM_SIZE];
    ram[..image.len()].copy_from_slice(image);
    ram
}

/// Bytes of a container info header.
pub fn info_header(header_length: u32, capability: u32, image_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(56);
    out.extend_from_slice(b"UPLD");
    out.extend_from_slice(&header_length.to_le_bytes());
    out.extend_from_slice(&0x0010u16.to_le_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&3u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&capability.to_le_bytes());
    let mut producer = [0u8; 16];
    producer[..4].copy_from_slice(b"SBL\0");
    out.extend_from_slice(&producer);
    let mut id = [0u8; 16];
    id[..image_id.len()].copy_from_slice(image_id.as_bytes());
    out.extend_from_slice(&id);
    out
}

struct Section {
    name: String,
    sh_type: u32,
    flags: SectionFlags,
    addr: u64,
    offset: u64,
    size: u64,
    info: u32,
    entsize: u64,
}

struct Segment {
    p_type: u32,
    flags: SegmentFlags,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
}

fn write_section(out: &mut Out, name: u32, s: &Section) {
    out.u32(name);
    out.u32(s.sh_type);
    out.word(s.flags.bits());
    out.word(s.addr);
    out.word(s.offset);
    out.word(s.size);
    out.u32(0);
    out.u32(s.info);
    out.word(if s.sh_type == SHT_NULL { 0 } else { 1 });
    out.word(s.entsize);
}

/// Little-endian writer with class-sized words.
struct Out {
    bytes: Vec<u8>,
    class: WordClass,
}

impl Out {
    fn u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn word(&mut self, v: u64) {
        match self.class {
            WordClass::Elf32 => self.u32(v as u32),
            WordClass::Elf64 => self.bytes.extend_from_slice(&v.to_le_bytes()),
        }
    }
}

pub struct ElfBuilder {
    machine: Machine,
    e_type: u16,
    entry: u64,
    blob: Vec<u8>,
    sections: Vec<Section>,
    segments: Vec<Segment>,
    strtab_offset: Option<u64>,
}

impl ElfBuilder {
    pub fn new(machine: Machine) -> Self {
        ElfBuilder {
            machine,
            e_type: ET_EXEC,
            entry: 0,
            blob: Vec::new(),
            sections: Vec::new(),
            segments: Vec::new(),
            strtab_offset: None,
        }
    }

    pub fn entry(mut self, entry: u64) -> Self {
        self.entry = entry;
        self
    }

    pub fn object_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    fn class(&self) -> WordClass {
        self.machine.word_class()
    }

    /// Append `bytes` to the file, 16-byte aligned. Returns the file offset.
    pub fn data(&mut self, bytes: &[u8]) -> u64 {
        let aligned = (self.blob.len() + 15) & !15;
        self.blob.resize(aligned, 0);
        self.blob.extend_from_slice(bytes);
        DATA_START + aligned as u64
    }

    /// Add a section header. Returns its index.
    pub fn section(
        &mut self,
        name: &str,
        sh_type: u32,
        flags: SectionFlags,
        addr: u64,
        offset: u64,
        size: u64,
    ) -> usize {
        self.sections.push(Section {
            name: name.into(),
            sh_type,
            flags,
            addr,
            offset,
            size,
            info: 0,
            entsize: 0,
        });
        self.sections.len()
    }

    fn reloc_table(&mut self, name: &str, target: usize, entries: &[(u64, u32, i64)], rela: bool) -> usize {
        let class = self.class();
        let mut out = Out { bytes: Vec::new(), class };
        for &(offset, r_type, addend) in entries {
            out.word(offset);
            // Symbol index 1, never looked at
            let info = match class {
                WordClass::Elf32 => (1 << 8) | r_type as u64,
                WordClass::Elf64 => (1 << 32) | r_type as u64,
            };
            out.word(info);
            if rela {
                out.word(addend as u64);
            }
        }
        let size = out.bytes.len() as u64;
        let offset = self.data(&out.bytes);
        let sh_type = if rela { SHT_RELA } else { SHT_REL };
        let index = self.section(name, sh_type, SectionFlags::empty(), 0, offset, size);
        let last = self.sections.len() - 1;
        self.sections[last].info = target as u32;
        self.sections[last].entsize = class.reloc_entry_size(rela) as u64;
        index
    }

    /// Add a REL section of `(r_offset, type)` entries against section `target`.
    pub fn rel(&mut self, name: &str, target: usize, entries: &[(u64, u32)]) -> usize {
        let entries: Vec<_> = entries.iter().map(|&(o, t)| (o, t, 0)).collect();
        self.reloc_table(name, target, &entries, false)
    }

    /// Add a RELA section of `(r_offset, type, addend)` entries.
    pub fn rela(&mut self, name: &str, target: usize, entries: &[(u64, u32, i64)]) -> usize {
        self.reloc_table(name, target, entries, true)
    }

    /// Override `sh_entsize` of section `index`.
    pub fn entsize(&mut self, index: usize, entsize: u64) {
        self.sections[index - 1].entsize = entsize;
    }

    /// Override `sh_offset` of section `index`.
    pub fn offset(&mut self, index: usize, offset: u64) {
        self.sections[index - 1].offset = offset;
    }

    /// Override `sh_offset` of the string table written by [`Self::build`].
    pub fn string_table_offset(&mut self, offset: u64) {
        self.strtab_offset = Some(offset);
    }

    /// Add a program header with identical virtual and physical address.
    pub fn segment(
        &mut self,
        p_type: u32,
        offset: u64,
        addr: u64,
        filesz: u64,
        memsz: u64,
        flags: SegmentFlags,
    ) {
        self.segment_split(p_type, offset, addr, addr, filesz, memsz, flags);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn segment_split(
        &mut self,
        p_type: u32,
        offset: u64,
        vaddr: u64,
        paddr: u64,
        filesz: u64,
        memsz: u64,
        flags: SegmentFlags,
    ) {
        self.segments.push(Segment {
            p_type,
            flags,
            offset,
            vaddr,
            paddr,
            filesz,
            memsz,
        });
    }

    /// Add a `.upld_info` section holding `bytes`. Returns the file offset.
    pub fn upld_info(&mut self, bytes: &[u8]) -> u64 {
        let offset = self.data(bytes);
        self.section(".upld_info", SHT_PROGBITS, SectionFlags::empty(), 0, offset, bytes.len() as u64);
        offset
    }

    pub fn build(mut self) -> Vec<u8> {
        let class = self.class();

        let mut names = vec![0u8];
        let mut name_offsets = Vec::new();
        for section in &self.sections {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(section.name.as_bytes());
            names.push(0);
        }
        let strtab_name = names.len() as u32;
        names.extend_from_slice(b".shstrtab\0");
        let strtab_offset = self.data(&names);

        let shoff = (DATA_START + self.blob.len() as u64 + 7) & !7;
        let shnum = self.sections.len() as u16 + 2;
        let phoff = if self.segments.is_empty() { 0 } else { class.header_size() as u64 };

        let mut out = Out { bytes: Vec::new(), class };
        out.bytes.extend_from_slice(&ELF_MAGIC);
        out.bytes.push(match class {
            WordClass::Elf32 => ELFCLASS32,
            WordClass::Elf64 => ELFCLASS64,
        });
        out.bytes.push(ELFDATA2LSB);
        out.bytes.push(EV_CURRENT as u8);
        out.bytes.resize(16, 0);
        out.u16(self.e_type);
        out.u16(self.machine.elf_machine());
        out.u32(EV_CURRENT);
        out.word(self.entry);
        out.word(phoff);
        out.word(shoff);
        out.u32(0);
        out.u16(class.header_size() as u16);
        out.u16(class.program_header_size() as u16);
        out.u16(self.segments.len() as u16);
        out.u16(class.section_header_size() as u16);
        out.u16(shnum);
        out.u16(shnum - 1);

        for seg in &self.segments {
            out.u32(seg.p_type);
            if class == WordClass::Elf64 {
                out.u32(seg.flags.bits());
            }
            out.word(seg.offset);
            out.word(seg.vaddr);
            out.word(seg.paddr);
            out.word(seg.filesz);
            out.word(seg.memsz);
            if class == WordClass::Elf32 {
                out.u32(seg.flags.bits());
            }
            out.word(0x1000);
        }
        assert!(out.bytes.len() as u64 <= DATA_START);
        out.bytes.resize(DATA_START as usize, 0);
        out.bytes.extend_from_slice(&self.blob);
        out.bytes.resize(shoff as usize, 0);

        let null = Section {
            name: String::new(),
            sh_type: SHT_NULL,
            flags: SectionFlags::empty(),
            addr: 0,
            offset: 0,
            size: 0,
            info: 0,
            entsize: 0,
        };
        write_section(&mut out, 0, &null);
        for (section, &name) in self.sections.iter().zip(&name_offsets) {
            write_section(&mut out, name, section);
        }
        let strtab = Section {
            name: String::new(),
            sh_type: SHT_STRTAB,
            flags: SectionFlags::empty(),
            addr: 0,
            offset: self.strtab_offset.unwrap_or(strtab_offset),
            size: names.len() as u64,
            info: 0,
            entsize: 0,
        };
        write_section(&mut out, strtab_name, &strtab);

        out.bytes
    }
}

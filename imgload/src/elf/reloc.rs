//! ELF Relocation Engine
//!
//! Applies REL/RELA relocation sections to an image that is not running at
//! its link-time address. No symbols are resolved: every supported type
//! either needs no fixup or stores a link-time absolute address that moves
//! with the section it points into.
//!
//! One formula covers both ways an image can be positioned. Each relocated
//! section gets a *section delta*:
//!
//! - segments were copied: the rebase delta saved by the segment loader
//! - image still in its buffer: `image_base + sh_offset - sh_addr`
//!
//! The fixup site is `r_offset + delta` and an absolute value `v` becomes
//! `v + delta`.

use super::constants::*;
use super::header::{FieldReader, Machine, WordClass};
use super::image::{ElfImage, SectionHeader, SectionKind};
use crate::config::{LoaderConfig, RelocPolicy};
use crate::error::{ElfError, ElfResult};
use crate::memory::AddressSpace;

/// What a relocation type asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// Already correct wherever the image lands
    None,
    /// 32-bit absolute address
    Abs32,
    /// 64-bit absolute address
    Abs64,
    /// Type this engine does not know
    Unknown,
}

impl Machine {
    /// Map a raw relocation type to the fixup it requires on this machine.
    pub fn fixup_kind(self, r_type: u32) -> FixupKind {
        match self {
            Machine::Ia32 => match r_type {
                R_386_NONE | R_386_PC32 => FixupKind::None,
                R_386_32 => FixupKind::Abs32,
                _ => FixupKind::Unknown,
            },
            Machine::X64 => match r_type {
                R_X86_64_NONE
                | R_X86_64_PC32
                | R_X86_64_PLT32
                | R_X86_64_GOTPCREL
                | R_X86_64_GOTPCRELX
                | R_X86_64_REX_GOTPCRELX => FixupKind::None,
                R_X86_64_64 => FixupKind::Abs64,
                R_X86_64_32 => FixupKind::Abs32,
                _ => FixupKind::Unknown,
            },
        }
    }
}

/// One decoded REL or RELA record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Link-time address of the field to fix up
    pub offset: u64,
    pub r_type: u32,
    /// Symbol index, decoded for tracing only
    pub symbol: u32,
    /// Explicit addend of RELA records
    pub addend: Option<i64>,
}

impl RelocEntry {
    fn decode(bytes: &[u8], class: WordClass, with_addend: bool) -> ElfResult<Self> {
        let mut r = FieldReader::new(bytes, class);
        let offset = r.word()?;
        let info = r.word()?;
        let (symbol, r_type) = match class {
            WordClass::Elf32 => ((info >> 8) as u32, (info & 0xFF) as u32),
            WordClass::Elf64 => ((info >> 32) as u32, info as u32),
        };
        let addend = if with_addend { Some(r.sword()?) } else { None };
        Ok(RelocEntry {
            offset,
            r_type,
            symbol,
            addend,
        })
    }
}

/// Counters reported by [`ElfImage::relocate`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocStats {
    /// Relocation sections applied
    pub sections: usize,
    /// Fields rewritten
    pub applied: usize,
    /// Entries skipped under [`RelocPolicy::Permissive`]
    pub skipped: usize,
}

impl ElfImage {
    /// The allocatable section holding the link-time entry point.
    pub fn code_section<M: AddressSpace + ?Sized>(&self, mem: &M) -> Option<(usize, SectionHeader)> {
        let entry = self.link_entry();
        self.sections(mem)
            .find(|(_, s)| s.is_allocatable() && s.contains_addr(entry))
    }

    fn section_delta(&self, section: &SectionHeader) -> i64 {
        self.rebase_delta.unwrap_or_else(|| {
            self.image_base
                .wrapping_add(section.offset)
                .wrapping_sub(section.addr) as i64
        })
    }

    /// Apply every relocation section that targets a code or data section,
    /// then recompute the entry point.
    ///
    /// Call after [`Self::load_segments`] when the image was copied, or
    /// directly after [`Self::parse`] to relocate it inside its buffer.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::Unsupported)` - The image is not for `config.arch`,
    ///   or an unknown relocation type was met under the strict policy
    /// * `Err(ElfError::CorruptImage)` - A relocation table declares an
    ///   entry size smaller than its records, or its range overflows the
    ///   address space
    /// * `Err(ElfError::Memory)` - A table or fixup site is not backed
    pub fn relocate<M: AddressSpace + ?Sized>(
        &mut self,
        mem: &mut M,
        config: &LoaderConfig,
    ) -> ElfResult<RelocStats> {
        if self.machine() != config.arch {
            log::warn!(
                "[ELF] Cannot relocate {:?} image for {:?}",
                self.machine(),
                config.arch
            );
            return Err(ElfError::Unsupported);
        }

        let mut stats = RelocStats::default();
        for index in 0..self.section_count() {
            let Some(section) = self.section_by_index(mem, index) else {
                continue;
            };
            if !section.is_relocation() {
                continue;
            }
            let Some(target) = self.section_by_index(mem, section.info as usize) else {
                log::debug!("[ELF] Relocation section {} has no target", index);
                continue;
            };
            // Relocations against debug or metadata sections are never applied
            if !matches!(target.kind(), SectionKind::Code | SectionKind::Data) {
                continue;
            }

            let delta = self.section_delta(&target);
            log::debug!(
                "[ELF] Applying relocation section {} to section {} ({:?}), delta={:#x}",
                index,
                section.info,
                target.kind(),
                delta
            );
            self.apply_section(mem, &section, delta, config.reloc_policy, &mut stats)?;
            stats.sections += 1;
        }

        let delta = match self.code_section(mem) {
            Some((_, code)) => self.section_delta(&code),
            None => self.rebase_delta.unwrap_or(0),
        };
        self.entry_point = self.link_entry().wrapping_add(delta as u64);
        log::info!(
            "[ELF] Relocated {} sections ({} fixups, {} skipped), entry={:#x}",
            stats.sections,
            stats.applied,
            stats.skipped,
            self.entry_point
        );
        Ok(stats)
    }

    fn apply_section<M: AddressSpace + ?Sized>(
        &self,
        mem: &mut M,
        section: &SectionHeader,
        delta: i64,
        policy: RelocPolicy,
        stats: &mut RelocStats,
    ) -> ElfResult<()> {
        let with_addend = section.sh_type == SHT_RELA;
        let natural = self.class().reloc_entry_size(with_addend);
        let entsize = match section.entsize {
            0 => natural as u64,
            n if n < natural as u64 => return Err(ElfError::CorruptImage),
            n => n,
        };

        let table = self
            .image_base
            .checked_add(section.offset)
            .filter(|t| t.checked_add(section.size).is_some())
            .ok_or(ElfError::CorruptImage)?;
        let mut buf = [0u8; 24];
        for i in 0..section.size / entsize {
            mem.read(table + i * entsize, &mut buf[..natural])?;
            let entry = RelocEntry::decode(&buf[..natural], self.class(), with_addend)?;
            let site = entry.offset.wrapping_add(delta as u64);

            let kind = self.machine().fixup_kind(entry.r_type);
            log::trace!(
                "[ELF] reloc type={} sym={} addend={:?} at {:#x}: {:?}",
                entry.r_type,
                entry.symbol,
                entry.addend,
                site,
                kind
            );
            match kind {
                FixupKind::None => {}
                FixupKind::Abs32 => {
                    mem.add_u32(site, delta as u32)?;
                    stats.applied += 1;
                }
                FixupKind::Abs64 => {
                    mem.add_u64(site, delta as u64)?;
                    stats.applied += 1;
                }
                FixupKind::Unknown => match policy {
                    RelocPolicy::Permissive => {
                        log::warn!(
                            "[ELF] Skipping unsupported relocation type {} at {:#x}",
                            entry.r_type,
                            site
                        );
                        stats.skipped += 1;
                    }
                    RelocPolicy::Strict => {
                        log::error!(
                            "[ELF] Unsupported relocation type {} at {:#x}",
                            entry.r_type,
                            site
                        );
                        return Err(ElfError::Unsupported);
                    }
                },
            }
        }
        Ok(())
    }
}

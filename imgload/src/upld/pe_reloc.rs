//! PE/COFF-style Relocation Table
//!
//! Payloads that advertise [`Capability::RELOCATION_TABLE`] carry a base
//! relocation table in the PE/COFF block format right after their info
//! header. It is an alternative to the ELF relocation engine and shares
//! nothing with it except the delta arithmetic of [`AddressSpace`].
//!
//! Layout of the table header (20 bytes, little-endian):
//!
//! | Offset | Field          |
//! |--------|----------------|
//! | 0      | identifier     |
//! | 4      | header_length  |
//! | 8      | revision       |
//! | 10     | format         |
//! | 11     | reserved       |
//! | 12     | stripped       |
//! | 16     | image_offset   |
//!
//! [`Capability::RELOCATION_TABLE`]: super::Capability::RELOCATION_TABLE

use crate::config::RelocPolicy;
use crate::elf::header::{FieldReader, WordClass};
use crate::error::{ElfError, ElfResult};
use crate::memory::AddressSpace;

/// Relocation table identifier: "PLDR"
pub const RELOC_TABLE_IDENTIFIER: u32 = u32::from_le_bytes(*b"PLDR");

/// Size of the relocation table header
pub const RELOC_HEADER_SIZE: u64 = 20;

/// Size of a block header (page RVA + block size)
const BLOCK_HEADER_SIZE: u64 = 8;

// Base relocation types
pub const IMAGE_REL_BASED_ABSOLUTE: u8 = 0;
pub const IMAGE_REL_BASED_HIGH: u8 = 1;
pub const IMAGE_REL_BASED_LOW: u8 = 2;
pub const IMAGE_REL_BASED_HIGHLOW: u8 = 3;
pub const IMAGE_REL_BASED_DIR64: u8 = 10;

/// Where the relocation blocks live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    /// Blocks follow the header inline
    Raw,
    /// An 8-byte `{page_rva, size}` record locates the blocks in the image
    Pointer,
}

/// Decoded relocation table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocTableHeader {
    /// Header plus inline block data
    pub header_length: u32,
    pub revision: u16,
    pub format: TableFormat,
    /// Bytes stripped from the front of the original image
    pub stripped: u32,
    /// Offset of the relocated image from the actual base
    pub image_offset: u32,
}

impl RelocTableHeader {
    /// Read the table header at `addr`.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::NotFound)` - Identifier mismatch
    /// * `Err(ElfError::Unsupported)` - Unknown table format
    pub fn read<M: AddressSpace + ?Sized>(mem: &M, addr: u64) -> ElfResult<Self> {
        let mut buf = [0u8; RELOC_HEADER_SIZE as usize];
        mem.read(addr, &mut buf)?;
        let mut r = FieldReader::new(&buf, WordClass::Elf32);
        if r.u32()? != RELOC_TABLE_IDENTIFIER {
            return Err(ElfError::NotFound);
        }
        let header_length = r.u32()?;
        let revision = r.u16()?;
        let format = match r.u8()? {
            0 => TableFormat::Raw,
            1 => TableFormat::Pointer,
            other => {
                log::error!("[PE-RELOC] Relocation format {} is not supported", other);
                return Err(ElfError::Unsupported);
            }
        };
        let _reserved = r.u8()?;
        Ok(RelocTableHeader {
            header_length,
            revision,
            format,
            stripped: r.u32()?,
            image_offset: r.u32()?,
        })
    }

    /// Locate the block data: start address and length.
    fn blocks<M: AddressSpace + ?Sized>(
        &self,
        mem: &M,
        header_addr: u64,
        act_base: u64,
    ) -> ElfResult<(u64, u64)> {
        let after_header = header_addr + RELOC_HEADER_SIZE;
        match self.format {
            TableFormat::Raw => {
                let len = (self.header_length as u64)
                    .checked_sub(RELOC_HEADER_SIZE)
                    .ok_or(ElfError::CorruptImage)?;
                Ok((after_header, len))
            }
            TableFormat::Pointer => {
                let page_rva = mem.read_u32(after_header)?;
                let size = mem.read_u32(after_header + 4)?;
                Ok((act_base.wrapping_add(page_rva as u64), size as u64))
            }
        }
    }

    /// Apply every block of the table to the image at `act_base`.
    ///
    /// Processing stops at a block size of 0 or when fewer than 8 bytes
    /// remain; trailing bytes are ignored. Returns the number of fields
    /// rewritten.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::CorruptImage)` - A block is shorter than its header
    ///   or runs past the end of the table
    /// * `Err(ElfError::Unsupported)` - Unknown fixup type under the strict
    ///   policy
    pub fn apply<M: AddressSpace + ?Sized>(
        &self,
        mem: &mut M,
        header_addr: u64,
        act_base: u64,
        delta: i64,
        policy: RelocPolicy,
    ) -> ElfResult<usize> {
        let (mut pos, len) = self.blocks(mem, header_addr, act_base)?;
        let end = pos.checked_add(len).ok_or(ElfError::CorruptImage)?;
        let image = act_base
            .wrapping_add(self.image_offset as u64)
            .wrapping_sub(self.stripped as u64);
        let delta = delta as u64;
        log::debug!(
            "[PE-RELOC] Table at {:#x}+{:#x}, delta={:#x}, stripped={:#x}",
            pos,
            len,
            delta,
            self.stripped
        );

        let mut applied = 0;
        while end - pos >= BLOCK_HEADER_SIZE {
            let page_rva = mem.read_u32(pos)? as u64;
            let block_size = mem.read_u32(pos + 4)? as u64;
            if block_size == 0 {
                break;
            }
            if block_size < BLOCK_HEADER_SIZE || block_size > end - pos {
                log::error!(
                    "[PE-RELOC] Bad block size {:#x} at {:#x}",
                    block_size,
                    pos
                );
                return Err(ElfError::CorruptImage);
            }

            let count = (block_size - BLOCK_HEADER_SIZE) / 2;
            for i in 0..count {
                let type_offset = mem.read_u16(pos + BLOCK_HEADER_SIZE + i * 2)?;
                let kind = (type_offset >> 12) as u8;
                let offset = (type_offset & 0x0FFF) as u64;
                let site = image.wrapping_add(page_rva + offset);
                log::trace!("[PE-RELOC] type={} at {:#x}", kind, site);

                match kind {
                    IMAGE_REL_BASED_ABSOLUTE => continue,
                    // Half-deltas are added to the whole 32-bit word, so a
                    // carry reaches the upper half
                    IMAGE_REL_BASED_HIGH => {
                        mem.add_u32(site, (delta >> 16) as u32 & 0xFFFF)?;
                    }
                    IMAGE_REL_BASED_LOW => {
                        mem.add_u32(site, delta as u32 & 0xFFFF)?;
                    }
                    IMAGE_REL_BASED_HIGHLOW => {
                        mem.add_u32(site, delta as u32)?;
                    }
                    IMAGE_REL_BASED_DIR64 => {
                        mem.add_u64(site, delta)?;
                    }
                    _ => match policy {
                        RelocPolicy::Permissive => {
                            log::warn!("[PE-RELOC] Unknown relocation type {} at {:#x}", kind, site);
                            continue;
                        }
                        RelocPolicy::Strict => {
                            log::error!("[PE-RELOC] Unknown relocation type {} at {:#x}", kind, site);
                            return Err(ElfError::Unsupported);
                        }
                    },
                }
                applied += 1;
            }
            pos += block_size;
        }

        log::debug!("[PE-RELOC] {} fixups applied", applied);
        Ok(applied)
    }
}

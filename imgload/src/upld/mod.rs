//! Universal Payload Containers
//!
//! A container is an ELF image with two kinds of well-known sections:
//!
//! - `.upld_info`: the [`InfoHeader`] identifying the payload and its
//!   capabilities, optionally followed by a PE-style relocation table
//! - `.upld.<name>`: named sub-images (kernel, initrd, cmdline, ...) the
//!   next stage picks up by name
//!
//! [`load_container`] validates the container, decides between executing it
//! in place and copying its segments, makes it runnable, and reports the
//! sub-images together with the entry point.

pub mod pe_reloc;

use heapless::{String, Vec};

use crate::config::{
    page_align_down, LoaderConfig, MAX_PAYLOAD_IMAGES, SUB_IMAGE_NAME_LEN, UPLD_IMAGE_PREFIX,
    UPLD_INFO_SECTION,
};
use crate::elf::header::{FieldReader, WordClass};
use crate::elf::{ElfImage, Machine, ProgramHeader, SectionHeader};
use crate::error::{ElfError, ElfResult, UpldError, UpldResult};
use crate::memory::{AddressSpace, MemoryError};
use pe_reloc::RelocTableHeader;

/// Info header identifier: "UPLD"
pub const UPLD_IDENTIFIER: u32 = u32::from_le_bytes(*b"UPLD");

/// Size of the info header on the wire
pub const INFO_HEADER_SIZE: usize = 56;

/// Size of one extra-data entry: identifier, base, size
pub const EXTRA_DATA_ENTRY_SIZE: usize = 32;

bitflags::bitflags! {
    /// Capabilities advertised by the info header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capability: u32 {
        /// A PE-style relocation table follows the info header
        const RELOCATION_TABLE = 1 << 0;
    }
}

/// Container identification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoHeader {
    pub identifier: u32,
    /// Length of the header; a relocation table starts right after it
    pub header_length: u32,
    pub spec_revision: u16,
    pub revision: u32,
    pub attribute: u32,
    pub capability: Capability,
    pub producer_id: [u8; 16],
    pub image_id: [u8; 16],
}

impl InfoHeader {
    /// Decode an info header, `None` if `bytes` is too short or the
    /// identifier does not match.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < INFO_HEADER_SIZE {
            return None;
        }
        let mut r = FieldReader::new(bytes, WordClass::Elf32);
        let identifier = r.u32().ok()?;
        if identifier != UPLD_IDENTIFIER {
            return None;
        }
        let header_length = r.u32().ok()?;
        let spec_revision = r.u16().ok()?;
        r.skip(2).ok()?;
        let revision = r.u32().ok()?;
        let attribute = r.u32().ok()?;
        let capability = Capability::from_bits_retain(r.u32().ok()?);
        let mut producer_id = [0u8; 16];
        producer_id.copy_from_slice(&bytes[24..40]);
        let mut image_id = [0u8; 16];
        image_id.copy_from_slice(&bytes[40..56]);
        Some(InfoHeader {
            identifier,
            header_length,
            spec_revision,
            revision,
            attribute,
            capability,
            producer_id,
            image_id,
        })
    }

    pub fn producer_id_str(&self) -> &str {
        c_str(&self.producer_id)
    }

    pub fn image_id_str(&self) -> &str {
        c_str(&self.image_id)
    }
}

/// Longest valid UTF-8 prefix of `bytes` before the first NUL.
fn c_str(bytes: &[u8]) -> &str {
    let bytes = bytes.split(|&b| b == 0).next().unwrap_or(&[]);
    match core::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or(""),
    }
}

/// A named sub-image carried in a `.upld.<name>` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubImage {
    /// Section name without the prefix, truncated to 16 bytes
    pub name: String<SUB_IMAGE_NAME_LEN>,
    /// Address of the section data
    pub base: u64,
    pub size: u64,
}

/// How the container was made runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Relocated where it sits; no bytes were moved
    ExecuteInPlace,
    /// Segments copied to their physical addresses and zero-filled
    SegmentCopy,
}

/// Everything the next stage needs from a loaded container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerMetadata {
    pub info_header: InfoHeader,
    pub machine: Machine,
    pub entry_point: u64,
    pub image_base: u64,
    pub payload_base: u64,
    pub payload_size: u64,
    pub strategy: LoadStrategy,
    /// At most [`MAX_PAYLOAD_IMAGES`] sub-images, in section order
    pub images: Vec<SubImage, MAX_PAYLOAD_IMAGES>,
}

impl ContainerMetadata {
    /// Find a sub-image by name
    pub fn image(&self, name: &str) -> Option<&SubImage> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Serialize the sub-image list as an extra-data record: `count: u32`
    /// followed by `count` entries of `{ identifier: [u8; 16], base: u64,
    /// size: u64 }`.
    ///
    /// Returns the number of bytes written, `None` if `buf` is too small.
    pub fn encode_extra_data(&self, buf: &mut [u8]) -> Option<usize> {
        let len = 4 + self.images.len() * EXTRA_DATA_ENTRY_SIZE;
        let out = buf.get_mut(..len)?;
        out.fill(0);
        out[..4].copy_from_slice(&(self.images.len() as u32).to_le_bytes());
        for (image, entry) in self
            .images
            .iter()
            .zip(out[4..].chunks_exact_mut(EXTRA_DATA_ENTRY_SIZE))
        {
            let name = image.name.as_bytes();
            entry[..name.len()].copy_from_slice(name);
            entry[16..24].copy_from_slice(&image.base.to_le_bytes());
            entry[24..32].copy_from_slice(&image.size.to_le_bytes());
        }
        Some(len)
    }
}

/// Copy the NUL-terminated text of a cmdline sub-image into `buf`.
///
/// Stops at the first NUL, the end of the sub-image or the end of `buf`,
/// whichever comes first, and drops a trailing partial UTF-8 sequence.
pub fn read_cmdline<'b, M: AddressSpace + ?Sized>(
    mem: &M,
    image: &SubImage,
    buf: &'b mut [u8],
) -> Result<&'b str, MemoryError> {
    let len = usize::try_from(image.size).unwrap_or(usize::MAX).min(buf.len());
    mem.read(image.base, &mut buf[..len])?;
    Ok(c_str(&buf[..len]))
}

/// Load the container at `image_base` and make it runnable.
///
/// 1. Parse the ELF image
/// 2. Read the info header from `.upld_info`
/// 3. Collect `.upld.<name>` sub-images
/// 4. If any PT_LOAD segment needs zero fill, copy the segments to their
///    physical addresses; otherwise relocate in place, with the PE-style
///    table when the info header advertises one
///
/// # Returns
///
/// * `Err(UpldError::Unsupported)` - Not a supported ELF image, or the
///   relocation table format is unknown
/// * `Err(UpldError::NotFound)` - No valid info header
/// * `Err(UpldError::Aborted)` - The container was recognized but could not
///   be made runnable. Target memory is indeterminate.
pub fn load_container<M: AddressSpace + ?Sized>(
    mem: &mut M,
    image_base: u64,
    config: &LoaderConfig,
) -> UpldResult<ContainerMetadata> {
    let mut image = ElfImage::parse(mem, image_base).map_err(|e| {
        log::error!("[UPLD] Image at {:#x} is not loadable: {}", image_base, e);
        UpldError::Unsupported
    })?;

    let Some((_, info_section)) = image.section_by_name(mem, UPLD_INFO_SECTION) else {
        log::error!("[UPLD] No {} section", UPLD_INFO_SECTION);
        return Err(UpldError::NotFound);
    };
    let info_header = read_info_header(mem, &image, &info_section).ok_or_else(|| {
        log::error!("[UPLD] Invalid info header");
        UpldError::NotFound
    })?;
    log::info!(
        "[UPLD] Payload '{}' from '{}', revision {:#x}, capability {:?}",
        info_header.image_id_str(),
        info_header.producer_id_str(),
        info_header.revision,
        info_header.capability
    );

    let images = collect_sub_images(mem, &image)?;

    let zero_fill = image
        .segments(mem)
        .filter(ProgramHeader::is_load)
        .any(|s| s.memsz != s.filesz);
    let strategy = if zero_fill {
        LoadStrategy::SegmentCopy
    } else {
        LoadStrategy::ExecuteInPlace
    };
    log::info!("[UPLD] Load strategy: {:?}", strategy);

    let abort = |e: ElfError| {
        log::error!("[UPLD] Loading failed: {}", e);
        UpldError::Aborted
    };

    let entry_point = match strategy {
        LoadStrategy::SegmentCopy => {
            image.load_segments(mem, None).map_err(abort)?;
            image.entry_point()
        }
        LoadStrategy::ExecuteInPlace
            if info_header.capability.contains(Capability::RELOCATION_TABLE) =>
        {
            check_in_place(mem, &image).map_err(abort)?;
            let table = image_base
                .checked_add(info_section.offset)
                .and_then(|a| a.checked_add(info_header.header_length as u64))
                .ok_or_else(|| abort(ElfError::CorruptImage))?;
            apply_reloc_table(mem, &image, table, config)?
        }
        LoadStrategy::ExecuteInPlace => {
            check_in_place(mem, &image).map_err(abort)?;
            image.relocate(mem, config).map_err(abort)?;
            image.entry_point()
        }
    };

    let (payload_base, payload_size) = payload_extent(mem, &image, strategy);
    log::info!(
        "[UPLD] Payload {:#x}+{:#x}, entry={:#x}, {} sub-images",
        payload_base,
        payload_size,
        entry_point,
        images.len()
    );

    Ok(ContainerMetadata {
        info_header,
        machine: image.machine(),
        entry_point,
        image_base,
        payload_base,
        payload_size,
        strategy,
        images,
    })
}

fn read_info_header<M: AddressSpace + ?Sized>(
    mem: &M,
    image: &ElfImage,
    section: &SectionHeader,
) -> Option<InfoHeader> {
    if section.size < INFO_HEADER_SIZE as u64 {
        return None;
    }
    let mut buf = [0u8; INFO_HEADER_SIZE];
    mem.read(image.image_base().checked_add(section.offset)?, &mut buf).ok()?;
    InfoHeader::decode(&buf)
}

/// Sub-images in section order. One whose data lies outside the address
/// space aborts the load.
fn collect_sub_images<M: AddressSpace + ?Sized>(
    mem: &M,
    image: &ElfImage,
) -> UpldResult<Vec<SubImage, MAX_PAYLOAD_IMAGES>> {
    let prefix = UPLD_IMAGE_PREFIX.as_bytes();
    let mut images = Vec::new();
    let mut buf = [0u8; 64];

    for (index, section) in image.sections(mem) {
        let Ok(name) = image.section_name(mem, index, &mut buf) else {
            continue;
        };
        let Some(suffix) = name.strip_prefix(prefix) else {
            continue;
        };

        let mut sub_name = String::new();
        for c in c_str(suffix).chars() {
            if sub_name.push(c).is_err() {
                break;
            }
        }
        let base = image
            .image_base()
            .checked_add(section.offset)
            .filter(|&base| mem.contains(base, section.size));
        let Some(base) = base else {
            log::error!(
                "[UPLD] Sub-image '{}' at offset {:#x}+{:#x} lies outside the image",
                sub_name,
                section.offset,
                section.size
            );
            return Err(UpldError::Aborted);
        };
        let sub = SubImage {
            name: sub_name,
            base,
            size: section.size,
        };
        log::debug!(
            "[UPLD] Sub-image '{}' at {:#x}+{:#x}",
            sub.name,
            sub.base,
            sub.size
        );
        if images.push(sub).is_err() {
            log::warn!(
                "[UPLD] More than {} sub-images, ignoring the rest",
                MAX_PAYLOAD_IMAGES
            );
            break;
        }
    }
    Ok(images)
}

/// Check that the file data of every PT_LOAD segment is backed, so the
/// image can run where it sits.
fn check_in_place<M: AddressSpace + ?Sized>(mem: &M, image: &ElfImage) -> ElfResult<()> {
    for segment in image.segments(mem).filter(ProgramHeader::is_load) {
        let start = image
            .image_base()
            .checked_add(segment.offset)
            .ok_or(ElfError::CorruptImage)?;
        if !mem.contains(start, segment.filesz) {
            return Err(ElfError::Memory(MemoryError {
                addr: start,
                len: segment.filesz,
            }));
        }
    }
    Ok(())
}

/// Apply the PE-style relocation table at `table` and return the entry.
fn apply_reloc_table<M: AddressSpace + ?Sized>(
    mem: &mut M,
    image: &ElfImage,
    table: u64,
    config: &LoaderConfig,
) -> UpldResult<u64> {
    let header = RelocTableHeader::read(mem, table).map_err(|e| match e {
        ElfError::Unsupported => UpldError::Unsupported,
        _ => {
            log::error!("[UPLD] Relocation table is invalid: {}", e);
            UpldError::Aborted
        }
    })?;

    let Some(first) = image.segments(mem).find(ProgramHeader::is_load) else {
        log::error!("[UPLD] No loadable segment to relocate against");
        return Err(UpldError::Aborted);
    };
    let Some(start) = image.image_base().checked_add(first.offset) else {
        log::error!("[UPLD] First segment offset {:#x} is out of range", first.offset);
        return Err(UpldError::Aborted);
    };
    let actual = page_align_down(start);
    let delta = actual.wrapping_sub(page_align_down(first.vaddr)) as i64;

    header
        .apply(mem, table, image.image_base(), delta, config.reloc_policy)
        .map_err(|e| {
            log::error!("[UPLD] Payload relocation failed: {}", e);
            UpldError::Aborted
        })?;
    Ok(image.link_entry().wrapping_add(delta as u64))
}

/// Bounds of the loaded payload.
///
/// Segment copy covers the physical ranges of the PT_LOAD segments,
/// execute-in-place the file ranges they occupy inside the image. An image
/// without loadable segments falls back to its allocatable sections.
fn payload_extent<M: AddressSpace + ?Sized>(
    mem: &M,
    image: &ElfImage,
    strategy: LoadStrategy,
) -> (u64, u64) {
    let base = image.image_base();
    let ranges = image.segments(mem).filter(ProgramHeader::is_load).map(|s| match strategy {
        LoadStrategy::SegmentCopy => (s.paddr, s.paddr.saturating_add(s.memsz)),
        LoadStrategy::ExecuteInPlace => {
            let start = base.saturating_add(s.offset);
            (start, start.saturating_add(s.filesz))
        }
    });
    let extent = ranges.fold(None, union);

    let extent = extent.or_else(|| {
        image
            .sections(mem)
            .filter(|(_, s)| s.is_allocatable())
            .map(|(_, s)| {
                let start = base.saturating_add(s.offset);
                (start, start.saturating_add(s.size))
            })
            .fold(None, union)
    });

    match extent {
        Some((start, end)) => (start, end - start),
        None => (base, 0),
    }
}

fn union(acc: Option<(u64, u64)>, (start, end): (u64, u64)) -> Option<(u64, u64)> {
    Some(match acc {
        Some((s, e)) => (s.min(start), e.max(end)),
        None => (start, end),
    })
}

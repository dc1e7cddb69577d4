//! ELF Engine
//!
//! Validation, structural access, segment loading and relocation for
//! little-endian ELF32 (IA-32) and ELF64 (x64) executables and shared
//! objects.
//!
//! Typical use:
//!
//! ```ignore
//! let mut image = ElfImage::parse(&mem, base)?;
//! image.load_segments(&mut mem, None)?;   // copy to physical addresses
//! // or
//! image.relocate(&mut mem, &config)?;     // fix up in place
//! jump(image.entry_point());
//! ```

pub mod constants;
pub mod header;
pub mod image;
pub mod reloc;
pub mod segment;

pub use header::{classify, is_elf_image, ImageInfo, Machine, ObjectKind, WordClass};
pub use image::{ElfImage, ProgramHeader, SectionHeader, SectionKind, SectionPos, SegmentInfo};
pub use reloc::{FixupKind, RelocEntry, RelocStats};
pub use segment::load_elf_image;

//! Firmware Image Loader
//!
//! Parses executable images laid out in memory, validates them, and makes
//! them runnable either by copying their loadable segments to their target
//! physical addresses or by relocating them where they already are.
//!
//! # Architecture
//!
//! - `elf`: ELF32/ELF64 header validation, structural access, segment
//!   loading and REL/RELA relocation for IA-32 and x64 images
//! - `upld`: universal payload containers, an ELF image carrying an info
//!   header and named sub-images (kernel, initrd, cmdline, ...)
//! - `memory`: the address-space seam every read and write goes through
//! - `config`: constants and runtime loader options
//!
//! Everything runs to completion on the caller's thread and never
//! allocates. If an operation fails part way, the destination memory is
//! left in an indeterminate state and must not be executed.

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod elf;
pub mod error;
pub mod memory;
pub mod upld;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{LoaderConfig, RelocPolicy};
pub use elf::{
    classify, is_elf_image, load_elf_image, ElfImage, ImageInfo, Machine, ObjectKind,
    ProgramHeader, RelocStats, SectionHeader, SectionKind, SectionPos, SegmentInfo, WordClass,
};
pub use error::{ElfError, ElfResult, Reject, UpldError, UpldResult};
pub use memory::{AddressSpace, IdentityMapped, MemoryError, MemoryWindow};
pub use upld::{
    load_container, read_cmdline, Capability, ContainerMetadata, InfoHeader, LoadStrategy, SubImage,
};

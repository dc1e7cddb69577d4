//! ELF Segment Loader
//!
//! Materializes the PT_LOAD segments of a parsed image at their physical
//! addresses.
//!
//! # Process
//!
//! 1. For each program header:
//!    a. Skip segments that are not loadable, reserve no memory, or have
//!       no backing data (file offset 0)
//!    b. Reject segments claiming more file bytes than memory bytes
//!    c. Copy the file bytes to the target, then zero-fill the tail
//! 2. Set the entry point to the link-time entry moved by the same delta

use super::constants::segment_permissions;
use super::image::ElfImage;
use crate::config::page_align_down;
use crate::error::{ElfError, ElfResult};
use crate::memory::AddressSpace;

impl ElfImage {
    /// Copy every loadable segment to its target and compute the entry point.
    ///
    /// With `target_base = None` each segment goes to its recorded physical
    /// address. With `Some(base)` the first loadable segment's page-aligned
    /// physical address is moved to `base` and every other segment is moved
    /// by the same delta.
    ///
    /// Copies tolerate overlap, so an image already sitting at its final
    /// address loads in place.
    ///
    /// # Returns
    ///
    /// * `Err(ElfError::CorruptImage)` - A segment's file size exceeds its
    ///   memory size, or its file offset runs past the end of the address
    ///   range. That segment is not copied; earlier ones may have been.
    /// * `Err(ElfError::Memory)` - A source or target range is not backed
    pub fn load_segments<M: AddressSpace + ?Sized>(
        &mut self,
        mem: &mut M,
        target_base: Option<u64>,
    ) -> ElfResult<()> {
        let mut delta: Option<i64> = None;

        for index in 0..self.segment_count() {
            let segment = self
                .segment_by_index(mem, index)
                .ok_or(ElfError::CorruptImage)?;
            if !segment.needs_copy() {
                continue;
            }
            if segment.filesz > segment.memsz {
                log::error!(
                    "[ELF] Segment {} file size {:#x} exceeds memory size {:#x}",
                    index,
                    segment.filesz,
                    segment.memsz
                );
                return Err(ElfError::CorruptImage);
            }

            let seg_delta = match (delta, target_base) {
                (Some(d), _) => d,
                (None, Some(base)) => {
                    let d = base.wrapping_sub(page_align_down(segment.paddr)) as i64;
                    log::debug!("[ELF] Rebasing to {:#x}, delta={:#x}", base, d);
                    delta = Some(d);
                    d
                }
                (None, None) => 0,
            };

            let target = segment.paddr.wrapping_add(seg_delta as u64);
            let source = self
                .image_base
                .checked_add(segment.offset)
                .ok_or(ElfError::CorruptImage)?;
            mem.copy(target, source, segment.filesz)?;
            // Zero-fill BSS
            mem.fill(
                target.wrapping_add(segment.filesz),
                segment.memsz - segment.filesz,
                0,
            )?;

            log::debug!(
                "[ELF] Segment {}: {:#x}+{:#x} -> {:#x}+{:#x} {}",
                index,
                source,
                segment.filesz,
                target,
                segment.memsz,
                segment_permissions(segment.flags)
            );
        }

        let delta = delta.unwrap_or(0);
        self.rebase_delta = Some(delta);
        self.entry_point = self.link_entry().wrapping_add(delta as u64);
        log::info!("[ELF] Segments loaded, entry={:#x}", self.entry_point);
        Ok(())
    }
}

/// Parse the image at `image_base`, load its segments at their recorded
/// addresses and return the entry point.
pub fn load_elf_image<M: AddressSpace + ?Sized>(mem: &mut M, image_base: u64) -> ElfResult<u64> {
    let mut image = ElfImage::parse(mem, image_base)?;
    image.load_segments(mem, None)?;
    Ok(image.entry_point())
}

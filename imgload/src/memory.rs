//! Physical Memory Access
//!
//! The loader never casts raw addresses to header types. Every read of image
//! bytes and every write to a load target goes through an [`AddressSpace`],
//! which bounds-checks the access before touching memory.
//!
//! Two address spaces are provided:
//!
//! - [`MemoryWindow`]: a byte slice mapped at a physical base address. Any
//!   access outside the slice fails with [`MemoryError`].
//! - [`IdentityMapped`]: the flat, identity-mapped physical memory of an
//!   early boot stage, accessed through raw pointers.

use core::fmt;
use core::ops::Range;

/// An access fell outside the memory the address space covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryError {
    /// First address of the rejected access
    pub addr: u64,
    /// Length of the rejected access
    pub len: u64,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Memory access out of range: {:#x}+{:#x}", self.addr, self.len)
    }
}

/// Byte-addressable physical memory.
///
/// Multi-byte helpers are little-endian. The `add_*` helpers apply a saved
/// relocation delta to a field in place using wrapping (two's complement)
/// arithmetic and return the new value.
pub trait AddressSpace {
    /// Check whether `[addr, addr + len)` is backed by this address space.
    fn contains(&self, addr: u64, len: u64) -> bool;

    /// Read `buf.len()` bytes starting at `addr`.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Write `data` starting at `addr`.
    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Set `len` bytes starting at `addr` to `value`.
    fn fill(&mut self, addr: u64, len: u64, value: u8) -> Result<(), MemoryError>;

    /// Copy `len` bytes from `src` to `dst`. The ranges may overlap.
    fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<(), MemoryError>;

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u16(&mut self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    fn add_u32(&mut self, addr: u64, delta: u32) -> Result<u32, MemoryError> {
        let value = self.read_u32(addr)?.wrapping_add(delta);
        self.write_u32(addr, value)?;
        Ok(value)
    }

    fn add_u64(&mut self, addr: u64, delta: u64) -> Result<u64, MemoryError> {
        let value = self.read_u64(addr)?.wrapping_add(delta);
        self.write_u64(addr, value)?;
        Ok(value)
    }
}

/// A byte slice mapped at a physical base address.
///
/// Used to hand the loader a bounded region of RAM, and by the tests to
/// stand in for physical memory.
pub struct MemoryWindow<'a> {
    base: u64,
    bytes: &'a mut [u8],
}

impl<'a> MemoryWindow<'a> {
    /// Map `bytes` so that `bytes[0]` sits at physical address `base`.
    pub fn new(base: u64, bytes: &'a mut [u8]) -> Self {
        MemoryWindow { base, bytes }
    }

    /// Create a window over a raw physical region.
    ///
    /// # Safety
    ///
    /// `[base, base + len)` must be identity-mapped RAM that nothing else
    /// accesses for the lifetime of the window.
    pub unsafe fn from_raw(base: u64, len: usize) -> Self {
        // SAFETY: the caller guarantees the region is mapped and exclusive
        let bytes = unsafe { core::slice::from_raw_parts_mut(base as usize as *mut u8, len) };
        MemoryWindow { base, bytes }
    }

    /// Physical address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Window length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The window contents.
    pub fn as_slice(&self) -> &[u8] {
        self.bytes
    }

    fn range(&self, addr: u64, len: u64) -> Result<Range<usize>, MemoryError> {
        let err = MemoryError { addr, len };
        let start = addr.checked_sub(self.base).ok_or(err)?;
        let end = start.checked_add(len).ok_or(err)?;
        if end > self.bytes.len() as u64 {
            return Err(err);
        }
        Ok(start as usize..end as usize)
    }
}

impl AddressSpace for MemoryWindow<'_> {
    fn contains(&self, addr: u64, len: u64) -> bool {
        self.range(addr, len).is_ok()
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, buf.len() as u64)?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, data.len() as u64)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    fn fill(&mut self, addr: u64, len: u64, value: u8) -> Result<(), MemoryError> {
        let range = self.range(addr, len)?;
        self.bytes[range].fill(value);
        Ok(())
    }

    fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<(), MemoryError> {
        let from = self.range(src, len)?;
        let to = self.range(dst, len)?;
        self.bytes.copy_within(from, to.start);
        Ok(())
    }
}

/// Identity-mapped physical memory.
///
/// Addresses are used directly as pointers. Only the absence of address
/// overflow is checked.
pub struct IdentityMapped {
    _private: (),
}

impl IdentityMapped {
    /// # Safety
    ///
    /// Every address handed to the loader (the image itself, every segment
    /// target and every relocation site) must be mapped, writable where
    /// written, and not in use by the caller's own code, data or stack.
    pub const unsafe fn new() -> Self {
        IdentityMapped { _private: () }
    }

    fn check(addr: u64, len: u64) -> Result<usize, MemoryError> {
        let err = MemoryError { addr, len };
        let end = addr.checked_add(len).ok_or(err)?;
        if end > usize::MAX as u64 {
            return Err(err);
        }
        Ok(addr as usize)
    }
}

impl AddressSpace for IdentityMapped {
    fn contains(&self, addr: u64, len: u64) -> bool {
        Self::check(addr, len).is_ok()
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let src = Self::check(addr, buf.len() as u64)?;
        // SAFETY: constructing IdentityMapped promised the range is mapped
        unsafe {
            core::ptr::copy_nonoverlapping(src as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let dst = Self::check(addr, data.len() as u64)?;
        // SAFETY: constructing IdentityMapped promised the range is writable
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst as *mut u8, data.len());
        }
        Ok(())
    }

    fn fill(&mut self, addr: u64, len: u64, value: u8) -> Result<(), MemoryError> {
        let dst = Self::check(addr, len)?;
        // SAFETY: see write
        unsafe {
            core::ptr::write_bytes(dst as *mut u8, value, len as usize);
        }
        Ok(())
    }

    fn copy(&mut self, dst: u64, src: u64, len: u64) -> Result<(), MemoryError> {
        let from = Self::check(src, len)?;
        let to = Self::check(dst, len)?;
        // SAFETY: see write; `ptr::copy` tolerates overlapping ranges
        unsafe {
            core::ptr::copy(from as *const u8, to as *mut u8, len as usize);
        }
        Ok(())
    }
}

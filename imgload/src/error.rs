//! Loader error types.

use core::fmt;

use crate::memory::MemoryError;

/// Which header check rejected an image.
///
/// Checks run in the order listed, so a bad magic is never reported as a
/// bad machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Buffer too small to hold the ELF header
    Truncated,
    /// Missing 0x7F 'E' 'L' 'F' signature
    BadMagic,
    /// Class byte is neither 32-bit nor 64-bit
    BadClass,
    /// Not little-endian
    BadEncoding,
    /// Machine is not IA-32 (32-bit) or x64 (64-bit)
    BadMachine,
    /// Neither an executable nor a shared object
    BadType,
    /// Version is not the current ELF version
    BadVersion,
}

/// ELF engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Not an image this engine recognizes
    NotRecognized(Reject),
    /// Recognized image using a feature or architecture we do not handle
    Unsupported,
    /// An internal invariant of the image is violated
    CorruptImage,
    /// A named or indexed lookup failed
    NotFound,
    /// An access fell outside the caller's address space
    Memory(MemoryError),
}

impl fmt::Display for ElfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElfError::NotRecognized(reason) => write!(f, "Not a recognized image ({:?})", reason),
            ElfError::Unsupported => write!(f, "Unsupported image"),
            ElfError::CorruptImage => write!(f, "Corrupt image"),
            ElfError::NotFound => write!(f, "Not found"),
            ElfError::Memory(e) => write!(f, "{}", e),
        }
    }
}

impl From<MemoryError> for ElfError {
    fn from(e: MemoryError) -> Self {
        ElfError::Memory(e)
    }
}

/// Result type for ELF operations
pub type ElfResult<T> = Result<T, ElfError>;

/// Payload container errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpldError {
    /// Not an ELF image, or a format revision we cannot handle
    Unsupported,
    /// No valid info header
    NotFound,
    /// The container was recognized but could not be made runnable
    Aborted,
}

impl fmt::Display for UpldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpldError::Unsupported => write!(f, "Unsupported payload"),
            UpldError::NotFound => write!(f, "Payload info header not found"),
            UpldError::Aborted => write!(f, "Payload loading aborted"),
        }
    }
}

/// Result type for container operations
pub type UpldResult<T> = Result<T, UpldError>;

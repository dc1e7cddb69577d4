//! Loader configuration.
//!
//! Compile-time constants for the image formats, plus the runtime options
//! the caller threads through the relocation engine and container loader.

use crate::elf::Machine;

/// Page size used to align the first loadable segment when rebasing (4 KB).
pub const PAGE_SIZE: u64 = 0x1000;

/// Maximum number of named sub-images a container reports.
pub const MAX_PAYLOAD_IMAGES: usize = 4;

/// Maximum stored length of a sub-image name, in bytes.
pub const SUB_IMAGE_NAME_LEN: usize = 16;

/// Section holding the container info header.
pub const UPLD_INFO_SECTION: &str = ".upld_info";

/// Prefix of sections holding named sub-images.
pub const UPLD_IMAGE_PREFIX: &str = ".upld.";

/// How to treat relocation types the engine does not recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocPolicy {
    /// Log the type and continue with the next entry.
    Permissive,
    /// Fail the relocation with `Unsupported`.
    Strict,
}

impl Default for RelocPolicy {
    fn default() -> Self {
        if cfg!(feature = "strict-relocations") {
            RelocPolicy::Strict
        } else {
            RelocPolicy::Permissive
        }
    }
}

/// Runtime loader options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Architecture the relocation engine fixes up images for.
    pub arch: Machine,
    /// Unrecognized relocation type handling.
    pub reloc_policy: RelocPolicy,
}

impl LoaderConfig {
    /// Create a configuration for `arch` with the default policy.
    pub fn new(arch: Machine) -> Self {
        LoaderConfig {
            arch,
            reloc_policy: RelocPolicy::default(),
        }
    }

    /// Replace the relocation policy.
    pub fn with_policy(mut self, reloc_policy: RelocPolicy) -> Self {
        self.reloc_policy = reloc_policy;
        self
    }
}

impl Default for LoaderConfig {
    /// Targets the architecture this crate was compiled for.
    fn default() -> Self {
        let arch = if cfg!(target_arch = "x86") {
            Machine::Ia32
        } else {
            Machine::X64
        };
        LoaderConfig::new(arch)
    }
}

/// Round `addr` down to a page boundary.
pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align_down() {
        assert_eq!(page_align_down(0x40_1234), 0x40_1000);
        assert_eq!(page_align_down(0x40_1000), 0x40_1000);
        assert_eq!(page_align_down(0xFFF), 0);
    }

    #[test]
    fn test_with_policy() {
        let config = LoaderConfig::new(Machine::Ia32).with_policy(RelocPolicy::Strict);
        assert_eq!(config.arch, Machine::Ia32);
        assert_eq!(config.reloc_policy, RelocPolicy::Strict);
    }

    #[cfg(not(feature = "strict-relocations"))]
    #[test]
    fn test_default_policy_is_permissive() {
        assert_eq!(RelocPolicy::default(), RelocPolicy::Permissive);
    }
}

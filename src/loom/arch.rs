use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::memory::TransferPolicy;

/// Upper bound on the number of tensors in one foreach list.
pub const MAX_TENSORS: usize = 192;
/// Upper bound on the number of cores one launch spans.
pub const MAX_CORES: usize = 64;
/// Largest per-core scratch memory of any generation, in bytes.
pub const MAX_SCRATCH_BYTES: usize = 256 * 1024;
/// Upper bound on the elements one scratch buffer holds: the largest scratch filled with the
/// narrowest element type.
pub const MAX_BUFFER_ELEMENTS: usize = MAX_SCRATCH_BYTES / 2;

/// Hardware generation a kernel is built for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Generation {
    V200,
    #[default]
    V220,
    V300,
    V310,
}

impl Generation {
    /// Whether the memory-transfer unit offers a padded, element-exact copy.
    pub const fn has_masked_copy(self) -> bool {
        !matches!(self, Generation::V200)
    }

    /// How partial blocks are moved between global memory and scratch.
    pub const fn transfer_policy(self) -> TransferPolicy {
        match self.has_masked_copy() {
            true => TransferPolicy::Masked,
            false => TransferPolicy::RoundUp,
        }
    }

    /// Vector cores available on one device of this generation.
    pub const fn core_count(self) -> usize {
        match self {
            Generation::V200 => 32,
            Generation::V220 => 48,
            Generation::V300 => 64,
            Generation::V310 => 64,
        }
    }

    /// Per-core scratch memory in bytes.
    pub const fn scratch_bytes(self) -> usize {
        match self {
            Generation::V200 => 256 * 1024,
            Generation::V220 => 192 * 1024,
            Generation::V300 => 248 * 1024,
            Generation::V310 => 248 * 1024,
        }
    }
}

/// The launch target: generation, how many cores to spread over, and how much scratch each has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{generation} ({core_count} cores, {scratch_bytes} B scratch)")]
pub struct Platform {
    pub generation: Generation,
    pub core_count: usize,
    pub scratch_bytes: usize,
}

impl Default for Platform {
    fn default() -> Self {
        Generation::default().into()
    }
}

impl From<Generation> for Platform {
    fn from(generation: Generation) -> Self {
        Self {
            generation,
            core_count: generation.core_count(),
            scratch_bytes: generation.scratch_bytes(),
        }
    }
}

impl Platform {
    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count;
        self
    }

    pub fn with_scratch_bytes(mut self, scratch_bytes: usize) -> Self {
        self.scratch_bytes = scratch_bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Generation, Platform};
    use crate::loom::memory::TransferPolicy;

    #[test]
    fn test_transfer_policy() {
        assert_eq!(Generation::V200.transfer_policy(), TransferPolicy::RoundUp);
        assert_eq!(Generation::V220.transfer_policy(), TransferPolicy::Masked);
        assert_eq!(Generation::V310.transfer_policy(), TransferPolicy::Masked);
    }

    #[test]
    fn test_platform() {
        let platform = Platform::default();
        assert_eq!(platform.generation, Generation::V220);
        assert_eq!(platform.core_count, 48);
        assert_eq!(platform.scratch_bytes, 192 * 1024);

        let platform = Platform::from(Generation::V310).with_core_count(8);
        assert_eq!(platform.core_count, 8);
        assert_eq!(platform.to_string(), "V310 (8 cores, 253952 B scratch)");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_serde_platform() -> Result<(), serde_json::Error> {
        let platform = Platform::from(Generation::V300).with_scratch_bytes(4096);
        let json = serde_json::to_string(&platform)?;
        let back: Platform = serde_json::from_str(&json)?;
        assert_eq!(back, platform);
        Ok(())
    }
}

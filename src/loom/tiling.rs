//! The tiling descriptor: a static partition of a tensor list's elements across cores.
//!
//! The descriptor is a fixed-layout record of fixed-width integers. It is built once on the host,
//! encoded into a byte blob, attached to a launch and decoded by value on every core.

use std::ops::Range;

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::arch::{MAX_BUFFER_ELEMENTS, MAX_CORES, MAX_TENSORS};

/// Identifies an encoded descriptor blob.
pub const MAGIC: u32 = u32::from_le_bytes(*b"TSRA");
/// Layout version of the encoded record.
pub const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TilingError {
    #[error("tiling blob has {found} bytes, expected {expected}")]
    Size { expected: usize, found: usize },
    #[error("tiling blob magic {0:#010x} does not identify a tiling descriptor")]
    Magic(u32),
    #[error("tiling descriptor version {0} is not supported, expected {VERSION}")]
    Version(u32),
    #[error("tiling descriptor is corrupt: {0}")]
    Corrupt(String),
    #[error("core {core} is out of range for a launch over {count} cores")]
    Core { core: usize, count: usize },
}

/// One core's slice of the partition.
///
/// Tensors `start_tensor..end_tensor` are (at least partially) owned by the core. The first of
/// them is owned from `start_offset`, the last one up to (excluding) `end_offset`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("[{start_tensor}:{start_offset}, {end_tensor}:{end_offset})")]
pub struct CoreRange {
    pub start_tensor: usize,
    pub start_offset: usize,
    pub end_tensor: usize,
    pub end_offset: usize,
}

impl CoreRange {
    /// A range owning nothing, parked at `tensor`.
    #[inline]
    pub fn empty(tensor: usize) -> Self {
        Self {
            start_tensor: tensor,
            end_tensor: tensor,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start_tensor == self.end_tensor
    }

    #[inline]
    pub fn tensors(&self) -> Range<usize> {
        self.start_tensor..self.end_tensor
    }
}

macro_rules! impl_bytemuck {
    ($ty:ty) => {
        unsafe impl ::bytemuck::Zeroable for $ty {}
        unsafe impl ::bytemuck::Pod for $ty {}
    };
}

/// The serialized plan shared by every core of a launch.
///
/// Slots beyond `tensor_count` and `core_count` are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TilingDescriptor {
    magic: u32,
    version: u32,
    tensor_count: u32,
    core_count: u32,
    buffer_capacity: u64,
    element_alignment: u64,
    tensor_lengths: [u64; MAX_TENSORS],
    core_start_offset: [u64; MAX_CORES],
    core_end_offset: [u64; MAX_CORES],
    core_start_tensor: [u32; MAX_CORES],
    core_end_tensor: [u32; MAX_CORES],
}

impl_bytemuck!(TilingDescriptor);

// the record must not contain padding bytes
const _: () = assert!(
    size_of::<TilingDescriptor>() == 32 + 8 * MAX_TENSORS + 2 * 8 * MAX_CORES + 2 * 4 * MAX_CORES
);

impl TilingDescriptor {
    /// Size of the encoded record in bytes.
    pub const SIZE: usize = size_of::<Self>();

    /// Creates a descriptor whose cores own nothing yet.
    ///
    /// # Panics
    /// Panics if `lengths` or `core_count` exceed the compile-time bounds.
    pub(crate) fn with_tensors(
        lengths: &[u64],
        core_count: usize,
        buffer_capacity: usize,
        element_alignment: usize,
    ) -> Self {
        assert!(lengths.len() <= MAX_TENSORS, "too many tensors");
        assert!(core_count <= MAX_CORES, "too many cores");

        let mut descriptor: Self = bytemuck::Zeroable::zeroed();
        descriptor.magic = MAGIC;
        descriptor.version = VERSION;
        descriptor.tensor_count = lengths.len() as u32;
        descriptor.core_count = core_count as u32;
        descriptor.buffer_capacity = buffer_capacity as u64;
        descriptor.element_alignment = element_alignment as u64;
        descriptor.tensor_lengths[..lengths.len()].copy_from_slice(lengths);
        descriptor
    }

    pub(crate) fn set_core_range(&mut self, core: usize, range: CoreRange) {
        self.core_start_tensor[core] = range.start_tensor as u32;
        self.core_start_offset[core] = range.start_offset as u64;
        self.core_end_tensor[core] = range.end_tensor as u32;
        self.core_end_offset[core] = range.end_offset as u64;
    }

    #[inline]
    pub fn tensor_count(&self) -> usize {
        self.tensor_count as usize
    }

    #[inline]
    pub fn core_count(&self) -> usize {
        self.core_count as usize
    }

    /// Maximum elements one on-core scratch buffer holds.
    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity as usize
    }

    /// Elements per hardware block for the launch's data type.
    #[inline]
    pub fn element_alignment(&self) -> usize {
        self.element_alignment as usize
    }

    #[inline]
    pub fn tensor_lengths(&self) -> &[u64] {
        &self.tensor_lengths[..self.tensor_count()]
    }

    #[inline]
    pub fn tensor_len(&self, tensor: usize) -> usize {
        self.tensor_lengths[tensor] as usize
    }

    #[inline]
    pub fn total_elements(&self) -> u64 {
        self.tensor_lengths().iter().sum()
    }

    /// The slice of the partition owned by `core`.
    ///
    /// # Panics
    /// Panics if `core` is not less than [`Self::core_count`].
    #[inline]
    pub fn core_range(&self, core: usize) -> CoreRange {
        assert!(
            core < self.core_count(),
            "core {core} out of range for {} cores",
            self.core_count
        );
        CoreRange {
            start_tensor: self.core_start_tensor[core] as usize,
            start_offset: self.core_start_offset[core] as usize,
            end_tensor: self.core_end_tensor[core] as usize,
            end_offset: self.core_end_offset[core] as usize,
        }
    }

    /// Total number of elements `core` streams.
    pub fn elements_owned_by_core(&self, core: usize) -> u64 {
        let range = self.core_range(core);
        if range.is_empty() {
            return 0;
        }
        let sum: u64 = self.tensor_lengths[range.tensors()].iter().sum();
        let last = self.tensor_lengths[range.end_tensor - 1];
        sum - range.start_offset as u64 - (last - range.end_offset as u64)
    }

    /// Returns `true` if `tensor` is the first or last tensor `core` touches.
    ///
    /// Boundary tensors may be shared with a neighbouring core and are streamed from or up to an
    /// offset; interior tensors are consumed in full.
    pub fn is_boundary_tensor(&self, core: usize, tensor: usize) -> bool {
        let range = self.core_range(core);
        !range.is_empty() && (tensor == range.start_tensor || tensor + 1 == range.end_tensor)
    }

    /// The element range of `tensor` that `core` owns, if any.
    pub fn owned_span(&self, core: usize, tensor: usize) -> Option<Range<usize>> {
        let range = self.core_range(core);
        if !range.tensors().contains(&tensor) {
            return None;
        }
        let start = match tensor == range.start_tensor {
            true => range.start_offset,
            false => 0,
        };
        let end = match tensor + 1 == range.end_tensor {
            true => range.end_offset,
            false => self.tensor_len(tensor),
        };
        (start < end).then_some(start..end)
    }

    /// Encodes the descriptor into the blob attached to a launch.
    #[inline]
    pub fn encode(&self) -> Vec<u8> {
        bytemuck::bytes_of(self).to_vec()
    }

    /// Reconstructs a descriptor from a launch blob, rejecting anything that could make a core
    /// touch memory it does not own.
    pub fn decode(bytes: &[u8]) -> Result<Self, TilingError> {
        if bytes.len() != Self::SIZE {
            return Err(TilingError::Size {
                expected: Self::SIZE,
                found: bytes.len(),
            });
        }
        let descriptor: Self = bytemuck::try_pod_read_unaligned(bytes)
            .map_err(|err| TilingError::Corrupt(err.to_string()))?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Checks every structural invariant of the partition.
    pub fn validate(&self) -> Result<(), TilingError> {
        macro_rules! ensure {
            ($cond:expr, $($arg:tt)+) => {
                if !$cond {
                    return Err(TilingError::Corrupt(format!($($arg)+)));
                }
            };
        }

        if self.magic != MAGIC {
            return Err(TilingError::Magic(self.magic));
        }
        if self.version != VERSION {
            return Err(TilingError::Version(self.version));
        }

        let tensor_count = self.tensor_count();
        let core_count = self.core_count();
        ensure!(
            tensor_count <= MAX_TENSORS,
            "{tensor_count} tensors exceed {MAX_TENSORS}"
        );
        ensure!(
            (1..=MAX_CORES).contains(&core_count),
            "{core_count} cores outside 1..={MAX_CORES}"
        );
        ensure!(
            self.tensor_lengths[tensor_count..].iter().all(|&x| x == 0),
            "unused tensor slots are not zero"
        );
        ensure!(self.element_alignment > 0, "zero element alignment");
        ensure!(
            self.buffer_capacity > 0 && self.buffer_capacity % self.element_alignment == 0,
            "buffer capacity {} is not a positive multiple of {}",
            self.buffer_capacity,
            self.element_alignment
        );
        ensure!(
            self.buffer_capacity <= MAX_BUFFER_ELEMENTS as u64,
            "buffer capacity {} exceeds {MAX_BUFFER_ELEMENTS}",
            self.buffer_capacity
        );

        // global flattened offset of each tensor's first element
        let starts = self
            .tensor_lengths()
            .iter()
            .try_fold(vec![0u64], |mut acc, &len| {
                let last = *acc.last()?;
                acc.push(last.checked_add(len)?);
                Some(acc)
            });
        let Some(starts) = starts else {
            return Err(TilingError::Corrupt("total element count overflows".into()));
        };
        let total = starts[tensor_count];

        // owned global spans must tile `0..total` in core order
        let mut cursor = 0u64;
        let mut previous_end = 0;
        for core in 0..core_count {
            let range = self.core_range(core);
            ensure!(
                range.start_tensor <= range.end_tensor && range.end_tensor <= tensor_count,
                "core {core} has tensor range {range} outside {tensor_count} tensors"
            );
            // consecutive cores share at most the previous core's last tensor
            ensure!(
                range.start_tensor + 1 >= previous_end,
                "core {core} starts at tensor {} behind the previous core's end {previous_end}",
                range.start_tensor
            );
            previous_end = range.end_tensor;
            if range.is_empty() {
                ensure!(
                    range.start_offset == 0 && range.end_offset == 0,
                    "idle core {core} has nonzero offsets"
                );
                continue;
            }
            let first = self.tensor_len(range.start_tensor);
            let last = self.tensor_len(range.end_tensor - 1);
            ensure!(
                range.start_offset < first,
                "core {core} starts at {} past tensor length {first}",
                range.start_offset
            );
            ensure!(
                0 < range.end_offset && range.end_offset <= last,
                "core {core} ends at {} outside tensor length {last}",
                range.end_offset
            );
            let lo = starts[range.start_tensor] + range.start_offset as u64;
            let hi = starts[range.end_tensor - 1] + range.end_offset as u64;
            ensure!(lo < hi, "core {core} owns the inverted span {lo}..{hi}");
            ensure!(
                lo == cursor,
                "core {core} starts at element {lo} but the previous core ended at {cursor}"
            );
            cursor = hi;
        }
        ensure!(cursor == total, "cores cover {cursor} of {total} elements");

        ensure!(
            (core_count..MAX_CORES).all(|core| {
                self.core_start_tensor[core] == 0
                    && self.core_end_tensor[core] == 0
                    && self.core_start_offset[core] == 0
                    && self.core_end_offset[core] == 0
            }),
            "unused core slots are not zero"
        );
        Ok(())
    }
}

impl std::fmt::Display for TilingDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "tiling v{}: {} tensors, {} elements, {} cores, buffer {} (align {})",
            self.version,
            self.tensor_count,
            self.total_elements(),
            self.core_count,
            self.buffer_capacity,
            self.element_alignment
        )?;
        let lines = (0..self.core_count()).map(|core| {
            let range = self.core_range(core);
            let count = self.elements_owned_by_core(core);
            format!("  core {core:>2}: {range} = {count}")
        });
        write!(f, "{}", lines.format("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::{CoreRange, MAGIC, TilingDescriptor, TilingError};
    use crate::loom::arch::MAX_BUFFER_ELEMENTS;

    /// Two cores over `[5, 3]`: `[0:0, 1:4)` and `[0:4, 2:3)`.
    fn split_descriptor() -> TilingDescriptor {
        let mut descriptor = TilingDescriptor::with_tensors(&[5, 3], 2, 64, 8);
        descriptor.set_core_range(
            0,
            CoreRange {
                start_tensor: 0,
                start_offset: 0,
                end_tensor: 1,
                end_offset: 4,
            },
        );
        descriptor.set_core_range(
            1,
            CoreRange {
                start_tensor: 0,
                start_offset: 4,
                end_tensor: 2,
                end_offset: 3,
            },
        );
        descriptor
    }

    #[test]
    fn test_queries() {
        let descriptor = split_descriptor();
        descriptor.validate().unwrap();

        assert_eq!(descriptor.total_elements(), 8);
        assert_eq!(descriptor.elements_owned_by_core(0), 4);
        assert_eq!(descriptor.elements_owned_by_core(1), 4);

        assert!(descriptor.is_boundary_tensor(0, 0));
        assert!(!descriptor.is_boundary_tensor(0, 1));
        assert!(descriptor.is_boundary_tensor(1, 0));
        assert!(descriptor.is_boundary_tensor(1, 1));

        assert_eq!(descriptor.owned_span(0, 0), Some(0..4));
        assert_eq!(descriptor.owned_span(1, 0), Some(4..5));
        assert_eq!(descriptor.owned_span(1, 1), Some(0..3));
        assert_eq!(descriptor.owned_span(0, 1), None);
    }

    #[test]
    fn test_encode_decode() {
        let descriptor = split_descriptor();
        let blob = descriptor.encode();
        assert_eq!(blob.len(), TilingDescriptor::SIZE);
        assert_eq!(blob[..4], MAGIC.to_ne_bytes());
        assert_eq!(TilingDescriptor::decode(&blob).unwrap(), descriptor);
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let blob = split_descriptor().encode();
        let err = TilingDescriptor::decode(&blob[..blob.len() - 1]).unwrap_err();
        assert!(matches!(err, TilingError::Size { .. }));
    }

    #[test]
    fn test_decode_rejects_magic_and_version() {
        let mut blob = split_descriptor().encode();
        blob[0] ^= 0xff;
        assert!(matches!(
            TilingDescriptor::decode(&blob),
            Err(TilingError::Magic(x)) if x != MAGIC
        ));

        let mut blob = split_descriptor().encode();
        blob[4..8].copy_from_slice(&7u32.to_ne_bytes());
        assert!(matches!(
            TilingDescriptor::decode(&blob),
            Err(TilingError::Version(7))
        ));
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let mut descriptor = split_descriptor();
        descriptor.set_core_range(
            1,
            CoreRange {
                start_tensor: 0,
                start_offset: 3,
                end_tensor: 2,
                end_offset: 3,
            },
        );
        assert!(matches!(
            descriptor.validate(),
            Err(TilingError::Corrupt(_))
        ));
        let blob = descriptor.encode();
        assert!(TilingDescriptor::decode(&blob).is_err());
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut descriptor = split_descriptor();
        descriptor.set_core_range(
            1,
            CoreRange {
                start_tensor: 0,
                start_offset: 4,
                end_tensor: 2,
                end_offset: 2,
            },
        );
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_monotonic() {
        // three cores over `[5, 3]`; the idle third core is parked behind the second one
        let mut descriptor = TilingDescriptor::with_tensors(&[5, 3], 3, 64, 8);
        descriptor.set_core_range(
            0,
            CoreRange {
                start_tensor: 0,
                start_offset: 0,
                end_tensor: 1,
                end_offset: 3,
            },
        );
        descriptor.set_core_range(
            1,
            CoreRange {
                start_tensor: 0,
                start_offset: 3,
                end_tensor: 2,
                end_offset: 3,
            },
        );
        descriptor.set_core_range(2, CoreRange::empty(0));
        assert!(matches!(
            descriptor.validate(),
            Err(TilingError::Corrupt(_))
        ));

        // parked on the last tensor the previous core touches
        descriptor.set_core_range(2, CoreRange::empty(1));
        descriptor.validate().unwrap();
        descriptor.set_core_range(2, CoreRange::empty(2));
        descriptor.validate().unwrap();
    }

    #[test]
    fn test_decode_rejects_huge_capacity() {
        let mut descriptor = split_descriptor();
        descriptor.buffer_capacity = 1 << 60;
        assert!(matches!(
            TilingDescriptor::decode(&descriptor.encode()),
            Err(TilingError::Corrupt(_))
        ));

        descriptor.buffer_capacity = MAX_BUFFER_ELEMENTS as u64;
        TilingDescriptor::decode(&descriptor.encode()).unwrap();
    }

    #[test]
    fn test_idle_core() {
        let mut descriptor = TilingDescriptor::with_tensors(&[], 3, 64, 8);
        for core in 0..3 {
            descriptor.set_core_range(core, CoreRange::empty(0));
        }
        descriptor.validate().unwrap();
        assert_eq!(descriptor.elements_owned_by_core(2), 0);
        assert!(!descriptor.is_boundary_tensor(2, 0));
        assert_eq!(descriptor.owned_span(2, 0), None);
    }
}

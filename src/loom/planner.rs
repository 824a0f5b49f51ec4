//! Host-side planning: balanced contiguous partition of a tensor list across cores.
//!
//! Balance is computed over the *global flattened element index*: the list is treated as one long
//! run of elements, cut into `core_count` contiguous pieces whose sizes differ by at most one.
//! Tensor boundaries do not influence where the cuts fall, and neither does the hardware block
//! size; alignment only matters when scratch buffers are provisioned and when data is moved.

use derive_more::Display;
use itertools::Itertools;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    align::{BF16_BLOCK_BYTES, BLOCK_BYTES, align_down},
    arch::{MAX_BUFFER_ELEMENTS, MAX_CORES, MAX_TENSORS},
    num::DataType,
    tiling::{CoreRange, TilingDescriptor},
};

/// Scratch buffer size, in hardware blocks, used when no capacity is configured.
pub const DEFAULT_BUFFER_BLOCKS: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("cannot plan a launch over zero cores")]
    ZeroCores,
    #[error("{count} cores exceed the supported maximum of {max}")]
    TooManyCores { count: usize, max: usize },
    #[error("{count} tensors exceed the supported maximum of {max}")]
    TooManyTensors { count: usize, max: usize },
    #[error("element alignment must be at least one element")]
    ZeroAlignment,
    #[error("buffer capacity {capacity} is smaller than one block of {block} elements")]
    BufferTooSmall { capacity: usize, block: usize },
    #[error("buffer capacity {capacity} exceeds the supported maximum of {max} elements")]
    BufferTooLarge { capacity: usize, max: usize },
    #[error("total element count of the tensor list overflows")]
    Overflow,
}

/// Unit in which per-core quotas are balanced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Granularity {
    /// Quotas differ by at most one element.
    #[default]
    Element,
    /// Quotas are whole alignment blocks; only the core holding the tail owns a partial block.
    Block,
}

/// Configurable planner. [`plan`] is the shorthand with default settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Planner {
    pub core_count: usize,
    pub element_alignment: usize,
    pub buffer_capacity: usize,
    pub granularity: Granularity,
}

impl Planner {
    pub fn new(core_count: usize, element_alignment: usize) -> Self {
        Self {
            core_count,
            element_alignment,
            buffer_capacity: element_alignment * DEFAULT_BUFFER_BLOCKS,
            granularity: Granularity::Element,
        }
    }

    pub fn buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    fn check(&self, lengths: &[u64]) -> Result<(), PlanError> {
        if self.core_count == 0 {
            return Err(PlanError::ZeroCores);
        }
        if self.core_count > MAX_CORES {
            return Err(PlanError::TooManyCores {
                count: self.core_count,
                max: MAX_CORES,
            });
        }
        if lengths.len() > MAX_TENSORS {
            return Err(PlanError::TooManyTensors {
                count: lengths.len(),
                max: MAX_TENSORS,
            });
        }
        if self.element_alignment == 0 {
            return Err(PlanError::ZeroAlignment);
        }
        let capacity = align_down(self.buffer_capacity, self.element_alignment);
        if capacity == 0 {
            return Err(PlanError::BufferTooSmall {
                capacity: self.buffer_capacity,
                block: self.element_alignment,
            });
        }
        if capacity > MAX_BUFFER_ELEMENTS {
            return Err(PlanError::BufferTooLarge {
                capacity,
                max: MAX_BUFFER_ELEMENTS,
            });
        }
        Ok(())
    }

    /// Number of elements each core is assigned, in core order.
    fn quotas(&self, total: u64) -> Vec<u64> {
        let cores = self.core_count as u64;
        match self.granularity {
            Granularity::Element => {
                let (base, remainder) = (total / cores, total % cores);
                (0..cores).map(|core| base + u64::from(core < remainder)).collect()
            }
            Granularity::Block => {
                let align = self.element_alignment as u64;
                let blocks = total.div_ceil(align);
                let (base, remainder) = (blocks / cores, blocks % cores);
                let mut left = total;
                (0..cores)
                    .map(|core| {
                        let quota = ((base + u64::from(core < remainder)) * align).min(left);
                        left -= quota;
                        quota
                    })
                    .collect()
            }
        }
    }

    /// Partitions the tensors of `lengths` across the configured cores.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn plan(&self, lengths: &[u64]) -> Result<TilingDescriptor, PlanError> {
        self.check(lengths)?;

        let total = lengths
            .iter()
            .try_fold(0u64, |acc, &len| acc.checked_add(len))
            .ok_or(PlanError::Overflow)?;
        let capacity = align_down(self.buffer_capacity, self.element_alignment);
        let mut descriptor = TilingDescriptor::with_tensors(
            lengths,
            self.core_count,
            capacity,
            self.element_alignment,
        );

        // global cursor: tensor index and offset within it
        let mut tensor = 0;
        let mut offset = 0u64;
        for (core, quota) in self.quotas(total).into_iter().enumerate() {
            if quota == 0 {
                descriptor.set_core_range(core, CoreRange::empty(tensor));
                continue;
            }

            // skip exhausted and zero-length tensors; some later tensor still has elements
            while offset == lengths[tensor] {
                tensor += 1;
                offset = 0;
            }
            let (start_tensor, start_offset) = (tensor, offset);

            let mut need = quota;
            loop {
                let take = need.min(lengths[tensor] - offset);
                offset += take;
                need -= take;
                if need == 0 {
                    break;
                }
                tensor += 1;
                offset = 0;
            }

            let range = CoreRange {
                start_tensor,
                start_offset: start_offset as usize,
                end_tensor: tensor + 1,
                end_offset: offset as usize,
            };
            log::trace!("core {core}: {range} ({quota} elements)");
            descriptor.set_core_range(core, range);
        }

        log::debug!(
            "planned {total} elements of {} tensors over {} cores ({})",
            lengths.len(),
            self.core_count,
            self.granularity
        );
        Ok(descriptor)
    }
}

/// Plans `tensor_lengths` over `core_count` cores, balancing to the element.
pub fn plan(
    tensor_lengths: &[u64],
    core_count: usize,
    element_alignment: usize,
) -> Result<TilingDescriptor, PlanError> {
    Planner::new(core_count, element_alignment).plan(tensor_lengths)
}

/// Number of cores worth launching for `total` elements: one block of work per core at least,
/// capped by what the device offers.
pub fn needed_core_count(total: u64, block_elements: usize, available: usize) -> usize {
    let blocks = match block_elements {
        0 => total,
        n => total.div_ceil(n as u64),
    };
    let cap = available.clamp(1, MAX_CORES);
    usize::try_from(blocks).map_or(cap, |blocks| blocks.clamp(1, cap))
}

/// Splits per-core scratch memory into the buffers one pipeline needs.
///
/// Every operand and the result get `depth` native buffers; the upcast path additionally widens
/// each of them into an `f32` work buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ScratchBudget {
    pub scratch_bytes: usize,
    pub reserved_bytes: usize,
    pub operands: usize,
    pub depth: usize,
}

impl ScratchBudget {
    pub fn new(scratch_bytes: usize) -> Self {
        Self {
            scratch_bytes,
            reserved_bytes: TilingDescriptor::SIZE,
            operands: 1,
            depth: 2,
        }
    }

    pub fn operands(mut self, operands: usize) -> Self {
        self.operands = operands;
        self
    }

    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    /// Scratch held back for the descriptor and op-specific temporaries.
    pub fn reserve(mut self, bytes: usize) -> Self {
        self.reserved_bytes += bytes;
        self
    }

    /// Elements one scratch buffer holds for `dtype`, rounded down to the block.
    pub fn capacity(&self, dtype: DataType, upcast: bool) -> Result<usize, PlanError> {
        let size = dtype.size();
        let block_bytes = match (dtype, upcast) {
            (DataType::BF16, true) => BF16_BLOCK_BYTES,
            _ => BLOCK_BYTES,
        };
        let block = match block_bytes / size {
            0 => return Err(PlanError::ZeroAlignment),
            n => n,
        };

        let buffers = self.operands + 1;
        let per_element = match upcast {
            true => self.depth.max(1) * buffers * size + buffers * size_of::<f32>(),
            false => self.depth.max(1) * buffers * size,
        };
        let available = self.scratch_bytes.saturating_sub(self.reserved_bytes);
        let capacity = align_down((available / per_element).min(MAX_BUFFER_ELEMENTS), block);
        match capacity {
            0 => Err(PlanError::BufferTooSmall {
                capacity: available / per_element,
                block,
            }),
            capacity => Ok(capacity),
        }
    }
}

/// Per-core element counts of a plan, in core order.
pub fn core_loads(descriptor: &TilingDescriptor) -> Vec<u64> {
    (0..descriptor.core_count())
        .map(|core| descriptor.elements_owned_by_core(core))
        .collect_vec()
}

//! Hardware-block alignment helpers.
//!
//! The memory-transfer unit moves data in blocks of [`BLOCK_BYTES`]. Element counts are expressed
//! in multiples of `BLOCK_BYTES / size_of::<T>()` whenever scratch buffers are provisioned or a
//! transfer is issued.

use super::{num::DataType, planner::PlanError};

/// Minimum contiguous transfer size of the memory-access unit.
pub const BLOCK_BYTES: usize = 32;
/// Granularity used when provisioning bf16 scratch that is later widened to `f32`.
pub const BF16_BLOCK_BYTES: usize = 64;

/// # Panics
/// Panics if `b` is zero.
#[inline]
pub const fn ceil_div(a: usize, b: usize) -> usize {
    assert!(b != 0, "division by a zero block");
    a.div_ceil(b)
}

/// Smallest multiple of `block` that is not less than `n`.
///
/// # Panics
/// Panics if `block` is zero.
#[inline]
pub const fn align_up(n: usize, block: usize) -> usize {
    ceil_div(n, block) * block
}

/// Largest multiple of `block` that is not greater than `n`.
///
/// # Panics
/// Panics if `block` is zero.
#[inline]
pub const fn align_down(n: usize, block: usize) -> usize {
    assert!(block != 0, "division by a zero block");
    n / block * block
}

/// Number of elements of `dtype` in one hardware block.
#[inline]
pub fn block_elements(dtype: DataType) -> Result<usize, PlanError> {
    match BLOCK_BYTES / dtype.size() {
        0 => Err(PlanError::ZeroAlignment),
        n => Ok(n),
    }
}

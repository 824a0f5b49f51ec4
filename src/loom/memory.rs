//! Global memory views, on-core scratch and the transfer unit that moves data between them.

use std::ops::{AddAssign, Range};

use derive_more::{Deref, DerefMut, Display};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    align::{BLOCK_BYTES, align_down, align_up},
    num::Scalar,
    tiling::TilingDescriptor,
};

/// How a transfer whose length is not a whole number of blocks is carried out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransferPolicy {
    /// The unit pads partial blocks itself; every transfer moves exactly the requested elements.
    #[default]
    Masked,
    /// Only whole blocks move. A load is rounded up when the extra elements lie inside the same
    /// source; anything else moves its tail element by element.
    RoundUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("expected {expected} tensors, found {found}")]
    Count { expected: usize, found: usize },
    #[error("tensor {tensor} has {found} elements, expected {expected}")]
    Length {
        tensor: usize,
        expected: usize,
        found: usize,
    },
    #[error("expected {expected} operand lists, found {found}")]
    Operands { expected: usize, found: usize },
    #[error("op carries parameters for {found} tensors, expected {expected}")]
    Parameters { expected: usize, found: usize },
}

/// Checks that `tensors` has exactly the lengths recorded in `descriptor`.
pub fn check_shape<T, S>(descriptor: &TilingDescriptor, tensors: &[S]) -> Result<(), ShapeError>
where
    S: AsRef<[T]>,
{
    if tensors.len() != descriptor.tensor_count() {
        return Err(ShapeError::Count {
            expected: descriptor.tensor_count(),
            found: tensors.len(),
        });
    }
    for (tensor, data) in tensors.iter().enumerate() {
        let expected = descriptor.tensor_len(tensor);
        let found = data.as_ref().len();
        if found != expected {
            return Err(ShapeError::Length {
                tensor,
                expected,
                found,
            });
        }
    }
    Ok(())
}

/// Number of elements of `T` in one hardware block.
#[inline]
pub const fn block_len<T>() -> usize {
    match BLOCK_BYTES / size_of::<T>() {
        0 => 1,
        n => n,
    }
}

/// A private on-core buffer, provisioned in whole blocks.
#[derive(Debug, Clone, PartialEq, Eq, Deref, DerefMut)]
pub struct Scratch<T>(Box<[T]>);

impl<T: Scalar> Scratch<T> {
    pub fn new(capacity: usize) -> Self {
        let len = align_up(capacity, block_len::<T>());
        Self(vec![T::zero(); len].into_boxed_slice())
    }
}

/// Memory traffic issued by one core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display(
    "{loads} loads ({bytes_loaded} B), {stores} stores ({bytes_stored} B), {scalar_elements} scalar"
)]
pub struct Traffic {
    /// Load transfers issued.
    pub loads: usize,
    /// Store transfers issued.
    pub stores: usize,
    pub bytes_loaded: usize,
    pub bytes_stored: usize,
    /// Elements moved one at a time because they did not fill a block.
    pub scalar_elements: usize,
}

impl Traffic {
    #[inline]
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Self) {
        self.loads += rhs.loads;
        self.stores += rhs.stores;
        self.bytes_loaded += rhs.bytes_loaded;
        self.bytes_stored += rhs.bytes_stored;
        self.scalar_elements += rhs.scalar_elements;
    }
}

impl std::iter::Sum for Traffic {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, x| {
            acc += x;
            acc
        })
    }
}

/// The per-core memory-transfer unit.
#[derive(Debug, Clone)]
pub struct Transfer {
    policy: TransferPolicy,
    block: usize,
    traffic: Traffic,
}

impl Transfer {
    /// A transfer unit moving whole blocks of `block` elements.
    ///
    /// # Panics
    /// Panics if `block` is zero.
    pub fn new(policy: TransferPolicy, block: usize) -> Self {
        assert!(block > 0, "transfer block must hold at least one element");
        Self {
            policy,
            block,
            traffic: Traffic::default(),
        }
    }

    #[inline]
    pub fn policy(&self) -> TransferPolicy {
        self.policy
    }

    /// Elements per block.
    #[inline]
    pub fn block(&self) -> usize {
        self.block
    }

    #[inline]
    pub fn traffic(&self) -> Traffic {
        self.traffic
    }

    /// Moves `len` elements of `src` starting at `offset` into the front of `dst`.
    ///
    /// Under [`TransferPolicy::RoundUp`] the trailing lanes of `dst` past `len` may be filled with
    /// the elements that follow in `src`.
    ///
    /// # Panics
    /// Panics if the requested range is out of bounds of `src` or `dst`.
    pub fn load<T: Scalar>(&mut self, src: &[T], offset: usize, len: usize, dst: &mut [T]) {
        assert!(
            offset + len <= src.len() && len <= dst.len(),
            "load of {len} elements at {offset} out of bounds"
        );
        let size = size_of::<T>();
        let block = self.block;
        self.traffic.loads += 1;

        match self.policy {
            TransferPolicy::Masked => {
                dst[..len].copy_from_slice(&src[offset..offset + len]);
                self.traffic.bytes_loaded += len * size;
            }
            TransferPolicy::RoundUp => {
                let rounded = align_up(len, block);
                if offset + rounded <= src.len() && rounded <= dst.len() {
                    dst[..rounded].copy_from_slice(&src[offset..offset + rounded]);
                    self.traffic.bytes_loaded += rounded * size;
                    return;
                }
                let prefix = align_down(len, block);
                dst[..prefix].copy_from_slice(&src[offset..offset + prefix]);
                dst[prefix..len].copy_from_slice(&src[offset + prefix..offset + len]);
                self.traffic.bytes_loaded += len * size;
                self.traffic.scalar_elements += len - prefix;
            }
        }
    }

    /// Moves the first `len` elements of `src` into `dst` at `offset`.
    ///
    /// Never writes outside `offset..offset + len`; padding lanes of `src` are discarded.
    ///
    /// # Panics
    /// Panics if the requested range is out of bounds of `src` or `dst`.
    pub fn store<T: Scalar>(&mut self, src: &[T], dst: &mut [T], offset: usize, len: usize) {
        assert!(
            offset + len <= dst.len() && len <= src.len(),
            "store of {len} elements at {offset} out of bounds"
        );
        self.traffic.stores += 1;
        self.traffic.bytes_stored += len * size_of::<T>();

        let prefix = match self.policy {
            TransferPolicy::Masked => len,
            TransferPolicy::RoundUp => align_down(len, self.block),
        };
        dst[offset..offset + prefix].copy_from_slice(&src[..prefix]);
        for (x, y) in dst[offset + prefix..offset + len].iter_mut().zip(&src[prefix..len]) {
            *x = *y;
        }
        self.traffic.scalar_elements += len - prefix;
    }
}

/// The part of one output tensor a core owns.
#[derive(Debug)]
pub struct Part<'a, T> {
    pub tensor: usize,
    /// Offset of `data` within the tensor.
    pub offset: usize,
    pub data: &'a mut [T],
}

impl<T> Part<'_, T> {
    #[inline]
    pub fn span(&self) -> Range<usize> {
        self.offset..self.offset + self.data.len()
    }
}

/// Every output element one core may write, and nothing else.
#[derive(Debug)]
pub struct Segment<'a, T> {
    pub core: usize,
    parts: Vec<Part<'a, T>>,
}

impl<'a, T> Segment<'a, T> {
    #[inline]
    pub fn parts(&self) -> &[Part<'a, T>] {
        &self.parts
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.parts.iter().map(|part| part.data.len()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The owned part of `tensor`.
    pub fn part_mut(&mut self, tensor: usize) -> Option<&mut Part<'a, T>> {
        self.parts.iter_mut().find(|part| part.tensor == tensor)
    }
}

/// Splits the output tensors into one disjoint segment per core of `descriptor`.
pub fn split_outputs<'a, T, O>(
    descriptor: &TilingDescriptor,
    outputs: &'a mut [O],
) -> Result<Vec<Segment<'a, T>>, ShapeError>
where
    O: AsMut<[T]>,
{
    if outputs.len() != descriptor.tensor_count() {
        return Err(ShapeError::Count {
            expected: descriptor.tensor_count(),
            found: outputs.len(),
        });
    }

    let core_count = descriptor.core_count();
    let mut segments: Vec<_> = (0..core_count)
        .map(|core| Segment {
            core,
            parts: vec![],
        })
        .collect();

    for (tensor, output) in outputs.iter_mut().enumerate() {
        let mut rest = output.as_mut();
        let expected = descriptor.tensor_len(tensor);
        if rest.len() != expected {
            return Err(ShapeError::Length {
                tensor,
                expected,
                found: rest.len(),
            });
        }

        // spans are ascending in core order
        let mut cursor = 0;
        for (core, segment) in segments.iter_mut().enumerate() {
            let Some(span) = descriptor.owned_span(core, tensor) else {
                continue;
            };
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(span.start - cursor);
            let (data, tail) = tail.split_at_mut(span.len());
            rest = tail;
            cursor = span.end;
            segment.parts.push(Part {
                tensor,
                offset: span.start,
                data,
            });
        }
    }
    Ok(segments)
}

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::unary;
use crate::hal::ops::ElementOp;

/// Writes every input element back unchanged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Identity;

impl<W: Copy + Send + Sync> ElementOp<W> for Identity {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    #[inline]
    fn apply(&self, _tensor: usize, output: &mut [W], inputs: &[&[W]]) {
        output.copy_from_slice(inputs[0]);
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sqrt;

impl ElementOp<f32> for Sqrt {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        unary(output, inputs, f32::sqrt)
    }
}

/// Raises every element to a fixed power.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PowScalar {
    pub exponent: f32,
}

impl ElementOp<f32> for PowScalar {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        let exponent = self.exponent;
        if exponent == 2.0 {
            unary(output, inputs, |x| x * x)
        } else if exponent == 0.5 {
            unary(output, inputs, f32::sqrt)
        } else {
            unary(output, inputs, |x| x.powf(exponent))
        }
    }
}

/// Scales every element by a broadcast scalar.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MulScalar<W> {
    pub scalar: W,
}

impl ElementOp<f32> for MulScalar<f32> {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        let scalar = self.scalar;
        unary(output, inputs, |x| x * scalar)
    }
}

impl ElementOp<i32> for MulScalar<i32> {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    fn apply(&self, _tensor: usize, output: &mut [i32], inputs: &[&[i32]]) {
        let scalar = self.scalar;
        unary(output, inputs, |x| x.wrapping_mul(scalar))
    }
}

/// Scales every element of tensor `i` by `scalars[i]`.
///
/// # Panics
/// [`ElementOp::apply`] panics if `scalars` has no entry for the tensor. Launches check
/// [`ElementOp::tensors`] against the list before any core starts.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MulScalarList<W> {
    pub scalars: Vec<W>,
}

impl ElementOp<f32> for MulScalarList<f32> {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    #[inline]
    fn tensors(&self) -> Option<usize> {
        Some(self.scalars.len())
    }

    fn apply(&self, tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        let scalar = self.scalars[tensor];
        unary(output, inputs, |x| x * scalar)
    }
}

impl ElementOp<i32> for MulScalarList<i32> {
    #[inline]
    fn operands(&self) -> usize {
        1
    }

    #[inline]
    fn tensors(&self) -> Option<usize> {
        Some(self.scalars.len())
    }

    fn apply(&self, tensor: usize, output: &mut [i32], inputs: &[&[i32]]) {
        let scalar = self.scalars[tensor];
        unary(output, inputs, |x| x.wrapping_mul(scalar))
    }
}

#[cfg(test)]
mod tests {
    use half::f16;
    use itertools::Itertools;

    use super::{Identity, MulScalar, MulScalarList, PowScalar, Sqrt};
    use crate::{
        hal::ops::{DispatchTable, ElementOp, Workspace},
        loom::{arch::Generation, driver::Chunk},
    };

    #[test]
    fn test_identity() {
        let x = [1, -2, 3, i32::MAX];
        let mut z = [0; 4];
        Identity.apply(0, &mut z, &[&x]);
        assert_eq!(z, x);
    }

    #[test]
    fn test_pow_scalar() {
        let x = (0..8).map(|x| x as f32).collect_vec();
        let mut z = vec![0.0; 8];
        for exponent in [0.5, 2.0, 3.0] {
            PowScalar { exponent }.apply(0, &mut z, &[&x]);
            for (x, z) in x.iter().zip(&z) {
                assert!((x.powf(exponent) - z).abs() <= 1e-4 * z.abs().max(1.0));
            }
        }
    }

    #[test]
    fn test_mul_scalar() {
        let x = [1.5f32, -2.0, 0.0];
        let mut z = [0.0; 3];
        MulScalar { scalar: 2.0f32 }.apply(0, &mut z, &[&x]);
        assert_eq!(z, [3.0, -4.0, 0.0]);

        let x = [i32::MAX, 7];
        let mut z = [0; 2];
        MulScalar { scalar: 2i32 }.apply(0, &mut z, &[&x]);
        assert_eq!(z, [-2, 14]);
    }

    #[test]
    fn test_mul_scalar_list() {
        let op = MulScalarList {
            scalars: vec![2.0f32, -1.0, 0.5],
        };
        assert_eq!(ElementOp::<f32>::tensors(&op), Some(3));

        let x = [1.0f32, 4.0];
        let mut z = [0.0; 2];
        op.apply(1, &mut z, &[&x]);
        assert_eq!(z, [-1.0, -4.0]);
        op.apply(2, &mut z, &[&x]);
        assert_eq!(z, [0.5, 2.0]);

        let op = MulScalarList {
            scalars: vec![3i32, i32::MAX],
        };
        let mut z = [0; 2];
        op.apply(1, &mut z, &[&[1, 2]]);
        assert_eq!(z, [i32::MAX, -2]);
    }

    #[test]
    fn test_sqrt_f16() {
        let x = [0.0f32, 1.0, 4.0, 2.0, 1e4].map(f16::from_f32).to_vec();
        let mut z = vec![f16::ZERO; x.len()];

        let adapter = DispatchTable::default()
            .resolve::<f16, _>(Generation::V310, &Sqrt)
            .unwrap();
        let mut workspace = Workspace::new(x.len(), adapter.operands());
        let chunk = Chunk {
            tensor: 0,
            offset: 0,
            len: x.len(),
        };
        adapter.compute(&mut workspace, chunk, &mut z, &[&x]);

        let r#ref = x
            .iter()
            .map(|x| f16::from_f32(x.to_f32().sqrt()))
            .collect_vec();
        assert_eq!(z, r#ref);
    }
}

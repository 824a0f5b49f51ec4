#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::binary;
use crate::hal::ops::ElementOp;

/// `x + alpha * y` over two tensor lists.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AddList<W> {
    pub alpha: W,
}

impl Default for AddList<f32> {
    fn default() -> Self {
        Self { alpha: 1.0 }
    }
}

impl Default for AddList<i32> {
    fn default() -> Self {
        Self { alpha: 1 }
    }
}

impl ElementOp<f32> for AddList<f32> {
    #[inline]
    fn operands(&self) -> usize {
        2
    }

    fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        let alpha = self.alpha;
        if alpha == 1.0 {
            binary(output, inputs, |x, y| x + y)
        } else {
            binary(output, inputs, |x, y| x + alpha * y)
        }
    }
}

impl ElementOp<i32> for AddList<i32> {
    #[inline]
    fn operands(&self) -> usize {
        2
    }

    fn apply(&self, _tensor: usize, output: &mut [i32], inputs: &[&[i32]]) {
        let alpha = self.alpha;
        binary(output, inputs, |x, y| x.wrapping_add(alpha.wrapping_mul(y)))
    }
}

/// `x - y` over two tensor lists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SubList;

impl ElementOp<f32> for SubList {
    #[inline]
    fn operands(&self) -> usize {
        2
    }

    fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
        binary(output, inputs, |x, y| x - y)
    }
}

impl ElementOp<i32> for SubList {
    #[inline]
    fn operands(&self) -> usize {
        2
    }

    fn apply(&self, _tensor: usize, output: &mut [i32], inputs: &[&[i32]]) {
        binary(output, inputs, i32::wrapping_sub)
    }
}

#[cfg(test)]
mod tests {
    use half::bf16;
    use itertools::Itertools;

    use super::{AddList, SubList};
    use crate::{
        hal::ops::{DispatchTable, ElementOp, Workspace},
        loom::{arch::Generation, driver::Chunk},
    };

    #[test]
    fn test_add_list() {
        let x = [1.0f32, 2.0, 3.0];
        let y = [0.5f32, -1.0, 4.0];
        let mut z = [0.0; 3];
        AddList::<f32>::default().apply(0, &mut z, &[&x, &y]);
        assert_eq!(z, [1.5, 1.0, 7.0]);
        AddList { alpha: -2.0f32 }.apply(0, &mut z, &[&x, &y]);
        assert_eq!(z, [0.0, 4.0, -5.0]);

        let x = [i32::MAX, 5];
        let y = [1, 2];
        let mut z = [0; 2];
        AddList { alpha: 3i32 }.apply(0, &mut z, &[&x, &y]);
        assert_eq!(z, [i32::MIN + 2, 11]);
    }

    #[test]
    fn test_sub_list() {
        let x = [1.0f32, 2.0];
        let y = [0.5f32, 4.0];
        let mut z = [0.0; 2];
        SubList.apply(0, &mut z, &[&x, &y]);
        assert_eq!(z, [0.5, -2.0]);

        let mut z = [0; 1];
        SubList.apply(0, &mut z, &[&[i32::MIN], &[1]]);
        assert_eq!(z, [i32::MAX]);
    }

    #[test]
    fn test_add_list_bf16() {
        let mut rng = fastrand::Rng::with_seed(3);
        let x = (0..40).map(|_| bf16::from_f32(rng.f32() * 8.0)).collect_vec();
        let y = (0..40).map(|_| bf16::from_f32(rng.f32() * 8.0)).collect_vec();
        let mut z = vec![bf16::ZERO; 40];

        let op = AddList { alpha: 0.5f32 };
        let adapter = DispatchTable::default()
            .resolve::<bf16, _>(Generation::V220, &op)
            .unwrap();
        assert_eq!(adapter.operands(), 2);
        let mut workspace = Workspace::new(40, 2);
        let chunk = Chunk {
            tensor: 0,
            offset: 0,
            len: 40,
        };
        adapter.compute(&mut workspace, chunk, &mut z, &[&x, &y]);

        for ((x, y), z) in x.iter().zip(&y).zip(&z) {
            let r#ref = bf16::from_f32(x.to_f32() + 0.5 * y.to_f32());
            assert_eq!(*z, r#ref);
        }
    }
}

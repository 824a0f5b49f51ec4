use derive_more::Display;
use half::{bf16, f16};
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loom::{
    arch::Generation,
    driver::Chunk,
    num::{DataType, Half, Rounding, Scalar},
};

/// Per-element math of a foreach op, carried out at the working type `W`.
///
/// Implementations must only write `output` and keep no state between calls: every chunk is
/// independent of the ones before it.
pub trait ElementOp<W>: Send + Sync {
    /// Number of operand lists the op reads.
    fn operands(&self) -> usize;

    /// Number of tensors the op carries per-tensor parameters for, if any.
    ///
    /// A launch over a list of a different length is rejected before any core starts.
    fn tensors(&self) -> Option<usize> {
        None
    }

    /// Computes `output[i]` from `inputs[..][i]` for elements of `tensor`. All slices have the
    /// same length.
    fn apply(&self, tensor: usize, output: &mut [W], inputs: &[&[W]]);
}

/// `f32` buffers the upcast path widens operands into.
#[derive(Debug, Default, Clone)]
pub struct Workspace {
    inputs: Vec<Box<[f32]>>,
    output: Box<[f32]>,
}

impl Workspace {
    pub fn new(capacity: usize, operands: usize) -> Self {
        let buffer = || vec![0.0; capacity].into_boxed_slice();
        Self {
            inputs: (0..operands).map(|_| buffer()).collect(),
            output: buffer(),
        }
    }

    /// An empty workspace, for adapters that compute at the stored width.
    pub fn none() -> Self {
        Self::default()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.output.len()
    }
}

/// What the driver calls once per chunk.
pub trait ComputeAdapter<T: Scalar>: Send + Sync {
    fn operands(&self) -> usize;

    /// See [`ElementOp::tensors`].
    fn tensors(&self) -> Option<usize> {
        None
    }

    /// Whether [`Self::compute`] needs a [`Workspace`] of the chunk capacity.
    fn needs_workspace(&self) -> bool {
        false
    }

    /// Writes `output[..chunk.len]` from `inputs[..][..chunk.len]`.
    fn compute(&self, workspace: &mut Workspace, chunk: Chunk, output: &mut [T], inputs: &[&[T]]);
}

/// Runs the op directly at the stored width.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Native<Op>(pub Op);

impl<T, Op> ComputeAdapter<T> for Native<Op>
where
    T: Scalar,
    Op: ElementOp<T>,
{
    #[inline]
    fn operands(&self) -> usize {
        self.0.operands()
    }

    #[inline]
    fn tensors(&self) -> Option<usize> {
        self.0.tensors()
    }

    fn compute(&self, _workspace: &mut Workspace, chunk: Chunk, output: &mut [T], inputs: &[&[T]]) {
        let len = chunk.len;
        let inputs: Vec<_> = inputs.iter().map(|x| &x[..len]).collect();
        self.0.apply(chunk.tensor, &mut output[..len], &inputs);
    }
}

/// Widens every operand to `f32`, runs the op, and narrows the result under `rounding`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Upcast<Op> {
    pub op: Op,
    pub rounding: Rounding,
}

impl<T, Op> ComputeAdapter<T> for Upcast<Op>
where
    T: Half,
    Op: ElementOp<f32>,
{
    #[inline]
    fn operands(&self) -> usize {
        self.op.operands()
    }

    #[inline]
    fn tensors(&self) -> Option<usize> {
        self.op.tensors()
    }

    #[inline]
    fn needs_workspace(&self) -> bool {
        true
    }

    fn compute(&self, workspace: &mut Workspace, chunk: Chunk, output: &mut [T], inputs: &[&[T]]) {
        let len = chunk.len;
        let Workspace {
            inputs: wide,
            output: result,
        } = workspace;
        assert!(
            len <= result.len() && wide.len() >= inputs.len(),
            "workspace too small for a chunk of {len} elements"
        );

        for (wide, input) in wide.iter_mut().zip(inputs) {
            for (x, y) in wide[..len].iter_mut().zip(&input[..len]) {
                *x = y.widen();
            }
        }
        let wide: Vec<_> = wide[..inputs.len()].iter().map(|x| &x[..len]).collect();
        self.op.apply(chunk.tensor, &mut result[..len], &wide);

        for (x, &y) in output[..len].iter_mut().zip(&result[..len]) {
            *x = T::narrow(y, self.rounding);
        }
    }
}

/// How a data type is computed on some generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Variant {
    Native,
    #[display("Upcast({_0})")]
    Upcast(Rounding),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{data_type}@{generation}")]
pub struct TilingKey {
    pub data_type: DataType,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no compute variant registered for {0}")]
    Unknown(TilingKey),
    #[error("op cannot run as {variant} for {key}")]
    Unsupported { key: TilingKey, variant: Variant },
}

/// An element op that can be lowered to a [`ComputeAdapter`] for tensors of `T`.
pub trait Kernel<T: Scalar>: Send + Sync {
    fn lower(&self, variant: Variant) -> Option<Box<dyn ComputeAdapter<T>>>;
}

macro_rules! impl_kernel_native {
    ($ty:ty) => {
        impl<Op> Kernel<$ty> for Op
        where
            Op: ElementOp<$ty> + Clone + 'static,
        {
            fn lower(&self, variant: Variant) -> Option<Box<dyn ComputeAdapter<$ty>>> {
                match variant {
                    Variant::Native => Some(Box::new(Native(self.clone()))),
                    Variant::Upcast(_) => None,
                }
            }
        }
    };
}

macro_rules! impl_kernel_upcast {
    ($ty:ty) => {
        impl<Op> Kernel<$ty> for Op
        where
            Op: ElementOp<f32> + Clone + 'static,
        {
            fn lower(&self, variant: Variant) -> Option<Box<dyn ComputeAdapter<$ty>>> {
                match variant {
                    Variant::Native => None,
                    Variant::Upcast(rounding) => Some(Box::new(Upcast {
                        op: self.clone(),
                        rounding,
                    })),
                }
            }
        }
    };
}

impl_kernel_native!(f32);
impl_kernel_native!(i32);
impl_kernel_upcast!(f16);
impl_kernel_upcast!(bf16);

/// Maps a `(data type, generation)` pair to the way chunks of that type are computed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTable(HashMap<TilingKey, Variant>);

impl Default for DispatchTable {
    fn default() -> Self {
        let generations = [
            Generation::V200,
            Generation::V220,
            Generation::V300,
            Generation::V310,
        ];
        let types = [DataType::F32, DataType::F16, DataType::BF16, DataType::I32];
        let map = itertools::iproduct!(types, generations)
            .map(|(data_type, generation)| {
                let key = TilingKey {
                    data_type,
                    generation,
                };
                let variant = match data_type.is_reduced() {
                    true => Variant::Upcast(Rounding::NearestEven),
                    false => Variant::Native,
                };
                (key, variant)
            })
            .collect();
        Self(map)
    }
}

impl DispatchTable {
    /// A table with no entries.
    pub fn empty() -> Self {
        Self(HashMap::default())
    }

    pub fn insert(mut self, key: TilingKey, variant: Variant) -> Self {
        self.0.insert(key, variant);
        self
    }

    #[inline]
    pub fn get(&self, key: &TilingKey) -> Option<Variant> {
        self.0.get(key).copied()
    }

    /// Picks the adapter `kernel` runs with on `generation`.
    pub fn resolve<T, K>(
        &self,
        generation: Generation,
        kernel: &K,
    ) -> Result<Box<dyn ComputeAdapter<T>>, DispatchError>
    where
        T: Scalar,
        K: Kernel<T> + ?Sized,
    {
        let key = TilingKey {
            data_type: T::DATA_TYPE,
            generation,
        };
        let variant = self.get(&key).ok_or(DispatchError::Unknown(key))?;
        log::trace!("dispatch {key} as {variant}");
        kernel
            .lower(variant)
            .ok_or(DispatchError::Unsupported { key, variant })
    }
}

#[cfg(test)]
mod tests {
    use half::{bf16, f16};
    use itertools::Itertools;

    use super::{
        ComputeAdapter, DispatchError, DispatchTable, ElementOp, Native, TilingKey, Upcast,
        Variant, Workspace,
    };
    use crate::loom::{
        arch::Generation,
        driver::Chunk,
        num::{DataType, Rounding},
    };

    #[derive(Debug, Clone, Copy)]
    struct Halve;

    impl ElementOp<f32> for Halve {
        fn operands(&self) -> usize {
            1
        }

        fn apply(&self, _tensor: usize, output: &mut [f32], inputs: &[&[f32]]) {
            for (z, x) in output.iter_mut().zip(inputs[0]) {
                *z = x / 2.0;
            }
        }
    }

    fn chunk(tensor: usize, len: usize) -> Chunk {
        Chunk {
            tensor,
            offset: 0,
            len,
        }
    }

    #[test]
    fn test_native_adapter() {
        let input = (0..10).map(|x| x as f32).collect_vec();
        let mut output = vec![-1.0; 10];
        let adapter: &dyn ComputeAdapter<f32> = &Native(Halve);
        adapter.compute(&mut Workspace::none(), chunk(0, 6), &mut output, &[&input]);
        assert_eq!(&output[..6], &[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]);
        assert!(output[6..].iter().all(|&x| x == -1.0));
    }

    #[test]
    fn test_upcast_adapter() {
        let input = (0..16).map(|x| bf16::from_f32(x as f32 + 1.0)).collect_vec();
        let mut output = vec![bf16::ZERO; 16];
        let adapter = Upcast {
            op: Halve,
            rounding: Rounding::NearestEven,
        };
        let mut workspace = Workspace::new(16, 1);
        ComputeAdapter::<bf16>::compute(
            &adapter,
            &mut workspace,
            chunk(0, 16),
            &mut output,
            &[&input],
        );
        for (x, y) in input.iter().zip(&output) {
            assert_eq!(y.to_f32(), x.to_f32() / 2.0);
        }
    }

    #[test]
    fn test_resolve() {
        let table = DispatchTable::default();
        let adapter = table.resolve::<f32, _>(Generation::V220, &Halve).unwrap();
        assert!(!adapter.needs_workspace());
        let adapter = table.resolve::<f16, _>(Generation::V200, &Halve).unwrap();
        assert!(adapter.needs_workspace());
        assert_eq!(adapter.operands(), 1);

        let key = TilingKey {
            data_type: DataType::F32,
            generation: Generation::V310,
        };
        let table = DispatchTable::empty().insert(key, Variant::Upcast(Rounding::TowardZero));
        assert_eq!(
            table.resolve::<f32, _>(Generation::V310, &Halve).err(),
            Some(DispatchError::Unsupported {
                key,
                variant: Variant::Upcast(Rounding::TowardZero)
            })
        );
        assert!(matches!(
            table.resolve::<f32, _>(Generation::V220, &Halve),
            Err(DispatchError::Unknown(_))
        ));
    }
}

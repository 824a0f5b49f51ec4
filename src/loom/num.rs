use bytemuck::Pod;
use derive_more::Display;
use half::{bf16, f16};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataType {
    F32,
    F16,
    BF16,
    I32,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
            DataType::BF16 => 2,
            DataType::I32 => 4,
        }
    }

    /// Returns `true` for the half-width floating formats that are widened before arithmetic.
    pub const fn is_reduced(self) -> bool {
        matches!(self, DataType::F16 | DataType::BF16)
    }
}

/// Rounding applied when narrowing a working value back to a reduced-precision format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Rounding {
    #[default]
    NearestEven,
    TowardZero,
}

pub trait Zero {
    fn zero() -> Self;
}

impl Zero for f32 {
    fn zero() -> Self {
        0.0
    }
}

impl Zero for f16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for bf16 {
    fn zero() -> Self {
        Self::ZERO
    }
}

impl Zero for i32 {
    fn zero() -> Self {
        0
    }
}

/// An element type a foreach kernel can stream.
pub trait Scalar: Sized + Pod + Zero + Send + Sync + sealed::Sealed {
    const DATA_TYPE: DataType;
}

impl Scalar for f32 {
    const DATA_TYPE: DataType = DataType::F32;
}

impl Scalar for f16 {
    const DATA_TYPE: DataType = DataType::F16;
}

impl Scalar for bf16 {
    const DATA_TYPE: DataType = DataType::BF16;
}

impl Scalar for i32 {
    const DATA_TYPE: DataType = DataType::I32;
}

/// Half-width floating formats that compute through `f32`.
pub trait Half: Scalar {
    fn widen(self) -> f32;
    fn narrow(value: f32, rounding: Rounding) -> Self;
}

macro_rules! impl_half {
    ($ty:ty) => {
        impl Half for $ty {
            #[inline]
            fn widen(self) -> f32 {
                self.to_f32()
            }

            #[inline]
            fn narrow(value: f32, rounding: Rounding) -> Self {
                let nearest = <$ty>::from_f32(value);
                match rounding {
                    Rounding::NearestEven => nearest,
                    Rounding::TowardZero => {
                        // sign-magnitude: one bit pattern down is one ulp towards zero
                        let bits = nearest.to_bits();
                        let overshoot = value.is_finite() && nearest.to_f32().abs() > value.abs();
                        match overshoot && bits & 0x7fff != 0 {
                            true => <$ty>::from_bits(bits - 1),
                            false => nearest,
                        }
                    }
                }
            }
        }
    };
}

impl_half!(f16);
impl_half!(bf16);

mod sealed {
    use half::{bf16, f16};

    pub trait Sealed {}

    impl Sealed for f32 {}
    impl Sealed for f16 {}
    impl Sealed for bf16 {}
    impl Sealed for i32 {}
}

#[cfg(test)]
mod tests {
    use half::{bf16, f16};

    use super::{DataType, Half, Rounding, Scalar};

    #[test]
    fn test_data_type_size() {
        assert_eq!(<f32 as Scalar>::DATA_TYPE.size(), 4);
        assert_eq!(<f16 as Scalar>::DATA_TYPE.size(), 2);
        assert_eq!(<bf16 as Scalar>::DATA_TYPE.size(), 2);
        assert!(DataType::BF16.is_reduced());
        assert!(!DataType::I32.is_reduced());
    }

    #[test]
    fn test_narrow_toward_zero() {
        // 1/3 is not representable; nearest rounds up in f16, truncation must not
        let x = 1.0f32 / 3.0;
        let nearest = f16::narrow(x, Rounding::NearestEven);
        let truncated = f16::narrow(x, Rounding::TowardZero);
        assert!(truncated.to_f32() <= x);
        assert!(nearest.to_f32() - truncated.to_f32() <= f16::EPSILON.to_f32());

        let y = -x;
        let truncated = f16::narrow(y, Rounding::TowardZero);
        assert!(truncated.to_f32() >= y);

        let big = 1.0e6f32;
        assert_eq!(f16::narrow(big, Rounding::NearestEven), f16::INFINITY);
        assert_eq!(f16::narrow(big, Rounding::TowardZero), f16::MAX);
        assert_eq!(bf16::narrow(2.0, Rounding::TowardZero), bf16::from_f32(2.0));
        assert!(bf16::narrow(f32::NAN, Rounding::TowardZero).is_nan());
    }
}

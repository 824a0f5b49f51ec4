use itertools::izip;

pub use binary::{AddList, SubList};
pub use unary::{Identity, MulScalar, MulScalarList, PowScalar, Sqrt};

pub mod binary;
pub mod unary;

#[inline]
fn unary<W: Copy>(output: &mut [W], inputs: &[&[W]], f: impl Fn(W) -> W) {
    assert_eq!(inputs.len(), 1, "unary op takes one operand");
    for (z, &x) in output.iter_mut().zip(inputs[0]) {
        *z = f(x);
    }
}

#[inline]
fn binary<W: Copy>(output: &mut [W], inputs: &[&[W]], f: impl Fn(W, W) -> W) {
    assert_eq!(inputs.len(), 2, "binary op takes two operands");
    for (z, &x, &y) in izip!(output.iter_mut(), inputs[0], inputs[1]) {
        *z = f(x, y);
    }
}

//! Operator implementations for foreach kernels.
//!
//! [`ops`] defines the [`ComputeAdapter`](ops::ComputeAdapter) seam the driver calls once per
//! chunk, the native and upcast adapters, and the dispatch table that picks between them per data
//! type and hardware generation. [`cpu`] holds the reference element ops.

pub mod cpu;
pub mod ops;

//! The `loom` module provides the tiling and execution substrate for foreach kernels.
//! It partitions a ragged tensor list across a fixed set of cores and streams each core's share
//! through a buffered load → compute → store pipeline.
//!
//! ## Key Components
//! 1. **Planning**:
//!    - Balanced contiguous partition over the flattened element index (`planner`).
//!    - Scratch sizing per hardware generation (`ScratchBudget`, `arch`).
//!
//! 2. **Tiling Descriptor**:
//!    - Fixed-layout, versioned record shared by every core (`tiling`).
//!    - Explicit `encode`/`decode` with full range validation.
//!
//! 3. **Execution Model**:
//!    - Per-core state machine and pipelines of depth one or two (`driver`).
//!    - Disjoint output segments and block-aligned transfers (`memory`).
//!    - Async launch queue over simulated cores (`device`).
//!
//! 4. **Numerical System**:
//!    - Scalar types (`f32`, `f16`, `bf16`, `i32`) and their working types (`num`).
//!    - Block alignment helpers (`align`).
//!
//! ## Design Principles
//! - **Disjoint Ownership**: cores never share a writable element, so no locks are needed.
//! - **Safety**: a descriptor that decodes is one no core can use to leave its range.
//! - **Extensibility**: custom element ops via the `hal::ops` traits.

pub mod align;
pub mod arch;
pub mod device;
pub mod driver;
pub mod memory;
pub mod num;
pub mod planner;
pub mod platform;
pub mod tiling;

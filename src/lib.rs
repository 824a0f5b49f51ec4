//! # tessera
//!
//! Multi-core tiling and pipelined execution for *foreach* kernels: elementwise operations applied
//! independently across a ragged list of tensors in a single dispatch.
//!
//! The engine has three stages:
//! 1. [`loom::planner`] statically partitions the flattened elements of every tensor across a
//!    fixed number of cores, balancing load regardless of where tensor boundaries fall.
//! 2. [`loom::tiling`] stores that partition in a fixed-layout, versioned [`TilingDescriptor`]
//!    that is serialized once and handed to every core.
//! 3. [`loom::driver`] runs, on each core, a buffered load → compute → store pipeline that
//!    calls a pluggable [`hal::ops::ComputeAdapter`] once per chunk.
//!
//! [`loom::device::Cluster`] ties the stages together behind an async launch queue.
//!
//! ```no_run
//! # async fn run() -> Result<(), tessera::loom::device::LaunchError> {
//! use tessera::{
//!     hal::cpu::Sqrt,
//!     loom::{arch::Generation, device::ClusterBuilder},
//! };
//!
//! let cluster = ClusterBuilder::new(Generation::V220).build().await;
//! let tensors = vec![vec![4.0f32; 5].into_boxed_slice(), vec![9.0; 3].into_boxed_slice()];
//! let (outputs, report) = cluster.foreach(Sqrt, vec![tensors]).await?;
//! assert_eq!(outputs[1][0], 3.0);
//! println!("{report}");
//! # Ok(())
//! # }
//! ```

pub mod hal;
pub mod loom;

pub use loom::{
    planner::{PlanError, Planner, plan},
    tiling::{TilingDescriptor, TilingError},
};

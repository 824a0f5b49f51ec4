//! A simulated multi-core device that accepts foreach launches.
//!
//! [`Cluster`] is a cheap handle; launches are sent over a channel to a serve loop that plans each
//! one, serializes the descriptor, and runs every core on the blocking pool.

use std::sync::Arc;

use itertools::Itertools;
use thiserror::Error;

use super::{
    align::block_elements,
    arch::{Generation, Platform},
    driver::{self, CoreOptions, CoreReport, DriverError, Io, Pipeline},
    memory::{ShapeError, Traffic},
    num::Scalar,
    planner::{Granularity, PlanError, Planner, ScratchBudget, needed_core_count},
    platform::{BoxFuture, handle, spawn},
    tiling::{TilingDescriptor, TilingError},
};
use crate::hal::ops::{DispatchError, DispatchTable, Kernel};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Tiling(#[from] TilingError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("output segment of core {core} does not cover tensor {tensor}")]
    Segment { core: usize, tensor: usize },
    #[error("device is disconnected")]
    Disconnected,
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

impl From<DriverError> for LaunchError {
    fn from(value: DriverError) -> Self {
        match value {
            DriverError::Tiling(err) => Self::Tiling(err),
            DriverError::Shape(err) => Self::Shape(err),
            DriverError::Segment { core, tensor } => Self::Segment { core, tensor },
        }
    }
}

/// What a finished launch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub platform: Platform,
    pub descriptor: TilingDescriptor,
    pub cores: Vec<CoreReport>,
}

impl LaunchReport {
    #[inline]
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    #[inline]
    pub fn elements(&self) -> u64 {
        self.cores.iter().map(|core| core.elements).sum()
    }

    #[inline]
    pub fn traffic(&self) -> Traffic {
        self.cores.iter().map(|core| core.traffic).sum()
    }
}

impl std::fmt::Display for LaunchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{} elements of {} tensors on {} cores of {}",
            self.elements(),
            self.descriptor.tensor_count(),
            self.core_count(),
            self.platform
        )?;
        write!(f, "{}", self.cores.iter().format("\n"))
    }
}

type LaunchResult<T> = Result<(Vec<Box<[T]>>, LaunchReport), LaunchError>;

#[derive(Debug, Clone)]
struct Backend {
    platform: Platform,
    table: Arc<DispatchTable>,
    pipeline: Pipeline,
    granularity: Granularity,
}

impl Backend {
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    async fn launch<T, K>(&self, kernel: K, io: Io, operands: Vec<Vec<Box<[T]>>>) -> LaunchResult<T>
    where
        T: Scalar,
        K: Kernel<T>,
    {
        let Platform {
            generation,
            core_count,
            scratch_bytes,
        } = self.platform;
        let adapter = self.table.resolve::<T, K>(generation, &kernel)?;

        let arity = adapter.operands();
        if operands.len() != arity || (io == Io::InPlace && arity == 0) {
            return Err(ShapeError::Operands {
                expected: arity,
                found: operands.len(),
            }
            .into());
        }
        let lengths = operands
            .first()
            .map(|list| list.iter().map(|x| x.len() as u64).collect_vec())
            .unwrap_or_default();
        for list in operands.iter().skip(1) {
            if list.len() != lengths.len() {
                return Err(ShapeError::Count {
                    expected: lengths.len(),
                    found: list.len(),
                }
                .into());
            }
            if let Some((tensor, x)) = list
                .iter()
                .enumerate()
                .find(|(tensor, x)| x.len() as u64 != lengths[*tensor])
            {
                return Err(ShapeError::Length {
                    tensor,
                    expected: lengths[tensor] as usize,
                    found: x.len(),
                }
                .into());
            }
        }

        let total = lengths.iter().sum();
        let block = block_elements(T::DATA_TYPE)?;
        let cores = needed_core_count(total, block, core_count);
        let capacity = ScratchBudget::new(scratch_bytes)
            .operands(arity)
            .depth(self.pipeline.depth())
            .capacity(T::DATA_TYPE, adapter.needs_workspace())?;
        let descriptor = Planner::new(cores, block)
            .buffer_capacity(capacity)
            .granularity(self.granularity)
            .plan(&lengths)?;
        let blob = descriptor.encode();
        log::debug!(
            "launch {} over {cores} cores of {}: capacity {capacity}, {} B descriptor",
            T::DATA_TYPE,
            self.platform,
            blob.len()
        );

        let options = CoreOptions {
            pipeline: self.pipeline,
            io,
            policy: generation.transfer_policy(),
        };
        let (outputs, cores) = handle(move || {
            let mut operands = operands;
            let mut outputs = match io {
                Io::OutOfPlace => lengths
                    .iter()
                    .map(|&n| vec![T::zero(); n as usize].into_boxed_slice())
                    .collect_vec(),
                Io::InPlace => operands.remove(0),
            };
            let views = operands
                .iter()
                .map(|list| list.iter().map(|x| &x[..]).collect_vec())
                .collect_vec();
            let lists = views.iter().map(|x| &x[..]).collect_vec();
            let reports = driver::run_all(&blob, options, &lists, &mut outputs, &*adapter)?;
            Ok::<_, DriverError>((outputs, reports))
        })
        .await??;

        let platform = self.platform;
        let report = LaunchReport {
            platform,
            descriptor,
            cores,
        };
        Ok((outputs, report))
    }
}

trait Job: Send {
    fn run(self: Box<Self>, backend: Backend) -> BoxFuture<'static, ()>;
}

struct Launch<T: Scalar, K> {
    kernel: K,
    io: Io,
    operands: Vec<Vec<Box<[T]>>>,
    sender: flume::Sender<LaunchResult<T>>,
}

impl<T, K> Job for Launch<T, K>
where
    T: Scalar,
    K: Kernel<T> + 'static,
{
    fn run(self: Box<Self>, backend: Backend) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Launch {
                kernel,
                io,
                operands,
                sender,
            } = *self;
            let result = backend.launch(kernel, io, operands).await;
            if let Err(err) = &result {
                log::error!("foreach launch failed: {err}");
            }
            _ = sender.send_async(result).await;
        })
    }
}

#[derive(Debug, Clone)]
pub struct Cluster {
    platform: Platform,
    /// Sends launches to the serve loop.
    sender: flume::Sender<Box<dyn Job>>,
}

impl Cluster {
    #[inline]
    pub fn platform(&self) -> Platform {
        self.platform
    }

    async fn submit<T, K>(&self, kernel: K, io: Io, operands: Vec<Vec<Box<[T]>>>) -> LaunchResult<T>
    where
        T: Scalar,
        K: Kernel<T> + 'static,
    {
        let (sender, receiver) = flume::bounded(1);
        let launch = Launch {
            kernel,
            io,
            operands,
            sender,
        };
        self.sender
            .send_async(Box::new(launch))
            .await
            .map_err(|_| LaunchError::Disconnected)?;
        receiver
            .recv_async()
            .await
            .map_err(|_| LaunchError::Disconnected)?
    }

    /// Applies `kernel` across the tensor lists in `operands`, returning fresh output tensors.
    ///
    /// Every operand list must hold the same number of tensors with matching lengths.
    pub async fn foreach<T, K>(&self, kernel: K, operands: Vec<Vec<Box<[T]>>>) -> LaunchResult<T>
    where
        T: Scalar,
        K: Kernel<T> + 'static,
    {
        self.submit(kernel, Io::OutOfPlace, operands).await
    }

    /// Like [`Self::foreach`], but the first operand list is overwritten with the result and
    /// handed back.
    pub async fn foreach_in_place<T, K>(
        &self,
        kernel: K,
        operands: Vec<Vec<Box<[T]>>>,
    ) -> LaunchResult<T>
    where
        T: Scalar,
        K: Kernel<T> + 'static,
    {
        self.submit(kernel, Io::InPlace, operands).await
    }
}

#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    pub platform: Platform,
    pub table: DispatchTable,
    pub pipeline: Pipeline,
    pub granularity: Granularity,
}

impl ClusterBuilder {
    pub fn new(generation: Generation) -> Self {
        Self {
            platform: generation.into(),
            table: DispatchTable::default(),
            pipeline: Pipeline::default(),
            granularity: Granularity::default(),
        }
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn table(mut self, table: DispatchTable) -> Self {
        self.table = table;
        self
    }

    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub async fn build(self) -> Cluster {
        let platform = self.platform;
        let backend = Backend {
            platform,
            table: Arc::new(self.table),
            pipeline: self.pipeline,
            granularity: self.granularity,
        };

        let (sender, receiver) = flume::unbounded();
        spawn(serve(backend, receiver));

        Cluster { platform, sender }
    }
}

async fn serve(backend: Backend, receiver: flume::Receiver<Box<dyn Job>>) {
    while let Ok(job) = receiver.recv_async().await {
        job.run(backend.clone()).await;
    }
    log::debug!("cluster on {} shut down", backend.platform);
}

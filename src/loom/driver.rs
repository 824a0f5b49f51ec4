//! Per-core execution: stream the elements a core owns through a load → compute → store pipeline.
//!
//! Each core decodes the launch blob itself, walks its slice of the partition chunk by chunk, and
//! writes only into the output [`Segment`] it was handed. Cores share nothing mutable, so they
//! may run in any order or all at once.

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    memory::{Scratch, Segment, ShapeError, Traffic, Transfer, TransferPolicy, check_shape},
    num::Scalar,
    tiling::{TilingDescriptor, TilingError},
};
use crate::hal::ops::{ComputeAdapter, Workspace};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error(transparent)]
    Tiling(#[from] TilingError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("output segment of core {core} does not cover tensor {tensor}")]
    Segment { core: usize, tensor: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum State {
    #[default]
    Init,
    Streaming,
    Done,
}

/// Where the driver is within the elements its core owns.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionCursor {
    pub tensor: usize,
    pub offset: usize,
    pub remaining: u64,
}

/// A contiguous run of elements of one tensor, moved through one pipeline step.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("{tensor}[{offset}..+{len}]")]
pub struct Chunk {
    pub tensor: usize,
    pub offset: usize,
    pub len: usize,
}

/// How many chunks are in flight at once.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Pipeline {
    /// Load, compute and store one chunk before touching the next.
    Serial,
    /// Store chunk `i - 1`, compute chunk `i` and load chunk `i + 1` out of alternating buffers.
    #[default]
    Double,
}

impl Pipeline {
    #[inline]
    pub const fn depth(self) -> usize {
        match self {
            Pipeline::Serial => 1,
            Pipeline::Double => 2,
        }
    }
}

/// Where the operands of a launch come from.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Io {
    /// Every operand list is an input; results go to separate output tensors.
    #[default]
    OutOfPlace,
    /// The first operand is the output itself and is overwritten with the result.
    InPlace,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CoreOptions {
    pub pipeline: Pipeline,
    pub io: Io,
    pub policy: TransferPolicy,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("core {core}: {chunks} chunks, {elements} elements, {traffic}")]
pub struct CoreReport {
    pub core: usize,
    pub chunks: usize,
    pub elements: u64,
    pub traffic: Traffic,
}

/// Walks the slice of the partition owned by one core, yielding its chunks in order.
#[derive(Debug, Clone)]
pub struct CoreDriver<'a> {
    descriptor: &'a TilingDescriptor,
    core: usize,
    state: State,
    cursor: ExecutionCursor,
}

impl<'a> CoreDriver<'a> {
    pub fn new(descriptor: &'a TilingDescriptor, core: usize) -> Result<Self, TilingError> {
        if core >= descriptor.core_count() {
            return Err(TilingError::Core {
                core,
                count: descriptor.core_count(),
            });
        }
        Ok(Self {
            descriptor,
            core,
            state: State::Init,
            cursor: ExecutionCursor::default(),
        })
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn cursor(&self) -> ExecutionCursor {
        self.cursor
    }

    /// Reads this core's slice of the descriptor. A core that owns nothing goes straight to
    /// [`State::Done`].
    pub fn start(&mut self) {
        if self.state != State::Init {
            return;
        }
        let range = self.descriptor.core_range(self.core);
        let remaining = self.descriptor.elements_owned_by_core(self.core);
        self.cursor = ExecutionCursor {
            tensor: range.start_tensor,
            offset: range.start_offset,
            remaining,
        };
        self.state = match remaining {
            0 => State::Done,
            _ => State::Streaming,
        };
    }
}

impl Iterator for CoreDriver<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Self::Item> {
        self.start();
        if self.state == State::Done {
            return None;
        }

        let descriptor = self.descriptor;
        let cursor = &mut self.cursor;
        while cursor.offset == descriptor.tensor_len(cursor.tensor) {
            cursor.tensor += 1;
            cursor.offset = 0;
        }

        let left = descriptor.tensor_len(cursor.tensor) - cursor.offset;
        let len = descriptor
            .buffer_capacity()
            .min(left)
            .min(cursor.remaining.try_into().unwrap_or(usize::MAX));
        let chunk = Chunk {
            tensor: cursor.tensor,
            offset: cursor.offset,
            len,
        };

        cursor.offset += len;
        cursor.remaining -= len as u64;
        if cursor.remaining == 0 {
            self.state = State::Done;
        }
        Some(chunk)
    }
}

/// One set of on-core buffers: a native buffer per operand and one for the result.
struct Slot<T> {
    inputs: Vec<Scratch<T>>,
    output: Scratch<T>,
}

struct Stage<'s, 'a, T: Scalar> {
    core: usize,
    io: Io,
    inputs: &'s [&'s [&'s [T]]],
    segment: Segment<'a, T>,
    adapter: &'s dyn ComputeAdapter<T>,
    transfer: Transfer,
    slots: Vec<Slot<T>>,
    workspace: Workspace,
}

impl<T: Scalar> Stage<'_, '_, T> {
    fn load(&mut self, slot: usize, chunk: Chunk) -> Result<(), DriverError> {
        let Chunk { tensor, offset, len } = chunk;
        let slot = &mut self.slots[slot];
        for (operand, dst) in slot.inputs.iter_mut().enumerate() {
            match (self.io, operand) {
                (Io::InPlace, 0) => {
                    let part = self.segment.part_mut(tensor).ok_or(DriverError::Segment {
                        core: self.core,
                        tensor,
                    })?;
                    self.transfer.load(part.data, offset - part.offset, len, dst);
                }
                (Io::InPlace, operand) => {
                    let src = self.inputs[operand - 1][tensor];
                    self.transfer.load(src, offset, len, dst);
                }
                (Io::OutOfPlace, operand) => {
                    let src = self.inputs[operand][tensor];
                    self.transfer.load(src, offset, len, dst);
                }
            }
        }
        Ok(())
    }

    fn compute(&mut self, slot: usize, chunk: Chunk) {
        let Slot { inputs, output } = &mut self.slots[slot];
        let inputs: Vec<&[T]> = inputs.iter().map(|x| &x[..]).collect();
        self.adapter.compute(&mut self.workspace, chunk, output, &inputs);
    }

    fn store(&mut self, slot: usize, chunk: Chunk) -> Result<(), DriverError> {
        let Chunk { tensor, offset, len } = chunk;
        let part = self.segment.part_mut(tensor).ok_or(DriverError::Segment {
            core: self.core,
            tensor,
        })?;
        let src = &self.slots[slot].output;
        self.transfer.store(src, part.data, offset - part.offset, len);
        Ok(())
    }
}

/// Runs one core of a launch.
///
/// `inputs` holds one tensor list per operand (all but the first under [`Io::InPlace`]);
/// `segment` holds the output elements this core owns, as produced by
/// [`split_outputs`](super::memory::split_outputs).
#[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(core = core)))]
pub fn run_core<T: Scalar>(
    blob: &[u8],
    core: usize,
    options: CoreOptions,
    inputs: &[&[&[T]]],
    segment: Segment<'_, T>,
    adapter: &dyn ComputeAdapter<T>,
) -> Result<CoreReport, DriverError> {
    let descriptor = TilingDescriptor::decode(blob)?;
    let mut driver = CoreDriver::new(&descriptor, core)?;
    if segment.core != core {
        return Err(DriverError::Segment {
            core,
            tensor: descriptor.core_range(core).start_tensor,
        });
    }

    let operands = adapter.operands();
    let expected = match options.io {
        Io::OutOfPlace => operands,
        Io::InPlace => operands.saturating_sub(1),
    };
    if inputs.len() != expected {
        return Err(ShapeError::Operands {
            expected,
            found: inputs.len(),
        }
        .into());
    }
    for list in inputs {
        check_shape(&descriptor, list)?;
    }
    match adapter.tensors() {
        Some(found) if found != descriptor.tensor_count() => {
            return Err(ShapeError::Parameters {
                expected: descriptor.tensor_count(),
                found,
            }
            .into());
        }
        _ => {}
    }

    driver.start();
    let mut report = CoreReport {
        core,
        ..Default::default()
    };
    if driver.state() == State::Done {
        log::trace!("core {core}: idle");
        return Ok(report);
    }

    let capacity = descriptor.buffer_capacity();
    let depth = options.pipeline.depth();
    let slots = (0..depth)
        .map(|_| Slot {
            inputs: (0..operands).map(|_| Scratch::new(capacity)).collect(),
            output: Scratch::new(capacity),
        })
        .collect();
    let workspace = match adapter.needs_workspace() {
        true => Workspace::new(capacity, operands),
        false => Workspace::none(),
    };
    let mut stage = Stage {
        core,
        io: options.io,
        inputs,
        segment,
        adapter,
        transfer: Transfer::new(options.policy, descriptor.element_alignment()),
        slots,
        workspace,
    };

    let mut count = |chunk: Chunk| {
        log::trace!("core {core}: chunk {chunk}");
        report.chunks += 1;
        report.elements += chunk.len as u64;
    };

    match options.pipeline {
        Pipeline::Serial => {
            for chunk in driver {
                count(chunk);
                stage.load(0, chunk)?;
                stage.compute(0, chunk);
                stage.store(0, chunk)?;
            }
        }
        Pipeline::Double => {
            let mut previous: Option<Chunk> = None;
            let mut current = driver.next();
            if let Some(chunk) = current {
                stage.load(0, chunk)?;
            }

            let mut index = 0;
            while let Some(chunk) = current {
                count(chunk);
                let slot = index % depth;
                let other = (index + 1) % depth;

                // the other slot holds chunk `index - 1` and receives chunk `index + 1`
                if let Some(previous) = previous {
                    stage.store(other, previous)?;
                }
                stage.compute(slot, chunk);
                let next = driver.next();
                if let Some(next) = next {
                    stage.load(other, next)?;
                }

                previous = Some(chunk);
                current = next;
                index += 1;
            }
            if let Some(previous) = previous {
                stage.store((index + 1) % depth, previous)?;
            }
        }
    }

    report.traffic = stage.transfer.traffic();
    log::trace!("{report}");
    Ok(report)
}

/// Runs every core of a launch, writing results into `outputs`.
///
/// With the `rayon` feature the cores run in parallel.
pub fn run_all<T, O>(
    blob: &[u8],
    options: CoreOptions,
    inputs: &[&[&[T]]],
    outputs: &mut [O],
    adapter: &dyn ComputeAdapter<T>,
) -> Result<Vec<CoreReport>, DriverError>
where
    T: Scalar,
    O: AsMut<[T]>,
{
    let descriptor = TilingDescriptor::decode(blob)?;
    let segments = super::memory::split_outputs(&descriptor, outputs)?;

    #[cfg(feature = "rayon")]
    let reports = {
        use rayon::prelude::*;
        segments
            .into_par_iter()
            .map(|segment| run_core(blob, segment.core, options, inputs, segment, adapter))
            .collect()
    };
    #[cfg(not(feature = "rayon"))]
    let reports = segments
        .into_iter()
        .map(|segment| run_core(blob, segment.core, options, inputs, segment, adapter))
        .collect();

    reports
}

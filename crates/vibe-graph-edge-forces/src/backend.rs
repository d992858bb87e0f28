//! Kernel execution abstraction shared by the wgpu and host backends.
//!
//! Each kernel takes a typed argument struct instead of a list of named
//! slots. Arguments are checked against the buffer sizes before anything is
//! dispatched, so an undersized or stale buffer fails as a topology mismatch
//! instead of reading out of bounds on the device.

use std::fmt;
use std::mem::size_of;

use crate::physics::PhysicsParams;
use crate::topology::Direction;
use crate::work::{KernelWorkSize, WorkPlan};
use crate::{CarryOut, EdgeForceError, EdgeRecord, Force, Position, Result, StartEnd, WorkItem};

/// Smallest allocation handed out, so that empty graphs still bind.
pub const MIN_BUFFER_SIZE: u64 = 16;

/// Round a requested byte length up to something every backend accepts.
pub(crate) fn padded_size(size: u64) -> u64 {
    size.max(MIN_BUFFER_SIZE).next_multiple_of(4)
}

/// What a device buffer is used for. Also its debug label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    EdgeForcesMap,
    CarryOut,
    ForwardStartEnd,
    BackwardStartEnd,
    SegStart,
    ForwardWorkList,
    BackwardWorkList,
    PartialForces,
    CurForces,
    ZeroForces,
    ForwardEdges,
    BackwardEdges,
    ForwardWeights,
    BackwardWeights,
    PointDegrees,
    Points,
    PriorForces,
}

impl BufferRole {
    pub fn label(self) -> &'static str {
        match self {
            BufferRole::EdgeForcesMap => "Edge Forces Map",
            BufferRole::CarryOut => "Carry Out",
            BufferRole::ForwardStartEnd => "Forward Start/End",
            BufferRole::BackwardStartEnd => "Backward Start/End",
            BufferRole::SegStart => "Segment Start",
            BufferRole::ForwardWorkList => "Forward Work List",
            BufferRole::BackwardWorkList => "Backward Work List",
            BufferRole::PartialForces => "Partial Forces",
            BufferRole::CurForces => "Current Forces",
            BufferRole::ZeroForces => "Zero Forces",
            BufferRole::ForwardEdges => "Forward Edges",
            BufferRole::BackwardEdges => "Backward Edges",
            BufferRole::ForwardWeights => "Forward Edge Weights",
            BufferRole::BackwardWeights => "Backward Edge Weights",
            BufferRole::PointDegrees => "Point Degrees",
            BufferRole::Points => "Points",
            BufferRole::PriorForces => "Prior Forces",
        }
    }

    pub(crate) fn work_list(direction: Direction) -> Self {
        match direction {
            Direction::Forward => BufferRole::ForwardWorkList,
            Direction::Backward => BufferRole::BackwardWorkList,
        }
    }
}

impl fmt::Display for BufferRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The two kernels of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelStage {
    MapEdges,
    SegReduce,
}

impl fmt::Display for KernelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelStage::MapEdges => f.write_str("map_edges"),
            KernelStage::SegReduce => f.write_str("seg_reduce"),
        }
    }
}

/// Arguments of the per-edge force map.
pub struct MapEdgesArgs<'a, B: ComputeBackend + ?Sized> {
    pub params: PhysicsParams,
    pub direction: Direction,
    pub num_edges: u32,
    pub num_points: u32,
    pub edges: &'a B::Buffer,
    pub point_degrees: &'a B::Buffer,
    pub points: &'a B::Buffer,
    pub edge_weights: &'a B::Buffer,
    /// One `Force` per edge, written at the edge's index.
    pub output: &'a B::Buffer,
}

impl<B: ComputeBackend + ?Sized> MapEdgesArgs<'_, B> {
    /// Check every binding against the sizes implied by the counts.
    pub fn validate(&self, backend: &B) -> Result<()> {
        let edges = self.num_edges as u64;
        let points = self.num_points as u64;
        check(backend, "edges", self.edges, edges * size_of::<EdgeRecord>() as u64)?;
        check(backend, "edge weights", self.edge_weights, edges * size_of::<f32>() as u64)?;
        check(backend, "point degrees", self.point_degrees, points * size_of::<u32>() as u64)?;
        check(backend, "points", self.points, points * size_of::<Position>() as u64)?;
        check(backend, "edge forces map", self.output, edges * size_of::<Force>() as u64)
    }
}

/// Arguments of the two-level segmented reduction.
pub struct SegReduceArgs<'a, B: ComputeBackend + ?Sized> {
    pub direction: Direction,
    /// Number of edge contributions.
    pub num_input: u32,
    /// Number of points.
    pub num_output: u32,
    pub num_work_items: u32,
    pub input: &'a B::Buffer,
    pub edges: &'a B::Buffer,
    pub start_end: &'a B::Buffer,
    pub seg_start: &'a B::Buffer,
    pub work_list: &'a B::Buffer,
    pub carry_out: &'a B::Buffer,
    /// Incoming per-point forces the pass adds onto.
    pub partial_forces: &'a B::Buffer,
    pub output: &'a B::Buffer,
}

impl<B: ComputeBackend + ?Sized> SegReduceArgs<'_, B> {
    /// Check every binding; the carry table size depends on the group size.
    pub fn validate(&self, backend: &B, work: KernelWorkSize) -> Result<()> {
        let edges = self.num_input as u64;
        let points = self.num_output as u64;
        let carry = WorkPlan::carry_entries(self.num_input, work.local) as u64;
        check(backend, "edge forces map", self.input, edges * size_of::<Force>() as u64)?;
        check(backend, "edges", self.edges, edges * size_of::<EdgeRecord>() as u64)?;
        check(backend, "start/end table", self.start_end, points * size_of::<StartEnd>() as u64)?;
        check(backend, "segment start", self.seg_start, points * size_of::<u32>() as u64)?;
        check(
            backend,
            "work list",
            self.work_list,
            self.num_work_items as u64 * size_of::<WorkItem>() as u64,
        )?;
        check(backend, "carry out", self.carry_out, carry * size_of::<CarryOut>() as u64)?;
        check(backend, "partial forces", self.partial_forces, points * size_of::<Force>() as u64)?;
        check(backend, "output forces", self.output, points * size_of::<Force>() as u64)
    }
}

fn check<B: ComputeBackend + ?Sized>(
    backend: &B,
    what: &str,
    buffer: &B::Buffer,
    expected: u64,
) -> Result<()> {
    let actual = backend.buffer_size(buffer);
    if actual < expected {
        return Err(EdgeForceError::mismatch(what, expected, actual));
    }
    Ok(())
}

/// Device buffers plus the two kernels of the edge-force pipeline.
///
/// Every async method resolves once the device has finished the work, which
/// is what orders the stages of a tick.
#[allow(async_fn_in_trait)]
pub trait ComputeBackend {
    type Buffer: Send + Sync;

    fn name(&self) -> &str;

    async fn create_buffer(&self, role: BufferRole, size: u64) -> Result<Self::Buffer>;

    async fn create_buffer_init(&self, role: BufferRole, contents: &[u8]) -> Result<Self::Buffer> {
        let buffer = self.create_buffer(role, contents.len() as u64).await?;
        if !contents.is_empty() {
            self.write_buffer(&buffer, contents).await?;
        }
        Ok(buffer)
    }

    /// Allocated size in bytes.
    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    /// Overwrite the start of `buffer` with `contents`.
    async fn write_buffer(&self, buffer: &Self::Buffer, contents: &[u8]) -> Result<()>;

    async fn read_buffer(&self, buffer: &Self::Buffer) -> Result<Vec<u8>>;

    /// Copy the whole of `source` into the start of `destination`.
    async fn copy_buffer(&self, source: &Self::Buffer, destination: &Self::Buffer) -> Result<()>;

    async fn map_edges(&self, args: &MapEdgesArgs<'_, Self>, work: KernelWorkSize) -> Result<()>;

    async fn seg_reduce(&self, args: &SegReduceArgs<'_, Self>, work: KernelWorkSize) -> Result<()>;
}

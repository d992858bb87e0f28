//! GPU edge-force accumulation for ForceAtlas2-style graph layout.
//!
//! The attraction stage of a force-directed layout is a sum over edges: every
//! edge contributes a force to one of its endpoints. This crate computes those
//! per-point sums on the GPU with a map / segmented-reduce pipeline that runs
//! twice per tick, once over the edges grouped by source point (forward) and
//! once over the edges grouped by target point (backward).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 prepare (once per topology)                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  Topology   │───▶│  Work plan  │───▶│ GPU Buffers │      │
//! │  │ (fwd / bwd) │    │ (worklists) │    │  (upload)   │      │
//! │  └─────────────┘    └─────────────┘    └─────────────┘      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        one tick                             │
//! │  ┌──────────┐   ┌────────────┐   ┌──────────┐   ┌────────┐  │
//! │  │ Map fwd  │──▶│ Reduce fwd │──▶│ Map bwd  │──▶│ Reduce │  │
//! │  │ (edges)  │   │ → buffer A │   │ (edges)  │   │ A → B  │  │
//! │  └──────────┘   └────────────┘   └──────────┘   └────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Publish                             │
//! │  Buffer B halves swap only after the whole tick succeeded   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Segmented reduction
//!
//! Edges are cut into chunks of one workgroup each. A workgroup scans its
//! chunk with segment head flags, finalizes every point whose edge range lies
//! inside the chunk, and parks the partial sums of ranges that cross a chunk
//! boundary in the carry-out table. A second phase walks a precomputed
//! worklist of those crossing points and adds the carried partials in group
//! order.
//!
//! Kernels run behind the [`ComputeBackend`] trait: [`WgpuBackend`] on real
//! hardware and [`CpuBackend`], a host emulation with the same chunking, for
//! tests and machines without an adapter.

mod backend;
mod buffers;
mod cpu;
mod edge_forces;
mod error;
mod gpu;
mod physics;
mod shaders;
mod topology;
mod work;

pub use backend::{BufferRole, ComputeBackend, KernelStage, MapEdgesArgs, SegReduceArgs};
pub use buffers::EdgeForceBuffers;
pub use cpu::{CpuBackend, CpuBuffer};
pub use edge_forces::{EdgeForceConfig, EdgeForces};
pub use error::EdgeForceError;
pub use gpu::{GpuContext, WgpuBackend};
pub use physics::{AttractionScoring, EdgeSample, EdgeScoring, ForceModes, PhysicsParams, WeightScoring};
pub use topology::{Direction, EdgeList, GraphBuffers, PassInputs, TickInputs, Topology};
pub use work::{KernelWorkSize, WorkItemSizing, WorkPlan};

/// Result type for edge-force operations.
pub type Result<T> = std::result::Result<T, EdgeForceError>;

/// A directed edge as laid out on the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct EdgeRecord {
    pub source: u32,
    pub target: u32,
}

impl EdgeRecord {
    pub fn new(source: u32, target: u32) -> Self {
        Self { source, target }
    }

    /// The endpoint this edge is grouped under in the given direction.
    pub fn grouping_point(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Forward => self.source,
            Direction::Backward => self.target,
        }
    }

    /// The endpoint opposite to [`grouping_point`](Self::grouping_point).
    pub fn other_point(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Forward => self.target,
            Direction::Backward => self.source,
        }
    }
}

/// Half-open range of edge indices owned by one point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct StartEnd {
    pub start: u32,
    pub end: u32,
}

impl StartEnd {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// A 2D point position.
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// A 2D force accumulated per edge or per point.
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct Force {
    pub x: f32,
    pub y: f32,
}

impl Force {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0 };

    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Force {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::AddAssign for Force {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

/// Per-group entry of the carry-out table.
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct CarryOut {
    /// Group-local sum of the segment still open at the end of the chunk.
    pub tail: Force,
    /// Group-local sum of a boundary-crossing segment that closes in the chunk.
    pub head: Force,
}

/// Stitch entry for a point whose segment crosses a group boundary.
///
/// The groups it touches are `seg_start[point] ..= last_group`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct WorkItem {
    pub point: u32,
    pub last_group: u32,
}

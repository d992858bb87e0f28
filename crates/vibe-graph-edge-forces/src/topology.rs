//! Adjacency input: forward / backward edge lists and their start/end tables.
//!
//! The physics loop owns the graph; this module only describes the shape the
//! edge-force passes expect and checks it once per topology so that no kernel
//! ever walks a malformed segment table.

use std::fmt;

use crate::backend::{BufferRole, ComputeBackend};
use crate::{EdgeForceError, EdgeRecord, Result, StartEnd};

/// Traversal direction of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Edges grouped by source point.
    Forward,
    /// Edges grouped by target point.
    Backward,
}

impl Direction {
    pub fn is_forward(self) -> bool {
        self == Direction::Forward
    }

    /// Flag value passed to the kernels.
    pub fn as_flag(self) -> u32 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => 0,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// One ordering of the edge population together with its start/end table.
#[derive(Debug, Clone)]
pub struct EdgeList {
    direction: Direction,
    edges: Vec<EdgeRecord>,
    weights: Vec<f32>,
    start_end: Vec<StartEnd>,
}

impl EdgeList {
    /// Wrap an already grouped edge list. Checked by [`Topology::from_lists`].
    pub fn new(
        direction: Direction,
        edges: Vec<EdgeRecord>,
        weights: Vec<f32>,
        start_end: Vec<StartEnd>,
    ) -> Self {
        Self {
            direction,
            edges,
            weights,
            start_end,
        }
    }

    /// Group weighted edges by their endpoint for `direction`.
    ///
    /// The sort is stable, so edges sharing a point keep their input order.
    pub fn group(direction: Direction, num_points: u32, edges: &[(EdgeRecord, f32)]) -> Self {
        let mut sorted: Vec<(EdgeRecord, f32)> = edges.to_vec();
        sorted.sort_by_key(|(edge, _)| edge.grouping_point(direction));

        let mut start_end = vec![StartEnd::default(); num_points as usize];
        let mut cursor = 0usize;
        for (point, range) in start_end.iter_mut().enumerate() {
            let start = cursor;
            while cursor < sorted.len() && sorted[cursor].0.grouping_point(direction) as usize == point {
                cursor += 1;
            }
            *range = StartEnd::new(start as u32, cursor as u32);
        }

        let (edges, weights) = sorted.into_iter().unzip();
        Self::new(direction, edges, weights, start_end)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn edges(&self) -> &[EdgeRecord] {
        &self.edges
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn start_end(&self) -> &[StartEnd] {
        &self.start_end
    }

    /// Edge range owned by `point`.
    pub fn segment(&self, point: u32) -> StartEnd {
        self.start_end
            .get(point as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    fn validate(&self, num_points: u32) -> Result<()> {
        let label = self.direction;
        if self.weights.len() != self.edges.len() {
            return Err(EdgeForceError::InvalidTopology(format!(
                "{label} list has {} edges but {} weights",
                self.edges.len(),
                self.weights.len()
            )));
        }
        if self.start_end.len() != num_points as usize {
            return Err(EdgeForceError::InvalidTopology(format!(
                "{label} start/end table has {} entries for {num_points} points",
                self.start_end.len()
            )));
        }

        let mut expected_start = 0u32;
        for (point, range) in self.start_end.iter().enumerate() {
            if range.start != expected_start
                || range.end < range.start
                || range.end as usize > self.edges.len()
            {
                return Err(EdgeForceError::InvalidTopology(format!(
                    "{label} segment of point {point} is {}..{}, expected to start at {expected_start}",
                    range.start, range.end
                )));
            }
            expected_start = range.end;

            for edge in &self.edges[range.start as usize..range.end as usize] {
                if edge.grouping_point(self.direction) as usize != point {
                    return Err(EdgeForceError::InvalidTopology(format!(
                        "{label} edge {}->{} filed under point {point}",
                        edge.source, edge.target
                    )));
                }
            }
        }
        if expected_start as usize != self.edges.len() {
            return Err(EdgeForceError::InvalidTopology(format!(
                "{label} segments cover {expected_start} of {} edges",
                self.edges.len()
            )));
        }

        if let Some(edge) = self
            .edges
            .iter()
            .find(|e| e.source >= num_points || e.target >= num_points)
        {
            return Err(EdgeForceError::InvalidTopology(format!(
                "edge {}->{} references a point outside 0..{num_points}",
                edge.source, edge.target
            )));
        }
        Ok(())
    }
}

/// Both orderings of a graph's edges.
#[derive(Debug, Clone)]
pub struct Topology {
    num_points: u32,
    forward: EdgeList,
    backward: EdgeList,
}

impl Topology {
    /// Build both orderings from `(source, target, weight)` triples.
    pub fn from_edges(num_points: u32, edges: &[(u32, u32, f32)]) -> Result<Self> {
        let weighted: Vec<(EdgeRecord, f32)> = edges
            .iter()
            .map(|&(source, target, weight)| (EdgeRecord::new(source, target), weight))
            .collect();

        Self::from_lists(
            num_points,
            EdgeList::group(Direction::Forward, num_points, &weighted),
            EdgeList::group(Direction::Backward, num_points, &weighted),
        )
    }

    /// Accept externally built orderings after checking every table invariant.
    pub fn from_lists(num_points: u32, forward: EdgeList, backward: EdgeList) -> Result<Self> {
        if num_points == 0 {
            return Err(EdgeForceError::InvalidTopology("No points".into()));
        }
        if forward.direction() != Direction::Forward || backward.direction() != Direction::Backward {
            return Err(EdgeForceError::InvalidTopology(
                "edge lists passed in the wrong order".into(),
            ));
        }
        if forward.len() != backward.len() {
            return Err(EdgeForceError::InvalidTopology(format!(
                "forward has {} edges, backward has {}",
                forward.len(),
                backward.len()
            )));
        }
        forward.validate(num_points)?;
        backward.validate(num_points)?;

        let population = |list: &EdgeList| {
            let mut edges: Vec<(u32, u32)> = list.edges().iter().map(|e| (e.source, e.target)).collect();
            edges.sort_unstable();
            edges
        };
        if population(&forward) != population(&backward) {
            return Err(EdgeForceError::InvalidTopology(
                "forward and backward lists hold different edges".into(),
            ));
        }

        Ok(Self {
            num_points,
            forward,
            backward,
        })
    }

    pub fn num_points(&self) -> u32 {
        self.num_points
    }

    pub fn num_edges(&self) -> u32 {
        self.forward.len() as u32
    }

    pub fn forward(&self) -> &EdgeList {
        &self.forward
    }

    pub fn backward(&self) -> &EdgeList {
        &self.backward
    }

    pub fn edges(&self, direction: Direction) -> &EdgeList {
        match direction {
            Direction::Forward => &self.forward,
            Direction::Backward => &self.backward,
        }
    }

    /// Total degree (in + out) per point.
    pub fn degrees(&self) -> Vec<u32> {
        let forward = self.forward.start_end().iter();
        let backward = self.backward.start_end().iter();
        forward.zip(backward).map(|(f, b)| f.len() + b.len()).collect()
    }
}

/// Device buffers for one pass's edge ordering.
pub struct PassInputs<'a, B: ComputeBackend> {
    pub edges: &'a B::Buffer,
    pub weights: &'a B::Buffer,
}

impl<B: ComputeBackend> Clone for PassInputs<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ComputeBackend> Copy for PassInputs<'_, B> {}

/// Everything a tick reads that the physics loop owns.
pub struct TickInputs<'a, B: ComputeBackend> {
    /// Current positions, one `Position` per point.
    pub points: &'a B::Buffer,
    /// One `u32` degree per point.
    pub point_degrees: &'a B::Buffer,
    pub forward: PassInputs<'a, B>,
    pub backward: PassInputs<'a, B>,
    /// Forces accumulated earlier in the tick; zero when `None`.
    pub prior_forces: Option<&'a B::Buffer>,
}

/// Device mirror of a [`Topology`] for callers without their own data layer.
pub struct GraphBuffers<B: ComputeBackend> {
    pub forward_edges: B::Buffer,
    pub forward_weights: B::Buffer,
    pub backward_edges: B::Buffer,
    pub backward_weights: B::Buffer,
    pub degrees: B::Buffer,
}

impl<B: ComputeBackend> GraphBuffers<B> {
    /// Upload edges, weights and degrees of `topology`.
    pub async fn upload(backend: &B, topology: &Topology) -> Result<Self> {
        let forward = topology.forward();
        let backward = topology.backward();

        Ok(Self {
            forward_edges: backend
                .create_buffer_init(BufferRole::ForwardEdges, bytemuck::cast_slice(forward.edges()))
                .await?,
            forward_weights: backend
                .create_buffer_init(BufferRole::ForwardWeights, bytemuck::cast_slice(forward.weights()))
                .await?,
            backward_edges: backend
                .create_buffer_init(BufferRole::BackwardEdges, bytemuck::cast_slice(backward.edges()))
                .await?,
            backward_weights: backend
                .create_buffer_init(BufferRole::BackwardWeights, bytemuck::cast_slice(backward.weights()))
                .await?,
            degrees: backend
                .create_buffer_init(BufferRole::PointDegrees, bytemuck::cast_slice(&topology.degrees()))
                .await?,
        })
    }

    /// Borrow these buffers as the inputs of one tick.
    pub fn tick_inputs<'a>(
        &'a self,
        points: &'a B::Buffer,
        prior_forces: Option<&'a B::Buffer>,
    ) -> TickInputs<'a, B> {
        TickInputs {
            points,
            point_degrees: &self.degrees,
            forward: PassInputs {
                edges: &self.forward_edges,
                weights: &self.forward_weights,
            },
            backward: PassInputs {
                edges: &self.backward_edges,
                weights: &self.backward_weights,
            },
            prior_forces,
        }
    }
}

//! Two-pass edge-force orchestration.

use std::mem::size_of;

use crate::backend::{padded_size, BufferRole, ComputeBackend, KernelStage, MapEdgesArgs, SegReduceArgs};
use crate::buffers::EdgeForceBuffers;
use crate::physics::PhysicsParams;
use crate::topology::{Direction, PassInputs, TickInputs, Topology};
use crate::work::WorkItemSizing;
use crate::{EdgeForceError, EdgeRecord, Force, Position, Result};

/// Configuration for the edge-force passes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EdgeForceConfig {
    /// Attraction parameters handed to the scoring function.
    pub physics: PhysicsParams,
    /// Launch sizes; the seg-reduce local size is the chunk length.
    pub sizing: WorkItemSizing,
}

/// Accumulates per-point edge forces, one forward and one backward pass per tick.
///
/// The final forces are double-buffered: a tick writes the back half and the
/// halves are swapped only once both passes succeeded. A failed tick leaves
/// [`read_forces`](Self::read_forces) returning the previous tick's result.
pub struct EdgeForces<B: ComputeBackend> {
    backend: B,
    config: EdgeForceConfig,
    buffers: Option<EdgeForceBuffers<B>>,
    tick: u64,
}

impl<B: ComputeBackend> EdgeForces<B> {
    pub fn new(backend: B, config: EdgeForceConfig) -> Self {
        Self {
            backend,
            config,
            buffers: None,
            tick: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EdgeForceConfig {
        &self.config
    }

    /// Replace the configuration. A new group size takes effect on the next tick.
    pub fn set_config(&mut self, config: EdgeForceConfig) {
        self.config = config;
    }

    /// Update the physics parameters for subsequent ticks.
    pub fn set_physics(&mut self, physics: PhysicsParams) {
        self.config.physics = physics;
    }

    /// Buffers of the bound topology, if any.
    pub fn buffers(&self) -> Option<&EdgeForceBuffers<B>> {
        self.buffers.as_ref()
    }

    /// Number of ticks published so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Bind to `topology`, reusing the current buffers when the sizes match.
    ///
    /// If this fails the orchestrator is left unbound.
    pub async fn prepare(&mut self, topology: &Topology) -> Result<()> {
        self.config.sizing.validate()?;
        let current = self.buffers.take();
        self.buffers =
            Some(EdgeForceBuffers::prepare(current, &self.backend, topology, self.config.sizing).await?);
        Ok(())
    }

    /// Alias of [`prepare`](Self::prepare), called whenever the graph changes.
    pub async fn set_edges(&mut self, topology: &Topology) -> Result<()> {
        self.prepare(topology).await
    }

    /// Drop the bound topology and every buffer it owns.
    pub fn release(&mut self) {
        if self.buffers.take().is_some() {
            tracing::info!("Released edge-force buffers");
        }
    }

    /// Run one tick with the configured sizing.
    pub async fn exec_kernels(&mut self, inputs: &TickInputs<'_, B>) -> Result<u64> {
        let sizing = self.config.sizing;
        self.compute_forces(inputs, sizing).await
    }

    /// Run the forward then the backward pass and publish the result.
    ///
    /// Returns the number of the published tick.
    pub async fn compute_forces(
        &mut self,
        inputs: &TickInputs<'_, B>,
        sizing: WorkItemSizing,
    ) -> Result<u64> {
        sizing.validate()?;
        let buffers = self.buffers.as_mut().ok_or(EdgeForceError::NotPrepared)?;
        validate_inputs(&self.backend, buffers, inputs)?;

        if buffers.needs_regroup(sizing.group_size()) {
            if sizing.group_size() != self.config.sizing.group_size() {
                tracing::warn!(
                    configured = self.config.sizing.group_size(),
                    group_size = sizing.group_size(),
                    "Regrouping to a sizing other than the configured one"
                );
            }
            buffers.regroup(&self.backend, sizing.group_size()).await?;
        }

        let pass = Pass {
            backend: &self.backend,
            inputs,
            physics: self.config.physics,
            sizing,
        };
        let in_flight = self.tick + 1;

        let prior = inputs.prior_forces.unwrap_or(&buffers.zero_forces);
        pass.run(&*buffers, Direction::Forward, prior, &buffers.partial_forces)
            .await?;
        buffers.record_write(BufferRole::PartialForces, in_flight);

        pass.run(&*buffers, Direction::Backward, &buffers.partial_forces, buffers.back_forces())
            .await?;
        buffers.swap();
        buffers.record_write(BufferRole::CurForces, in_flight);

        self.tick = in_flight;
        tracing::debug!(tick = self.tick, points = buffers.num_points(), "Published edge forces");
        Ok(self.tick)
    }

    /// Final forces of the last published tick, one per point.
    pub async fn read_forces(&self) -> Result<Vec<Force>> {
        let buffers = self.buffers.as_ref().ok_or(EdgeForceError::NotPrepared)?;
        self.read_points(buffers, buffers.front_forces()).await
    }

    /// Forward-pass result (buffer A) of the last tick that got that far.
    pub async fn read_partial_forces(&self) -> Result<Vec<Force>> {
        let buffers = self.buffers.as_ref().ok_or(EdgeForceError::NotPrepared)?;
        self.read_points(buffers, &buffers.partial_forces).await
    }

    async fn read_points(&self, buffers: &EdgeForceBuffers<B>, buffer: &B::Buffer) -> Result<Vec<Force>> {
        let bytes = self.backend.read_buffer(buffer).await?;
        let len = buffers.num_points() as usize * size_of::<Force>();
        if bytes.len() < len {
            return Err(EdgeForceError::Readback(format!(
                "read {} bytes, expected {len}",
                bytes.len()
            )));
        }
        Ok(bytes[..len]
            .chunks_exact(size_of::<Force>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

/// One map + reduce traversal over one edge ordering.
struct Pass<'a, B: ComputeBackend> {
    backend: &'a B,
    inputs: &'a TickInputs<'a, B>,
    physics: PhysicsParams,
    sizing: WorkItemSizing,
}

impl<B: ComputeBackend> Pass<'_, B> {
    async fn run(
        &self,
        buffers: &EdgeForceBuffers<B>,
        direction: Direction,
        incoming: &B::Buffer,
        output: &B::Buffer,
    ) -> Result<()> {
        let edges = pass_inputs(self.inputs, direction);

        let map = MapEdgesArgs::<B> {
            params: self.physics,
            direction,
            num_edges: buffers.num_edges(),
            num_points: buffers.num_points(),
            edges: edges.edges,
            point_degrees: self.inputs.point_degrees,
            points: self.inputs.points,
            edge_weights: edges.weights,
            output: &buffers.edge_forces_map,
        };
        self.backend
            .map_edges(&map, self.sizing.edge_map)
            .await
            .inspect_err(|e| log_failure(KernelStage::MapEdges, direction, e))?;

        let reduce = SegReduceArgs::<B> {
            direction,
            num_input: buffers.num_edges(),
            num_output: buffers.num_points(),
            num_work_items: buffers.plan(direction).len() as u32,
            input: &buffers.edge_forces_map,
            edges: edges.edges,
            start_end: buffers.start_end(direction),
            seg_start: &buffers.seg_start,
            work_list: buffers.work_list(direction),
            carry_out: &buffers.carry_out,
            partial_forces: incoming,
            output,
        };
        self.backend
            .seg_reduce(&reduce, self.sizing.seg_reduce)
            .await
            .inspect_err(|e| log_failure(KernelStage::SegReduce, direction, e))
    }
}

fn pass_inputs<'a, B: ComputeBackend>(inputs: &TickInputs<'a, B>, direction: Direction) -> PassInputs<'a, B> {
    match direction {
        Direction::Forward => inputs.forward,
        Direction::Backward => inputs.backward,
    }
}

fn log_failure(stage: KernelStage, direction: Direction, error: &EdgeForceError) {
    tracing::error!(%stage, %direction, "Edge-force pass failed: {}", error);
}

/// Check the caller's buffers against the bound topology before anything runs.
fn validate_inputs<B: ComputeBackend>(
    backend: &B,
    buffers: &EdgeForceBuffers<B>,
    inputs: &TickInputs<'_, B>,
) -> Result<()> {
    let points = buffers.num_points() as u64;
    let edges = buffers.num_edges() as u64;
    let force_bytes = points * size_of::<Force>() as u64;

    let mut checks = vec![
        ("points", inputs.points, points * size_of::<Position>() as u64),
        ("point degrees", inputs.point_degrees, points * size_of::<u32>() as u64),
        ("forward edges", inputs.forward.edges, edges * size_of::<EdgeRecord>() as u64),
        ("forward weights", inputs.forward.weights, edges * size_of::<f32>() as u64),
        ("backward edges", inputs.backward.edges, edges * size_of::<EdgeRecord>() as u64),
        ("backward weights", inputs.backward.weights, edges * size_of::<f32>() as u64),
    ];
    if let Some(prior) = inputs.prior_forces {
        checks.push(("prior forces", prior, force_bytes));
    }

    // Buffers from this topology are either exact or padded; anything else is stale.
    for (what, buffer, expected) in checks {
        let actual = backend.buffer_size(buffer);
        if actual != expected && actual != padded_size(expected) {
            return Err(EdgeForceError::mismatch(what, expected, actual));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::physics::WeightScoring;
    use crate::topology::GraphBuffers;

    #[test]
    fn test_config_default() {
        let config = EdgeForceConfig::default();
        assert_eq!(config.sizing.group_size(), 256);
        assert_eq!(config.physics, PhysicsParams::default());
    }

    #[test]
    fn test_read_before_prepare() {
        pollster::block_on(async {
            let forces = EdgeForces::new(CpuBackend::new(WeightScoring), EdgeForceConfig::default());
            assert!(matches!(forces.read_forces().await, Err(EdgeForceError::NotPrepared)));
        });
    }

    #[test]
    fn test_release_frees_device_memory() {
        pollster::block_on(async {
            let mut forces = EdgeForces::new(CpuBackend::new(WeightScoring), EdgeForceConfig::default());
            let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 1.0)]).unwrap();
            forces.prepare(&topology).await.unwrap();
            assert!(forces.backend().allocated_bytes() > 0);

            forces.release();
            assert_eq!(forces.backend().allocated_bytes(), 0);
            assert!(forces.buffers().is_none());
        });
    }

    #[test]
    fn test_group_size_change_between_ticks() {
        pollster::block_on(async {
            let backend = CpuBackend::new(WeightScoring);
            let topology =
                Topology::from_edges(3, &[(0, 1, 1.0), (0, 2, 2.0), (0, 1, 3.0), (1, 2, 4.0)]).unwrap();
            let graph = GraphBuffers::upload(&backend, &topology).await.unwrap();
            let points = backend.create_buffer(BufferRole::Points, 3 * 8).await.unwrap();

            let mut forces = EdgeForces::new(backend, EdgeForceConfig::default());
            forces.prepare(&topology).await.unwrap();
            let inputs = graph.tick_inputs(&points, None);

            forces.exec_kernels(&inputs).await.unwrap();
            let wide = forces.read_forces().await.unwrap();

            forces
                .compute_forces(&inputs, WorkItemSizing::with_group_size(1))
                .await
                .unwrap();
            assert_eq!(forces.buffers().map(|b| b.group_size()), Some(1));
            assert_eq!(forces.read_forces().await.unwrap(), wide);
            assert_eq!(forces.tick(), 2);
        });
    }
}

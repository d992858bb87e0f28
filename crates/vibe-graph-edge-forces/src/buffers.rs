//! Topology-scoped device buffers of the edge-force passes.

use std::mem::size_of;

use crate::backend::{BufferRole, ComputeBackend};
use crate::topology::{Direction, Topology};
use crate::work::{WorkItemSizing, WorkPlan};
use crate::{CarryOut, Force, Result, StartEnd, WorkItem};

/// Stitch worklist of one direction: the host plan and its device copy.
struct WorkList<B: ComputeBackend> {
    plan: WorkPlan,
    buffer: B::Buffer,
}

/// Device buffers owned by one bound topology.
///
/// Created by [`prepare`](Self::prepare) and released by dropping it. Tables
/// are only written here, so they stay read-only for the duration of a tick.
pub struct EdgeForceBuffers<B: ComputeBackend> {
    topology: Topology,
    group_size: u32,
    pub(crate) edge_forces_map: B::Buffer,
    pub(crate) carry_out: B::Buffer,
    pub(crate) seg_start: B::Buffer,
    forward_start_end: B::Buffer,
    backward_start_end: B::Buffer,
    forward_work: WorkList<B>,
    backward_work: WorkList<B>,
    /// False while the device work lists may not match the host plans.
    lists_current: bool,
    /// Buffer A: result of the forward pass.
    pub(crate) partial_forces: B::Buffer,
    /// Buffer B: published (front) and in-flight (back) final forces.
    cur_forces: [B::Buffer; 2],
    front: usize,
    pub(crate) zero_forces: B::Buffer,
    /// Tick that last completed a write of buffer A.
    partial_written: Option<u64>,
    /// Tick that last published into buffer B.
    forces_written: Option<u64>,
}

fn force_bytes(num_points: u32) -> u64 {
    num_points as u64 * size_of::<Force>() as u64
}

fn carry_bytes(num_edges: u32, group_size: u32) -> u64 {
    WorkPlan::carry_entries(num_edges, group_size) as u64 * size_of::<CarryOut>() as u64
}

fn work_list_bytes(plan: &WorkPlan) -> u64 {
    plan.len().max(1) as u64 * size_of::<WorkItem>() as u64
}

impl<B: ComputeBackend> EdgeForceBuffers<B> {
    /// Bind `topology`, reusing `current` where the sizes allow.
    ///
    /// With unchanged point count, edge count and group size no buffer is
    /// allocated and only the tables are rewritten. A new group size
    /// reallocates the carry-out table and work lists. Anything else drops
    /// `current` and starts over.
    pub async fn prepare(
        current: Option<Self>,
        backend: &B,
        topology: &Topology,
        sizing: WorkItemSizing,
    ) -> Result<Self> {
        sizing.validate()?;
        let group_size = sizing.group_size();

        match current {
            Some(mut buffers)
                if buffers.topology.num_points() == topology.num_points()
                    && buffers.topology.num_edges() == topology.num_edges() =>
            {
                buffers.topology = topology.clone();
                buffers.write_tables(backend).await?;
                buffers.regroup(backend, group_size).await?;
                tracing::info!(
                    points = topology.num_points(),
                    edges = topology.num_edges(),
                    group_size,
                    "Reused edge-force buffers"
                );
                Ok(buffers)
            }
            current => {
                // Release the old context before allocating the new one.
                drop(current);
                Self::allocate(backend, topology, group_size).await
            }
        }
    }

    async fn allocate(backend: &B, topology: &Topology, group_size: u32) -> Result<Self> {
        let num_points = topology.num_points();
        let num_edges = topology.num_edges();
        let forward_plan = WorkPlan::build(topology.forward(), group_size);
        let backward_plan = WorkPlan::build(topology.backward(), group_size);

        let buffers = Self {
            edge_forces_map: backend
                .create_buffer(BufferRole::EdgeForcesMap, num_edges as u64 * size_of::<Force>() as u64)
                .await?,
            carry_out: backend
                .create_buffer(BufferRole::CarryOut, carry_bytes(num_edges, group_size))
                .await?,
            seg_start: backend
                .create_buffer(BufferRole::SegStart, num_points as u64 * size_of::<u32>() as u64)
                .await?,
            forward_start_end: backend
                .create_buffer(
                    BufferRole::ForwardStartEnd,
                    num_points as u64 * size_of::<StartEnd>() as u64,
                )
                .await?,
            backward_start_end: backend
                .create_buffer(
                    BufferRole::BackwardStartEnd,
                    num_points as u64 * size_of::<StartEnd>() as u64,
                )
                .await?,
            forward_work: WorkList {
                buffer: backend
                    .create_buffer(BufferRole::ForwardWorkList, work_list_bytes(&forward_plan))
                    .await?,
                plan: forward_plan,
            },
            backward_work: WorkList {
                buffer: backend
                    .create_buffer(BufferRole::BackwardWorkList, work_list_bytes(&backward_plan))
                    .await?,
                plan: backward_plan,
            },
            lists_current: true,
            partial_forces: backend
                .create_buffer(BufferRole::PartialForces, force_bytes(num_points))
                .await?,
            cur_forces: [
                backend
                    .create_buffer(BufferRole::CurForces, force_bytes(num_points))
                    .await?,
                backend
                    .create_buffer(BufferRole::CurForces, force_bytes(num_points))
                    .await?,
            ],
            front: 0,
            zero_forces: backend
                .create_buffer(BufferRole::ZeroForces, force_bytes(num_points))
                .await?,
            partial_written: None,
            forces_written: None,
            topology: topology.clone(),
            group_size,
        };

        buffers.write_tables(backend).await?;
        buffers.write_work_lists(backend).await?;

        tracing::info!(
            backend = backend.name(),
            points = num_points,
            edges = num_edges,
            group_size,
            forward_stitches = buffers.forward_work.plan.len(),
            backward_stitches = buffers.backward_work.plan.len(),
            "Allocated edge-force buffers"
        );
        Ok(buffers)
    }

    /// Whether the carry table and work lists must be rebuilt before a
    /// tick at `group_size`.
    pub(crate) fn needs_regroup(&self, group_size: u32) -> bool {
        !self.lists_current || self.group_size != group_size
    }

    /// Rebuild the work lists for `group_size`.
    ///
    /// The carry-out table is only reallocated when the group size changed.
    /// Work lists are reallocated when they no longer fit. Every allocation
    /// happens before anything is replaced, so a failed allocation leaves the
    /// context as it was.
    pub(crate) async fn regroup(&mut self, backend: &B, group_size: u32) -> Result<()> {
        let forward = WorkPlan::build(self.topology.forward(), group_size);
        let backward = WorkPlan::build(self.topology.backward(), group_size);

        let carry_out = if group_size != self.group_size {
            let bytes = carry_bytes(self.topology.num_edges(), group_size);
            Some(backend.create_buffer(BufferRole::CarryOut, bytes).await?)
        } else {
            None
        };
        let forward_buffer = self.grow_work_list(backend, Direction::Forward, &forward).await?;
        let backward_buffer = self.grow_work_list(backend, Direction::Backward, &backward).await?;

        if let Some(carry_out) = carry_out {
            tracing::debug!(from = self.group_size, to = group_size, "Regrouped carry-out table");
            self.carry_out = carry_out;
        }
        if let Some(buffer) = forward_buffer {
            self.forward_work.buffer = buffer;
        }
        if let Some(buffer) = backward_buffer {
            self.backward_work.buffer = buffer;
        }
        self.forward_work.plan = forward;
        self.backward_work.plan = backward;
        self.group_size = group_size;

        // Device lists disagree with the plans until the writes land.
        self.lists_current = false;
        self.write_work_lists(backend).await?;
        self.lists_current = true;
        Ok(())
    }

    /// A new work-list buffer for `direction` if the current one is too small.
    async fn grow_work_list(
        &self,
        backend: &B,
        direction: Direction,
        plan: &WorkPlan,
    ) -> Result<Option<B::Buffer>> {
        let current = match direction {
            Direction::Forward => &self.forward_work.buffer,
            Direction::Backward => &self.backward_work.buffer,
        };
        let needed = work_list_bytes(plan);
        if backend.buffer_size(current) >= needed {
            return Ok(None);
        }
        Ok(Some(backend.create_buffer(BufferRole::work_list(direction), needed).await?))
    }

    async fn write_tables(&self, backend: &B) -> Result<()> {
        backend
            .write_buffer(
                &self.forward_start_end,
                bytemuck::cast_slice(self.topology.forward().start_end()),
            )
            .await?;
        backend
            .write_buffer(
                &self.backward_start_end,
                bytemuck::cast_slice(self.topology.backward().start_end()),
            )
            .await
    }

    async fn write_work_lists(&self, backend: &B) -> Result<()> {
        for list in [&self.forward_work, &self.backward_work] {
            if !list.plan.is_empty() {
                backend
                    .write_buffer(&list.buffer, bytemuck::cast_slice(list.plan.items()))
                    .await?;
            }
        }
        Ok(())
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn num_points(&self) -> u32 {
        self.topology.num_points()
    }

    pub fn num_edges(&self) -> u32 {
        self.topology.num_edges()
    }

    /// Chunk length the carry-out table and work lists were built for.
    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn plan(&self, direction: Direction) -> &WorkPlan {
        match direction {
            Direction::Forward => &self.forward_work.plan,
            Direction::Backward => &self.backward_work.plan,
        }
    }

    pub(crate) fn start_end(&self, direction: Direction) -> &B::Buffer {
        match direction {
            Direction::Forward => &self.forward_start_end,
            Direction::Backward => &self.backward_start_end,
        }
    }

    pub(crate) fn work_list(&self, direction: Direction) -> &B::Buffer {
        match direction {
            Direction::Forward => &self.forward_work.buffer,
            Direction::Backward => &self.backward_work.buffer,
        }
    }

    /// Published final forces.
    pub(crate) fn front_forces(&self) -> &B::Buffer {
        &self.cur_forces[self.front]
    }

    /// Final forces of the tick in flight.
    pub(crate) fn back_forces(&self) -> &B::Buffer {
        &self.cur_forces[1 - self.front]
    }

    /// Publish the back half. Only called once a whole tick succeeded.
    pub(crate) fn swap(&mut self) {
        self.front = 1 - self.front;
    }

    /// Tick that last rewrote the buffer with `role`.
    ///
    /// Tracked for the per-tick force buffers: `PartialForces` once a forward
    /// pass completes and `CurForces` once a tick is published. `None` for
    /// every other role and before the first write.
    pub fn last_written(&self, role: BufferRole) -> Option<u64> {
        match role {
            BufferRole::PartialForces => self.partial_written,
            BufferRole::CurForces => self.forces_written,
            _ => None,
        }
    }

    pub(crate) fn record_write(&mut self, role: BufferRole, tick: u64) {
        match role {
            BufferRole::PartialForces => self.partial_written = Some(tick),
            BufferRole::CurForces => self.forces_written = Some(tick),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;
    use crate::physics::WeightScoring;

    fn path() -> Topology {
        Topology::from_edges(4, &[(0, 1, 1.0), (1, 2, 1.0), (2, 3, 1.0), (0, 3, 1.0)]).unwrap()
    }

    #[test]
    fn test_allocation_sizes() {
        pollster::block_on(async {
            let backend = CpuBackend::new(WeightScoring);
            let buffers = EdgeForceBuffers::prepare(None, &backend, &path(), WorkItemSizing::with_group_size(2))
                .await
                .unwrap();

            assert_eq!(backend.buffer_size(&buffers.edge_forces_map), 32);
            // 1 + ceil(4 / 2) entries of 16 bytes.
            assert_eq!(backend.buffer_size(&buffers.carry_out), 48);
            assert_eq!(backend.buffer_size(&buffers.seg_start), 16);
            assert_eq!(backend.buffer_size(buffers.start_end(Direction::Forward)), 32);
            assert_eq!(backend.buffer_size(&buffers.partial_forces), 32);
            assert_eq!(backend.buffer_size(buffers.front_forces()), 32);
            assert_eq!(backend.allocation_count(), 11);
        });
    }

    #[test]
    fn test_empty_graph_gets_minimum_buffers() {
        pollster::block_on(async {
            let backend = CpuBackend::new(WeightScoring);
            let topology = Topology::from_edges(1, &[]).unwrap();
            let buffers = EdgeForceBuffers::prepare(None, &backend, &topology, WorkItemSizing::default())
                .await
                .unwrap();
            assert_eq!(backend.buffer_size(&buffers.edge_forces_map), 16);
            assert_eq!(backend.buffer_size(buffers.work_list(Direction::Backward)), 16);
        });
    }

    #[test]
    fn test_regroup_only_touches_carry_and_work_lists() {
        pollster::block_on(async {
            let backend = CpuBackend::new(WeightScoring);
            let topology = path();
            let buffers = EdgeForceBuffers::prepare(None, &backend, &topology, WorkItemSizing::default())
                .await
                .unwrap();
            let before = backend.allocation_count();

            let buffers =
                EdgeForceBuffers::prepare(Some(buffers), &backend, &topology, WorkItemSizing::with_group_size(1))
                    .await
                    .unwrap();
            // New carry table; the work lists still fit (one item each at most).
            assert_eq!(backend.allocation_count(), before + 1);
            assert_eq!(buffers.group_size(), 1);
            assert_eq!(backend.buffer_size(&buffers.carry_out), 5 * 16);
        });
    }

    #[test]
    fn test_swap_alternates_front() {
        pollster::block_on(async {
            let backend = CpuBackend::new(WeightScoring);
            let mut buffers = EdgeForceBuffers::prepare(None, &backend, &path(), WorkItemSizing::default())
                .await
                .unwrap();
            backend
                .write_buffer(buffers.back_forces(), bytemuck::cast_slice(&[Force::new(1.0, 2.0)]))
                .await
                .unwrap();
            buffers.swap();
            let bytes = backend.read_buffer(buffers.front_forces()).await.unwrap();
            let first: Force = bytemuck::pod_read_unaligned(&bytes[..8]);
            assert_eq!(first, Force::new(1.0, 2.0));
        });
    }
}

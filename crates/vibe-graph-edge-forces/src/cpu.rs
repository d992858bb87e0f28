//! Host emulation of the edge-force kernels.
//!
//! Runs the map and segmented-reduce kernels on the CPU with exactly the
//! chunking the GPU uses: chunks of `local` edges, the same carry-out table
//! and the same stitch worklist. Used by the tests and as a fallback when no
//! adapter is available.

use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytemuck::Pod;

use crate::backend::{padded_size, BufferRole, ComputeBackend, KernelStage, MapEdgesArgs, SegReduceArgs};
use crate::physics::{AttractionScoring, EdgeSample, EdgeScoring};
use crate::work::{KernelWorkSize, WorkPlan};
use crate::{CarryOut, EdgeForceError, EdgeRecord, Force, Position, Result, StartEnd, WorkItem};

struct CpuAllocation {
    role: BufferRole,
    size: u64,
    words: RwLock<Vec<u32>>,
    ledger: Arc<AtomicU64>,
}

impl Drop for CpuAllocation {
    fn drop(&mut self) {
        self.ledger.fetch_sub(self.size, Ordering::Relaxed);
    }
}

/// Host-memory buffer handed out by [`CpuBackend`].
#[derive(Clone)]
pub struct CpuBuffer {
    inner: Arc<CpuAllocation>,
}

impl CpuBuffer {
    pub fn role(&self) -> BufferRole {
        self.inner.role
    }

    fn load<T: Pod>(&self, count: usize) -> Vec<T> {
        let words = self.inner.words.read().unwrap_or_else(PoisonError::into_inner);
        let len = count * size_of::<T>() / size_of::<u32>();
        bytemuck::cast_slice::<u32, T>(&words[..len]).to_vec()
    }

    fn store<T: Pod>(&self, values: &[T]) {
        let mut words = self.inner.words.write().unwrap_or_else(PoisonError::into_inner);
        let src: &[u32] = bytemuck::cast_slice(values);
        words[..src.len()].copy_from_slice(src);
    }
}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("role", &self.inner.role)
            .field("size", &self.inner.size)
            .finish()
    }
}

/// CPU implementation of [`ComputeBackend`].
pub struct CpuBackend<S = AttractionScoring> {
    scoring: S,
    memory_limit: Option<u64>,
    allocated: Arc<AtomicU64>,
    allocations: AtomicUsize,
    /// Stage to fail and how many of its launches to let through first.
    fault: Mutex<Option<(KernelStage, usize)>>,
}

impl Default for CpuBackend<AttractionScoring> {
    fn default() -> Self {
        Self::new(AttractionScoring)
    }
}

impl<S: EdgeScoring> CpuBackend<S> {
    pub fn new(scoring: S) -> Self {
        Self {
            scoring,
            memory_limit: None,
            allocated: Arc::new(AtomicU64::new(0)),
            allocations: AtomicUsize::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Refuse allocations once `bytes` are live, like a device running out of memory.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Bytes held by live buffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers created since construction.
    pub fn allocation_count(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Make the next launch of `stage` fail after it has started writing its
    /// output, the way a device fault surfaces mid-kernel.
    pub fn inject_fault(&self, stage: KernelStage) {
        self.inject_fault_at(stage, 0);
    }

    /// Like [`inject_fault`](Self::inject_fault), but let `skip` launches of
    /// `stage` succeed first.
    pub fn inject_fault_at(&self, stage: KernelStage, skip: usize) {
        *self.fault.lock().unwrap_or_else(PoisonError::into_inner) = Some((stage, skip));
    }

    fn take_fault(&self, stage: KernelStage) -> bool {
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        match fault.as_mut() {
            Some((armed, skip)) if *armed == stage => {
                if *skip == 0 {
                    *fault = None;
                    true
                } else {
                    *skip -= 1;
                    false
                }
            }
            _ => false,
        }
    }
}

fn point_at<T: Copy>(values: &[T], point: u32, stage: KernelStage) -> Result<T> {
    values.get(point as usize).copied().ok_or_else(|| {
        EdgeForceError::kernel(stage, format!("point {point} outside 0..{}", values.len()))
    })
}

impl<S: EdgeScoring> ComputeBackend for CpuBackend<S> {
    type Buffer = CpuBuffer;

    fn name(&self) -> &str {
        "cpu"
    }

    async fn create_buffer(&self, role: BufferRole, size: u64) -> Result<CpuBuffer> {
        let size = padded_size(size);
        let in_use = self.allocated.load(Ordering::Relaxed);
        if let Some(limit) = self.memory_limit {
            if in_use + size > limit {
                return Err(EdgeForceError::ResourceAllocation {
                    role,
                    bytes: size,
                    reason: format!("memory budget of {limit} bytes exhausted ({in_use} in use)"),
                });
            }
        }

        self.allocated.fetch_add(size, Ordering::Relaxed);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(CpuBuffer {
            inner: Arc::new(CpuAllocation {
                role,
                size,
                words: RwLock::new(vec![0; (size / 4) as usize]),
                ledger: Arc::clone(&self.allocated),
            }),
        })
    }

    fn buffer_size(&self, buffer: &CpuBuffer) -> u64 {
        buffer.inner.size
    }

    async fn write_buffer(&self, buffer: &CpuBuffer, contents: &[u8]) -> Result<()> {
        let size = buffer.inner.size;
        if contents.len() as u64 > size {
            return Err(EdgeForceError::mismatch(
                format!("write into {}", buffer.role()),
                contents.len() as u64,
                size,
            ));
        }
        let mut words = buffer.inner.words.write().unwrap_or_else(PoisonError::into_inner);
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..contents.len()].copy_from_slice(contents);
        Ok(())
    }

    async fn read_buffer(&self, buffer: &CpuBuffer) -> Result<Vec<u8>> {
        let words = buffer.inner.words.read().unwrap_or_else(PoisonError::into_inner);
        Ok(bytemuck::cast_slice::<u32, u8>(&words).to_vec())
    }

    async fn copy_buffer(&self, source: &CpuBuffer, destination: &CpuBuffer) -> Result<()> {
        if source.inner.size > destination.inner.size {
            return Err(EdgeForceError::mismatch(
                format!("copy into {}", destination.role()),
                source.inner.size,
                destination.inner.size,
            ));
        }
        let words = source.load::<u32>((source.inner.size / 4) as usize);
        destination.store(&words);
        Ok(())
    }

    async fn map_edges(&self, args: &MapEdgesArgs<'_, Self>, work: KernelWorkSize) -> Result<()> {
        let stage = KernelStage::MapEdges;
        work.validate(stage)?;
        args.validate(self)?;
        tracing::trace!(
            backend = "cpu",
            %stage,
            direction = %args.direction,
            edges = args.num_edges,
            "launch"
        );

        let num_edges = args.num_edges as usize;
        let num_points = args.num_points as usize;
        let edges: Vec<EdgeRecord> = args.edges.load(num_edges);
        let weights: Vec<f32> = args.edge_weights.load(num_edges);
        let degrees: Vec<u32> = args.point_degrees.load(num_points);
        let points: Vec<Position> = args.points.load(num_points);

        if self.take_fault(stage) {
            args.output.store(&vec![Force::new(f32::NAN, f32::NAN); num_edges]);
            return Err(EdgeForceError::kernel(stage, "injected device fault"));
        }

        let mut output = Vec::with_capacity(num_edges);
        for (edge, &weight) in edges.iter().zip(&weights) {
            let point = edge.grouping_point(args.direction);
            let other = edge.other_point(args.direction);
            let sample = EdgeSample {
                weight,
                point_degree: point_at(&degrees, point, stage)?,
                other_degree: point_at(&degrees, other, stage)?,
                point: point_at(&points, point, stage)?,
                other: point_at(&points, other, stage)?,
                is_forward: args.direction.is_forward(),
            };
            output.push(self.scoring.score(&sample, &args.params));
        }
        args.output.store(&output);
        Ok(())
    }

    async fn seg_reduce(&self, args: &SegReduceArgs<'_, Self>, work: KernelWorkSize) -> Result<()> {
        let stage = KernelStage::SegReduce;
        work.validate(stage)?;
        args.validate(self, work)?;
        tracing::trace!(
            backend = "cpu",
            %stage,
            direction = %args.direction,
            edges = args.num_input,
            points = args.num_output,
            stitches = args.num_work_items,
            "launch"
        );

        let num_edges = args.num_input as usize;
        let num_points = args.num_output as usize;
        let group_size = work.local as usize;
        let num_groups = WorkPlan::num_groups(args.num_input, work.local) as usize;

        let input: Vec<Force> = args.input.load(num_edges);
        let edges: Vec<EdgeRecord> = args.edges.load(num_edges);
        let start_end: Vec<StartEnd> = args.start_end.load(num_points);
        let work_items: Vec<WorkItem> = args.work_list.load(args.num_work_items as usize);
        let partial: Vec<Force> = args.partial_forces.load(num_points);
        let mut seg_start: Vec<u32> = args.seg_start.load(num_points);
        let mut carry = vec![CarryOut::default(); num_groups + 1];

        if self.take_fault(stage) {
            args.output.store(&vec![Force::new(f32::NAN, f32::NAN); num_points]);
            return Err(EdgeForceError::kernel(stage, "injected device fault"));
        }

        // Points without edges keep their incoming value.
        let mut output = partial.clone();

        // Group phase: each chunk runs a segmented scan of its own edges.
        for group in 0..num_groups {
            let lo = group * group_size;
            let hi = (lo + group_size).min(num_edges);
            let mut running = Force::ZERO;

            for edge in lo..hi {
                let point = edges[edge].grouping_point(args.direction);
                let segment = point_at(&start_end, point, stage)?;
                let (start, end) = (segment.start as usize, segment.end as usize);
                if edge < start || edge >= end {
                    return Err(EdgeForceError::kernel(
                        stage,
                        format!("edge {edge} outside segment {start}..{end} of point {point}"),
                    ));
                }

                if edge == lo || edge == start {
                    running = Force::ZERO;
                }
                if edge == start {
                    seg_start[point as usize] = group as u32;
                }
                running += input[edge];

                let closes = edge + 1 == end;
                if !closes && edge + 1 != hi {
                    continue;
                }

                let first_group = start / group_size;
                let last_group = (end - 1) / group_size;
                if first_group == last_group {
                    output[point as usize] = partial[point as usize] + running;
                } else if closes {
                    carry[group].head = running;
                } else {
                    carry[group].tail = running;
                }
            }
        }

        // Stitch phase: add carried partials of boundary-crossing segments in group order.
        for item in &work_items {
            let first_group = point_at(&seg_start, item.point, stage)? as usize;
            let last_group = item.last_group as usize;
            if first_group >= last_group || last_group >= carry.len() {
                return Err(EdgeForceError::kernel(
                    stage,
                    format!(
                        "work item for point {} spans groups {first_group}..={last_group} of {num_groups}",
                        item.point
                    ),
                ));
            }

            let mut total = carry[first_group].tail;
            for entry in &carry[first_group + 1..last_group] {
                total += entry.tail;
            }
            total += carry[last_group].head;

            let point = item.point as usize;
            output[point] = partial[point] + total;
        }

        args.seg_start.store(&seg_start);
        args.carry_out.store(&carry);
        args.output.store(&output);
        Ok(())
    }
}

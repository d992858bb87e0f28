//! wgpu implementation of the edge-force kernels.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{padded_size, BufferRole, ComputeBackend, KernelStage, MapEdgesArgs, SegReduceArgs};
use crate::physics::EdgeScoring;
use crate::shaders::{map_shader, seg_reduce_shader};
use crate::work::{KernelWorkSize, WorkPlan, MAX_WORKGROUPS};
use crate::{EdgeForceError, Result};

/// GPU context holding device and queue.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Create a new GPU context.
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| EdgeForceError::GpuInit("No suitable GPU adapter found".into()))?;

        tracing::info!("Using GPU adapter: {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Edge Forces Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| EdgeForceError::GpuInit(e.to_string()))?;

        Ok(Self { device, queue })
    }

    /// Wrap a device and queue owned by someone else (e.g. the renderer).
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }
}

/// Uniforms of the map kernel (matches `MapParams` in the shader).
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct MapParams {
    scaling_ratio: f32,
    gravity: f32,
    edge_influence: f32,
    flags: u32,
    is_forward: u32,
    num_edges: u32,
    num_points: u32,
    _pad: u32,
}

/// Uniforms of the reduce kernels (matches `ReduceParams` in the shader).
#[derive(Debug, Clone, Copy, Default, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
struct ReduceParams {
    num_input: u32,
    num_output: u32,
    num_work_items: u32,
    num_groups: u32,
    is_forward: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

struct ReducePipelines {
    groups: wgpu::ComputePipeline,
    stitch: wgpu::ComputePipeline,
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn bind_entries<'a>(buffers: &[&'a wgpu::Buffer]) -> Vec<wgpu::BindGroupEntry<'a>> {
    buffers
        .iter()
        .enumerate()
        .map(|(binding, buffer)| wgpu::BindGroupEntry {
            binding: binding as u32,
            resource: buffer.as_entire_binding(),
        })
        .collect()
}

/// Edge-force kernels on a wgpu device.
///
/// Shaders are specialized per workgroup size, so pipelines are compiled the
/// first time a local size is used and cached afterwards.
pub struct WgpuBackend {
    ctx: GpuContext,
    edge_force: &'static str,
    map_layout: wgpu::BindGroupLayout,
    map_pipeline_layout: wgpu::PipelineLayout,
    reduce_layout: wgpu::BindGroupLayout,
    reduce_pipeline_layout: wgpu::PipelineLayout,
    map_params: wgpu::Buffer,
    reduce_params: wgpu::Buffer,
    map_pipelines: Mutex<HashMap<u32, Arc<wgpu::ComputePipeline>>>,
    reduce_pipelines: Mutex<HashMap<u32, Arc<ReducePipelines>>>,
}

impl WgpuBackend {
    /// Create a backend on a fresh device.
    pub async fn new(scoring: &impl EdgeScoring) -> Result<Self> {
        let ctx = GpuContext::new().await?;
        Ok(Self::with_context(ctx, scoring))
    }

    /// Create a backend on an existing context.
    pub fn with_context(ctx: GpuContext, scoring: &impl EdgeScoring) -> Self {
        let map_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Map Edges Bind Group Layout"),
                entries: &[
                    uniform_entry(0),
                    // edges, point degrees, points, weights
                    storage_entry(1, true),
                    storage_entry(2, true),
                    storage_entry(3, true),
                    storage_entry(4, true),
                    // edge forces map
                    storage_entry(5, false),
                ],
            });

        let reduce_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("Seg Reduce Bind Group Layout"),
                entries: &[
                    uniform_entry(0),
                    storage_entry(1, true),  // input
                    storage_entry(2, true),  // edges
                    storage_entry(3, true),  // start/end
                    storage_entry(4, false), // seg start
                    storage_entry(5, true),  // work list
                    storage_entry(6, false), // carry out
                    storage_entry(7, true),  // partial forces
                    storage_entry(8, false), // output forces
                ],
            });

        let map_pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Map Edges Pipeline Layout"),
                bind_group_layouts: &[&map_layout],
                push_constant_ranges: &[],
            });

        let reduce_pipeline_layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Seg Reduce Pipeline Layout"),
                bind_group_layouts: &[&reduce_layout],
                push_constant_ranges: &[],
            });

        let map_params = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Map Params Buffer"),
            size: std::mem::size_of::<MapParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let reduce_params = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Reduce Params Buffer"),
            size: std::mem::size_of::<ReduceParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            ctx,
            edge_force: scoring.wgsl(),
            map_layout,
            map_pipeline_layout,
            reduce_layout,
            reduce_pipeline_layout,
            map_params,
            reduce_params,
            map_pipelines: Mutex::new(HashMap::new()),
            reduce_pipelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &GpuContext {
        &self.ctx
    }

    fn compile(&self, label: &str, source: String) -> wgpu::ShaderModule {
        self.ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(Cow::Owned(source)),
            })
    }

    fn pipeline(
        &self,
        label: &str,
        layout: &wgpu::PipelineLayout,
        module: &wgpu::ShaderModule,
        entry_point: &str,
    ) -> wgpu::ComputePipeline {
        self.ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: Default::default(),
                cache: None,
            })
    }

    async fn map_pipeline(&self, local: u32) -> Result<Arc<wgpu::ComputePipeline>> {
        if let Some(pipeline) = self
            .map_pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&local)
        {
            return Ok(Arc::clone(pipeline));
        }

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.compile("Map Edges Shader", map_shader(self.edge_force, local));
        let pipeline = self.pipeline("Map Edges Pipeline", &self.map_pipeline_layout, &module, "map_edges");
        if let Some(error) = self.ctx.device.pop_error_scope().await {
            return Err(EdgeForceError::kernel(KernelStage::MapEdges, error.to_string()));
        }

        tracing::debug!(workgroup_size = local, "compiled map_edges pipeline");
        let pipeline = Arc::new(pipeline);
        self.map_pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    async fn reduce_pipelines(&self, local: u32) -> Result<Arc<ReducePipelines>> {
        if let Some(pipelines) = self
            .reduce_pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&local)
        {
            return Ok(Arc::clone(pipelines));
        }

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.compile("Seg Reduce Shader", seg_reduce_shader(local));
        let layout = &self.reduce_pipeline_layout;
        let pipelines = ReducePipelines {
            groups: self.pipeline("Seg Reduce Groups Pipeline", layout, &module, "reduce_groups"),
            stitch: self.pipeline("Seg Reduce Stitch Pipeline", layout, &module, "stitch_segments"),
        };
        if let Some(error) = self.ctx.device.pop_error_scope().await {
            return Err(EdgeForceError::kernel(KernelStage::SegReduce, error.to_string()));
        }

        tracing::debug!(workgroup_size = local, "compiled seg_reduce pipelines");
        let pipelines = Arc::new(pipelines);
        self.reduce_pipelines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local, Arc::clone(&pipelines));
        Ok(pipelines)
    }

    /// Submit `encoder` and block until the device is idle.
    async fn submit(&self, stage: KernelStage, encoder: wgpu::CommandEncoder) -> Result<()> {
        self.ctx.queue.submit(Some(encoder.finish()));
        if let Some(error) = self.ctx.device.pop_error_scope().await {
            tracing::error!(%stage, "device reported: {}", error);
            return Err(EdgeForceError::kernel(stage, error.to_string()));
        }
        self.ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

impl ComputeBackend for WgpuBackend {
    type Buffer = wgpu::Buffer;

    fn name(&self) -> &str {
        "wgpu"
    }

    async fn create_buffer(&self, role: BufferRole, size: u64) -> Result<wgpu::Buffer> {
        let size = padded_size(size);
        let limits = self.ctx.device.limits();
        let max = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        if size > max {
            return Err(EdgeForceError::ResourceAllocation {
                role,
                bytes: size,
                reason: format!("exceeds device limit of {max} bytes"),
            });
        }

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(role.label()),
            size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        if let Some(error) = self.ctx.device.pop_error_scope().await {
            return Err(EdgeForceError::ResourceAllocation {
                role,
                bytes: size,
                reason: error.to_string(),
            });
        }
        Ok(buffer)
    }

    fn buffer_size(&self, buffer: &wgpu::Buffer) -> u64 {
        buffer.size()
    }

    async fn write_buffer(&self, buffer: &wgpu::Buffer, contents: &[u8]) -> Result<()> {
        if contents.len() as u64 > buffer.size() {
            return Err(EdgeForceError::mismatch(
                "buffer write",
                contents.len() as u64,
                buffer.size(),
            ));
        }
        // Queue writes must be a multiple of 4 bytes.
        if contents.len() % 4 == 0 {
            self.ctx.queue.write_buffer(buffer, 0, contents);
        } else {
            let mut padded = contents.to_vec();
            padded.resize(contents.len().next_multiple_of(4), 0);
            self.ctx.queue.write_buffer(buffer, 0, &padded);
        }
        self.ctx.queue.submit(std::iter::empty());
        self.ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    async fn read_buffer(&self, buffer: &wgpu::Buffer) -> Result<Vec<u8>> {
        let size = buffer.size();
        let staging = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        // Map the staging buffer
        let buffer_slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();

        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            // The receiver only goes away if this function already returned.
            let _ = tx.send(result);
        });

        self.ctx.device.poll(wgpu::Maintain::Wait);

        rx.recv()
            .map_err(|_| EdgeForceError::Readback("Channel closed".into()))?
            .map_err(|e| EdgeForceError::Readback(e.to_string()))?;

        let bytes = buffer_slice.get_mapped_range().to_vec();
        staging.unmap();

        Ok(bytes)
    }

    async fn copy_buffer(&self, source: &wgpu::Buffer, destination: &wgpu::Buffer) -> Result<()> {
        if source.size() > destination.size() {
            return Err(EdgeForceError::mismatch(
                "buffer copy",
                source.size(),
                destination.size(),
            ));
        }
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Copy Encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, destination, 0, source.size());
        self.ctx.queue.submit(Some(encoder.finish()));
        self.ctx.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    async fn map_edges(&self, args: &MapEdgesArgs<'_, Self>, work: KernelWorkSize) -> Result<()> {
        let stage = KernelStage::MapEdges;
        work.validate(stage)?;
        args.validate(self)?;
        let pipeline = self.map_pipeline(work.local).await?;

        let params = MapParams {
            scaling_ratio: args.params.scaling_ratio,
            gravity: args.params.gravity,
            edge_influence: args.params.edge_influence,
            flags: args.params.modes.bits(),
            is_forward: args.direction.as_flag(),
            num_edges: args.num_edges,
            num_points: args.num_points,
            _pad: 0,
        };
        self.ctx
            .queue
            .write_buffer(&self.map_params, 0, bytemuck::bytes_of(&params));

        tracing::trace!(
            backend = "wgpu",
            %stage,
            direction = %args.direction,
            edges = args.num_edges,
            "launch"
        );

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Map Edges Bind Group"),
            layout: &self.map_layout,
            entries: &bind_entries(&[
                &self.map_params,
                args.edges,
                args.point_degrees,
                args.points,
                args.edge_weights,
                args.output,
            ]),
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Map Edges Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Map Edges Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(work.workgroups(), 1, 1);
        }

        self.submit(stage, encoder).await
    }

    async fn seg_reduce(&self, args: &SegReduceArgs<'_, Self>, work: KernelWorkSize) -> Result<()> {
        let stage = KernelStage::SegReduce;
        work.validate(stage)?;
        args.validate(self, work)?;
        let pipelines = self.reduce_pipelines(work.local).await?;

        let num_groups = WorkPlan::num_groups(args.num_input, work.local);
        let params = ReduceParams {
            num_input: args.num_input,
            num_output: args.num_output,
            num_work_items: args.num_work_items,
            num_groups,
            is_forward: args.direction.as_flag(),
            ..Default::default()
        };
        self.ctx
            .queue
            .write_buffer(&self.reduce_params, 0, bytemuck::bytes_of(&params));

        tracing::trace!(
            backend = "wgpu",
            %stage,
            direction = %args.direction,
            edges = args.num_input,
            points = args.num_output,
            stitches = args.num_work_items,
            "launch"
        );

        self.ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Seg Reduce Bind Group"),
            layout: &self.reduce_layout,
            entries: &bind_entries(&[
                &self.reduce_params,
                args.input,
                args.edges,
                args.start_end,
                args.seg_start,
                args.work_list,
                args.carry_out,
                args.partial_forces,
                args.output,
            ]),
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Seg Reduce Encoder"),
            });

        // Points without edges keep their incoming value.
        let force_bytes = args.num_output as u64 * std::mem::size_of::<crate::Force>() as u64;
        encoder.copy_buffer_to_buffer(args.partial_forces, 0, args.output, 0, force_bytes);

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Seg Reduce Groups Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipelines.groups);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(work.workgroups(), 1, 1);
        }

        if args.num_work_items > 0 {
            let stitch_groups = args.num_work_items.div_ceil(work.local).min(MAX_WORKGROUPS);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Seg Reduce Stitch Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipelines.stitch);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(stitch_groups, 1, 1);
        }

        self.submit(stage, encoder).await
    }
}

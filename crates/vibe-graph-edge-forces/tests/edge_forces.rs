//! Integration tests for the two-pass edge-force pipeline.
//!
//! Everything runs on the CPU backend, which uses the same chunking, carry
//! table and stitch worklist as the wgpu kernels.

use vibe_graph_edge_forces::{
    AttractionScoring, BufferRole, ComputeBackend, CpuBackend, CpuBuffer, EdgeForceConfig, EdgeForceError, EdgeForces,
    EdgeScoring, Force, ForceModes, GraphBuffers, KernelStage, PhysicsParams, Position, Topology,
    WeightScoring, WorkItemSizing,
};

// =============================================================================
// Helpers
// =============================================================================

/// Bound orchestrator plus the device buffers the physics loop would own.
struct Harness<S: EdgeScoring> {
    forces: EdgeForces<CpuBackend<S>>,
    graph: GraphBuffers<CpuBackend<S>>,
    points: CpuBuffer,
}

impl<S: EdgeScoring> Harness<S> {
    async fn new(scoring: S, topology: &Topology, positions: &[Position], config: EdgeForceConfig) -> Self {
        let mut forces = EdgeForces::new(CpuBackend::new(scoring), config);
        forces.prepare(topology).await.unwrap();

        let backend = forces.backend();
        let graph = GraphBuffers::upload(backend, topology).await.unwrap();
        let points = backend
            .create_buffer_init(BufferRole::Points, bytemuck::cast_slice(positions))
            .await
            .unwrap();

        Self { forces, graph, points }
    }

    async fn tick(&mut self) -> Result<u64, EdgeForceError> {
        let inputs = self.graph.tick_inputs(&self.points, None);
        self.forces.exec_kernels(&inputs).await
    }

    async fn tick_with(&mut self, sizing: WorkItemSizing) -> Result<u64, EdgeForceError> {
        let inputs = self.graph.tick_inputs(&self.points, None);
        self.forces.compute_forces(&inputs, sizing).await
    }
}

fn origin_points(n: usize) -> Vec<Position> {
    vec![Position::default(); n]
}

fn xs(forces: &[Force]) -> Vec<f32> {
    forces.iter().map(|f| f.x).collect()
}

/// Deterministic pseudo-random graph with a hub, isolated points and integer
/// positions and weights, so every partial sum is exact in `f32`.
fn hub_graph(num_points: u32, num_edges: usize) -> (Topology, Vec<Position>, Vec<(u32, u32, f32)>) {
    let mut state = 0x2545_f491_u64;
    let mut next = |bound: u32| {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        ((state >> 33) % bound as u64) as u32
    };

    // The last ten points never get an edge.
    let connected = num_points - 10;
    let mut edges = Vec::with_capacity(num_edges);
    for i in 0..num_edges {
        let weight = (1 + next(4)) as f32;
        let edge = match i % 3 {
            0 => (0, 1 + next(connected - 1), weight),
            1 => (1 + next(connected - 1), 0, weight),
            _ => (next(connected), next(connected), weight),
        };
        edges.push(edge);
    }

    let positions = (0..num_points)
        .map(|_| Position::new(next(101) as f32 - 50.0, next(101) as f32 - 50.0))
        .collect();

    let topology = Topology::from_edges(num_points, &edges).unwrap();
    (topology, positions, edges)
}

/// Host reference of both passes for plain attraction (no modes, influence 1).
fn attraction_reference(num_points: u32, positions: &[Position], edges: &[(u32, u32, f32)]) -> Vec<(f64, f64)> {
    let mut totals = vec![(0.0f64, 0.0f64); num_points as usize];
    for &(source, target, weight) in edges {
        let (s, t) = (positions[source as usize], positions[target as usize]);
        let dx = (t.x - s.x) as f64 * weight as f64;
        let dy = (t.y - s.y) as f64 * weight as f64;
        totals[source as usize].0 += dx;
        totals[source as usize].1 += dy;
        totals[target as usize].0 -= dx;
        totals[target as usize].1 -= dy;
    }
    totals
}

fn assert_close(actual: &[Force], expected: &[Force]) {
    assert_eq!(actual.len(), expected.len());
    for (point, (a, e)) in actual.iter().zip(expected).enumerate() {
        let scale = e.x.abs().max(e.y.abs()).max(1.0);
        assert!(
            (a.x - e.x).abs() <= 1e-5 * scale && (a.y - e.y).abs() <= 1e-5 * scale,
            "point {point}: {a:?} vs {e:?}"
        );
    }
}

// =============================================================================
// Pass semantics
// =============================================================================

#[tokio::test]
async fn test_forward_pass_conserves_weights() {
    // 4 points, 5 edges; point 3 only receives.
    let edges = [
        (0, 1, 1.0),
        (0, 2, 2.0),
        (1, 2, 3.0),
        (2, 0, 4.0),
        (0, 3, 5.0),
    ];
    let topology = Topology::from_edges(4, &edges).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(4), EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();
    let partial = harness.forces.read_partial_forces().await.unwrap();

    assert_eq!(xs(&partial), vec![8.0, 3.0, 4.0, 0.0]);
    assert_eq!(xs(&partial).iter().sum::<f32>(), 15.0);
    assert!(partial.iter().all(|f| f.y == 0.0));
}

#[tokio::test]
async fn test_isolated_point_keeps_prior_force() {
    let topology = Topology::from_edges(4, &[(0, 1, 1.0), (1, 2, 1.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(4), EdgeForceConfig::default()).await;

    let prior = [
        Force::new(0.5, -1.0),
        Force::new(0.25, 0.0),
        Force::new(-3.0, 2.0),
        Force::new(7.125, -0.375),
    ];
    let prior_buffer = harness
        .forces
        .backend()
        .create_buffer_init(BufferRole::PriorForces, bytemuck::cast_slice(&prior))
        .await
        .unwrap();

    let inputs = harness.graph.tick_inputs(&harness.points, Some(&prior_buffer));
    harness.forces.exec_kernels(&inputs).await.unwrap();

    let partial = harness.forces.read_partial_forces().await.unwrap();
    let forces = harness.forces.read_forces().await.unwrap();
    assert_eq!(partial[3], prior[3]);
    assert_eq!(forces[3], prior[3]);
    assert_eq!(forces[0], Force::new(1.5, -1.0));
    assert_eq!(forces[1], Force::new(2.25, 0.0));
    assert_eq!(forces[2], Force::new(-2.0, 2.0));
}

#[tokio::test]
async fn test_direction_routing() {
    let topology = Topology::from_edges(2, &[(0, 1, 1.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(2), EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();

    let partial = harness.forces.read_partial_forces().await.unwrap();
    assert_eq!(xs(&partial), vec![1.0, 0.0]);
    let forces = harness.forces.read_forces().await.unwrap();
    assert_eq!(xs(&forces), vec![1.0, 1.0]);
}

#[tokio::test]
async fn test_end_to_end_path() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;

    let tick = harness.tick().await.unwrap();
    assert_eq!(tick, 1);
    assert_eq!(harness.forces.tick(), 1);

    let partial = harness.forces.read_partial_forces().await.unwrap();
    assert_eq!(xs(&partial), vec![1.0, 2.0, 0.0]);
    let forces = harness.forces.read_forces().await.unwrap();
    assert_eq!(xs(&forces), vec![1.0, 3.0, 2.0]);
}

#[tokio::test]
async fn test_attraction_pulls_endpoints_together() {
    let topology = Topology::from_edges(2, &[(0, 1, 2.0)]).unwrap();
    let positions = [Position::new(0.0, 0.0), Position::new(3.0, -4.0)];
    let mut harness = Harness::new(AttractionScoring, &topology, &positions, EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();
    let forces = harness.forces.read_forces().await.unwrap();
    assert_eq!(forces[0], Force::new(6.0, -8.0));
    assert_eq!(forces[1], Force::new(-6.0, 8.0));
}

// =============================================================================
// Chunking
// =============================================================================

#[tokio::test]
async fn test_group_size_invariance() {
    let (topology, positions, edges) = hub_graph(200, 2000);
    let mut harness = Harness::new(AttractionScoring, &topology, &positions, EdgeForceConfig::default()).await;

    let mut results = Vec::new();
    for group_size in [1, 8, 256] {
        harness
            .tick_with(WorkItemSizing::with_group_size(group_size))
            .await
            .unwrap();
        results.push(harness.forces.read_forces().await.unwrap());
    }

    assert_close(&results[0], &results[2]);
    assert_close(&results[1], &results[2]);

    let expected: Vec<Force> = attraction_reference(200, &positions, &edges)
        .into_iter()
        .map(|(x, y)| Force::new(x as f32, y as f32))
        .collect();
    assert_close(&results[2], &expected);
    // Isolated tail of the point range.
    assert!(results[2][190..].iter().all(|f| *f == Force::ZERO));
}

#[tokio::test]
async fn test_hub_segment_spanning_many_groups() {
    // Point 0 owns 50 forward edges, so at group size 8 its segment crosses
    // seven chunk boundaries.
    let mut edges: Vec<(u32, u32, f32)> = (0..50).map(|i| (0, 1 + i % 4, 1.0)).collect();
    edges.push((1, 2, 0.5));
    edges.push((4, 3, 0.25));
    let topology = Topology::from_edges(5, &edges).unwrap();
    let mut harness = Harness::new(
        WeightScoring,
        &topology,
        &origin_points(5),
        EdgeForceConfig {
            sizing: WorkItemSizing::with_group_size(8),
            ..Default::default()
        },
    )
    .await;

    let plan = harness.forces.buffers().unwrap().plan(vibe_graph_edge_forces::Direction::Forward);
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.items()[0].point, 0);
    assert_eq!(plan.items()[0].last_group, 6);

    harness.tick().await.unwrap();
    let partial = harness.forces.read_partial_forces().await.unwrap();
    assert_eq!(xs(&partial), vec![50.0, 0.5, 0.0, 0.0, 0.25]);
    let forces = harness.forces.read_forces().await.unwrap();
    // Hub edges land 13, 13, 12, 12 times on points 1..=4.
    assert_eq!(xs(&forces), vec![50.0, 13.5, 13.5, 12.25, 12.25]);
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_failed_backward_reduce_keeps_published_forces() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();
    let published = harness.forces.read_forces().await.unwrap();

    // Let the forward reduce through, fail the backward one mid-write.
    harness.forces.backend().inject_fault_at(KernelStage::SegReduce, 1);
    let err = harness.tick().await.unwrap_err();
    assert!(matches!(
        err,
        EdgeForceError::KernelExecution {
            stage: KernelStage::SegReduce,
            ..
        }
    ));

    assert_eq!(harness.forces.read_forces().await.unwrap(), published);
    assert_eq!(harness.forces.tick(), 1);

    // The next tick retries normally.
    assert_eq!(harness.tick().await.unwrap(), 2);
    assert_eq!(harness.forces.read_forces().await.unwrap(), published);
}

#[tokio::test]
async fn test_failed_map_keeps_published_forces() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();
    let published = harness.forces.read_forces().await.unwrap();

    harness.forces.backend().inject_fault(KernelStage::MapEdges);
    let err = harness.tick().await.unwrap_err();
    assert!(matches!(
        err,
        EdgeForceError::KernelExecution {
            stage: KernelStage::MapEdges,
            ..
        }
    ));
    assert_eq!(harness.forces.read_forces().await.unwrap(), published);
}

#[tokio::test]
async fn test_allocation_failure_under_memory_budget() {
    let topology = Topology::from_edges(64, &[(0, 1, 1.0), (2, 3, 1.0)]).unwrap();
    let mut forces = EdgeForces::new(
        CpuBackend::new(WeightScoring).with_memory_limit(256),
        EdgeForceConfig::default(),
    );

    let err = forces.prepare(&topology).await.unwrap_err();
    assert!(matches!(err, EdgeForceError::ResourceAllocation { .. }));
    assert!(forces.buffers().is_none());
    assert_eq!(forces.backend().allocated_bytes(), 0);
}

#[tokio::test]
async fn test_undersized_inputs_are_a_topology_mismatch() {
    let chain: Vec<(u32, u32, f32)> = (0..6).map(|i| (i, i + 1, 1.0)).collect();
    let topology = Topology::from_edges(10, &chain).unwrap();
    let smaller = Topology::from_edges(2, &[(0, 1, 1.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(10), EdgeForceConfig::default()).await;

    let stale = GraphBuffers::upload(harness.forces.backend(), &smaller).await.unwrap();
    let inputs = stale.tick_inputs(&harness.points, None);
    let err = harness.forces.exec_kernels(&inputs).await.unwrap_err();
    assert!(matches!(err, EdgeForceError::TopologyMismatch { .. }));
    assert_eq!(harness.forces.tick(), 0);
}

#[tokio::test]
async fn test_oversized_stale_inputs_are_a_topology_mismatch() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let triangle = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0), (2, 0, 3.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;

    // Edge lists uploaded for the triangle are one record too long.
    let stale = GraphBuffers::upload(harness.forces.backend(), &triangle).await.unwrap();
    let inputs = stale.tick_inputs(&harness.points, None);
    let err = harness.forces.exec_kernels(&inputs).await.unwrap_err();
    assert!(matches!(
        err,
        EdgeForceError::TopologyMismatch {
            ref what,
            expected: 16,
            actual: 24,
        } if what == "forward edges"
    ));
    assert_eq!(harness.forces.tick(), 0);

    // The matching uploads still go through.
    assert_eq!(harness.tick().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_regroup_keeps_the_previous_plan() {
    let doubled: Vec<(u32, u32, f32)> = (0..10).flat_map(|i| [(i, i + 1, 1.0), (i, i + 1, 1.0)]).collect();
    let topology = Topology::from_edges(11, &doubled).unwrap();
    let mut forces = EdgeForces::new(
        CpuBackend::new(WeightScoring).with_memory_limit(1800),
        EdgeForceConfig::default(),
    );
    forces.prepare(&topology).await.unwrap();
    let graph = GraphBuffers::upload(forces.backend(), &topology).await.unwrap();
    let points = forces
        .backend()
        .create_buffer_init(BufferRole::Points, bytemuck::cast_slice(&origin_points(11)))
        .await
        .unwrap();
    let inputs = graph.tick_inputs(&points, None);
    let bytes = forces.backend().allocated_bytes();

    // One-edge chunks need a carry table and work lists that exceed the budget.
    for _ in 0..2 {
        let err = forces
            .compute_forces(&inputs, WorkItemSizing::with_group_size(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EdgeForceError::ResourceAllocation { .. }));
        assert_eq!(forces.backend().allocated_bytes(), bytes);
        assert_eq!(forces.buffers().map(|b| b.group_size()), Some(256));
    }
    assert_eq!(forces.tick(), 0);

    // The configured sizing still runs against the untouched plan.
    assert_eq!(forces.exec_kernels(&inputs).await.unwrap(), 1);
    let mut expected = vec![2.0; 10];
    expected.push(0.0);
    assert_eq!(xs(&forces.read_partial_forces().await.unwrap()), expected);

    let mut reference = Harness::new(WeightScoring, &topology, &origin_points(11), EdgeForceConfig::default()).await;
    reference.tick().await.unwrap();
    assert_eq!(
        forces.read_forces().await.unwrap(),
        reference.forces.read_forces().await.unwrap()
    );
}

#[tokio::test]
async fn test_last_written_tracks_partial_and_published_forces() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;
    let written = |forces: &EdgeForces<CpuBackend<WeightScoring>>, role| {
        forces.buffers().and_then(|b| b.last_written(role))
    };

    assert_eq!(written(&harness.forces, BufferRole::PartialForces), None);
    assert_eq!(written(&harness.forces, BufferRole::CurForces), None);

    harness.tick().await.unwrap();
    assert_eq!(written(&harness.forces, BufferRole::PartialForces), Some(1));
    assert_eq!(written(&harness.forces, BufferRole::CurForces), Some(1));
    assert_eq!(written(&harness.forces, BufferRole::CarryOut), None);

    // Forward pass lands, the backward reduce fails: buffer A is newer than B.
    harness.forces.backend().inject_fault_at(KernelStage::SegReduce, 1);
    harness.tick().await.unwrap_err();
    assert_eq!(written(&harness.forces, BufferRole::PartialForces), Some(2));
    assert_eq!(written(&harness.forces, BufferRole::CurForces), Some(1));

    // A failed forward pass records nothing.
    harness.forces.backend().inject_fault(KernelStage::MapEdges);
    harness.tick().await.unwrap_err();
    assert_eq!(written(&harness.forces, BufferRole::PartialForces), Some(2));

    harness.tick().await.unwrap();
    assert_eq!(written(&harness.forces, BufferRole::PartialForces), Some(2));
    assert_eq!(written(&harness.forces, BufferRole::CurForces), Some(2));
}

#[tokio::test]
async fn test_tick_before_prepare() {
    let topology = Topology::from_edges(2, &[(0, 1, 1.0)]).unwrap();
    let mut forces = EdgeForces::new(CpuBackend::new(WeightScoring), EdgeForceConfig::default());
    let graph = GraphBuffers::upload(forces.backend(), &topology).await.unwrap();
    let points = forces
        .backend()
        .create_buffer(BufferRole::Points, 16)
        .await
        .unwrap();

    let inputs = graph.tick_inputs(&points, None);
    let err = forces.exec_kernels(&inputs).await.unwrap_err();
    assert!(matches!(err, EdgeForceError::NotPrepared));
}

#[tokio::test]
async fn test_invalid_sizing_is_rejected() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;

    let sizing = WorkItemSizing {
        seg_reduce: vibe_graph_edge_forces::KernelWorkSize::new(1000, 300),
        ..Default::default()
    };
    let err = harness.tick_with(sizing).await.unwrap_err();
    assert!(matches!(err, EdgeForceError::InvalidWorkSize { .. }));
}

// =============================================================================
// Buffer lifecycle
// =============================================================================

#[tokio::test]
async fn test_prepare_is_idempotent() {
    let topology = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let mut harness = Harness::new(WeightScoring, &topology, &origin_points(3), EdgeForceConfig::default()).await;
    harness.tick().await.unwrap();
    let first = harness.forces.read_forces().await.unwrap();

    let count = harness.forces.backend().allocation_count();
    let bytes = harness.forces.backend().allocated_bytes();
    harness.forces.prepare(&topology).await.unwrap();
    harness.forces.set_edges(&topology).await.unwrap();
    assert_eq!(harness.forces.backend().allocation_count(), count);
    assert_eq!(harness.forces.backend().allocated_bytes(), bytes);

    harness.tick().await.unwrap();
    assert_eq!(harness.forces.read_forces().await.unwrap(), first);
}

#[tokio::test]
async fn test_set_physics_does_not_reallocate() {
    let topology = Topology::from_edges(2, &[(0, 1, 4.0)]).unwrap();
    let positions = [Position::new(0.0, 0.0), Position::new(1.0, 0.0)];
    let mut harness = Harness::new(AttractionScoring, &topology, &positions, EdgeForceConfig::default()).await;

    harness.tick().await.unwrap();
    assert_eq!(harness.forces.read_forces().await.unwrap()[0], Force::new(4.0, 0.0));
    let count = harness.forces.backend().allocation_count();

    harness.forces.set_physics(PhysicsParams {
        edge_influence: 0.0,
        modes: ForceModes {
            dissuade_hubs: true,
            ..Default::default()
        },
        ..Default::default()
    });
    harness.tick().await.unwrap();

    // Weight ignored, divided by (1 + degree(source)) = 2.
    assert_eq!(harness.forces.read_forces().await.unwrap()[0], Force::new(0.5, 0.0));
    assert_eq!(harness.forces.backend().allocation_count(), count);
}

#[tokio::test]
async fn test_rebinding_a_larger_topology_replaces_buffers() {
    let small = Topology::from_edges(3, &[(0, 1, 1.0), (1, 2, 2.0)]).unwrap();
    let large = Topology::from_edges(5, &[(0, 1, 1.0), (1, 2, 2.0), (3, 4, 1.0), (4, 0, 1.0)]).unwrap();

    let mut forces = EdgeForces::new(CpuBackend::new(WeightScoring), EdgeForceConfig::default());
    forces.prepare(&small).await.unwrap();
    let small_bytes = forces.backend().allocated_bytes();

    forces.set_edges(&large).await.unwrap();
    assert!(forces.backend().allocated_bytes() > small_bytes);
    assert_eq!(forces.buffers().map(|b| b.num_points()), Some(5));
    assert_eq!(forces.read_forces().await.unwrap(), vec![Force::ZERO; 5]);

    forces.release();
    assert_eq!(forces.backend().allocated_bytes(), 0);
}

// =============================================================================
// GPU
// =============================================================================

#[tokio::test]
#[ignore = "requires a GPU adapter"]
async fn test_wgpu_matches_cpu() {
    use vibe_graph_edge_forces::WgpuBackend;

    let (topology, positions, _) = hub_graph(200, 2000);
    let backend = match WgpuBackend::new(&AttractionScoring).await {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("skipping: {err}");
            return;
        }
    };

    // Unit weights keep the device `pow` out of the comparison.
    let config = EdgeForceConfig {
        physics: PhysicsParams {
            edge_influence: 0.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut gpu = EdgeForces::new(backend, config);
    gpu.prepare(&topology).await.unwrap();
    let graph = GraphBuffers::upload(gpu.backend(), &topology).await.unwrap();
    let points = gpu
        .backend()
        .create_buffer_init(BufferRole::Points, bytemuck::cast_slice(&positions))
        .await
        .unwrap();

    let mut cpu = Harness::new(AttractionScoring, &topology, &positions, config).await;
    cpu.tick().await.unwrap();
    let expected = cpu.forces.read_forces().await.unwrap();

    for group_size in [8, 256] {
        let inputs = graph.tick_inputs(&points, None);
        gpu.compute_forces(&inputs, WorkItemSizing::with_group_size(group_size))
            .await
            .unwrap();
        assert_close(&gpu.read_forces().await.unwrap(), &expected);
    }
}

//! Accumulate ForceAtlas2 attraction for a synthetic graph.
//!
//! Runs on the GPU when an adapter is available, otherwise on the CPU backend.
//!
//! Run with: cargo run --example edge_forces

use std::time::Instant;
use vibe_graph_edge_forces::{
    AttractionScoring, BufferRole, ComputeBackend, CpuBackend, EdgeForceConfig, EdgeForces, ForceModes,
    GraphBuffers, PhysicsParams, Position, Result, Topology, WgpuBackend,
};

async fn run<B: ComputeBackend>(backend: B, topology: &Topology, positions: &[Position]) -> Result<()> {
    println!("Backend: {}", backend.name());

    let config = EdgeForceConfig {
        physics: PhysicsParams {
            modes: ForceModes {
                lin_log: true,
                ..Default::default()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let mut forces = EdgeForces::new(backend, config);
    forces.prepare(topology).await?;

    let graph = GraphBuffers::upload(forces.backend(), topology).await?;
    let points = forces
        .backend()
        .create_buffer_init(BufferRole::Points, bytemuck::cast_slice(positions))
        .await?;
    let inputs = graph.tick_inputs(&points, None);

    let ticks = 20;
    let start = Instant::now();
    for _ in 0..ticks {
        forces.exec_kernels(&inputs).await?;
    }
    let elapsed = start.elapsed();

    let result = forces.read_forces().await?;
    let net = result.iter().fold((0.0f64, 0.0f64), |(x, y), f| (x + f.x as f64, y + f.y as f64));
    let strongest = result
        .iter()
        .map(|f| (f.x * f.x + f.y * f.y).sqrt())
        .fold(0.0f32, f32::max);

    println!(
        "{} ticks in {:.2?} ({:.2?} per tick)",
        ticks,
        elapsed,
        elapsed / ticks
    );
    // Attraction is symmetric, so the net force stays near zero.
    println!("Net force: ({:.3}, {:.3}), strongest point force: {:.3}", net.0, net.1, strongest);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let node_count = 5000u32;
    let edge_count = 20000u32;
    println!("Creating graph with {} nodes and {} edges...", node_count, edge_count);

    let positions: Vec<Position> = (0..node_count)
        .map(|i| {
            let angle = i as f32 * 0.1;
            let radius = 100.0 + i as f32 * 0.5;
            Position::new(radius * angle.cos(), radius * angle.sin())
        })
        .collect();

    let mut edges = Vec::with_capacity(edge_count as usize);
    for i in 1..node_count {
        edges.push((i - 1, i, 1.0));
    }
    for i in 0..(edge_count - node_count + 1) {
        // A few hubs so that some segments span many workgroups.
        let source = if i % 4 == 0 { i % 8 } else { (i * 17) % node_count };
        let target = (i * 31 + 7) % node_count;
        edges.push((source, target, 1.0 + (i % 3) as f32));
    }
    let topology = Topology::from_edges(node_count, &edges)?;

    pollster::block_on(async {
        match WgpuBackend::new(&AttractionScoring).await {
            Ok(backend) => run(backend, &topology, &positions).await,
            Err(err) => {
                println!("No GPU ({err}), falling back to CPU");
                run(CpuBackend::new(AttractionScoring), &topology, &positions).await
            }
        }
    })
}

//! WGSL compute shaders for the edge-force map and segmented reduce.
//!
//! Both sources are templates: `{{WORKGROUP_SIZE}}` is replaced by the local
//! work size of the launch and `{{EDGE_FORCE}}` by the scoring function of
//! the backend (see [`EdgeScoring::wgsl`](crate::EdgeScoring::wgsl)).

const WORKGROUP_SIZE: &str = "{{WORKGROUP_SIZE}}";
const EDGE_FORCE: &str = "{{EDGE_FORCE}}";

/// Per-edge force map: one contribution per edge, written at the edge index.
const MAP_SHADER_TEMPLATE: &str = r#"
// ============================================================================
// Data structures
// ============================================================================

struct Edge {
    source: u32,
    target: u32,
}

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

struct EdgeSample {
    weight: f32,
    point_degree: u32,
    other_degree: u32,
    is_forward: u32,
    point: vec2<f32>,
    other: vec2<f32>,
}

const FLAG_PREVENT_OVERLAP: u32 = 1u;
const FLAG_STRONG_GRAVITY: u32 = 2u;
const FLAG_DISSUADE_HUBS: u32 = 4u;
const FLAG_LIN_LOG: u32 = 8u;

const GROUP_SIZE: u32 = {{WORKGROUP_SIZE}}u;

// ============================================================================
// Bindings
// ============================================================================

@group(0) @binding(0) var<uniform> params: MapParams;
@group(0) @binding(1) var<storage, read> edges: array<Edge>;
@group(0) @binding(2) var<storage, read> point_degrees: array<u32>;
@group(0) @binding(3) var<storage, read> points: array<vec2<f32>>;
@group(0) @binding(4) var<storage, read> edge_weights: array<f32>;
@group(0) @binding(5) var<storage, read_write> edge_forces: array<vec2<f32>>;

// ============================================================================
// Scoring
// ============================================================================

{{EDGE_FORCE}}

// ============================================================================
// Map kernel (grid-stride over edges)
// ============================================================================

@compute @workgroup_size(GROUP_SIZE)
fn map_edges(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) num_workgroups: vec3<u32>,
) {
    let stride = num_workgroups.x * GROUP_SIZE;

    for (var i = global_id.x; i < params.num_edges; i = i + stride) {
        let edge = edges[i];

        var point = edge.source;
        var other = edge.target;
        if (params.is_forward == 0u) {
            point = edge.target;
            other = edge.source;
        }

        var s: EdgeSample;
        s.weight = edge_weights[i];
        s.point_degree = point_degrees[point];
        s.other_degree = point_degrees[other];
        s.is_forward = params.is_forward;
        s.point = points[point];
        s.other = points[other];

        edge_forces[i] = edge_force(s);
    }
}
"#;

/// Two-level segmented reduction of per-edge forces into per-point forces.
///
/// `reduce_groups` scans one chunk of `GROUP_SIZE` edges per workgroup and
/// `stitch_segments` sums the carried partials of boundary-crossing segments.
/// The output buffer is expected to hold a copy of `partial_forces` already.
const SEG_REDUCE_SHADER_TEMPLATE: &str = r#"
// ============================================================================
// Data structures
// ============================================================================

struct Edge {
    source: u32,
    target: u32,
}

struct StartEnd {
    start: u32,
    end: u32,
}

struct CarryOut {
    tail: vec2<f32>,
    head: vec2<f32>,
}

struct WorkItem {
    point: u32,
    last_group: u32,
}

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

const GROUP_SIZE: u32 = {{WORKGROUP_SIZE}}u;

// ============================================================================
// Bindings
// ============================================================================

@group(0) @binding(0) var<uniform> params: ReduceParams;
@group(0) @binding(1) var<storage, read> input: array<vec2<f32>>;
@group(0) @binding(2) var<storage, read> edges: array<Edge>;
@group(0) @binding(3) var<storage, read> start_end: array<StartEnd>;
@group(0) @binding(4) var<storage, read_write> seg_start: array<u32>;
@group(0) @binding(5) var<storage, read> work_list: array<WorkItem>;
@group(0) @binding(6) var<storage, read_write> carry_out: array<CarryOut>;
@group(0) @binding(7) var<storage, read> partial_forces: array<vec2<f32>>;
@group(0) @binding(8) var<storage, read_write> output_forces: array<vec2<f32>>;

var<workgroup> scan_values: array<vec2<f32>, GROUP_SIZE>;
var<workgroup> scan_flags: array<u32, GROUP_SIZE>;

fn grouping_point(edge: Edge) -> u32 {
    if (params.is_forward != 0u) {
        return edge.source;
    }
    return edge.target;
}

// ============================================================================
// Phase 1: segmented scan per chunk
// ============================================================================

@compute @workgroup_size(GROUP_SIZE)
fn reduce_groups(
    @builtin(local_invocation_id) local_id: vec3<u32>,
    @builtin(workgroup_id) workgroup_id: vec3<u32>,
    @builtin(num_workgroups) num_workgroups: vec3<u32>,
) {
    let lid = local_id.x;

    for (var group = workgroup_id.x; group < params.num_groups; group = group + num_workgroups.x) {
        let lo = group * GROUP_SIZE;
        let hi = min(lo + GROUP_SIZE, params.num_input);
        let e = lo + lid;
        let valid = e < hi;

        var value = vec2<f32>(0.0, 0.0);
        var flag = 0u;
        var point = 0u;
        var segment = StartEnd(0u, 0u);
        if (valid) {
            point = grouping_point(edges[e]);
            segment = start_end[point];
            value = input[e];
            if (lid == 0u || e == segment.start) {
                flag = 1u;
            }
            if (e == segment.start) {
                seg_start[point] = group;
            }
        }

        scan_values[lid] = value;
        scan_flags[lid] = flag;
        workgroupBarrier();

        // Hillis-Steele inclusive scan that stops at segment heads
        for (var offset = 1u; offset < GROUP_SIZE; offset = offset * 2u) {
            var v = scan_values[lid];
            var f = scan_flags[lid];
            if (lid >= offset) {
                if (f == 0u) {
                    v = scan_values[lid - offset] + v;
                }
                f = f | scan_flags[lid - offset];
            }
            workgroupBarrier();
            scan_values[lid] = v;
            scan_flags[lid] = f;
            workgroupBarrier();
        }

        if (valid) {
            let closes = e + 1u == segment.end;
            if (closes || e + 1u == hi) {
                let sum = scan_values[lid];
                let first_group = segment.start / GROUP_SIZE;
                let last_group = (segment.end - 1u) / GROUP_SIZE;
                if (first_group == last_group) {
                    output_forces[point] = partial_forces[point] + sum;
                } else if (closes) {
                    carry_out[group].head = sum;
                } else {
                    carry_out[group].tail = sum;
                }
            }
        }
        workgroupBarrier();
    }
}

// ============================================================================
// Phase 2: stitch segments that cross chunk boundaries
// ============================================================================

@compute @workgroup_size(GROUP_SIZE)
fn stitch_segments(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(num_workgroups) num_workgroups: vec3<u32>,
) {
    let stride = num_workgroups.x * GROUP_SIZE;

    for (var k = global_id.x; k < params.num_work_items; k = k + stride) {
        let item = work_list[k];
        let first_group = seg_start[item.point];

        var total = carry_out[first_group].tail;
        for (var g = first_group + 1u; g < item.last_group; g = g + 1u) {
            total = total + carry_out[g].tail;
        }
        total = total + carry_out[item.last_group].head;

        output_forces[item.point] = partial_forces[item.point] + total;
    }
}
"#;

/// Map shader for a workgroup size and scoring function.
pub fn map_shader(edge_force: &str, workgroup_size: u32) -> String {
    MAP_SHADER_TEMPLATE
        .replace(WORKGROUP_SIZE, &workgroup_size.to_string())
        .replace(EDGE_FORCE, edge_force)
}

/// Segmented-reduce shader for a workgroup (chunk) size.
pub fn seg_reduce_shader(workgroup_size: u32) -> String {
    SEG_REDUCE_SHADER_TEMPLATE.replace(WORKGROUP_SIZE, &workgroup_size.to_string())
}

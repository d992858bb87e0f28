//! Physics parameters and the per-edge scoring functions used by the map stage.

use crate::{Force, Position};

/// ForceAtlas2 mode switches, packed into one flag word for the kernels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForceModes {
    pub prevent_overlap: bool,
    pub strong_gravity: bool,
    /// Divide attraction by the source point's degree.
    pub dissuade_hubs: bool,
    /// Logarithmic attraction.
    pub lin_log: bool,
}

impl ForceModes {
    pub const PREVENT_OVERLAP: u32 = 1 << 0;
    pub const STRONG_GRAVITY: u32 = 1 << 1;
    pub const DISSUADE_HUBS: u32 = 1 << 2;
    pub const LIN_LOG: u32 = 1 << 3;

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.prevent_overlap {
            bits |= Self::PREVENT_OVERLAP;
        }
        if self.strong_gravity {
            bits |= Self::STRONG_GRAVITY;
        }
        if self.dissuade_hubs {
            bits |= Self::DISSUADE_HUBS;
        }
        if self.lin_log {
            bits |= Self::LIN_LOG;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            prevent_overlap: bits & Self::PREVENT_OVERLAP != 0,
            strong_gravity: bits & Self::STRONG_GRAVITY != 0,
            dissuade_hubs: bits & Self::DISSUADE_HUBS != 0,
            lin_log: bits & Self::LIN_LOG != 0,
        }
    }
}

/// Scalar physics configuration broadcast to both kernel stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicsParams {
    pub scaling_ratio: f32,
    pub gravity: f32,
    /// Exponent applied to edge weights (0 ignores weights).
    pub edge_influence: f32,
    pub modes: ForceModes,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self {
            scaling_ratio: 1.0,
            gravity: 1.0,
            edge_influence: 1.0,
            modes: ForceModes::default(),
        }
    }
}

/// Everything the map stage knows about one edge.
///
/// `point` is the endpoint the edge is grouped under in the current pass,
/// `other` the opposite endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeSample {
    pub weight: f32,
    pub point_degree: u32,
    pub other_degree: u32,
    pub point: Position,
    pub other: Position,
    pub is_forward: bool,
}

impl EdgeSample {
    /// Degree of the edge's source point, whichever side it is on.
    pub fn source_degree(&self) -> u32 {
        if self.is_forward {
            self.point_degree
        } else {
            self.other_degree
        }
    }
}

/// Force contributed by a single edge to its grouping point.
///
/// Implementations must be pure functions of the sample and the parameters:
/// the map kernel runs edges in no particular order and a tick must be
/// reproducible for identical inputs.
///
/// The same function exists twice, once for the host (`score`) and once as
/// WGSL (`wgsl`). The WGSL text must define
/// `fn edge_force(s: EdgeSample) -> vec2<f32>`; it may read the `params`
/// uniform (`scaling_ratio`, `gravity`, `edge_influence`, `flags`) and the
/// `FLAG_*` constants declared by the map shader.
pub trait EdgeScoring: Send + Sync {
    fn score(&self, sample: &EdgeSample, params: &PhysicsParams) -> Force;

    fn wgsl(&self) -> &'static str;
}

/// Contribution equal to the edge weight along x.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightScoring;

impl EdgeScoring for WeightScoring {
    fn score(&self, sample: &EdgeSample, _params: &PhysicsParams) -> Force {
        Force::new(sample.weight, 0.0)
    }

    fn wgsl(&self) -> &'static str {
        r#"
fn edge_force(s: EdgeSample) -> vec2<f32> {
    return vec2<f32>(s.weight, 0.0);
}
"#
    }
}

/// ForceAtlas2 attraction pulling the grouping point toward the other end.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttractionScoring;

impl EdgeScoring for AttractionScoring {
    fn score(&self, sample: &EdgeSample, params: &PhysicsParams) -> Force {
        let weight = if params.edge_influence == 0.0 {
            1.0
        } else {
            sample.weight.powf(params.edge_influence)
        };

        let dx = sample.other.x - sample.point.x;
        let dy = sample.other.y - sample.point.y;
        let dist = (dx * dx + dy * dy).sqrt();

        let mut factor = weight;
        if params.modes.lin_log && dist > 0.0 {
            factor = factor * (1.0 + dist).ln() / dist;
        }
        if params.modes.dissuade_hubs {
            factor /= sample.source_degree() as f32 + 1.0;
        }

        Force::new(dx * factor, dy * factor)
    }

    fn wgsl(&self) -> &'static str {
        r#"
fn edge_force(s: EdgeSample) -> vec2<f32> {
    var weight = 1.0;
    if (params.edge_influence != 0.0) {
        weight = pow(s.weight, params.edge_influence);
    }

    let d = s.other - s.point;
    let dist = length(d);

    var factor = weight;
    if ((params.flags & FLAG_LIN_LOG) != 0u && dist > 0.0) {
        factor = factor * log(1.0 + dist) / dist;
    }
    if ((params.flags & FLAG_DISSUADE_HUBS) != 0u) {
        var source_degree = s.other_degree;
        if (s.is_forward != 0u) {
            source_degree = s.point_degree;
        }
        factor = factor / (f32(source_degree) + 1.0);
    }

    return d * factor;
}
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(weight: f32, is_forward: bool) -> EdgeSample {
        EdgeSample {
            weight,
            point_degree: 3,
            other_degree: 1,
            point: Position::new(0.0, 0.0),
            other: Position::new(3.0, 4.0),
            is_forward,
        }
    }

    #[test]
    fn test_modes_round_trip_bits() {
        let modes = ForceModes {
            lin_log: true,
            dissuade_hubs: true,
            ..Default::default()
        };
        assert_eq!(modes.bits(), ForceModes::LIN_LOG | ForceModes::DISSUADE_HUBS);
        assert_eq!(ForceModes::from_bits(modes.bits()), modes);
    }

    #[test]
    fn test_weight_scoring_ignores_geometry() {
        let force = WeightScoring.score(&sample(2.5, false), &PhysicsParams::default());
        assert_eq!(force, Force::new(2.5, 0.0));
    }

    #[test]
    fn test_attraction_is_linear_by_default() {
        let force = AttractionScoring.score(&sample(2.0, true), &PhysicsParams::default());
        assert_eq!(force, Force::new(6.0, 8.0));
    }

    #[test]
    fn test_attraction_zero_influence_ignores_weight() {
        let params = PhysicsParams {
            edge_influence: 0.0,
            ..Default::default()
        };
        let force = AttractionScoring.score(&sample(7.0, true), &params);
        assert_eq!(force, Force::new(3.0, 4.0));
    }

    #[test]
    fn test_attraction_lin_log() {
        let params = PhysicsParams {
            modes: ForceModes {
                lin_log: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let force = AttractionScoring.score(&sample(1.0, true), &params);
        let factor = 6.0f32.ln() / 5.0;
        assert!((force.x - 3.0 * factor).abs() < 1e-6);
        assert!((force.y - 4.0 * factor).abs() < 1e-6);
    }

    #[test]
    fn test_dissuade_hubs_uses_source_degree() {
        let params = PhysicsParams {
            modes: ForceModes {
                dissuade_hubs: true,
                ..Default::default()
            },
            ..Default::default()
        };
        // Forward: the grouping point is the source (degree 3).
        let forward = AttractionScoring.score(&sample(1.0, true), &params);
        assert_eq!(forward, Force::new(0.75, 1.0));
        // Backward: the other end is the source (degree 1).
        let backward = AttractionScoring.score(&sample(1.0, false), &params);
        assert_eq!(backward, Force::new(1.5, 2.0));
    }

    #[test]
    fn test_scoring_is_repeatable() {
        let params = PhysicsParams::default();
        let s = sample(1.25, false);
        assert_eq!(AttractionScoring.score(&s, &params), AttractionScoring.score(&s, &params));
    }
}

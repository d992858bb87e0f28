//! Work sizing and the cross-group stitch worklist of the segmented reduce.

use crate::backend::KernelStage;
use crate::topology::EdgeList;
use crate::{EdgeForceError, Result, WorkItem};

/// Largest workgroup accepted by the kernels (wgpu default limit).
pub const MAX_WORKGROUP_SIZE: u32 = 256;

/// Largest number of workgroups per dispatch dimension.
pub const MAX_WORKGROUPS: u32 = 65_535;

/// Global / local work size of one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelWorkSize {
    pub global: u32,
    pub local: u32,
}

impl KernelWorkSize {
    pub fn new(global: u32, local: u32) -> Self {
        Self { global, local }
    }

    /// Number of workgroups dispatched.
    pub fn workgroups(&self) -> u32 {
        if self.local == 0 {
            0
        } else {
            self.global / self.local
        }
    }

    pub(crate) fn validate(&self, stage: KernelStage) -> Result<()> {
        let valid = self.local > 0
            && self.local <= MAX_WORKGROUP_SIZE
            && self.global >= self.local
            && self.global % self.local == 0
            && self.workgroups() <= MAX_WORKGROUPS;
        if valid {
            Ok(())
        } else {
            Err(EdgeForceError::InvalidWorkSize {
                stage,
                global: self.global,
                local: self.local,
            })
        }
    }
}

/// Work sizes of both kernels.
///
/// The seg-reduce local size doubles as the chunk length: every workgroup
/// reduces `local` consecutive edges at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItemSizing {
    pub edge_map: KernelWorkSize,
    pub seg_reduce: KernelWorkSize,
}

impl WorkItemSizing {
    /// Chunk length of the segmented reduce.
    pub fn group_size(&self) -> u32 {
        self.seg_reduce.local
    }

    /// Default sizing with a different reduce group size.
    pub fn with_group_size(group_size: u32) -> Self {
        Self {
            seg_reduce: KernelWorkSize::new(group_size.saturating_mul(64), group_size),
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.edge_map.validate(KernelStage::MapEdges)?;
        self.seg_reduce.validate(KernelStage::SegReduce)
    }
}

impl Default for WorkItemSizing {
    fn default() -> Self {
        Self {
            edge_map: KernelWorkSize::new(256 * 64, 256),
            seg_reduce: KernelWorkSize::new(256 * 64, 256),
        }
    }
}

/// Stitch worklist for one edge ordering at one group size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPlan {
    group_size: u32,
    num_groups: u32,
    items: Vec<WorkItem>,
}

impl WorkPlan {
    /// Find every point whose segment crosses a chunk boundary.
    pub fn build(edges: &EdgeList, group_size: u32) -> Self {
        let group_size = group_size.max(1);
        let items = edges
            .start_end()
            .iter()
            .enumerate()
            .filter(|(_, range)| !range.is_empty())
            .filter_map(|(point, range)| {
                let first_group = range.start / group_size;
                let last_group = (range.end - 1) / group_size;
                (first_group != last_group).then_some(WorkItem {
                    point: point as u32,
                    last_group,
                })
            })
            .collect();

        Self {
            group_size,
            num_groups: Self::num_groups(edges.len() as u32, group_size),
            items,
        }
    }

    /// Chunks needed to cover `num_edges`.
    pub fn num_groups(num_edges: u32, group_size: u32) -> u32 {
        num_edges.div_ceil(group_size.max(1))
    }

    /// Entries in the carry-out table: one per group plus a sentinel.
    pub fn carry_entries(num_edges: u32, group_size: u32) -> u32 {
        1 + Self::num_groups(num_edges, group_size)
    }

    pub fn group_size(&self) -> u32 {
        self.group_size
    }

    pub fn groups(&self) -> u32 {
        self.num_groups
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Direction, Topology};

    fn hub_topology() -> Topology {
        // Point 0 owns five forward edges, point 1 owns one.
        Topology::from_edges(
            3,
            &[
                (0, 1, 1.0),
                (0, 2, 1.0),
                (0, 1, 1.0),
                (0, 2, 1.0),
                (0, 1, 1.0),
                (1, 2, 1.0),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_plan_lists_spanning_segments_only() {
        let topology = hub_topology();
        let plan = WorkPlan::build(topology.edges(Direction::Forward), 2);

        assert_eq!(plan.groups(), 3);
        assert_eq!(plan.items(), &[WorkItem { point: 0, last_group: 2 }]);
    }

    #[test]
    fn test_plan_empty_when_group_covers_everything() {
        let topology = hub_topology();
        let plan = WorkPlan::build(topology.edges(Direction::Forward), 256);
        assert_eq!(plan.groups(), 1);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_unit_groups_stitch_every_multi_edge_segment() {
        let topology = hub_topology();
        let plan = WorkPlan::build(topology.edges(Direction::Backward), 1);
        // Backward: point 1 has edges 0..3, point 2 has edges 3..6.
        assert_eq!(
            plan.items(),
            &[
                WorkItem { point: 1, last_group: 2 },
                WorkItem { point: 2, last_group: 5 },
            ]
        );
    }

    #[test]
    fn test_carry_entries() {
        assert_eq!(WorkPlan::carry_entries(0, 256), 1);
        assert_eq!(WorkPlan::carry_entries(5, 256), 2);
        assert_eq!(WorkPlan::carry_entries(513, 256), 4);
    }

    #[test]
    fn test_work_size_validation() {
        assert!(KernelWorkSize::new(512, 256).validate(KernelStage::MapEdges).is_ok());
        assert!(KernelWorkSize::new(500, 256).validate(KernelStage::MapEdges).is_err());
        assert!(KernelWorkSize::new(0, 0).validate(KernelStage::SegReduce).is_err());
        assert!(KernelWorkSize::new(1024, 512).validate(KernelStage::SegReduce).is_err());
    }

    #[test]
    fn test_oversized_group_is_rejected_not_wrapped() {
        let sizing = WorkItemSizing::with_group_size(u32::MAX);
        assert_eq!(sizing.seg_reduce.global, u32::MAX);
        assert!(matches!(
            sizing.validate(),
            Err(EdgeForceError::InvalidWorkSize {
                stage: KernelStage::SegReduce,
                ..
            })
        ));

        let sizing = WorkItemSizing::with_group_size(1 << 27);
        assert!(sizing.validate().is_err());
        assert_eq!(WorkItemSizing::with_group_size(64).seg_reduce.global, 4096);
    }
}

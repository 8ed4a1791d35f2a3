//! The 4-wide BVH, collapsed from the binary BVH by greedy grandchild
//! adoption.

use crate::aabb::Aabb;
use crate::bvh2::{Bvh2, NodeRef2};
use crate::{Point3, Real};

/// Slot marker for "nothing here".
pub const QBVH_SLOT_UNUSED: i32 = -1;

/// A node of the 4-wide BVH, 128 bytes in its on-disk form. The four child
/// boxes are stored structure-of-arrays so one ray can be tested against
/// all four with straight-line code.
///
/// Slot `i` means: `count[i] == -1` unused, `count[i] == 0` internal child
/// at node `index[i]`, `count[i] > 0` leaf covering `count[i]` entries of
/// the primitive table starting at `index[i]`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BvhNode4 {
    /// Minimum x of each child box.
    pub aabb_min_x: [Real; 4],
    /// Minimum y of each child box.
    pub aabb_min_y: [Real; 4],
    /// Minimum z of each child box.
    pub aabb_min_z: [Real; 4],
    /// Maximum x of each child box.
    pub aabb_max_x: [Real; 4],
    /// Maximum y of each child box.
    pub aabb_max_y: [Real; 4],
    /// Maximum z of each child box.
    pub aabb_max_z: [Real; 4],
    /// Child node index or first primitive-table entry, per slot.
    pub index: [i32; 4],
    /// Slot tag: unused / internal / leaf primitive count.
    pub count: [i32; 4],
}

impl BvhNode4 {
    /// A node with all four slots unused. Unused slots carry the empty-box
    /// sentinel so a slab test can never report them hit.
    pub fn unused() -> BvhNode4 {
        BvhNode4 {
            aabb_min_x: [Real::INFINITY; 4],
            aabb_min_y: [Real::INFINITY; 4],
            aabb_min_z: [Real::INFINITY; 4],
            aabb_max_x: [Real::NEG_INFINITY; 4],
            aabb_max_y: [Real::NEG_INFINITY; 4],
            aabb_max_z: [Real::NEG_INFINITY; 4],
            index: [QBVH_SLOT_UNUSED; 4],
            count: [QBVH_SLOT_UNUSED; 4],
        }
    }

    /// Writes `aabb` into slot `i`.
    pub fn set_aabb(&mut self, i: usize, aabb: &Aabb) {
        self.aabb_min_x[i] = aabb.min.x;
        self.aabb_min_y[i] = aabb.min.y;
        self.aabb_min_z[i] = aabb.min.z;
        self.aabb_max_x[i] = aabb.max.x;
        self.aabb_max_y[i] = aabb.max.y;
        self.aabb_max_z[i] = aabb.max.z;
    }

    /// Reads the box of slot `i`.
    pub fn aabb(&self, i: usize) -> Aabb {
        Aabb::with_bounds(
            Point3::new(self.aabb_min_x[i], self.aabb_min_y[i], self.aabb_min_z[i]),
            Point3::new(self.aabb_max_x[i], self.aabb_max_y[i], self.aabb_max_z[i]),
        )
    }

    /// Copies slot `from` of `source` into slot `to` of `self`.
    fn copy_slot(&mut self, to: usize, source: &BvhNode4, from: usize) {
        self.aabb_min_x[to] = source.aabb_min_x[from];
        self.aabb_min_y[to] = source.aabb_min_y[from];
        self.aabb_min_z[to] = source.aabb_min_z[from];
        self.aabb_max_x[to] = source.aabb_max_x[from];
        self.aabb_max_y[to] = source.aabb_max_y[from];
        self.aabb_max_z[to] = source.aabb_max_z[from];
        self.index[to] = source.index[from];
        self.count[to] = source.count[from];
    }

    /// Returns true if slot `i` is a leaf.
    pub fn is_leaf(&self, i: usize) -> bool {
        self.count[i] > 0
    }

    /// The number of used slots; used slots always come first.
    pub fn child_count(&self) -> usize {
        self.count
            .iter()
            .position(|&c| c == QBVH_SLOT_UNUSED)
            .unwrap_or(4)
    }

    /// Surface area of the box in slot `i`, halved. Only used to rank
    /// adoption candidates, where the factor of two cancels.
    fn half_area(&self, i: usize) -> Real {
        let dx = self.aabb_max_x[i] - self.aabb_min_x[i];
        let dy = self.aabb_max_y[i] - self.aabb_min_y[i];
        let dz = self.aabb_max_z[i] - self.aabb_min_z[i];
        dx * dy + dy * dz + dz * dx
    }
}

/// The 4-wide BVH. Nodes keep the indices of the binary input, so node `i`
/// here describes the children of binary node `i`; slot 1 is the bootstrap
/// node whose first slot points at the root.
#[derive(Debug, Clone)]
pub struct Qbvh {
    /// The nodes, root at index 0.
    pub nodes: Vec<BvhNode4>,

    /// Primitive indices, shared layout with the binary input.
    pub indices: Vec<u32>,
}

impl Qbvh {
    /// The bounds of the whole tree.
    pub fn root_aabb(&self) -> Aabb {
        let root = &self.nodes[0];
        let mut aabb = Aabb::empty();
        for i in 0..root.child_count() {
            aabb.join_mut(&root.aabb(i));
        }
        aabb
    }

    /// Collapses a binary BVH into a 4-wide one.
    ///
    /// Every binary internal node first receives its two children; then,
    /// while the arity budget permits, the internal child with the largest
    /// surface area is removed and replaced by its own children. Between 2
    /// and 4 slots end up used on every reachable node.
    pub fn from_bvh2(bvh: &Bvh2) -> Qbvh {
        let mut nodes = vec![BvhNode4::unused(); bvh.nodes.len().max(2)];

        // Slot 0 of node 1 bootstraps traversal by pointing at the root;
        // the slot is free because binary sibling pairs start at index 2.
        nodes[1].index[0] = 0;
        nodes[1].count[0] = 0;

        for (i, node) in bvh.nodes.iter().enumerate() {
            if i == 1 {
                continue;
            }
            if let NodeRef2::Internal { left, .. } = node.decode() {
                let child_left = &bvh.nodes[left as usize];
                let child_right = &bvh.nodes[left as usize + 1];

                nodes[i].set_aabb(0, &child_left.aabb);
                nodes[i].set_aabb(1, &child_right.aabb);

                for (slot, (child, child_index)) in
                    [(child_left, left), (child_right, left + 1)].iter().enumerate()
                {
                    match child.decode() {
                        NodeRef2::Leaf { first, count } => {
                            nodes[i].index[slot] = first as i32;
                            nodes[i].count[slot] = count as i32;
                        }
                        NodeRef2::Internal { .. } => {
                            nodes[i].index[slot] = *child_index as i32;
                            nodes[i].count[slot] = 0;
                        }
                    }
                }
            }
        }

        let mut qbvh = Qbvh {
            nodes,
            indices: bvh.indices.clone(),
        };

        match bvh.nodes[0].decode() {
            // A single-leaf tree cannot adopt anything; node 0 simply
            // carries the root leaf in its first slot.
            NodeRef2::Leaf { first, count } => {
                qbvh.nodes[0].set_aabb(0, &bvh.nodes[0].aabb);
                qbvh.nodes[0].index[0] = first as i32;
                qbvh.nodes[0].count[0] = count as i32;
            }
            NodeRef2::Internal { .. } => qbvh.collapse(0),
        }

        qbvh
    }

    /// Greedy adoption, iteratively from `root_index` downward.
    fn collapse(&mut self, root_index: usize) {
        let mut worklist = vec![root_index];

        while let Some(node_index) = worklist.pop() {
            loop {
                let node = &self.nodes[node_index];
                let child_count = node.child_count();

                // Look for an adoptable internal child with the largest
                // surface area.
                let mut max_area = Real::NEG_INFINITY;
                let mut max_slot = None;
                for i in 0..child_count {
                    if !node.is_leaf(i) {
                        let grandchildren =
                            self.nodes[node.index[i] as usize].child_count();
                        if child_count + grandchildren - 1 <= 4 {
                            let half_area = node.half_area(i);
                            if half_area > max_area {
                                max_area = half_area;
                                max_slot = Some(i);
                            }
                        }
                    }
                }

                let Some(slot) = max_slot else {
                    break;
                };

                let child = self.nodes[self.nodes[node_index].index[slot] as usize];
                let child_count = self.nodes[node_index].child_count();
                let grandchildren = child.child_count();

                // The adopted child's first grandchild replaces it; the
                // rest are appended after the node's own children.
                self.nodes[node_index].copy_slot(slot, &child, 0);
                for i in 1..grandchildren {
                    self.nodes[node_index].copy_slot(child_count + i - 1, &child, i);
                }
            }

            let node = &self.nodes[node_index];
            for i in 0..node.child_count() {
                if !node.is_leaf(i) {
                    worklist.push(node.index[i] as usize);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Qbvh;
    use crate::build::BuildConfig;
    use crate::bvh2::Bvh2;
    use crate::testbase::random_triangles;
    use crate::shapes::Triangle;
    use crate::Point3;

    #[test]
    fn test_nodes_have_two_to_four_children() {
        let triangles = random_triangles(256, 20.0, 0xabc);
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();
        let qbvh = Qbvh::from_bvh2(&bvh);

        let mut worklist = vec![0usize];
        while let Some(index) = worklist.pop() {
            let node = &qbvh.nodes[index];
            let children = node.child_count();
            assert!((2..=4).contains(&children), "node {index} has {children}");

            // Used slots precede unused slots.
            for i in children..4 {
                assert_eq!(node.count[i], super::QBVH_SLOT_UNUSED);
            }

            for i in 0..children {
                if !node.is_leaf(i) {
                    worklist.push(node.index[i] as usize);
                }
            }
        }
    }

    #[test]
    fn test_children_stay_inside_parents() {
        let triangles = random_triangles(128, 20.0, 0xdef);
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();
        let qbvh = Qbvh::from_bvh2(&bvh);

        let mut worklist = vec![(0usize, qbvh.root_aabb())];
        while let Some((index, bounds)) = worklist.pop() {
            let node = &qbvh.nodes[index];
            for i in 0..node.child_count() {
                let child_aabb = node.aabb(i);
                assert!(bounds.approx_contains_aabb_eps(&child_aabb, 1e-4));
                if !node.is_leaf(i) {
                    worklist.push((node.index[i] as usize, child_aabb));
                }
            }
        }
    }

    #[test]
    fn test_leaves_cover_all_primitives() {
        let triangles = random_triangles(100, 10.0, 0x31);
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();
        let qbvh = Qbvh::from_bvh2(&bvh);

        let mut covered = vec![false; triangles.len()];
        let mut worklist = vec![0usize];
        while let Some(index) = worklist.pop() {
            let node = &qbvh.nodes[index];
            for i in 0..node.child_count() {
                if node.is_leaf(i) {
                    let first = node.index[i] as usize;
                    for entry in first..first + node.count[i] as usize {
                        covered[qbvh.indices[entry] as usize] = true;
                    }
                } else {
                    worklist.push(node.index[i] as usize);
                }
            }
        }
        assert!(covered.iter().all(|&c| c));
    }

    #[test]
    fn test_single_triangle_tree() {
        let triangles = vec![Triangle::new(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        )];
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();
        let qbvh = Qbvh::from_bvh2(&bvh);

        assert!(qbvh.nodes.len() >= 2);
        assert!(qbvh.nodes[0].is_leaf(0));
        assert_eq!(qbvh.nodes[0].count[0], 1);
        // The bootstrap slot still points at the root.
        assert_eq!(qbvh.nodes[1].index[0], 0);
        assert_eq!(qbvh.nodes[1].count[0], 0);
    }
}

//! Compression of a binary BVH into the 8-wide layout.
//!
//! Pass 1 runs a cost-annotated dynamic program over the binary tree that
//! decides, for every node and slot budget, whether the subtree becomes a
//! leaf, an inner 8-wide node, or is distributed across its parent's
//! slots (Ylitie et al. 2017). Pass 2 emits the quantised nodes, ordering
//! the children of each node so that traversal by highest hit-mask bit is
//! front-to-back for every ray octant.

use crate::aabb::Aabb;
use crate::bvh2::{Bvh2, NodeRef2};
use crate::cwbvh::{BvhNode8, CwBvh};
use crate::{Real, Vector3};

/// Leaves of one 8-wide slot hold at most three triangles; the unary count
/// in `meta` has three bits.
const MAX_PRIMITIVES_PER_SLOT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum DecisionKind {
    Undetermined,
    Leaf,
    Internal,
    Distribute,
}

/// One entry of the per-node policy table: what the subtree does when it
/// is granted `slots + 1` child slots.
#[derive(Debug, Clone, Copy)]
struct Decision {
    kind: DecisionKind,
    distribute_left: i8,
    distribute_right: i8,
}

impl Decision {
    fn undetermined() -> Decision {
        Decision {
            kind: DecisionKind::Undetermined,
            distribute_left: -1,
            distribute_right: -1,
        }
    }
}

struct Compressor<'a> {
    bvh: &'a Bvh2,
    cost: Vec<Real>,
    decisions: Vec<Decision>,
    num_primitives: Vec<u32>,
}

impl CwBvh {
    /// Compresses a binary BVH into the 8-wide layout.
    ///
    /// The input must have single-primitive leaves; the compression pass
    /// regroups primitives into 8-wide leaf slots itself.
    pub fn from_bvh2(bvh: &Bvh2) -> CwBvh {
        let mut compressor = Compressor {
            bvh,
            cost: vec![0.0; bvh.nodes.len() * 7],
            decisions: vec![Decision::undetermined(); bvh.nodes.len() * 7],
            num_primitives: vec![0; bvh.nodes.len()],
        };
        compressor.compute_decisions();
        compressor.emit()
    }
}

impl Compressor<'_> {
    /// Pass 1. Children are always allocated after their parent, so a
    /// reverse index scan visits them first and no recursion is needed.
    fn compute_decisions(&mut self) {
        for node_index in (0..self.bvh.nodes.len()).rev() {
            if node_index == 1 {
                // The spare sibling slot is not part of the tree.
                continue;
            }
            let node = &self.bvh.nodes[node_index];
            let area = node.aabb.surface_area();

            match node.decode() {
                NodeRef2::Leaf { count, .. } => {
                    debug_assert_eq!(count, 1, "8-wide compression needs single-primitive leaves");
                    self.num_primitives[node_index] = count;

                    let cost_leaf = area * count as Real;
                    for slots in 0..7 {
                        self.cost[node_index * 7 + slots] = cost_leaf;
                        self.decisions[node_index * 7 + slots] = Decision {
                            kind: DecisionKind::Leaf,
                            distribute_left: -1,
                            distribute_right: -1,
                        };
                    }
                }
                NodeRef2::Internal { left, .. } => {
                    let left = left as usize;
                    let right = left + 1;
                    let num_primitives =
                        self.num_primitives[left] + self.num_primitives[right];
                    self.num_primitives[node_index] = num_primitives;

                    // Budget of one slot: the subtree is either a leaf or a
                    // full inner node distributing over all eight slots.
                    {
                        let cost_leaf = if num_primitives <= MAX_PRIMITIVES_PER_SLOT {
                            area * num_primitives as Real
                        } else {
                            Real::INFINITY
                        };

                        let mut cost_distribute = Real::INFINITY;
                        let mut distribute_left = -1i8;
                        let mut distribute_right = -1i8;
                        for k in 0..7 {
                            let c = self.cost[left * 7 + k] + self.cost[right * 7 + 6 - k];
                            if c < cost_distribute {
                                cost_distribute = c;
                                distribute_left = k as i8;
                                distribute_right = (6 - k) as i8;
                            }
                        }
                        let cost_internal = cost_distribute + area;

                        if cost_leaf < cost_internal {
                            self.cost[node_index * 7] = cost_leaf;
                            self.decisions[node_index * 7] = Decision {
                                kind: DecisionKind::Leaf,
                                distribute_left: -1,
                                distribute_right: -1,
                            };
                        } else {
                            self.cost[node_index * 7] = cost_internal;
                            self.decisions[node_index * 7] = Decision {
                                kind: DecisionKind::Internal,
                                distribute_left,
                                distribute_right,
                            };
                        }
                    }

                    // Wider budgets: either distribute across the slots or
                    // keep the best narrower answer.
                    for slots in 1..7 {
                        let mut best = self.cost[node_index * 7 + slots - 1];
                        let mut decision = self.decisions[node_index * 7 + slots - 1];
                        for k in 0..slots {
                            let c =
                                self.cost[left * 7 + k] + self.cost[right * 7 + slots - k - 1];
                            if c < best {
                                best = c;
                                decision = Decision {
                                    kind: DecisionKind::Distribute,
                                    distribute_left: k as i8,
                                    distribute_right: (slots - k - 1) as i8,
                                };
                            }
                        }
                        self.cost[node_index * 7 + slots] = best;
                        self.decisions[node_index * 7 + slots] = decision;
                    }
                }
            }
        }
    }

    /// Collects the up-to-eight binary subtrees that become the children of
    /// the 8-wide node rooted at `node_index`, following the recorded
    /// distribute chains.
    fn get_children(&self, node_index: usize, slots: usize, children: &mut Vec<usize>) {
        let node = &self.bvh.nodes[node_index];
        if node.is_leaf() {
            children.push(node_index);
            return;
        }

        let decision = self.decisions[node_index * 7 + slots];
        let NodeRef2::Internal { left, .. } = node.decode() else {
            unreachable!()
        };
        let left = left as usize;
        let right = left + 1;

        for (child, budget) in [
            (left, decision.distribute_left),
            (right, decision.distribute_right),
        ] {
            debug_assert!(budget >= 0);
            let budget = budget as usize;
            if self.decisions[child * 7 + budget].kind == DecisionKind::Distribute {
                self.get_children(child, budget, children);
            } else {
                children.push(child);
            }
        }
    }

    /// Assigns children to the eight slots so that XOR-ing the slot index
    /// with a ray octant orders them roughly front to back: slot `s` is
    /// preferred by the child whose centroid lies furthest along the
    /// direction that octant `s` rays travel. Greedy assignment over the
    /// 8x8 cost table.
    fn order_children(&self, node_index: usize, children: &[usize]) -> [Option<usize>; 8] {
        let parent_center = self.bvh.nodes[node_index].aabb.center();

        let mut cost = [[0.0 as Real; 8]; 8];
        for (c, &child) in children.iter().enumerate() {
            let offset = self.bvh.nodes[child].aabb.center() - parent_center;
            for (s, cost_slot) in cost[c].iter_mut().enumerate() {
                let direction = Vector3::new(
                    if s & 0b100 != 0 { -1.0 } else { 1.0 },
                    if s & 0b010 != 0 { -1.0 } else { 1.0 },
                    if s & 0b001 != 0 { -1.0 } else { 1.0 },
                );
                *cost_slot = offset.dot(&direction);
            }
        }

        let mut assignment = [None::<usize>; 8];
        let mut child_assigned = [false; 8];
        loop {
            let mut best = Real::INFINITY;
            let mut best_pair = None;
            for (c, _) in children.iter().enumerate() {
                if child_assigned[c] {
                    continue;
                }
                for (s, slot) in assignment.iter().enumerate() {
                    if slot.is_none() && cost[c][s] < best {
                        best = cost[c][s];
                        best_pair = Some((c, s));
                    }
                }
            }
            let Some((c, s)) = best_pair else {
                break;
            };
            child_assigned[c] = true;
            assignment[s] = Some(children[c]);
        }

        assignment
    }

    /// Appends the primitive indices of the whole subtree under
    /// `node_index` to `indices`, returning how many were appended.
    fn collect_primitives(&self, node_index: usize, indices: &mut Vec<u32>) -> u32 {
        match self.bvh.nodes[node_index].decode() {
            NodeRef2::Leaf { first, count } => {
                indices.extend_from_slice(
                    &self.bvh.indices[first as usize..(first + count) as usize],
                );
                count
            }
            NodeRef2::Internal { left, .. } => {
                self.collect_primitives(left as usize, indices)
                    + self.collect_primitives(left as usize + 1, indices)
            }
        }
    }

    /// Pass 2: emit the 8-wide nodes. Inner children of a node occupy a
    /// contiguous run starting at its `base_index_child`, in slot order, so
    /// traversal can address them by popcount.
    fn emit(&self) -> CwBvh {
        let mut nodes = vec![BvhNode8::default()];
        let mut indices = Vec::with_capacity(self.bvh.indices.len());
        let mut worklist: Vec<(usize, usize)> = vec![(0, 0)];

        while let Some((bvh2_index, node8_index)) = worklist.pop() {
            let aabb = self.bvh.nodes[bvh2_index].aabb;

            let mut children = Vec::with_capacity(8);
            if self.decisions[bvh2_index * 7].kind == DecisionKind::Leaf {
                // The whole subtree fits one leaf slot; only the root can
                // end up here, smaller subtrees are inlined by parents.
                children.push(bvh2_index);
            } else {
                self.get_children(bvh2_index, 0, &mut children);
            }
            debug_assert!(children.len() <= 8);

            let assignment = self.order_children(bvh2_index, &children);

            let mut node = BvhNode8 {
                p: aabb.min,
                e: [
                    grid_exponent(aabb.max.x - aabb.min.x),
                    grid_exponent(aabb.max.y - aabb.min.y),
                    grid_exponent(aabb.max.z - aabb.min.z),
                ],
                base_index_child: nodes.len() as u32,
                base_index_triangle: indices.len() as u32,
                ..BvhNode8::default()
            };

            let one_over_step = Vector3::new(
                1.0 / Real::from_bits((node.e[0] as u32) << 23),
                1.0 / Real::from_bits((node.e[1] as u32) << 23),
                1.0 / Real::from_bits((node.e[2] as u32) << 23),
            );

            let mut num_triangles = 0u32;
            let mut inner_children = Vec::with_capacity(8);

            for (slot, &child) in assignment.iter().enumerate() {
                let Some(child) = child else {
                    continue;
                };

                quantize_slot(&mut node, slot, &self.bvh.nodes[child].aabb, &one_over_step);

                match self.decisions[child * 7].kind {
                    DecisionKind::Leaf => {
                        let count = self.collect_primitives(child, &mut indices);
                        debug_assert!(count <= MAX_PRIMITIVES_PER_SLOT);
                        // Unary count in the high bits, slot offset below.
                        for j in 0..count {
                            node.meta[slot] |= 1 << (j + 5);
                        }
                        node.meta[slot] |= num_triangles as u8;
                        num_triangles += count;
                        debug_assert!(num_triangles <= 24);
                    }
                    DecisionKind::Internal => {
                        node.imask |= 1 << slot;
                        node.meta[slot] = 0b0010_0000 | (24 + slot as u8);
                        inner_children.push(child);
                    }
                    kind => unreachable!("child emitted with decision {kind:?}"),
                }
            }

            // Inner children occupy base..base+n in slot order; pushing
            // them reversed makes the stack pop them in slot order, which
            // keeps the triangle table in depth-first leaf order.
            let base = nodes.len();
            nodes.resize(base + inner_children.len(), BvhNode8::default());
            for (offset, &child) in inner_children.iter().enumerate().rev() {
                worklist.push((child, base + offset));
            }

            nodes[node8_index] = node;
        }

        CwBvh { nodes, indices }
    }
}

/// The biased-exponent byte of the smallest power of two that spans
/// `extent` in 255 quantisation steps.
fn grid_exponent(extent: Real) -> u8 {
    let extent = extent.max(Real::MIN_POSITIVE);
    let step = (extent / 255.0).log2().ceil().exp2();
    let bits = step.to_bits();
    debug_assert_eq!(bits & 0x007f_ffff, 0, "grid step must be a power of two");
    (bits >> 23) as u8
}

/// Quantises `aabb` into byte coordinates on the node's grid, rounding
/// outward so the stored box always contains the exact one.
fn quantize_slot(node: &mut BvhNode8, slot: usize, aabb: &Aabb, one_over_step: &Vector3) {
    let p = node.p;
    let quantize_min =
        |v: Real, p: Real, inv: Real| ((v - p) * inv).floor().clamp(0.0, 255.0) as u8;
    let quantize_max =
        |v: Real, p: Real, inv: Real| ((v - p) * inv).ceil().clamp(0.0, 255.0) as u8;

    node.quantized_min_x[slot] = quantize_min(aabb.min.x, p.x, one_over_step.x);
    node.quantized_min_y[slot] = quantize_min(aabb.min.y, p.y, one_over_step.y);
    node.quantized_min_z[slot] = quantize_min(aabb.min.z, p.z, one_over_step.z);
    node.quantized_max_x[slot] = quantize_max(aabb.max.x, p.x, one_over_step.x);
    node.quantized_max_y[slot] = quantize_max(aabb.max.y, p.y, one_over_step.y);
    node.quantized_max_z[slot] = quantize_max(aabb.max.z, p.z, one_over_step.z);
}

#[cfg(test)]
mod tests {
    use super::grid_exponent;
    use crate::build::BuildConfig;
    use crate::bvh2::Bvh2;
    use crate::cwbvh::CwBvh;
    use crate::testbase::random_triangles;
    use crate::Real;

    #[test]
    fn test_grid_exponent_spans_extent() {
        for extent in [0.001, 0.5, 1.0, 100.0, 12345.0] {
            let e = grid_exponent(extent);
            let step = Real::from_bits((e as u32) << 23);
            assert!(step * 255.0 >= extent, "step {step} too small for {extent}");
            assert!(step * 255.0 / 2.0 < extent, "step {step} too coarse for {extent}");
        }
    }

    #[test]
    fn test_indices_cover_input() {
        let triangles = random_triangles(150, 25.0, 0xcafe);
        let config = BuildConfig {
            max_primitives_in_leaf: 1,
            ..BuildConfig::default()
        };
        let bvh2 = Bvh2::build(&triangles, &config).unwrap();
        let cwbvh = CwBvh::from_bvh2(&bvh2);

        let mut seen = cwbvh.indices.clone();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..triangles.len() as u32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_leaf_slots_merge_small_subtrees() {
        // With unit costs the DP should pack most primitives into multi-
        // triangle leaf slots rather than one node per triangle.
        let triangles = random_triangles(64, 10.0, 0x99);
        let config = BuildConfig {
            max_primitives_in_leaf: 1,
            ..BuildConfig::default()
        };
        let bvh2 = Bvh2::build(&triangles, &config).unwrap();
        let cwbvh = CwBvh::from_bvh2(&bvh2);

        // Strictly fewer wide nodes than binary nodes.
        assert!(cwbvh.nodes.len() < bvh2.nodes.len() / 2);
    }
}

use crate::aabb::Aabb;
use crate::axis::Axis;

/// Mask of the two high bits of the packed count word, which carry the
/// split axis of an internal node.
const AXIS_MASK: u32 = 0b11 << 30;

/// A node of a binary BVH, 32 bytes in its on-disk form.
///
/// The node is internal or a leaf. For an internal node `index` is the
/// position of its left child; the right child is always stored directly
/// after it at `index + 1`. For a leaf `index` is the offset of the node's
/// first entry in the BVH's primitive index table. The packed `meta` word
/// holds the primitive count in its low 30 bits (zero for internal nodes)
/// and the split axis in its high two bits, so `is_leaf` is a single mask
/// test. The packing is private; [`BvhNode2::decode`] exposes a tagged view.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BvhNode2 {
    /// The bounds of everything below this node.
    pub aabb: Aabb,
    index: u32,
    meta: u32,
}

/// The decoded view of a [`BvhNode2`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeRef2 {
    /// An internal node with two children at `left` and `left + 1`.
    Internal {
        /// Index of the left child; the right child is at `left + 1`.
        left: u32,
        /// The axis the node's range was split along.
        axis: Axis,
    },
    /// A leaf node covering `count` entries of the primitive index table.
    Leaf {
        /// Offset of the first entry in the primitive index table.
        first: u32,
        /// Number of entries; always at least 1.
        count: u32,
    },
}

impl BvhNode2 {
    /// Creates a leaf node over `count` primitive table entries starting at
    /// `first`.
    pub fn new_leaf(aabb: Aabb, first: u32, count: u32) -> BvhNode2 {
        debug_assert!(count > 0 && count & AXIS_MASK == 0);
        BvhNode2 {
            aabb,
            index: first,
            meta: count,
        }
    }

    /// Creates an internal node whose children live at `left` and `left+1`,
    /// recording the axis the range was split along.
    pub fn new_internal(aabb: Aabb, left: u32, axis: Axis) -> BvhNode2 {
        BvhNode2 {
            aabb,
            index: left,
            meta: (axis as u32 + 1) << 30,
        }
    }

    /// Filler for never-visited slots of the node array.
    pub(crate) fn unused() -> BvhNode2 {
        BvhNode2 {
            aabb: Aabb::empty(),
            index: 0,
            meta: 0,
        }
    }

    /// Returns true if this node is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.meta & !AXIS_MASK > 0
    }

    /// Decodes the packed node into its tagged view.
    ///
    /// # Panics
    /// Panics when called on an unused filler slot.
    pub fn decode(&self) -> NodeRef2 {
        let count = self.meta & !AXIS_MASK;
        if count > 0 {
            NodeRef2::Leaf {
                first: self.index,
                count,
            }
        } else {
            let axis_bits = (self.meta >> 30) as usize;
            assert!(axis_bits > 0, "decoded an unused BVH node slot");
            NodeRef2::Internal {
                left: self.index,
                axis: Axis::from_index(axis_bits - 1),
            }
        }
    }

    /// The raw packed words, for the cache serialisation layer.
    pub(crate) fn raw_parts(&self) -> (Aabb, u32, u32) {
        (self.aabb, self.index, self.meta)
    }

    /// Reassembles a node from its raw packed words.
    pub(crate) fn from_raw_parts(aabb: Aabb, index: u32, meta: u32) -> BvhNode2 {
        BvhNode2 { aabb, index, meta }
    }
}

/// A binary BVH: a node array in depth-first order with the root at index
/// 0, plus the permuted primitive index table its leaves point into.
///
/// Index 1 of the node array is never referenced; children are allocated in
/// pairs starting at index 2 so that siblings share a cache line. The wide
/// collapse step reuses the spare slot as its bootstrap entry.
#[derive(Debug, Clone)]
pub struct Bvh2 {
    /// The nodes, root first.
    pub nodes: Vec<BvhNode2>,

    /// Primitive indices, grouped by leaf in left-to-right leaf order.
    /// Entries index the primitive slice the BVH was built over. A plain
    /// build yields a permutation of `0..n`; a spatial-split build may
    /// repeat indices.
    pub indices: Vec<u32>,
}

impl Bvh2 {
    /// The bounds of the whole tree.
    pub fn root_aabb(&self) -> Aabb {
        self.nodes[0].aabb
    }

    /// Collects the primitive indices of all leaves in left-to-right order.
    pub fn leaf_indices(&self) -> Vec<u32> {
        let mut result = Vec::with_capacity(self.indices.len());
        self.collect_leaf_indices(0, &mut result);
        result
    }

    fn collect_leaf_indices(&self, node_index: usize, out: &mut Vec<u32>) {
        match self.nodes[node_index].decode() {
            NodeRef2::Internal { left, .. } => {
                self.collect_leaf_indices(left as usize, out);
                self.collect_leaf_indices(left as usize + 1, out);
            }
            NodeRef2::Leaf { first, count } => {
                out.extend_from_slice(&self.indices[first as usize..(first + count) as usize]);
            }
        }
    }

    /// Checks that every node's [`Aabb`] contains the boxes of its
    /// descendants, allowing `epsilon` of slack.
    ///
    /// [`Aabb`]: ../aabb/struct.Aabb.html
    pub fn assert_consistent(&self, primitive_aabbs: &[Aabb], epsilon: f32) {
        self.assert_consistent_subtree(0, primitive_aabbs, epsilon);
    }

    fn assert_consistent_subtree(&self, node_index: usize, primitive_aabbs: &[Aabb], epsilon: f32) {
        let node = &self.nodes[node_index];
        match node.decode() {
            NodeRef2::Internal { left, .. } => {
                for child in [left, left + 1] {
                    let child_aabb = self.nodes[child as usize].aabb;
                    assert!(
                        node.aabb.approx_contains_aabb_eps(&child_aabb, epsilon),
                        "child {child} lies outside its parent {node_index}"
                    );
                    self.assert_consistent_subtree(child as usize, primitive_aabbs, epsilon);
                }
            }
            NodeRef2::Leaf { first, count } => {
                for i in first..first + count {
                    let primitive = self.indices[i as usize] as usize;
                    // Spatial splits clip references, so a primitive's full
                    // box may exceed the leaf; it must still intersect it.
                    let overlap = node.aabb.intersection(&primitive_aabbs[primitive]);
                    assert!(
                        overlap.min.x <= overlap.max.x
                            && overlap.min.y <= overlap.max.y
                            && overlap.min.z <= overlap.max.z,
                        "primitive {primitive} does not touch its leaf {node_index}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BvhNode2, NodeRef2};
    use crate::aabb::Aabb;
    use crate::axis::Axis;
    use crate::Point3;

    fn some_aabb() -> Aabb {
        Aabb::with_bounds(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 1.0, 1.0))
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = BvhNode2::new_leaf(some_aabb(), 42, 3);
        assert!(node.is_leaf());
        assert_eq!(
            node.decode(),
            NodeRef2::Leaf {
                first: 42,
                count: 3
            }
        );
    }

    #[test]
    fn test_internal_roundtrip() {
        for axis in Axis::ALL {
            let node = BvhNode2::new_internal(some_aabb(), 8, axis);
            assert!(!node.is_leaf());
            assert_eq!(node.decode(), NodeRef2::Internal { left: 8, axis });
        }
    }

    #[test]
    fn test_raw_roundtrip() {
        let node = BvhNode2::new_internal(some_aabb(), 6, Axis::Z);
        let (aabb, index, meta) = node.raw_parts();
        assert_eq!(BvhNode2::from_raw_parts(aabb, index, meta), node);
    }

    #[test]
    #[should_panic(expected = "unused")]
    fn test_decode_unused_panics() {
        BvhNode2::unused().decode();
    }
}

//! Top-down construction of the binary BVH with object splits.

use crate::aabb::Primitive;
use crate::build::{validate, BuildConfig};
use crate::bvh2::partition::{
    joint_aabb, partition_object, sort_ids_by_axis, split_ids, PrimitiveRef, SortedIds,
    SweepScratch,
};
use crate::bvh2::{Bvh2, BvhNode2};
use crate::error::BuildError;
use crate::Real;

/// One pending range of the explicit build stack. The recursion of the
/// textbook builder is replaced by this stack so pathological inputs
/// cannot overflow the call stack.
pub(crate) struct BuildFrame {
    pub node_index: u32,
    pub sorted: SortedIds,
}

/// Shared state of a binary build.
pub(crate) struct Builder<'a> {
    pub refs: Vec<PrimitiveRef>,
    pub nodes: Vec<BvhNode2>,
    pub indices: Vec<u32>,
    pub next_node: u32,
    pub sweep: SweepScratch,
    pub in_left: Vec<bool>,
    pub config: &'a BuildConfig,
}

impl<'a> Builder<'a> {
    pub fn new(refs: Vec<PrimitiveRef>, config: &'a BuildConfig) -> Builder<'a> {
        let n = refs.len();
        Builder {
            refs,
            // Children are allocated in pairs starting at slot 2, leaving
            // slot 1 unused; 2n bounds the node count for n references.
            nodes: vec![BvhNode2::unused(); 2 * n],
            indices: Vec::with_capacity(n),
            next_node: 2,
            sweep: SweepScratch::default(),
            in_left: vec![false; n],
            config,
        }
    }

    /// Emits a leaf over the frame's range. The range's ids are appended to
    /// the primitive table in x-order, so concatenating leaves left to
    /// right reproduces the reference order.
    pub fn emit_leaf(&mut self, frame: &BuildFrame, aabb: crate::aabb::Aabb) {
        let first = self.indices.len() as u32;
        let count = frame.sorted[0].len() as u32;
        let refs = &self.refs;
        self.indices
            .extend(frame.sorted[0].iter().map(|&id| refs[id as usize].index));
        self.nodes[frame.node_index as usize] = BvhNode2::new_leaf(aabb, first, count);
    }

    /// Allocates the next sibling pair.
    pub fn allocate_pair(&mut self) -> u32 {
        let left = self.next_node;
        self.next_node += 2;
        if self.nodes.len() < self.next_node as usize {
            self.nodes.resize(self.next_node as usize, BvhNode2::unused());
        }
        left
    }

    /// The SAH leaf-termination test: a range becomes a leaf when storing
    /// it outright is estimated cheaper than the best split. Only applies
    /// when the caller permits leaves with more than one primitive.
    pub fn should_terminate(&self, count: usize, area: Real, split_cost: Real) -> bool {
        if self.config.max_primitives_in_leaf <= 1 || count > self.config.max_primitives_in_leaf as usize {
            return false;
        }
        let leaf_cost = area * self.config.sah_cost_leaf * count as Real;
        let node_cost = area * self.config.sah_cost_node + split_cost;
        leaf_cost < node_cost
    }

    pub fn finish(mut self) -> Bvh2 {
        self.nodes.truncate(self.next_node as usize);
        Bvh2 {
            nodes: self.nodes,
            indices: self.indices,
        }
    }
}

impl Bvh2 {
    /// Builds a binary BVH over `primitives` using sweep-SAH object splits.
    ///
    /// # Errors
    /// Fails with [`BuildError::EmptyInput`] for an empty slice and
    /// [`BuildError::InvalidPrimitive`] for non-finite geometry.
    ///
    /// [`BuildError::EmptyInput`]: ../error/enum.BuildError.html
    /// [`BuildError::InvalidPrimitive`]: ../error/enum.BuildError.html
    pub fn build<P: Primitive>(primitives: &[P], config: &BuildConfig) -> Result<Bvh2, BuildError> {
        validate(primitives)?;

        let refs = PrimitiveRef::from_primitives(primitives);
        let ids = (0..refs.len() as u32).collect();
        let sorted = sort_ids_by_axis(&refs, ids);

        let mut builder = Builder::new(refs, config);
        let mut stack = vec![BuildFrame {
            node_index: 0,
            sorted,
        }];

        while let Some(frame) = stack.pop() {
            let count = frame.sorted[0].len();
            let aabb = joint_aabb(&builder.refs, &frame.sorted[0]);

            if count == 1 {
                builder.emit_leaf(&frame, aabb);
                continue;
            }

            let split = partition_object(&builder.refs, &frame.sorted, &mut builder.sweep);

            if builder.should_terminate(count, aabb.surface_area(), split.cost) {
                builder.emit_leaf(&frame, aabb);
                continue;
            }

            let left = builder.allocate_pair();
            builder.nodes[frame.node_index as usize] =
                BvhNode2::new_internal(aabb, left, split.axis);

            let (left_ids, right_ids) =
                split_ids(&frame.sorted, split.axis, split.index, &mut builder.in_left);

            // Push right first so the left child is processed (and its
            // descendants allocated) first, keeping depth-first order.
            stack.push(BuildFrame {
                node_index: left + 1,
                sorted: right_ids,
            });
            stack.push(BuildFrame {
                node_index: left,
                sorted: left_ids,
            });
        }

        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use crate::build::BuildConfig;
    use crate::bvh2::{Bvh2, NodeRef2};
    use crate::error::BuildError;
    use crate::shapes::Triangle;
    use crate::testbase::random_triangles;
    use crate::aabb::Bounded;
    use crate::Point3;

    fn single_primitive_config() -> BuildConfig {
        BuildConfig {
            max_primitives_in_leaf: 1,
            ..BuildConfig::default()
        }
    }

    #[test]
    fn test_build_empty_fails() {
        let result = Bvh2::build(&[] as &[Triangle], &BuildConfig::default());
        assert!(matches!(result, Err(BuildError::EmptyInput)));
    }

    #[test]
    fn test_build_single_triangle() {
        let triangles = vec![Triangle::new(
            Point3::new(0.0, 0.0, 1.0),
            Point3::new(1.0, 0.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        )];
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();

        // Root is a leaf; slot 1 stays unused.
        assert_eq!(bvh.nodes.len(), 2);
        assert!(matches!(
            bvh.nodes[0].decode(),
            NodeRef2::Leaf { first: 0, count: 1 }
        ));
        assert_eq!(bvh.indices, vec![0]);
    }

    #[test]
    fn test_indices_are_a_permutation() {
        let triangles = random_triangles(256, 20.0, 0x1234);
        let bvh = Bvh2::build(&triangles, &single_primitive_config()).unwrap();

        let mut seen = bvh.leaf_indices();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..triangles.len() as u32).collect();
        assert_eq!(seen, expected);

        // Leaf-order concatenation equals the stored table.
        assert_eq!(bvh.leaf_indices(), bvh.indices);
    }

    #[test]
    fn test_nodes_contain_descendants() {
        let triangles = random_triangles(256, 20.0, 0x4321);
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();

        let aabbs: Vec<_> = triangles.iter().map(|t| t.aabb()).collect();
        bvh.assert_consistent(&aabbs, 1e-4);
    }

    #[test]
    fn test_sibling_pairs_are_contiguous() {
        let triangles = random_triangles(128, 15.0, 0x9e);
        let bvh = Bvh2::build(&triangles, &BuildConfig::default()).unwrap();

        for node in &bvh.nodes[..1] {
            if let NodeRef2::Internal { left, .. } = node.decode() {
                assert!(left >= 2);
            }
        }
        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            if let NodeRef2::Internal { left, .. } = bvh.nodes[index as usize].decode() {
                // Children are a contiguous pair and allocated after the parent.
                assert!(left > index);
                assert!((left as usize + 1) < bvh.nodes.len());
                stack.push(left);
                stack.push(left + 1);
            }
        }
    }

    #[test]
    fn test_leaf_count_respects_limit() {
        let triangles = random_triangles(200, 20.0, 0x5c);
        let config = BuildConfig {
            max_primitives_in_leaf: 4,
            ..BuildConfig::default()
        };
        let bvh = Bvh2::build(&triangles, &config).unwrap();

        let mut stack = vec![0u32];
        while let Some(index) = stack.pop() {
            match bvh.nodes[index as usize].decode() {
                NodeRef2::Internal { left, .. } => {
                    stack.push(left);
                    stack.push(left + 1);
                }
                NodeRef2::Leaf { count, .. } => assert!(count <= 4),
            }
        }
    }
}

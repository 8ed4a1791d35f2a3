//! Top-down construction of the binary BVH with spatial splits (SBVH).
//!
//! Every node evaluates the best object split and, when the object split's
//! children overlap enough, a binned spatial split. The cheaper candidate
//! wins. A spatial split may cut a triangle reference in two, duplicating
//! it into both children with clipped boxes.

use crate::aabb::Aabb;
use crate::build::{validate, BuildConfig};
use crate::bvh2::builder::{BuildFrame, Builder};
use crate::bvh2::partition::{
    joint_aabb, partition_object, partition_spatial, resort_ids, sort_ids_by_axis, split_ids,
    split_reference, PrimitiveRef, SortedIds, SpatialScratch, SpatialSplit,
};
use crate::bvh2::{Bvh2, BvhNode2};
use crate::error::BuildError;
use crate::shapes::Triangle;

/// Where a reference of the current range goes after a spatial split.
#[derive(Clone, Copy)]
enum Fate {
    Left,
    Right,
    /// Duplicated: the original id becomes the left piece, the payload is
    /// the id of the freshly created right piece.
    Split(u32),
}

impl Bvh2 {
    /// Builds a binary BVH over `triangles` with spatial splits.
    ///
    /// Straddling references are clipped and duplicated, so the resulting
    /// primitive table is a multiset: each input index appears at least
    /// once.
    ///
    /// # Errors
    /// Fails with [`BuildError::EmptyInput`] for an empty slice and
    /// [`BuildError::InvalidPrimitive`] for non-finite geometry.
    ///
    /// [`BuildError::EmptyInput`]: ../error/enum.BuildError.html
    /// [`BuildError::InvalidPrimitive`]: ../error/enum.BuildError.html
    pub fn build_sbvh(triangles: &[Triangle], config: &BuildConfig) -> Result<Bvh2, BuildError> {
        validate(triangles)?;

        let refs = PrimitiveRef::from_primitives(triangles);
        let ids = (0..refs.len() as u32).collect();
        let sorted = sort_ids_by_axis(&refs, ids);

        let root_area = joint_aabb(&refs, &sorted[0]).surface_area();

        let mut builder = Builder::new(refs, config);
        let mut spatial_scratch = SpatialScratch::default();
        let mut fates: Vec<Fate> = Vec::new();

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

            builder.in_left.resize(builder.refs.len(), false);

            let object = partition_object(&builder.refs, &frame.sorted, &mut builder.sweep);

            // A spatial split can only pay off when the object split's
            // children overlap; the alpha gate keeps the expensive binning
            // off the common case.
            let overlap = object.aabb_left.intersection(&object.aabb_right);
            let overlap_area = if overlap.is_valid() {
                overlap.surface_area()
            } else {
                0.0
            };

            let spatial = if overlap_area > config.sbvh_alpha * root_area {
                partition_spatial(
                    triangles,
                    &builder.refs,
                    &frame.sorted[0],
                    &aabb,
                    &mut spatial_scratch,
                )
                .filter(|s| s.cost < object.cost)
                // A child matching the parent's reference count would not
                // shrink the recursion; such a split is never taken.
                .filter(|s| s.num_left < count && s.num_right < count)
            } else {
                None
            };

            let split_cost = spatial.map_or(object.cost, |s| s.cost);
            if builder.should_terminate(count, aabb.surface_area(), split_cost) {
                builder.emit_leaf(&frame, aabb);
                continue;
            }

            let spatial_children = spatial.and_then(|split| {
                distribute_spatial(&mut builder, triangles, &frame, &split, &mut fates)
                    .map(|children| (split.axis, children))
            });
            let (axis, (left_ids, right_ids)) = match spatial_children {
                Some(children) => children,
                // No (usable) spatial split; the object split always works.
                None => (
                    object.axis,
                    split_ids(
                        &frame.sorted,
                        object.axis,
                        object.index,
                        &mut builder.in_left,
                    ),
                ),
            };

            let left = builder.allocate_pair();
            builder.nodes[frame.node_index as usize] = BvhNode2::new_internal(aabb, left, axis);

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

/// Distributes the frame's references across a spatial split. References
/// entirely on one side move there unchanged; straddlers are clipped into
/// two pieces, one per side. Returns `None`, leaving the reference arena
/// untouched, when a side would end up empty or the recursion would not
/// shrink.
fn distribute_spatial(
    builder: &mut Builder,
    triangles: &[Triangle],
    frame: &BuildFrame,
    split: &SpatialSplit,
    fates: &mut Vec<Fate>,
) -> Option<(SortedIds, SortedIds)> {
    let count = frame.sorted[0].len();
    fates.resize(builder.refs.len(), Fate::Left);

    // Classify first without touching the arena, so an unusable split can
    // still fall back to the object split on unclipped references.
    let mut pieces: Vec<(u32, Aabb, Aabb)> = Vec::new();
    let mut num_left = 0usize;
    let mut num_right = 0usize;
    for &id in &frame.sorted[0] {
        let reference = builder.refs[id as usize];
        if reference.aabb.max[split.axis] <= split.plane {
            fates[id as usize] = Fate::Left;
            num_left += 1;
        } else if reference.aabb.min[split.axis] >= split.plane {
            fates[id as usize] = Fate::Right;
            num_right += 1;
        } else {
            let triangle = &triangles[reference.index as usize];
            let (left_aabb, right_aabb) =
                split_reference(triangle, &reference, split.axis, split.plane);
            pieces.push((id, left_aabb, right_aabb));
            num_left += 1;
            num_right += 1;
        }
    }

    if num_left == 0 || num_right == 0 || num_left >= count || num_right >= count {
        return None;
    }

    // Commit: the original id shrinks to the left piece, the right piece
    // is appended to the arena.
    for &(id, left_aabb, right_aabb) in &pieces {
        let index = builder.refs[id as usize].index;
        builder.refs[id as usize] = PrimitiveRef::new(index, left_aabb);
        let right_id = builder.refs.len() as u32;
        builder.refs.push(PrimitiveRef::new(index, right_aabb));
        fates[id as usize] = Fate::Split(right_id);
    }

    let mut left: SortedIds = Default::default();
    let mut right: SortedIds = Default::default();
    for axis in 0..3 {
        for &id in &frame.sorted[axis] {
            match fates[id as usize] {
                Fate::Left => left[axis].push(id),
                Fate::Right => right[axis].push(id),
                Fate::Split(right_id) => {
                    left[axis].push(id);
                    right[axis].push(right_id);
                }
            }
        }
    }

    // Clipping moved the piece centroids, restore the per-axis orders.
    resort_ids(&builder.refs, &mut left);
    resort_ids(&builder.refs, &mut right);

    Some((left, right))
}

#[cfg(test)]
mod tests {
    use crate::aabb::Bounded;
    use crate::build::BuildConfig;
    use crate::bvh2::Bvh2;
    use crate::shapes::Triangle;
    use crate::testbase::random_triangles;
    use crate::Point3;

    fn sbvh_config() -> BuildConfig {
        BuildConfig {
            max_primitives_in_leaf: 1,
            ..BuildConfig::default()
        }
    }

    /// A scene that provokes spatial splits: long skewers crossing a field
    /// of small triangles.
    fn skewered_scene() -> Vec<Triangle> {
        let mut triangles = random_triangles(64, 4.0, 0xbeef);
        for i in 0..4 {
            let y = i as f32 - 2.0;
            triangles.push(Triangle::new(
                Point3::new(-40.0, y, 0.0),
                Point3::new(40.0, y + 0.1, 0.0),
                Point3::new(0.0, y, 0.5),
            ));
        }
        triangles
    }

    #[test]
    fn test_indices_form_a_covering_multiset() {
        let triangles = skewered_scene();
        let bvh = Bvh2::build_sbvh(&triangles, &sbvh_config()).unwrap();

        let mut seen = vec![0usize; triangles.len()];
        for &index in &bvh.indices {
            seen[index as usize] += 1;
        }
        // Every input triangle is present at least once.
        assert!(seen.iter().all(|&c| c >= 1));

        assert_eq!(bvh.leaf_indices(), bvh.indices);
    }

    #[test]
    fn test_nodes_contain_descendants() {
        let triangles = skewered_scene();
        let bvh = Bvh2::build_sbvh(&triangles, &sbvh_config()).unwrap();

        let aabbs: Vec<_> = triangles.iter().map(|t| t.aabb()).collect();
        bvh.assert_consistent(&aabbs, 1e-3);
    }

    #[test]
    fn test_duplication_stays_bounded() {
        // Spatial splits may duplicate references, but never run away.
        let triangles = random_triangles(128, 50.0, 0x42);
        let sbvh = Bvh2::build_sbvh(&triangles, &sbvh_config()).unwrap();

        assert!(sbvh.indices.len() >= triangles.len());
        assert!(sbvh.indices.len() <= triangles.len() * 3);

        let mut seen = vec![false; triangles.len()];
        for &index in &sbvh.indices {
            seen[index as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}

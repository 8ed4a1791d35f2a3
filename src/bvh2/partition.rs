//! Ways to partition a range of primitive references into "left" and
//! "right": a full-sweep object SAH over per-axis sorted orders, and a
//! binned spatial split that clips triangles against bin planes.

use crate::aabb::{Aabb, Primitive};
use crate::axis::Axis;
use crate::shapes::Triangle;
use crate::{Point3, Real};

/// Number of bins used when searching for a spatial split.
pub(crate) const SBVH_BIN_COUNT: usize = 256;

/// A reference to a primitive during construction: its index in the input
/// slice plus the (possibly clipped) box and centroid the builder sorts by.
/// Spatial splits duplicate references, never primitives, so several
/// references may share one `index`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PrimitiveRef {
    pub index: u32,
    pub aabb: Aabb,
    pub center: Point3,
}

impl PrimitiveRef {
    pub fn new(index: u32, aabb: Aabb) -> PrimitiveRef {
        PrimitiveRef {
            index,
            aabb,
            center: aabb.center(),
        }
    }

    pub fn from_primitives<P: Primitive>(primitives: &[P]) -> Vec<PrimitiveRef> {
        primitives
            .iter()
            .enumerate()
            .map(|(i, p)| PrimitiveRef {
                index: i as u32,
                aabb: p.aabb(),
                center: p.center(),
            })
            .collect()
    }
}

/// Per-axis orders of the references of one build range, each sorted by
/// centroid along its axis. All three hold the same id multiset.
pub(crate) type SortedIds = [Vec<u32>; 3];

/// Sorts `ids` into the three per-axis orders.
pub(crate) fn sort_ids_by_axis(refs: &[PrimitiveRef], ids: Vec<u32>) -> SortedIds {
    let mut sorted = [ids.clone(), ids.clone(), ids];
    resort_ids(refs, &mut sorted);
    sorted
}

/// Restores the per-axis sort order, used after spatial splits move
/// reference centroids.
pub(crate) fn resort_ids(refs: &[PrimitiveRef], sorted: &mut SortedIds) {
    for axis in Axis::ALL {
        sorted[axis as usize]
            .sort_by(|&a, &b| refs[a as usize].center[axis].total_cmp(&refs[b as usize].center[axis]));
    }
}

/// The best object split found by [`partition_object`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct ObjectSplit {
    pub axis: Axis,
    /// Split position in the sorted order of `axis`: the left child takes
    /// ids `[0, index)`, the right child `[index, n)`.
    pub index: usize,
    pub cost: Real,
    pub aabb_left: Aabb,
    pub aabb_right: Aabb,
}

/// Reusable sweep scratch, grown to the largest range seen.
#[derive(Default)]
pub(crate) struct SweepScratch {
    sah: Vec<Real>,
    bounds_left: Vec<Aabb>,
    bounds_right: Vec<Aabb>,
}

/// Evaluates SAH for every object split candidate on every axis.
///
/// For each axis a prefix sweep accumulates the left box and writes
/// `A_left(i)·i`, then a suffix sweep adds `A_right(i)·(n−i)`; the minimum
/// over all `(axis, i)` wins. Ties resolve to the earliest axis in X<Y<Z
/// order, then the smallest split index, because only strictly better
/// candidates replace the incumbent. Degenerate input (all centroids
/// equal on every axis) still yields a legal median split.
pub(crate) fn partition_object(
    refs: &[PrimitiveRef],
    sorted: &SortedIds,
    scratch: &mut SweepScratch,
) -> ObjectSplit {
    let n = sorted[0].len();
    debug_assert!(n >= 2);

    scratch.sah.resize(n, 0.0);
    scratch.bounds_left.resize(n, Aabb::empty());
    scratch.bounds_right.resize(n + 1, Aabb::empty());

    let mut split = ObjectSplit {
        axis: Axis::X,
        index: 0,
        cost: Real::INFINITY,
        aabb_left: Aabb::empty(),
        aabb_right: Aabb::empty(),
    };

    for axis in Axis::ALL {
        let ids = &sorted[axis as usize];

        scratch.bounds_left[0] = Aabb::empty();
        for i in 1..n {
            let grown = scratch.bounds_left[i - 1].join(&refs[ids[i - 1] as usize].aabb);
            scratch.bounds_left[i] = grown;
            scratch.sah[i] = grown.surface_area() * i as Real;
        }

        scratch.bounds_right[n] = Aabb::empty();
        for i in (1..n).rev() {
            let grown = scratch.bounds_right[i + 1].join(&refs[ids[i] as usize].aabb);
            scratch.bounds_right[i] = grown;
            scratch.sah[i] += grown.surface_area() * (n - i) as Real;
        }

        for i in 1..n {
            if scratch.sah[i] < split.cost {
                split.cost = scratch.sah[i];
                split.index = i;
                split.axis = axis;
                split.aabb_left = scratch.bounds_left[i];
                split.aabb_right = scratch.bounds_right[i];
            }
        }
    }

    if split.index == 0 {
        // Every candidate had non-finite cost. Fall back to a median split
        // so construction always makes progress.
        split.axis = Axis::X;
        split.index = n / 2;
        split.aabb_left = joint_aabb(refs, &sorted[0][..n / 2]);
        split.aabb_right = joint_aabb(refs, &sorted[0][n / 2..]);
    }

    split
}

/// The joint box over a set of reference ids, inflated where degenerate.
pub(crate) fn joint_aabb(refs: &[PrimitiveRef], ids: &[u32]) -> Aabb {
    let mut aabb = Aabb::empty();
    for &id in ids {
        aabb.join_mut(&refs[id as usize].aabb);
    }
    aabb.fix_if_needed();
    aabb
}

/// Splits the three sorted orders into left and right children.
///
/// Membership is decided on the splitting axis: the first `split_index` ids
/// of its order go left. The other two orders are partitioned stably by the
/// same membership, which is exactly the disambiguation the coordinate
/// comparison cannot provide when several centroids share the split value.
/// `in_left` is an arena-sized scratch and is handed back cleared.
pub(crate) fn split_ids(
    sorted: &SortedIds,
    axis: Axis,
    split_index: usize,
    in_left: &mut Vec<bool>,
) -> (SortedIds, SortedIds) {
    let n = sorted[0].len();

    for &id in &sorted[axis as usize][..split_index] {
        in_left[id as usize] = true;
    }

    let mut left: SortedIds = Default::default();
    let mut right: SortedIds = Default::default();
    for a in 0..3 {
        left[a] = Vec::with_capacity(split_index);
        right[a] = Vec::with_capacity(n - split_index);
        for &id in &sorted[a] {
            if in_left[id as usize] {
                left[a].push(id);
            } else {
                right[a].push(id);
            }
        }
        debug_assert_eq!(left[a].len(), split_index);
    }

    for &id in &sorted[axis as usize][..split_index] {
        in_left[id as usize] = false;
    }

    (left, right)
}

/// The best spatial split found by [`partition_spatial`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SpatialSplit {
    pub axis: Axis,
    pub plane: Real,
    pub cost: Real,
    pub aabb_left: Aabb,
    pub aabb_right: Aabb,
    pub num_left: usize,
    pub num_right: usize,
}

#[derive(Clone, Copy)]
struct Bin {
    aabb: Aabb,
    entries: u32,
    exits: u32,
}

impl Bin {
    fn empty() -> Bin {
        Bin {
            aabb: Aabb::empty(),
            entries: 0,
            exits: 0,
        }
    }
}

/// Reusable spatial-binning scratch.
pub(crate) struct SpatialScratch {
    bins: Vec<Bin>,
    bin_sah: Vec<Real>,
    bounds_left: Vec<Aabb>,
    bounds_right: Vec<Aabb>,
    count_left: Vec<usize>,
    count_right: Vec<usize>,
}

impl Default for SpatialScratch {
    fn default() -> SpatialScratch {
        SpatialScratch {
            bins: vec![Bin::empty(); SBVH_BIN_COUNT],
            bin_sah: vec![0.0; SBVH_BIN_COUNT],
            bounds_left: vec![Aabb::empty(); SBVH_BIN_COUNT],
            bounds_right: vec![Aabb::empty(); SBVH_BIN_COUNT + 1],
            count_left: vec![0; SBVH_BIN_COUNT],
            count_right: vec![0; SBVH_BIN_COUNT + 1],
        }
    }
}

/// Evaluates SAH over `SBVH_BIN_COUNT` equal-width bin planes on every
/// axis. Each reference bumps the entry counter of its first bin and the
/// exit counter of its last, and grows every straddled bin by its box
/// clipped against the bin slab, the node bounds and its own box. Returns
/// `None` when no finite candidate exists.
pub(crate) fn partition_spatial(
    triangles: &[Triangle],
    refs: &[PrimitiveRef],
    ids: &[u32],
    node_aabb: &Aabb,
    scratch: &mut SpatialScratch,
) -> Option<SpatialSplit> {
    let n = ids.len();

    let mut split = SpatialSplit {
        axis: Axis::X,
        plane: Real::NAN,
        cost: Real::INFINITY,
        aabb_left: Aabb::empty(),
        aabb_right: Aabb::empty(),
        num_left: 0,
        num_right: 0,
    };

    for axis in Axis::ALL {
        let bounds_min = node_aabb.min[axis] - 0.001;
        let bounds_max = node_aabb.max[axis] + 0.001;
        let bounds_step = (bounds_max - bounds_min) / SBVH_BIN_COUNT as Real;
        if !(bounds_step > 0.0) || !bounds_step.is_finite() {
            continue;
        }
        let inv_bounds_delta = 1.0 / (bounds_max - bounds_min);

        for bin in scratch.bins.iter_mut() {
            *bin = Bin::empty();
        }

        for &id in ids {
            let reference = &refs[id as usize];
            let triangle = &triangles[reference.index as usize];

            let vertex_min = reference.aabb.min[axis];
            let vertex_max = reference.aabb.max[axis];

            let to_bin = |v: Real| {
                let bin = (SBVH_BIN_COUNT as Real * ((v - bounds_min) * inv_bounds_delta)) as isize;
                bin.clamp(0, SBVH_BIN_COUNT as isize - 1) as usize
            };
            let bin_min = to_bin(vertex_min);
            let bin_max = to_bin(vertex_max);

            scratch.bins[bin_min].entries += 1;
            scratch.bins[bin_max].exits += 1;

            // Sort the vertices along the current axis.
            let mut vertices = triangle.positions();
            vertices.sort_by(|a, b| a[axis].total_cmp(&b[axis]));

            // Iterate over bins that intersect the box along the current axis.
            for b in bin_min..=bin_max {
                let bin_left_plane = bounds_min + b as Real * bounds_step;
                let bin_right_plane = bin_left_plane + bounds_step;

                // If the box lies outside the bin we don't care about this reference.
                if vertex_min >= bin_right_plane || vertex_max <= bin_left_plane {
                    continue;
                }

                let clipped = clip_against_slab(
                    &vertices,
                    reference,
                    axis,
                    bin_left_plane,
                    bin_right_plane,
                    vertex_min,
                    vertex_max,
                );

                let bin = &mut scratch.bins[b];
                bin.aabb.join_mut(&clipped);
                bin.aabb = bin.aabb.intersection(node_aabb);
                bin.aabb.fix_if_needed();
            }
        }

        scratch.bounds_left[0] = Aabb::empty();
        scratch.count_left[0] = 0;
        for b in 1..SBVH_BIN_COUNT {
            let grown = scratch.bounds_left[b - 1].join(&scratch.bins[b - 1].aabb);
            scratch.bounds_left[b] = grown;
            scratch.count_left[b] = scratch.count_left[b - 1] + scratch.bins[b - 1].entries as usize;

            scratch.bin_sah[b] = if scratch.count_left[b] > 0 && scratch.count_left[b] < n {
                grown.surface_area() * scratch.count_left[b] as Real
            } else {
                Real::INFINITY
            };
        }

        scratch.bounds_right[SBVH_BIN_COUNT] = Aabb::empty();
        scratch.count_right[SBVH_BIN_COUNT] = 0;
        for b in (1..SBVH_BIN_COUNT).rev() {
            let grown = scratch.bounds_right[b + 1].join(&scratch.bins[b].aabb);
            scratch.bounds_right[b] = grown;
            scratch.count_right[b] = scratch.count_right[b + 1] + scratch.bins[b].exits as usize;

            if scratch.count_right[b] > 0 && scratch.count_right[b] < n {
                scratch.bin_sah[b] += grown.surface_area() * scratch.count_right[b] as Real;
            } else {
                scratch.bin_sah[b] = Real::INFINITY;
            }
        }

        for b in 1..SBVH_BIN_COUNT {
            let cost = scratch.bin_sah[b];
            if cost < split.cost {
                split.cost = cost;
                split.axis = axis;
                split.plane = bounds_min + bounds_step * b as Real;
                split.aabb_left = scratch.bounds_left[b];
                split.aabb_right = scratch.bounds_right[b];
                split.num_left = scratch.count_left[b];
                split.num_right = scratch.count_right[b];
            }
        }
    }

    if split.cost.is_finite() {
        Some(split)
    } else {
        None
    }
}

/// Clips one reference against a bin slab: exact plane-edge intersections
/// of the triangle, plus any vertex inside the slab, finally intersected
/// with the reference's own (possibly pre-clipped) box.
fn clip_against_slab(
    vertices: &[Point3; 3],
    reference: &PrimitiveRef,
    axis: Axis,
    left_plane: Real,
    right_plane: Real,
    vertex_min: Real,
    vertex_max: Real,
) -> Aabb {
    // The whole box lies between the two planes.
    if vertex_min >= left_plane && vertex_max <= right_plane {
        return reference.aabb;
    }

    let mut intersections: Vec<Point3> = Vec::with_capacity(12);
    if vertex_min <= left_plane && left_plane <= vertex_max {
        triangle_intersect_plane(vertices, axis, left_plane, &mut intersections);
    }
    if vertex_min <= right_plane && right_plane <= vertex_max {
        triangle_intersect_plane(vertices, axis, right_plane, &mut intersections);
    }

    if intersections.is_empty() {
        return reference.aabb;
    }

    let mut clipped = Aabb::from_points(&intersections);
    for vertex in vertices {
        if vertex[axis] >= left_plane && vertex[axis] <= right_plane {
            clipped.grow_mut(vertex);
        }
    }
    clipped.intersection(&reference.aabb)
}

/// Collects the intersection points of the triangle's three edges with an
/// axis-aligned plane. `vertices` must be sorted along `axis`.
fn triangle_intersect_plane(
    vertices: &[Point3; 3],
    axis: Axis,
    plane: Real,
    intersections: &mut Vec<Point3>,
) {
    for i in 0..3 {
        let vertex_i = vertices[i][axis];

        for j in i + 1..3 {
            let vertex_j = vertices[j][axis];
            let delta_ij = vertex_j - vertex_i;

            // Check if the edge between vertex i and j crosses the plane.
            if vertex_i <= plane && plane <= vertex_j {
                if delta_ij == 0.0 {
                    intersections.push(vertices[i]);
                    intersections.push(vertices[j]);
                } else {
                    // Lerp to obtain the exact intersection point.
                    let t = (plane - vertex_i) / delta_ij;
                    intersections.push(vertices[i] + (vertices[j] - vertices[i]) * t);
                }
            }
        }
    }
}

/// Splits a straddling reference at `plane` into a left and a right piece.
///
/// Each piece wraps the triangle vertices on its side plus the exact
/// edge-plane crossings, clamped at the plane and intersected with the
/// reference's own box so ancestor clips are preserved.
pub(crate) fn split_reference(
    triangle: &Triangle,
    reference: &PrimitiveRef,
    axis: Axis,
    plane: Real,
) -> (Aabb, Aabb) {
    let positions = triangle.positions();

    let mut tri_left = Aabb::empty();
    let mut tri_right = Aabb::empty();
    let on_left = [
        positions[0][axis] <= plane,
        positions[1][axis] <= plane,
        positions[2][axis] <= plane,
    ];
    for (vertex, &left) in positions.iter().zip(on_left.iter()) {
        if left {
            tri_left.grow_mut(vertex);
        } else {
            tri_right.grow_mut(vertex);
        }
    }
    for (i, j) in [(0, 1), (1, 2), (2, 0)] {
        if on_left[i] != on_left[j] {
            let a = positions[i];
            let b = positions[j];
            let t = (plane - a[axis]) / (b[axis] - a[axis]);
            let crossing = a + (b - a) * t;
            tri_left.grow_mut(&crossing);
            tri_right.grow_mut(&crossing);
        }
    }

    let mut left = reference.aabb;
    left.max[axis] = left.max[axis].min(plane);
    let mut right = reference.aabb;
    right.min[axis] = right.min[axis].max(plane);

    if !tri_left.is_empty() {
        let tightened = left.intersection(&tri_left);
        if is_ordered(&tightened) {
            left = tightened;
        }
    }
    if !tri_right.is_empty() {
        let tightened = right.intersection(&tri_right);
        if is_ordered(&tightened) {
            right = tightened;
        }
    }

    left.fix_if_needed();
    right.fix_if_needed();
    (left, right)
}

fn is_ordered(aabb: &Aabb) -> bool {
    aabb.min.x <= aabb.max.x && aabb.min.y <= aabb.max.y && aabb.min.z <= aabb.max.z
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aabb::Bounded;
    use crate::axis::Axis;
    use crate::shapes::Triangle;
    use crate::Point3;

    fn refs_for(triangles: &[Triangle]) -> Vec<PrimitiveRef> {
        PrimitiveRef::from_primitives(triangles)
    }

    fn two_cluster_triangles() -> Vec<Triangle> {
        let mut triangles = Vec::new();
        for i in 0..4 {
            let x = i as f32 * 0.1;
            triangles.push(Triangle::new(
                Point3::new(x, 0.0, 0.0),
                Point3::new(x + 0.05, 1.0, 0.0),
                Point3::new(x, 0.0, 1.0),
            ));
        }
        for i in 0..4 {
            let x = 100.0 + i as f32 * 0.1;
            triangles.push(Triangle::new(
                Point3::new(x, 0.0, 0.0),
                Point3::new(x + 0.05, 1.0, 0.0),
                Point3::new(x, 0.0, 1.0),
            ));
        }
        triangles
    }

    #[test]
    fn test_object_split_separates_clusters() {
        let triangles = two_cluster_triangles();
        let refs = refs_for(&triangles);
        let sorted = sort_ids_by_axis(&refs, (0..refs.len() as u32).collect());

        let split = partition_object(&refs, &sorted, &mut SweepScratch::default());

        assert_eq!(split.axis, Axis::X);
        assert_eq!(split.index, 4);
        assert!(split.cost.is_finite());
        assert!(split.aabb_left.max.x < split.aabb_right.min.x);
    }

    #[test]
    fn test_object_split_identical_centroids() {
        // Four triangles whose centroids coincide; the partitioner must
        // still produce a non-trivial split.
        let triangle = Triangle::new(
            Point3::new(-1.0, -1.0, 0.0),
            Point3::new(1.0, -1.0, 0.0),
            Point3::new(0.0, 2.0, 0.0),
        );
        let triangles = vec![triangle; 4];
        let refs = refs_for(&triangles);
        let sorted = sort_ids_by_axis(&refs, (0..4).collect());

        let split = partition_object(&refs, &sorted, &mut SweepScratch::default());
        assert!(split.index > 0 && split.index < 4);
    }

    #[test]
    fn test_split_ids_is_stable_and_consistent() {
        let triangles = two_cluster_triangles();
        let refs = refs_for(&triangles);
        let sorted = sort_ids_by_axis(&refs, (0..refs.len() as u32).collect());
        let mut in_left = vec![false; refs.len()];

        let (left, right) = split_ids(&sorted, Axis::X, 4, &mut in_left);

        for a in 0..3 {
            assert_eq!(left[a].len(), 4);
            assert_eq!(right[a].len(), 4);
        }
        // The scratch is handed back cleared.
        assert!(in_left.iter().all(|&f| !f));

        // Each side holds the same ids on every axis.
        let mut x_ids = left[0].clone();
        x_ids.sort_unstable();
        for a in 1..3 {
            let mut ids = left[a].clone();
            ids.sort_unstable();
            assert_eq!(ids, x_ids);
        }
    }

    #[test]
    fn test_spatial_split_finds_plane() {
        let triangles = two_cluster_triangles();
        let refs = refs_for(&triangles);
        let ids: Vec<u32> = (0..refs.len() as u32).collect();
        let node_aabb = joint_aabb(&refs, &ids);

        let split = partition_spatial(
            &triangles,
            &refs,
            &ids,
            &node_aabb,
            &mut SpatialScratch::default(),
        )
        .expect("a finite spatial split must exist");

        assert_eq!(split.axis, Axis::X);
        assert_eq!(split.num_left + split.num_right, refs.len());
        assert!(split.plane > 0.2 && split.plane < 100.0);
    }

    #[test]
    fn test_split_reference_pieces_meet_at_plane() {
        let triangle = Triangle::new(
            Point3::new(-2.0, 0.0, 0.0),
            Point3::new(2.0, 0.1, 0.0),
            Point3::new(0.0, 1.0, 1.0),
        );
        let reference = PrimitiveRef::new(0, triangle.aabb());

        let (left, right) = split_reference(&triangle, &reference, Axis::X, 0.5);

        assert!(left.is_valid() && right.is_valid());
        // Pieces stay inside the reference box, up to the degeneracy fix.
        assert!(reference
            .aabb
            .approx_contains_aabb_eps(&left, 0.01));
        assert!(reference
            .aabb
            .approx_contains_aabb_eps(&right, 0.01));
        // And they meet at the splitting plane.
        assert!(left.max.x <= 0.5 + 0.01);
        assert!(right.min.x >= 0.5 - 0.01);
    }

    #[test]
    fn test_triangle_intersect_plane_lerp() {
        let vertices = [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 2.0, 0.0),
            Point3::new(2.0, 0.0, 4.0),
        ];
        let mut intersections = Vec::new();
        triangle_intersect_plane(&vertices, Axis::X, 1.0, &mut intersections);

        // Edges (0,1) and (0,2) cross x=1; edge (1,2) touches it at vertex 1.
        assert!(!intersections.is_empty());
        for p in &intersections {
            assert!((p.x - 1.0).abs() < 1e-6);
        }
    }
}

//! Build configuration and the top-level entry point for constructing an
//! acceleration structure over a triangle mesh.

use crate::aabb::Primitive;
use crate::bvh2::Bvh2;
use crate::cwbvh::CwBvh;
use crate::error::BuildError;
use crate::qbvh::Qbvh;
use crate::shapes::Triangle;

/// Which acceleration structure layout to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvhType {
    /// A binary SAH BVH.
    Bvh2,
    /// A binary BVH built with spatial triangle splits.
    Sbvh,
    /// A 4-wide BVH collapsed from the binary BVH.
    Qbvh,
    /// A compressed 8-wide BVH with quantised child boxes.
    Cwbvh,
}

impl BvhType {
    /// The node-type tag used by the BVH cache header.
    pub fn node_type(&self) -> u32 {
        match self {
            BvhType::Bvh2 | BvhType::Sbvh => 2,
            BvhType::Qbvh => 4,
            BvhType::Cwbvh => 8,
        }
    }
}

/// Parameters of BVH construction.
///
/// This is the whole tuning surface: the hosting renderer's configuration
/// layer is expected to map its own options onto this struct.
#[derive(Debug, Clone, Copy)]
pub struct BuildConfig {
    /// The layout to build.
    pub bvh_type: BvhType,

    /// Upper bound on the number of primitives a leaf may hold. Forced to 1
    /// when building the 8-wide layout, whose compression pass requires
    /// single-primitive leaves.
    pub max_primitives_in_leaf: u32,

    /// SAH cost of visiting an internal node.
    pub sah_cost_node: f32,

    /// SAH cost of intersecting one primitive in a leaf.
    pub sah_cost_leaf: f32,

    /// Spatial splits are only attempted when the overlap of the best
    /// object split's children exceeds this fraction of the root surface
    /// area.
    pub sbvh_alpha: f32,

    /// Whether the binary BVH that a wide layout is collapsed from should
    /// itself be built with spatial splits.
    pub use_spatial_splits: bool,
}

impl Default for BuildConfig {
    fn default() -> BuildConfig {
        BuildConfig {
            bvh_type: BvhType::Cwbvh,
            max_primitives_in_leaf: 4,
            sah_cost_node: 4.0,
            sah_cost_leaf: 1.0,
            sbvh_alpha: 1e-5,
            use_spatial_splits: false,
        }
    }
}

impl BuildConfig {
    /// The configuration for the underlying binary build of this layout:
    /// wide layouts need single-primitive leaves.
    pub(crate) fn underlying(&self) -> BuildConfig {
        let mut cfg = *self;
        if self.bvh_type == BvhType::Cwbvh {
            cfg.max_primitives_in_leaf = 1;
        }
        cfg
    }

    /// Whether the underlying binary build uses spatial splits.
    pub(crate) fn wants_spatial_splits(&self) -> bool {
        self.bvh_type == BvhType::Sbvh || self.use_spatial_splits
    }
}

/// An acceleration structure in one of the three supported layouts.
#[derive(Debug, Clone)]
pub enum Bvh {
    /// A binary BVH (plain or spatial-split).
    Bvh2(Bvh2),
    /// A 4-wide BVH.
    Qbvh(Qbvh),
    /// A compressed 8-wide BVH.
    Cwbvh(CwBvh),
}

impl Bvh {
    /// The node-type tag of this layout, as used by the cache header.
    pub fn node_type(&self) -> u32 {
        match self {
            Bvh::Bvh2(_) => 2,
            Bvh::Qbvh(_) => 4,
            Bvh::Cwbvh(_) => 8,
        }
    }

    /// The bounds of the whole tree in build space.
    pub fn root_aabb(&self) -> crate::aabb::Aabb {
        match self {
            Bvh::Bvh2(bvh) => bvh.root_aabb(),
            Bvh::Qbvh(bvh) => bvh.root_aabb(),
            Bvh::Cwbvh(bvh) => bvh.root_aabb(),
        }
    }
}

/// Builds an acceleration structure over `triangles` in the layout selected
/// by `config`.
///
/// # Errors
/// Fails with [`BuildError::EmptyInput`] for an empty slice and
/// [`BuildError::InvalidPrimitive`] when a triangle has a non-finite box or
/// centroid.
pub fn build_bvh(triangles: &[Triangle], config: &BuildConfig) -> Result<Bvh, BuildError> {
    let underlying = config.underlying();
    let bvh2 = if config.wants_spatial_splits() {
        Bvh2::build_sbvh(triangles, &underlying)?
    } else {
        Bvh2::build(triangles, &underlying)?
    };

    Ok(match config.bvh_type {
        BvhType::Bvh2 | BvhType::Sbvh => Bvh::Bvh2(bvh2),
        BvhType::Qbvh => Bvh::Qbvh(Qbvh::from_bvh2(&bvh2)),
        BvhType::Cwbvh => Bvh::Cwbvh(CwBvh::from_bvh2(&bvh2)),
    })
}

/// Rejects empty input and non-finite primitives before construction.
pub(crate) fn validate<P: Primitive>(primitives: &[P]) -> Result<(), BuildError> {
    if primitives.is_empty() {
        return Err(BuildError::EmptyInput);
    }
    for (index, primitive) in primitives.iter().enumerate() {
        let aabb = primitive.aabb();
        let center = primitive.center();
        if !aabb.is_finite() || !center.coords.iter().all(|c| c.is_finite()) {
            return Err(BuildError::InvalidPrimitive { index });
        }
    }
    Ok(())
}

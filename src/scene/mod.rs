//! The two-level scene: per-mesh BVHs (BLAS), transformed instances, and a
//! top-level BVH (TLAS) built over the instances' world-space boxes.

pub mod trace;

use crate::aabb::{Aabb, Bounded, Primitive};
use crate::build::{build_bvh, BuildConfig, Bvh, BvhType};
use crate::bvh2::Bvh2;
use crate::cwbvh::CwBvh;
use crate::error::BuildError;
use crate::qbvh::Qbvh;
use crate::shapes::Triangle;
use crate::{Matrix4, Point3};

/// A triangle mesh and the acceleration structure built over it. Built
/// once per asset; instances share it.
#[derive(Debug, Clone)]
pub struct MeshData {
    /// The mesh geometry. Leaves of the BVH index into this slice through
    /// the BVH's permuted index table.
    pub triangles: Vec<Triangle>,

    /// The acceleration structure over `triangles`.
    pub bvh: Bvh,
}

impl MeshData {
    /// Builds the acceleration structure for `triangles` in the layout
    /// `config` selects.
    pub fn build(triangles: Vec<Triangle>, config: &BuildConfig) -> Result<MeshData, BuildError> {
        let bvh = build_bvh(&triangles, config)?;
        Ok(MeshData { triangles, bvh })
    }

    /// Pairs geometry with an already constructed (for example, cached)
    /// acceleration structure.
    pub fn from_parts(triangles: Vec<Triangle>, bvh: Bvh) -> MeshData {
        MeshData { triangles, bvh }
    }
}

/// One placement of a mesh in the scene: a reference to the shared mesh
/// data plus the object-to-world transform.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Index of the instanced mesh in the scene's mesh list.
    pub mesh_data: usize,

    /// Object-to-world transform.
    pub transform: Matrix4,

    /// World-to-object transform; kept in sync with `transform`.
    pub transform_inv: Matrix4,

    /// The previous frame's object-to-world transform, for temporal
    /// reprojection by the renderer.
    pub transform_prev: Matrix4,

    /// True when `transform` is the identity; traversal then skips the ray
    /// transform and restore entirely.
    pub identity: bool,
}

impl Instance {
    /// Creates an instance of mesh `mesh_data` at `transform`.
    ///
    /// # Errors
    /// Fails with [`BuildError::SingularTransform`] when the transform has
    /// no inverse.
    ///
    /// [`BuildError::SingularTransform`]: ../error/enum.BuildError.html
    pub fn new(mesh_data: usize, transform: Matrix4) -> Result<Instance, BuildError> {
        let transform_inv = transform
            .try_inverse()
            .ok_or(BuildError::SingularTransform)?;
        Ok(Instance {
            mesh_data,
            transform,
            transform_inv,
            transform_prev: transform,
            identity: transform == Matrix4::identity(),
        })
    }

    /// Moves the instance to a new transform, remembering the old one as
    /// the previous-frame transform. The scene's TLAS must be rebuilt
    /// afterwards.
    pub fn set_transform(&mut self, transform: Matrix4) -> Result<(), BuildError> {
        let transform_inv = transform
            .try_inverse()
            .ok_or(BuildError::SingularTransform)?;
        self.transform_prev = self.transform;
        self.transform = transform;
        self.transform_inv = transform_inv;
        self.identity = transform == Matrix4::identity();
        Ok(())
    }
}

/// The world-space box of one instance, the primitive the TLAS is built
/// over.
struct InstanceRef {
    aabb: Aabb,
    center: Point3,
}

impl Bounded for InstanceRef {
    fn aabb(&self) -> Aabb {
        self.aabb
    }
}

impl Primitive for InstanceRef {
    fn center(&self) -> Point3 {
        self.center
    }
}

/// An immutable scene ready for traversal: meshes, instances and the
/// top-level BVH over the instances. All traversal state lives with the
/// traverser, so one `Scene` can serve any number of threads.
#[derive(Debug, Clone)]
pub struct Scene {
    /// The shared mesh data.
    pub meshes: Vec<MeshData>,

    /// The instances the TLAS is built over.
    pub instances: Vec<Instance>,

    tlas: Bvh,
    config: BuildConfig,
}

impl Scene {
    /// Assembles a scene and builds its TLAS.
    ///
    /// # Errors
    /// Fails when `instances` is empty, references an unknown mesh, or a
    /// mesh carries a different BVH layout than `config` selects.
    pub fn new(
        meshes: Vec<MeshData>,
        instances: Vec<Instance>,
        config: &BuildConfig,
    ) -> Result<Scene, BuildError> {
        for (index, mesh) in meshes.iter().enumerate() {
            if mesh.bvh.node_type() != config.bvh_type.node_type() {
                return Err(BuildError::LayoutMismatch { mesh: index });
            }
        }
        for (index, instance) in instances.iter().enumerate() {
            if instance.mesh_data >= meshes.len() {
                return Err(BuildError::UnknownMesh {
                    instance: index,
                    mesh: instance.mesh_data,
                });
            }
        }

        let tlas = build_tlas(&meshes, &instances, config)?;
        Ok(Scene {
            meshes,
            instances,
            tlas,
            config: *config,
        })
    }

    /// The top-level acceleration structure.
    pub fn tlas(&self) -> &Bvh {
        &self.tlas
    }

    /// The layout this scene traverses.
    pub fn bvh_type(&self) -> BvhType {
        self.config.bvh_type
    }

    /// Rebuilds the TLAS after instance transforms changed. The per-mesh
    /// BLASes are untouched.
    pub fn rebuild_tlas(&mut self) -> Result<(), BuildError> {
        self.tlas = build_tlas(&self.meshes, &self.instances, &self.config)?;
        Ok(())
    }

    /// Convenience: update one instance's transform and rebuild the TLAS.
    pub fn set_transform(&mut self, instance: usize, transform: Matrix4) -> Result<(), BuildError> {
        self.instances[instance].set_transform(transform)?;
        self.rebuild_tlas()
    }
}

/// Builds the TLAS over the instances' world boxes, in the same layout as
/// the BLASes. Leaves are forced down to one instance so a TLAS leaf names
/// exactly the instance whose BLAS the traversal enters.
fn build_tlas(
    meshes: &[MeshData],
    instances: &[Instance],
    config: &BuildConfig,
) -> Result<Bvh, BuildError> {
    let refs: Vec<InstanceRef> = instances
        .iter()
        .map(|instance| {
            let world = meshes[instance.mesh_data]
                .bvh
                .root_aabb()
                .transform(&instance.transform);
            InstanceRef {
                aabb: world,
                center: world.center(),
            }
        })
        .collect();

    let tlas_config = BuildConfig {
        max_primitives_in_leaf: 1,
        ..*config
    };
    let bvh2 = Bvh2::build(&refs, &tlas_config)?;

    Ok(match config.bvh_type {
        BvhType::Bvh2 | BvhType::Sbvh => Bvh::Bvh2(bvh2),
        BvhType::Qbvh => Bvh::Qbvh(Qbvh::from_bvh2(&bvh2)),
        BvhType::Cwbvh => Bvh::Cwbvh(CwBvh::from_bvh2(&bvh2)),
    })
}

#[cfg(test)]
mod tests {
    use super::{Instance, MeshData, Scene};
    use crate::build::{BuildConfig, BvhType};
    use crate::error::BuildError;
    use crate::testbase::{random_triangles, unit_cube_triangles};
    use crate::{Matrix4, Vector3};

    #[test]
    fn test_scene_rejects_unknown_mesh() {
        let config = BuildConfig::default();
        let mesh = MeshData::build(unit_cube_triangles(), &config).unwrap();
        let instance = Instance::new(3, Matrix4::identity()).unwrap();

        let result = Scene::new(vec![mesh], vec![instance], &config);
        assert!(matches!(
            result,
            Err(BuildError::UnknownMesh {
                instance: 0,
                mesh: 3
            })
        ));
    }

    #[test]
    fn test_scene_rejects_layout_mismatch() {
        let bvh2_config = BuildConfig {
            bvh_type: BvhType::Bvh2,
            ..BuildConfig::default()
        };
        let cwbvh_config = BuildConfig::default();

        let mesh = MeshData::build(unit_cube_triangles(), &bvh2_config).unwrap();
        let instance = Instance::new(0, Matrix4::identity()).unwrap();

        let result = Scene::new(vec![mesh], vec![instance], &cwbvh_config);
        assert!(matches!(result, Err(BuildError::LayoutMismatch { mesh: 0 })));
    }

    #[test]
    fn test_singular_transform_is_rejected() {
        let result = Instance::new(0, Matrix4::zeros());
        assert!(matches!(result, Err(BuildError::SingularTransform)));
    }

    #[test]
    fn test_identity_flag() {
        let identity = Instance::new(0, Matrix4::identity()).unwrap();
        assert!(identity.identity);

        let moved =
            Instance::new(0, Matrix4::new_translation(&Vector3::new(1.0, 0.0, 0.0))).unwrap();
        assert!(!moved.identity);
    }

    #[test]
    fn test_set_transform_tracks_previous() {
        let mut instance = Instance::new(0, Matrix4::identity()).unwrap();
        let moved = Matrix4::new_translation(&Vector3::new(5.0, 0.0, 0.0));
        instance.set_transform(moved).unwrap();

        assert_eq!(instance.transform_prev, Matrix4::identity());
        assert_eq!(instance.transform, moved);
        // The inverse is kept in sync.
        let round_trip = instance.transform * instance.transform_inv;
        assert!((round_trip - Matrix4::identity()).abs().max() < 1e-5);
    }

    #[test]
    fn test_tlas_rebuild_after_move() {
        let config = BuildConfig {
            bvh_type: BvhType::Bvh2,
            ..BuildConfig::default()
        };
        let mesh = MeshData::build(random_triangles(32, 4.0, 0x11), &config).unwrap();
        let instances = vec![
            Instance::new(0, Matrix4::identity()).unwrap(),
            Instance::new(0, Matrix4::new_translation(&Vector3::new(10.0, 0.0, 0.0))).unwrap(),
        ];
        let mut scene = Scene::new(vec![mesh], instances, &config).unwrap();

        let before = scene.tlas().root_aabb();
        scene
            .set_transform(1, Matrix4::new_translation(&Vector3::new(100.0, 0.0, 0.0)))
            .unwrap();
        let after = scene.tlas().root_aabb();

        assert!(after.max.x > before.max.x + 50.0);
    }
}

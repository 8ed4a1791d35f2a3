//! Common utilities shared by unit tests.

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::build::{BuildConfig, BvhType};
use crate::ray::{Ray, RayHit};
use crate::scene::{Instance, MeshData, Scene};
use crate::shapes::Triangle;
use crate::{Matrix4, Point3, Vector3};

/// A vector represented as a tuple.
pub type TupleVec = (f32, f32, f32);

/// All layouts under test.
pub const ALL_BVH_TYPES: [BvhType; 4] =
    [BvhType::Bvh2, BvhType::Sbvh, BvhType::Qbvh, BvhType::Cwbvh];

/// Generate a [`TupleVec`] for [`proptest::strategy::Strategy`] from -100 to 100.
/// A small enough range to prevent most fp32 errors from breaking tests.
pub fn tuplevec_small_strategy() -> impl Strategy<Value = TupleVec> {
    (-100.0_f32..100.0, -100.0_f32..100.0, -100.0_f32..100.0)
}

/// Convert a [`TupleVec`] to a [`Point3`].
pub fn tuple_to_point(tpl: &TupleVec) -> Point3 {
    Point3::new(tpl.0, tpl.1, tpl.2)
}

/// Small triangles with centers uniformly spread over a cube of the given
/// half-extent. Deterministic per seed.
pub fn random_triangles(count: usize, scale: f32, seed: u64) -> Vec<Triangle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let edge = (scale / 8.0).max(0.25);

    (0..count)
        .map(|_| {
            let center = Point3::new(
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
            );
            let mut offset = || {
                Vector3::new(
                    rng.gen_range(-edge..edge),
                    rng.gen_range(-edge..edge),
                    rng.gen_range(-edge..edge),
                )
            };
            Triangle::new(center + offset(), center + offset(), center + offset())
        })
        .collect()
}

/// Axis-aligned triangles: each lies flat in a plane perpendicular to a
/// random axis, the degenerate case the AABB fix-up exists for.
pub fn axis_aligned_triangles(count: usize, seed: u64) -> Vec<Triangle> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|_| {
            let axis = rng.gen_range(0..3usize);
            let plane = rng.gen_range(-10.0_f32..10.0);
            let mut point = || {
                let mut p = Point3::new(
                    rng.gen_range(-10.0_f32..10.0),
                    rng.gen_range(-10.0_f32..10.0),
                    rng.gen_range(-10.0_f32..10.0),
                );
                p[axis] = plane;
                p
            };
            Triangle::new(point(), point(), point())
        })
        .collect()
}

/// The twelve triangles of the cube spanning [-1, 1] on every axis.
pub fn unit_cube_triangles() -> Vec<Triangle> {
    let corner = |x: f32, y: f32, z: f32| Point3::new(x, y, z);
    let mut triangles = Vec::with_capacity(12);
    let mut quad = |a: Point3, b: Point3, c: Point3, d: Point3| {
        triangles.push(Triangle::new(a, b, c));
        triangles.push(Triangle::new(a, c, d));
    };

    // -x / +x
    quad(
        corner(-1.0, -1.0, -1.0),
        corner(-1.0, -1.0, 1.0),
        corner(-1.0, 1.0, 1.0),
        corner(-1.0, 1.0, -1.0),
    );
    quad(
        corner(1.0, -1.0, -1.0),
        corner(1.0, 1.0, -1.0),
        corner(1.0, 1.0, 1.0),
        corner(1.0, -1.0, 1.0),
    );
    // -y / +y
    quad(
        corner(-1.0, -1.0, -1.0),
        corner(1.0, -1.0, -1.0),
        corner(1.0, -1.0, 1.0),
        corner(-1.0, -1.0, 1.0),
    );
    quad(
        corner(-1.0, 1.0, -1.0),
        corner(-1.0, 1.0, 1.0),
        corner(1.0, 1.0, 1.0),
        corner(1.0, 1.0, -1.0),
    );
    // -z / +z
    quad(
        corner(-1.0, -1.0, -1.0),
        corner(-1.0, 1.0, -1.0),
        corner(1.0, 1.0, -1.0),
        corner(1.0, -1.0, -1.0),
    );
    quad(
        corner(-1.0, -1.0, 1.0),
        corner(1.0, -1.0, 1.0),
        corner(1.0, 1.0, 1.0),
        corner(-1.0, 1.0, 1.0),
    );

    triangles
}

/// Deterministic random rays: origins in a cube, directions uniform-ish
/// over the sphere.
pub fn random_rays(count: usize, scale: f32, seed: u64) -> Vec<Ray> {
    let mut rng = StdRng::seed_from_u64(seed);

    (0..count)
        .map(|_| {
            let origin = Point3::new(
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
                rng.gen_range(-scale..scale),
            );
            let direction = loop {
                let d = Vector3::new(
                    rng.gen_range(-1.0_f32..1.0),
                    rng.gen_range(-1.0_f32..1.0),
                    rng.gen_range(-1.0_f32..1.0),
                );
                if d.norm() > 1e-3 {
                    break d;
                }
            };
            Ray::new(origin, direction)
        })
        .collect()
}

/// One mesh, one identity instance, the requested layout.
pub fn single_instance_scene(triangles: Vec<Triangle>, bvh_type: BvhType) -> Scene {
    let config = BuildConfig {
        bvh_type,
        ..BuildConfig::default()
    };
    let mesh = MeshData::build(triangles, &config).expect("test mesh builds");
    let instance = Instance::new(0, Matrix4::identity()).expect("identity instance");
    Scene::new(vec![mesh], vec![instance], &config).expect("test scene builds")
}

/// The reference result: a linear scan over every triangle of every
/// instance, with the same per-instance ray transform the engines use.
pub fn scan_scene_closest(scene: &Scene, ray: &Ray) -> RayHit {
    let mut hit = RayHit::none();

    for (instance_id, instance) in scene.instances.iter().enumerate() {
        let local_ray = if instance.identity {
            *ray
        } else {
            ray.transformed(&instance.transform_inv)
        };

        let mesh = &scene.meshes[instance.mesh_data];
        for (triangle_id, triangle) in mesh.triangles.iter().enumerate() {
            let intersection = triangle.intersect(&local_ray);
            hit.consider(
                intersection.distance,
                intersection.u,
                intersection.v,
                instance_id as u32,
                triangle_id as u32,
            );
        }
    }

    hit
}

/// Asserts that two hit records agree: same hit/miss verdict, distances
/// within tolerance, same primitive.
pub fn assert_hits_match(hit: &RayHit, want: &RayHit) {
    assert_eq!(hit.is_hit(), want.is_hit(), "hit {} vs {}", hit.t, want.t);
    if hit.is_hit() {
        assert!(
            (hit.t - want.t).abs() < 1e-4,
            "t mismatch: {} vs {}",
            hit.t,
            want.t
        );
        assert_eq!(hit.primitive_id, want.primitive_id);
        assert_eq!(hit.mesh_id, want.mesh_id);
    }
}

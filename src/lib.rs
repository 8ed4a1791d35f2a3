//! A crate which exports rays, axis-aligned bounding boxes, and the bounding
//! volume hierarchies a CPU path tracer is built on.
//!
//! ## About
//!
//! This crate builds and traverses acceleration structures over triangle
//! meshes. Three layouts are supported: a binary SAH BVH (optionally built
//! with spatial triangle splits, SBVH), a 4-wide BVH collapsed from the
//! binary tree, and a compressed 8-wide BVH with quantised child boxes and
//! octant-invariant child ordering. Scenes are two-level: a top-level BVH is
//! built over mesh instances, each instance referencing a per-mesh BVH plus
//! a world-to-object transform. Traversal supports closest-hit queries and
//! any-hit (shadow) queries with a distance bound.
//!
//! ## Example
//!
//! ```
//! use wbvh::build::BuildConfig;
//! use wbvh::ray::{Ray, RayHit};
//! use wbvh::scene::{Instance, MeshData, Scene};
//! use wbvh::shapes::Triangle;
//! use wbvh::{Matrix4, Point3, Vector3};
//!
//! let triangles = vec![Triangle::new(
//!     Point3::new(-1.0, -1.0, 1.0),
//!     Point3::new(1.0, -1.0, 1.0),
//!     Point3::new(0.0, 1.0, 1.0),
//! )];
//!
//! let config = BuildConfig::default();
//! let mesh = MeshData::build(triangles, &config).unwrap();
//! let instance = Instance::new(0, Matrix4::identity()).unwrap();
//! let scene = Scene::new(vec![mesh], vec![instance], &config).unwrap();
//!
//! let rays = vec![Ray::new(
//!     Point3::new(0.0, 0.0, 0.0),
//!     Vector3::new(0.0, 0.0, 1.0),
//! )];
//! let mut hits = vec![RayHit::none()];
//! scene.trace_closest(&rays, &mut hits);
//!
//! assert!(hits[0].is_hit());
//! assert!((hits[0].t - 1.0).abs() < 1e-5);
//! ```

#![deny(missing_docs)]

/// A minimal floating value used as a lower bound for ray intersection
/// distances, so that a ray does not re-intersect the surface it starts on.
pub const EPSILON: f32 = 0.00001;

/// The floating point type used by this crate.
pub type Real = f32;

/// Point math type used by this crate. Type alias for [`nalgebra::Point3`].
pub type Point3 = nalgebra::Point3<Real>;

/// Vector math type used by this crate. Type alias for [`nalgebra::Vector3`].
pub type Vector3 = nalgebra::Vector3<Real>;

/// Two-dimensional vector type, used for texture coordinates.
pub type Vector2 = nalgebra::Vector2<Real>;

/// Homogeneous transform type used for instancing. Type alias for
/// [`nalgebra::Matrix4`].
pub type Matrix4 = nalgebra::Matrix4<Real>;

pub mod aabb;
pub mod axis;
pub mod build;
pub mod bvh2;
pub mod cache;
pub mod cwbvh;
pub mod error;
pub mod qbvh;
pub mod ray;
pub mod scene;
pub mod shapes;
pub mod traverse;
mod utils;

#[cfg(test)]
mod testbase;

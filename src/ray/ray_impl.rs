use crate::aabb::Aabb;
use crate::utils::{fast_max, fast_min};
use crate::{Matrix4, Point3, Real, Vector3, EPSILON};

/// Sentinel id for "no primitive" / "no mesh" in a [`RayHit`].
pub const INVALID_ID: u32 = u32::MAX;

/// A struct which defines a ray and some of its cached values.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    /// The ray origin.
    pub origin: Point3,

    /// The ray direction.
    pub direction: Vector3,

    /// Inverse (1/x) ray direction. Cached to eliminate divisions in the
    /// [`Aabb`] slab test.
    ///
    /// [`Aabb`]: ../aabb/struct.Aabb.html
    pub inv_direction: Vector3,
}

/// A struct which is returned by the [`Ray::intersects_triangle()`] method.
pub struct Intersection {
    /// Distance from the ray origin to the intersection point.
    pub distance: Real,

    /// U coordinate of the intersection.
    pub u: Real,

    /// V coordinate of the intersection.
    pub v: Real,
}

impl Intersection {
    /// Constructs an [`Intersection`]. `distance` should be set to positive
    /// infinity, if the intersection does not occur.
    pub fn new(distance: Real, u: Real, v: Real) -> Intersection {
        Intersection { distance, u, v }
    }
}

/// The result of a closest-hit query. A miss is encoded as `t = +∞`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Hit distance along the ray; `+∞` if the ray missed.
    pub t: Real,

    /// Barycentric u coordinate of the hit.
    pub u: Real,

    /// Barycentric v coordinate of the hit.
    pub v: Real,

    /// Index of the mesh instance that was hit, [`INVALID_ID`] on a miss.
    pub mesh_id: u32,

    /// Index of the primitive that was hit, [`INVALID_ID`] on a miss.
    pub primitive_id: u32,
}

impl RayHit {
    /// Returns the miss record: `t = +∞`, invalid ids.
    pub fn none() -> RayHit {
        RayHit {
            t: Real::INFINITY,
            u: 0.0,
            v: 0.0,
            mesh_id: INVALID_ID,
            primitive_id: INVALID_ID,
        }
    }

    /// Returns true if this record represents a hit.
    pub fn is_hit(&self) -> bool {
        self.t < Real::INFINITY
    }

    /// Offers a candidate intersection. The record is replaced when the
    /// candidate is strictly closer, or equally close with a lower primitive
    /// id. The latter keeps results independent of traversal order.
    pub fn consider(&mut self, t: Real, u: Real, v: Real, mesh_id: u32, primitive_id: u32) {
        if t == Real::INFINITY {
            return;
        }
        if t < self.t || (t == self.t && primitive_id < self.primitive_id) {
            self.t = t;
            self.u = u;
            self.v = v;
            self.mesh_id = mesh_id;
            self.primitive_id = primitive_id;
        }
    }
}

impl Default for RayHit {
    fn default() -> RayHit {
        RayHit::none()
    }
}

impl Ray {
    /// Creates a new [`Ray`] from an `origin` and a `direction`.
    /// `direction` will be normalized.
    ///
    /// # Examples
    /// ```
    /// use wbvh::ray::Ray;
    /// use wbvh::{Point3, Vector3};
    ///
    /// let origin = Point3::new(0.0, 0.0, 0.0);
    /// let direction = Vector3::new(1.0, 0.0, 0.0);
    /// let ray = Ray::new(origin, direction);
    ///
    /// assert_eq!(ray.origin, origin);
    /// assert_eq!(ray.direction, direction);
    /// ```
    pub fn new(origin: Point3, direction: Vector3) -> Ray {
        let direction = direction.normalize();
        Ray {
            origin,
            direction,
            inv_direction: direction.map(|x| 1.0 / x),
        }
    }

    /// Creates a [`Ray`] without normalizing `direction`. Object-space rays
    /// are built this way: the direction keeps the length given to it by the
    /// instance transform, so hit distances stay parameterised in world
    /// units across the two-level traversal.
    pub fn with_direction(origin: Point3, direction: Vector3) -> Ray {
        Ray {
            origin,
            direction,
            inv_direction: direction.map(|x| 1.0 / x),
        }
    }

    /// Returns this ray transformed by `transform`. The direction is not
    /// re-normalized, see [`Ray::with_direction`].
    pub fn transformed(&self, transform: &Matrix4) -> Ray {
        Ray::with_direction(
            transform.transform_point(&self.origin),
            transform.transform_vector(&self.direction),
        )
    }

    /// The octant of the ray direction, encoded in 3 sign bits:
    /// `0b100` for negative x, `0b010` for negative y, `0b001` for negative z.
    pub fn octant(&self) -> u32 {
        (if self.direction.x < 0.0 { 0b100 } else { 0 })
            | (if self.direction.y < 0.0 { 0b010 } else { 0 })
            | (if self.direction.z < 0.0 { 0b001 } else { 0 })
    }

    /// The inverse octant replicated into all four bytes, as consumed by the
    /// 8-wide traversal's hit-mask arithmetic.
    pub fn octant_inv4(&self) -> u32 {
        (7 - self.octant()) * 0x0101_0101
    }

    /// Slab test of this [`Ray`] against an [`Aabb`], bounded above by
    /// `t_max` (the current best hit distance, or the shadow distance).
    ///
    /// Returns `(t_near, t_far)` with `t_near` clamped to [`EPSILON`] and
    /// `t_far` clamped to `t_max`; the box is hit iff `t_near < t_far`.
    #[inline(always)]
    pub fn aabb_intersect(&self, aabb: &Aabb, t_max: Real) -> (Real, Real) {
        let t0 = (aabb.min - self.origin).component_mul(&self.inv_direction);
        let t1 = (aabb.max - self.origin).component_mul(&self.inv_direction);

        let t_near = fast_max(
            fast_min(t0.x, t1.x),
            fast_max(fast_min(t0.y, t1.y), fast_max(fast_min(t0.z, t1.z), EPSILON)),
        );
        let t_far = fast_min(
            fast_max(t0.x, t1.x),
            fast_min(fast_max(t0.y, t1.y), fast_min(fast_max(t0.z, t1.z), t_max)),
        );

        (t_near, t_far)
    }

    /// Returns true if this [`Ray`] intersects `aabb` anywhere in front of
    /// the origin.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let (t_near, t_far) = self.aabb_intersect(aabb, Real::INFINITY);
        t_near < t_far
    }

    /// Implementation of the
    /// [Möller-Trumbore triangle/ray intersection algorithm](https://en.wikipedia.org/wiki/M%C3%B6ller%E2%80%93Trumbore_intersection_algorithm).
    /// Returns the distance to the intersection, as well as
    /// the u and v coordinates of the intersection.
    /// The distance is set to +INFINITY if the ray does not intersect the
    /// triangle. Both faces are intersected; the path tracer's triangles are
    /// two-sided.
    #[allow(clippy::many_single_char_names)]
    pub fn intersects_triangle(&self, a: &Point3, b: &Point3, c: &Point3) -> Intersection {
        let a_to_b = *b - *a;
        let a_to_c = *c - *a;

        // Begin calculating determinant - also used to calculate u parameter
        // u_vec lies in view plane
        // length of a_to_c in view_plane = |u_vec| = |a_to_c|*sin(a_to_c, dir)
        let u_vec = self.direction.cross(&a_to_c);

        // If determinant is near zero, ray lies in plane of triangle
        // The determinant corresponds to the parallelepiped volume:
        // det = 0 => [dir, a_to_b, a_to_c] not linearly independant
        let det = a_to_b.dot(&u_vec);
        if det.abs() < EPSILON {
            return Intersection::new(Real::INFINITY, 0.0, 0.0);
        }

        let inv_det = 1.0 / det;

        // Vector from point a to ray origin
        let a_to_origin = self.origin - *a;

        // Calculate u parameter
        let u = a_to_origin.dot(&u_vec) * inv_det;

        // Test bounds: u < 0 || u > 1 => outside of triangle
        if !(0.0..=1.0).contains(&u) {
            return Intersection::new(Real::INFINITY, u, 0.0);
        }

        // Prepare to test v parameter
        let v_vec = a_to_origin.cross(&a_to_b);

        // Calculate v parameter and test bound
        let v = self.direction.dot(&v_vec) * inv_det;
        // The intersection lies outside of the triangle
        if v < 0.0 || u + v > 1.0 {
            return Intersection::new(Real::INFINITY, u, v);
        }

        let dist = a_to_c.dot(&v_vec) * inv_det;

        if dist > EPSILON {
            Intersection::new(dist, u, v)
        } else {
            Intersection::new(Real::INFINITY, u, v)
        }
    }
}

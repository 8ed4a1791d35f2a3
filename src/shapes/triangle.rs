use crate::aabb::{Aabb, Bounded, Primitive};
use crate::ray::{Intersection, Ray};
use crate::{Point3, Vector2, Vector3};

/// A triangle with per-vertex normals and texture coordinates, the
/// primitive the path tracer renders.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Triangle {
    /// First vertex position.
    pub position_0: Point3,
    /// Second vertex position.
    pub position_1: Point3,
    /// Third vertex position.
    pub position_2: Point3,

    /// First vertex normal.
    pub normal_0: Vector3,
    /// Second vertex normal.
    pub normal_1: Vector3,
    /// Third vertex normal.
    pub normal_2: Vector3,

    /// First vertex texture coordinate.
    pub tex_coord_0: Vector2,
    /// Second vertex texture coordinate.
    pub tex_coord_1: Vector2,
    /// Third vertex texture coordinate.
    pub tex_coord_2: Vector2,
}

impl Triangle {
    /// Creates a triangle from three positions. The vertex normals are set
    /// to the face normal and the texture coordinates to zero.
    pub fn new(position_0: Point3, position_1: Point3, position_2: Point3) -> Triangle {
        let face_normal = (position_1 - position_0)
            .cross(&(position_2 - position_0))
            .normalize();

        Triangle {
            position_0,
            position_1,
            position_2,
            normal_0: face_normal,
            normal_1: face_normal,
            normal_2: face_normal,
            tex_coord_0: Vector2::zeros(),
            tex_coord_1: Vector2::zeros(),
            tex_coord_2: Vector2::zeros(),
        }
    }

    /// Creates a triangle with explicit shading attributes.
    #[allow(clippy::too_many_arguments)]
    pub fn with_attributes(
        position_0: Point3,
        position_1: Point3,
        position_2: Point3,
        normal_0: Vector3,
        normal_1: Vector3,
        normal_2: Vector3,
        tex_coord_0: Vector2,
        tex_coord_1: Vector2,
        tex_coord_2: Vector2,
    ) -> Triangle {
        Triangle {
            position_0,
            position_1,
            position_2,
            normal_0,
            normal_1,
            normal_2,
            tex_coord_0,
            tex_coord_1,
            tex_coord_2,
        }
    }

    /// The three vertex positions as an array, in winding order.
    pub fn positions(&self) -> [Point3; 3] {
        [self.position_0, self.position_1, self.position_2]
    }

    /// Intersects `ray` with this triangle.
    pub fn intersect(&self, ray: &Ray) -> Intersection {
        ray.intersects_triangle(&self.position_0, &self.position_1, &self.position_2)
    }
}

impl Bounded for Triangle {
    /// The triangle's [`Aabb`], inflated along any degenerate axis so that
    /// axis-aligned triangles still have boxes with volume.
    fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::empty();
        aabb.grow_mut(&self.position_0);
        aabb.grow_mut(&self.position_1);
        aabb.grow_mut(&self.position_2);
        aabb.fix_if_needed();
        aabb
    }
}

impl Primitive for Triangle {
    fn center(&self) -> Point3 {
        self.aabb().center()
    }
}

#[cfg(test)]
mod tests {
    use super::Triangle;
    use crate::aabb::{Bounded, Primitive};
    use crate::ray::Ray;
    use crate::{Point3, Vector3};

    fn unit_z_triangle() -> Triangle {
        Triangle::new(
            Point3::new(-1.0, -1.0, 1.0),
            Point3::new(1.0, -1.0, 1.0),
            Point3::new(0.0, 1.0, 1.0),
        )
    }

    #[test]
    fn test_aabb_is_fixed() {
        // The triangle is flat in z; its box must still have volume there.
        let aabb = unit_z_triangle().aabb();
        assert!(aabb.is_valid());
        assert!(aabb.min.z < 1.0 && aabb.max.z > 1.0);
    }

    #[test]
    fn test_center_is_inside_aabb() {
        let triangle = unit_z_triangle();
        assert!(triangle.aabb().contains(&triangle.center()));
    }

    #[test]
    fn test_intersect_from_both_sides() {
        let triangle = unit_z_triangle();

        let front = Ray::new(Point3::new(0.0, 0.0, 0.0), Vector3::new(0.0, 0.0, 1.0));
        let hit = triangle.intersect(&front);
        assert!((hit.distance - 1.0).abs() < 1e-5);

        let back = Ray::new(Point3::new(0.0, 0.0, 2.0), Vector3::new(0.0, 0.0, -1.0));
        let hit = triangle.intersect(&back);
        assert!((hit.distance - 1.0).abs() < 1e-5);
    }
}

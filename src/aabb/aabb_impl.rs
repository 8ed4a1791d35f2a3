use crate::axis::Axis;
use crate::{Matrix4, Point3, Real, Vector3};
use std::fmt;
use std::ops::Index;

/// An axis-aligned bounding box described by its minimum and maximum corner.
///
/// An [`Aabb`] is in one of two states: *valid*, with `min < max` on every
/// axis, or the *empty* sentinel with `min = +∞` and `max = −∞`. Joining the
/// empty box with anything yields the other operand, which makes it the
/// identity element for [`Aabb::join`] and [`Aabb::grow`].
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Aabb {
    /// Minimum coordinates.
    pub min: Point3,

    /// Maximum coordinates.
    pub max: Point3,
}

impl fmt::Display for Aabb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Min bound: {}; Max bound: {}", self.min, self.max)
    }
}

impl Aabb {
    /// Creates a new [`Aabb`] with the given bounds.
    ///
    /// # Examples
    /// ```
    /// use wbvh::aabb::Aabb;
    /// use wbvh::Point3;
    ///
    /// let aabb = Aabb::with_bounds(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
    /// assert_eq!(aabb.min.x, -1.0);
    /// assert_eq!(aabb.max.x, 1.0);
    /// ```
    pub fn with_bounds(min: Point3, max: Point3) -> Aabb {
        Aabb { min, max }
    }

    /// Creates a new empty [`Aabb`], the identity element for joining.
    pub fn empty() -> Aabb {
        Aabb {
            min: Point3::new(Real::INFINITY, Real::INFINITY, Real::INFINITY),
            max: Point3::new(Real::NEG_INFINITY, Real::NEG_INFINITY, Real::NEG_INFINITY),
        }
    }

    /// Creates an [`Aabb`] that contains all of `points`.
    pub fn from_points(points: &[Point3]) -> Aabb {
        points.iter().fold(Aabb::empty(), |aabb, p| aabb.grow(p))
    }

    /// Returns true if this is the empty sentinel.
    pub fn is_empty(&self) -> bool {
        self.min.x == Real::INFINITY
            && self.min.y == Real::INFINITY
            && self.min.z == Real::INFINITY
            && self.max.x == Real::NEG_INFINITY
            && self.max.y == Real::NEG_INFINITY
            && self.max.z == Real::NEG_INFINITY
    }

    /// Returns true if `min < max` holds on every axis.
    pub fn is_valid(&self) -> bool {
        self.max.x > self.min.x && self.max.y > self.min.y && self.max.z > self.min.z
    }

    /// Returns true if both corners are finite.
    pub fn is_finite(&self) -> bool {
        self.min.coords.iter().all(|c| c.is_finite()) && self.max.coords.iter().all(|c| c.is_finite())
    }

    /// Makes sure the [`Aabb`] is non-zero along every axis, inflating any
    /// flat axis by a geometrically growing epsilon. Intersection math
    /// downstream assumes boxes with volume; a box around an axis-aligned
    /// triangle would otherwise have zero extent along one axis.
    pub fn fix_if_needed(&mut self) {
        const FIX_EPSILON: Real = 0.001;

        if self.is_empty() {
            return;
        }

        for axis in Axis::ALL {
            let mut eps = FIX_EPSILON;
            while self.max[axis] - self.min[axis] < eps {
                self.min[axis] -= eps;
                self.max[axis] += eps;
                eps *= 2.0;
            }
        }
    }

    /// Returns a joined copy, see [`Aabb::join_mut`].
    pub fn join(&self, other: &Aabb) -> Aabb {
        let mut result = *self;
        result.join_mut(other);
        result
    }

    /// Expands this [`Aabb`] to also contain `other`.
    pub fn join_mut(&mut self, other: &Aabb) {
        self.min = Point3::new(
            self.min.x.min(other.min.x),
            self.min.y.min(other.min.y),
            self.min.z.min(other.min.z),
        );
        self.max = Point3::new(
            self.max.x.max(other.max.x),
            self.max.y.max(other.max.y),
            self.max.z.max(other.max.z),
        );
    }

    /// Returns a grown copy, see [`Aabb::grow_mut`].
    pub fn grow(&self, point: &Point3) -> Aabb {
        let mut result = *self;
        result.grow_mut(point);
        result
    }

    /// Expands this [`Aabb`] to also contain `point`.
    pub fn grow_mut(&mut self, point: &Point3) {
        self.min = Point3::new(
            self.min.x.min(point.x),
            self.min.y.min(point.y),
            self.min.z.min(point.z),
        );
        self.max = Point3::new(
            self.max.x.max(point.x),
            self.max.y.max(point.y),
            self.max.z.max(point.z),
        );
    }

    /// Returns the overlap of two [`Aabb`]s. The result may be empty or
    /// inverted; callers that need a valid box should check [`Aabb::is_valid`].
    pub fn intersection(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Point3::new(
                self.min.x.max(other.min.x),
                self.min.y.max(other.min.y),
                self.min.z.max(other.min.z),
            ),
            max: Point3::new(
                self.max.x.min(other.max.x),
                self.max.y.min(other.max.y),
                self.max.z.min(other.max.z),
            ),
        }
    }

    /// Returns true if `point` lies inside this [`Aabb`] (bounds inclusive).
    pub fn contains(&self, point: &Point3) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    /// Returns true if `other` lies inside this [`Aabb`], allowing a margin
    /// of `epsilon` on every side. Useful for containment assertions in the
    /// presence of floating point error.
    pub fn approx_contains_aabb_eps(&self, other: &Aabb, epsilon: Real) -> bool {
        other.min.x >= self.min.x - epsilon
            && other.min.y >= self.min.y - epsilon
            && other.min.z >= self.min.z - epsilon
            && other.max.x <= self.max.x + epsilon
            && other.max.y <= self.max.y + epsilon
            && other.max.z <= self.max.z + epsilon
    }

    /// Returns the center point of the [`Aabb`].
    pub fn center(&self) -> Point3 {
        self.min + (self.max - self.min) * 0.5
    }

    /// Returns the size of the [`Aabb`] along each axis.
    pub fn size(&self) -> Vector3 {
        self.max - self.min
    }

    /// Returns the total surface area, `2·(dx·dy + dy·dz + dz·dx)`.
    /// The empty sentinel has surface area zero.
    pub fn surface_area(&self) -> Real {
        if self.is_empty() {
            return 0.0;
        }
        let size = self.size();
        2.0 * (size.x * size.y + size.y * size.z + size.z * size.x)
    }

    /// Returns the axis along which the [`Aabb`] is widest.
    pub fn largest_axis(&self) -> Axis {
        let size = self.size();
        if size.x > size.y && size.x > size.z {
            Axis::X
        } else if size.y > size.z {
            Axis::Y
        } else {
            Axis::Z
        }
    }

    /// Transforms all eight corners by `transform` and wraps a new [`Aabb`]
    /// around the result.
    pub fn transform(&self, transform: &Matrix4) -> Aabb {
        let mut result = Aabb::empty();
        for corner in 0..8usize {
            let p = Point3::new(
                self[corner & 0b001].x,
                self[(corner >> 1) & 0b001].y,
                self[(corner >> 2) & 0b001].z,
            );
            result.grow_mut(&transform.transform_point(&p));
        }
        result
    }
}

/// Make [`Aabb`]s indexable. `aabb[0]` gives a reference to the minimum
/// bound. All other indices return a reference to the maximum bound.
impl Index<usize> for Aabb {
    type Output = Point3;

    fn index(&self, index: usize) -> &Point3 {
        if index == 0 {
            &self.min
        } else {
            &self.max
        }
    }
}

impl Default for Aabb {
    fn default() -> Aabb {
        Aabb::empty()
    }
}

/// A trait implemented by things which can be bounded by an [`Aabb`].
pub trait Bounded {
    /// Returns the [`Aabb`] bounding `self`.
    fn aabb(&self) -> Aabb;
}

impl Bounded for Aabb {
    fn aabb(&self) -> Aabb {
        *self
    }
}

/// A trait implemented by things a BVH can be built over: anything bounded
/// which additionally exposes a centroid for SAH partitioning.
pub trait Primitive: Bounded {
    /// Returns the centroid used to sort this primitive along each axis.
    fn center(&self) -> Point3;
}

#[cfg(test)]
mod tests {
    use crate::aabb::{Aabb, Bounded};
    use crate::testbase::{tuple_to_point, tuplevec_small_strategy, TupleVec};
    use crate::Point3;

    use proptest::prelude::*;

    #[test]
    fn test_empty_is_join_identity() {
        let aabb = Aabb::with_bounds(Point3::new(-1.0, -2.0, -3.0), Point3::new(1.0, 2.0, 3.0));

        assert_eq!(Aabb::empty().join(&aabb), aabb);
        assert_eq!(aabb.join(&Aabb::empty()), aabb);
        assert_eq!(Aabb::empty().surface_area(), 0.0);
    }

    #[test]
    fn test_surface_area() {
        let aabb = Aabb::with_bounds(Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 2.0, 3.0));
        assert_eq!(aabb.surface_area(), 2.0 * (2.0 + 6.0 + 3.0));
    }

    #[test]
    fn test_fix_if_needed_inflates_flat_axes() {
        let mut aabb = Aabb::with_bounds(Point3::new(0.0, 0.0, 1.0), Point3::new(4.0, 4.0, 1.0));
        aabb.fix_if_needed();

        assert!(aabb.is_valid());
        assert!(aabb.max.z > 1.0 && aabb.min.z < 1.0);
        // The non-degenerate axes are untouched.
        assert_eq!(aabb.min.x, 0.0);
        assert_eq!(aabb.max.x, 4.0);
    }

    #[test]
    fn test_fix_if_needed_keeps_empty_empty() {
        let mut aabb = Aabb::empty();
        aabb.fix_if_needed();
        assert!(aabb.is_empty());
    }

    #[test]
    fn test_transform_translation() {
        let aabb = Aabb::with_bounds(Point3::new(-1.0, -1.0, -1.0), Point3::new(1.0, 1.0, 1.0));
        let transform = crate::Matrix4::new_translation(&crate::Vector3::new(5.0, 0.0, 0.0));
        let moved = aabb.transform(&transform);

        assert_eq!(moved.min, Point3::new(4.0, -1.0, -1.0));
        assert_eq!(moved.max, Point3::new(6.0, 1.0, 1.0));
    }

    proptest! {
        // Test whether an `Aabb` always contains its center.
        #[test]
        fn test_aabb_contains_center(a in tuplevec_small_strategy(),
                                     b in tuplevec_small_strategy()) {
            let aabb = Aabb::empty().grow(&tuple_to_point(&a)).grow(&tuple_to_point(&b));
            assert!(aabb.contains(&aabb.center()));
        }

        // Test whether the joint of two point-sized `Aabb`s contains both points.
        #[test]
        fn test_join_two_points(a: TupleVec, b: TupleVec) {
            let a = tuple_to_point(&a);
            let b = tuple_to_point(&b);

            let aabb_a = a.aabb();
            let aabb_b = b.aabb();
            let joint = aabb_a.join(&aabb_b);

            assert!(joint.contains(&a));
            assert!(joint.contains(&b));
        }

        // Test whether the intersection of an `Aabb` with itself is the identity.
        #[test]
        fn test_intersection_identity(a in tuplevec_small_strategy(),
                                      b in tuplevec_small_strategy()) {
            let aabb = Aabb::empty().grow(&tuple_to_point(&a)).grow(&tuple_to_point(&b));
            assert_eq!(aabb.intersection(&aabb), aabb);
        }
    }

    impl Bounded for Point3 {
        fn aabb(&self) -> Aabb {
            Aabb::with_bounds(*self, *self)
        }
    }
}

//! The compressed 8-wide BVH: 80-byte nodes with a shared quantisation
//! grid, a hit-mask child test, and octant-invariant child ordering.

mod builder;

use crate::aabb::Aabb;
use crate::ray::Ray;
use crate::{Point3, Real, Vector3, EPSILON};

/// A node of the compressed 8-wide BVH, 80 bytes in its on-disk form.
///
/// Child boxes are quantised to bytes on a grid anchored at `p` with a
/// power-of-two step per axis, stored as the raw biased exponent in `e`.
/// `meta[i]` describes slot `i`: zero for an empty slot; for a leaf the
/// low five bits hold the slot's first-triangle offset and bits 5..8 a
/// unary triangle count; for an inner child the low five bits hold
/// `24 + slot` and bit 5 is set. `imask` has one bit per inner slot.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BvhNode8 {
    /// Origin of the quantisation grid; the node's minimum corner.
    pub p: Point3,
    /// Biased exponent bytes of the per-axis grid step.
    pub e: [u8; 3],
    /// Bit set of slots holding inner children.
    pub imask: u8,
    /// Index of the first inner child node.
    pub base_index_child: u32,
    /// Offset of the node's first entry in the triangle index table.
    pub base_index_triangle: u32,
    /// Per-slot metadata, see the type docs.
    pub meta: [u8; 8],
    /// Quantised minimum x per slot.
    pub quantized_min_x: [u8; 8],
    /// Quantised maximum x per slot.
    pub quantized_max_x: [u8; 8],
    /// Quantised minimum y per slot.
    pub quantized_min_y: [u8; 8],
    /// Quantised maximum y per slot.
    pub quantized_max_y: [u8; 8],
    /// Quantised minimum z per slot.
    pub quantized_min_z: [u8; 8],
    /// Quantised maximum z per slot.
    pub quantized_max_z: [u8; 8],
}

impl Default for BvhNode8 {
    fn default() -> BvhNode8 {
        BvhNode8 {
            p: Point3::new(0.0, 0.0, 0.0),
            e: [0; 3],
            imask: 0,
            base_index_child: 0,
            base_index_triangle: 0,
            meta: [0; 8],
            quantized_min_x: [0; 8],
            quantized_max_x: [0; 8],
            quantized_min_y: [0; 8],
            quantized_max_y: [0; 8],
            quantized_min_z: [0; 8],
            quantized_max_z: [0; 8],
        }
    }
}

#[inline(always)]
fn extract_byte(word: u32, byte: u32) -> u32 {
    (word >> (byte * 8)) & 0xff
}

impl BvhNode8 {
    /// Returns true if slot `i` holds an inner child.
    pub fn is_inner(&self, i: usize) -> bool {
        self.imask & (1 << i) != 0
    }

    /// Returns true if slot `i` is used at all.
    pub fn is_used(&self, i: usize) -> bool {
        self.meta[i] != 0
    }

    /// Dequantises the box of slot `i` back into world coordinates.
    pub fn slot_aabb(&self, i: usize) -> Aabb {
        let e = self.grid_step();
        Aabb::with_bounds(
            Point3::new(
                self.p.x + self.quantized_min_x[i] as Real * e.x,
                self.p.y + self.quantized_min_y[i] as Real * e.y,
                self.p.z + self.quantized_min_z[i] as Real * e.z,
            ),
            Point3::new(
                self.p.x + self.quantized_max_x[i] as Real * e.x,
                self.p.y + self.quantized_max_y[i] as Real * e.y,
                self.p.z + self.quantized_max_z[i] as Real * e.z,
            ),
        )
    }

    /// The per-axis grid step, reconstructed from the exponent bytes.
    pub fn grid_step(&self) -> Vector3 {
        Vector3::new(
            Real::from_bits((self.e[0] as u32) << 23),
            Real::from_bits((self.e[1] as u32) << 23),
            Real::from_bits((self.e[2] as u32) << 23),
        )
    }

    /// Tests `ray` against all eight quantised child boxes at once.
    ///
    /// The returned hit mask carries leaf slots as triangle bits in its low
    /// 24 bits and inner slots in its high byte, each inner bit placed at
    /// `24 + (slot XOR oct_inv)` so that taking the highest set bit visits
    /// children front to back for the ray's octant.
    pub fn intersect(&self, ray: &Ray, oct_inv4: u32, max_distance: Real) -> u32 {
        let e = self.grid_step();
        let adjusted_ray_direction_inv = Vector3::new(
            e.x * ray.inv_direction.x,
            e.y * ray.inv_direction.y,
            e.z * ray.inv_direction.z,
        );
        let adjusted_ray_origin = (self.p - ray.origin).component_mul(&ray.inv_direction);

        let mut hit_mask = 0u32;

        let neg_x = ray.direction.x < 0.0;
        let neg_y = ray.direction.y < 0.0;
        let neg_z = ray.direction.z < 0.0;

        for half in 0..2 {
            let meta4 = u32::from_le_bytes([
                self.meta[half * 4],
                self.meta[half * 4 + 1],
                self.meta[half * 4 + 2],
                self.meta[half * 4 + 3],
            ]);

            let is_inner4 = (meta4 & (meta4 << 1)) & 0x1010_1010;
            let inner_mask4 = (is_inner4 >> 4) * 0xff;
            let bit_index4 = (meta4 ^ (oct_inv4 & inner_mask4)) & 0x1f1f_1f1f;
            let child_bits4 = (meta4 >> 5) & 0x0707_0707;

            for j in 0..4 {
                let slot = half * 4 + j;

                // Select near and far planes based on the ray octant.
                let (q_min_x, q_max_x) = if neg_x {
                    (self.quantized_max_x[slot], self.quantized_min_x[slot])
                } else {
                    (self.quantized_min_x[slot], self.quantized_max_x[slot])
                };
                let (q_min_y, q_max_y) = if neg_y {
                    (self.quantized_max_y[slot], self.quantized_min_y[slot])
                } else {
                    (self.quantized_min_y[slot], self.quantized_max_y[slot])
                };
                let (q_min_z, q_max_z) = if neg_z {
                    (self.quantized_max_z[slot], self.quantized_min_z[slot])
                } else {
                    (self.quantized_min_z[slot], self.quantized_max_z[slot])
                };

                // Account for grid origin and scale.
                let t_min_x = q_min_x as Real * adjusted_ray_direction_inv.x + adjusted_ray_origin.x;
                let t_min_y = q_min_y as Real * adjusted_ray_direction_inv.y + adjusted_ray_origin.y;
                let t_min_z = q_min_z as Real * adjusted_ray_direction_inv.z + adjusted_ray_origin.z;
                let t_max_x = q_max_x as Real * adjusted_ray_direction_inv.x + adjusted_ray_origin.x;
                let t_max_y = q_max_y as Real * adjusted_ray_direction_inv.y + adjusted_ray_origin.y;
                let t_max_z = q_max_z as Real * adjusted_ray_direction_inv.z + adjusted_ray_origin.z;

                let t_min = t_min_x.max(t_min_y).max(t_min_z.max(EPSILON));
                let t_max = t_max_x.min(t_max_y).min(t_max_z.min(max_distance));

                if t_min < t_max {
                    let child_bits = extract_byte(child_bits4, j as u32);
                    let bit_index = extract_byte(bit_index4, j as u32);
                    hit_mask |= child_bits << bit_index;
                }
            }
        }

        hit_mask
    }
}

/// The compressed 8-wide BVH plus its permuted triangle index table.
/// Duplicate indices from a spatial-split input are retained.
#[derive(Debug, Clone)]
pub struct CwBvh {
    /// The nodes, root at index 0.
    pub nodes: Vec<BvhNode8>,

    /// Triangle indices in depth-first leaf order.
    pub indices: Vec<u32>,
}

impl CwBvh {
    /// The bounds of the whole tree: the root's quantisation box.
    pub fn root_aabb(&self) -> Aabb {
        let root = &self.nodes[0];
        let mut aabb = Aabb::empty();
        for slot in 0..8 {
            if root.is_used(slot) {
                aabb.join_mut(&root.slot_aabb(slot));
            }
        }
        aabb
    }
}

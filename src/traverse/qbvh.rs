//! The 4-wide traversal engine.

use crate::build::Bvh;
use crate::qbvh::{BvhNode4, Qbvh, QBVH_SLOT_UNUSED};
use crate::ray::{Ray, RayHit};
use crate::scene::Scene;
use crate::shapes::Triangle;
use crate::traverse::{TraversalStack, BVH_STACK_SIZE};
use crate::Real;

/// A stack entry: one slot of one node, waiting to be resolved. Traversal
/// starts at the bootstrap slot `(1, 0)`, which points at the root.
#[derive(Debug, Clone, Copy, Default)]
struct NodeSlot {
    node: u32,
    slot: u8,
}

/// Tests the ray against all four child boxes of `node` and returns the
/// surviving slots, ordered so the nearest is pushed last.
///
/// The four entry distances are sorted with a branch-free bubble sort on
/// their bit patterns, the slot index riding in the two low mantissa bits.
fn intersect_children(
    node: &BvhNode4,
    ray: &Ray,
    max_distance: Real,
) -> ([usize; 4], [bool; 4]) {
    let mut keys = [0u32; 4];
    let mut hit = [false; 4];

    for slot in 0..4 {
        let used = node.count[slot] != QBVH_SLOT_UNUSED;
        let (t_near, t_far) = ray.aabb_intersect(&node.aabb(slot), max_distance);
        hit[slot] = used && t_near < t_far;
        keys[slot] = (t_near.to_bits() & !0b11) | slot as u32;
    }

    for i in 1..4 {
        for j in (0..i).rev() {
            if Real::from_bits(keys[j]) < Real::from_bits(keys[j + 1]) {
                keys.swap(j, j + 1);
            }
        }
    }

    // Descending entry distance: the nearest slot comes out last.
    let order = [
        (keys[0] & 0b11) as usize,
        (keys[1] & 0b11) as usize,
        (keys[2] & 0b11) as usize,
        (keys[3] & 0b11) as usize,
    ];
    (order, hit)
}

/// Closest-hit traversal of a two-level 4-wide scene.
pub(crate) fn trace_closest(scene: &Scene, world_ray: &Ray) -> RayHit {
    let Bvh::Qbvh(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<NodeSlot, BVH_STACK_SIZE>::new();
    let mut hit = RayHit::none();

    let mut ray = *world_ray;
    let mut bvh: &Qbvh = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut mesh_id = 0u32;
    let mut tlas_stack_size: Option<usize> = None;

    if !stack.push(NodeSlot { node: 1, slot: 0 }) {
        return RayHit::none();
    }

    loop {
        if tlas_stack_size == Some(stack.len()) {
            tlas_stack_size = None;
            ray = *world_ray;
            bvh = tlas;
            triangles = None;
        }

        let Some(entry) = stack.pop() else {
            break;
        };
        let node = &bvh.nodes[entry.node as usize];
        let index = node.index[entry.slot as usize];
        let count = node.count[entry.slot as usize];
        debug_assert_ne!(count, QBVH_SLOT_UNUSED, "popped an unused slot");

        if count > 0 {
            if tlas_stack_size.is_none() {
                debug_assert_eq!(count, 1, "TLAS leaves hold a single instance");
                let instance_id = bvh.indices[index as usize];
                let instance = &scene.instances[instance_id as usize];

                mesh_id = instance_id;
                tlas_stack_size = Some(stack.len());
                if !instance.identity {
                    ray = world_ray.transformed(&instance.transform_inv);
                }

                let mesh = &scene.meshes[instance.mesh_data];
                let Bvh::Qbvh(blas) = &mesh.bvh else {
                    unreachable!("scene layout mismatch");
                };
                bvh = blas;
                triangles = Some(&mesh.triangles);
                if !stack.push(NodeSlot { node: 1, slot: 0 }) {
                    return RayHit::none();
                }
            } else {
                let triangles = triangles.expect("inside a BLAS");
                for entry in index..index + count {
                    let triangle_id = bvh.indices[entry as usize];
                    let intersection = triangles[triangle_id as usize].intersect(&ray);
                    hit.consider(
                        intersection.distance,
                        intersection.u,
                        intersection.v,
                        mesh_id,
                        triangle_id,
                    );
                }
            }
        } else {
            let child = index as u32;
            let (order, slot_hit) = intersect_children(&bvh.nodes[child as usize], &ray, hit.t);
            for slot in order {
                if slot_hit[slot] {
                    if !stack.push(NodeSlot {
                        node: child,
                        slot: slot as u8,
                    }) {
                        return RayHit::none();
                    }
                }
            }
        }
    }

    hit
}

/// Any-hit traversal of a two-level 4-wide scene.
pub(crate) fn trace_any(scene: &Scene, world_ray: &Ray, max_distance: Real) -> bool {
    let Bvh::Qbvh(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<NodeSlot, BVH_STACK_SIZE>::new();

    let mut ray = *world_ray;
    let mut bvh: &Qbvh = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut tlas_stack_size: Option<usize> = None;

    if !stack.push(NodeSlot { node: 1, slot: 0 }) {
        return false;
    }

    loop {
        if tlas_stack_size == Some(stack.len()) {
            tlas_stack_size = None;
            ray = *world_ray;
            bvh = tlas;
            triangles = None;
        }

        let Some(entry) = stack.pop() else {
            break;
        };
        let node = &bvh.nodes[entry.node as usize];
        let index = node.index[entry.slot as usize];
        let count = node.count[entry.slot as usize];
        debug_assert_ne!(count, QBVH_SLOT_UNUSED, "popped an unused slot");

        if count > 0 {
            if tlas_stack_size.is_none() {
                debug_assert_eq!(count, 1, "TLAS leaves hold a single instance");
                let instance_id = bvh.indices[index as usize];
                let instance = &scene.instances[instance_id as usize];

                tlas_stack_size = Some(stack.len());
                if !instance.identity {
                    ray = world_ray.transformed(&instance.transform_inv);
                }

                let mesh = &scene.meshes[instance.mesh_data];
                let Bvh::Qbvh(blas) = &mesh.bvh else {
                    unreachable!("scene layout mismatch");
                };
                bvh = blas;
                triangles = Some(&mesh.triangles);
                if !stack.push(NodeSlot { node: 1, slot: 0 }) {
                    return false;
                }
            } else {
                let triangles = triangles.expect("inside a BLAS");
                for entry in index..index + count {
                    let triangle_id = bvh.indices[entry as usize];
                    let intersection = triangles[triangle_id as usize].intersect(&ray);
                    if intersection.distance <= max_distance {
                        return true;
                    }
                }
            }
        } else {
            let child = index as u32;
            let (order, slot_hit) =
                intersect_children(&bvh.nodes[child as usize], &ray, max_distance);
            for slot in order {
                if slot_hit[slot] {
                    if !stack.push(NodeSlot {
                        node: child,
                        slot: slot as u8,
                    }) {
                        return false;
                    }
                }
            }
        }
    }

    false
}

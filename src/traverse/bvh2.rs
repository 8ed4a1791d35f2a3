//! The binary traversal engine.

use crate::build::Bvh;
use crate::bvh2::{Bvh2, NodeRef2};
use crate::ray::{Ray, RayHit};
use crate::scene::Scene;
use crate::shapes::Triangle;
use crate::traverse::{TraversalStack, BVH_STACK_SIZE};
use crate::Real;

/// Closest-hit traversal of a two-level binary scene.
///
/// Children are visited near-to-far using the stored split axis: the child
/// on the ray's side of the plane is pushed last so it pops first. A TLAS
/// leaf transforms the ray into the instance's object space and pushes the
/// BLAS root; when the stack unwinds back to the recorded depth the saved
/// world-space ray is restored verbatim.
pub(crate) fn trace_closest(scene: &Scene, world_ray: &Ray) -> RayHit {
    let Bvh::Bvh2(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<u32, BVH_STACK_SIZE>::new();
    let mut hit = RayHit::none();

    let mut ray = *world_ray;
    let mut bvh: &Bvh2 = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut mesh_id = 0u32;
    let mut tlas_stack_size: Option<usize> = None;

    if !stack.push(0) {
        return RayHit::none();
    }

    loop {
        if tlas_stack_size == Some(stack.len()) {
            // The instance's subtree is exhausted; back to world space.
            tlas_stack_size = None;
            ray = *world_ray;
            bvh = tlas;
            triangles = None;
        }

        let Some(node_index) = stack.pop() else {
            break;
        };
        let node = &bvh.nodes[node_index as usize];

        let (t_near, t_far) = ray.aabb_intersect(&node.aabb, hit.t);
        if t_near >= t_far {
            continue;
        }

        match node.decode() {
            NodeRef2::Internal { left, axis } => {
                let (first, second) = if ray.direction[axis] > 0.0 {
                    (left, left + 1)
                } else {
                    (left + 1, left)
                };
                if !stack.push(second) || !stack.push(first) {
                    return RayHit::none();
                }
            }
            NodeRef2::Leaf { first, count } => {
                if tlas_stack_size.is_none() {
                    debug_assert_eq!(count, 1, "TLAS leaves hold a single instance");
                    let instance_id = bvh.indices[first as usize];
                    let instance = &scene.instances[instance_id as usize];

                    mesh_id = instance_id;
                    tlas_stack_size = Some(stack.len());
                    if !instance.identity {
                        ray = world_ray.transformed(&instance.transform_inv);
                    }

                    let mesh = &scene.meshes[instance.mesh_data];
                    let Bvh::Bvh2(blas) = &mesh.bvh else {
                        unreachable!("scene layout mismatch");
                    };
                    bvh = blas;
                    triangles = Some(&mesh.triangles);
                    if !stack.push(0) {
                        return RayHit::none();
                    }
                } else {
                    let triangles = triangles.expect("inside a BLAS");
                    for entry in first..first + count {
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
            }
        }
    }

    hit
}

/// Any-hit traversal: true as soon as any intersection within
/// `max_distance` exists. Visits the same nodes as closest-hit but never
/// refines the distance bound.
pub(crate) fn trace_any(scene: &Scene, world_ray: &Ray, max_distance: Real) -> bool {
    let Bvh::Bvh2(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<u32, BVH_STACK_SIZE>::new();

    let mut ray = *world_ray;
    let mut bvh: &Bvh2 = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut tlas_stack_size: Option<usize> = None;

    if !stack.push(0) {
        return false;
    }

    loop {
        if tlas_stack_size == Some(stack.len()) {
            tlas_stack_size = None;
            ray = *world_ray;
            bvh = tlas;
            triangles = None;
        }

        let Some(node_index) = stack.pop() else {
            break;
        };
        let node = &bvh.nodes[node_index as usize];

        let (t_near, t_far) = ray.aabb_intersect(&node.aabb, max_distance);
        if t_near >= t_far {
            continue;
        }

        match node.decode() {
            NodeRef2::Internal { left, axis } => {
                let (first, second) = if ray.direction[axis] > 0.0 {
                    (left, left + 1)
                } else {
                    (left + 1, left)
                };
                if !stack.push(second) || !stack.push(first) {
                    return false;
                }
            }
            NodeRef2::Leaf { first, count } => {
                if tlas_stack_size.is_none() {
                    debug_assert_eq!(count, 1, "TLAS leaves hold a single instance");
                    let instance_id = bvh.indices[first as usize];
                    let instance = &scene.instances[instance_id as usize];

                    tlas_stack_size = Some(stack.len());
                    if !instance.identity {
                        ray = world_ray.transformed(&instance.transform_inv);
                    }

                    let mesh = &scene.meshes[instance.mesh_data];
                    let Bvh::Bvh2(blas) = &mesh.bvh else {
                        unreachable!("scene layout mismatch");
                    };
                    bvh = blas;
                    triangles = Some(&mesh.triangles);
                    if !stack.push(0) {
                        return false;
                    }
                } else {
                    let triangles = triangles.expect("inside a BLAS");
                    for entry in first..first + count {
                        let triangle_id = bvh.indices[entry as usize];
                        let intersection = triangles[triangle_id as usize].intersect(&ray);
                        if intersection.distance <= max_distance {
                            return true;
                        }
                    }
                }
            }
        }
    }

    false
}

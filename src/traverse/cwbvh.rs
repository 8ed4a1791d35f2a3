//! The 8-wide traversal engine.
//!
//! Traversal works on *groups*, a `(base, mask)` pair: a node group's high
//! byte holds the hit bits of inner children (placed at octant-dependent
//! positions) and its low byte the node's inner-child mask; a triangle
//! group's low 24 bits are pending triangle slots. Popping the highest set
//! bit visits children front to back for the ray's octant. On the GPU this
//! loop interleaves many rays and postpones diverging triangle work; with
//! one traverser both heuristics degenerate to the plain loop below.

use crate::build::Bvh;
use crate::cwbvh::CwBvh;
use crate::ray::{Ray, RayHit};
use crate::scene::Scene;
use crate::shapes::Triangle;
use crate::traverse::{TraversalStack, CWBVH_STACK_SIZE};
use crate::Real;

/// A node or triangle group.
#[derive(Debug, Clone, Copy, Default)]
struct Group {
    base: u32,
    mask: u32,
}

impl Group {
    fn root() -> Group {
        Group {
            base: 0,
            mask: 0x8000_0000,
        }
    }

    fn has_nodes(&self) -> bool {
        self.mask & 0xff00_0000 != 0
    }
}

#[inline(always)]
fn highest_bit(mask: u32) -> u32 {
    31 - mask.leading_zeros()
}

/// Decodes and pops the next child node out of `group`, returning its node
/// index. The remainder of the group, if any, must already be saved.
#[inline(always)]
fn pop_child(group: &mut Group, oct_inv4: u32) -> u32 {
    let hits_imask = group.mask;
    let child_index_offset = highest_bit(hits_imask);
    group.mask &= !(1 << child_index_offset);

    let slot_index = (child_index_offset - 24) ^ (oct_inv4 & 0xff);
    let relative_index = (hits_imask & !(u32::MAX << slot_index)).count_ones();
    group.base + relative_index
}

/// Closest-hit traversal of a two-level 8-wide scene.
pub(crate) fn trace_closest(scene: &Scene, world_ray: &Ray) -> RayHit {
    let Bvh::Cwbvh(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<Group, CWBVH_STACK_SIZE>::new();
    let mut hit = RayHit::none();

    let mut ray = *world_ray;
    let mut oct_inv4 = ray.octant_inv4();
    let mut bvh: &CwBvh = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut mesh_id = 0u32;
    let mut tlas_stack_size: Option<usize> = None;

    let mut current_group = Group::root();

    loop {
        let mut triangle_group;

        if current_group.has_nodes() {
            let child_node_index = pop_child(&mut current_group, oct_inv4);

            // If the node group is not yet empty, push it on the stack.
            if current_group.has_nodes() && !stack.push(current_group) {
                return RayHit::none();
            }

            let node = &bvh.nodes[child_node_index as usize];
            let hitmask = node.intersect(&ray, oct_inv4, hit.t);

            current_group = Group {
                base: node.base_index_child,
                mask: (hitmask & 0xff00_0000) | node.imask as u32,
            };
            triangle_group = Group {
                base: node.base_index_triangle,
                mask: hitmask & 0x00ff_ffff,
            };
        } else {
            triangle_group = current_group;
            current_group = Group::default();
        }

        while triangle_group.mask != 0 {
            if tlas_stack_size.is_none() {
                // A TLAS "triangle" is an instance: save the remaining
                // work, transform the ray, and restart at the BLAS root.
                let offset = highest_bit(triangle_group.mask);
                triangle_group.mask &= !(1 << offset);
                let instance_id = bvh.indices[(triangle_group.base + offset) as usize];

                if triangle_group.mask != 0 && !stack.push(triangle_group) {
                    return RayHit::none();
                }
                if current_group.has_nodes() && !stack.push(current_group) {
                    return RayHit::none();
                }
                tlas_stack_size = Some(stack.len());

                let instance = &scene.instances[instance_id as usize];
                mesh_id = instance_id;
                if !instance.identity {
                    ray = world_ray.transformed(&instance.transform_inv);
                    oct_inv4 = ray.octant_inv4();
                }

                let mesh = &scene.meshes[instance.mesh_data];
                let Bvh::Cwbvh(blas) = &mesh.bvh else {
                    unreachable!("scene layout mismatch");
                };
                bvh = blas;
                triangles = Some(&mesh.triangles);
                current_group = Group::root();
                break;
            } else {
                let offset = highest_bit(triangle_group.mask);
                triangle_group.mask &= !(1 << offset);

                let triangle_id = bvh.indices[(triangle_group.base + offset) as usize];
                let mesh_triangles = triangles.expect("inside a BLAS");
                let intersection = mesh_triangles[triangle_id as usize].intersect(&ray);
                hit.consider(
                    intersection.distance,
                    intersection.u,
                    intersection.v,
                    mesh_id,
                    triangle_id,
                );
            }
        }

        if !current_group.has_nodes() {
            if stack.is_empty() {
                break;
            }

            if tlas_stack_size == Some(stack.len()) {
                // The instance's subtree is exhausted; back to world space.
                tlas_stack_size = None;
                ray = *world_ray;
                oct_inv4 = world_ray.octant_inv4();
                bvh = tlas;
                triangles = None;
            }

            current_group = stack.pop().expect("stack checked non-empty");
        }
    }

    hit
}

/// Any-hit traversal of a two-level 8-wide scene.
pub(crate) fn trace_any(scene: &Scene, world_ray: &Ray, max_distance: Real) -> bool {
    let Bvh::Cwbvh(tlas) = scene.tlas() else {
        unreachable!("scene layout mismatch");
    };

    let mut stack = TraversalStack::<Group, CWBVH_STACK_SIZE>::new();

    let mut ray = *world_ray;
    let mut oct_inv4 = ray.octant_inv4();
    let mut bvh: &CwBvh = tlas;
    let mut triangles: Option<&[Triangle]> = None;
    let mut tlas_stack_size: Option<usize> = None;

    let mut current_group = Group::root();

    loop {
        let mut triangle_group;

        if current_group.has_nodes() {
            let child_node_index = pop_child(&mut current_group, oct_inv4);

            if current_group.has_nodes() && !stack.push(current_group) {
                return false;
            }

            let node = &bvh.nodes[child_node_index as usize];
            let hitmask = node.intersect(&ray, oct_inv4, max_distance);

            current_group = Group {
                base: node.base_index_child,
                mask: (hitmask & 0xff00_0000) | node.imask as u32,
            };
            triangle_group = Group {
                base: node.base_index_triangle,
                mask: hitmask & 0x00ff_ffff,
            };
        } else {
            triangle_group = current_group;
            current_group = Group::default();
        }

        while triangle_group.mask != 0 {
            if tlas_stack_size.is_none() {
                let offset = highest_bit(triangle_group.mask);
                triangle_group.mask &= !(1 << offset);
                let instance_id = bvh.indices[(triangle_group.base + offset) as usize];

                if triangle_group.mask != 0 && !stack.push(triangle_group) {
                    return false;
                }
                if current_group.has_nodes() && !stack.push(current_group) {
                    return false;
                }
                tlas_stack_size = Some(stack.len());

                let instance = &scene.instances[instance_id as usize];
                if !instance.identity {
                    ray = world_ray.transformed(&instance.transform_inv);
                    oct_inv4 = ray.octant_inv4();
                }

                let mesh = &scene.meshes[instance.mesh_data];
                let Bvh::Cwbvh(blas) = &mesh.bvh else {
                    unreachable!("scene layout mismatch");
                };
                bvh = blas;
                triangles = Some(&mesh.triangles);
                current_group = Group::root();
                break;
            } else {
                let offset = highest_bit(triangle_group.mask);
                triangle_group.mask &= !(1 << offset);

                let triangle_id = bvh.indices[(triangle_group.base + offset) as usize];
                let mesh_triangles = triangles.expect("inside a BLAS");
                let intersection = mesh_triangles[triangle_id as usize].intersect(&ray);
                if intersection.distance <= max_distance {
                    return true;
                }
            }
        }

        if !current_group.has_nodes() {
            if stack.is_empty() {
                break;
            }

            if tlas_stack_size == Some(stack.len()) {
                tlas_stack_size = None;
                ray = *world_ray;
                oct_inv4 = world_ray.octant_inv4();
                bvh = tlas;
                triangles = None;
            }

            current_group = stack.pop().expect("stack checked non-empty");
        }
    }

    false
}

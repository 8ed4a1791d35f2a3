//! Batch tracing over a [`Scene`]: the single-threaded cooperative driver
//! and, with the `rayon` feature, a worker pool pulling rays from a shared
//! atomic cursor.
//!
//! [`Scene`]: struct.Scene.html

use crate::build::Bvh;
use crate::ray::{Ray, RayHit};
use crate::scene::Scene;
use crate::traverse;
use crate::Real;

#[cfg(feature = "rayon")]
use std::marker::PhantomData;
#[cfg(feature = "rayon")]
use std::sync::atomic::{AtomicUsize, Ordering};

impl Scene {
    /// Traces one ray to its closest hit.
    pub fn trace_ray_closest(&self, ray: &Ray) -> RayHit {
        match self.tlas() {
            Bvh::Bvh2(_) => traverse::bvh2::trace_closest(self, ray),
            Bvh::Qbvh(_) => traverse::qbvh::trace_closest(self, ray),
            Bvh::Cwbvh(_) => traverse::cwbvh::trace_closest(self, ray),
        }
    }

    /// Returns true if anything lies within `max_distance` along `ray`.
    pub fn trace_ray_any(&self, ray: &Ray, max_distance: Real) -> bool {
        match self.tlas() {
            Bvh::Bvh2(_) => traverse::bvh2::trace_any(self, ray, max_distance),
            Bvh::Qbvh(_) => traverse::qbvh::trace_any(self, ray, max_distance),
            Bvh::Cwbvh(_) => traverse::cwbvh::trace_any(self, ray, max_distance),
        }
    }

    /// Traces every ray to its closest hit, one ray after another.
    ///
    /// # Panics
    /// Panics when `rays` and `hits` differ in length.
    pub fn trace_closest(&self, rays: &[Ray], hits: &mut [RayHit]) {
        assert_eq!(rays.len(), hits.len());
        for (ray, hit) in rays.iter().zip(hits.iter_mut()) {
            *hit = self.trace_ray_closest(ray);
        }
    }

    /// Shadow-ray batch: `hit_flags[i]` becomes true iff anything lies
    /// within `max_distances[i]` along `rays[i]`.
    ///
    /// # Panics
    /// Panics when the slice lengths differ.
    pub fn trace_any(&self, rays: &[Ray], max_distances: &[Real], hit_flags: &mut [bool]) {
        assert_eq!(rays.len(), max_distances.len());
        assert_eq!(rays.len(), hit_flags.len());
        for ((ray, &max_distance), flag) in rays
            .iter()
            .zip(max_distances.iter())
            .zip(hit_flags.iter_mut())
        {
            *flag = self.trace_ray_any(ray, max_distance);
        }
    }

    /// Parallel closest-hit batch: a fixed pool of workers shares an
    /// atomic ray cursor; each worker owns its traversal stack and writes
    /// only the hit slots of the rays it retired.
    ///
    /// # Panics
    /// Panics when `rays` and `hits` differ in length.
    #[cfg(feature = "rayon")]
    pub fn trace_closest_par(&self, rays: &[Ray], hits: &mut [RayHit]) {
        assert_eq!(rays.len(), hits.len());

        let rays_retired = AtomicUsize::new(0);
        let out = SharedOut::from_slice(hits);

        rayon::scope(|scope| {
            for _ in 0..rayon::current_num_threads() {
                scope.spawn(|_| loop {
                    let ray_index = rays_retired.fetch_add(1, Ordering::Relaxed);
                    if ray_index >= rays.len() {
                        break;
                    }
                    let hit = self.trace_ray_closest(&rays[ray_index]);
                    // SAFETY: the atomic cursor hands each index to exactly
                    // one worker, so no slot is written twice.
                    unsafe { out.write(ray_index, hit) };
                });
            }
        });
    }

    /// Parallel any-hit batch, see [`Scene::trace_closest_par`].
    ///
    /// # Panics
    /// Panics when the slice lengths differ.
    #[cfg(feature = "rayon")]
    pub fn trace_any_par(&self, rays: &[Ray], max_distances: &[Real], hit_flags: &mut [bool]) {
        assert_eq!(rays.len(), max_distances.len());
        assert_eq!(rays.len(), hit_flags.len());

        let rays_retired = AtomicUsize::new(0);
        let out = SharedOut::from_slice(hit_flags);

        rayon::scope(|scope| {
            for _ in 0..rayon::current_num_threads() {
                scope.spawn(|_| loop {
                    let ray_index = rays_retired.fetch_add(1, Ordering::Relaxed);
                    if ray_index >= rays.len() {
                        break;
                    }
                    let flag = self.trace_ray_any(&rays[ray_index], max_distances[ray_index]);
                    // SAFETY: the atomic cursor hands each index to exactly
                    // one worker, so no slot is written twice.
                    unsafe { out.write(ray_index, flag) };
                });
            }
        });
    }
}

/// Traces every ray in `rays` to its closest hit. Free-function form of
/// [`Scene::trace_closest`].
pub fn trace_closest(rays: &[Ray], hits: &mut [RayHit], scene: &Scene) {
    scene.trace_closest(rays, hits);
}

/// Shadow-ray batch query. Free-function form of [`Scene::trace_any`].
pub fn trace_any(rays: &[Ray], max_distances: &[Real], hit_flags: &mut [bool], scene: &Scene) {
    scene.trace_any(rays, max_distances, hit_flags);
}

/// A write-only view of the output buffer, shared across the worker pool.
/// Soundness rests on the ray cursor: every index is retired by exactly
/// one worker, so writes never alias.
#[cfg(feature = "rayon")]
struct SharedOut<'a, T> {
    ptr: *mut T,
    len: usize,
    marker: PhantomData<&'a mut T>,
}

#[cfg(feature = "rayon")]
impl<'a, T> SharedOut<'a, T> {
    fn from_slice(slice: &'a mut [T]) -> SharedOut<'a, T> {
        SharedOut {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            marker: PhantomData,
        }
    }

    /// # Safety
    /// `index` must be written by at most one thread over the lifetime of
    /// this view.
    unsafe fn write(&self, index: usize, value: T) {
        assert!(index < self.len);
        unsafe { self.ptr.add(index).write(value) };
    }
}

#[cfg(feature = "rayon")]
unsafe impl<T: Send> Send for SharedOut<'_, T> {}
#[cfg(feature = "rayon")]
unsafe impl<T: Send> Sync for SharedOut<'_, T> {}

//! This module defines a Ray structure and intersection algorithms
//! for axis aligned bounding boxes and triangles.

mod ray_impl;

pub use ray_impl::*;

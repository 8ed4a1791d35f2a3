//! Axis Aligned Bounding Boxes.

mod aabb_impl;

pub use aabb_impl::*;

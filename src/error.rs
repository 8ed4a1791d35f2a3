//! Error types for BVH construction and the on-disk BVH cache.

use thiserror::Error;

/// Errors reported while building an acceleration structure.
#[derive(Error, Debug)]
pub enum BuildError {
    /// Fewer than one primitive was supplied.
    #[error("cannot build a BVH over an empty primitive list")]
    EmptyInput,

    /// A primitive has a non-finite bounding box or a NaN centroid.
    #[error("primitive {index} has a non-finite AABB or centroid")]
    InvalidPrimitive {
        /// Index of the offending primitive in the input slice.
        index: usize,
    },

    /// An instance transform could not be inverted.
    #[error("instance transform is singular")]
    SingularTransform,

    /// An instance references a mesh that does not exist.
    #[error("instance {instance} references unknown mesh {mesh}")]
    UnknownMesh {
        /// Index of the offending instance.
        instance: usize,
        /// The mesh id the instance referenced.
        mesh: usize,
    },

    /// A mesh carries a different BVH layout than the scene was asked to
    /// traverse.
    #[error("mesh {mesh} holds a different BVH layout than the scene")]
    LayoutMismatch {
        /// Index of the offending mesh.
        mesh: usize,
    },
}

/// Errors reported while reading a BVH cache file. Callers are expected to
/// discard the cache and rebuild on any of these.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The underlying file could not be read or written.
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The header or body of the cache did not parse.
    #[error("corrupt cache file: {0}")]
    Corrupt(&'static str),

    /// The cache was written by an incompatible version of this crate.
    #[error("unsupported cache version {0}")]
    UnsupportedVersion(u32),

    /// The cache holds a different node layout than the one requested.
    #[error("cache holds node type {found}, expected {expected}")]
    WrongLayout {
        /// The node-type tag the caller asked for.
        expected: u32,
        /// The node-type tag found in the file.
        found: u32,
    },

    /// The source geometry is newer than the cache.
    #[error("cache is older than its source file")]
    Stale,
}

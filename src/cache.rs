//! The on-disk BVH cache.
//!
//! Building a spatial-split BVH over a large mesh dwarfs the cost of
//! loading the mesh itself, so finished BVHs are persisted next to their
//! source geometry. The format is explicit little-endian serialisation,
//! field by field; the in-memory node types never hit the disk directly.
//!
//! Layout: a 20-byte header (magic `"BVH "`, format version, node-type
//! tag ∈ {2, 4, 8}, node count, index count), the tight-packed node array
//! (32 / 128 / 80 bytes per node), then the primitive index table.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::aabb::Aabb;
use crate::build::Bvh;
use crate::bvh2::{Bvh2, BvhNode2};
use crate::cwbvh::{BvhNode8, CwBvh};
use crate::error::CacheError;
use crate::qbvh::{BvhNode4, Qbvh};
use crate::{Point3, Real};

/// The four magic bytes opening every cache file.
pub const CACHE_MAGIC: [u8; 4] = *b"BVH ";

/// Format version; bumped whenever any node layout changes.
pub const CACHE_VERSION: u32 = 1;

/// On-disk size of a binary node.
pub const BVH2_NODE_SIZE: usize = 32;
/// On-disk size of a 4-wide node.
pub const QBVH_NODE_SIZE: usize = 128;
/// On-disk size of an 8-wide node.
pub const CWBVH_NODE_SIZE: usize = 80;

/// Writes `bvh` to `path`, atomically enough for a cache: a partial write
/// is detected as corruption on the next load.
pub fn store(path: &Path, bvh: &Bvh) -> Result<(), CacheError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_bvh(&mut writer, bvh)?;
    writer.flush()?;
    Ok(())
}

/// Loads a BVH from `path`, rejecting it when the source geometry was
/// modified after the cache was written.
pub fn load(path: &Path, source_modified: SystemTime) -> Result<Bvh, CacheError> {
    let file = File::open(path)?;
    let cache_modified = file.metadata()?.modified()?;
    if source_modified > cache_modified {
        return Err(CacheError::Stale);
    }
    read_bvh(&mut BufReader::new(file))
}

/// Loads the cache at `cache_path` for the geometry file `source_path`,
/// comparing modification times.
pub fn load_for_source(cache_path: &Path, source_path: &Path) -> Result<Bvh, CacheError> {
    let source_modified = std::fs::metadata(source_path)?.modified()?;
    load(cache_path, source_modified)
}

/// Serialises a BVH into `writer`.
pub fn write_bvh<W: Write>(writer: &mut W, bvh: &Bvh) -> io::Result<()> {
    writer.write_all(&CACHE_MAGIC)?;
    writer.write_u32::<LittleEndian>(CACHE_VERSION)?;
    writer.write_u32::<LittleEndian>(bvh.node_type())?;

    match bvh {
        Bvh::Bvh2(bvh) => {
            write_counts(writer, bvh.nodes.len(), bvh.indices.len())?;
            for node in &bvh.nodes {
                write_node2(writer, node)?;
            }
            write_indices(writer, &bvh.indices)
        }
        Bvh::Qbvh(bvh) => {
            write_counts(writer, bvh.nodes.len(), bvh.indices.len())?;
            for node in &bvh.nodes {
                write_node4(writer, node)?;
            }
            write_indices(writer, &bvh.indices)
        }
        Bvh::Cwbvh(bvh) => {
            write_counts(writer, bvh.nodes.len(), bvh.indices.len())?;
            for node in &bvh.nodes {
                write_node8(writer, node)?;
            }
            write_indices(writer, &bvh.indices)
        }
    }
}

/// Parses a BVH out of `reader`. Any structural problem, including a
/// truncated body, reports the cache as corrupt.
pub fn read_bvh<R: Read>(reader: &mut R) -> Result<Bvh, CacheError> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| CacheError::Corrupt("missing magic"))?;
    if magic != CACHE_MAGIC {
        return Err(CacheError::Corrupt("bad magic"));
    }

    let version = read_u32(reader)?;
    if version != CACHE_VERSION {
        return Err(CacheError::UnsupportedVersion(version));
    }

    let node_type = read_u32(reader)?;
    let node_count = read_u32(reader)? as usize;
    let index_count = read_u32(reader)? as usize;

    match node_type {
        2 => {
            let mut nodes = Vec::with_capacity(node_count.min(MAX_PREALLOC));
            for _ in 0..node_count {
                nodes.push(read_node2(reader)?);
            }
            let indices = read_indices(reader, index_count)?;
            Ok(Bvh::Bvh2(Bvh2 { nodes, indices }))
        }
        4 => {
            let mut nodes = Vec::with_capacity(node_count.min(MAX_PREALLOC));
            for _ in 0..node_count {
                nodes.push(read_node4(reader)?);
            }
            let indices = read_indices(reader, index_count)?;
            Ok(Bvh::Qbvh(Qbvh { nodes, indices }))
        }
        8 => {
            let mut nodes = Vec::with_capacity(node_count.min(MAX_PREALLOC));
            for _ in 0..node_count {
                nodes.push(read_node8(reader)?);
            }
            let indices = read_indices(reader, index_count)?;
            Ok(Bvh::Cwbvh(CwBvh { nodes, indices }))
        }
        _ => Err(CacheError::Corrupt("unknown node type")),
    }
}

/// Like [`load`], but additionally requires the cache to hold the layout
/// the renderer was configured for.
pub fn load_expected(
    path: &Path,
    source_modified: SystemTime,
    expected: crate::build::BvhType,
) -> Result<Bvh, CacheError> {
    let bvh = load(path, source_modified)?;
    if bvh.node_type() != expected.node_type() {
        return Err(CacheError::WrongLayout {
            expected: expected.node_type(),
            found: bvh.node_type(),
        });
    }
    Ok(bvh)
}

/// Upper bound on speculative preallocation, so a corrupt header cannot
/// ask for gigabytes up front.
const MAX_PREALLOC: usize = 1 << 20;

fn write_counts<W: Write>(writer: &mut W, nodes: usize, indices: usize) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(nodes as u32)?;
    writer.write_u32::<LittleEndian>(indices as u32)
}

fn write_indices<W: Write>(writer: &mut W, indices: &[u32]) -> io::Result<()> {
    for &index in indices {
        writer.write_u32::<LittleEndian>(index)?;
    }
    Ok(())
}

fn read_indices<R: Read>(reader: &mut R, count: usize) -> Result<Vec<u32>, CacheError> {
    let mut indices = Vec::with_capacity(count.min(MAX_PREALLOC));
    for _ in 0..count {
        indices.push(read_u32(reader)?);
    }
    Ok(indices)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, CacheError> {
    reader
        .read_u32::<LittleEndian>()
        .map_err(|_| CacheError::Corrupt("truncated file"))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<Real, CacheError> {
    reader
        .read_f32::<LittleEndian>()
        .map_err(|_| CacheError::Corrupt("truncated file"))
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32, CacheError> {
    reader
        .read_i32::<LittleEndian>()
        .map_err(|_| CacheError::Corrupt("truncated file"))
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, CacheError> {
    reader
        .read_u8()
        .map_err(|_| CacheError::Corrupt("truncated file"))
}

fn write_point<W: Write>(writer: &mut W, point: &Point3) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(point.x)?;
    writer.write_f32::<LittleEndian>(point.y)?;
    writer.write_f32::<LittleEndian>(point.z)
}

fn read_point<R: Read>(reader: &mut R) -> Result<Point3, CacheError> {
    Ok(Point3::new(
        read_f32(reader)?,
        read_f32(reader)?,
        read_f32(reader)?,
    ))
}

fn write_node2<W: Write>(writer: &mut W, node: &BvhNode2) -> io::Result<()> {
    let (aabb, index, meta) = node.raw_parts();
    write_point(writer, &aabb.min)?;
    write_point(writer, &aabb.max)?;
    writer.write_u32::<LittleEndian>(index)?;
    writer.write_u32::<LittleEndian>(meta)
}

fn read_node2<R: Read>(reader: &mut R) -> Result<BvhNode2, CacheError> {
    let min = read_point(reader)?;
    let max = read_point(reader)?;
    let index = read_u32(reader)?;
    let meta = read_u32(reader)?;
    Ok(BvhNode2::from_raw_parts(
        Aabb::with_bounds(min, max),
        index,
        meta,
    ))
}

fn write_node4<W: Write>(writer: &mut W, node: &BvhNode4) -> io::Result<()> {
    for array in [
        &node.aabb_min_x,
        &node.aabb_min_y,
        &node.aabb_min_z,
        &node.aabb_max_x,
        &node.aabb_max_y,
        &node.aabb_max_z,
    ] {
        for &value in array {
            writer.write_f32::<LittleEndian>(value)?;
        }
    }
    for slot in 0..4 {
        writer.write_i32::<LittleEndian>(node.index[slot])?;
        writer.write_i32::<LittleEndian>(node.count[slot])?;
    }
    Ok(())
}

fn read_node4<R: Read>(reader: &mut R) -> Result<BvhNode4, CacheError> {
    let mut node = BvhNode4::unused();
    for array in [
        &mut node.aabb_min_x,
        &mut node.aabb_min_y,
        &mut node.aabb_min_z,
        &mut node.aabb_max_x,
        &mut node.aabb_max_y,
        &mut node.aabb_max_z,
    ] {
        for value in array.iter_mut() {
            *value = read_f32(reader)?;
        }
    }
    for slot in 0..4 {
        node.index[slot] = read_i32(reader)?;
        node.count[slot] = read_i32(reader)?;
    }
    Ok(node)
}

fn write_node8<W: Write>(writer: &mut W, node: &BvhNode8) -> io::Result<()> {
    write_point(writer, &node.p)?;
    writer.write_all(&node.e)?;
    writer.write_all(&[node.imask])?;
    writer.write_u32::<LittleEndian>(node.base_index_child)?;
    writer.write_u32::<LittleEndian>(node.base_index_triangle)?;
    writer.write_all(&node.meta)?;
    writer.write_all(&node.quantized_min_x)?;
    writer.write_all(&node.quantized_max_x)?;
    writer.write_all(&node.quantized_min_y)?;
    writer.write_all(&node.quantized_max_y)?;
    writer.write_all(&node.quantized_min_z)?;
    writer.write_all(&node.quantized_max_z)?;
    Ok(())
}

fn read_node8<R: Read>(reader: &mut R) -> Result<BvhNode8, CacheError> {
    let mut node = BvhNode8 {
        p: read_point(reader)?,
        ..BvhNode8::default()
    };
    for byte in node.e.iter_mut() {
        *byte = read_u8(reader)?;
    }
    node.imask = read_u8(reader)?;
    node.base_index_child = read_u32(reader)?;
    node.base_index_triangle = read_u32(reader)?;
    for array in [
        &mut node.meta,
        &mut node.quantized_min_x,
        &mut node.quantized_max_x,
        &mut node.quantized_min_y,
        &mut node.quantized_max_y,
        &mut node.quantized_min_z,
        &mut node.quantized_max_z,
    ] {
        for byte in array.iter_mut() {
            *byte = read_u8(reader)?;
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::{build_bvh, BuildConfig, Bvh, BvhType};
    use crate::error::CacheError;
    use crate::testbase::random_triangles;
    use std::io::Cursor;
    use std::time::Duration;

    fn build(bvh_type: BvhType) -> Bvh {
        let triangles = random_triangles(80, 12.0, 0x5ca1e);
        let config = BuildConfig {
            bvh_type,
            ..BuildConfig::default()
        };
        build_bvh(&triangles, &config).unwrap()
    }

    fn roundtrip(bvh: &Bvh) -> (Vec<u8>, Bvh) {
        let mut buffer = Vec::new();
        write_bvh(&mut buffer, bvh).unwrap();
        let restored = read_bvh(&mut Cursor::new(&buffer)).unwrap();
        (buffer, restored)
    }

    #[test]
    fn test_bvh2_roundtrip_and_size() {
        let Bvh::Bvh2(original) = build(BvhType::Bvh2) else {
            unreachable!()
        };
        let (buffer, restored) = roundtrip(&Bvh::Bvh2(original.clone()));

        assert_eq!(
            buffer.len(),
            20 + original.nodes.len() * BVH2_NODE_SIZE + original.indices.len() * 4
        );
        let Bvh::Bvh2(restored) = restored else {
            unreachable!()
        };
        assert_eq!(restored.indices, original.indices);
        assert_eq!(restored.nodes.len(), original.nodes.len());
        for (a, b) in restored.nodes.iter().zip(original.nodes.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_qbvh_roundtrip_and_size() {
        let Bvh::Qbvh(original) = build(BvhType::Qbvh) else {
            unreachable!()
        };
        let (buffer, restored) = roundtrip(&Bvh::Qbvh(original.clone()));

        assert_eq!(
            buffer.len(),
            20 + original.nodes.len() * QBVH_NODE_SIZE + original.indices.len() * 4
        );
        let Bvh::Qbvh(restored) = restored else {
            unreachable!()
        };
        assert_eq!(restored.indices, original.indices);
        for (a, b) in restored.nodes.iter().zip(original.nodes.iter()) {
            assert_eq!(a.index, b.index);
            assert_eq!(a.count, b.count);
            assert_eq!(a.aabb_min_x, b.aabb_min_x);
            assert_eq!(a.aabb_max_z, b.aabb_max_z);
        }
    }

    #[test]
    fn test_cwbvh_roundtrip_and_size() {
        let Bvh::Cwbvh(original) = build(BvhType::Cwbvh) else {
            unreachable!()
        };
        let (buffer, restored) = roundtrip(&Bvh::Cwbvh(original.clone()));

        assert_eq!(
            buffer.len(),
            20 + original.nodes.len() * CWBVH_NODE_SIZE + original.indices.len() * 4
        );
        let Bvh::Cwbvh(restored) = restored else {
            unreachable!()
        };
        assert_eq!(restored.indices, original.indices);
        assert_eq!(restored.nodes, original.nodes);
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let bvh = build(BvhType::Bvh2);
        let mut buffer = Vec::new();
        write_bvh(&mut buffer, &bvh).unwrap();
        buffer[0] = b'X';

        let result = read_bvh(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_truncated_body_is_corrupt() {
        let bvh = build(BvhType::Cwbvh);
        let mut buffer = Vec::new();
        write_bvh(&mut buffer, &bvh).unwrap();
        buffer.truncate(buffer.len() / 2);

        let result = read_bvh(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let bvh = build(BvhType::Bvh2);
        let mut buffer = Vec::new();
        write_bvh(&mut buffer, &bvh).unwrap();
        buffer[4] = 99;

        let result = read_bvh(&mut Cursor::new(&buffer));
        assert!(matches!(result, Err(CacheError::UnsupportedVersion(99))));
    }

    #[test]
    fn test_store_load_and_staleness() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("wbvh-cache-test-{}.bvh", std::process::id()));

        let bvh = build(BvhType::Qbvh);
        store(&path, &bvh).unwrap();

        let written = std::fs::metadata(&path).unwrap().modified().unwrap();

        // A source older than the cache is fine.
        let fresh = load(&path, written - Duration::from_secs(60));
        assert!(fresh.is_ok());

        // A source newer than the cache invalidates it.
        let stale = load(&path, written + Duration::from_secs(60));
        assert!(matches!(stale, Err(CacheError::Stale)));

        std::fs::remove_file(&path).ok();
    }
}

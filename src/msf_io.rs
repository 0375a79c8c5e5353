//! Sparse fixel image (.msf) I/O
//!
//! Reads and writes the single-file sparse fixel format used for the
//! template mask, the per-subject fixel maps, and all output statistic
//! maps. Gzip compression is auto-detected on read; writing a path ending
//! in `.gz` produces a compressed file.
//!
//! Layout (little-endian): magic `MSF\x01`; dims u32 x3; voxel sizes
//! f32 x3; voxel-to-scanner affine f32 x16 (row-major); comment count u32
//! followed by length-prefixed UTF-8 comment lines; then for each voxel in
//! Fortran order a u32 fixel count followed by that many
//! (direction f32 x3, value f32, size f32) records.

use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::fixel::{Fixel, FixelImage};

const MAGIC: [u8; 4] = *b"MSF\x01";

/// Check if bytes are gzip compressed
fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Sequential little-endian reader over a byte buffer
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        ByteReader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.pos + n > self.bytes.len() {
            return Err(format!(
                "truncated fixel image: needed {} bytes at offset {}, file has {}",
                n,
                self.pos,
                self.bytes.len()
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_f32(&mut self) -> Result<f32, String> {
        let b = self.take(4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Load a sparse fixel image from bytes
///
/// Supports both plain and gzipped content (gzip is auto-detected).
pub fn load_msf(bytes: &[u8]) -> Result<FixelImage, String> {
    let decompressed;
    let content: &[u8] = if is_gzip(bytes) {
        let mut decoder = GzDecoder::new(bytes);
        let mut buf = Vec::new();
        decoder
            .read_to_end(&mut buf)
            .map_err(|e| format!("failed to decompress gzipped fixel image: {}", e))?;
        decompressed = buf;
        &decompressed
    } else {
        bytes
    };

    let mut reader = ByteReader::new(content);
    let magic = reader.take(4)?;
    if magic != MAGIC {
        return Err(format!(
            "not a sparse fixel image (magic {:02x?}, expected {:02x?})",
            magic, MAGIC
        ));
    }

    let nx = reader.read_u32()? as usize;
    let ny = reader.read_u32()? as usize;
    let nz = reader.read_u32()? as usize;
    let vsx = reader.read_f32()? as f64;
    let vsy = reader.read_f32()? as f64;
    let vsz = reader.read_f32()? as f64;
    let mut affine = [0.0f64; 16];
    for v in affine.iter_mut() {
        *v = reader.read_f32()? as f64;
    }

    let num_comments = reader.read_u32()? as usize;
    let mut comments = Vec::with_capacity(num_comments);
    for _ in 0..num_comments {
        let len = reader.read_u32()? as usize;
        let raw = reader.take(len)?;
        let comment = std::str::from_utf8(raw)
            .map_err(|e| format!("malformed header comment: {}", e))?;
        comments.push(comment.to_string());
    }

    let num_voxels = nx * ny * nz;
    let mut voxels = Vec::with_capacity(num_voxels);
    for _ in 0..num_voxels {
        let count = reader.read_u32()? as usize;
        let mut in_voxel = Vec::with_capacity(count);
        for _ in 0..count {
            let direction = [reader.read_f32()?, reader.read_f32()?, reader.read_f32()?];
            let value = reader.read_f32()?;
            let size = reader.read_f32()?;
            in_voxel.push(Fixel {
                direction,
                value,
                size,
            });
        }
        voxels.push(in_voxel);
    }

    Ok(FixelImage {
        dims: (nx, ny, nz),
        voxel_size: (vsx, vsy, vsz),
        affine,
        comments,
        voxels,
    })
}

/// Serialise a sparse fixel image to uncompressed bytes
pub fn save_msf(image: &FixelImage) -> Result<Vec<u8>, String> {
    let (nx, ny, nz) = image.dims;
    if image.voxels.len() != nx * ny * nz {
        return Err(format!(
            "voxel list length {} does not match dimensions {}x{}x{}",
            image.voxels.len(),
            nx,
            ny,
            nz
        ));
    }

    let mut buffer = Vec::with_capacity(
        4 + 12 + 12 + 64 + 4 + image.num_voxels() * 4 + image.total_fixels() * 20,
    );
    buffer.extend_from_slice(&MAGIC);
    for d in [nx, ny, nz] {
        buffer.extend_from_slice(&(d as u32).to_le_bytes());
    }
    for v in [image.voxel_size.0, image.voxel_size.1, image.voxel_size.2] {
        buffer.extend_from_slice(&(v as f32).to_le_bytes());
    }
    for v in image.affine {
        buffer.extend_from_slice(&(v as f32).to_le_bytes());
    }

    buffer.extend_from_slice(&(image.comments.len() as u32).to_le_bytes());
    for comment in &image.comments {
        buffer.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        buffer.extend_from_slice(comment.as_bytes());
    }

    for in_voxel in &image.voxels {
        buffer.extend_from_slice(&(in_voxel.len() as u32).to_le_bytes());
        for fixel in in_voxel {
            for v in fixel.direction {
                buffer.extend_from_slice(&v.to_le_bytes());
            }
            buffer.extend_from_slice(&fixel.value.to_le_bytes());
            buffer.extend_from_slice(&fixel.size.to_le_bytes());
        }
    }

    Ok(buffer)
}

/// Serialise a sparse fixel image to gzipped bytes
pub fn save_msf_gz(image: &FixelImage) -> Result<Vec<u8>, String> {
    let uncompressed = save_msf(image)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&uncompressed)
        .map_err(|e| format!("gzip compression failed: {}", e))?;
    encoder
        .finish()
        .map_err(|e| format!("gzip finish failed: {}", e))
}

/// Read a sparse fixel image from a filesystem path
pub fn read_msf_file(path: &Path) -> Result<FixelImage, String> {
    let bytes = std::fs::read(path)
        .map_err(|e| format!("failed to read fixel image '{}': {}", path.display(), e))?;
    load_msf(&bytes).map_err(|e| format!("{}: {}", path.display(), e))
}

/// Save a sparse fixel image to a file
///
/// A path ending in `.gz` is gzip compressed.
pub fn save_msf_to_file(path: &Path, image: &FixelImage) -> Result<(), String> {
    let bytes = if path.to_string_lossy().ends_with(".gz") {
        save_msf_gz(image)?
    } else {
        save_msf(image)?
    };
    std::fs::write(path, &bytes)
        .map_err(|e| format!("failed to write fixel image '{}': {}", path.display(), e))
}

/// Write a per-fixel scalar map attached to the mask geometry
///
/// The output clones the mask's grid, per-voxel fixel counts, directions
/// and sizes; only `value` is replaced, taken from `values` in fixel table
/// order. Extra comments (run provenance) are appended to the mask's own.
pub fn write_fixel_output(
    path: &Path,
    values: &[f32],
    mask: &FixelImage,
    extra_comments: &[String],
) -> Result<(), String> {
    let total = mask.total_fixels();
    if values.len() != total {
        return Err(format!(
            "output vector length {} does not match mask fixel count {}",
            values.len(),
            total
        ));
    }

    let mut comments = mask.comments.clone();
    comments.extend_from_slice(extra_comments);

    let mut voxels = mask.voxels.clone();
    let mut index = 0;
    for in_voxel in voxels.iter_mut() {
        for fixel in in_voxel.iter_mut() {
            fixel.value = values[index];
            index += 1;
        }
    }

    let output = FixelImage {
        dims: mask.dims,
        voxel_size: mask.voxel_size,
        affine: mask.affine,
        comments,
        voxels,
    };
    save_msf_to_file(path, &output)
}

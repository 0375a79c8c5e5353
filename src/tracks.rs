//! Streamline file reading and track-to-voxel mapping
//!
//! Reads MRtrix-style `.tck` files: a text header (`mrtrix tracks` on the
//! first line, `key: value` properties, a `file: . <offset>` data pointer,
//! `END`), followed by a Float32LE triplet stream where a NaN triplet
//! separates streamlines and an Inf triplet terminates the file.
//!
//! [`TrackMapper`] reduces a streamline to the set of unique voxels it
//! intersects, each with one associated unit tangent, clipped to the image
//! bounds.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::fixel::{idx3d, invert_affine, FixelImage};

/// Streaming reader over a `.tck` streamline file
pub struct TrackReader {
    reader: BufReader<File>,
    /// Header key/value properties (e.g. `count`)
    pub properties: HashMap<String, String>,
    done: bool,
}

impl TrackReader {
    /// Open a streamline file and parse its header
    pub fn open(path: &Path) -> Result<TrackReader, String> {
        let file = File::open(path)
            .map_err(|e| format!("failed to open track file '{}': {}", path.display(), e))?;
        let mut reader = BufReader::new(file);

        let mut first_line = String::new();
        reader
            .read_line(&mut first_line)
            .map_err(|e| format!("failed to read track file header: {}", e))?;
        if first_line.trim() != "mrtrix tracks" {
            return Err(format!(
                "'{}' is not a streamline file (first line '{}')",
                path.display(),
                first_line.trim()
            ));
        }

        let mut properties = HashMap::new();
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| format!("failed to read track file header: {}", e))?;
            if n == 0 {
                return Err(format!(
                    "unexpected end of header in track file '{}'",
                    path.display()
                ));
            }
            let line = line.trim();
            if line == "END" {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                properties.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        if let Some(datatype) = properties.get("datatype") {
            if datatype != "Float32LE" {
                return Err(format!(
                    "unsupported track datatype '{}' (only Float32LE is supported)",
                    datatype
                ));
            }
        }

        let offset: u64 = properties
            .get("file")
            .and_then(|v| v.split_whitespace().last())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| {
                format!(
                    "track file '{}' is missing a valid 'file' offset property",
                    path.display()
                )
            })?;
        reader
            .seek(SeekFrom::Start(offset))
            .map_err(|e| format!("failed to seek to track data: {}", e))?;

        Ok(TrackReader {
            reader,
            properties,
            done: false,
        })
    }

    /// Total streamline count from the header `count` property
    pub fn count(&self) -> Option<usize> {
        self.properties.get("count").and_then(|v| v.parse().ok())
    }

    /// Read the next streamline, or `None` at end of stream
    pub fn next_track(&mut self) -> Result<Option<Vec<[f32; 3]>>, String> {
        if self.done {
            return Ok(None);
        }
        let mut points = Vec::new();
        let mut buf = [0u8; 12];
        loop {
            match self.reader.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.done = true;
                    return Ok(if points.is_empty() { None } else { Some(points) });
                }
                Err(e) => return Err(format!("failed to read track data: {}", e)),
            }
            let x = f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let y = f32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
            let z = f32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

            if x.is_nan() {
                // Streamline separator
                if points.is_empty() {
                    continue;
                }
                return Ok(Some(points));
            }
            if x.is_infinite() {
                // Stream terminator
                self.done = true;
                return Ok(if points.is_empty() { None } else { Some(points) });
            }
            points.push([x, y, z]);
        }
    }
}

/// Write streamlines to a `.tck` file with a `count` header property
pub fn save_tracks(path: &Path, tracks: &[Vec<[f32; 3]>], count: usize) -> Result<(), String> {
    // The data offset appears inside the header, so its width feeds back
    // into its own value; iterate until stable.
    let base = format!(
        "mrtrix tracks\ndatatype: Float32LE\ncount: {}\n",
        count
    );
    let mut offset = base.len() + "file: . \nEND\n".len() + 1;
    loop {
        let candidate = base.len() + format!("file: . {}\nEND\n", offset).len();
        if candidate == offset {
            break;
        }
        offset = candidate;
    }
    let header = format!("{}file: . {}\nEND\n", base, offset);

    let mut file = File::create(path)
        .map_err(|e| format!("failed to create track file '{}': {}", path.display(), e))?;
    file.write_all(header.as_bytes())
        .map_err(|e| format!("failed to write track header: {}", e))?;

    let write_triplet = |file: &mut File, p: [f32; 3]| -> Result<(), String> {
        for v in p {
            file.write_all(&v.to_le_bytes())
                .map_err(|e| format!("failed to write track data: {}", e))?;
        }
        Ok(())
    };

    for track in tracks {
        for &p in track {
            write_triplet(&mut file, p)?;
        }
        write_triplet(&mut file, [f32::NAN; 3])?;
    }
    write_triplet(&mut file, [f32::INFINITY; 3])?;
    Ok(())
}

/// Maps a streamline to the set of unique voxels it traverses, each with a
/// single unit tangent in scanner coordinates
pub struct TrackMapper {
    dims: (usize, usize, usize),
    scanner_to_voxel: [f64; 16],
}

impl TrackMapper {
    pub fn new(image: &FixelImage) -> Result<TrackMapper, String> {
        Ok(TrackMapper {
            dims: image.dims,
            scanner_to_voxel: invert_affine(&image.affine)?,
        })
    }

    /// Map one streamline to `(linear voxel index, unit tangent)` pairs
    ///
    /// Each segment's direction is assigned to the voxel containing its
    /// midpoint; per-voxel directions are accumulated (sign-aligned, since
    /// tangents are axial) and renormalised. Out-of-bounds segments are
    /// clipped. The result is sorted by voxel index.
    pub fn map_track(&self, points: &[[f32; 3]]) -> Vec<(usize, [f32; 3])> {
        let (nx, ny, nz) = self.dims;
        let mut sums: HashMap<usize, [f64; 3]> = HashMap::new();

        for pair in points.windows(2) {
            let (p0, p1) = (pair[0], pair[1]);
            let seg = [
                (p1[0] - p0[0]) as f64,
                (p1[1] - p0[1]) as f64,
                (p1[2] - p0[2]) as f64,
            ];
            let len = (seg[0] * seg[0] + seg[1] * seg[1] + seg[2] * seg[2]).sqrt();
            if len < 1e-9 {
                continue;
            }
            let dir = [seg[0] / len, seg[1] / len, seg[2] / len];
            let mid = [
                (p0[0] + p1[0]) as f64 * 0.5,
                (p0[1] + p1[1]) as f64 * 0.5,
                (p0[2] + p1[2]) as f64 * 0.5,
            ];

            let a = &self.scanner_to_voxel;
            let vi = (a[0] * mid[0] + a[1] * mid[1] + a[2] * mid[2] + a[3]).round() as i64;
            let vj = (a[4] * mid[0] + a[5] * mid[1] + a[6] * mid[2] + a[7]).round() as i64;
            let vk = (a[8] * mid[0] + a[9] * mid[1] + a[10] * mid[2] + a[11]).round() as i64;
            if vi < 0 || vj < 0 || vk < 0 {
                continue;
            }
            let (vi, vj, vk) = (vi as usize, vj as usize, vk as usize);
            if vi >= nx || vj >= ny || vk >= nz {
                continue;
            }

            let entry = sums.entry(idx3d(vi, vj, vk, nx, ny)).or_insert([0.0; 3]);
            // Tangents are axial: align the segment with the running sum
            let dot = entry[0] * dir[0] + entry[1] * dir[1] + entry[2] * dir[2];
            let sign = if dot < 0.0 { -1.0 } else { 1.0 };
            entry[0] += sign * dir[0];
            entry[1] += sign * dir[1];
            entry[2] += sign * dir[2];
        }

        let mut mapped: Vec<(usize, [f32; 3])> = sums
            .into_iter()
            .filter_map(|(voxel, sum)| {
                let norm = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
                if norm < 1e-9 {
                    return None;
                }
                Some((
                    voxel,
                    [
                        (sum[0] / norm) as f32,
                        (sum[1] / norm) as f32,
                        (sum[2] / norm) as f32,
                    ],
                ))
            })
            .collect();
        mapped.sort_by_key(|&(voxel, _)| voxel);
        mapped
    }
}

//! Subject fixel map loading and along-tract smoothing
//!
//! Each subject's sparse fixel image is resolved onto the template fixels
//! by angular correspondence (the subject fixel in the same voxel with the
//! largest absolute dot product wins, subject to the angular threshold),
//! then smoothed through the row-stochastic connectivity-derived kernel.
//! Subjects are independent and load in parallel, each filling its own
//! column of the dense data matrix.

use std::path::PathBuf;

use ndarray::Array2;
use rayon::prelude::*;

use crate::connectivity::SparseMatrix;
use crate::fixel::{FixelImage, FixelTable};
use crate::msf_io::read_msf_file;

/// Resolve one subject image onto the template fixels (no smoothing)
fn resolve_subject(
    subject: &FixelImage,
    mask: &FixelImage,
    table: &FixelTable,
    angular_threshold_dp: f32,
) -> Result<Vec<f32>, String> {
    if subject.dims != mask.dims {
        return Err(format!(
            "subject dimensions {:?} do not match the template mask {:?}",
            subject.dims, mask.dims
        ));
    }

    let mut values = vec![0.0f32; table.num_fixels()];
    for voxel in 0..mask.num_voxels() {
        let (first, count) = match table.lookup(voxel) {
            Some(entry) => entry,
            None => continue,
        };
        let subject_fixels = &subject.voxels[voxel];
        for i in first..first + count {
            let dir = table.fixels[i].direction;
            let mut largest_dp = 0.0f32;
            let mut closest = None;
            for fixel in subject_fixels {
                let d = fixel.direction;
                let dp = (dir[0] * d[0] + dir[1] * d[1] + dir[2] * d[2]).abs();
                if dp > largest_dp {
                    largest_dp = dp;
                    closest = Some(fixel);
                }
            }
            // No angular match leaves the template fixel at zero
            if largest_dp > angular_threshold_dp {
                if let Some(fixel) = closest {
                    values[i] = fixel.value;
                }
            }
        }
    }
    Ok(values)
}

/// Apply the row-stochastic smoothing kernel to a dense fixel vector
fn smooth(values: &[f32], smoothing: &SparseMatrix) -> Vec<f32> {
    (0..values.len())
        .map(|i| {
            smoothing
                .row(i)
                .iter()
                .map(|&(j, w)| values[j as usize] * w)
                .sum()
        })
        .collect()
}

/// Load all subject images into the dense fixels x subjects data matrix
///
/// Each subject is resolved onto the template fixels and smoothed; columns
/// are written independently in parallel.
pub fn load_subject_data(
    filenames: &[PathBuf],
    mask: &FixelImage,
    table: &FixelTable,
    smoothing: &SparseMatrix,
    angle: f32,
) -> Result<Array2<f32>, String> {
    let angular_threshold_dp = angle.to_radians().cos();

    let columns: Vec<Result<Vec<f32>, String>> = filenames
        .par_iter()
        .map(|path| {
            let subject = read_msf_file(path)?;
            let resolved = resolve_subject(&subject, mask, table, angular_threshold_dp)
                .map_err(|e| format!("{}: {}", path.display(), e))?;
            Ok(smooth(&resolved, smoothing))
        })
        .collect();

    let num_fixels = table.num_fixels();
    let mut data = Array2::<f32>::zeros((num_fixels, filenames.len()));
    for (subject, column) in columns.into_iter().enumerate() {
        let column = column?;
        for (fixel, &value) in column.iter().enumerate() {
            data[[fixel, subject]] = value;
        }
    }
    Ok(data)
}

//! Fixel-fixel connectivity estimation and post-processing
//!
//! [`TrackProcessor`] accumulates a sparse co-occurrence matrix over
//! streamlines: each streamline's voxel tangents are matched to mask fixels
//! under an angular threshold, the per-fixel track density (TDI) is
//! incremented, and every unordered pair of matched fixels bumps an
//! upper-triangular count. Accumulation is safe under concurrent callers:
//! each matrix row is guarded by its own mutex (a cell is only ever written
//! under the lock of the row that owns it) and TDI counters are atomic.
//!
//! [`finalise`] then symmetrises the counts, normalises each row by its
//! TDI, applies the connectivity threshold, pre-raises surviving weights to
//! the connectivity exponent, and derives the row-stochastic Gaussian
//! smoothing kernel used when loading subject data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::fixel::FixelTable;

/// FWHM to standard deviation conversion factor (2 sqrt(2 ln 2))
pub const FWHM_TO_SIGMA: f32 = 2.3548;

/// Sparse row-major matrix: each row is a flat list of (column, weight)
/// pairs sorted by column
pub struct SparseMatrix {
    rows: Vec<Vec<(u32, f32)>>,
}

impl SparseMatrix {
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, i: usize) -> &[(u32, f32)] {
        &self.rows[i]
    }

    /// Weight at (i, j), or `None` if the cell is absent
    pub fn get(&self, i: usize, j: u32) -> Option<f32> {
        self.rows[i]
            .binary_search_by_key(&j, |&(id, _)| id)
            .ok()
            .map(|pos| self.rows[i][pos].1)
    }
}

/// Concurrent accumulator for the raw connectivity matrix and TDI
pub struct TrackProcessor<'a> {
    table: &'a FixelTable,
    angular_threshold_dp: f32,
    rows: Vec<Mutex<HashMap<u32, u32>>>,
    tdi: Vec<AtomicU32>,
}

impl<'a> TrackProcessor<'a> {
    /// `angle` is the maximum tangent/fixel angle in degrees
    pub fn new(table: &'a FixelTable, angle: f32) -> TrackProcessor<'a> {
        let num_fixels = table.num_fixels();
        TrackProcessor {
            table,
            angular_threshold_dp: (angle.to_radians()).cos(),
            rows: (0..num_fixels).map(|_| Mutex::new(HashMap::new())).collect(),
            tdi: (0..num_fixels).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    /// Process one streamline's `(voxel, tangent)` pairs
    pub fn process(&self, mapped: &[(usize, [f32; 3])]) {
        let mut track_fixels: Vec<u32> = Vec::with_capacity(mapped.len());
        for &(voxel, tangent) in mapped {
            let (first, count) = match self.table.lookup(voxel) {
                Some(entry) => entry,
                None => continue,
            };
            let mut largest_dp = 0.0f32;
            let mut closest = None;
            for f in first..first + count {
                let d = self.table.fixels[f].direction;
                let dp = (tangent[0] * d[0] + tangent[1] * d[1] + tangent[2] * d[2]).abs();
                if dp > largest_dp {
                    largest_dp = dp;
                    closest = Some(f as u32);
                }
            }
            if largest_dp > self.angular_threshold_dp {
                if let Some(fixel) = closest {
                    track_fixels.push(fixel);
                    self.tdi[fixel as usize].fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if track_fixels.len() < 2 {
            return;
        }

        // Group the unordered pairs by their owning (lower-id) row so each
        // row lock is taken once per streamline
        let mut by_row: HashMap<u32, Vec<u32>> = HashMap::new();
        for a in 0..track_fixels.len() {
            for b in a + 1..track_fixels.len() {
                let (lo, hi) = if track_fixels[a] < track_fixels[b] {
                    (track_fixels[a], track_fixels[b])
                } else {
                    (track_fixels[b], track_fixels[a])
                };
                if lo == hi {
                    // Revisit of the same voxel: no self-loops
                    continue;
                }
                by_row.entry(lo).or_default().push(hi);
            }
        }
        for (row, columns) in by_row {
            let mut guard = self.rows[row as usize]
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for hi in columns {
                *guard.entry(hi).or_insert(0) += 1;
            }
        }
    }

    /// Extract the raw upper-triangular counts and the TDI vector
    pub fn finish(self) -> (Vec<HashMap<u32, u32>>, Vec<u32>) {
        let rows = self
            .rows
            .into_iter()
            .map(|m| m.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect();
        let tdi = self.tdi.iter().map(|v| v.load(Ordering::Relaxed)).collect();
        (rows, tdi)
    }
}

/// Mirror every stored cell across the diagonal
///
/// On an already-symmetric matrix this is a no-op.
pub fn symmetrise(rows: &mut [HashMap<u32, u32>]) {
    for i in 0..rows.len() {
        let entries: Vec<(u32, u32)> = rows[i].iter().map(|(&j, &c)| (j, c)).collect();
        for (j, count) in entries {
            if j as usize != i {
                rows[j as usize].insert(i as u32, count);
            }
        }
    }
}

/// Finalise the connectivity matrix and derive the smoothing kernel
///
/// Per row i (using that row's own TDI as denominator): the normalised
/// connectivity `c = count / TDI[i]` is thresholded, surviving weights are
/// stored as `c^cfe_c`, and when smoothing is enabled a Gaussian
/// distance-weighted variant feeds the smoothing kernel. Every row gains a
/// diagonal entry (connectivity 1.0), and each smoothing row is normalised
/// to sum to one.
pub fn finalise(
    mut raw: Vec<HashMap<u32, u32>>,
    tdi: &[u32],
    positions: &[[f32; 3]],
    connectivity_threshold: f32,
    cfe_c: f32,
    smooth_fwhm: f32,
) -> (SparseMatrix, SparseMatrix) {
    symmetrise(&mut raw);

    let do_smoothing = smooth_fwhm > 0.0;
    let sigma = smooth_fwhm / FWHM_TO_SIGMA;
    let gaussian_const1 = if do_smoothing {
        1.0 / (sigma * (2.0 * std::f32::consts::PI).sqrt())
    } else {
        1.0
    };
    let gaussian_const2 = 2.0 * sigma * sigma;

    let num_fixels = raw.len();
    let mut connectivity_rows = Vec::with_capacity(num_fixels);
    let mut smoothing_rows = Vec::with_capacity(num_fixels);

    for (i, counts) in raw.into_iter().enumerate() {
        let tdi_i = tdi[i] as f32;
        let mut conn_row: Vec<(u32, f32)> = Vec::with_capacity(counts.len() + 1);
        let mut smooth_row: Vec<(u32, f32)> = Vec::new();

        for (j, count) in counts {
            let connectivity = count as f32 / tdi_i;
            if connectivity < connectivity_threshold {
                continue;
            }
            if do_smoothing {
                let pi = positions[i];
                let pj = positions[j as usize];
                let d2 = (pi[0] - pj[0]).powi(2)
                    + (pi[1] - pj[1]).powi(2)
                    + (pi[2] - pj[2]).powi(2);
                let weight = connectivity * gaussian_const1 * (-d2 / gaussian_const2).exp();
                if weight > connectivity_threshold {
                    smooth_row.push((j, weight));
                }
            }
            conn_row.push((j, connectivity.powf(cfe_c)));
        }

        // Each fixel is fully connected to itself
        conn_row.push((i as u32, 1.0));
        smooth_row.push((i as u32, gaussian_const1));
        conn_row.sort_by_key(|&(id, _)| id);
        smooth_row.sort_by_key(|&(id, _)| id);

        let sum: f32 = smooth_row.iter().map(|&(_, w)| w).sum();
        for entry in smooth_row.iter_mut() {
            entry.1 /= sum;
        }

        connectivity_rows.push(conn_row);
        smoothing_rows.push(smooth_row);
    }

    (
        SparseMatrix {
            rows: connectivity_rows,
        },
        SparseMatrix {
            rows: smoothing_rows,
        },
    )
}

//! Permutation testing and family-wise error control
//!
//! The empirical null is built by relabelling subjects: each permutation
//! applies a Fisher-Yates shuffle to the design matrix rows, recomputes the
//! per-fixel t-statistics, enhances them, and records the maximum enhanced
//! value of each tail. FWE-corrected p-values compare the observed enhanced
//! statistics against those maxima. Permutations are independent and run on
//! the rayon pool; every worker owns a private RNG derived from the master
//! seed so the null is reproducible regardless of scheduling.

use std::sync::atomic::{AtomicBool, Ordering};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::cfe::CfeEnhancer;
use crate::glm::GlmTTest;

/// All per-fixel outputs of a permutation run
pub struct PermutationResult {
    pub tvalues: Vec<f32>,
    pub cfe_pos: Vec<f32>,
    pub cfe_neg: Vec<f32>,
    pub perm_dist_pos: Vec<f32>,
    pub perm_dist_neg: Vec<f32>,
    pub pvalue_pos: Vec<f32>,
    pub pvalue_neg: Vec<f32>,
}

/// Derive an independent per-permutation seed from the master seed
fn perm_seed(master: u64, index: u64) -> u64 {
    // splitmix-style mixing keeps per-permutation streams decorrelated
    let mut z = master.wrapping_add((index + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// A Fisher-Yates shuffled subject relabelling
fn shuffled_order(num_subjects: usize, rng: &mut StdRng) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_subjects).collect();
    order.shuffle(rng);
    order
}

/// Divide enhanced values by the empirical statistic where it is positive
fn apply_empirical(values: &mut [f32], empirical: Option<&[f32]>) {
    if let Some(empirical) = empirical {
        for (v, &e) in values.iter_mut().zip(empirical.iter()) {
            if e > 0.0 {
                *v /= e;
            }
        }
    }
}

/// Convert observed statistics to FWE-corrected p-values against a null
/// distribution of permutation maxima
///
/// p = (1 + #{null >= stat}) / (num_perms + 1), so p always lies in
/// [1/(N+1), 1].
pub fn statistic_to_pvalue(null: &[f32], stats: &[f32]) -> Vec<f32> {
    let mut sorted = null.to_vec();
    sorted.sort_by(f32::total_cmp);
    let n = sorted.len();
    stats
        .iter()
        .map(|&stat| {
            let below = sorted.partition_point(|&v| v < stat);
            ((1 + n - below) as f32) / ((n + 1) as f32)
        })
        .collect()
}

/// Precompute the per-fixel empirical enhanced statistic for
/// non-stationarity adjustment (mean enhanced value over permutations)
pub fn precompute_empirical_stat(
    glm: &GlmTTest,
    enhancer: &CfeEnhancer,
    num_perms: usize,
    seed: u64,
    cancel: &AtomicBool,
) -> Result<Vec<f32>, String> {
    let num_fixels = glm.num_fixels();
    let num_subjects = glm.num_subjects();

    let sums: Option<Vec<f64>> = (0..num_perms)
        .into_par_iter()
        .map(|k| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            let mut rng = StdRng::seed_from_u64(perm_seed(seed, k as u64));
            let order = shuffled_order(num_subjects, &mut rng);
            let mut tvalues = Vec::new();
            glm.tvalues(&order, &mut tvalues);
            let mut pos = vec![0.0f32; num_fixels];
            let mut neg = vec![0.0f32; num_fixels];
            enhancer.enhance(&tvalues, &mut pos, &mut neg);
            // Exactly one tail is non-zero per fixel
            Some(
                pos.iter()
                    .zip(neg.iter())
                    .map(|(&p, &n)| (p + n) as f64)
                    .collect::<Vec<f64>>(),
            )
        })
        .reduce(
            || Some(vec![0.0f64; num_fixels]),
            |a, b| match (a, b) {
                (Some(mut a), Some(b)) => {
                    for (x, y) in a.iter_mut().zip(b.iter()) {
                        *x += y;
                    }
                    Some(a)
                }
                _ => None,
            },
        );

    let sums = sums.ok_or_else(|| "empirical statistic pre-pass was terminated".to_string())?;
    Ok(sums
        .into_iter()
        .map(|s| (s / num_perms as f64) as f32)
        .collect())
}

/// Run the observed test plus `num_perms` permutations
///
/// Returns an error (and produces no output) if the cancellation flag is
/// raised before the null distribution is complete.
pub fn run(
    glm: &GlmTTest,
    enhancer: &CfeEnhancer,
    num_perms: usize,
    seed: u64,
    empirical: Option<&[f32]>,
    cancel: &AtomicBool,
) -> Result<PermutationResult, String> {
    let num_fixels = glm.num_fixels();
    let num_subjects = glm.num_subjects();

    // Observed pass with the unpermuted design
    let identity: Vec<usize> = (0..num_subjects).collect();
    let mut tvalues = Vec::new();
    glm.tvalues(&identity, &mut tvalues);
    let mut cfe_pos = vec![0.0f32; num_fixels];
    let mut cfe_neg = vec![0.0f32; num_fixels];
    enhancer.enhance(&tvalues, &mut cfe_pos, &mut cfe_neg);
    apply_empirical(&mut cfe_pos, empirical);
    apply_empirical(&mut cfe_neg, empirical);

    // Null distribution of per-permutation maxima
    let maxima: Vec<Option<(f32, f32)>> = (0..num_perms)
        .into_par_iter()
        .map(|k| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            let mut rng = StdRng::seed_from_u64(perm_seed(seed, k as u64));
            let order = shuffled_order(num_subjects, &mut rng);
            let mut t = Vec::new();
            glm.tvalues(&order, &mut t);
            let mut pos = vec![0.0f32; num_fixels];
            let mut neg = vec![0.0f32; num_fixels];
            enhancer.enhance(&t, &mut pos, &mut neg);
            apply_empirical(&mut pos, empirical);
            apply_empirical(&mut neg, empirical);
            let max_pos = pos.iter().fold(0.0f32, |m, &v| m.max(v));
            let max_neg = neg.iter().fold(0.0f32, |m, &v| m.max(v));
            Some((max_pos, max_neg))
        })
        .collect();

    let mut perm_dist_pos = Vec::with_capacity(num_perms);
    let mut perm_dist_neg = Vec::with_capacity(num_perms);
    for entry in maxima {
        let (max_pos, max_neg) =
            entry.ok_or_else(|| "permutation testing was terminated".to_string())?;
        perm_dist_pos.push(max_pos);
        perm_dist_neg.push(max_neg);
    }

    let pvalue_pos = statistic_to_pvalue(&perm_dist_pos, &cfe_pos);
    let pvalue_neg = statistic_to_pvalue(&perm_dist_neg, &cfe_neg);

    Ok(PermutationResult {
        tvalues,
        cfe_pos,
        cfe_neg,
        perm_dist_pos,
        perm_dist_neg,
        pvalue_pos,
        pvalue_neg,
    })
}

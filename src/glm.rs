//! General linear model fitting and t-statistics
//!
//! Per-fixel GLM: beta = (X'X)^-1 X' y, residual variance
//! sigma^2 = ||y - X beta||^2 / (S - p), and the contrast t-statistic
//! t = c beta / sqrt(sigma^2 c (X'X)^-1 c'). All accumulation runs in f64;
//! results are downcast to f32 for storage. [`GlmTTest`] precomputes the
//! permutation-invariant terms (X'X and its inverse are unchanged by row
//! relabelling) so the permutation engine only pays for X'y per shuffle.

use ndarray::Array2;

use crate::matrix;

/// Normal-equation terms shared by every fit: (X'X)^-1 and the residual
/// degrees of freedom
fn normal_equations(design: &Array2<f64>) -> Result<(Array2<f64>, f64), String> {
    let subjects = design.nrows();
    let regressors = design.ncols();
    if subjects <= regressors {
        return Err(format!(
            "design matrix must have more rows than columns ({} subjects, {} regressors)",
            subjects, regressors
        ));
    }
    let xtx = design.t().dot(design);
    let xtx_inv = matrix::invert(&xtx)
        .map_err(|_| "design matrix is rank deficient".to_string())?;
    Ok((xtx_inv, (subjects - regressors) as f64))
}

fn check_data(data: &Array2<f32>, design: &Array2<f64>) -> Result<(), String> {
    if data.ncols() != design.nrows() {
        return Err(format!(
            "data has {} subject columns but the design matrix has {} rows",
            data.ncols(),
            design.nrows()
        ));
    }
    Ok(())
}

/// Per-fixel betas in f64 (fixels x regressors)
fn betas_f64(data: &Array2<f32>, design: &Array2<f64>) -> Result<Array2<f64>, String> {
    check_data(data, design)?;
    let (xtx_inv, _) = normal_equations(design)?;
    let num_fixels = data.nrows();
    let subjects = design.nrows();
    let regressors = design.ncols();

    let mut betas = Array2::<f64>::zeros((num_fixels, regressors));
    let mut xty = vec![0.0f64; regressors];
    for fixel in 0..num_fixels {
        xty.iter_mut().for_each(|v| *v = 0.0);
        for s in 0..subjects {
            let y = data[[fixel, s]] as f64;
            for j in 0..regressors {
                xty[j] += design[[s, j]] * y;
            }
        }
        for j in 0..regressors {
            let mut b = 0.0;
            for k in 0..regressors {
                b += xtx_inv[[j, k]] * xty[k];
            }
            betas[[fixel, j]] = b;
        }
    }
    Ok(betas)
}

/// Solve the GLM betas for every fixel (fixels x regressors)
pub fn solve_betas(data: &Array2<f32>, design: &Array2<f64>) -> Result<Array2<f32>, String> {
    Ok(betas_f64(data, design)?.mapv(|v| v as f32))
}

/// Absolute effect size c * beta for every fixel and contrast row
pub fn abs_effect_size(
    data: &Array2<f32>,
    design: &Array2<f64>,
    contrast: &Array2<f64>,
) -> Result<Array2<f32>, String> {
    if contrast.ncols() != design.ncols() {
        return Err(format!(
            "contrast has {} columns but the design matrix has {}",
            contrast.ncols(),
            design.ncols()
        ));
    }
    let betas = betas_f64(data, design)?;
    let effect = betas.dot(&contrast.t());
    Ok(effect.mapv(|v| v as f32))
}

/// Residual standard deviation per fixel
pub fn stdev(data: &Array2<f32>, design: &Array2<f64>) -> Result<Vec<f32>, String> {
    let betas = betas_f64(data, design)?;
    let (_, dof) = normal_equations(design)?;
    let num_fixels = data.nrows();
    let subjects = design.nrows();
    let regressors = design.ncols();

    let mut out = Vec::with_capacity(num_fixels);
    for fixel in 0..num_fixels {
        let mut rss = 0.0f64;
        for s in 0..subjects {
            let mut fitted = 0.0f64;
            for j in 0..regressors {
                fitted += design[[s, j]] * betas[[fixel, j]];
            }
            let residual = data[[fixel, s]] as f64 - fitted;
            rss += residual * residual;
        }
        out.push((rss / dof).sqrt() as f32);
    }
    Ok(out)
}

/// Standardised effect size c * beta / sigma per fixel and contrast row
pub fn std_effect_size(
    data: &Array2<f32>,
    design: &Array2<f64>,
    contrast: &Array2<f64>,
) -> Result<Array2<f32>, String> {
    let mut effect = abs_effect_size(data, design, contrast)?;
    let sigma = stdev(data, design)?;
    for fixel in 0..effect.nrows() {
        for c in 0..effect.ncols() {
            effect[[fixel, c]] = if sigma[fixel] > 0.0 {
                effect[[fixel, c]] / sigma[fixel]
            } else {
                0.0
            };
        }
    }
    Ok(effect)
}

/// Reusable t-test over row relabellings of the design matrix
///
/// The enhancement stage consumes the t-statistic of the first contrast
/// row; permutations supply a subject relabelling (a permutation of
/// 0..num_subjects) and receive the full per-fixel t vector.
pub struct GlmTTest<'a> {
    data: &'a Array2<f32>,
    design: &'a Array2<f64>,
    contrast_row: Vec<f64>,
    xtx_inv: Array2<f64>,
    c_xtx_ct: f64,
    dof: f64,
}

impl<'a> GlmTTest<'a> {
    pub fn new(
        data: &'a Array2<f32>,
        design: &'a Array2<f64>,
        contrast: &'a Array2<f64>,
    ) -> Result<GlmTTest<'a>, String> {
        check_data(data, design)?;
        if contrast.ncols() != design.ncols() {
            return Err(format!(
                "contrast has {} columns but the design matrix has {}",
                contrast.ncols(),
                design.ncols()
            ));
        }
        let (xtx_inv, dof) = normal_equations(design)?;
        let regressors = design.ncols();
        let contrast_row: Vec<f64> = (0..regressors).map(|j| contrast[[0, j]]).collect();

        // c (X'X)^-1 c' is invariant under row permutation of the design
        let mut c_xtx_ct = 0.0;
        for j in 0..regressors {
            for k in 0..regressors {
                c_xtx_ct += contrast_row[j] * xtx_inv[[j, k]] * contrast_row[k];
            }
        }

        Ok(GlmTTest {
            data,
            design,
            contrast_row,
            xtx_inv,
            c_xtx_ct,
            dof,
        })
    }

    pub fn num_fixels(&self) -> usize {
        self.data.nrows()
    }

    pub fn num_subjects(&self) -> usize {
        self.design.nrows()
    }

    /// t-statistic of the first contrast row for every fixel, with design
    /// rows relabelled by `order` (`order[s]` is the design row applied to
    /// subject `s`)
    pub fn tvalues(&self, order: &[usize], out: &mut Vec<f32>) {
        let subjects = self.design.nrows();
        let regressors = self.design.ncols();
        debug_assert_eq!(order.len(), subjects);

        let num_fixels = self.data.nrows();
        out.clear();
        out.reserve(num_fixels);

        let mut xty = vec![0.0f64; regressors];
        let mut beta = vec![0.0f64; regressors];
        for fixel in 0..num_fixels {
            xty.iter_mut().for_each(|v| *v = 0.0);
            for s in 0..subjects {
                let y = self.data[[fixel, s]] as f64;
                let row = order[s];
                for j in 0..regressors {
                    xty[j] += self.design[[row, j]] * y;
                }
            }
            for j in 0..regressors {
                let mut b = 0.0;
                for k in 0..regressors {
                    b += self.xtx_inv[[j, k]] * xty[k];
                }
                beta[j] = b;
            }

            let mut rss = 0.0f64;
            for s in 0..subjects {
                let row = order[s];
                let mut fitted = 0.0f64;
                for j in 0..regressors {
                    fitted += self.design[[row, j]] * beta[j];
                }
                let residual = self.data[[fixel, s]] as f64 - fitted;
                rss += residual * residual;
            }

            let effect: f64 = self
                .contrast_row
                .iter()
                .zip(beta.iter())
                .map(|(c, b)| c * b)
                .sum();
            let variance = rss / self.dof;
            let denom = (variance * self.c_xtx_ct).sqrt();
            let t = if denom > 0.0 && denom.is_finite() {
                effect / denom
            } else {
                0.0
            };
            out.push(t as f32);
        }
    }
}

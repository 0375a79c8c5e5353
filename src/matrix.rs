//! Numeric matrix text I/O and small dense linear algebra
//!
//! Design and contrast matrices arrive as whitespace-delimited text files
//! (one row per line). The GLM only ever inverts small p x p normal
//! matrices, so a direct Gauss-Jordan elimination with partial pivoting is
//! used instead of an external linear-algebra backend.

use std::path::Path;

use ndarray::Array2;

/// Load a whitespace-delimited numeric matrix from a text file
///
/// Empty lines are skipped. All rows must have the same number of columns.
pub fn load_matrix(path: &Path) -> Result<Array2<f64>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read matrix file '{}': {}", path.display(), e))?;

    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (line_num, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut row = Vec::new();
        for token in trimmed.split_whitespace() {
            let value: f64 = token.parse().map_err(|_| {
                format!(
                    "failed to parse '{}' as a number in '{}' (line {})",
                    token,
                    path.display(),
                    line_num + 1
                )
            })?;
            row.push(value);
        }
        if let Some(first) = rows.first() {
            if row.len() != first.len() {
                return Err(format!(
                    "inconsistent column count in '{}' (line {}): expected {}, found {}",
                    path.display(),
                    line_num + 1,
                    first.len(),
                    row.len()
                ));
            }
        }
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(format!("matrix file '{}' contains no data", path.display()));
    }

    let nrows = rows.len();
    let ncols = rows[0].len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((nrows, ncols), flat)
        .map_err(|e| format!("failed to build matrix from '{}': {}", path.display(), e))
}

/// Invert a square matrix by Gauss-Jordan elimination with partial pivoting
///
/// Returns an error if the matrix is not square or is singular to working
/// precision.
pub fn invert(matrix: &Array2<f64>) -> Result<Array2<f64>, String> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(format!(
            "cannot invert non-square matrix ({}x{})",
            n,
            matrix.ncols()
        ));
    }

    // Augmented system [A | I], eliminated in place
    let mut a: Vec<Vec<f64>> = (0..n)
        .map(|i| {
            let mut row: Vec<f64> = (0..n).map(|j| matrix[[i, j]]).collect();
            row.extend((0..n).map(|j| if i == j { 1.0 } else { 0.0 }));
            row
        })
        .collect();

    let scale: f64 = matrix.iter().fold(0.0_f64, |m, &v| m.max(v.abs())).max(1.0);

    for col in 0..n {
        // Partial pivot: largest magnitude entry in this column
        let mut pivot_row = col;
        for row in col + 1..n {
            if a[row][col].abs() > a[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        if a[pivot_row][col].abs() < 1e-12 * scale {
            return Err("matrix is singular and cannot be inverted".to_string());
        }
        a.swap(col, pivot_row);

        let pivot = a[col][col];
        for v in a[col].iter_mut() {
            *v /= pivot;
        }
        let pivot_row_values = a[col].clone();
        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0.0 {
                continue;
            }
            for j in 0..2 * n {
                a[row][j] -= factor * pivot_row_values[j];
            }
        }
    }

    let flat: Vec<f64> = a.into_iter().flat_map(|row| row[n..].to_vec()).collect();
    Array2::from_shape_vec((n, n), flat).map_err(|e| format!("inverse assembly failed: {}", e))
}

/// Save a vector as a text file, one value per line
pub fn save_vector(path: &Path, values: &[f32]) -> Result<(), String> {
    let mut text = String::with_capacity(values.len() * 12);
    for v in values {
        text.push_str(&format!("{}\n", v));
    }
    std::fs::write(path, text)
        .map_err(|e| format!("failed to write '{}': {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_load_matrix_basic() {
        let tmp = std::env::temp_dir().join("fixelstats_test_matrix.txt");
        std::fs::write(&tmp, "1 2 3\n4 5 6\n").unwrap();
        let m = load_matrix(&tmp).unwrap();
        assert_eq!(m.nrows(), 2);
        assert_eq!(m.ncols(), 3);
        assert_eq!(m[[1, 2]], 6.0);
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_load_matrix_skips_blank_lines() {
        let tmp = std::env::temp_dir().join("fixelstats_test_matrix_blank.txt");
        std::fs::write(&tmp, "1 0\n\n0 1\n").unwrap();
        let m = load_matrix(&tmp).unwrap();
        assert_eq!(m.nrows(), 2);
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_load_matrix_ragged_rows() {
        let tmp = std::env::temp_dir().join("fixelstats_test_matrix_ragged.txt");
        std::fs::write(&tmp, "1 2\n3\n").unwrap();
        let result = load_matrix(&tmp);
        assert!(result.is_err(), "ragged matrix should fail to load");
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_load_matrix_parse_error() {
        let tmp = std::env::temp_dir().join("fixelstats_test_matrix_bad.txt");
        std::fs::write(&tmp, "1 2\n3 oops\n").unwrap();
        let result = load_matrix(&tmp);
        assert!(result.is_err(), "non-numeric token should fail to parse");
        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn test_invert_identity() {
        let m = array![[1.0, 0.0], [0.0, 1.0]];
        let inv = invert(&m).unwrap();
        assert_eq!(inv[[0, 0]], 1.0);
        assert_eq!(inv[[0, 1]], 0.0);
        assert_eq!(inv[[1, 1]], 1.0);
    }

    #[test]
    fn test_invert_general() {
        let m = array![[4.0, 7.0], [2.0, 6.0]];
        let inv = invert(&m).unwrap();
        // A * A^-1 == I
        let prod = m.dot(&inv);
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (prod[[i, j]] - expected).abs() < 1e-10,
                    "product[{},{}] = {} should be {}",
                    i,
                    j,
                    prod[[i, j]],
                    expected
                );
            }
        }
    }

    #[test]
    fn test_invert_singular() {
        let m = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(invert(&m).is_err(), "singular matrix should not invert");
    }

    #[test]
    fn test_invert_requires_pivoting() {
        // Zero on the leading diagonal forces a row swap
        let m = array![[0.0, 1.0], [1.0, 0.0]];
        let inv = invert(&m).unwrap();
        assert!((inv[[0, 1]] - 1.0).abs() < 1e-12);
        assert!((inv[[1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_save_vector_roundtrip() {
        let tmp = std::env::temp_dir().join("fixelstats_test_vector.txt");
        save_vector(&tmp, &[1.5, -2.0, 0.25]).unwrap();
        let text = std::fs::read_to_string(&tmp).unwrap();
        let values: Vec<f32> = text.lines().map(|l| l.parse().unwrap()).collect();
        assert_eq!(values, vec![1.5, -2.0, 0.25]);
        std::fs::remove_file(&tmp).ok();
    }
}

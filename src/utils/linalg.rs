// src/utils/linalg.rs

use crate::core::{ImlError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Relative pivot size below which the scaled normal equations count as singular.
const RANK_TOLERANCE: f64 = 1e-10;

/// Weighted least squares with an intercept.
///
/// Returns `n_features + 1` coefficients, the intercept first. A rank-deficient
/// weighted design (constant or collinear columns, too few weighted samples)
/// is reported as [`ImlError::DegenerateFit`] instead of producing unstable
/// coefficients.
pub fn weighted_least_squares(
    features: ArrayView2<f64>,
    target: ArrayView1<f64>,
    weights: ArrayView1<f64>,
) -> Result<Array1<f64>> {
    let n_samples = features.nrows();
    let n_coeffs = features.ncols() + 1;

    if target.len() != n_samples || weights.len() != n_samples {
        return Err(ImlError::InvalidInput(format!(
            "Least squares got {} rows, {} targets and {} weights.",
            n_samples,
            target.len(),
            weights.len()
        )));
    }

    let effective_samples = weights.iter().filter(|&&w| w > 1e-12).count();
    if effective_samples < n_coeffs {
        return Err(ImlError::DegenerateFit(format!(
            "{} effectively weighted samples for {} coefficients.",
            effective_samples, n_coeffs
        )));
    }

    // sqrt(W) X_aug and sqrt(W) y
    let mut x_w = Array2::zeros((n_samples, n_coeffs));
    let mut y_w = Array1::zeros(n_samples);
    for i in 0..n_samples {
        let sqrt_w = if weights[i] > 1e-12 { weights[i].sqrt() } else { 0.0 };
        x_w[[i, 0]] = sqrt_w;
        for j in 0..features.ncols() {
            x_w[[i, j + 1]] = features[[i, j]] * sqrt_w;
        }
        y_w[i] = target[i] * sqrt_w;
    }

    solve(x_w, y_w)
}

#[cfg(feature = "linalg")]
fn solve(x_w: Array2<f64>, y_w: Array1<f64>) -> Result<Array1<f64>> {
    use ndarray_linalg::LeastSquaresSvd;

    let n_coeffs = x_w.ncols();
    let results = x_w
        .least_squares(&y_w)
        .map_err(|e| ImlError::DegenerateFit(format!("SVD least squares failed: {}", e)))?;
    if results.rank < n_coeffs as i32 {
        return Err(ImlError::DegenerateFit(format!(
            "Weighted design matrix has rank {} for {} coefficients.",
            results.rank, n_coeffs
        )));
    }
    Ok(results.solution)
}

#[cfg(not(feature = "linalg"))]
fn solve(x_w: Array2<f64>, y_w: Array1<f64>) -> Result<Array1<f64>> {
    let n = x_w.ncols();
    let gram = x_w.t().dot(&x_w);
    let rhs = x_w.t().dot(&y_w);

    // Jacobi scaling so the pivot tolerance does not depend on feature units.
    let mut scale = Array1::zeros(n);
    for j in 0..n {
        let d = gram[[j, j]];
        if d <= 0.0 {
            return Err(ImlError::DegenerateFit(format!(
                "Design column {} is zero after weighting.",
                j
            )));
        }
        scale[j] = d.sqrt();
    }

    let mut a = Array2::from_shape_fn((n, n), |(i, j)| gram[[i, j]] / (scale[i] * scale[j]));
    let mut b = Array1::from_shape_fn(n, |i| rhs[i] / scale[i]);

    // Gaussian elimination with partial pivoting.
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&r1, &r2| {
                a[[r1, col]]
                    .abs()
                    .partial_cmp(&a[[r2, col]].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(col);
        if a[[pivot_row, col]].abs() < RANK_TOLERANCE {
            return Err(ImlError::DegenerateFit(format!(
                "Weighted design matrix is rank deficient (column {} is collinear).",
                col
            )));
        }
        if pivot_row != col {
            for k in 0..n {
                a.swap([col, k], [pivot_row, k]);
            }
            b.swap(col, pivot_row);
        }
        for row in (col + 1)..n {
            let factor = a[[row, col]] / a[[col, col]];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[[row, k]] -= factor * a[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut z = Array1::zeros(n);
    for i in (0..n).rev() {
        let tail: f64 = ((i + 1)..n).map(|k| a[[i, k]] * z[k]).sum();
        z[i] = (b[i] - tail) / a[[i, i]];
    }
    Ok(Array1::from_shape_fn(n, |j| z[j] / scale[j]))
}

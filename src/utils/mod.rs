/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Shared linear algebra and statistics utilities for the occupancy samplers.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Utilities
//!
//! Small dense linear-algebra kernels (Cholesky factorization and triangular solves),
//! summary statistics, and helpers for working with faer matrices.

use faer::Mat;
use num_traits::ToPrimitive;

#[must_use]
pub fn usize_to_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}

#[must_use]
pub fn matrix_is_finite(matrix: &Mat<f64>) -> bool {
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            if !matrix[(i, j)].is_finite() {
                return false;
            }
        }
    }
    true
}

/// Lower Cholesky factor of a dense symmetric positive-definite matrix.
///
/// Returns `None` when the matrix is not square or a pivot is non-positive.
#[must_use]
pub fn cholesky_lower(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    let dim = matrix.ncols();
    if matrix.nrows() != dim {
        return None;
    }
    let mut lower = Mat::<f64>::zeros(dim, dim);
    for row in 0..dim {
        for col in 0..=row {
            let mut sum = matrix[(row, col)];
            for k in 0..col {
                sum -= lower[(row, k)] * lower[(col, k)];
            }
            if row == col {
                if !(sum > 0.0 && sum.is_finite()) {
                    return None;
                }
                lower[(row, col)] = sum.sqrt();
            } else {
                lower[(row, col)] = sum / lower[(col, col)];
            }
        }
    }
    Some(lower)
}

/// Solve `L x = b` for lower-triangular `L`.
#[must_use]
pub fn forward_substitution(lower: &Mat<f64>, rhs: &[f64]) -> Vec<f64> {
    let dim = rhs.len();
    let mut solution = vec![0.0; dim];
    for row in 0..dim {
        let mut sum = rhs[row];
        for col in 0..row {
            sum -= lower[(row, col)] * solution[col];
        }
        solution[row] = sum / lower[(row, row)];
    }
    solution
}

/// Solve `Lᵀ x = b` for lower-triangular `L`.
#[must_use]
pub fn backward_substitution_transposed(lower: &Mat<f64>, rhs: &[f64]) -> Vec<f64> {
    let dim = rhs.len();
    let mut solution = vec![0.0; dim];
    for row in (0..dim).rev() {
        let mut sum = rhs[row];
        for col in (row + 1)..dim {
            sum -= lower[(col, row)] * solution[col];
        }
        solution[row] = sum / lower[(row, row)];
    }
    solution
}

/// Solve `A x = b` for symmetric positive-definite `A` via its Cholesky factor.
#[must_use]
pub fn solve_positive_definite(matrix: &Mat<f64>, rhs: &[f64]) -> Option<Vec<f64>> {
    let lower = cholesky_lower(matrix)?;
    let half = forward_substitution(&lower, rhs);
    let solution = backward_substitution_transposed(&lower, &half);
    solution.iter().all(|value| value.is_finite()).then_some(solution)
}

#[must_use]
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / usize_to_f64(values.len())
}

/// Unbiased sample variance; `0` for fewer than two values.
#[must_use]
pub fn sample_variance(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values
        .iter()
        .map(|value| {
            let centered = *value - mean;
            centered * centered
        })
        .sum::<f64>()
        / usize_to_f64(values.len() - 1)
}

/// Linear interpolation percentile over pre-sorted values.
#[must_use]
pub fn percentile(sorted_values: &[f64], probability: f64) -> f64 {
    if sorted_values.is_empty() {
        return f64::NAN;
    }

    let clamped = probability.clamp(0.0, 1.0);
    let last = sorted_values.len() - 1;
    let position = clamped * usize_to_f64(last);
    let lower = position.floor().to_usize().unwrap_or(0);
    let upper = position.ceil().to_usize().unwrap_or(last);

    if lower == upper {
        sorted_values[lower]
    } else {
        let weight = position - usize_to_f64(lower);
        (1.0 - weight).mul_add(sorted_values[lower], weight * sorted_values[upper])
    }
}

/// Stable `log(mean(exp(values)))`.
#[must_use]
pub fn log_mean_exp(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NEG_INFINITY;
    }
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum = values.iter().map(|value| (value - max).exp()).sum::<f64>();
    max + sum.ln() - usize_to_f64(values.len()).ln()
}

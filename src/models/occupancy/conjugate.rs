//! Random variate generators and conjugate Normal / Inverse-Gamma updates.

use faer::Mat;
use rand::RngExt;
use rand::rngs::StdRng;

use crate::inference::NumericalError;
use crate::utils::{backward_substitution_transposed, cholesky_lower, forward_substitution};

/// Box-Muller standard normal draw.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Unit-rate exponential draw.
pub fn sample_exponential(rng: &mut StdRng) -> f64 {
    -(1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE).ln()
}

/// Marsaglia-Tsang gamma draw with the given shape and scale.
pub fn sample_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    if !(shape > 0.0 && scale > 0.0) {
        return f64::NAN;
    }

    if shape < 1.0 {
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0, scale) * u.powf(1.0 / shape);
    }

    let shape_minus_third = shape - (1.0 / 3.0);
    let coeff = (1.0 / (9.0 * shape_minus_third)).sqrt();
    loop {
        let standard_normal = sample_standard_normal(rng);
        let one_plus_coeff_noise = coeff.mul_add(standard_normal, 1.0);
        if one_plus_coeff_noise <= 0.0 {
            continue;
        }
        let cubic_term = one_plus_coeff_noise * one_plus_coeff_noise * one_plus_coeff_noise;
        let uniform = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        let squared = standard_normal * standard_normal;
        if uniform < (0.0331 * squared).mul_add(-squared, 1.0)
            || uniform.ln()
                < 0.5f64.mul_add(
                    squared,
                    shape_minus_third * (1.0 - cubic_term + cubic_term.ln()),
                )
        {
            return scale * shape_minus_third * cubic_term;
        }
    }
}

/// Inverse-Gamma draw: `1 / Gamma(shape, 1 / scale)`.
pub fn sample_inverse_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    1.0 / sample_gamma(rng, shape, 1.0 / scale)
}

/// Draw from `N(linear / precision, 1 / precision)`.
///
/// # Errors
///
/// Returns `NumericalError::SingularPrecision` for a non-positive precision.
pub fn sample_scalar_conjugate(
    rng: &mut StdRng,
    precision: f64,
    linear: f64,
) -> Result<f64, NumericalError> {
    if !(precision > 0.0 && precision.is_finite() && linear.is_finite()) {
        return Err(NumericalError::SingularPrecision);
    }
    let sd = precision.sqrt().recip();
    Ok(sd.mul_add(sample_standard_normal(rng), linear / precision))
}

/// Draw from `N(P⁻¹ b, P⁻¹)` given precision `P` and linear term `b`.
///
/// # Errors
///
/// Returns `NumericalError::SingularPrecision` if `P` is not positive definite.
pub fn sample_from_precision(
    rng: &mut StdRng,
    precision: &Mat<f64>,
    linear: &[f64],
) -> Result<Vec<f64>, NumericalError> {
    let lower = cholesky_lower(precision).ok_or(NumericalError::SingularPrecision)?;
    let half = forward_substitution(&lower, linear);
    let mean = backward_substitution_transposed(&lower, &half);
    let noise: Vec<f64> = (0..linear.len())
        .map(|_| sample_standard_normal(rng))
        .collect();
    let scaled_noise = backward_substitution_transposed(&lower, &noise);
    let draw: Vec<f64> = mean
        .iter()
        .zip(&scaled_noise)
        .map(|(m, e)| m + e)
        .collect();
    if draw.iter().all(|value| value.is_finite()) {
        Ok(draw)
    } else {
        Err(NumericalError::SingularPrecision)
    }
}

/// Polya-Gamma augmented logistic regression data for a coefficient block.
///
/// Row `i` of `design` contributes `ω_i x_i x_iᵀ` to the precision and
/// `x_i (κ_i - ω_i offset_i)` to the linear term.
pub struct AugmentedRegression<'a> {
    pub design: &'a Mat<f64>,
    pub rows: &'a [usize],
    pub omega: &'a [f64],
    pub kappa: &'a [f64],
    pub offset: &'a [f64],
}

/// Diagonal Normal prior for a coefficient block.
#[derive(Debug, Clone)]
pub struct NormalPrior {
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
}

impl NormalPrior {
    #[must_use]
    pub fn isotropic(dim: usize, mean: f64, variance: f64) -> Self {
        Self {
            mean: vec![mean; dim],
            variance: vec![variance; dim],
        }
    }
}

/// Conjugate coefficient draw `β | ω, κ ~ N(P⁻¹ b, P⁻¹)`.
///
/// `P = Σ₀⁻¹ + Xᵀ Ω X`, `b = Σ₀⁻¹ μ₀ + Xᵀ (κ - Ω offset)`.
///
/// # Errors
///
/// Returns `NumericalError` if the precision is singular or a term is non-finite.
pub fn sample_augmented_coefficients(
    rng: &mut StdRng,
    data: &AugmentedRegression<'_>,
    prior: &NormalPrior,
) -> Result<Vec<f64>, NumericalError> {
    let dim = data.design.ncols();
    let mut precision = Mat::<f64>::zeros(dim, dim);
    let mut linear = vec![0.0; dim];
    for j in 0..dim {
        precision[(j, j)] = prior.variance[j].recip();
        linear[j] = prior.mean[j] / prior.variance[j];
    }
    for &row in data.rows {
        let omega = data.omega[row];
        let response = omega.mul_add(-data.offset[row], data.kappa[row]);
        if !response.is_finite() {
            return Err(NumericalError::NonFiniteLinearPredictor);
        }
        for a in 0..dim {
            let xa = data.design[(row, a)];
            linear[a] += xa * response;
            let weighted = omega * xa;
            for b in 0..=a {
                precision[(a, b)] += weighted * data.design[(row, b)];
            }
        }
    }
    for a in 0..dim {
        for b in 0..a {
            precision[(b, a)] = precision[(a, b)];
        }
    }
    sample_from_precision(rng, &precision, &linear)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::{mean, sample_variance, usize_to_f64};
    use rand::SeedableRng;

    #[test]
    fn gamma_draws_match_mean_and_variance() {
        let mut rng = StdRng::seed_from_u64(5);
        for (shape, scale) in [(0.4, 2.0), (3.0, 0.5)] {
            let draws: Vec<f64> = (0..40_000).map(|_| sample_gamma(&mut rng, shape, scale)).collect();
            let m = mean(&draws);
            let v = sample_variance(&draws, m);
            assert!((m - shape * scale).abs() / (shape * scale) < 0.03);
            assert!((v - shape * scale * scale).abs() / (shape * scale * scale) < 0.08);
        }
    }

    #[test]
    fn inverse_gamma_mean_matches_closed_form() {
        let mut rng = StdRng::seed_from_u64(9);
        let draws: Vec<f64> = (0..40_000)
            .map(|_| sample_inverse_gamma(&mut rng, 5.0, 2.0))
            .collect();
        assert!((mean(&draws) - 0.5).abs() < 0.02);
    }

    #[test]
    fn precision_draws_have_target_moments() {
        let mut rng = StdRng::seed_from_u64(17);
        let precision = Mat::from_fn(2, 2, |i, j| if i == j { 4.0 } else { 1.0 });
        let linear = [2.0, -1.0];
        // mean = P⁻¹ b = [9/15, -6/15]
        let draws: Vec<Vec<f64>> = (0..20_000)
            .map(|_| sample_from_precision(&mut rng, &precision, &linear).expect("positive definite"))
            .collect();
        let first: Vec<f64> = draws.iter().map(|draw| draw[0]).collect();
        let second: Vec<f64> = draws.iter().map(|draw| draw[1]).collect();
        assert!((mean(&first) - 0.6).abs() < 0.02);
        assert!((mean(&second) + 0.4).abs() < 0.02);
        // Var = (P⁻¹)_00 = 4/15
        assert!((sample_variance(&first, mean(&first)) - 4.0 / 15.0).abs() < 0.02);
    }

    #[test]
    fn singular_precision_is_reported() {
        let mut rng = StdRng::seed_from_u64(1);
        let precision = Mat::from_fn(2, 2, |_, _| 1.0);
        assert_eq!(
            sample_from_precision(&mut rng, &precision, &[0.0, 0.0]),
            Err(NumericalError::SingularPrecision)
        );
        assert!(sample_scalar_conjugate(&mut rng, 0.0, 1.0).is_err());
    }

    #[test]
    fn augmented_coefficients_concentrate_with_strong_data() {
        // κ = ω x β with β = 1.5 makes the posterior mean approach 1.5 as data grow
        let n = 400;
        let design = Mat::from_fn(n, 1, |_, _| 1.0);
        let rows: Vec<usize> = (0..n).collect();
        let omega = vec![0.25; n];
        let kappa = vec![0.25 * 1.5; n];
        let offset = vec![0.0; n];
        let data = AugmentedRegression {
            design: &design,
            rows: &rows,
            omega: &omega,
            kappa: &kappa,
            offset: &offset,
        };
        let prior = NormalPrior::isotropic(1, 0.0, 2.72);
        let mut rng = StdRng::seed_from_u64(2);
        let draws: Vec<f64> = (0..2_000)
            .map(|_| sample_augmented_coefficients(&mut rng, &data, &prior).expect("valid")[0])
            .collect();
        let expected = (usize_to_f64(n) * 0.25 * 1.5) / (usize_to_f64(n) * 0.25 + 1.0 / 2.72);
        assert!((mean(&draws) - expected).abs() < 0.01);
    }
}

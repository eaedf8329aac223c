//! Exact `PG(1, c)` sampling with Devroye's alternating-series method.
//!
//! A `PG(1, c)` variate is `J*(1, |c|/2) / 4`. `J*` is drawn from a two-piece proposal
//! split at `t = 0.64`: a truncated inverse Gaussian on `(0, t]` and a shifted exponential
//! on `(t, ∞)`. Candidates are accepted by evaluating the alternating series for the
//! `J*` density until the partial sums bracket the uniform threshold.

use std::f64::consts::{FRAC_2_PI, PI};

use rand::RngExt;
use rand::rngs::StdRng;
use statrs::function::erf::erfc;

use super::conjugate::{sample_exponential, sample_standard_normal};
use crate::inference::NumericalError;

const TRUNC: f64 = 0.64;
const PI_SQ_OVER_8: f64 = PI * PI / 8.0;
const MAX_SERIES_TERMS: usize = 200;

/// Draw one `PG(1, tilt)` variate.
///
/// # Errors
///
/// Returns `NumericalError::NonFiniteLinearPredictor` for a non-finite tilt and
/// `NumericalError::DegeneratePolyaGamma` if the draw is not finite and positive.
pub fn sample_polya_gamma(rng: &mut StdRng, tilt: f64) -> Result<f64, NumericalError> {
    if !tilt.is_finite() {
        return Err(NumericalError::NonFiniteLinearPredictor);
    }
    let z = 0.5 * tilt.abs();
    let draw = 0.25 * sample_jstar(rng, z);
    if draw.is_finite() && draw > 0.0 {
        Ok(draw)
    } else {
        Err(NumericalError::DegeneratePolyaGamma)
    }
}

/// `E[PG(1, c)] = tanh(c/2) / (2c)`, with the limit `1/4` at zero.
#[must_use]
pub fn polya_gamma_mean(tilt: f64) -> f64 {
    if tilt.abs() < 1.0e-8 {
        0.25
    } else {
        (0.5 * tilt).tanh() / (2.0 * tilt)
    }
}

fn sample_jstar(rng: &mut StdRng, z: f64) -> f64 {
    let k = 0.5f64.mul_add(z * z, PI_SQ_OVER_8);
    let log_exponential_mass = (PI / (2.0 * k)).ln() - k * TRUNC;
    let log_gaussian_mass = std::f64::consts::LN_2 - z + log_inverse_gaussian_cdf(TRUNC, z);
    let exponential_weight = 1.0 / (1.0 + (log_gaussian_mass - log_exponential_mass).exp());

    loop {
        let candidate = if rng.random::<f64>() < exponential_weight {
            TRUNC + sample_exponential(rng) / k
        } else {
            sample_truncated_inverse_gaussian(rng, z)
        };

        let mut partial = series_coefficient(0, candidate);
        let threshold = rng.random::<f64>() * partial;
        for n in 1..MAX_SERIES_TERMS {
            if !n.is_multiple_of(2) {
                partial -= series_coefficient(n, candidate);
                if threshold <= partial {
                    return candidate;
                }
            } else {
                partial += series_coefficient(n, candidate);
                if threshold > partial {
                    break;
                }
            }
        }
    }
}

/// Coefficient `a_n(x)` of the piecewise alternating series for the `J*(1, 0)` density.
fn series_coefficient(n: usize, x: f64) -> f64 {
    let half = crate::utils::usize_to_f64(n) + 0.5;
    if x > TRUNC {
        PI * half * (-0.5 * half * half * PI * PI * x).exp()
    } else {
        let log_value = 1.5f64.mul_add((FRAC_2_PI / x).ln(), (PI * half).ln())
            - 2.0 * half * half / x;
        log_value.exp()
    }
}

/// `ln P(X <= t)` for `X ~ InverseGaussian(mean = 1/z, shape = 1)`.
fn log_inverse_gaussian_cdf(t: f64, z: f64) -> f64 {
    let root = (1.0 / t).sqrt();
    if z < 1.0e-12 {
        return (2.0 * standard_normal_cdf(-root)).ln();
    }
    let mean = 1.0 / z;
    let first = standard_normal_cdf(root * (t / mean - 1.0));
    let log_second = 2.0 * z + standard_normal_cdf(-root * (t / mean + 1.0)).ln();
    (first + log_second.exp()).ln()
}

fn standard_normal_cdf(value: f64) -> f64 {
    0.5 * erfc(-value / std::f64::consts::SQRT_2)
}

/// Inverse Gaussian with mean `1/z`, shape 1, truncated to `(0, TRUNC]`.
fn sample_truncated_inverse_gaussian(rng: &mut StdRng, z: f64) -> f64 {
    let mean = if z > 0.0 { 1.0 / z } else { f64::INFINITY };
    if mean > TRUNC {
        // 1/X from a truncated chi-square, accepted with probability exp(-z²X/2)
        loop {
            let candidate = loop {
                let e1 = sample_exponential(rng);
                let e2 = sample_exponential(rng);
                if e1 * e1 <= 2.0 * e2 / TRUNC {
                    let denominator = TRUNC.mul_add(e1, 1.0);
                    break TRUNC / (denominator * denominator);
                }
            };
            if rng.random::<f64>() <= (-0.5 * z * z * candidate).exp() {
                return candidate;
            }
        }
    }
    loop {
        let normal = sample_standard_normal(rng);
        let y = normal * normal;
        let mean_y = mean * y;
        let mut candidate =
            mean + 0.5 * mean * mean_y - 0.5 * mean * (4.0 * mean_y + mean_y * mean_y).sqrt();
        if rng.random::<f64>() > mean / (mean + candidate) {
            candidate = mean * mean / candidate;
        }
        if candidate <= TRUNC {
            return candidate;
        }
    }
}

//! Isotropic covariance functions.

use serde::{Deserialize, Serialize};

/// Covariance family for spatial random effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CovarianceModel {
    /// `exp(-φ d)`.
    #[default]
    Exponential,
    /// `1 - 1.5 φ d + 0.5 (φ d)^3` for `d < 1/φ`, zero beyond.
    Spherical,
    /// `exp(-(φ d)^2)`.
    Gaussian,
}

impl CovarianceModel {
    /// Correlation at distance `distance` with decay `phi`.
    #[must_use]
    pub fn correlation(self, distance: f64, phi: f64) -> f64 {
        let scaled = phi * distance;
        match self {
            Self::Exponential => (-scaled).exp(),
            Self::Spherical => {
                if scaled >= 1.0 {
                    0.0
                } else {
                    (0.5 * scaled * scaled).mul_add(scaled, 1.0 - 1.5 * scaled)
                }
            }
            Self::Gaussian => (-scaled * scaled).exp(),
        }
    }

    /// Covariance `σ² · correlation(d, φ)`.
    #[must_use]
    pub fn covariance(self, distance: f64, sigma_sq: f64, phi: f64) -> f64 {
        sigma_sq * self.correlation(distance, phi)
    }

    /// Distance at which correlation falls to roughly 0.05 (exactly zero for spherical).
    #[must_use]
    pub fn effective_range(self, phi: f64) -> f64 {
        self.range_constant() / phi
    }

    /// `φ · effective_range`; used to map distance bounds to decay bounds.
    #[must_use]
    pub fn range_constant(self) -> f64 {
        match self {
            Self::Exponential => 3.0,
            Self::Spherical => 1.0,
            Self::Gaussian => 3.0_f64.sqrt(),
        }
    }

    /// Default uniform support for φ given the smallest and largest inter-site distances.
    #[must_use]
    pub fn default_decay_bounds(self, min_distance: f64, max_distance: f64) -> (f64, f64) {
        let constant = self.range_constant();
        (constant / max_distance, constant / min_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const MODELS: [CovarianceModel; 3] = [
        CovarianceModel::Exponential,
        CovarianceModel::Spherical,
        CovarianceModel::Gaussian,
    ];

    #[test]
    fn correlation_is_one_at_zero_distance_and_non_increasing() {
        for model in MODELS {
            assert_relative_eq!(model.correlation(0.0, 2.0), 1.0);
            let mut previous = 1.0;
            for step in 1..200 {
                let distance = 0.01 * f64::from(step);
                let current = model.correlation(distance, 2.0);
                assert!(current <= previous + 1.0e-15, "{model:?} at {distance}");
                assert!(current >= 0.0);
                previous = current;
            }
        }
    }

    #[test]
    fn effective_range_hits_five_percent_correlation() {
        let phi = 0.7;
        let exponential = CovarianceModel::Exponential;
        assert_relative_eq!(exponential.effective_range(phi), 3.0 / phi);
        let at_range = exponential.correlation(exponential.effective_range(phi), phi);
        assert_relative_eq!(at_range, (-3.0_f64).exp());
        assert!((at_range - 0.05).abs() < 0.001);

        let gaussian = CovarianceModel::Gaussian;
        let at_range = gaussian.correlation(gaussian.effective_range(phi), phi);
        assert!((at_range - 0.05).abs() < 0.001);

        let spherical = CovarianceModel::Spherical;
        assert_relative_eq!(spherical.correlation(spherical.effective_range(phi), phi), 0.0);
    }

    #[test]
    fn covariance_scales_with_variance() {
        let model = CovarianceModel::Exponential;
        assert_relative_eq!(model.covariance(0.5, 2.5, 1.0), 2.5 * (-0.5_f64).exp());
    }

    #[test]
    fn default_bounds_follow_distance_extremes() {
        let (low, high) = CovarianceModel::Exponential.default_decay_bounds(0.1, 10.0);
        assert_relative_eq!(low, 0.3);
        assert_relative_eq!(high, 30.0);
    }
}

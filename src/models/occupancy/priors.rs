//! Prior specifications and log-density helpers for occupancy models.

use serde::{Deserialize, Serialize};

use crate::inference::ConfigurationError;

/// Hyperparameters for occupancy model priors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Mean of the Normal prior on occupancy coefficients (community: on their means).
    pub beta_mean: f64,
    /// Variance of the Normal prior on occupancy coefficients (community: on their means).
    pub beta_variance: f64,
    /// Mean of the Normal prior on detection coefficients (community: on their means).
    pub alpha_mean: f64,
    /// Variance of the Normal prior on detection coefficients (community: on their means).
    pub alpha_variance: f64,
    /// Inverse-Gamma shape for unstructured random-effect variances.
    pub random_effect_shape: f64,
    /// Inverse-Gamma scale for unstructured random-effect variances.
    pub random_effect_scale: f64,
    /// Inverse-Gamma shape for community-level coefficient variances.
    pub community_variance_shape: f64,
    /// Inverse-Gamma scale for community-level coefficient variances.
    pub community_variance_scale: f64,
    /// Inverse-Gamma shape for the spatial variance.
    pub sigma_sq_shape: f64,
    /// Inverse-Gamma scale for the spatial variance.
    pub sigma_sq_scale: f64,
    /// Uniform support for the spatial decay.
    ///
    /// `None` derives the support from the inter-site distance range.
    pub phi_bounds: Option<(f64, f64)>,
    /// Variance of the Normal prior on free spatial-factor loadings.
    pub loading_variance: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            beta_mean: 0.0,
            beta_variance: 2.72,
            alpha_mean: 0.0,
            alpha_variance: 2.72,
            random_effect_shape: 0.1,
            random_effect_scale: 0.1,
            community_variance_shape: 0.1,
            community_variance_scale: 0.1,
            sigma_sq_shape: 2.0,
            sigma_sq_scale: 1.0,
            phi_bounds: None,
            loading_variance: 1.0,
        }
    }
}

impl PriorConfig {
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidPrior` naming the first invalid hyperparameter.
    pub fn validate(self) -> Result<(), ConfigurationError> {
        if !(self.beta_mean.is_finite() && self.alpha_mean.is_finite()) {
            return Err(ConfigurationError::InvalidPrior("coefficient means must be finite"));
        }
        let positive = [
            (self.beta_variance, "beta_variance must be positive"),
            (self.alpha_variance, "alpha_variance must be positive"),
            (self.random_effect_shape, "random_effect_shape must be positive"),
            (self.random_effect_scale, "random_effect_scale must be positive"),
            (
                self.community_variance_shape,
                "community_variance_shape must be positive",
            ),
            (
                self.community_variance_scale,
                "community_variance_scale must be positive",
            ),
            (self.sigma_sq_shape, "sigma_sq_shape must be positive"),
            (self.sigma_sq_scale, "sigma_sq_scale must be positive"),
            (self.loading_variance, "loading_variance must be positive"),
        ];
        if let Some((_, message)) = positive
            .iter()
            .find(|(value, _)| !(*value > 0.0 && value.is_finite()))
        {
            return Err(ConfigurationError::InvalidPrior(message));
        }
        if let Some((low, high)) = self.phi_bounds
            && !(low > 0.0 && low < high && high.is_finite())
        {
            return Err(ConfigurationError::InvalidPrior(
                "phi_bounds must satisfy 0 < low < high",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.validate().is_ok()
    }
}

/// Map a value in `(low, high)` to the real line.
#[must_use]
pub fn bounded_logit(value: f64, low: f64, high: f64) -> f64 {
    ((value - low) / (high - value)).ln()
}

/// Inverse of [`bounded_logit`].
#[must_use]
pub fn bounded_logistic(value: f64, low: f64, high: f64) -> f64 {
    (high - low).mul_add(super::likelihood::logistic_stable(value), low)
}

/// Log-Jacobian of [`bounded_logistic`] expressed at the bounded value.
#[must_use]
pub fn log_bounded_jacobian(value: f64, low: f64, high: f64) -> f64 {
    (value - low).ln() + (high - value).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn prior_defaults_are_valid() {
        assert!(PriorConfig::default().is_valid());
    }

    #[test]
    fn validate_names_the_invalid_field() {
        let prior = PriorConfig {
            sigma_sq_scale: 0.0,
            ..PriorConfig::default()
        };
        assert_eq!(
            prior.validate(),
            Err(ConfigurationError::InvalidPrior("sigma_sq_scale must be positive"))
        );
        let bounds = PriorConfig {
            phi_bounds: Some((3.0, 1.0)),
            ..PriorConfig::default()
        };
        assert!(!bounds.is_valid());
    }

    #[test]
    fn bounded_transform_round_trips_inside_support() {
        let value = 2.3;
        let transformed = bounded_logit(value, 0.5, 6.0);
        assert_relative_eq!(bounded_logistic(transformed, 0.5, 6.0), value, epsilon = 1.0e-12);
    }
}

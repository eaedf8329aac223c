//! Posterior storage and summaries for occupancy models.

use crate::spatial::CovarianceModel;
use crate::utils::{mean, percentile, usize_to_f64};

/// A single retained draw of a single-species model.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyDraw {
    pub beta: Vec<f64>,
    pub alpha: Vec<f64>,
    /// Level values per occupancy random intercept.
    pub occupancy_effects: Vec<Vec<f64>>,
    pub occupancy_effect_variances: Vec<f64>,
    /// Level values per detection random intercept.
    pub detection_effects: Vec<Vec<f64>>,
    pub detection_effect_variances: Vec<f64>,
    pub sigma_sq: Option<f64>,
    pub phi: Option<f64>,
    /// Spatial random effect in input site order.
    pub w: Option<Vec<f64>>,
    /// Occupancy probability per unit.
    pub psi: Vec<f64>,
    /// Latent occupancy state per unit.
    pub z: Vec<u8>,
}

/// Retained draws from one chain, in sampling order.
#[derive(Debug, Clone, Default)]
pub struct OccupancySamples {
    pub draws: Vec<OccupancyDraw>,
}

impl OccupancySamples {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    /// Concatenate the draws of several chains.
    #[must_use]
    pub fn pooled(chains: &[Self]) -> Self {
        Self {
            draws: chains
                .iter()
                .flat_map(|chain| chain.draws.iter().cloned())
                .collect(),
        }
    }
}

/// A single retained draw of a community model.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunityDraw {
    /// Occupancy coefficients, one vector per species.
    pub beta: Vec<Vec<f64>>,
    /// Detection coefficients, one vector per species.
    pub alpha: Vec<Vec<f64>>,
    pub beta_mean: Vec<f64>,
    pub beta_variance: Vec<f64>,
    pub alpha_mean: Vec<f64>,
    pub alpha_variance: Vec<f64>,
    /// Factor loadings, one row per species.
    pub loadings: Vec<Vec<f64>>,
    /// Spatial factor fields in input site order, one per factor.
    pub factors: Vec<Vec<f64>>,
    /// Decay per spatial factor.
    pub phi: Vec<f64>,
    /// Occupancy probability per species and unit.
    pub psi: Vec<Vec<f64>>,
    /// Latent occupancy state per species and unit.
    pub z: Vec<Vec<u8>>,
}

/// Retained community draws from one chain.
#[derive(Debug, Clone, Default)]
pub struct CommunitySamples {
    pub draws: Vec<CommunityDraw>,
}

impl CommunitySamples {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.draws.is_empty()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.draws.len()
    }

    #[must_use]
    pub fn pooled(chains: &[Self]) -> Self {
        Self {
            draws: chains
                .iter()
                .flat_map(|chain| chain.draws.iter().cloned())
                .collect(),
        }
    }
}

/// Scalar posterior summary statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std_dev: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
}

/// Posterior summary for a single-species fit.
#[derive(Debug, Clone, Default)]
pub struct OccupancyPosteriorSummary {
    pub beta: Vec<ParameterSummary>,
    pub alpha: Vec<ParameterSummary>,
    pub occupancy_effect_variances: Vec<ParameterSummary>,
    pub detection_effect_variances: Vec<ParameterSummary>,
    pub sigma_sq: Option<ParameterSummary>,
    pub phi: Option<ParameterSummary>,
    /// Distance at which spatial correlation drops to about 0.05.
    pub effective_range: Option<ParameterSummary>,
    /// Posterior mean of `z` per unit (realized occupancy).
    pub occupancy_rate: Vec<f64>,
    pub draw_count: usize,
}

/// Posterior summary for a community fit.
#[derive(Debug, Clone, Default)]
pub struct CommunityPosteriorSummary {
    pub beta_mean: Vec<ParameterSummary>,
    pub beta_variance: Vec<ParameterSummary>,
    pub alpha_mean: Vec<ParameterSummary>,
    pub alpha_variance: Vec<ParameterSummary>,
    /// Per species, per coefficient.
    pub beta: Vec<Vec<ParameterSummary>>,
    pub alpha: Vec<Vec<ParameterSummary>>,
    /// Per species, per factor.
    pub loadings: Vec<Vec<ParameterSummary>>,
    pub phi: Vec<ParameterSummary>,
    pub effective_range: Vec<ParameterSummary>,
    /// Posterior mean species richness per unit.
    pub richness: Vec<f64>,
    pub draw_count: usize,
}

/// Summarize single-species draws.
#[must_use]
pub fn summarize_occupancy(
    samples: &OccupancySamples,
    covariance_model: Option<CovarianceModel>,
) -> OccupancyPosteriorSummary {
    let draw_count = samples.len();
    let Some(first) = samples.draws.first() else {
        return OccupancyPosteriorSummary::default();
    };
    let draws = &samples.draws;

    let vector_summary = |len: usize, extract: &dyn Fn(&OccupancyDraw, usize) -> f64| {
        (0..len)
            .map(|index| {
                let values: Vec<f64> = draws.iter().map(|draw| extract(draw, index)).collect();
                summarize_scalar(&values)
            })
            .collect::<Vec<_>>()
    };

    let phi_values: Option<Vec<f64>> = draws.iter().map(|draw| draw.phi).collect();
    let sigma_sq_values: Option<Vec<f64>> = draws.iter().map(|draw| draw.sigma_sq).collect();
    let effective_range = match (&phi_values, covariance_model) {
        (Some(values), Some(model)) => {
            let ranges: Vec<f64> = values.iter().map(|phi| model.effective_range(*phi)).collect();
            Some(summarize_scalar(&ranges))
        }
        _ => None,
    };

    OccupancyPosteriorSummary {
        beta: vector_summary(first.beta.len(), &|draw, j| draw.beta[j]),
        alpha: vector_summary(first.alpha.len(), &|draw, j| draw.alpha[j]),
        occupancy_effect_variances: vector_summary(
            first.occupancy_effect_variances.len(),
            &|draw, j| draw.occupancy_effect_variances[j],
        ),
        detection_effect_variances: vector_summary(
            first.detection_effect_variances.len(),
            &|draw, j| draw.detection_effect_variances[j],
        ),
        sigma_sq: sigma_sq_values.as_deref().map(summarize_scalar),
        phi: phi_values.as_deref().map(summarize_scalar),
        effective_range,
        occupancy_rate: (0..first.z.len())
            .map(|unit| {
                let values: Vec<f64> = draws.iter().map(|draw| f64::from(draw.z[unit])).collect();
                mean(&values)
            })
            .collect(),
        draw_count,
    }
}

/// Summarize community draws.
#[must_use]
pub fn summarize_community(
    samples: &CommunitySamples,
    covariance_model: Option<CovarianceModel>,
) -> CommunityPosteriorSummary {
    let draw_count = samples.len();
    let Some(first) = samples.draws.first() else {
        return CommunityPosteriorSummary::default();
    };
    let draws = &samples.draws;
    let summarize_by = |extract: &dyn Fn(&CommunityDraw) -> f64| {
        let values: Vec<f64> = draws.iter().map(extract).collect();
        summarize_scalar(&values)
    };
    let n_species = first.beta.len();
    let n_factors = first.phi.len();

    let phi: Vec<ParameterSummary> = (0..n_factors)
        .map(|l| summarize_by(&|draw| draw.phi[l]))
        .collect();
    let effective_range = covariance_model.map_or_else(Vec::new, |model| {
        (0..n_factors)
            .map(|l| summarize_by(&|draw| model.effective_range(draw.phi[l])))
            .collect()
    });
    let n_units = first.z.first().map_or(0, Vec::len);

    CommunityPosteriorSummary {
        beta_mean: (0..first.beta_mean.len())
            .map(|j| summarize_by(&|draw| draw.beta_mean[j]))
            .collect(),
        beta_variance: (0..first.beta_variance.len())
            .map(|j| summarize_by(&|draw| draw.beta_variance[j]))
            .collect(),
        alpha_mean: (0..first.alpha_mean.len())
            .map(|j| summarize_by(&|draw| draw.alpha_mean[j]))
            .collect(),
        alpha_variance: (0..first.alpha_variance.len())
            .map(|j| summarize_by(&|draw| draw.alpha_variance[j]))
            .collect(),
        beta: (0..n_species)
            .map(|k| {
                (0..first.beta[k].len())
                    .map(|j| summarize_by(&|draw| draw.beta[k][j]))
                    .collect()
            })
            .collect(),
        alpha: (0..n_species)
            .map(|k| {
                (0..first.alpha[k].len())
                    .map(|j| summarize_by(&|draw| draw.alpha[k][j]))
                    .collect()
            })
            .collect(),
        loadings: first
            .loadings
            .iter()
            .enumerate()
            .map(|(k, row)| {
                (0..row.len())
                    .map(|l| summarize_by(&|draw| draw.loadings[k][l]))
                    .collect()
            })
            .collect(),
        phi,
        effective_range,
        richness: (0..n_units)
            .map(|unit| {
                let values: Vec<f64> = draws
                    .iter()
                    .map(|draw| draw.z.iter().map(|states| f64::from(states[unit])).sum())
                    .collect();
                mean(&values)
            })
            .collect(),
        draw_count,
    }
}

#[must_use]
pub fn summarize_scalar(values: &[f64]) -> ParameterSummary {
    if values.is_empty() {
        return ParameterSummary::default();
    }

    let n = usize_to_f64(values.len());
    let mean = values.iter().sum::<f64>() / n;
    let variance = values
        .iter()
        .map(|value| {
            let centered = value - mean;
            centered * centered
        })
        .sum::<f64>()
        / n.max(1.0);

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    ParameterSummary {
        mean,
        std_dev: variance.sqrt(),
        q025: percentile(&sorted, 0.025),
        q50: percentile(&sorted, 0.5),
        q975: percentile(&sorted, 0.975),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draw(beta: f64, phi: Option<f64>, z: u8) -> OccupancyDraw {
        OccupancyDraw {
            beta: vec![beta],
            alpha: vec![-beta],
            occupancy_effects: Vec::new(),
            occupancy_effect_variances: Vec::new(),
            detection_effects: Vec::new(),
            detection_effect_variances: Vec::new(),
            sigma_sq: phi.map(|_| 1.0),
            phi,
            w: None,
            psi: vec![0.5],
            z: vec![z],
        }
    }

    #[test]
    fn summarize_empty_samples() {
        let summary = summarize_occupancy(&OccupancySamples::default(), None);
        assert_eq!(summary.draw_count, 0);
        assert!(summary.beta.is_empty());
        assert!(summary.phi.is_none());
    }

    #[test]
    fn summarize_non_empty_samples() {
        let samples = OccupancySamples {
            draws: vec![draw(0.0, Some(1.0), 1), draw(2.0, Some(3.0), 0)],
        };
        let summary = summarize_occupancy(&samples, Some(CovarianceModel::Exponential));
        assert_eq!(summary.draw_count, 2);
        assert!((summary.beta[0].mean - 1.0).abs() < 1.0e-12);
        assert!((summary.alpha[0].mean + 1.0).abs() < 1.0e-12);
        let range = summary.effective_range.expect("spatial draws");
        assert!((range.mean - 2.0).abs() < 1.0e-12);
        assert!((summary.occupancy_rate[0] - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn non_spatial_draws_have_no_spatial_summary() {
        let samples = OccupancySamples {
            draws: vec![draw(0.0, None, 1)],
        };
        let summary = summarize_occupancy(&samples, None);
        assert!(summary.sigma_sq.is_none());
        assert!(summary.effective_range.is_none());
    }

    #[test]
    fn pooled_samples_concatenate_chains() {
        let chains = vec![
            OccupancySamples {
                draws: vec![draw(0.0, None, 1)],
            },
            OccupancySamples {
                draws: vec![draw(1.0, None, 1), draw(2.0, None, 0)],
            },
        ];
        assert_eq!(OccupancySamples::pooled(&chains).len(), 3);
    }
}

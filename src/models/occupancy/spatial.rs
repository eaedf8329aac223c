//! NNGP spatial random effect and spatial factor updates.

use faer::Mat;
use rand::RngExt;
use rand::rngs::StdRng;

use super::conjugate::{
    AugmentedRegression, NormalPrior, sample_augmented_coefficients, sample_inverse_gamma,
    sample_scalar_conjugate, sample_standard_normal,
};
use super::priors::{PriorConfig, bounded_logistic, bounded_logit, log_bounded_jacobian};
use super::types::OccupancyError;
use crate::inference::{AdaptiveScale, NumericalError};
use crate::spatial::{
    CovarianceModel, NeighborIndex, NngpFactors, SpatialConfig, distance_extremes,
};

/// Neighbor index and decay support shared by every chain of a spatial fit.
#[derive(Debug, Clone)]
pub(crate) struct SpatialSetup {
    pub index: NeighborIndex,
    pub model: CovarianceModel,
    pub bounds: (f64, f64),
}

impl SpatialSetup {
    pub(crate) fn build(
        coordinates: &Mat<f64>,
        config: SpatialConfig,
        priors: &PriorConfig,
    ) -> Result<Self, OccupancyError> {
        let index = NeighborIndex::build(coordinates, config.neighbors)?;
        let bounds = priors.phi_bounds.unwrap_or_else(|| {
            let (min_distance, max_distance) = distance_extremes(coordinates);
            config
                .covariance_model
                .default_decay_bounds(min_distance, max_distance)
        });
        Ok(Self {
            index,
            model: config.covariance_model,
            bounds,
        })
    }

    /// Uniform draw inside the decay support, away from the edges.
    pub(crate) fn initial_decay(&self, rng: &mut StdRng) -> f64 {
        let (low, high) = self.bounds;
        let u = 0.8f64.mul_add(rng.random::<f64>(), 0.1);
        (high - low).mul_add(u, low)
    }

    /// Field stored in ordered positions, returned in input site order.
    pub(crate) fn to_site_order(&self, field: &[f64]) -> Vec<f64> {
        let mut output = vec![0.0; field.len()];
        for (pos, value) in field.iter().enumerate() {
            output[self.index.site_at(pos)] = *value;
        }
        output
    }
}

/// One NNGP field with its decay parameter.
#[derive(Debug, Clone)]
pub(crate) struct NngpField {
    /// Values in ordered positions.
    pub values: Vec<f64>,
    pub decay: AdaptiveScale,
    pub factors: NngpFactors,
}

impl NngpField {
    pub(crate) fn new(
        setup: &SpatialSetup,
        phi: f64,
        proposal_scale: f64,
    ) -> Result<Self, OccupancyError> {
        let factors = NngpFactors::compute(&setup.index, setup.model, phi)
            .ok_or(NumericalError::SingularPrecision)?;
        Ok(Self {
            values: vec![0.0; setup.index.n_sites()],
            decay: AdaptiveScale::new(phi, proposal_scale),
            factors,
        })
    }

    /// Value at an input site.
    pub(crate) fn at_site(&self, setup: &SpatialSetup, site: usize) -> f64 {
        self.values[setup.index.position_of(site)]
    }

    /// Gibbs sweep over positions.
    ///
    /// `data_terms(site)` returns the likelihood precision and linear contributions of
    /// the field value at `site`, with the field's own contribution removed from the
    /// offset.
    pub(crate) fn update_values<F>(
        &mut self,
        rng: &mut StdRng,
        setup: &SpatialSetup,
        sigma_sq: f64,
        mut data_terms: F,
    ) -> Result<(), NumericalError>
    where
        F: FnMut(usize, f64) -> (f64, f64),
    {
        for pos in 0..self.values.len() {
            let (prior_precision, prior_linear) =
                self.factors
                    .full_conditional(&setup.index, &self.values, pos, sigma_sq);
            let (data_precision, data_linear) =
                data_terms(setup.index.site_at(pos), self.values[pos]);
            self.values[pos] = sample_scalar_conjugate(
                rng,
                prior_precision + data_precision,
                prior_linear + data_linear,
            )?;
        }
        Ok(())
    }

    /// Metropolis update of φ on the logit scale of its support.
    ///
    /// A candidate whose neighbor blocks are singular is rejected.
    pub(crate) fn update_decay(&mut self, rng: &mut StdRng, setup: &SpatialSetup, sigma_sq: f64) {
        let (low, high) = setup.bounds;
        let current = self.decay.value;
        let proposal = self.decay.scale.mul_add(
            sample_standard_normal(rng),
            bounded_logit(current, low, high),
        );
        let candidate = bounded_logistic(proposal, low, high);
        let candidate_factors = if candidate > low && candidate < high {
            NngpFactors::compute(&setup.index, setup.model, candidate)
        } else {
            None
        };
        let Some(candidate_factors) = candidate_factors else {
            self.decay.record(candidate, false);
            return;
        };

        let current_target = self.factors.log_density(&setup.index, &self.values, sigma_sq)
            + log_bounded_jacobian(current, low, high);
        let candidate_target = candidate_factors.log_density(&setup.index, &self.values, sigma_sq)
            + log_bounded_jacobian(candidate, low, high);
        let accepted = should_accept(candidate_target - current_target, rng);
        self.decay.record(candidate, accepted);
        if accepted {
            self.factors = candidate_factors;
        }
    }
}

/// Spatial random effect of a single-species model.
#[derive(Debug, Clone)]
pub(crate) struct SpatialEffect {
    pub field: NngpField,
    pub sigma_sq: f64,
}

impl SpatialEffect {
    /// Conjugate `σ² ~ IG(a + n/2, b + Q/2)` with `Q` the NNGP quadratic form.
    pub(crate) fn update_variance(
        &mut self,
        rng: &mut StdRng,
        setup: &SpatialSetup,
        priors: &PriorConfig,
    ) -> Result<(), NumericalError> {
        let n = crate::utils::usize_to_f64(self.field.values.len());
        let quadratic = self
            .field
            .factors
            .quadratic_form(&setup.index, &self.field.values);
        let draw = sample_inverse_gamma(
            rng,
            0.5f64.mul_add(n, priors.sigma_sq_shape),
            0.5f64.mul_add(quadratic, priors.sigma_sq_scale),
        );
        if !(draw.is_finite() && draw > 0.0) {
            return Err(NumericalError::NonFiniteState);
        }
        self.sigma_sq = draw;
        Ok(())
    }
}

/// Identifiability constraint for spatial factor loadings.
///
/// Species `s` loads freely on factors `l < s`; `λ_ss = 1` for the first `q` species and
/// every entry above the diagonal is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingsMask {
    pub n_species: usize,
    pub n_factors: usize,
}

impl LoadingsMask {
    #[must_use]
    pub const fn new(n_species: usize, n_factors: usize) -> Self {
        Self {
            n_species,
            n_factors,
        }
    }

    #[must_use]
    pub const fn is_free(self, species: usize, factor: usize) -> bool {
        factor < species
    }

    /// Constrained value, or `None` for a free entry.
    #[must_use]
    pub const fn fixed_value(self, species: usize, factor: usize) -> Option<f64> {
        if factor == species {
            Some(1.0)
        } else if factor > species {
            Some(0.0)
        } else {
            None
        }
    }

    /// Free factor indices of one species row.
    #[must_use]
    pub fn free_factors(self, species: usize) -> Vec<usize> {
        (0..self.n_factors)
            .filter(|&factor| self.is_free(species, factor))
            .collect()
    }

    /// Overwrite every constrained entry.
    pub fn apply(self, loadings: &mut [Vec<f64>]) {
        for (species, row) in loadings.iter_mut().enumerate() {
            for (factor, value) in row.iter_mut().enumerate() {
                if let Some(fixed) = self.fixed_value(species, factor) {
                    *value = fixed;
                }
            }
        }
    }

    /// Loadings satisfying the constraint with all free entries zero.
    #[must_use]
    pub fn initial(self) -> Vec<Vec<f64>> {
        let mut loadings = vec![vec![0.0; self.n_factors]; self.n_species];
        self.apply(&mut loadings);
        loadings
    }
}

/// Polya-Gamma quantities of one species' occupancy regression.
pub(crate) struct SpeciesAugmentation<'a> {
    pub omega: &'a [f64],
    pub kappa: &'a [f64],
    /// Linear predictor per unit without the spatial factor terms.
    pub base_predictor: &'a [f64],
}

/// Conjugate draw of one species' free loadings given the factor fields.
///
/// Returns the full loadings row with constrained entries applied.
pub(crate) fn sample_species_loadings(
    rng: &mut StdRng,
    mask: LoadingsMask,
    species: usize,
    factor_design: &Mat<f64>,
    augmentation: &SpeciesAugmentation<'_>,
    loading_variance: f64,
) -> Result<Vec<f64>, NumericalError> {
    let mut row: Vec<f64> = (0..mask.n_factors)
        .map(|factor| mask.fixed_value(species, factor).unwrap_or(0.0))
        .collect();
    let free = mask.free_factors(species);
    if free.is_empty() {
        return Ok(row);
    }

    let n_units = factor_design.nrows();
    let offset: Vec<f64> = (0..n_units)
        .map(|unit| {
            augmentation.base_predictor[unit]
                + (0..mask.n_factors)
                    .filter(|&factor| !mask.is_free(species, factor))
                    .map(|factor| row[factor] * factor_design[(unit, factor)])
                    .sum::<f64>()
        })
        .collect();
    let design = Mat::from_fn(n_units, free.len(), |unit, j| factor_design[(unit, free[j])]);
    let rows: Vec<usize> = (0..n_units).collect();
    let draw = sample_augmented_coefficients(
        rng,
        &AugmentedRegression {
            design: &design,
            rows: &rows,
            omega: augmentation.omega,
            kappa: augmentation.kappa,
            offset: &offset,
        },
        &NormalPrior::isotropic(free.len(), 0.0, loading_variance),
    )?;
    for (factor, value) in free.into_iter().zip(draw) {
        row[factor] = value;
    }
    Ok(row)
}

pub(crate) fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::AdaptiveTuning;
    use crate::utils::usize_to_f64;
    use rand::SeedableRng;

    fn grid(n_side: usize) -> Mat<f64> {
        Mat::from_fn(n_side * n_side, 2, |i, j| {
            let value = if j == 0 { i % n_side } else { i / n_side };
            usize_to_f64(value) / usize_to_f64(n_side)
        })
    }

    #[test]
    fn loadings_mask_fixes_diagonal_and_upper_triangle() {
        let mask = LoadingsMask::new(4, 2);
        let mut loadings = vec![vec![9.0; 2]; 4];
        mask.apply(&mut loadings);
        assert_eq!(loadings[0], vec![1.0, 0.0]);
        assert_eq!(loadings[1], vec![9.0, 1.0]);
        assert_eq!(loadings[3], vec![9.0, 9.0]);
        assert_eq!(mask.free_factors(0), Vec::<usize>::new());
        assert_eq!(mask.free_factors(3), vec![0, 1]);
    }

    #[test]
    fn sampled_loadings_respect_the_mask() {
        let mask = LoadingsMask::new(3, 2);
        let n_units = 40;
        let design = Mat::from_fn(n_units, 2, |unit, factor| {
            (usize_to_f64(unit) * 0.3 + usize_to_f64(factor)).sin()
        });
        let omega = vec![0.2; n_units];
        let kappa = vec![0.1; n_units];
        let base = vec![0.0; n_units];
        let augmentation = SpeciesAugmentation {
            omega: &omega,
            kappa: &kappa,
            base_predictor: &base,
        };
        let mut rng = StdRng::seed_from_u64(21);
        for species in 0..3 {
            let row = sample_species_loadings(&mut rng, mask, species, &design, &augmentation, 1.0)
                .expect("valid draw");
            for (factor, value) in row.iter().enumerate() {
                if let Some(fixed) = mask.fixed_value(species, factor) {
                    assert!((value - fixed).abs() < f64::EPSILON);
                } else {
                    assert!(value.is_finite());
                }
            }
        }
    }

    #[test]
    fn decay_proposals_stay_inside_support() {
        let coordinates = grid(5);
        let setup = SpatialSetup::build(
            &coordinates,
            SpatialConfig {
                neighbors: 5,
                covariance_model: CovarianceModel::Exponential,
            },
            &PriorConfig::default(),
        )
        .expect("valid setup");
        let mut rng = StdRng::seed_from_u64(3);
        let phi = setup.initial_decay(&mut rng);
        let mut field = NngpField::new(&setup, phi, 5.0).expect("valid field");
        let tuning = AdaptiveTuning::default();
        for iteration in 1usize..=500 {
            field.update_decay(&mut rng, &setup, 1.0);
            assert!(field.decay.value > setup.bounds.0 && field.decay.value < setup.bounds.1);
            if iteration.is_multiple_of(25) {
                field.decay.end_batch(tuning);
            }
        }
        assert_eq!(field.decay.total.proposed, 500);
        assert!(field.decay.scale > 0.0);
    }

    #[test]
    fn spatial_field_tracks_strong_data() {
        let coordinates = grid(4);
        let setup = SpatialSetup::build(
            &coordinates,
            SpatialConfig {
                neighbors: 4,
                covariance_model: CovarianceModel::Exponential,
            },
            &PriorConfig::default(),
        )
        .expect("valid setup");
        let mut field = NngpField::new(&setup, 3.0, 1.0).expect("valid field");
        let mut rng = StdRng::seed_from_u64(12);
        let target = |site: usize| if site % 2 == 0 { 1.0 } else { -1.0 };
        let mut totals = vec![0.0; 16];
        let sweeps = 300;
        for _ in 0..sweeps {
            field
                .update_values(&mut rng, &setup, 1.0, |site, _| (400.0, 400.0 * target(site)))
                .expect("valid sweep");
            for site in 0..16 {
                totals[site] += field.at_site(&setup, site);
            }
        }
        for (site, total) in totals.iter().enumerate() {
            assert!((total / usize_to_f64(sweeps) - target(site)).abs() < 0.1);
        }
    }
}

//! Simulated occupancy data with known parameters.
//!
//! Used by tests and demos to check parameter recovery. Coordinates are uniform on the
//! unit square and spatial fields are drawn from the full Gaussian process.

use faer::Mat;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::inference::NumericalError;
use crate::input::{CommunityInput, DetectionArray, InputError, OccupancyInput, RandomIntercept};
use crate::models::matrix_ops::{dot_row, linear_predictor};
use crate::models::occupancy::conjugate::sample_standard_normal;
use crate::models::occupancy::likelihood::logistic_stable;
use crate::models::occupancy::spatial::LoadingsMask;
use crate::models::occupancy::types::OccupancyError;
use crate::spatial::CovarianceModel;
use crate::spatial::neighbors::euclidean;
use crate::utils::cholesky_lower;

/// True spatial process of a simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialTruth {
    pub sigma_sq: f64,
    pub phi: f64,
    pub covariance_model: CovarianceModel,
}

impl Default for SpatialTruth {
    fn default() -> Self {
        Self {
            sigma_sq: 1.0,
            phi: 6.0,
            covariance_model: CovarianceModel::Exponential,
        }
    }
}

/// True unstructured random intercept of a simulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RandomEffectTruth {
    pub n_levels: usize,
    pub variance: f64,
}

/// Single-species simulation settings.
///
/// Covariates beyond the intercept are standard normal; detection covariates vary by
/// replicate.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancySimulation {
    pub n_sites: usize,
    pub n_seasons: usize,
    pub n_replicates: usize,
    /// Occupancy coefficients, intercept first.
    pub beta: Vec<f64>,
    /// Detection coefficients, intercept first.
    pub alpha: Vec<f64>,
    /// Probability that a replicate is missing.
    pub missing_rate: f64,
    pub spatial: Option<SpatialTruth>,
    pub occupancy_effect: Option<RandomEffectTruth>,
    pub detection_effect: Option<RandomEffectTruth>,
}

impl Default for OccupancySimulation {
    fn default() -> Self {
        Self {
            n_sites: 50,
            n_seasons: 1,
            n_replicates: 4,
            beta: vec![0.3, -0.8],
            alpha: vec![0.4, 0.5, -0.6],
            missing_rate: 0.05,
            spatial: None,
            occupancy_effect: None,
            detection_effect: None,
        }
    }
}

/// Simulated single-species data and the values that generated it.
#[derive(Debug, Clone)]
pub struct SimulatedOccupancy {
    pub input: OccupancyInput,
    /// Spatial effect per site, when simulated.
    pub w: Option<Vec<f64>>,
    pub occupancy_effects: Option<Vec<f64>>,
    pub detection_effects: Option<Vec<f64>>,
    pub psi: Vec<f64>,
    pub z: Vec<u8>,
}

/// Community simulation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunitySimulation {
    pub n_species: usize,
    pub n_sites: usize,
    pub n_seasons: usize,
    pub n_replicates: usize,
    pub beta_mean: Vec<f64>,
    pub beta_variance: Vec<f64>,
    pub alpha_mean: Vec<f64>,
    pub alpha_variance: Vec<f64>,
    /// Number of spatial factors; zero simulates no spatial structure.
    pub n_factors: usize,
    /// Decay of every factor.
    pub phi: f64,
    pub covariance_model: CovarianceModel,
    /// Standard deviation of free loadings.
    pub loading_sd: f64,
}

impl Default for CommunitySimulation {
    fn default() -> Self {
        Self {
            n_species: 6,
            n_sites: 40,
            n_seasons: 1,
            n_replicates: 3,
            beta_mean: vec![0.2, 0.6],
            beta_variance: vec![0.5, 0.3],
            alpha_mean: vec![0.3, -0.4],
            alpha_variance: vec![0.4, 0.2],
            n_factors: 2,
            phi: 6.0,
            covariance_model: CovarianceModel::Exponential,
            loading_sd: 0.5,
        }
    }
}

/// Simulated community data and the values that generated it.
#[derive(Debug, Clone)]
pub struct SimulatedCommunity {
    pub input: CommunityInput,
    pub beta: Vec<Vec<f64>>,
    pub alpha: Vec<Vec<f64>>,
    /// `species x factors`, satisfying [`LoadingsMask`].
    pub loadings: Vec<Vec<f64>>,
    /// `factors x sites`.
    pub factors: Vec<Vec<f64>>,
    pub z: Vec<Vec<u8>>,
}

/// Intercept column followed by standard normal covariates.
fn design_with_intercept(rng: &mut StdRng, rows: usize, cols: usize) -> Mat<f64> {
    let mut design = Mat::<f64>::zeros(rows, cols);
    for row in 0..rows {
        design[(row, 0)] = 1.0;
        for col in 1..cols {
            design[(row, col)] = sample_standard_normal(rng);
        }
    }
    design
}

fn uniform_coordinates(rng: &mut StdRng, n_sites: usize) -> Mat<f64> {
    Mat::from_fn(n_sites, 2, |_, _| rng.random::<f64>())
}

/// One draw from the zero-mean Gaussian process at every site.
fn gaussian_process(
    rng: &mut StdRng,
    coordinates: &Mat<f64>,
    truth: SpatialTruth,
) -> Result<Vec<f64>, NumericalError> {
    let n = coordinates.nrows();
    let point = |site: usize| [coordinates[(site, 0)], coordinates[(site, 1)]];
    let covariance = Mat::from_fn(n, n, |i, j| {
        let value = truth
            .covariance_model
            .covariance(euclidean(point(i), point(j)), truth.sigma_sq, truth.phi);
        if i == j { value + 1e-9 } else { value }
    });
    let lower = cholesky_lower(&covariance).ok_or(NumericalError::SingularPrecision)?;
    let normals: Vec<f64> = (0..n).map(|_| sample_standard_normal(rng)).collect();
    Ok((0..n)
        .map(|i| (0..=i).map(|k| lower[(i, k)] * normals[k]).sum())
        .collect())
}

fn random_intercept(
    rng: &mut StdRng,
    name: &str,
    truth: RandomEffectTruth,
    n_rows: usize,
    level_of_row: impl Fn(usize) -> usize,
) -> (RandomIntercept, Vec<f64>) {
    let values = (0..truth.n_levels)
        .map(|_| truth.variance.sqrt() * sample_standard_normal(rng))
        .collect();
    let levels = (0..n_rows).map(|row| level_of_row(row) % truth.n_levels).collect();
    (RandomIntercept::new(name, levels), values)
}

/// Detections at every cell of one species; `None` for missing replicates.
fn detection_values(
    rng: &mut StdRng,
    z: &[u8],
    detection_eta: &[f64],
    n_replicates: usize,
    missing: &[bool],
) -> Vec<Option<bool>> {
    detection_eta
        .iter()
        .enumerate()
        .map(|(cell, eta)| {
            if missing[cell] {
                return None;
            }
            let occupied = z[cell / n_replicates] == 1;
            Some(occupied && rng.random::<f64>() < logistic_stable(*eta))
        })
        .collect()
}

fn missing_cells(rng: &mut StdRng, n_cells: usize, n_replicates: usize, rate: f64) -> Vec<bool> {
    (0..n_cells)
        // The first replicate of every unit is always observed.
        .map(|cell| cell % n_replicates != 0 && rng.random::<f64>() < rate)
        .collect()
}

/// Simulate single-species detection data.
///
/// # Errors
///
/// Returns `OccupancyError` for empty dimensions or coefficient vectors, a non-positive
/// random-effect level count, or a singular spatial covariance.
pub fn simulate_occupancy(
    settings: &OccupancySimulation,
    seed: u64,
) -> Result<SimulatedOccupancy, OccupancyError> {
    if settings.beta.is_empty() {
        return Err(InputError::EmptyDesign { design: "occupancy" }.into());
    }
    if settings.alpha.is_empty() {
        return Err(InputError::EmptyDesign { design: "detection" }.into());
    }
    for truth in [settings.occupancy_effect, settings.detection_effect]
        .into_iter()
        .flatten()
    {
        if truth.n_levels == 0 {
            return Err(InputError::EmptyRandomEffect {
                name: "simulated".to_owned(),
            }
            .into());
        }
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let n_units = settings.n_sites * settings.n_seasons;
    let n_cells = n_units * settings.n_replicates;

    let coordinates = uniform_coordinates(&mut rng, settings.n_sites);
    let occupancy_design = design_with_intercept(&mut rng, n_units, settings.beta.len());
    let detection_design = design_with_intercept(&mut rng, n_cells, settings.alpha.len());

    let w = settings
        .spatial
        .map(|truth| gaussian_process(&mut rng, &coordinates, truth))
        .transpose()?;
    let n_sites = settings.n_sites.max(1);
    let occupancy_effect = settings.occupancy_effect.map(|truth| {
        random_intercept(&mut rng, "occupancy_group", truth, n_units, |unit| {
            unit / settings.n_seasons.max(1) % n_sites
        })
    });
    let detection_effect = settings.detection_effect.map(|truth| {
        random_intercept(&mut rng, "observer", truth, n_units, |unit| unit)
    });

    let mut occupancy_eta = linear_predictor(&occupancy_design, &settings.beta);
    for (unit, eta) in occupancy_eta.iter_mut().enumerate() {
        if let Some(field) = &w {
            *eta += field[unit / settings.n_seasons];
        }
        if let Some((effect, values)) = &occupancy_effect {
            *eta += values[effect.levels[unit]];
        }
    }
    let psi: Vec<f64> = occupancy_eta.into_iter().map(logistic_stable).collect();
    let z: Vec<u8> = psi
        .iter()
        .map(|psi| u8::from(rng.random::<f64>() < *psi))
        .collect();

    let detection_eta: Vec<f64> = (0..n_cells)
        .map(|cell| {
            let unit = cell / settings.n_replicates;
            let effect = detection_effect
                .as_ref()
                .map_or(0.0, |(effect, values)| values[effect.levels[unit]]);
            dot_row(&detection_design, cell, &settings.alpha) + effect
        })
        .collect();
    let missing = missing_cells(&mut rng, n_cells, settings.n_replicates, settings.missing_rate);
    let values = detection_values(&mut rng, &z, &detection_eta, settings.n_replicates, &missing);
    let detections = DetectionArray::new(
        settings.n_sites,
        settings.n_seasons,
        settings.n_replicates,
        values,
    )?;

    let mut input =
        OccupancyInput::new(detections, occupancy_design, detection_design).with_coordinates(coordinates);
    let mut occupancy_effects = None;
    if let Some((effect, values)) = occupancy_effect {
        input = input.with_occupancy_random_effect(effect);
        occupancy_effects = Some(values);
    }
    let mut detection_effects = None;
    if let Some((effect, values)) = detection_effect {
        input = input.with_detection_random_effect(effect);
        detection_effects = Some(values);
    }
    input.validate()?;

    Ok(SimulatedOccupancy {
        input,
        w,
        occupancy_effects,
        detection_effects,
        psi,
        z,
    })
}

/// Simulate detection data for a community with shared detection missingness.
///
/// # Errors
///
/// Returns `OccupancyError` for empty dimensions, mismatched hyperparameter lengths,
/// more factors than species, or a singular spatial covariance.
pub fn simulate_community(
    settings: &CommunitySimulation,
    seed: u64,
) -> Result<SimulatedCommunity, OccupancyError> {
    if settings.beta_mean.is_empty() || settings.beta_mean.len() != settings.beta_variance.len() {
        return Err(InputError::EmptyDesign { design: "occupancy" }.into());
    }
    if settings.alpha_mean.is_empty() || settings.alpha_mean.len() != settings.alpha_variance.len()
    {
        return Err(InputError::EmptyDesign { design: "detection" }.into());
    }
    if settings.n_species == 0 {
        return Err(InputError::NoSpecies.into());
    }
    if settings.n_factors > settings.n_species {
        return Err(crate::inference::ConfigurationError::InvalidFactorCount {
            factors: settings.n_factors,
            species: settings.n_species,
        }
        .into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let n_units = settings.n_sites * settings.n_seasons;
    let n_cells = n_units * settings.n_replicates;

    let coordinates = uniform_coordinates(&mut rng, settings.n_sites);
    let occupancy_design = design_with_intercept(&mut rng, n_units, settings.beta_mean.len());
    let detection_design = design_with_intercept(&mut rng, n_cells, settings.alpha_mean.len());

    let truth = SpatialTruth {
        sigma_sq: 1.0,
        phi: settings.phi,
        covariance_model: settings.covariance_model,
    };
    let factors = (0..settings.n_factors)
        .map(|_| gaussian_process(&mut rng, &coordinates, truth))
        .collect::<Result<Vec<_>, _>>()?;
    let mask = LoadingsMask::new(settings.n_species, settings.n_factors);
    let mut loadings = mask.initial();
    for (species, row) in loadings.iter_mut().enumerate() {
        for factor in mask.free_factors(species) {
            row[factor] = settings.loading_sd * sample_standard_normal(&mut rng);
        }
    }

    let mut around = |mean: &[f64], variance: &[f64]| -> Vec<f64> {
        mean.iter()
            .zip(variance)
            .map(|(mean, variance)| variance.sqrt().mul_add(sample_standard_normal(&mut rng), *mean))
            .collect()
    };
    let beta: Vec<Vec<f64>> = (0..settings.n_species)
        .map(|_| around(&settings.beta_mean, &settings.beta_variance))
        .collect();
    let alpha: Vec<Vec<f64>> = (0..settings.n_species)
        .map(|_| around(&settings.alpha_mean, &settings.alpha_variance))
        .collect();

    let missing = missing_cells(&mut rng, n_cells, settings.n_replicates, 0.0);
    let mut detections = Vec::with_capacity(settings.n_species);
    let mut z = Vec::with_capacity(settings.n_species);
    for species in 0..settings.n_species {
        let mut eta = linear_predictor(&occupancy_design, &beta[species]);
        for (unit, value) in eta.iter_mut().enumerate() {
            let site = unit / settings.n_seasons;
            *value += loadings[species]
                .iter()
                .zip(&factors)
                .map(|(lambda, field)| lambda * field[site])
                .sum::<f64>();
        }
        let states: Vec<u8> = eta
            .into_iter()
            .map(|eta| u8::from(rng.random::<f64>() < logistic_stable(eta)))
            .collect();
        let detection_eta = linear_predictor(&detection_design, &alpha[species]);
        let values = detection_values(&mut rng, &states, &detection_eta, settings.n_replicates, &missing);
        detections.push(DetectionArray::new(
            settings.n_sites,
            settings.n_seasons,
            settings.n_replicates,
            values,
        )?);
        z.push(states);
    }

    let input = CommunityInput::new(detections, occupancy_design, detection_design)
        .with_coordinates(coordinates);
    input.validate()?;
    Ok(SimulatedCommunity {
        input,
        beta,
        alpha,
        loadings,
        factors,
        z,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detections_only_occur_at_occupied_units() {
        let data = simulate_occupancy(&OccupancySimulation::default(), 1).expect("simulation");
        for (unit, state) in data.z.iter().enumerate() {
            if data.input.detections.unit_detected(unit) {
                assert_eq!(*state, 1);
            }
        }
        assert_eq!(data.psi.len(), 50);
    }

    #[test]
    fn simulation_is_seeded() {
        let settings = OccupancySimulation {
            spatial: Some(SpatialTruth::default()),
            occupancy_effect: Some(RandomEffectTruth {
                n_levels: 5,
                variance: 0.5,
            }),
            ..OccupancySimulation::default()
        };
        let first = simulate_occupancy(&settings, 8).expect("simulation");
        let second = simulate_occupancy(&settings, 8).expect("simulation");
        assert_eq!(first.z, second.z);
        assert_eq!(first.w, second.w);
        assert_eq!(first.input.occupancy_random_effects.len(), 1);
        assert_eq!(first.w.as_ref().map(Vec::len), Some(50));
    }

    #[test]
    fn community_loadings_satisfy_the_mask() {
        let data = simulate_community(&CommunitySimulation::default(), 2).expect("simulation");
        let mask = LoadingsMask::new(6, 2);
        let mut constrained = data.loadings.clone();
        mask.apply(&mut constrained);
        assert_eq!(constrained, data.loadings);
        assert_eq!(data.factors.len(), 2);
        assert_eq!(data.input.n_species(), 6);
    }

    #[test]
    fn too_many_factors_are_rejected() {
        let settings = CommunitySimulation {
            n_factors: 7,
            ..CommunitySimulation::default()
        };
        assert!(simulate_community(&settings, 3).is_err());
    }
}

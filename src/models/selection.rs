/////////////////////////////////////////////////////////////////////////////////////////////\
//
// Model selection utilities for occupancy models.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Selection workflow
//!
//! WAIC and in-sample deviance from stored posterior draws, and k-fold cross-validated
//! deviance over sites. Every criterion marginalizes the latent state: a unit contributes
//! `ψ ∏ p^y (1-p)^(1-y)` when any replicate is a detection and `ψ ∏ (1-p) + 1 - ψ`
//! otherwise.

use log::{debug, info};
use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::inference::ConfigurationError;
use crate::input::{CommunityInput, DetectionArray, OccupancyInput};
use crate::utils::{log_mean_exp, mean, sample_variance};

use super::occupancy::community::fit_community;
use super::occupancy::input::{ObservationLayout, SpeciesObservations};
use super::occupancy::likelihood::{detection_probabilities, unit_log_likelihoods};
use super::occupancy::posterior::{CommunitySamples, OccupancySamples};
use super::occupancy::prediction::{NewSites, predict_community, predict_occupancy};
use super::occupancy::sampler::fit_occupancy;
use super::occupancy::types::{OccupancyError, SamplerConfig};

/// Widely applicable information criterion on the deviance scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaicSummary {
    /// Log pointwise predictive density, `Σ_u log mean_s L_us`.
    pub lppd: f64,
    /// Effective number of parameters, `Σ_u var_s log L_us`.
    pub p_waic: f64,
    /// `-2 (lppd - p_waic)`; lower is better.
    pub waic: f64,
    /// Expected log predictive density, `lppd - p_waic`.
    pub elpd: f64,
    pub n_units: usize,
}

impl WaicSummary {
    fn from_log_likelihoods(log_likelihoods: &[Vec<f64>]) -> Result<Self, OccupancyError> {
        let Some(first) = log_likelihoods.first() else {
            return Err(OccupancyError::EmptyPosterior);
        };
        let n_units = first.len();
        let mut lppd = 0.0;
        let mut p_waic = 0.0;
        let mut column = Vec::with_capacity(log_likelihoods.len());
        for unit in 0..n_units {
            column.clear();
            column.extend(log_likelihoods.iter().map(|draw| draw[unit]));
            lppd += log_mean_exp(&column);
            p_waic += sample_variance(&column, mean(&column));
        }
        Ok(Self::from_parts(lppd, p_waic, n_units))
    }

    fn from_parts(lppd: f64, p_waic: f64, n_units: usize) -> Self {
        let elpd = lppd - p_waic;
        Self {
            lppd,
            p_waic,
            waic: -2.0 * elpd,
            elpd,
            n_units,
        }
    }

    /// In-sample deviance `-2 lppd`, so that `waic = deviance + 2 p_waic`.
    #[must_use]
    pub fn deviance(&self) -> f64 {
        -2.0 * self.lppd
    }

    /// Sum of independent components, e.g. the species of a community.
    #[must_use]
    pub fn combine(parts: &[Self]) -> Self {
        let lppd = parts.iter().map(|part| part.lppd).sum();
        let p_waic = parts.iter().map(|part| part.p_waic).sum();
        let n_units = parts.iter().map(|part| part.n_units).sum();
        Self::from_parts(lppd, p_waic, n_units)
    }
}

/// Per-draw, per-unit marginal log-likelihoods of one species.
struct SpeciesLikelihood<'a> {
    layout: &'a ObservationLayout,
    observations: SpeciesObservations,
}

impl<'a> SpeciesLikelihood<'a> {
    fn new(layout: &'a ObservationLayout, detections: &DetectionArray) -> Self {
        Self {
            layout,
            observations: SpeciesObservations::new(detections),
        }
    }

    fn evaluate(&self, psi: &[f64], detection: &[f64]) -> Result<Vec<f64>, OccupancyError> {
        if psi.len() != self.layout.n_units() {
            return Err(OccupancyError::InconsistentPosteriorDimensions);
        }
        Ok(unit_log_likelihoods(
            self.layout,
            &self.observations.y,
            psi,
            detection,
        ))
    }
}

fn occupancy_log_likelihoods(
    samples: &OccupancySamples,
    input: &OccupancyInput,
) -> Result<Vec<Vec<f64>>, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    let layout = ObservationLayout::new(&input.detections);
    let likelihood = SpeciesLikelihood::new(&layout, &input.detections);
    samples
        .draws
        .iter()
        .map(|draw| {
            if draw.alpha.len() != input.detection_design.ncols() {
                return Err(OccupancyError::InconsistentPosteriorDimensions);
            }
            let detection = detection_probabilities(
                &layout,
                &input.detection_design,
                &draw.alpha,
                &input.detection_random_effects,
                &draw.detection_effects,
            );
            likelihood.evaluate(&draw.psi, &detection)
        })
        .collect()
}

fn community_log_likelihoods(
    samples: &CommunitySamples,
    input: &CommunityInput,
) -> Result<Vec<Vec<Vec<f64>>>, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    input.validate()?;
    let Some(reference) = input.detections.first() else {
        return Err(OccupancyError::InconsistentPosteriorDimensions);
    };
    let layout = ObservationLayout::new(reference);
    input
        .detections
        .iter()
        .enumerate()
        .map(|(species, detections)| {
            let likelihood = SpeciesLikelihood::new(&layout, detections);
            samples
                .draws
                .iter()
                .map(|draw| {
                    let (Some(alpha), Some(psi)) = (draw.alpha.get(species), draw.psi.get(species))
                    else {
                        return Err(OccupancyError::InconsistentPosteriorDimensions);
                    };
                    let detection =
                        detection_probabilities(&layout, &input.detection_design, alpha, &[], &[]);
                    likelihood.evaluate(psi, &detection)
                })
                .collect()
        })
        .collect()
}

/// WAIC of a single-species fit, using every observed unit.
///
/// # Errors
///
/// Returns `OccupancyError::EmptyPosterior` without draws and
/// `InconsistentPosteriorDimensions` when draws do not match `input`.
pub fn waic(samples: &OccupancySamples, input: &OccupancyInput) -> Result<WaicSummary, OccupancyError> {
    WaicSummary::from_log_likelihoods(&occupancy_log_likelihoods(samples, input)?)
}

/// In-sample deviance `-2 lppd` of a single-species fit.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`waic`].
pub fn in_sample_deviance(
    samples: &OccupancySamples,
    input: &OccupancyInput,
) -> Result<f64, OccupancyError> {
    Ok(waic(samples, input)?.deviance())
}

/// WAIC of every species in a community fit.
///
/// Use [`WaicSummary::combine`] for the community total.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`waic`].
pub fn community_waic(
    samples: &CommunitySamples,
    input: &CommunityInput,
) -> Result<Vec<WaicSummary>, OccupancyError> {
    community_log_likelihoods(samples, input)?
        .iter()
        .map(|species| WaicSummary::from_log_likelihoods(species))
        .collect()
}

/// In-sample deviance summed over species.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`waic`].
pub fn community_in_sample_deviance(
    samples: &CommunitySamples,
    input: &CommunityInput,
) -> Result<f64, OccupancyError> {
    Ok(WaicSummary::combine(&community_waic(samples, input)?).deviance())
}

/// Options for k-fold cross-validation over sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossValidationOptions {
    pub k_folds: usize,
    /// Seeds the site shuffle and held-out prediction.
    pub seed: u64,
}

impl Default for CrossValidationOptions {
    fn default() -> Self {
        Self {
            k_folds: 5,
            seed: 42,
        }
    }
}

/// Held-out deviance per fold.
#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidationResult {
    /// Sites held out in each fold, in input indices.
    pub fold_sites: Vec<Vec<usize>>,
    /// `-2 Σ log mean L` over held-out units, per fold.
    pub fold_deviance: Vec<f64>,
    pub mean_deviance: f64,
    pub total_deviance: f64,
}

impl CrossValidationResult {
    fn from_folds(fold_sites: Vec<Vec<usize>>, fold_deviance: Vec<f64>) -> Self {
        let total_deviance = fold_deviance.iter().sum();
        Self {
            mean_deviance: mean(&fold_deviance),
            total_deviance,
            fold_sites,
            fold_deviance,
        }
    }
}

/// Shuffle sites with `seed` and split them into `k` folds whose sizes differ by at most one.
///
/// # Errors
///
/// Returns `ConfigurationError::InvalidFoldCount` unless `2 <= k < n_sites`.
pub fn site_folds(
    n_sites: usize,
    k_folds: usize,
    seed: u64,
) -> Result<Vec<Vec<usize>>, ConfigurationError> {
    if k_folds < 2 || k_folds >= n_sites {
        return Err(ConfigurationError::InvalidFoldCount {
            folds: k_folds,
            sites: n_sites,
        });
    }
    let mut sites = (0..n_sites).collect::<Vec<_>>();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    sites.shuffle(&mut rng);

    Ok((0..k_folds)
        .map(|fold| {
            let start = fold * n_sites / k_folds;
            let end = (fold + 1) * n_sites / k_folds;
            let mut held_out = sites[start..end].to_vec();
            held_out.sort_unstable();
            held_out
        })
        .collect())
}

fn complement_sites(n_sites: usize, held_out: &[usize]) -> Vec<usize> {
    let mut keep = vec![true; n_sites];
    for &site in held_out {
        keep[site] = false;
    }
    (0..n_sites).filter(|&site| keep[site]).collect()
}

/// Held-out deviance from per-draw, per-unit log-likelihoods.
fn held_out_deviance(log_likelihoods: &[Vec<f64>]) -> f64 {
    let Some(first) = log_likelihoods.first() else {
        return f64::NAN;
    };
    let mut column = Vec::with_capacity(log_likelihoods.len());
    let lppd: f64 = (0..first.len())
        .map(|unit| {
            column.clear();
            column.extend(log_likelihoods.iter().map(|draw| draw[unit]));
            log_mean_exp(&column)
        })
        .sum();
    -2.0 * lppd
}

/// Run one closure per fold on scoped threads, returning results in fold order.
fn run_folds<F>(folds: &[Vec<usize>], run: F) -> Result<Vec<f64>, OccupancyError>
where
    F: Fn(usize, &[usize]) -> Result<f64, OccupancyError> + Sync,
{
    let run = &run;
    let results: Vec<Result<f64, OccupancyError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = folds
            .iter()
            .enumerate()
            .map(|(fold, sites)| scope.spawn(move || run(fold, sites)))
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(fold, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(OccupancyError::FoldPanicked { fold }))
            })
            .collect()
    });
    results.into_iter().collect()
}

fn fold_seed(seed: u64, fold: usize) -> u64 {
    seed.wrapping_add(u64::try_from(fold).unwrap_or(u64::MAX))
}

/// k-fold cross-validated deviance of a single-species model.
///
/// Each fold refits on the remaining sites with `config`, predicts `ψ` at the held-out
/// sites (kriging the spatial effect for spatial models), and scores their observed
/// detections. Folds run in parallel.
///
/// # Errors
///
/// Returns `OccupancyError` for invalid input or fold counts, or if any fold fit or
/// prediction fails.
pub fn cross_validate_occupancy(
    input: &OccupancyInput,
    config: &SamplerConfig,
    options: CrossValidationOptions,
) -> Result<CrossValidationResult, OccupancyError> {
    input.validate()?;
    let n_sites = input.n_sites();
    let folds = site_folds(n_sites, options.k_folds, options.seed)?;
    info!("cross-validating occupancy model: {} folds over {n_sites} sites", folds.len());

    let deviances = run_folds(&folds, |fold, held_out| {
        let train = input.subset_sites(&complement_sites(n_sites, held_out))?;
        let test = input.subset_sites(held_out)?;
        let (model, _report, samples) = fit_occupancy(&train, config)?;
        let pooled = OccupancySamples::pooled(&samples);

        let mut new_sites = NewSites::new(test.occupancy_design.clone(), test.detections.n_seasons());
        new_sites.coordinates.clone_from(&test.coordinates);
        new_sites
            .occupancy_random_effects
            .clone_from(&test.occupancy_random_effects);
        let prediction =
            predict_occupancy(&model, &pooled, &new_sites, fold_seed(options.seed, fold))?;

        let layout = ObservationLayout::new(&test.detections);
        let likelihood = SpeciesLikelihood::new(&layout, &test.detections);
        let log_likelihoods = pooled
            .draws
            .iter()
            .zip(&prediction.psi)
            .map(|(draw, psi)| {
                let detection = detection_probabilities(
                    &layout,
                    &test.detection_design,
                    &draw.alpha,
                    &test.detection_random_effects,
                    &draw.detection_effects,
                );
                likelihood.evaluate(psi, &detection)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let deviance = held_out_deviance(&log_likelihoods);
        debug!("fold {fold}: {} held-out sites, deviance {deviance:.3}", held_out.len());
        Ok(deviance)
    })?;
    Ok(CrossValidationResult::from_folds(folds, deviances))
}

/// k-fold cross-validated deviance of a community model, summed over species.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`cross_validate_occupancy`].
pub fn cross_validate_community(
    input: &CommunityInput,
    config: &SamplerConfig,
    options: CrossValidationOptions,
) -> Result<CrossValidationResult, OccupancyError> {
    input.validate()?;
    let n_sites = input.n_sites();
    let folds = site_folds(n_sites, options.k_folds, options.seed)?;
    info!(
        "cross-validating community model: {} species, {} folds over {n_sites} sites",
        input.n_species(),
        folds.len()
    );

    let deviances = run_folds(&folds, |fold, held_out| {
        let train = input.subset_sites(&complement_sites(n_sites, held_out))?;
        let test = input.subset_sites(held_out)?;
        let Some(reference) = test.detections.first() else {
            return Err(OccupancyError::InconsistentPosteriorDimensions);
        };
        let (model, _report, samples) = fit_community(&train, config)?;
        let pooled = CommunitySamples::pooled(&samples);

        let mut new_sites = NewSites::new(test.occupancy_design.clone(), reference.n_seasons());
        new_sites.coordinates.clone_from(&test.coordinates);
        let prediction =
            predict_community(&model, &pooled, &new_sites, fold_seed(options.seed, fold))?;

        let layout = ObservationLayout::new(reference);
        let mut deviance = 0.0;
        for (species, detections) in test.detections.iter().enumerate() {
            let likelihood = SpeciesLikelihood::new(&layout, detections);
            let log_likelihoods = pooled
                .draws
                .iter()
                .zip(&prediction.psi)
                .map(|(draw, psi)| {
                    let (Some(alpha), Some(psi)) = (draw.alpha.get(species), psi.get(species))
                    else {
                        return Err(OccupancyError::InconsistentPosteriorDimensions);
                    };
                    let detection =
                        detection_probabilities(&layout, &test.detection_design, alpha, &[], &[]);
                    likelihood.evaluate(psi, &detection)
                })
                .collect::<Result<Vec<_>, _>>()?;
            deviance += held_out_deviance(&log_likelihoods);
        }
        debug!("fold {fold}: {} held-out sites, deviance {deviance:.3}", held_out.len());
        Ok(deviance)
    })?;
    Ok(CrossValidationResult::from_folds(folds, deviances))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{BatchSchedule, ChainOptions};
    use crate::simulate::{CommunitySimulation, OccupancySimulation, simulate_community, simulate_occupancy};
    use approx::assert_relative_eq;

    fn quick_config() -> SamplerConfig {
        SamplerConfig {
            schedule: BatchSchedule {
                n_batch: 30,
                batch_length: 10,
                n_burn: 150,
                n_thin: 3,
                seed: 17,
            },
            chains: ChainOptions {
                chains: 2,
                ..ChainOptions::default()
            },
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn waic_decomposes_into_deviance_and_penalty() {
        let data = simulate_occupancy(&OccupancySimulation::default(), 21).expect("simulation");
        let (_, _, samples) = fit_occupancy(&data.input, &quick_config()).expect("fit succeeds");
        let pooled = OccupancySamples::pooled(&samples);
        let summary = waic(&pooled, &data.input).expect("waic");
        let deviance = in_sample_deviance(&pooled, &data.input).expect("deviance");

        assert!(summary.waic.is_finite());
        assert!(summary.p_waic >= 0.0);
        assert_eq!(summary.n_units, data.input.detections.n_units());
        assert_relative_eq!(summary.waic, 2.0f64.mul_add(summary.p_waic, deviance), epsilon = 1e-9);
    }

    #[test]
    fn waic_of_identical_draws_has_no_penalty() {
        let data = simulate_occupancy(&OccupancySimulation::default(), 22).expect("simulation");
        let (_, _, samples) = fit_occupancy(&data.input, &quick_config()).expect("fit succeeds");
        let first = samples[0].draws[0].clone();
        let repeated = OccupancySamples {
            draws: vec![first; 5],
        };
        let summary = waic(&repeated, &data.input).expect("waic");
        assert_relative_eq!(summary.p_waic, 0.0, epsilon = 1e-12);
        assert_relative_eq!(summary.waic, summary.deviance(), epsilon = 1e-9);
    }

    #[test]
    fn waic_rejects_empty_posterior() {
        let data = simulate_occupancy(&OccupancySimulation::default(), 23).expect("simulation");
        assert_eq!(
            waic(&OccupancySamples::default(), &data.input),
            Err(OccupancyError::EmptyPosterior)
        );
    }

    #[test]
    fn combined_waic_sums_components() {
        let a = WaicSummary::from_parts(-10.0, 2.0, 5);
        let b = WaicSummary::from_parts(-4.0, 1.0, 3);
        let total = WaicSummary::combine(&[a, b]);
        assert_relative_eq!(total.lppd, -14.0);
        assert_relative_eq!(total.waic, 34.0);
        assert_eq!(total.n_units, 8);
    }

    #[test]
    fn folds_partition_sites() {
        let folds = site_folds(23, 4, 7).expect("valid folds");
        assert_eq!(folds.len(), 4);
        let mut all: Vec<usize> = folds.iter().flatten().copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..23).collect::<Vec<_>>());
        assert_eq!(folds, site_folds(23, 4, 7).expect("valid folds"));
    }

    #[test]
    fn fold_count_is_validated() {
        for k in [0, 1, 10, 11] {
            assert_eq!(
                site_folds(10, k, 1),
                Err(ConfigurationError::InvalidFoldCount { folds: k, sites: 10 })
            );
        }
    }

    #[test]
    fn cross_validation_reports_every_fold() {
        let data = simulate_occupancy(&OccupancySimulation::default(), 24).expect("simulation");
        let options = CrossValidationOptions { k_folds: 3, seed: 5 };
        let result = cross_validate_occupancy(&data.input, &quick_config(), options).expect("cv");
        assert_eq!(result.fold_deviance.len(), 3);
        assert!(result.fold_deviance.iter().all(|deviance| deviance.is_finite() && *deviance > 0.0));
        assert_relative_eq!(result.total_deviance, result.fold_deviance.iter().sum::<f64>());
        assert_relative_eq!(result.mean_deviance, result.total_deviance / 3.0);
    }

    #[test]
    fn community_waic_covers_every_species() {
        let data = simulate_community(&CommunitySimulation::default(), 25).expect("simulation");
        let config = SamplerConfig {
            chains: ChainOptions {
                chains: 1,
                ..ChainOptions::default()
            },
            ..quick_config()
        };
        let (_, _, samples) = fit_community(&data.input, &config).expect("fit succeeds");
        let pooled = CommunitySamples::pooled(&samples);
        let per_species = community_waic(&pooled, &data.input).expect("waic");
        assert_eq!(per_species.len(), data.input.n_species());
        let total = community_in_sample_deviance(&pooled, &data.input).expect("deviance");
        assert_relative_eq!(
            total,
            per_species.iter().map(WaicSummary::deviance).sum::<f64>(),
            epsilon = 1e-9
        );
    }
}

//! MCMC convergence and posterior predictive diagnostics for occupancy models.

use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::input::{CommunityInput, OccupancyInput};
use crate::utils::{sample_variance, usize_to_f64};

use super::input::{ObservationLayout, SpeciesObservations};
use super::likelihood::detection_probabilities;
use super::posterior::{CommunityDraw, CommunitySamples, OccupancyDraw, OccupancySamples};
use super::types::{ConvergenceSummary, OccupancyError, ParameterConvergence};

/// Lag-`k` autocorrelation for a scalar chain.
#[must_use]
pub fn autocorrelation(series: &[f64], lag: usize) -> f64 {
    if series.is_empty() || lag >= series.len() {
        return 0.0;
    }

    let n = series.len() - lag;
    let mean = series.iter().sum::<f64>() / usize_to_f64(series.len());

    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for value in series {
        let centered = value - mean;
        denominator += centered * centered;
    }

    if denominator <= 0.0 {
        return 0.0;
    }

    for idx in 0..n {
        numerator += (series[idx] - mean) * (series[idx + lag] - mean);
    }

    numerator / denominator
}

/// Heuristic effective sample size using positive autocorrelation truncation.
#[must_use]
pub fn effective_sample_size(series: &[f64]) -> f64 {
    let n = series.len();
    if n < 2 {
        return usize_to_f64(n);
    }

    let mut rho_sum = 0.0;
    for lag in 1..n {
        let rho = autocorrelation(series, lag);
        if rho <= 0.0 {
            break;
        }
        rho_sum += rho;
    }

    usize_to_f64(n) / (2.0f64.mul_add(rho_sum, 1.0)).max(1.0)
}

/// Split-R-hat of one scalar from equal-length chains.
///
/// Each chain is halved, so every chain needs at least four draws. A parameter with zero
/// within-chain variance reports 1.
///
/// # Errors
///
/// Returns `OccupancyError` for fewer than two chains, too few draws, or unequal lengths.
pub fn split_rhat(chains: &[Vec<f64>]) -> Result<f64, OccupancyError> {
    if chains.len() < 2 {
        return Err(OccupancyError::InsufficientChains {
            min: 2,
            found: chains.len(),
        });
    }
    let n = chains.first().map_or(0, Vec::len);
    if n < 4 {
        return Err(OccupancyError::InsufficientChainDraws {
            minimum: 4,
            found: n,
        });
    }
    if chains.iter().any(|chain| chain.len() != n) {
        return Err(OccupancyError::InconsistentPosteriorDimensions);
    }
    let half = n / 2;
    let split: Vec<Vec<f64>> = chains
        .iter()
        .flat_map(|chain| [chain[..half].to_vec(), chain[half..2 * half].to_vec()])
        .collect();
    Ok(potential_scale_reduction(&split))
}

fn potential_scale_reduction(chains: &[Vec<f64>]) -> f64 {
    let n = chains.first().map_or(0, Vec::len);
    let m = chains.len();
    let chain_means: Vec<f64> = chains
        .iter()
        .map(|chain| chain.iter().sum::<f64>() / usize_to_f64(n))
        .collect();
    let chain_vars: Vec<f64> = chains
        .iter()
        .zip(&chain_means)
        .map(|(chain, mean)| sample_variance(chain, *mean))
        .collect();

    let mean_of_means = chain_means.iter().sum::<f64>() / usize_to_f64(m);
    let between = usize_to_f64(n)
        * chain_means
            .iter()
            .map(|mean| {
                let centered = *mean - mean_of_means;
                centered * centered
            })
            .sum::<f64>()
        / usize_to_f64(m - 1);
    let within = chain_vars.iter().sum::<f64>() / usize_to_f64(m);

    if !(within.is_finite() && within > 0.0 && between.is_finite()) {
        return 1.0;
    }

    let n_f64 = usize_to_f64(n);
    let var_plus = ((n_f64 - 1.0) / n_f64).mul_add(within, between / n_f64);
    if !var_plus.is_finite() || var_plus <= 0.0 {
        return 1.0;
    }

    (var_plus / within).sqrt().max(1.0)
}

/// Split-R-hat and ESS for every named scalar of `extract`.
fn summarize_series<D>(
    chains: &[&[D]],
    names: &[String],
    extract: impl Fn(&D) -> Vec<f64>,
) -> Result<ConvergenceSummary, OccupancyError> {
    if chains.len() < 2 {
        return Err(OccupancyError::InsufficientChains {
            min: 2,
            found: chains.len(),
        });
    }
    let min_draws = chains.iter().map(|draws| draws.len()).min().unwrap_or(0);
    let draws_per_chain_used = min_draws - (min_draws % 2);
    if draws_per_chain_used < 4 {
        return Err(OccupancyError::InsufficientChainDraws {
            minimum: 4,
            found: draws_per_chain_used,
        });
    }

    // series[parameter][chain][draw]
    let mut series = vec![vec![Vec::with_capacity(draws_per_chain_used); chains.len()]; names.len()];
    for (chain, draws) in chains.iter().enumerate() {
        for draw in draws.iter().take(draws_per_chain_used) {
            let values = extract(draw);
            if values.len() != names.len() {
                return Err(OccupancyError::InconsistentPosteriorDimensions);
            }
            for (parameter, value) in values.into_iter().enumerate() {
                series[parameter][chain].push(value);
            }
        }
    }

    let parameters = names
        .iter()
        .zip(&series)
        .map(|(name, chains)| {
            Ok::<_, OccupancyError>(ParameterConvergence {
                name: name.clone(),
                split_rhat: split_rhat(chains)?,
                effective_sample_size: chains
                    .iter()
                    .map(|chain| effective_sample_size(chain))
                    .sum(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let max_split_rhat = parameters
        .iter()
        .map(|parameter| parameter.split_rhat)
        .max_by(f64::total_cmp);

    Ok(ConvergenceSummary {
        chain_count: chains.len(),
        draws_per_chain_used,
        parameters,
        max_split_rhat,
    })
}

fn indexed_names(prefix: &str, len: usize) -> impl Iterator<Item = String> + '_ {
    (0..len).map(move |index| format!("{prefix}[{index}]"))
}

fn occupancy_scalars(draw: &OccupancyDraw) -> Vec<f64> {
    draw.beta
        .iter()
        .chain(&draw.alpha)
        .chain(&draw.occupancy_effect_variances)
        .chain(&draw.detection_effect_variances)
        .copied()
        .chain(draw.sigma_sq)
        .chain(draw.phi)
        .collect()
}

/// Convergence summary for `beta[j]`, `alpha[j]`, random-effect variances, `sigma_sq`
/// and `phi`.
///
/// Chains are truncated to a common even length.
///
/// # Errors
///
/// Returns `OccupancyError` for fewer than two chains, fewer than four draws per chain,
/// or inconsistent draw dimensions.
pub fn occupancy_convergence(
    chains: &[OccupancySamples],
) -> Result<ConvergenceSummary, OccupancyError> {
    let first = chains
        .iter()
        .find_map(|chain| chain.draws.first())
        .ok_or(OccupancyError::EmptyPosterior)?;
    let names: Vec<String> = indexed_names("beta", first.beta.len())
        .chain(indexed_names("alpha", first.alpha.len()))
        .chain(indexed_names(
            "occupancy_effect_variance",
            first.occupancy_effect_variances.len(),
        ))
        .chain(indexed_names(
            "detection_effect_variance",
            first.detection_effect_variances.len(),
        ))
        .chain(first.sigma_sq.map(|_| "sigma_sq".to_owned()))
        .chain(first.phi.map(|_| "phi".to_owned()))
        .collect();
    let draws: Vec<&[OccupancyDraw]> = chains.iter().map(|chain| chain.draws.as_slice()).collect();
    summarize_series(&draws, &names, occupancy_scalars)
}

fn community_scalars(draw: &CommunityDraw) -> Vec<f64> {
    draw.beta_mean
        .iter()
        .chain(&draw.beta_variance)
        .chain(&draw.alpha_mean)
        .chain(&draw.alpha_variance)
        .chain(&draw.phi)
        .copied()
        .collect()
}

/// Convergence summary for community means and variances and the factor decays.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`occupancy_convergence`].
pub fn community_convergence(
    chains: &[CommunitySamples],
) -> Result<ConvergenceSummary, OccupancyError> {
    let first = chains
        .iter()
        .find_map(|chain| chain.draws.first())
        .ok_or(OccupancyError::EmptyPosterior)?;
    let names: Vec<String> = indexed_names("beta_mean", first.beta_mean.len())
        .chain(indexed_names("beta_variance", first.beta_variance.len()))
        .chain(indexed_names("alpha_mean", first.alpha_mean.len()))
        .chain(indexed_names("alpha_variance", first.alpha_variance.len()))
        .chain(indexed_names("phi", first.phi.len()))
        .collect();
    let draws: Vec<&[CommunityDraw]> = chains.iter().map(|chain| chain.draws.as_slice()).collect();
    summarize_series(&draws, &names, community_scalars)
}

/// Discrepancy between observed or replicated counts and their expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatistic {
    /// `Σ (√y - √E)²`.
    #[default]
    FreemanTukey,
    /// `Σ (y - E)² / E`.
    ChiSquared,
}

/// How detections are aggregated before the discrepancy is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PpcGrouping {
    /// Sum over replicates within each occupancy unit.
    #[default]
    Site,
    /// Sum over units for each replicate index.
    Replicate,
}

const CHI_SQUARED_EPSILON: f64 = 1.0e-6;

impl FitStatistic {
    #[must_use]
    pub fn discrepancy(self, counts: &[f64], expected: &[f64]) -> f64 {
        counts
            .iter()
            .zip(expected)
            .map(|(&count, &expectation)| match self {
                Self::FreemanTukey => {
                    let difference = count.sqrt() - expectation.sqrt();
                    difference * difference
                }
                Self::ChiSquared => {
                    let difference = count - expectation;
                    difference * difference / (expectation + CHI_SQUARED_EPSILON)
                }
            })
            .sum()
    }
}

/// Posterior predictive check result.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorPredictiveCheck {
    pub statistic: FitStatistic,
    pub grouping: PpcGrouping,
    /// Discrepancy of the observed data, per draw.
    pub fit_observed: Vec<f64>,
    /// Discrepancy of replicated data, per draw.
    pub fit_replicated: Vec<f64>,
    /// Fraction of draws with `fit_replicated > fit_observed`.
    pub bayesian_p_value: f64,
}

/// Latent states and detection probabilities of one species for one draw.
struct DrawDetections<'a> {
    z: &'a [u8],
    detection: Vec<f64>,
}

struct CheckRequest<'a> {
    layout: &'a ObservationLayout,
    observations: &'a SpeciesObservations,
    n_replicates: usize,
    statistic: FitStatistic,
    grouping: PpcGrouping,
}

impl CheckRequest<'_> {
    fn n_groups(&self) -> usize {
        match self.grouping {
            PpcGrouping::Site => self.layout.n_units(),
            PpcGrouping::Replicate => self.n_replicates,
        }
    }

    fn group(&self, cell: usize) -> usize {
        match self.grouping {
            PpcGrouping::Site => self.layout.cell_unit[cell],
            PpcGrouping::Replicate => cell % self.n_replicates,
        }
    }

    /// Observed and replicated discrepancies for one draw.
    fn evaluate(&self, rng: &mut StdRng, draw: &DrawDetections<'_>) -> (f64, f64) {
        let n_groups = self.n_groups();
        let mut observed = vec![0.0; n_groups];
        let mut replicated = vec![0.0; n_groups];
        let mut expected = vec![0.0; n_groups];
        for &cell in &self.layout.observed_cells {
            let group = self.group(cell);
            let probability = f64::from(draw.z[self.layout.cell_unit[cell]]) * draw.detection[cell];
            expected[group] += probability;
            if self.observations.y[cell] {
                observed[group] += 1.0;
            }
            if rng.random::<f64>() < probability {
                replicated[group] += 1.0;
            }
        }
        (
            self.statistic.discrepancy(&observed, &expected),
            self.statistic.discrepancy(&replicated, &expected),
        )
    }

    fn finish(&self, fit_observed: Vec<f64>, fit_replicated: Vec<f64>) -> PosteriorPredictiveCheck {
        let exceed = fit_observed
            .iter()
            .zip(&fit_replicated)
            .filter(|(observed, replicated)| replicated > observed)
            .count();
        PosteriorPredictiveCheck {
            statistic: self.statistic,
            grouping: self.grouping,
            bayesian_p_value: usize_to_f64(exceed) / usize_to_f64(fit_observed.len().max(1)),
            fit_observed,
            fit_replicated,
        }
    }
}

/// Posterior predictive check of a single-species fit.
///
/// For every draw, replicate detections are simulated as `Bernoulli(z · p)` at observed
/// cells and both data sets are compared with their expectation `Σ z · p`.
///
/// # Errors
///
/// Returns `OccupancyError::EmptyPosterior` for no draws, or
/// `InconsistentPosteriorDimensions` if the draws do not match `input`.
pub fn posterior_predictive_check(
    samples: &OccupancySamples,
    input: &OccupancyInput,
    statistic: FitStatistic,
    grouping: PpcGrouping,
    seed: u64,
) -> Result<PosteriorPredictiveCheck, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    let layout = ObservationLayout::new(&input.detections);
    let observations = SpeciesObservations::new(&input.detections);
    let request = CheckRequest {
        layout: &layout,
        observations: &observations,
        n_replicates: input.detections.n_replicates(),
        statistic,
        grouping,
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let mut fit_observed = Vec::with_capacity(samples.len());
    let mut fit_replicated = Vec::with_capacity(samples.len());
    for draw in &samples.draws {
        if draw.z.len() != layout.n_units() || draw.alpha.len() != input.detection_design.ncols() {
            return Err(OccupancyError::InconsistentPosteriorDimensions);
        }
        let detections = DrawDetections {
            z: &draw.z,
            detection: detection_probabilities(
                &layout,
                &input.detection_design,
                &draw.alpha,
                &input.detection_random_effects,
                &draw.detection_effects,
            ),
        };
        let (observed, replicated) = request.evaluate(&mut rng, &detections);
        fit_observed.push(observed);
        fit_replicated.push(replicated);
    }
    Ok(request.finish(fit_observed, fit_replicated))
}

/// Posterior predictive check of every species in a community fit.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`posterior_predictive_check`].
pub fn community_posterior_predictive_check(
    samples: &CommunitySamples,
    input: &CommunityInput,
    statistic: FitStatistic,
    grouping: PpcGrouping,
    seed: u64,
) -> Result<Vec<PosteriorPredictiveCheck>, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    let Some(reference) = input.detections.first() else {
        return Err(OccupancyError::InconsistentPosteriorDimensions);
    };
    let layout = ObservationLayout::new(reference);
    let mut rng = StdRng::seed_from_u64(seed);
    input
        .detections
        .iter()
        .enumerate()
        .map(|(species, detections)| {
            let observations = SpeciesObservations::new(detections);
            let request = CheckRequest {
                layout: &layout,
                observations: &observations,
                n_replicates: detections.n_replicates(),
                statistic,
                grouping,
            };
            let mut fit_observed = Vec::with_capacity(samples.len());
            let mut fit_replicated = Vec::with_capacity(samples.len());
            for draw in &samples.draws {
                let (Some(z), Some(alpha)) = (draw.z.get(species), draw.alpha.get(species)) else {
                    return Err(OccupancyError::InconsistentPosteriorDimensions);
                };
                if z.len() != layout.n_units() || alpha.len() != input.detection_design.ncols() {
                    return Err(OccupancyError::InconsistentPosteriorDimensions);
                }
                let detections = DrawDetections {
                    z,
                    detection: detection_probabilities(
                        &layout,
                        &input.detection_design,
                        alpha,
                        &[],
                        &[],
                    ),
                };
                let (observed, replicated) = request.evaluate(&mut rng, &detections);
                fit_observed.push(observed);
                fit_replicated.push(replicated);
            }
            Ok(request.finish(fit_observed, fit_replicated))
        })
        .collect()
}

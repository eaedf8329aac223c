//! Multi-species occupancy with community-level priors and NNGP spatial factors.
//!
//! Species coefficients share `N(μ, diag τ²)` priors. With a spatial configuration, each
//! species' occupancy predictor adds `Σ_l λ_kl w_l(site)` over `q` unit-variance NNGP
//! factor fields, with loadings constrained by [`LoadingsMask`].

use faer::Mat;
use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::inference::{ConfigurationError, NumericalError};
use crate::input::{CommunityInput, InputError};
use crate::models::matrix_ops::{linear_predictor, linear_predictor_rows};

use super::conjugate::{
    AugmentedRegression, NormalPrior, sample_augmented_coefficients, sample_inverse_gamma,
    sample_scalar_conjugate, sample_standard_normal,
};
use super::diagnostics::community_convergence;
use super::input::{ObservationLayout, SpeciesObservations};
use super::latent::sample_latent_states;
use super::likelihood::logistic_stable;
use super::polya_gamma::sample_polya_gamma;
use super::posterior::{CommunityDraw, CommunitySamples, summarize_community};
use super::sampler::{advance_phase, convergence_if_estimable, is_cancelled, run_chains};
use super::spatial::{
    LoadingsMask, NngpField, SpatialSetup, SpeciesAugmentation, sample_species_loadings,
};
use super::types::{
    ChainDiagnostics, ChainPhase, CommunityInitialValues, CommunityModel, CommunityReport,
    FitControl, OccupancyError, SamplerConfig,
};

struct CommunityContext<'a> {
    input: &'a CommunityInput,
    layout: ObservationLayout,
    species: Vec<SpeciesObservations>,
    spatial: Option<SpatialSetup>,
    mask: LoadingsMask,
    config: SamplerConfig,
    units: Vec<usize>,
}

/// Community-level mean and variance of one coefficient block.
#[derive(Debug, Clone)]
struct Hyperparameters {
    mean: Vec<f64>,
    variance: Vec<f64>,
}

#[derive(Debug, Clone)]
struct CommunityState {
    beta: Vec<Vec<f64>>,
    alpha: Vec<Vec<f64>>,
    occupancy: Hyperparameters,
    detection: Hyperparameters,
    z: Vec<Vec<u8>>,
    loadings: Vec<Vec<f64>>,
    factors: Vec<NngpField>,
}

/// Per-species scratch buffers.
struct SpeciesWorkspace {
    /// Full occupancy predictor, including factor terms.
    occupancy_predictor: Vec<f64>,
    /// `X β_k` only.
    fixed_predictor: Vec<f64>,
    occupancy_omega: Vec<f64>,
    occupancy_kappa: Vec<f64>,
    detection_omega: Vec<f64>,
    detection_kappa: Vec<f64>,
    active_cells: Vec<usize>,
}

struct ChainOutput {
    samples: CommunitySamples,
    diagnostics: ChainDiagnostics,
}

/// Fit a community occupancy model with default controls.
///
/// # Errors
///
/// Returns `OccupancyError` if the input or configuration is invalid, or if a chain
/// fails numerically.
pub fn fit_community(
    input: &CommunityInput,
    config: &SamplerConfig,
) -> Result<(CommunityModel, CommunityReport, Vec<CommunitySamples>), OccupancyError> {
    fit_community_with_control(input, config, FitControl::default())
}

/// Fit a community occupancy model with initial values and cancellation.
///
/// # Errors
///
/// Returns `OccupancyError` if the input, configuration, factor count, or initial values
/// are invalid, if a chain fails numerically, or if sampling was cancelled.
pub fn fit_community_with_control(
    input: &CommunityInput,
    config: &SamplerConfig,
    control: FitControl<'_, CommunityInitialValues>,
) -> Result<(CommunityModel, CommunityReport, Vec<CommunitySamples>), OccupancyError> {
    config.validate()?;
    input.validate()?;
    let n_species = input.n_species();
    let reference = input.detections.first().ok_or(InputError::NoSpecies)?;

    let spatial = match config.spatial {
        Some(spatial_config) => {
            if config.n_factors == 0 || config.n_factors > n_species {
                return Err(ConfigurationError::InvalidFactorCount {
                    factors: config.n_factors,
                    species: n_species,
                }
                .into());
            }
            let coordinates = input
                .coordinates
                .as_ref()
                .ok_or(ConfigurationError::MissingCoordinates)?;
            Some(SpatialSetup::build(coordinates, spatial_config, &config.priors)?)
        }
        None => None,
    };
    let n_factors = if spatial.is_some() { config.n_factors } else { 0 };
    if let Some(initial) = control.initial_values {
        validate_initial_values(initial, input, n_factors, spatial.as_ref())?;
    }

    let model = CommunityModel {
        n_species,
        n_occupancy_covariates: input.occupancy_design.ncols(),
        n_detection_covariates: input.detection_design.ncols(),
        n_sites: input.n_sites(),
        n_seasons: reference.n_seasons(),
        n_factors,
        spatial: config.spatial,
        decay_bounds: spatial.as_ref().map(|setup| setup.bounds),
        coordinates: spatial.as_ref().and(input.coordinates.clone()),
    };

    let layout = ObservationLayout::new(reference);
    let context = CommunityContext {
        input,
        units: (0..layout.n_units()).collect(),
        layout,
        species: input.detections.iter().map(SpeciesObservations::new).collect(),
        spatial,
        mask: LoadingsMask::new(n_species, n_factors),
        config: *config,
    };
    info!(
        "fitting community model: {n_species} species, {} units, {n_factors} spatial factors, {} chains",
        context.layout.n_units(),
        config.chains.chains
    );

    let outputs = run_chains(config.chains, config.schedule.seed, |chain, seed| {
        run_chain(&context, chain, seed, control)
    })?;
    let (chains, samples): (Vec<_>, Vec<_>) = outputs
        .into_iter()
        .map(|output| (output.diagnostics, output.samples))
        .unzip();
    let pooled = CommunitySamples::pooled(&samples);
    let pooled_summary = summarize_community(
        &pooled,
        config.spatial.map(|spatial| spatial.covariance_model),
    );
    let convergence = if samples.len() >= 2 {
        convergence_if_estimable(community_convergence(&samples))?
    } else {
        None
    };
    info!("community fit complete: {} retained draws", pooled.len());

    Ok((
        model,
        CommunityReport {
            chains,
            pooled_summary,
            convergence,
        },
        samples,
    ))
}

fn run_chain(
    context: &CommunityContext<'_>,
    chain: usize,
    seed: u64,
    control: FitControl<'_, CommunityInitialValues>,
) -> Result<ChainOutput, OccupancyError> {
    let schedule = context.config.schedule;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut state = context.initial_state(&mut rng, control.initial_values)?;
    let mut workspaces: Vec<SpeciesWorkspace> =
        (0..context.species.len()).map(|_| context.workspace()).collect();
    let mut samples = CommunitySamples {
        draws: Vec::with_capacity(schedule.retained_draws()),
    };
    let mut phase = ChainPhase::Initializing;

    for iteration in 0..schedule.iterations() {
        if is_cancelled(control.cancel) {
            warn!("chain {chain}: cancelled at iteration {iteration}");
            return Err(OccupancyError::Cancelled { chain, iteration });
        }
        phase = advance_phase(chain, schedule, iteration, phase);

        context
            .sweep(&mut rng, &mut state, &mut workspaces)
            .map_err(|source| {
                warn!("chain {chain}: {source} at iteration {iteration}");
                OccupancyError::ChainFailed {
                    chain,
                    iteration,
                    source,
                }
            })?;

        if schedule.is_batch_end(iteration) {
            for (factor, field) in state.factors.iter_mut().enumerate() {
                let rate = field.decay.end_batch(context.config.tuning);
                debug!(
                    "chain {chain}: factor {factor} phi acceptance {rate:.3}, scale {:.4}",
                    field.decay.scale
                );
            }
        }

        if schedule.is_retained(iteration) {
            samples.draws.push(context.record(&state));
        }
    }
    advance_phase(chain, schedule, schedule.iterations(), phase);

    Ok(ChainOutput {
        diagnostics: ChainDiagnostics {
            chain,
            seed,
            iterations_completed: schedule.iterations(),
            retained_draws: samples.len(),
            phi_acceptance: state
                .factors
                .iter()
                .map(|field| field.decay.total.acceptance_rate())
                .collect(),
            phi_proposal_scale: state.factors.iter().map(|field| field.decay.scale).collect(),
            phi_last_batch_acceptance: state
                .factors
                .iter()
                .map(|field| field.decay.last_batch_rate)
                .collect(),
        },
        samples,
    })
}

impl CommunityContext<'_> {
    fn n_species(&self) -> usize {
        self.species.len()
    }

    fn initial_state(
        &self,
        rng: &mut StdRng,
        initial: Option<&CommunityInitialValues>,
    ) -> Result<CommunityState, OccupancyError> {
        let p_occ = self.input.occupancy_design.ncols();
        let p_det = self.input.detection_design.ncols();
        let beta_mean = initial
            .and_then(|values| values.beta_mean.clone())
            .unwrap_or_else(|| vec![0.0; p_occ]);
        let alpha_mean = initial
            .and_then(|values| values.alpha_mean.clone())
            .unwrap_or_else(|| vec![0.0; p_det]);
        let mut around = |mean: &[f64]| -> Vec<f64> {
            mean.iter()
                .map(|value| value + sample_standard_normal(rng))
                .collect()
        };
        let beta = (0..self.n_species()).map(|_| around(&beta_mean)).collect();
        let alpha = (0..self.n_species()).map(|_| around(&alpha_mean)).collect();

        let factors = match &self.spatial {
            Some(setup) => (0..self.mask.n_factors)
                .map(|factor| {
                    let phi = initial
                        .and_then(|values| values.phi.as_ref())
                        .and_then(|phi| phi.get(factor).copied())
                        .unwrap_or_else(|| setup.initial_decay(rng));
                    NngpField::new(setup, phi, self.config.tuning.initial_scale)
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(CommunityState {
            beta,
            alpha,
            occupancy: Hyperparameters {
                mean: beta_mean,
                variance: vec![1.0; p_occ],
            },
            detection: Hyperparameters {
                mean: alpha_mean,
                variance: vec![1.0; p_det],
            },
            z: self
                .species
                .iter()
                .map(|observations| observations.initial_z(&self.layout))
                .collect(),
            loadings: self.mask.initial(),
            factors,
        })
    }

    fn workspace(&self) -> SpeciesWorkspace {
        let n_units = self.layout.n_units();
        let n_cells = self.layout.n_cells();
        SpeciesWorkspace {
            occupancy_predictor: vec![0.0; n_units],
            fixed_predictor: vec![0.0; n_units],
            occupancy_omega: vec![0.0; n_units],
            occupancy_kappa: vec![0.0; n_units],
            detection_omega: vec![0.0; n_cells],
            detection_kappa: vec![0.0; n_cells],
            active_cells: Vec::with_capacity(self.layout.observed_cells.len()),
        }
    }

    /// `Σ_l λ_kl w_l(site)` for one species at one unit.
    fn factor_term(&self, state: &CommunityState, species: usize, unit: usize) -> f64 {
        let Some(setup) = &self.spatial else {
            return 0.0;
        };
        let site = self.layout.unit_site(unit);
        state.loadings[species]
            .iter()
            .zip(&state.factors)
            .map(|(lambda, field)| lambda * field.at_site(setup, site))
            .sum()
    }

    fn occupancy_predictor(&self, state: &CommunityState, species: usize) -> Vec<f64> {
        let mut predictor = linear_predictor(&self.input.occupancy_design, &state.beta[species]);
        if self.spatial.is_some() {
            for (unit, value) in predictor.iter_mut().enumerate() {
                *value += self.factor_term(state, species, unit);
            }
        }
        predictor
    }

    fn sweep(
        &self,
        rng: &mut StdRng,
        state: &mut CommunityState,
        workspaces: &mut [SpeciesWorkspace],
    ) -> Result<(), NumericalError> {
        for (species, workspace) in workspaces.iter_mut().enumerate() {
            self.update_species(rng, state, species, workspace)?;
        }
        let priors = &self.config.priors;
        let variance_prior = (priors.community_variance_shape, priors.community_variance_scale);
        let beta_prior = NormalPrior::isotropic(
            state.occupancy.mean.len(),
            priors.beta_mean,
            priors.beta_variance,
        );
        let alpha_prior = NormalPrior::isotropic(
            state.detection.mean.len(),
            priors.alpha_mean,
            priors.alpha_variance,
        );
        update_hyperparameters(rng, &state.beta, &mut state.occupancy, &beta_prior, variance_prior)?;
        update_hyperparameters(rng, &state.alpha, &mut state.detection, &alpha_prior, variance_prior)?;
        if let Some(setup) = &self.spatial {
            self.update_factors(rng, setup, state, workspaces)?;
        }
        Ok(())
    }

    /// Latent states, Polya-Gamma draws, and coefficients of one species.
    fn update_species(
        &self,
        rng: &mut StdRng,
        state: &mut CommunityState,
        species: usize,
        workspace: &mut SpeciesWorkspace,
    ) -> Result<(), NumericalError> {
        let observations = &self.species[species];
        let occupancy_predictor = self.occupancy_predictor(state, species);
        let detection_predictor = linear_predictor_rows(
            &self.input.detection_design,
            &state.alpha[species],
            &self.layout.observed_cells,
        );
        if !occupancy_predictor.iter().all(|value| value.is_finite())
            || !self
                .layout
                .observed_cells
                .iter()
                .all(|&cell| detection_predictor[cell].is_finite())
        {
            return Err(NumericalError::NonFiniteLinearPredictor);
        }

        let z = &mut state.z[species];
        sample_latent_states(
            rng,
            &self.layout,
            observations,
            &occupancy_predictor,
            &detection_predictor,
            z,
        );
        for unit in 0..self.layout.n_units() {
            workspace.occupancy_omega[unit] = sample_polya_gamma(rng, occupancy_predictor[unit])?;
            workspace.occupancy_kappa[unit] = f64::from(z[unit]) - 0.5;
        }
        workspace.active_cells.clear();
        for &cell in &self.layout.observed_cells {
            if z[self.layout.cell_unit[cell]] == 1 {
                workspace.detection_omega[cell] = sample_polya_gamma(rng, detection_predictor[cell])?;
                workspace.detection_kappa[cell] = if observations.y[cell] { 0.5 } else { -0.5 };
                workspace.active_cells.push(cell);
            }
        }

        let design = &self.input.occupancy_design;
        let offset: Vec<f64> = self
            .units
            .iter()
            .map(|&unit| self.factor_term(state, species, unit))
            .collect();
        state.beta[species] = sample_augmented_coefficients(
            rng,
            &AugmentedRegression {
                design,
                rows: &self.units,
                omega: &workspace.occupancy_omega,
                kappa: &workspace.occupancy_kappa,
                offset: &offset,
            },
            &NormalPrior {
                mean: state.occupancy.mean.clone(),
                variance: state.occupancy.variance.clone(),
            },
        )?;
        workspace.fixed_predictor = linear_predictor(design, &state.beta[species]);
        for &unit in &self.units {
            workspace.occupancy_predictor[unit] = workspace.fixed_predictor[unit] + offset[unit];
        }

        let zeros = vec![0.0; self.layout.n_cells()];
        state.alpha[species] = sample_augmented_coefficients(
            rng,
            &AugmentedRegression {
                design: &self.input.detection_design,
                rows: &workspace.active_cells,
                omega: &workspace.detection_omega,
                kappa: &workspace.detection_kappa,
                offset: &zeros,
            },
            &NormalPrior {
                mean: state.detection.mean.clone(),
                variance: state.detection.variance.clone(),
            },
        )?;
        Ok(())
    }

    /// Factor fields, their decays, then loadings.
    fn update_factors(
        &self,
        rng: &mut StdRng,
        setup: &SpatialSetup,
        state: &mut CommunityState,
        workspaces: &mut [SpeciesWorkspace],
    ) -> Result<(), NumericalError> {
        let n_seasons = self.layout.n_seasons;
        for factor in 0..state.factors.len() {
            let previous = setup.to_site_order(&state.factors[factor].values);
            let loadings = &state.loadings;
            let buffers: &[SpeciesWorkspace] = workspaces;
            state.factors[factor].update_values(rng, setup, 1.0, |site, current| {
                let mut precision = 0.0;
                let mut linear = 0.0;
                for (species, workspace) in buffers.iter().enumerate() {
                    let lambda = loadings[species][factor];
                    if lambda == 0.0 {
                        continue;
                    }
                    for unit in site * n_seasons..(site + 1) * n_seasons {
                        let omega = workspace.occupancy_omega[unit];
                        let rest = workspace.occupancy_predictor[unit] - lambda * current;
                        precision += omega * lambda * lambda;
                        linear += lambda * omega.mul_add(-rest, workspace.occupancy_kappa[unit]);
                    }
                }
                (precision, linear)
            })?;

            let updated = setup.to_site_order(&state.factors[factor].values);
            for (species, workspace) in workspaces.iter_mut().enumerate() {
                let lambda = state.loadings[species][factor];
                for unit in 0..self.layout.n_units() {
                    let site = self.layout.unit_site(unit);
                    workspace.occupancy_predictor[unit] +=
                        lambda * (updated[site] - previous[site]);
                }
            }
            state.factors[factor].update_decay(rng, setup, 1.0);
        }

        let factor_sites: Vec<Vec<f64>> = state
            .factors
            .iter()
            .map(|field| setup.to_site_order(&field.values))
            .collect();
        let factor_design = Mat::from_fn(self.layout.n_units(), state.factors.len(), |unit, l| {
            factor_sites[l][self.layout.unit_site(unit)]
        });
        for (species, workspace) in workspaces.iter().enumerate() {
            state.loadings[species] = sample_species_loadings(
                rng,
                self.mask,
                species,
                &factor_design,
                &SpeciesAugmentation {
                    omega: &workspace.occupancy_omega,
                    kappa: &workspace.occupancy_kappa,
                    base_predictor: &workspace.fixed_predictor,
                },
                self.config.priors.loading_variance,
            )?;
        }
        self.mask.apply(&mut state.loadings);
        Ok(())
    }

    fn record(&self, state: &CommunityState) -> CommunityDraw {
        let factors = self.spatial.as_ref().map_or_else(Vec::new, |setup| {
            state
                .factors
                .iter()
                .map(|field| setup.to_site_order(&field.values))
                .collect()
        });
        CommunityDraw {
            beta: state.beta.clone(),
            alpha: state.alpha.clone(),
            beta_mean: state.occupancy.mean.clone(),
            beta_variance: state.occupancy.variance.clone(),
            alpha_mean: state.detection.mean.clone(),
            alpha_variance: state.detection.variance.clone(),
            loadings: state.loadings.clone(),
            factors,
            phi: state.factors.iter().map(|field| field.decay.value).collect(),
            psi: (0..self.n_species())
                .map(|species| {
                    self.occupancy_predictor(state, species)
                        .into_iter()
                        .map(logistic_stable)
                        .collect()
                })
                .collect(),
            z: state.z.clone(),
        }
    }
}

/// Conjugate updates of the community mean and variance of each coefficient.
fn update_hyperparameters(
    rng: &mut StdRng,
    coefficients: &[Vec<f64>],
    hyper: &mut Hyperparameters,
    prior: &NormalPrior,
    (shape, scale): (f64, f64),
) -> Result<(), NumericalError> {
    let n_species = crate::utils::usize_to_f64(coefficients.len());
    for j in 0..hyper.mean.len() {
        let sum: f64 = coefficients.iter().map(|species| species[j]).sum();
        let precision = prior.variance[j].recip() + n_species / hyper.variance[j];
        let linear = prior.mean[j] / prior.variance[j] + sum / hyper.variance[j];
        hyper.mean[j] = sample_scalar_conjugate(rng, precision, linear)?;

        let sum_sq: f64 = coefficients
            .iter()
            .map(|species| {
                let centered = species[j] - hyper.mean[j];
                centered * centered
            })
            .sum();
        let draw = sample_inverse_gamma(
            rng,
            0.5f64.mul_add(n_species, shape),
            0.5f64.mul_add(sum_sq, scale),
        );
        if !(draw.is_finite() && draw > 0.0) {
            return Err(NumericalError::NonFiniteState);
        }
        hyper.variance[j] = draw;
    }
    Ok(())
}

fn validate_initial_values(
    initial: &CommunityInitialValues,
    input: &CommunityInput,
    n_factors: usize,
    spatial: Option<&SpatialSetup>,
) -> Result<(), ConfigurationError> {
    let finite_of_len = |values: &[f64], len: usize| {
        values.len() == len && values.iter().all(|value| value.is_finite())
    };
    if let Some(mean) = &initial.beta_mean
        && !finite_of_len(mean, input.occupancy_design.ncols())
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "beta_mean must be finite with one value per occupancy covariate",
        ));
    }
    if let Some(mean) = &initial.alpha_mean
        && !finite_of_len(mean, input.detection_design.ncols())
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "alpha_mean must be finite with one value per detection covariate",
        ));
    }
    if let (Some(phi), Some(setup)) = (&initial.phi, spatial) {
        let (low, high) = setup.bounds;
        if phi.len() != n_factors || phi.iter().any(|value| !(*value > low && *value < high)) {
            return Err(ConfigurationError::InvalidInitialValues(
                "phi must give one value per factor inside the uniform support",
            ));
        }
    }
    Ok(())
}

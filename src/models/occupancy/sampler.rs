//! Single-species sampler entrypoints.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use rand::{RngExt, SeedableRng};
use rand::rngs::StdRng;

use crate::inference::{BatchSchedule, ChainOptions, ConfigurationError, NumericalError};
use crate::input::OccupancyInput;
use crate::models::matrix_ops::{dot_row, linear_predictor, linear_predictor_rows};

use super::conjugate::{
    AugmentedRegression, NormalPrior, sample_augmented_coefficients, sample_standard_normal,
};
use super::diagnostics::occupancy_convergence;
use super::input::{ObservationLayout, SpeciesObservations};
use super::latent::sample_latent_states;
use super::likelihood::logistic_stable;
use super::polya_gamma::sample_polya_gamma;
use super::posterior::{OccupancyDraw, OccupancySamples, summarize_occupancy};
use super::random_effects::{AugmentedRows, RandomEffectState};
use super::spatial::{NngpField, SpatialEffect, SpatialSetup};
use super::types::{
    ChainDiagnostics, ChainPhase, ConvergenceSummary, FitControl, InitialValues, OccupancyError,
    OccupancyModel, OccupancyReport, SamplerConfig,
};

/// Read-only data shared by every chain of a fit.
struct SamplerContext<'a> {
    input: &'a OccupancyInput,
    layout: ObservationLayout,
    observations: SpeciesObservations,
    spatial: Option<SpatialSetup>,
    config: SamplerConfig,
    units: Vec<usize>,
}

#[derive(Debug, Clone)]
struct ChainState {
    beta: Vec<f64>,
    alpha: Vec<f64>,
    z: Vec<u8>,
    occupancy_effects: RandomEffectState,
    detection_effects: RandomEffectState,
    spatial: Option<SpatialEffect>,
}

/// Per-iteration scratch buffers.
struct Workspace {
    occupancy_predictor: Vec<f64>,
    detection_predictor: Vec<f64>,
    occupancy_omega: Vec<f64>,
    occupancy_kappa: Vec<f64>,
    detection_omega: Vec<f64>,
    detection_kappa: Vec<f64>,
    /// Observed cells at units currently occupied.
    active_cells: Vec<usize>,
}

struct ChainOutput {
    samples: OccupancySamples,
    diagnostics: ChainDiagnostics,
}

/// Fit a single-species occupancy model with default controls.
///
/// # Errors
///
/// Returns `OccupancyError` if the input or configuration is invalid, or if a chain
/// fails numerically.
pub fn fit_occupancy(
    input: &OccupancyInput,
    config: &SamplerConfig,
) -> Result<(OccupancyModel, OccupancyReport, Vec<OccupancySamples>), OccupancyError> {
    fit_occupancy_with_control(input, config, FitControl::default())
}

/// Fit a single-species occupancy model with initial values and cancellation.
///
/// Chains run on scoped threads; each owns its RNG seeded from the schedule seed and
/// the chain stride. Returns model metadata, a pooled report, and per-chain draws.
///
/// # Errors
///
/// Returns `OccupancyError` if the input, configuration, or initial values are invalid,
/// if a chain fails numerically (`ChainFailed`), or if sampling was cancelled.
pub fn fit_occupancy_with_control(
    input: &OccupancyInput,
    config: &SamplerConfig,
    control: FitControl<'_, InitialValues>,
) -> Result<(OccupancyModel, OccupancyReport, Vec<OccupancySamples>), OccupancyError> {
    config.validate()?;
    input.validate()?;
    let spatial = match config.spatial {
        Some(spatial_config) => {
            let coordinates = input
                .coordinates
                .as_ref()
                .ok_or(ConfigurationError::MissingCoordinates)?;
            Some(SpatialSetup::build(coordinates, spatial_config, &config.priors)?)
        }
        None => None,
    };
    let layout = ObservationLayout::new(&input.detections);
    let observations = SpeciesObservations::new(&input.detections);
    if let Some(initial) = control.initial_values {
        validate_initial_values(initial, input, &observations, spatial.as_ref())?;
    }

    let model = OccupancyModel {
        n_occupancy_covariates: input.occupancy_design.ncols(),
        n_detection_covariates: input.detection_design.ncols(),
        n_sites: input.n_sites(),
        n_seasons: input.detections.n_seasons(),
        spatial: config.spatial,
        decay_bounds: spatial.as_ref().map(|setup| setup.bounds),
        coordinates: spatial.as_ref().and(input.coordinates.clone()),
    };

    let context = SamplerContext {
        input,
        units: (0..layout.n_units()).collect(),
        layout,
        observations,
        spatial,
        config: *config,
    };
    info!(
        "fitting occupancy model: {} units, {} chains x {} iterations{}",
        context.layout.n_units(),
        config.chains.chains,
        config.schedule.iterations(),
        if context.spatial.is_some() { " (NNGP)" } else { "" }
    );

    let outputs = run_chains(
        config.chains,
        config.schedule.seed,
        |chain, seed| run_chain(&context, chain, seed, control),
    )?;

    let (chains, samples): (Vec<_>, Vec<_>) = outputs
        .into_iter()
        .map(|output| (output.diagnostics, output.samples))
        .unzip();
    let pooled = OccupancySamples::pooled(&samples);
    let pooled_summary = summarize_occupancy(
        &pooled,
        config.spatial.map(|spatial| spatial.covariance_model),
    );
    let convergence = if samples.len() >= 2 {
        convergence_if_estimable(occupancy_convergence(&samples))?
    } else {
        None
    };
    info!("occupancy fit complete: {} retained draws", pooled.len());

    Ok((
        model,
        OccupancyReport {
            chains,
            pooled_summary,
            convergence,
        },
        samples,
    ))
}

/// Drop split-R-hat when the chains are too short for it rather than failing the fit.
pub(crate) fn convergence_if_estimable(
    result: Result<ConvergenceSummary, OccupancyError>,
) -> Result<Option<ConvergenceSummary>, OccupancyError> {
    match result {
        Ok(summary) => Ok(Some(summary)),
        Err(OccupancyError::InsufficientChainDraws { minimum, found }) => {
            warn!("skipping convergence summary: {found} usable draws per chain, need {minimum}");
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

/// Run one closure per chain on scoped threads, returning outputs in chain order.
pub(crate) fn run_chains<T, F>(
    options: ChainOptions,
    base_seed: u64,
    run: F,
) -> Result<Vec<T>, OccupancyError>
where
    T: Send,
    F: Fn(usize, u64) -> Result<T, OccupancyError> + Sync,
{
    let run = &run;
    let results: Vec<Result<T, OccupancyError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..options.chains)
            .map(|chain| {
                let seed = options.chain_seed(base_seed, chain);
                scope.spawn(move || run(chain, seed))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(chain, handle)| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(OccupancyError::ChainPanicked { chain }))
            })
            .collect()
    });
    results.into_iter().collect()
}

/// Whether the shared cancellation flag is set.
pub(crate) fn is_cancelled(cancel: Option<&AtomicBool>) -> bool {
    cancel.is_some_and(|flag| flag.load(Ordering::Relaxed))
}

/// Log a phase change and return the phase of `iteration`.
pub(crate) fn advance_phase(
    chain: usize,
    schedule: BatchSchedule,
    iteration: usize,
    phase: ChainPhase,
) -> ChainPhase {
    let next = ChainPhase::at(schedule, iteration);
    if next != phase {
        info!("chain {chain}: {phase:?} -> {next:?} at iteration {iteration}");
    }
    next
}

fn run_chain(
    context: &SamplerContext<'_>,
    chain: usize,
    seed: u64,
    control: FitControl<'_, InitialValues>,
) -> Result<ChainOutput, OccupancyError> {
    let schedule = context.config.schedule;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut state = context.initial_state(&mut rng, control.initial_values)?;
    let mut workspace = context.workspace();
    let mut samples = OccupancySamples {
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
            .sweep(&mut rng, &mut state, &mut workspace)
            .map_err(|source| {
                warn!("chain {chain}: {source} at iteration {iteration}");
                OccupancyError::ChainFailed {
                    chain,
                    iteration,
                    source,
                }
            })?;

        if schedule.is_batch_end(iteration)
            && let Some(spatial) = state.spatial.as_mut()
        {
            let rate = spatial.field.decay.end_batch(context.config.tuning);
            debug!(
                "chain {chain}: batch {} phi acceptance {rate:.3}, scale {:.4}",
                (iteration + 1) / schedule.batch_length,
                spatial.field.decay.scale
            );
        }

        if schedule.is_retained(iteration) {
            samples.draws.push(context.record(&state));
        }
    }
    advance_phase(chain, schedule, schedule.iterations(), phase);

    let diagnostics = ChainDiagnostics {
        chain,
        seed,
        iterations_completed: schedule.iterations(),
        retained_draws: samples.len(),
        phi_acceptance: state
            .spatial
            .iter()
            .map(|spatial| spatial.field.decay.total.acceptance_rate())
            .collect(),
        phi_proposal_scale: state
            .spatial
            .iter()
            .map(|spatial| spatial.field.decay.scale)
            .collect(),
        phi_last_batch_acceptance: state
            .spatial
            .iter()
            .map(|spatial| spatial.field.decay.last_batch_rate)
            .collect(),
    };
    Ok(ChainOutput {
        samples,
        diagnostics,
    })
}

impl SamplerContext<'_> {
    fn initial_state(
        &self,
        rng: &mut StdRng,
        initial: Option<&InitialValues>,
    ) -> Result<ChainState, OccupancyError> {
        let initial_vector = |values: Option<&Vec<f64>>, len: usize, rng: &mut StdRng| {
            values.cloned().unwrap_or_else(|| {
                (0..len).map(|_| sample_standard_normal(rng)).collect()
            })
        };
        let beta = initial_vector(
            initial.and_then(|values| values.beta.as_ref()),
            self.input.occupancy_design.ncols(),
            rng,
        );
        let alpha = initial_vector(
            initial.and_then(|values| values.alpha.as_ref()),
            self.input.detection_design.ncols(),
            rng,
        );
        let z = initial
            .and_then(|values| values.z.clone())
            .unwrap_or_else(|| self.observations.initial_z(&self.layout));

        let spatial = match &self.spatial {
            Some(setup) => {
                let phi = initial
                    .and_then(|values| values.phi)
                    .unwrap_or_else(|| setup.initial_decay(rng));
                let sigma_sq = initial
                    .and_then(|values| values.sigma_sq)
                    .unwrap_or_else(|| 1.5f64.mul_add(rng.random::<f64>(), 0.5));
                Some(SpatialEffect {
                    field: NngpField::new(setup, phi, self.config.tuning.initial_scale)?,
                    sigma_sq,
                })
            }
            None => None,
        };

        Ok(ChainState {
            beta,
            alpha,
            z,
            occupancy_effects: RandomEffectState::new(&self.input.occupancy_random_effects),
            detection_effects: RandomEffectState::new(&self.input.detection_random_effects),
            spatial,
        })
    }

    fn workspace(&self) -> Workspace {
        let n_units = self.layout.n_units();
        let n_cells = self.layout.n_cells();
        Workspace {
            occupancy_predictor: vec![0.0; n_units],
            detection_predictor: vec![0.0; n_cells],
            occupancy_omega: vec![0.0; n_units],
            occupancy_kappa: vec![0.0; n_units],
            detection_omega: vec![0.0; n_cells],
            detection_kappa: vec![0.0; n_cells],
            active_cells: Vec::with_capacity(self.layout.observed_cells.len()),
        }
    }

    fn occupancy_predictor(&self, state: &ChainState) -> Vec<f64> {
        let mut predictor = linear_predictor(&self.input.occupancy_design, &state.beta);
        let effects = &self.input.occupancy_random_effects;
        for (unit, value) in predictor.iter_mut().enumerate() {
            if !effects.is_empty() {
                *value += state.occupancy_effects.contribution(effects, unit);
            }
            if let (Some(setup), Some(spatial)) = (&self.spatial, &state.spatial) {
                *value += spatial.field.at_site(setup, self.layout.unit_site(unit));
            }
        }
        predictor
    }

    fn detection_predictor(&self, state: &ChainState) -> Vec<f64> {
        let mut predictor = linear_predictor_rows(
            &self.input.detection_design,
            &state.alpha,
            &self.layout.observed_cells,
        );
        let effects = &self.input.detection_random_effects;
        if !effects.is_empty() {
            for &cell in &self.layout.observed_cells {
                predictor[cell] += state
                    .detection_effects
                    .contribution(effects, self.layout.cell_unit[cell]);
            }
        }
        predictor
    }

    /// One full Gibbs iteration: latent states, Polya-Gamma draws, coefficients and
    /// random effects, then the spatial terms.
    fn sweep(
        &self,
        rng: &mut StdRng,
        state: &mut ChainState,
        workspace: &mut Workspace,
    ) -> Result<(), NumericalError> {
        let priors = &self.config.priors;
        workspace.occupancy_predictor = self.occupancy_predictor(state);
        workspace.detection_predictor = self.detection_predictor(state);
        if !workspace.occupancy_predictor.iter().all(|value| value.is_finite())
            || !self
                .layout
                .observed_cells
                .iter()
                .all(|&cell| workspace.detection_predictor[cell].is_finite())
        {
            return Err(NumericalError::NonFiniteLinearPredictor);
        }

        sample_latent_states(
            rng,
            &self.layout,
            &self.observations,
            &workspace.occupancy_predictor,
            &workspace.detection_predictor,
            &mut state.z,
        );

        for unit in 0..self.layout.n_units() {
            workspace.occupancy_omega[unit] =
                sample_polya_gamma(rng, workspace.occupancy_predictor[unit])?;
            workspace.occupancy_kappa[unit] = f64::from(state.z[unit]) - 0.5;
        }
        workspace.active_cells.clear();
        for &cell in &self.layout.observed_cells {
            if state.z[self.layout.cell_unit[cell]] == 1 {
                workspace.detection_omega[cell] =
                    sample_polya_gamma(rng, workspace.detection_predictor[cell])?;
                workspace.detection_kappa[cell] =
                    if self.observations.y[cell] { 0.5 } else { -0.5 };
                workspace.active_cells.push(cell);
            }
        }

        // occupancy coefficients
        let design = &self.input.occupancy_design;
        let offset: Vec<f64> = self
            .units
            .iter()
            .map(|&unit| workspace.occupancy_predictor[unit] - dot_row(design, unit, &state.beta))
            .collect();
        state.beta = sample_augmented_coefficients(
            rng,
            &AugmentedRegression {
                design,
                rows: &self.units,
                omega: &workspace.occupancy_omega,
                kappa: &workspace.occupancy_kappa,
                offset: &offset,
            },
            &NormalPrior::isotropic(design.ncols(), priors.beta_mean, priors.beta_variance),
        )?;
        for &unit in &self.units {
            workspace.occupancy_predictor[unit] = offset[unit] + dot_row(design, unit, &state.beta);
        }
        if !self.input.occupancy_random_effects.is_empty() {
            state.occupancy_effects.update(
                rng,
                &self.input.occupancy_random_effects,
                &AugmentedRows {
                    rows: &self.units,
                    row_unit: &self.units,
                    omega: &workspace.occupancy_omega,
                    kappa: &workspace.occupancy_kappa,
                },
                &mut workspace.occupancy_predictor,
                (priors.random_effect_shape, priors.random_effect_scale),
            )?;
        }

        // detection coefficients, from replicates at occupied units only
        let design = &self.input.detection_design;
        let mut offset = vec![0.0; self.layout.n_cells()];
        for &cell in &workspace.active_cells {
            offset[cell] = workspace.detection_predictor[cell] - dot_row(design, cell, &state.alpha);
        }
        state.alpha = sample_augmented_coefficients(
            rng,
            &AugmentedRegression {
                design,
                rows: &workspace.active_cells,
                omega: &workspace.detection_omega,
                kappa: &workspace.detection_kappa,
                offset: &offset,
            },
            &NormalPrior::isotropic(design.ncols(), priors.alpha_mean, priors.alpha_variance),
        )?;
        for &cell in &workspace.active_cells {
            workspace.detection_predictor[cell] = offset[cell] + dot_row(design, cell, &state.alpha);
        }
        if !self.input.detection_random_effects.is_empty() {
            state.detection_effects.update(
                rng,
                &self.input.detection_random_effects,
                &AugmentedRows {
                    rows: &workspace.active_cells,
                    row_unit: &self.layout.cell_unit,
                    omega: &workspace.detection_omega,
                    kappa: &workspace.detection_kappa,
                },
                &mut workspace.detection_predictor,
                (priors.random_effect_shape, priors.random_effect_scale),
            )?;
        }

        if let (Some(setup), Some(spatial)) = (&self.spatial, state.spatial.as_mut()) {
            let n_seasons = self.layout.n_seasons;
            let omega = &workspace.occupancy_omega;
            let kappa = &workspace.occupancy_kappa;
            let predictor = &workspace.occupancy_predictor;
            spatial
                .field
                .update_values(rng, setup, spatial.sigma_sq, |site, current| {
                    (site * n_seasons..(site + 1) * n_seasons).fold(
                        (0.0, 0.0),
                        |(precision, linear), unit| {
                            let rest = predictor[unit] - current;
                            (
                                precision + omega[unit],
                                linear + omega[unit].mul_add(-rest, kappa[unit]),
                            )
                        },
                    )
                })?;
            spatial.update_variance(rng, setup, priors)?;
            spatial.field.update_decay(rng, setup, spatial.sigma_sq);
        }

        if state.beta.iter().chain(&state.alpha).all(|value| value.is_finite()) {
            Ok(())
        } else {
            Err(NumericalError::NonFiniteState)
        }
    }

    fn record(&self, state: &ChainState) -> OccupancyDraw {
        let psi = self
            .occupancy_predictor(state)
            .into_iter()
            .map(logistic_stable)
            .collect();
        let spatial = self.spatial.as_ref().zip(state.spatial.as_ref());
        OccupancyDraw {
            beta: state.beta.clone(),
            alpha: state.alpha.clone(),
            occupancy_effects: state.occupancy_effects.values.clone(),
            occupancy_effect_variances: state.occupancy_effects.variances.clone(),
            detection_effects: state.detection_effects.values.clone(),
            detection_effect_variances: state.detection_effects.variances.clone(),
            sigma_sq: spatial.map(|(_, effect)| effect.sigma_sq),
            phi: spatial.map(|(_, effect)| effect.field.decay.value),
            w: spatial.map(|(setup, effect)| setup.to_site_order(&effect.field.values)),
            psi,
            z: state.z.clone(),
        }
    }
}

fn validate_initial_values(
    initial: &InitialValues,
    input: &OccupancyInput,
    observations: &SpeciesObservations,
    spatial: Option<&SpatialSetup>,
) -> Result<(), ConfigurationError> {
    let finite_of_len = |values: &[f64], len: usize| {
        values.len() == len && values.iter().all(|value| value.is_finite())
    };
    if let Some(beta) = &initial.beta
        && !finite_of_len(beta, input.occupancy_design.ncols())
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "beta must be finite with one value per occupancy covariate",
        ));
    }
    if let Some(alpha) = &initial.alpha
        && !finite_of_len(alpha, input.detection_design.ncols())
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "alpha must be finite with one value per detection covariate",
        ));
    }
    if let Some(z) = &initial.z {
        let consistent = z.len() == observations.detected.len()
            && z
                .iter()
                .zip(&observations.detected)
                .all(|(&state, &detected)| state <= 1 && (state == 1 || !detected));
        if !consistent {
            return Err(ConfigurationError::InvalidInitialValues(
                "z must be 0/1 per unit and 1 wherever a detection occurred",
            ));
        }
    }
    if let Some(sigma_sq) = initial.sigma_sq
        && !(sigma_sq > 0.0 && sigma_sq.is_finite())
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "sigma_sq must be positive",
        ));
    }
    if let (Some(phi), Some(setup)) = (initial.phi, spatial)
        && !(phi > setup.bounds.0 && phi < setup.bounds.1)
    {
        return Err(ConfigurationError::InvalidInitialValues(
            "phi must lie inside its uniform support",
        ));
    }
    Ok(())
}

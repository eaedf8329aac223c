//! Core public types for the occupancy samplers.

use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::posterior::{CommunityPosteriorSummary, OccupancyPosteriorSummary};
use super::priors::PriorConfig;
use crate::inference::{
    AdaptiveTuning, BatchSchedule, ChainOptions, ConfigurationError, NumericalError,
};
use crate::input::InputError;
use crate::spatial::{SpatialConfig, SpatialError};

/// Errors returned by occupancy configuration, validation, fitting, and assessment.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OccupancyError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Numerical(#[from] NumericalError),
    #[error("chain {chain} failed at iteration {iteration}: {source}")]
    ChainFailed {
        chain: usize,
        iteration: usize,
        source: NumericalError,
    },
    #[error("chain {chain} was cancelled at iteration {iteration}")]
    Cancelled { chain: usize, iteration: usize },
    #[error("chain {chain} worker panicked")]
    ChainPanicked { chain: usize },
    #[error("cross-validation fold {fold} worker panicked")]
    FoldPanicked { fold: usize },
    #[error("posterior draws are required")]
    EmptyPosterior,
    #[error("posterior dimensions differ across draws or chains")]
    InconsistentPosteriorDimensions,
    #[error("at least {min} chains are required; found {found}")]
    InsufficientChains { min: usize, found: usize },
    #[error("each chain must retain at least {minimum} draws; found {found}")]
    InsufficientChainDraws { minimum: usize, found: usize },
    #[error("design columns ({design_cols}) must match coefficient length ({coef_len})")]
    DesignCoefficientMismatch { design_cols: usize, coef_len: usize },
    #[error("spatial models require coordinates for new sites")]
    MissingPredictionCoordinates,
}

impl From<SpatialError> for OccupancyError {
    fn from(error: SpatialError) -> Self {
        match error {
            SpatialError::Input(error) => Self::Input(error),
            SpatialError::Configuration(error) => Self::Configuration(error),
        }
    }
}

/// Full sampler configuration shared by single-species and community fits.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub schedule: BatchSchedule,
    pub chains: ChainOptions,
    pub priors: PriorConfig,
    pub tuning: AdaptiveTuning,
    /// NNGP spatial random effect (single species) or spatial factors (community).
    pub spatial: Option<SpatialConfig>,
    /// Number of spatial factors for community models.
    pub n_factors: usize,
}

impl SamplerConfig {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if any configuration block is invalid.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.schedule.validate()?;
        self.chains.validate()?;
        self.priors.validate()?;
        if !self.tuning.is_valid() {
            return Err(ConfigurationError::InvalidProposalTuning);
        }
        Ok(())
    }

    /// Parse and validate a TOML configuration. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::Parse` for malformed TOML and other variants for
    /// invalid values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigurationError> {
        let config: Self =
            toml::from_str(source).map_err(|error| ConfigurationError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Optional starting values for a single-species chain.
///
/// Unset values are drawn or derived at initialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialValues {
    pub beta: Option<Vec<f64>>,
    pub alpha: Option<Vec<f64>>,
    pub z: Option<Vec<u8>>,
    pub sigma_sq: Option<f64>,
    pub phi: Option<f64>,
}

/// Optional starting values for a community chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommunityInitialValues {
    pub beta_mean: Option<Vec<f64>>,
    pub alpha_mean: Option<Vec<f64>>,
    pub phi: Option<Vec<f64>>,
}

/// Per-fit controls that are not part of the serializable configuration.
#[derive(Debug)]
pub struct FitControl<'a, I> {
    pub initial_values: Option<&'a I>,
    /// Checked between iterations; when set, every running chain stops.
    pub cancel: Option<&'a AtomicBool>,
}

impl<I> Default for FitControl<'_, I> {
    fn default() -> Self {
        Self {
            initial_values: None,
            cancel: None,
        }
    }
}

impl<I> Clone for FitControl<'_, I> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I> Copy for FitControl<'_, I> {}

/// Per-chain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainPhase {
    Initializing,
    BurnIn,
    Retained,
    Done,
}

impl ChainPhase {
    /// Phase of the zero-based iteration `iter`.
    #[must_use]
    pub const fn at(schedule: BatchSchedule, iter: usize) -> Self {
        if iter >= schedule.iterations() {
            Self::Done
        } else if iter < schedule.n_burn {
            Self::BurnIn
        } else {
            Self::Retained
        }
    }
}

/// Fitted single-species model metadata.
#[derive(Debug, Clone)]
pub struct OccupancyModel {
    pub n_occupancy_covariates: usize,
    pub n_detection_covariates: usize,
    pub n_sites: usize,
    pub n_seasons: usize,
    pub spatial: Option<SpatialConfig>,
    /// Uniform support of the decay parameter, when spatial.
    pub decay_bounds: Option<(f64, f64)>,
    /// Training coordinates, when spatial.
    pub coordinates: Option<faer::Mat<f64>>,
}

/// Fitted community model metadata.
#[derive(Debug, Clone)]
pub struct CommunityModel {
    pub n_species: usize,
    pub n_occupancy_covariates: usize,
    pub n_detection_covariates: usize,
    pub n_sites: usize,
    pub n_seasons: usize,
    pub n_factors: usize,
    pub spatial: Option<SpatialConfig>,
    pub decay_bounds: Option<(f64, f64)>,
    pub coordinates: Option<faer::Mat<f64>>,
}

/// Sampler diagnostics for one chain.
#[derive(Debug, Clone, Default)]
pub struct ChainDiagnostics {
    pub chain: usize,
    pub seed: u64,
    pub iterations_completed: usize,
    pub retained_draws: usize,
    /// Overall acceptance rate of each decay parameter.
    pub phi_acceptance: Vec<f64>,
    /// Proposal scale of each decay parameter at the end of the run.
    pub phi_proposal_scale: Vec<f64>,
    /// Acceptance rate of each decay parameter over the final batch.
    pub phi_last_batch_acceptance: Vec<f64>,
}

/// Split-R-hat and effective sample size for one scalar parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterConvergence {
    pub name: String,
    pub split_rhat: f64,
    pub effective_sample_size: f64,
}

/// Multi-chain convergence diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ConvergenceSummary {
    pub chain_count: usize,
    /// Draws per chain used after truncation to an equal even length.
    pub draws_per_chain_used: usize,
    pub parameters: Vec<ParameterConvergence>,
    pub max_split_rhat: Option<f64>,
}

impl ConvergenceSummary {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ParameterConvergence> {
        self.parameters.iter().find(|parameter| parameter.name == name)
    }
}

/// Output report from single-species fitting.
#[derive(Debug, Clone)]
pub struct OccupancyReport {
    pub chains: Vec<ChainDiagnostics>,
    pub pooled_summary: OccupancyPosteriorSummary,
    /// Present when at least two chains were run.
    pub convergence: Option<ConvergenceSummary>,
}

/// Output report from community fitting.
#[derive(Debug, Clone)]
pub struct CommunityReport {
    pub chains: Vec<ChainDiagnostics>,
    pub pooled_summary: CommunityPosteriorSummary,
    pub convergence: Option<ConvergenceSummary>,
}

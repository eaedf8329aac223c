#![forbid(unsafe_code)]

//! # `spatial_occupancy`
//!
//! Markov chain Monte Carlo samplers for hierarchical site-occupancy models: latent
//! presence `z`, imperfect detection `p`, Polya-Gamma augmented logit links, optional
//! unstructured random intercepts, and an optional Nearest-Neighbor Gaussian Process
//! spatial random effect. Community models share coefficient priors across species and
//! may add NNGP spatial factors.
//!
//! Fits return per-chain posterior draws; WAIC, posterior predictive checks, k-fold
//! cross-validation, split-R-hat and prediction at new sites work from those draws.

pub mod inference;
pub mod input;
pub mod models;
pub mod simulate;
pub mod spatial;
pub mod utils;

pub use inference::{
    AdaptiveScale, AdaptiveTuning, BatchSchedule, ChainOptions, ConfigurationError,
    NumericalError, ProposalStats,
};
pub use input::{
    CommunityInput, CovariateDesign, DetectionArray, DetectionCovariate, InputError,
    OccupancyCovariate, OccupancyInput, RandomIntercept,
};
pub use spatial::{CovarianceModel, NeighborIndex, SpatialConfig, SpatialError};
pub mod matrix_ops {
    pub use crate::models::matrix_ops::*;
}

pub use models::occupancy::{
    ChainDiagnostics, ChainPhase, CommunityDraw, CommunityInitialValues, CommunityModel,
    CommunityPosteriorSummary, CommunityPrediction, CommunityReport, CommunitySamples,
    ConvergenceSummary, FitControl, FitStatistic, InitialValues, LoadingsMask, NewSites,
    OccupancyDraw, OccupancyError, OccupancyModel, OccupancyPosteriorSummary,
    OccupancyPrediction, OccupancyReport, OccupancySamples, ParameterConvergence,
    ParameterSummary, PosteriorPredictiveCheck, PpcGrouping, PriorConfig, SamplerConfig,
    autocorrelation, community_convergence, community_posterior_predictive_check,
    effective_sample_size, fit_community, fit_community_with_control, fit_occupancy,
    fit_occupancy_with_control, occupancy_convergence, posterior_predictive_check,
    predict_community, predict_occupancy, split_rhat, summarize_community, summarize_occupancy,
};

pub use models::selection::{
    CrossValidationOptions, CrossValidationResult, WaicSummary, community_in_sample_deviance,
    community_waic, cross_validate_community, cross_validate_occupancy, in_sample_deviance,
    site_folds, waic,
};

pub use simulate::{
    CommunitySimulation, OccupancySimulation, RandomEffectTruth, SimulatedCommunity,
    SimulatedOccupancy, SpatialTruth, simulate_community, simulate_occupancy,
};

//! Hierarchical site-occupancy models fitted by Polya-Gamma augmented Gibbs sampling.
//!
//! Single-species models carry optional unstructured random intercepts and an optional
//! NNGP spatial random effect. Community models share coefficient priors across species
//! and may add NNGP spatial factors with constrained loadings.

pub mod community;
pub mod conjugate;
pub mod diagnostics;
pub(crate) mod input;
pub mod latent;
pub mod likelihood;
pub mod polya_gamma;
pub mod posterior;
pub mod prediction;
pub mod priors;
mod random_effects;
pub mod sampler;
pub mod spatial;
pub mod types;

pub use community::{fit_community, fit_community_with_control};
pub use diagnostics::{
    FitStatistic, PosteriorPredictiveCheck, PpcGrouping, autocorrelation,
    community_convergence, community_posterior_predictive_check, effective_sample_size,
    occupancy_convergence, posterior_predictive_check, split_rhat,
};
pub use posterior::{
    CommunityDraw, CommunityPosteriorSummary, CommunitySamples, OccupancyDraw,
    OccupancyPosteriorSummary, OccupancySamples, ParameterSummary, summarize_community,
    summarize_occupancy,
};
pub use prediction::{
    CommunityPrediction, NewSites, OccupancyPrediction, predict_community, predict_occupancy,
};
pub use priors::PriorConfig;
pub use sampler::{fit_occupancy, fit_occupancy_with_control};
pub use spatial::LoadingsMask;
pub use types::{
    ChainDiagnostics, ChainPhase, CommunityInitialValues, CommunityModel, CommunityReport,
    ConvergenceSummary, FitControl, InitialValues, OccupancyError, OccupancyModel,
    OccupancyReport, ParameterConvergence, SamplerConfig,
};

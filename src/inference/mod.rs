//! Reusable MCMC schedule, adaptation, and error types.
//!
//! The samplers run `n_batch` batches of `batch_length` iterations. Non-conjugate
//! parameters carry an [`AdaptiveScale`] whose random-walk proposal scale is tuned at
//! every batch boundary with [`AdaptiveTuning::tune`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::utils::usize_to_f64;

/// Errors for sampler configuration, raised before any chain state is created.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("batch count must be positive")]
    InvalidBatchCount,
    #[error("batch length must be positive")]
    InvalidBatchLength,
    #[error("thinning interval must be positive")]
    InvalidThinning,
    #[error("burn-in ({burn_in}) must be smaller than total iterations ({iterations})")]
    InvalidBurnIn { burn_in: usize, iterations: usize },
    #[error("schedule retains no draws: ({iterations} - {burn_in}) / {thin} rounds down to 0")]
    NoRetainedDraws {
        iterations: usize,
        burn_in: usize,
        thin: usize,
    },
    #[error("chain count must be positive")]
    InvalidChainCount,
    #[error("chain seed stride must be positive")]
    InvalidSeedStride,
    #[error("neighbor count ({neighbors}) must be in 1..{sites}")]
    InvalidNeighborCount { neighbors: usize, sites: usize },
    #[error("fold count ({folds}) must be at least 2 and smaller than the site count ({sites})")]
    InvalidFoldCount { folds: usize, sites: usize },
    #[error("factor count ({factors}) must be in 1..={species}")]
    InvalidFactorCount { factors: usize, species: usize },
    #[error("spatial models require site coordinates")]
    MissingCoordinates,
    #[error("invalid prior configuration: {0}")]
    InvalidPrior(&'static str),
    #[error("invalid proposal tuning configuration")]
    InvalidProposalTuning,
    #[error("invalid initial values: {0}")]
    InvalidInitialValues(&'static str),
    #[error("could not parse sampler configuration: {0}")]
    Parse(String),
}

/// Numerical failures raised while a chain is sampling.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NumericalError {
    #[error("linear predictor is not finite")]
    NonFiniteLinearPredictor,
    #[error("conjugate update precision matrix is not positive definite")]
    SingularPrecision,
    #[error("Polya-Gamma draw is degenerate")]
    DegeneratePolyaGamma,
    #[error("sampler state is not finite")]
    NonFiniteState,
}

/// Batch schedule for one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSchedule {
    pub n_batch: usize,
    pub batch_length: usize,
    pub n_burn: usize,
    pub n_thin: usize,
    pub seed: u64,
}

impl Default for BatchSchedule {
    fn default() -> Self {
        Self {
            n_batch: 400,
            batch_length: 25,
            n_burn: 5_000,
            n_thin: 5,
            seed: 42,
        }
    }
}

impl BatchSchedule {
    /// Total iterations `n_batch * batch_length`.
    #[must_use]
    pub const fn iterations(self) -> usize {
        self.n_batch.saturating_mul(self.batch_length)
    }

    /// # Errors
    ///
    /// Returns `ConfigurationError` if schedule values are invalid or retain no draws.
    pub const fn validate(self) -> Result<(), ConfigurationError> {
        if self.n_batch == 0 {
            return Err(ConfigurationError::InvalidBatchCount);
        }
        if self.batch_length == 0 {
            return Err(ConfigurationError::InvalidBatchLength);
        }
        if self.n_thin == 0 {
            return Err(ConfigurationError::InvalidThinning);
        }
        let iterations = self.iterations();
        if self.n_burn >= iterations {
            return Err(ConfigurationError::InvalidBurnIn {
                burn_in: self.n_burn,
                iterations,
            });
        }
        if self.retained_draws() == 0 {
            return Err(ConfigurationError::NoRetainedDraws {
                iterations,
                burn_in: self.n_burn,
                thin: self.n_thin,
            });
        }
        Ok(())
    }

    /// Number of retained draws, `floor((n_batch * batch_length - n_burn) / n_thin)`.
    #[must_use]
    pub const fn retained_draws(self) -> usize {
        self.iterations().saturating_sub(self.n_burn) / self.n_thin
    }

    /// Whether the zero-based iteration `iter` is stored.
    ///
    /// Keeps every `n_thin`-th post-burn-in iteration, counting from the first
    /// post-burn-in iteration as 1.
    #[must_use]
    pub const fn is_retained(self, iter: usize) -> bool {
        iter >= self.n_burn && (iter - self.n_burn + 1).is_multiple_of(self.n_thin)
    }

    /// Whether `iter` closes a batch.
    #[must_use]
    pub const fn is_batch_end(self, iter: usize) -> bool {
        (iter + 1).is_multiple_of(self.batch_length)
    }
}

/// Multi-chain execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainOptions {
    /// Number of independent chains.
    pub chains: usize,
    /// Chain `i` uses `seed + i * seed_stride` with wrapping arithmetic.
    pub seed_stride: u64,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            chains: 3,
            seed_stride: 10_000,
        }
    }
}

impl ChainOptions {
    /// # Errors
    ///
    /// Returns `ConfigurationError` if chain options are invalid.
    pub const fn validate(self) -> Result<(), ConfigurationError> {
        if self.chains == 0 {
            return Err(ConfigurationError::InvalidChainCount);
        }
        if self.seed_stride == 0 {
            return Err(ConfigurationError::InvalidSeedStride);
        }
        Ok(())
    }

    #[must_use]
    pub fn chain_seed(self, base_seed: u64, chain_index: usize) -> u64 {
        let index_u64 = u64::try_from(chain_index).unwrap_or(u64::MAX);
        base_seed.wrapping_add(index_u64.wrapping_mul(self.seed_stride))
    }
}

/// Proposal counters for a single Metropolis-Hastings block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProposalStats {
    pub proposed: usize,
    pub accepted: usize,
}

impl ProposalStats {
    /// Record one proposal and whether it was accepted.
    pub const fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Acceptance rate in `[0, 1]`, or `0` if no proposals were made.
    #[must_use]
    pub fn acceptance_rate(self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            usize_to_f64(self.accepted) / usize_to_f64(self.proposed)
        }
    }
}

/// Batch-adaptation controls for random-walk Metropolis proposals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveTuning {
    /// Initial proposal standard deviation (on the transformed scale).
    pub initial_scale: f64,
    /// Lower edge of the target acceptance band.
    pub acceptance_target_low: f64,
    /// Upper edge of the target acceptance band.
    pub acceptance_target_high: f64,
    /// Log-scale step applied when a batch falls outside the band.
    pub log_adjustment: f64,
    /// Proposal scales never shrink below this value.
    pub min_scale: f64,
    /// Proposal scales never grow beyond this value.
    pub max_scale: f64,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            initial_scale: 1.0,
            acceptance_target_low: 0.40,
            acceptance_target_high: 0.46,
            log_adjustment: 0.01,
            min_scale: 1.0e-4,
            max_scale: 1.0e4,
        }
    }
}

impl AdaptiveTuning {
    /// Whether the tuning settings are numerically valid.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.initial_scale > 0.0
            && self.acceptance_target_low > 0.0
            && self.acceptance_target_high < 1.0
            && self.acceptance_target_low <= self.acceptance_target_high
            && self.log_adjustment > 0.0
            && self.min_scale > 0.0
            && self.min_scale < self.max_scale
            && (self.min_scale..=self.max_scale).contains(&self.initial_scale)
    }

    /// New proposal scale after a batch with the given acceptance rate.
    ///
    /// Above the band the scale grows by `exp(log_adjustment)`, below it shrinks by the
    /// same factor; inside the band it is unchanged.
    #[must_use]
    pub fn tune(self, scale: f64, acceptance_rate: f64) -> f64 {
        let factor = if acceptance_rate > self.acceptance_target_high {
            self.log_adjustment.exp()
        } else if acceptance_rate < self.acceptance_target_low {
            (-self.log_adjustment).exp()
        } else {
            1.0
        };
        (scale * factor).clamp(self.min_scale, self.max_scale)
    }
}

/// Adaptive state for one non-conjugate scalar parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveScale {
    /// Current parameter value.
    pub value: f64,
    /// Current proposal standard deviation.
    pub scale: f64,
    /// Counters for the batch in progress.
    pub batch: ProposalStats,
    /// Counters across the whole run.
    pub total: ProposalStats,
    /// Acceptance rate of the last completed batch.
    pub last_batch_rate: f64,
}

impl AdaptiveScale {
    #[must_use]
    pub const fn new(value: f64, scale: f64) -> Self {
        Self {
            value,
            scale,
            batch: ProposalStats {
                proposed: 0,
                accepted: 0,
            },
            total: ProposalStats {
                proposed: 0,
                accepted: 0,
            },
            last_batch_rate: 0.0,
        }
    }

    /// Record one Metropolis decision, storing `candidate` if it was accepted.
    pub const fn record(&mut self, candidate: f64, accepted: bool) {
        self.batch.record(accepted);
        self.total.record(accepted);
        if accepted {
            self.value = candidate;
        }
    }

    /// Close the current batch: retune the scale and reset the batch counters.
    pub fn end_batch(&mut self, tuning: AdaptiveTuning) -> f64 {
        let rate = self.batch.acceptance_rate();
        self.scale = tuning.tune(self.scale, rate);
        self.last_batch_rate = rate;
        self.batch = ProposalStats::default();
        rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{RngExt, SeedableRng};

    #[test]
    fn schedule_retained_draws_rounds_down() {
        let schedule = BatchSchedule {
            n_batch: 10,
            batch_length: 10,
            n_burn: 13,
            n_thin: 4,
            seed: 1,
        };
        assert!(schedule.validate().is_ok());
        assert_eq!(schedule.retained_draws(), 21);
        let kept = (0..schedule.iterations())
            .filter(|&iter| schedule.is_retained(iter))
            .count();
        assert_eq!(kept, 21);
    }

    #[test]
    fn schedule_rejects_runs_without_retained_draws() {
        let schedule = BatchSchedule {
            n_batch: 200,
            batch_length: 25,
            n_burn: 5_000,
            n_thin: 5,
            seed: 1,
        };
        assert!(matches!(
            schedule.validate(),
            Err(ConfigurationError::InvalidBurnIn { .. })
        ));

        let short = BatchSchedule {
            n_batch: 1,
            batch_length: 10,
            n_burn: 8,
            n_thin: 5,
            seed: 1,
        };
        assert!(matches!(
            short.validate(),
            Err(ConfigurationError::NoRetainedDraws { .. })
        ));
    }

    #[test]
    fn schedule_rejects_zero_thinning() {
        let schedule = BatchSchedule {
            n_thin: 0,
            ..BatchSchedule::default()
        };
        assert_eq!(schedule.validate(), Err(ConfigurationError::InvalidThinning));
    }

    #[test]
    fn default_schedule_keeps_one_thousand_draws() {
        assert_eq!(BatchSchedule::default().retained_draws(), 1_000);
    }

    #[test]
    fn chain_seeds_are_distinct() {
        let options = ChainOptions::default();
        assert_ne!(options.chain_seed(5, 0), options.chain_seed(5, 1));
        assert_eq!(options.chain_seed(5, 0), 5);
    }

    #[test]
    fn proposal_stats_tracks_acceptance() {
        let mut stats = ProposalStats::default();
        stats.record(true);
        stats.record(false);
        assert!((stats.acceptance_rate() - 0.5).abs() < 1.0e-12);
    }

    #[test]
    fn tune_moves_scale_towards_band() {
        let tuning = AdaptiveTuning::default();
        assert!(tuning.tune(1.0, 0.9) > 1.0);
        assert!(tuning.tune(1.0, 0.05) < 1.0);
        assert!((tuning.tune(1.0, 0.43) - 1.0).abs() < f64::EPSILON);
        assert!((tuning.tune(tuning.max_scale, 1.0) - tuning.max_scale).abs() < f64::EPSILON);
    }

    #[test]
    fn adaptive_scale_recovers_from_mistuned_start() {
        // Random-walk Metropolis on a standard normal target with a proposal scale
        // two orders of magnitude too large.
        let tuning = AdaptiveTuning::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut state = AdaptiveScale::new(0.0, 200.0);
        let mut late_rates = Vec::new();
        for batch in 0..1_500 {
            for _ in 0..25 {
                let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
                let u2 = rng.random::<f64>();
                let noise = (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
                let candidate = state.scale.mul_add(noise, state.value);
                let log_ratio = 0.5 * (state.value * state.value - candidate * candidate);
                let accepted = log_ratio >= 0.0 || rng.random::<f64>().ln() < log_ratio;
                state.record(candidate, accepted);
            }
            let rate = state.end_batch(tuning);
            if batch >= 1_100 {
                late_rates.push(rate);
            }
        }
        let late_mean = late_rates.iter().sum::<f64>() / usize_to_f64(late_rates.len());
        assert!(state.scale < 200.0);
        assert!((0.3..=0.5).contains(&late_mean), "late acceptance {late_mean}");
    }

    #[test]
    fn tuning_defaults_are_valid() {
        assert!(AdaptiveTuning::default().is_valid());
        let invalid = AdaptiveTuning {
            acceptance_target_low: 0.6,
            acceptance_target_high: 0.4,
            ..AdaptiveTuning::default()
        };
        assert!(!invalid.is_valid());
    }
}

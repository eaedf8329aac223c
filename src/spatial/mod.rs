/////////////////////////////////////////////////////////////////////////////////////////////
//
// Nearest-neighbor Gaussian process building blocks shared by the occupancy samplers.
//
/////////////////////////////////////////////////////////////////////////////////////////////

//! # Spatial structure
//!
//! Covariance kernels, the ordered neighbor index, and the sparse NNGP conditional
//! factors used by the spatial random-effect and spatial factor samplers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inference::ConfigurationError;
use crate::input::InputError;

pub mod kernel;
pub mod neighbors;
pub mod nngp;

pub use kernel::CovarianceModel;
pub use neighbors::{NeighborIndex, distance_extremes};
pub use nngp::{KrigingWeights, NngpFactors, kriging_weights};

/// Errors raised while building spatial structures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SpatialError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// Spatial random-effect configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    /// Number of NNGP neighbors `m`.
    pub neighbors: usize,
    pub covariance_model: CovarianceModel,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            neighbors: 15,
            covariance_model: CovarianceModel::Exponential,
        }
    }
}

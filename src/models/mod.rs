//! # Models
//!
//! Single-species and community occupancy samplers, and the selection workflow
//! (WAIC, in-sample deviance, k-fold cross-validation) that compares candidate fits.

pub mod matrix_ops;
pub mod occupancy;
pub mod selection;

//! Likelihood and numerical-stability helpers for occupancy models.

use faer::Mat;

use super::input::ObservationLayout;
use crate::input::RandomIntercept;
use crate::models::matrix_ops::dot_row;

const EPS_PROBABILITY: f64 = 1.0e-12;

/// Stable logistic transform.
#[must_use]
pub fn logistic_stable(value: f64) -> f64 {
    if value >= 0.0 {
        let z = (-value).exp();
        1.0 / (1.0 + z)
    } else {
        let z = value.exp();
        z / (1.0 + z)
    }
}

/// Bound probability away from exact 0 and 1.
#[must_use]
pub fn clamp_probability(probability: f64) -> f64 {
    probability.clamp(EPS_PROBABILITY, 1.0 - EPS_PROBABILITY)
}

/// Likelihood of one occupancy unit with the latent state summed out.
///
/// `detections` pairs each observed replicate's outcome with its detection probability.
/// Any detection gives `ψ ∏ p^y (1-p)^(1-y)`; none gives `ψ ∏ (1-p) + 1 - ψ`.
#[must_use]
pub fn unit_log_likelihood(psi: f64, detections: impl Iterator<Item = (bool, f64)>) -> f64 {
    let psi = clamp_probability(psi);
    let mut any_detected = false;
    let mut log_detection = 0.0;
    for (detected, probability) in detections {
        let p = clamp_probability(probability);
        if detected {
            any_detected = true;
            log_detection += p.ln();
        } else {
            log_detection += (-p).ln_1p();
        }
    }
    if any_detected {
        psi.ln() + log_detection
    } else {
        (psi * log_detection.exp() + (1.0 - psi)).ln()
    }
}

/// Detection probability of every observed cell for one draw; zero at missing cells.
pub(crate) fn detection_probabilities(
    layout: &ObservationLayout,
    design: &Mat<f64>,
    alpha: &[f64],
    random_effects: &[RandomIntercept],
    effect_values: &[Vec<f64>],
) -> Vec<f64> {
    let mut probabilities = vec![0.0; layout.n_cells()];
    for &cell in &layout.observed_cells {
        let unit = layout.cell_unit[cell];
        let effects: f64 = random_effects
            .iter()
            .zip(effect_values)
            .map(|(effect, values)| values.get(effect.levels[unit]).copied().unwrap_or(0.0))
            .sum();
        probabilities[cell] = logistic_stable(dot_row(design, cell, alpha) + effects);
    }
    probabilities
}

/// Marginal log-likelihood of every occupancy unit for one draw.
pub(crate) fn unit_log_likelihoods(
    layout: &ObservationLayout,
    y: &[bool],
    psi: &[f64],
    detection: &[f64],
) -> Vec<f64> {
    layout
        .unit_cells
        .iter()
        .zip(psi)
        .map(|(cells, &psi)| {
            unit_log_likelihood(psi, cells.iter().map(|&cell| (y[cell], detection[cell])))
        })
        .collect()
}

//! Latent occupancy state full conditional.

use rand::RngExt;
use rand::rngs::StdRng;

use super::input::{ObservationLayout, SpeciesObservations};
use super::likelihood::logistic_stable;

/// `P(z = 1 | no detection)` given `ψ` and the detection probabilities of the observed
/// replicates. With no observed replicate this is `ψ`.
#[must_use]
pub fn occupied_probability(psi: f64, detection_probabilities: impl Iterator<Item = f64>) -> f64 {
    let missed: f64 = detection_probabilities.map(|p| 1.0 - p).product();
    let occupied = psi * missed;
    let denominator = occupied + (1.0 - psi);
    if denominator > 0.0 {
        occupied / denominator
    } else {
        1.0
    }
}

/// Redraw `z` for every unit; detected units are fixed at 1.
pub(crate) fn sample_latent_states(
    rng: &mut StdRng,
    layout: &ObservationLayout,
    observations: &SpeciesObservations,
    occupancy_predictor: &[f64],
    detection_predictor: &[f64],
    z: &mut [u8],
) {
    for (unit, state) in z.iter_mut().enumerate() {
        if observations.detected[unit] {
            *state = 1;
            continue;
        }
        let psi = logistic_stable(occupancy_predictor[unit]);
        let probability = occupied_probability(
            psi,
            layout.unit_cells[unit]
                .iter()
                .map(|&cell| logistic_stable(detection_predictor[cell])),
        );
        *state = u8::from(rng.random::<f64>() < probability);
    }
}

//! Unstructured random intercepts with Inverse-Gamma variances.

use rand::rngs::StdRng;

use super::conjugate::{sample_inverse_gamma, sample_scalar_conjugate};
use crate::inference::NumericalError;
use crate::input::RandomIntercept;

/// Current level values and variances for a set of grouping factors.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RandomEffectState {
    pub values: Vec<Vec<f64>>,
    pub variances: Vec<f64>,
}

/// Polya-Gamma quantities for the rows an update is allowed to use.
pub(crate) struct AugmentedRows<'a> {
    pub rows: &'a [usize],
    /// Occupancy unit of each row, used to look up the row's level.
    pub row_unit: &'a [usize],
    pub omega: &'a [f64],
    pub kappa: &'a [f64],
}

impl RandomEffectState {
    pub(crate) fn new(effects: &[RandomIntercept]) -> Self {
        Self {
            values: effects
                .iter()
                .map(|effect| vec![0.0; effect.n_levels])
                .collect(),
            variances: vec![1.0; effects.len()],
        }
    }

    /// Sum of every effect at `unit`.
    pub(crate) fn contribution(&self, effects: &[RandomIntercept], unit: usize) -> f64 {
        effects
            .iter()
            .zip(&self.values)
            .map(|(effect, values)| values[effect.levels[unit]])
            .sum()
    }

    /// Gibbs update of every level and variance.
    ///
    /// `predictor` holds the full linear predictor per row and is kept in sync with the
    /// new level values. Levels without rows are drawn from their prior.
    pub(crate) fn update(
        &mut self,
        rng: &mut StdRng,
        effects: &[RandomIntercept],
        data: &AugmentedRows<'_>,
        predictor: &mut [f64],
        (shape, scale): (f64, f64),
    ) -> Result<(), NumericalError> {
        for (index, effect) in effects.iter().enumerate() {
            let variance = self.variances[index];
            let mut precision = vec![variance.recip(); effect.n_levels];
            let mut linear = vec![0.0; effect.n_levels];
            for &row in data.rows {
                let level = effect.levels[data.row_unit[row]];
                let omega = data.omega[row];
                let offset = predictor[row] - self.values[index][level];
                precision[level] += omega;
                linear[level] += omega.mul_add(-offset, data.kappa[row]);
            }

            let previous = self.values[index].clone();
            for level in 0..effect.n_levels {
                self.values[index][level] =
                    sample_scalar_conjugate(rng, precision[level], linear[level])?;
            }
            for &row in data.rows {
                let level = effect.levels[data.row_unit[row]];
                predictor[row] += self.values[index][level] - previous[level];
            }

            let sum_sq: f64 = self.values[index].iter().map(|value| value * value).sum();
            let levels = crate::utils::usize_to_f64(effect.n_levels);
            let draw = sample_inverse_gamma(rng, 0.5f64.mul_add(levels, shape), 0.5f64.mul_add(sum_sq, scale));
            if !(draw.is_finite() && draw > 0.0) {
                return Err(NumericalError::NonFiniteState);
            }
            self.variances[index] = draw;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn contribution_sums_levels() {
        let effects = vec![
            RandomIntercept::new("year", vec![0, 1, 1]),
            RandomIntercept::new("observer", vec![2, 0, 1]),
        ];
        let mut state = RandomEffectState::new(&effects);
        state.values[0] = vec![1.0, -1.0];
        state.values[1] = vec![0.5, 0.25, 2.0];
        assert!((state.contribution(&effects, 0) - 3.0).abs() < 1.0e-12);
        assert!((state.contribution(&effects, 2) + 0.75).abs() < 1.0e-12);
    }

    #[test]
    fn update_keeps_predictor_in_sync() {
        let effects = vec![RandomIntercept::new("block", vec![0, 0, 1, 1, 2])];
        let mut state = RandomEffectState::new(&effects);
        let rows: Vec<usize> = (0..4).collect();
        let row_unit: Vec<usize> = (0..5).collect();
        let omega = vec![0.25; 5];
        let kappa = vec![0.5, 0.5, -0.5, -0.5, 0.0];
        let mut predictor = vec![0.3; 5];
        let mut rng = StdRng::seed_from_u64(8);
        state
            .update(
                &mut rng,
                &effects,
                &AugmentedRows {
                    rows: &rows,
                    row_unit: &row_unit,
                    omega: &omega,
                    kappa: &kappa,
                },
                &mut predictor,
                (0.1, 0.1),
            )
            .expect("valid update");
        for &row in &rows {
            let expected = 0.3 + state.values[0][effects[0].levels[row]];
            assert!((predictor[row] - expected).abs() < 1.0e-12);
        }
        // unit 4 is not an update row, so its predictor is untouched
        assert!((predictor[4] - 0.3).abs() < 1.0e-12);
        assert!(state.variances[0] > 0.0);
    }
}

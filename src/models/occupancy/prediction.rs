//! Posterior prediction of occupancy at new sites.

use faer::Mat;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::input::{InputError, RandomIntercept, validate_coordinates};
use crate::models::matrix_ops::dot_row;
use crate::spatial::{CovarianceModel, KrigingWeights, NeighborIndex, kriging_weights};
use crate::utils::mean;

use super::conjugate::sample_standard_normal;
use super::likelihood::logistic_stable;
use super::posterior::{CommunitySamples, OccupancySamples};
use super::types::{CommunityModel, OccupancyError, OccupancyModel};

/// Covariates and locations of sites to predict at.
#[derive(Debug, Clone)]
pub struct NewSites {
    /// One row per `(site, season)` unit, site-major.
    pub occupancy_design: Mat<f64>,
    pub n_seasons: usize,
    /// `n_new_sites x 2`; required for spatial models.
    pub coordinates: Option<Mat<f64>>,
    /// Levels per new unit, indexed into the fitted effect levels.
    ///
    /// Levels the fit never saw are drawn from their prior.
    pub occupancy_random_effects: Vec<RandomIntercept>,
}

impl NewSites {
    #[must_use]
    pub const fn new(occupancy_design: Mat<f64>, n_seasons: usize) -> Self {
        Self {
            occupancy_design,
            n_seasons,
            coordinates: None,
            occupancy_random_effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_coordinates(mut self, coordinates: Mat<f64>) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    #[must_use]
    pub fn with_occupancy_random_effect(mut self, effect: RandomIntercept) -> Self {
        self.occupancy_random_effects.push(effect);
        self
    }

    #[must_use]
    pub fn n_units(&self) -> usize {
        self.occupancy_design.nrows()
    }

    #[must_use]
    pub fn n_sites(&self) -> usize {
        self.n_units() / self.n_seasons.max(1)
    }

    fn validate(&self, n_covariates: usize, spatial: bool) -> Result<(), OccupancyError> {
        if self.occupancy_design.ncols() != n_covariates {
            return Err(OccupancyError::DesignCoefficientMismatch {
                design_cols: self.occupancy_design.ncols(),
                coef_len: n_covariates,
            });
        }
        if self.n_seasons == 0 || self.n_units() == 0 || self.n_units() % self.n_seasons != 0 {
            return Err(InputError::DesignRows {
                design: "occupancy",
                rows: self.n_units(),
                expected: self.n_sites() * self.n_seasons,
            }
            .into());
        }
        for effect in &self.occupancy_random_effects {
            if effect.levels.len() != self.n_units() {
                return Err(InputError::RandomEffectLength {
                    name: effect.name.clone(),
                    len: effect.levels.len(),
                    expected: self.n_units(),
                }
                .into());
            }
        }
        match (&self.coordinates, spatial) {
            (Some(coordinates), true) => {
                validate_coordinates(coordinates, self.n_sites())?;
                Ok(())
            }
            (None, true) => Err(OccupancyError::MissingPredictionCoordinates),
            (_, false) => Ok(()),
        }
    }

    fn point(&self, site: usize) -> Option<[f64; 2]> {
        self.coordinates
            .as_ref()
            .map(|coordinates| [coordinates[(site, 0)], coordinates[(site, 1)]])
    }
}

/// Posterior draws of occupancy at new sites.
#[derive(Debug, Clone, Default)]
pub struct OccupancyPrediction {
    /// `psi[draw][unit]`.
    pub psi: Vec<Vec<f64>>,
    /// Kriged spatial effect, `w[draw][site]`; empty for non-spatial models.
    pub w: Vec<Vec<f64>>,
    /// Posterior mean of `psi` per unit.
    pub psi_mean: Vec<f64>,
}

/// Posterior draws of community occupancy at new sites.
#[derive(Debug, Clone, Default)]
pub struct CommunityPrediction {
    /// `psi[draw][species][unit]`.
    pub psi: Vec<Vec<Vec<f64>>>,
    /// Kriged factor fields, `factors[draw][factor][site]`.
    pub factors: Vec<Vec<Vec<f64>>>,
    /// Posterior mean of `psi` per species and unit.
    pub psi_mean: Vec<Vec<f64>>,
}

/// Neighbor index over the training sites, rebuilt from the fitted model.
struct Kriging {
    index: NeighborIndex,
    model: CovarianceModel,
    neighbors: usize,
}

impl Kriging {
    fn from_parts(
        coordinates: Option<&Mat<f64>>,
        spatial: Option<crate::spatial::SpatialConfig>,
    ) -> Result<Option<Self>, OccupancyError> {
        match (coordinates, spatial) {
            (Some(coordinates), Some(config)) => Ok(Some(Self {
                index: NeighborIndex::build(coordinates, config.neighbors)?,
                model: config.covariance_model,
                neighbors: config.neighbors,
            })),
            _ => Ok(None),
        }
    }

    fn weights(&self, phi: f64, point: [f64; 2]) -> Result<KrigingWeights, OccupancyError> {
        kriging_weights(&self.index, self.model, phi, point, self.neighbors)
            .ok_or(OccupancyError::Numerical(
                crate::inference::NumericalError::SingularPrecision,
            ))
    }

    /// Draw the field at `point` from `N(Bᵀ w_N, σ² F)` given a field in site order.
    fn draw(
        &self,
        rng: &mut StdRng,
        field: &[f64],
        sigma_sq: f64,
        phi: f64,
        point: [f64; 2],
    ) -> Result<f64, OccupancyError> {
        let weights = self.weights(phi, point)?;
        let conditional_mean: f64 = weights
            .weights
            .iter()
            .zip(&weights.neighbors)
            .map(|(b, &pos)| b * field[self.index.site_at(pos)])
            .sum();
        let sd = (sigma_sq * weights.variance).max(0.0).sqrt();
        Ok(sd.mul_add(sample_standard_normal(rng), conditional_mean))
    }
}

/// Predict occupancy probability at new sites for every retained draw.
///
/// Spatial models krige `w` from each draw's field with that draw's `σ²` and `φ`.
///
/// # Errors
///
/// Returns `OccupancyError` for empty draws, mismatched designs, missing coordinates on a
/// spatial model, or singular kriging systems.
pub fn predict_occupancy(
    model: &OccupancyModel,
    samples: &OccupancySamples,
    new_sites: &NewSites,
    seed: u64,
) -> Result<OccupancyPrediction, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    new_sites.validate(model.n_occupancy_covariates, model.spatial.is_some())?;
    let kriging = Kriging::from_parts(model.coordinates.as_ref(), model.spatial)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let n_seasons = new_sites.n_seasons;

    let mut prediction = OccupancyPrediction::default();
    for draw in &samples.draws {
        if draw.beta.len() != model.n_occupancy_covariates {
            return Err(OccupancyError::InconsistentPosteriorDimensions);
        }
        let w = match (&kriging, &draw.w, draw.sigma_sq, draw.phi) {
            (Some(kriging), Some(field), Some(sigma_sq), Some(phi)) => (0..new_sites.n_sites())
                .map(|site| {
                    let point = new_sites
                        .point(site)
                        .ok_or(OccupancyError::MissingPredictionCoordinates)?;
                    kriging.draw(&mut rng, field, sigma_sq, phi, point)
                })
                .collect::<Result<Vec<_>, _>>()?,
            (Some(_), ..) => return Err(OccupancyError::InconsistentPosteriorDimensions),
            _ => Vec::new(),
        };

        let psi = (0..new_sites.n_units())
            .map(|unit| {
                let mut eta = dot_row(&new_sites.occupancy_design, unit, &draw.beta);
                for (index, effect) in new_sites.occupancy_random_effects.iter().enumerate() {
                    let level = effect.levels[unit];
                    eta += match draw.occupancy_effects.get(index).and_then(|values| values.get(level)) {
                        Some(value) => *value,
                        None => {
                            let variance = draw
                                .occupancy_effect_variances
                                .get(index)
                                .copied()
                                .unwrap_or(1.0);
                            variance.sqrt() * sample_standard_normal(&mut rng)
                        }
                    };
                }
                if let Some(value) = w.get(unit / n_seasons) {
                    eta += value;
                }
                logistic_stable(eta)
            })
            .collect();
        prediction.psi.push(psi);
        if !w.is_empty() {
            prediction.w.push(w);
        }
    }
    prediction.psi_mean = column_means(&prediction.psi, new_sites.n_units());
    Ok(prediction)
}

/// Predict every species' occupancy probability at new sites.
///
/// Each spatial factor is kriged with unit variance and its own decay.
///
/// # Errors
///
/// Returns `OccupancyError` under the same conditions as [`predict_occupancy`].
pub fn predict_community(
    model: &CommunityModel,
    samples: &CommunitySamples,
    new_sites: &NewSites,
    seed: u64,
) -> Result<CommunityPrediction, OccupancyError> {
    if samples.is_empty() {
        return Err(OccupancyError::EmptyPosterior);
    }
    new_sites.validate(model.n_occupancy_covariates, model.spatial.is_some())?;
    let kriging = Kriging::from_parts(model.coordinates.as_ref(), model.spatial)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let n_seasons = new_sites.n_seasons;

    let mut prediction = CommunityPrediction::default();
    for draw in &samples.draws {
        if draw.beta.len() != model.n_species {
            return Err(OccupancyError::InconsistentPosteriorDimensions);
        }
        let factors = match &kriging {
            Some(kriging) => draw
                .factors
                .iter()
                .zip(&draw.phi)
                .map(|(field, &phi)| {
                    (0..new_sites.n_sites())
                        .map(|site| {
                            let point = new_sites
                                .point(site)
                                .ok_or(OccupancyError::MissingPredictionCoordinates)?;
                            kriging.draw(&mut rng, field, 1.0, phi, point)
                        })
                        .collect::<Result<Vec<_>, _>>()
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let psi: Vec<Vec<f64>> = draw
            .beta
            .iter()
            .enumerate()
            .map(|(species, beta)| {
                (0..new_sites.n_units())
                    .map(|unit| {
                        let site = unit / n_seasons;
                        let spatial: f64 = draw
                            .loadings
                            .get(species)
                            .map(|row| {
                                row.iter()
                                    .zip(&factors)
                                    .map(|(lambda, field)| lambda * field[site])
                                    .sum()
                            })
                            .unwrap_or(0.0);
                        logistic_stable(dot_row(&new_sites.occupancy_design, unit, beta) + spatial)
                    })
                    .collect()
            })
            .collect();
        prediction.psi.push(psi);
        if !factors.is_empty() {
            prediction.factors.push(factors);
        }
    }
    prediction.psi_mean = (0..model.n_species)
        .map(|species| {
            let per_draw: Vec<Vec<f64>> = prediction
                .psi
                .iter()
                .map(|draw| draw[species].clone())
                .collect();
            column_means(&per_draw, new_sites.n_units())
        })
        .collect();
    Ok(prediction)
}

fn column_means(rows: &[Vec<f64>], n_columns: usize) -> Vec<f64> {
    (0..n_columns)
        .map(|column| {
            let values: Vec<f64> = rows.iter().map(|row| row[column]).collect();
            mean(&values)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::occupancy::posterior::OccupancyDraw;
    use crate::spatial::SpatialConfig;
    use crate::utils::usize_to_f64;
    use approx::assert_relative_eq;

    fn draw(beta: Vec<f64>, w: Option<Vec<f64>>) -> OccupancyDraw {
        let spatial = w.is_some();
        OccupancyDraw {
            beta,
            alpha: vec![0.0],
            occupancy_effects: Vec::new(),
            occupancy_effect_variances: Vec::new(),
            detection_effects: Vec::new(),
            detection_effect_variances: Vec::new(),
            sigma_sq: spatial.then_some(1.0),
            phi: spatial.then_some(3.0),
            w,
            psi: Vec::new(),
            z: Vec::new(),
        }
    }

    fn model(spatial: Option<SpatialConfig>, coordinates: Option<Mat<f64>>) -> OccupancyModel {
        OccupancyModel {
            n_occupancy_covariates: 2,
            n_detection_covariates: 1,
            n_sites: 6,
            n_seasons: 1,
            spatial,
            decay_bounds: spatial.map(|_| (0.5, 30.0)),
            coordinates,
        }
    }

    #[test]
    fn non_spatial_prediction_is_logistic_of_design() {
        let samples = OccupancySamples {
            draws: vec![draw(vec![0.0, 1.0], None), draw(vec![1.0, 1.0], None)],
        };
        let design = Mat::from_fn(2, 2, |i, j| if j == 0 { 1.0 } else { usize_to_f64(i) });
        let prediction = predict_occupancy(&model(None, None), &samples, &NewSites::new(design, 1), 1)
            .expect("valid prediction");
        assert_relative_eq!(prediction.psi[0][0], 0.5);
        assert_relative_eq!(prediction.psi[1][1], logistic_stable(2.0));
        assert_relative_eq!(
            prediction.psi_mean[0],
            0.5 * (0.5 + logistic_stable(1.0)),
            epsilon = 1.0e-12
        );
        assert!(prediction.w.is_empty());
    }

    #[test]
    fn spatial_prediction_requires_coordinates() {
        let coordinates = Mat::from_fn(6, 2, |i, j| usize_to_f64(i * (j + 1)) / 6.0);
        let config = SpatialConfig {
            neighbors: 3,
            covariance_model: CovarianceModel::Exponential,
        };
        let samples = OccupancySamples {
            draws: vec![draw(vec![0.0, 0.0], Some(vec![0.5; 6]))],
        };
        let design = Mat::from_fn(1, 2, |_, j| if j == 0 { 1.0 } else { 0.0 });
        let spatial_model = model(Some(config), Some(coordinates.clone()));
        assert_eq!(
            predict_occupancy(&spatial_model, &samples, &NewSites::new(design.clone(), 1), 1)
                .map(|_| ()),
            Err(OccupancyError::MissingPredictionCoordinates)
        );

        // predicting at a training site returns that site's field value exactly
        let point = Mat::from_fn(1, 2, |_, j| coordinates[(2, j)]);
        let prediction = predict_occupancy(
            &spatial_model,
            &samples,
            &NewSites::new(design, 1).with_coordinates(point),
            1,
        )
        .expect("valid prediction");
        assert_relative_eq!(prediction.w[0][0], 0.5, epsilon = 1.0e-12);
        assert_relative_eq!(prediction.psi[0][0], logistic_stable(0.5), epsilon = 1.0e-12);
    }

    #[test]
    fn mismatched_design_is_rejected() {
        let samples = OccupancySamples {
            draws: vec![draw(vec![0.0, 1.0], None)],
        };
        let design = Mat::from_fn(2, 3, |_, _| 1.0);
        assert_eq!(
            predict_occupancy(&model(None, None), &samples, &NewSites::new(design, 1), 1)
                .map(|_| ()),
            Err(OccupancyError::DesignCoefficientMismatch {
                design_cols: 3,
                coef_len: 2
            })
        );
    }
}

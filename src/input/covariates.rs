//! Typed covariates and design-matrix assembly.
//!
//! Occupancy covariates vary by site or by site and season; detection covariates vary by
//! site or by individual survey. Designs always start with an intercept column.

use faer::Mat;

use super::{DetectionArray, InputError};
use crate::utils::matrix_is_finite;

/// Covariate on the occupancy linear predictor.
#[derive(Debug, Clone)]
pub enum OccupancyCovariate {
    /// One value per site, repeated across seasons.
    Site(Vec<f64>),
    /// `n_sites x n_seasons` values.
    SiteSeason(Mat<f64>),
}

/// Covariate on the detection linear predictor.
#[derive(Debug, Clone)]
pub enum DetectionCovariate {
    /// One value per site, repeated across seasons and replicates.
    Site(Vec<f64>),
    /// One value per `(site, season, replicate)` cell in lexicographic order.
    ///
    /// Values at missing cells are ignored and may be non-finite.
    Observation(Vec<f64>),
}

/// Assembled design matrix and its column labels.
#[derive(Debug, Clone)]
pub struct CovariateDesign {
    pub matrix: Mat<f64>,
    pub labels: Vec<String>,
}

impl OccupancyCovariate {
    fn check(&self, name: &str, detections: &DetectionArray) -> Result<(), InputError> {
        let (len, expected, finite) = match self {
            Self::Site(values) => (
                values.len(),
                detections.n_sites(),
                values.iter().all(|value| value.is_finite()),
            ),
            Self::SiteSeason(values) if values.nrows() != detections.n_sites() => {
                (values.nrows(), detections.n_sites(), true)
            }
            Self::SiteSeason(values) => (
                values.nrows() * values.ncols(),
                detections.n_units(),
                matrix_is_finite(values),
            ),
        };
        if len != expected {
            return Err(InputError::CovariateLength {
                name: name.to_string(),
                len,
                expected,
            });
        }
        if !finite {
            return Err(InputError::NonFiniteCovariate {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn value(&self, site: usize, season: usize) -> f64 {
        match self {
            Self::Site(values) => values[site],
            Self::SiteSeason(values) => values[(site, season)],
        }
    }
}

impl DetectionCovariate {
    fn check(&self, name: &str, detections: &DetectionArray) -> Result<(), InputError> {
        match self {
            Self::Site(values) => {
                if values.len() != detections.n_sites() {
                    return Err(InputError::CovariateLength {
                        name: name.to_string(),
                        len: values.len(),
                        expected: detections.n_sites(),
                    });
                }
                if !values.iter().all(|value| value.is_finite()) {
                    return Err(InputError::NonFiniteCovariate {
                        name: name.to_string(),
                    });
                }
            }
            Self::Observation(values) => {
                if values.len() != detections.n_cells() {
                    return Err(InputError::CovariateLength {
                        name: name.to_string(),
                        len: values.len(),
                        expected: detections.n_cells(),
                    });
                }
                let observed_finite = values
                    .iter()
                    .zip(detections.values())
                    .all(|(value, cell)| cell.is_none() || value.is_finite());
                if !observed_finite {
                    return Err(InputError::NonFiniteCovariate {
                        name: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    fn value(&self, site: usize, cell: usize) -> f64 {
        match self {
            Self::Site(values) => values[site],
            Self::Observation(values) => values[cell],
        }
    }
}

/// Build the occupancy design: intercept plus one column per covariate, one row per unit.
///
/// # Errors
///
/// Returns `InputError` if a covariate has the wrong length or non-finite values.
pub fn occupancy_design(
    detections: &DetectionArray,
    covariates: &[(&str, OccupancyCovariate)],
) -> Result<CovariateDesign, InputError> {
    for (name, covariate) in covariates {
        covariate.check(name, detections)?;
    }
    let n_seasons = detections.n_seasons();
    let matrix = Mat::from_fn(detections.n_units(), covariates.len() + 1, |unit, j| {
        if j == 0 {
            1.0
        } else {
            covariates[j - 1].1.value(unit / n_seasons, unit % n_seasons)
        }
    });
    Ok(CovariateDesign {
        matrix,
        labels: labels(covariates.iter().map(|(name, _)| *name)),
    })
}

/// Build the detection design: intercept plus one column per covariate, one row per cell.
///
/// # Errors
///
/// Returns `InputError` if a covariate has the wrong length or non-finite observed values.
pub fn detection_design(
    detections: &DetectionArray,
    covariates: &[(&str, DetectionCovariate)],
) -> Result<CovariateDesign, InputError> {
    for (name, covariate) in covariates {
        covariate.check(name, detections)?;
    }
    let per_site = detections.n_seasons() * detections.n_replicates();
    let matrix = Mat::from_fn(detections.n_cells(), covariates.len() + 1, |cell, j| {
        if j == 0 {
            1.0
        } else {
            covariates[j - 1].1.value(cell / per_site, cell)
        }
    });
    Ok(CovariateDesign {
        matrix,
        labels: labels(covariates.iter().map(|(name, _)| *name)),
    })
}

fn labels<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    std::iter::once("(Intercept)".to_string())
        .chain(names.map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::usize_to_f64;

    fn detections() -> DetectionArray {
        DetectionArray::from_fn(3, 2, 2, |site, season, replicate| {
            (site != 2 || replicate == 0).then_some((site + season) % 2 == 0)
        })
    }

    #[test]
    fn occupancy_design_repeats_site_values_across_seasons() {
        let detections = detections();
        let site_season = Mat::from_fn(3, 2, |i, j| if j == 0 { -1.0 } else { usize_to_f64(i) });
        let design = occupancy_design(
            &detections,
            &[
                ("forest", OccupancyCovariate::Site(vec![0.1, 0.2, 0.3])),
                ("rain", OccupancyCovariate::SiteSeason(site_season)),
            ],
        )
        .expect("valid covariates");
        assert_eq!(design.matrix.nrows(), 6);
        assert_eq!(design.labels, vec!["(Intercept)", "forest", "rain"]);
        assert!((design.matrix[(3, 1)] - 0.2).abs() < f64::EPSILON);
        assert!((design.matrix[(2, 2)] + 1.0).abs() < f64::EPSILON);
        assert!((design.matrix[(5, 2)] - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn observation_covariate_may_be_nan_at_missing_cells() {
        let detections = detections();
        let mut values = vec![0.5; detections.n_cells()];
        let missing = detections.cell_index(detections.unit_index(2, 0), 1);
        values[missing] = f64::NAN;
        let design = detection_design(
            &detections,
            &[("effort", DetectionCovariate::Observation(values.clone()))],
        )
        .expect("missing cells are ignored");
        assert_eq!(design.matrix.nrows(), 12);

        values[0] = f64::NAN;
        assert!(matches!(
            detection_design(&detections, &[("effort", DetectionCovariate::Observation(values))]),
            Err(InputError::NonFiniteCovariate { .. })
        ));
    }

    #[test]
    fn site_covariate_length_is_checked() {
        let detections = detections();
        let result = detection_design(&detections, &[("wind", DetectionCovariate::Site(vec![1.0]))]);
        assert!(matches!(
            result,
            Err(InputError::CovariateLength { expected: 3, len: 1, .. })
        ));
    }
}

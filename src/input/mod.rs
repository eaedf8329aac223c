//! # Model inputs
//!
//! Containers for detection/non-detection data, design matrices, site coordinates,
//! and unstructured random-intercept groupings.
//!
//! Detection data are indexed by `(site, season, replicate)`. An *occupancy unit* is a
//! `(site, season)` pair with index `site * n_seasons + season`; a *cell* is a
//! `(site, season, replicate)` triple with index `unit * n_replicates + replicate`.
//!
//! # Examples
//!
//! ```
//! use faer::Mat;
//! use spatial_occupancy::{DetectionArray, OccupancyInput};
//!
//! let detections = DetectionArray::from_fn(3, 1, 2, |site, _, replicate| {
//!     (site + replicate != 3).then_some(site == 1)
//! });
//! let occupancy_design = Mat::from_fn(3, 1, |_, _| 1.0);
//! let detection_design = Mat::from_fn(6, 1, |_, _| 1.0);
//! let input = OccupancyInput::new(detections, occupancy_design, detection_design);
//!
//! assert!(input.validate().is_ok());
//! ```

use faer::Mat;
use thiserror::Error;

use crate::utils::matrix_is_finite;

pub mod community;
pub mod covariates;

pub use community::CommunityInput;
pub use covariates::{CovariateDesign, DetectionCovariate, OccupancyCovariate};

/// Errors returned when validating model inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("detection array must have at least one site, season, and replicate")]
    EmptyDetections,
    #[error("detection array has {len} cells, expected {expected}")]
    DetectionLength { expected: usize, len: usize },
    #[error("{design} design must have at least one column")]
    EmptyDesign { design: &'static str },
    #[error("{design} design has {rows} rows, expected {expected}")]
    DesignRows {
        design: &'static str,
        rows: usize,
        expected: usize,
    },
    #[error("{design} design contains non-finite values")]
    NonFiniteDesign { design: &'static str },
    #[error("first column of the {design} design must be an intercept of ones")]
    MissingIntercept { design: &'static str },
    #[error("coordinates must be a {sites} x 2 matrix, got {rows} x {cols}")]
    CoordinateShape {
        rows: usize,
        cols: usize,
        sites: usize,
    },
    #[error("coordinates contain non-finite values")]
    NonFiniteCoordinates,
    #[error("sites {first} and {second} share the same coordinates")]
    DuplicateCoordinates { first: usize, second: usize },
    #[error("random effect `{name}` has {len} levels assigned, expected {expected}")]
    RandomEffectLength {
        name: String,
        len: usize,
        expected: usize,
    },
    #[error("random effect `{name}` must have at least one level")]
    EmptyRandomEffect { name: String },
    #[error("random effect `{name}` assigns level {level}, but only {n_levels} levels exist")]
    RandomEffectLevel {
        name: String,
        level: usize,
        n_levels: usize,
    },
    #[error("covariate `{name}` has length {len}, expected {expected}")]
    CovariateLength {
        name: String,
        len: usize,
        expected: usize,
    },
    #[error("covariate `{name}` contains non-finite values at observed cells")]
    NonFiniteCovariate { name: String },
    #[error("community data must contain at least one species")]
    NoSpecies,
    #[error("species {species} detection array dimensions differ from species 0")]
    SpeciesShape { species: usize },
    #[error("species {species} missingness pattern differs from species 0")]
    InconsistentMissingness { species: usize },
    #[error("site index {site} out of range for {sites} sites")]
    SiteOutOfRange { site: usize, sites: usize },
}

/// Detection/non-detection values indexed by `(site, season, replicate)`.
///
/// `Some(true)` is a detection, `Some(false)` a non-detection, `None` a missing survey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionArray {
    n_sites: usize,
    n_seasons: usize,
    n_replicates: usize,
    values: Vec<Option<bool>>,
}

impl DetectionArray {
    /// Build from values in `(site, season, replicate)` lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if any dimension is zero or the value count does not match.
    pub fn new(
        n_sites: usize,
        n_seasons: usize,
        n_replicates: usize,
        values: Vec<Option<bool>>,
    ) -> Result<Self, InputError> {
        if n_sites == 0 || n_seasons == 0 || n_replicates == 0 {
            return Err(InputError::EmptyDetections);
        }
        let expected = n_sites * n_seasons * n_replicates;
        if values.len() != expected {
            return Err(InputError::DetectionLength {
                expected,
                len: values.len(),
            });
        }
        Ok(Self {
            n_sites,
            n_seasons,
            n_replicates,
            values,
        })
    }

    /// Build from a closure over `(site, season, replicate)`.
    #[must_use]
    pub fn from_fn<F>(n_sites: usize, n_seasons: usize, n_replicates: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> Option<bool>,
    {
        let mut values = Vec::with_capacity(n_sites * n_seasons * n_replicates);
        for site in 0..n_sites {
            for season in 0..n_seasons {
                for replicate in 0..n_replicates {
                    values.push(f(site, season, replicate));
                }
            }
        }
        Self {
            n_sites,
            n_seasons,
            n_replicates,
            values,
        }
    }

    #[must_use]
    pub const fn n_sites(&self) -> usize {
        self.n_sites
    }

    #[must_use]
    pub const fn n_seasons(&self) -> usize {
        self.n_seasons
    }

    #[must_use]
    pub const fn n_replicates(&self) -> usize {
        self.n_replicates
    }

    /// Number of occupancy units, `n_sites * n_seasons`.
    #[must_use]
    pub const fn n_units(&self) -> usize {
        self.n_sites * self.n_seasons
    }

    /// Number of cells, `n_units * n_replicates`.
    #[must_use]
    pub fn n_cells(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub const fn unit_index(&self, site: usize, season: usize) -> usize {
        site * self.n_seasons + season
    }

    #[must_use]
    pub const fn cell_index(&self, unit: usize, replicate: usize) -> usize {
        unit * self.n_replicates + replicate
    }

    /// Site of an occupancy unit.
    #[must_use]
    pub const fn unit_site(&self, unit: usize) -> usize {
        unit / self.n_seasons
    }

    #[must_use]
    pub fn get(&self, site: usize, season: usize, replicate: usize) -> Option<bool> {
        let unit = self.unit_index(site, season);
        self.values[self.cell_index(unit, replicate)]
    }

    /// Cell values in lexicographic order.
    #[must_use]
    pub fn values(&self) -> &[Option<bool>] {
        &self.values
    }

    /// Replicate values for one occupancy unit.
    #[must_use]
    pub fn unit_values(&self, unit: usize) -> &[Option<bool>] {
        let start = unit * self.n_replicates;
        &self.values[start..start + self.n_replicates]
    }

    /// Whether any replicate at the unit is a detection.
    #[must_use]
    pub fn unit_detected(&self, unit: usize) -> bool {
        self.unit_values(unit).iter().any(|value| *value == Some(true))
    }

    /// Number of non-missing cells.
    #[must_use]
    pub fn observed_cells(&self) -> usize {
        self.values.iter().filter(|value| value.is_some()).count()
    }

    /// Whether two arrays share dimensions and the positions of missing cells.
    #[must_use]
    pub fn same_missingness(&self, other: &Self) -> bool {
        self.values
            .iter()
            .zip(&other.values)
            .all(|(left, right)| left.is_some() == right.is_some())
    }

    #[must_use]
    pub const fn same_shape(&self, other: &Self) -> bool {
        self.n_sites == other.n_sites
            && self.n_seasons == other.n_seasons
            && self.n_replicates == other.n_replicates
    }

    /// Keep only the listed sites, in the given order.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if a site index is out of range or the selection is empty.
    pub fn subset_sites(&self, sites: &[usize]) -> Result<Self, InputError> {
        check_sites(sites, self.n_sites)?;
        let per_site = self.n_seasons * self.n_replicates;
        let mut values = Vec::with_capacity(sites.len() * per_site);
        for &site in sites {
            let start = site * per_site;
            values.extend_from_slice(&self.values[start..start + per_site]);
        }
        Self::new(sites.len(), self.n_seasons, self.n_replicates, values)
    }
}

/// Unstructured random intercept: one level per occupancy unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomIntercept {
    pub name: String,
    pub levels: Vec<usize>,
    /// Total levels, including levels absent from `levels` after subsetting.
    pub n_levels: usize,
}

impl RandomIntercept {
    #[must_use]
    pub fn new(name: impl Into<String>, levels: Vec<usize>) -> Self {
        let n_levels = levels.iter().max().map_or(0, |max| max + 1);
        Self {
            name: name.into(),
            levels,
            n_levels,
        }
    }

    fn validate(&self, n_units: usize) -> Result<(), InputError> {
        if self.n_levels == 0 {
            return Err(InputError::EmptyRandomEffect {
                name: self.name.clone(),
            });
        }
        if self.levels.len() != n_units {
            return Err(InputError::RandomEffectLength {
                name: self.name.clone(),
                len: self.levels.len(),
                expected: n_units,
            });
        }
        if let Some(&level) = self.levels.iter().find(|&&level| level >= self.n_levels) {
            return Err(InputError::RandomEffectLevel {
                name: self.name.clone(),
                level,
                n_levels: self.n_levels,
            });
        }
        Ok(())
    }

    fn subset_units(&self, units: &[usize]) -> Self {
        Self {
            name: self.name.clone(),
            levels: units.iter().map(|&unit| self.levels[unit]).collect(),
            n_levels: self.n_levels,
        }
    }
}

/// Single-species occupancy model input.
#[derive(Debug, Clone)]
pub struct OccupancyInput {
    pub detections: DetectionArray,
    /// One row per occupancy unit; column 0 is the intercept.
    pub occupancy_design: Mat<f64>,
    /// One row per cell; rows of missing cells are ignored.
    pub detection_design: Mat<f64>,
    pub coordinates: Option<Mat<f64>>,
    pub occupancy_random_effects: Vec<RandomIntercept>,
    pub detection_random_effects: Vec<RandomIntercept>,
}

impl OccupancyInput {
    #[must_use]
    pub const fn new(
        detections: DetectionArray,
        occupancy_design: Mat<f64>,
        detection_design: Mat<f64>,
    ) -> Self {
        Self {
            detections,
            occupancy_design,
            detection_design,
            coordinates: None,
            occupancy_random_effects: Vec::new(),
            detection_random_effects: Vec::new(),
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
    pub fn with_detection_random_effect(mut self, effect: RandomIntercept) -> Self {
        self.detection_random_effects.push(effect);
        self
    }

    #[must_use]
    pub const fn n_sites(&self) -> usize {
        self.detections.n_sites()
    }

    /// Validate shapes, intercepts, coordinates, and random-effect levels.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if inputs are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        validate_designs(
            &self.detections,
            &self.occupancy_design,
            &self.detection_design,
        )?;
        if let Some(coordinates) = &self.coordinates {
            validate_coordinates(coordinates, self.detections.n_sites())?;
        }
        let n_units = self.detections.n_units();
        for effect in self
            .occupancy_random_effects
            .iter()
            .chain(&self.detection_random_effects)
        {
            effect.validate(n_units)?;
        }
        Ok(())
    }

    /// Restrict the input to the listed sites, keeping random-effect level counts.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if a site index is out of range or the selection is empty.
    pub fn subset_sites(&self, sites: &[usize]) -> Result<Self, InputError> {
        let detections = self.detections.subset_sites(sites)?;
        let units = site_units(&self.detections, sites);
        let cells = unit_cells(&self.detections, &units);
        Ok(Self {
            detections,
            occupancy_design: select_rows(&self.occupancy_design, &units),
            detection_design: select_rows(&self.detection_design, &cells),
            coordinates: self
                .coordinates
                .as_ref()
                .map(|coordinates| select_rows(coordinates, sites)),
            occupancy_random_effects: self
                .occupancy_random_effects
                .iter()
                .map(|effect| effect.subset_units(&units))
                .collect(),
            detection_random_effects: self
                .detection_random_effects
                .iter()
                .map(|effect| effect.subset_units(&units))
                .collect(),
        })
    }
}

pub(crate) fn validate_designs(
    detections: &DetectionArray,
    occupancy_design: &Mat<f64>,
    detection_design: &Mat<f64>,
) -> Result<(), InputError> {
    let n_units = detections.n_units();
    let n_cells = detections.n_cells();
    if occupancy_design.ncols() == 0 {
        return Err(InputError::EmptyDesign {
            design: "occupancy",
        });
    }
    if detection_design.ncols() == 0 {
        return Err(InputError::EmptyDesign {
            design: "detection",
        });
    }
    if occupancy_design.nrows() != n_units {
        return Err(InputError::DesignRows {
            design: "occupancy",
            rows: occupancy_design.nrows(),
            expected: n_units,
        });
    }
    if detection_design.nrows() != n_cells {
        return Err(InputError::DesignRows {
            design: "detection",
            rows: detection_design.nrows(),
            expected: n_cells,
        });
    }
    if !matrix_is_finite(occupancy_design) {
        return Err(InputError::NonFiniteDesign {
            design: "occupancy",
        });
    }
    let observed_rows_finite = detections
        .values()
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_some())
        .all(|(cell, _)| (0..detection_design.ncols()).all(|j| detection_design[(cell, j)].is_finite()));
    if !observed_rows_finite {
        return Err(InputError::NonFiniteDesign {
            design: "detection",
        });
    }
    if (0..n_units).any(|i| occupancy_design[(i, 0)] != 1.0) {
        return Err(InputError::MissingIntercept {
            design: "occupancy",
        });
    }
    let intercept_present = detections
        .values()
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_some())
        .all(|(cell, _)| detection_design[(cell, 0)] == 1.0);
    if !intercept_present {
        return Err(InputError::MissingIntercept {
            design: "detection",
        });
    }
    Ok(())
}

/// Validate an `n_sites x 2` coordinate matrix: finite and pairwise distinct.
///
/// # Errors
///
/// Returns `InputError` if the shape is wrong, a value is non-finite, or two sites coincide.
pub fn validate_coordinates(coordinates: &Mat<f64>, n_sites: usize) -> Result<(), InputError> {
    if coordinates.nrows() != n_sites || coordinates.ncols() != 2 {
        return Err(InputError::CoordinateShape {
            rows: coordinates.nrows(),
            cols: coordinates.ncols(),
            sites: n_sites,
        });
    }
    if !matrix_is_finite(coordinates) {
        return Err(InputError::NonFiniteCoordinates);
    }
    // -0.0 and 0.0 are the same location but `total_cmp` orders them apart.
    let coordinate = |site: usize, axis: usize| {
        let value = coordinates[(site, axis)];
        if value == 0.0 { 0.0 } else { value }
    };
    let mut order: Vec<usize> = (0..n_sites).collect();
    order.sort_by(|&a, &b| {
        coordinate(a, 0)
            .total_cmp(&coordinate(b, 0))
            .then(coordinate(a, 1).total_cmp(&coordinate(b, 1)))
    });
    for pair in order.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if coordinates[(first, 0)] == coordinates[(second, 0)]
            && coordinates[(first, 1)] == coordinates[(second, 1)]
        {
            return Err(InputError::DuplicateCoordinates {
                first: first.min(second),
                second: first.max(second),
            });
        }
    }
    Ok(())
}

pub(crate) fn check_sites(sites: &[usize], n_sites: usize) -> Result<(), InputError> {
    if sites.is_empty() {
        return Err(InputError::EmptyDetections);
    }
    if let Some(&site) = sites.iter().find(|&&site| site >= n_sites) {
        return Err(InputError::SiteOutOfRange {
            site,
            sites: n_sites,
        });
    }
    Ok(())
}

pub(crate) fn site_units(detections: &DetectionArray, sites: &[usize]) -> Vec<usize> {
    sites
        .iter()
        .flat_map(|&site| (0..detections.n_seasons()).map(move |season| (site, season)))
        .map(|(site, season)| detections.unit_index(site, season))
        .collect()
}

pub(crate) fn unit_cells(detections: &DetectionArray, units: &[usize]) -> Vec<usize> {
    units
        .iter()
        .flat_map(|&unit| {
            (0..detections.n_replicates()).map(move |replicate| (unit, replicate))
        })
        .map(|(unit, replicate)| detections.cell_index(unit, replicate))
        .collect()
}

pub(crate) fn select_rows(matrix: &Mat<f64>, rows: &[usize]) -> Mat<f64> {
    Mat::from_fn(rows.len(), matrix.ncols(), |i, j| matrix[(rows[i], j)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::usize_to_f64;

    fn small_input() -> OccupancyInput {
        let detections = DetectionArray::from_fn(4, 2, 3, |site, season, replicate| {
            if site == 3 && season == 1 {
                None
            } else {
                Some((site + season + replicate) % 3 == 0)
            }
        });
        let occupancy_design =
            Mat::from_fn(8, 2, |i, j| if j == 0 { 1.0 } else { 0.1 * usize_to_f64(i) });
        let detection_design =
            Mat::from_fn(24, 2, |i, j| if j == 0 { 1.0 } else { usize_to_f64(i % 3) });
        OccupancyInput::new(detections, occupancy_design, detection_design)
    }

    #[test]
    fn detection_array_indexing_is_lexicographic() {
        let detections = DetectionArray::from_fn(2, 2, 2, |site, season, replicate| {
            Some(site == 1 && season == 0 && replicate == 1)
        });
        let unit = detections.unit_index(1, 0);
        assert_eq!(unit, 2);
        assert_eq!(detections.cell_index(unit, 1), 5);
        assert_eq!(detections.values()[5], Some(true));
        assert!(detections.unit_detected(2));
        assert!(!detections.unit_detected(3));
        assert_eq!(detections.unit_site(3), 1);
    }

    #[test]
    fn detection_array_rejects_wrong_length() {
        let result = DetectionArray::new(2, 1, 2, vec![Some(true); 3]);
        assert_eq!(
            result,
            Err(InputError::DetectionLength {
                expected: 4,
                len: 3
            })
        );
    }

    #[test]
    fn validate_accepts_well_formed_input() {
        assert!(small_input().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_intercept() {
        let mut input = small_input();
        input.occupancy_design[(0, 0)] = 0.5;
        assert_eq!(
            input.validate(),
            Err(InputError::MissingIntercept {
                design: "occupancy"
            })
        );
    }

    #[test]
    fn validate_ignores_non_finite_rows_of_missing_cells() {
        let mut input = small_input();
        let missing_cell = input.detections.cell_index(input.detections.unit_index(3, 1), 0);
        input.detection_design[(missing_cell, 1)] = f64::NAN;
        assert!(input.validate().is_ok());
        input.detection_design[(0, 1)] = f64::NAN;
        assert_eq!(
            input.validate(),
            Err(InputError::NonFiniteDesign {
                design: "detection"
            })
        );
    }

    #[test]
    fn validate_rejects_design_row_mismatch() {
        let mut input = small_input();
        input.occupancy_design = Mat::from_fn(5, 1, |_, _| 1.0);
        assert!(matches!(
            input.validate(),
            Err(InputError::DesignRows { design: "occupancy", .. })
        ));
    }

    #[test]
    fn coordinates_must_be_distinct_and_finite() {
        let duplicate = Mat::from_fn(3, 2, |i, j| usize_to_f64(i % 2 + j));
        assert_eq!(
            validate_coordinates(&duplicate, 3),
            Err(InputError::DuplicateCoordinates { first: 0, second: 2 })
        );
        let non_finite = Mat::from_fn(2, 2, |i, _| if i == 0 { f64::INFINITY } else { 1.0 });
        assert_eq!(
            validate_coordinates(&non_finite, 2),
            Err(InputError::NonFiniteCoordinates)
        );
    }

    #[test]
    fn random_effect_length_is_checked() {
        let input = small_input().with_occupancy_random_effect(RandomIntercept::new("year", vec![0, 1]));
        assert!(matches!(
            input.validate(),
            Err(InputError::RandomEffectLength { expected: 8, .. })
        ));
    }

    #[test]
    fn signed_zero_coordinates_are_duplicates() {
        let points = [[-0.0, 1.0], [0.0, 0.5], [0.0, 1.0]];
        let coordinates = Mat::from_fn(3, 2, |i, j| points[i][j]);
        assert_eq!(
            validate_coordinates(&coordinates, 3),
            Err(InputError::DuplicateCoordinates { first: 0, second: 2 })
        );
    }

    #[test]
    fn random_effect_levels_must_be_in_range() {
        let effect = RandomIntercept {
            name: "observer".to_string(),
            levels: vec![5, 0, 1, 0, 1, 0, 1, 0],
            n_levels: 2,
        };
        let input = small_input().with_occupancy_random_effect(effect);
        assert_eq!(
            input.validate(),
            Err(InputError::RandomEffectLevel {
                name: "observer".to_string(),
                level: 5,
                n_levels: 2,
            })
        );
    }

    #[test]
    fn subset_sites_keeps_rows_and_level_counts() {
        let input = small_input()
            .with_occupancy_random_effect(RandomIntercept::new("site", vec![0, 0, 1, 1, 2, 2, 3, 3]));
        let subset = input.subset_sites(&[3, 1]).expect("valid subset");
        assert_eq!(subset.n_sites(), 2);
        assert_eq!(subset.occupancy_design.nrows(), 4);
        assert_eq!(subset.detection_design.nrows(), 12);
        assert_eq!(subset.detections.get(0, 1, 0), None);
        assert_eq!(subset.occupancy_random_effects[0].levels, vec![3, 3, 1, 1]);
        assert_eq!(subset.occupancy_random_effects[0].n_levels, 4);
        assert!(subset.validate().is_ok());
        assert!(input.subset_sites(&[9]).is_err());
    }
}

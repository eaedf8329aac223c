//! Multi-species detection data sharing one set of designs and coordinates.

use faer::Mat;

use super::{
    DetectionArray, InputError, OccupancyInput, check_sites, select_rows, site_units,
    unit_cells, validate_coordinates, validate_designs,
};

/// Community occupancy input: one detection array per species.
///
/// All species share the occupancy and detection designs, the site coordinates, and
/// the pattern of missing surveys.
#[derive(Debug, Clone)]
pub struct CommunityInput {
    pub detections: Vec<DetectionArray>,
    pub occupancy_design: Mat<f64>,
    pub detection_design: Mat<f64>,
    pub coordinates: Option<Mat<f64>>,
}

impl CommunityInput {
    #[must_use]
    pub const fn new(
        detections: Vec<DetectionArray>,
        occupancy_design: Mat<f64>,
        detection_design: Mat<f64>,
    ) -> Self {
        Self {
            detections,
            occupancy_design,
            detection_design,
            coordinates: None,
        }
    }

    #[must_use]
    pub fn with_coordinates(mut self, coordinates: Mat<f64>) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    #[must_use]
    pub fn n_species(&self) -> usize {
        self.detections.len()
    }

    #[must_use]
    pub fn n_sites(&self) -> usize {
        self.detections.first().map_or(0, DetectionArray::n_sites)
    }

    /// # Errors
    ///
    /// Returns `InputError` if there are no species, species arrays disagree in shape or
    /// missingness, or the shared designs and coordinates are malformed.
    pub fn validate(&self) -> Result<(), InputError> {
        let Some(reference) = self.detections.first() else {
            return Err(InputError::NoSpecies);
        };
        for (species, detections) in self.detections.iter().enumerate().skip(1) {
            if !detections.same_shape(reference) {
                return Err(InputError::SpeciesShape { species });
            }
            if !detections.same_missingness(reference) {
                return Err(InputError::InconsistentMissingness { species });
            }
        }
        validate_designs(reference, &self.occupancy_design, &self.detection_design)?;
        if let Some(coordinates) = &self.coordinates {
            validate_coordinates(coordinates, reference.n_sites())?;
        }
        Ok(())
    }

    /// Single-species view of one community member.
    #[must_use]
    pub fn species_input(&self, species: usize) -> Option<OccupancyInput> {
        let detections = self.detections.get(species)?.clone();
        let input = OccupancyInput::new(
            detections,
            self.occupancy_design.clone(),
            self.detection_design.clone(),
        );
        Some(match &self.coordinates {
            Some(coordinates) => input.with_coordinates(coordinates.clone()),
            None => input,
        })
    }

    /// Restrict every species to the listed sites.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if there are no species or a site index is out of range.
    pub fn subset_sites(&self, sites: &[usize]) -> Result<Self, InputError> {
        let Some(reference) = self.detections.first() else {
            return Err(InputError::NoSpecies);
        };
        check_sites(sites, reference.n_sites())?;
        let units = site_units(reference, sites);
        let cells = unit_cells(reference, &units);
        let detections = self
            .detections
            .iter()
            .map(|species| species.subset_sites(sites))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            detections,
            occupancy_design: select_rows(&self.occupancy_design, &units),
            detection_design: select_rows(&self.detection_design, &cells),
            coordinates: self
                .coordinates
                .as_ref()
                .map(|coordinates| select_rows(coordinates, sites)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(offset: usize) -> DetectionArray {
        DetectionArray::from_fn(3, 1, 2, move |site, _, replicate| {
            (site != 0 || replicate == 0).then_some((site + replicate + offset) % 2 == 0)
        })
    }

    fn community() -> CommunityInput {
        CommunityInput::new(
            vec![species(0), species(1)],
            Mat::from_fn(3, 1, |_, _| 1.0),
            Mat::from_fn(6, 1, |_, _| 1.0),
        )
    }

    #[test]
    fn validate_accepts_shared_missingness() {
        assert!(community().validate().is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_missingness() {
        let mut input = community();
        input.detections[1] = DetectionArray::from_fn(3, 1, 2, |_, _, _| Some(false));
        assert_eq!(
            input.validate(),
            Err(InputError::InconsistentMissingness { species: 1 })
        );
    }

    #[test]
    fn validate_rejects_empty_community() {
        let input = CommunityInput::new(
            Vec::new(),
            Mat::from_fn(3, 1, |_, _| 1.0),
            Mat::from_fn(6, 1, |_, _| 1.0),
        );
        assert_eq!(input.validate(), Err(InputError::NoSpecies));
    }

    #[test]
    fn subset_and_species_views_are_consistent() {
        let input = community();
        let subset = input.subset_sites(&[2, 0]).expect("valid subset");
        assert_eq!(subset.n_sites(), 2);
        assert_eq!(subset.detections[1].get(1, 0, 1), None);
        assert!(subset.validate().is_ok());
        let view = input.species_input(1).expect("species exists");
        assert_eq!(view.detections, input.detections[1]);
        assert!(input.species_input(2).is_none());
    }
}

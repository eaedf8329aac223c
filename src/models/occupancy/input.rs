//! Input preprocessing shared by the occupancy samplers.

use crate::input::DetectionArray;

/// Observation layout shared by every species of a dataset.
#[derive(Debug, Clone)]
pub(crate) struct ObservationLayout {
    pub n_sites: usize,
    pub n_seasons: usize,
    /// Observed cell indices for each occupancy unit.
    pub unit_cells: Vec<Vec<usize>>,
    /// All observed cells in lexicographic order.
    pub observed_cells: Vec<usize>,
    /// Occupancy unit of every cell, observed or not.
    pub cell_unit: Vec<usize>,
}

impl ObservationLayout {
    pub(crate) fn new(detections: &DetectionArray) -> Self {
        let n_units = detections.n_units();
        let n_replicates = detections.n_replicates();
        let mut unit_cells = vec![Vec::new(); n_units];
        let mut observed_cells = Vec::with_capacity(detections.observed_cells());
        for (cell, value) in detections.values().iter().enumerate() {
            if value.is_some() {
                unit_cells[cell / n_replicates].push(cell);
                observed_cells.push(cell);
            }
        }
        Self {
            n_sites: detections.n_sites(),
            n_seasons: detections.n_seasons(),
            unit_cells,
            observed_cells,
            cell_unit: (0..detections.n_cells())
                .map(|cell| cell / n_replicates)
                .collect(),
        }
    }

    pub(crate) fn n_units(&self) -> usize {
        self.unit_cells.len()
    }

    pub(crate) fn n_cells(&self) -> usize {
        self.cell_unit.len()
    }

    pub(crate) const fn unit_site(&self, unit: usize) -> usize {
        unit / self.n_seasons
    }
}

/// Detection outcomes for one species.
#[derive(Debug, Clone)]
pub(crate) struct SpeciesObservations {
    /// Outcome per cell; `false` at missing cells.
    pub y: Vec<bool>,
    /// Whether any replicate at each unit is a detection.
    pub detected: Vec<bool>,
}

impl SpeciesObservations {
    pub(crate) fn new(detections: &DetectionArray) -> Self {
        Self {
            y: detections
                .values()
                .iter()
                .map(|value| *value == Some(true))
                .collect(),
            detected: (0..detections.n_units())
                .map(|unit| detections.unit_detected(unit))
                .collect(),
        }
    }

    /// Latent state initialized from observed maxima; units without detections start
    /// occupied only when they have no observed replicate.
    pub(crate) fn initial_z(&self, layout: &ObservationLayout) -> Vec<u8> {
        self.detected
            .iter()
            .zip(&layout.unit_cells)
            .map(|(detected, cells)| u8::from(*detected || cells.is_empty()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_groups_observed_cells_by_unit() {
        let detections = DetectionArray::from_fn(2, 2, 2, |site, season, replicate| {
            if site == 1 && season == 0 {
                None
            } else {
                Some(replicate == 1 && site == 0)
            }
        });
        let layout = ObservationLayout::new(&detections);
        assert_eq!(layout.n_units(), 4);
        assert_eq!(layout.unit_cells[0], vec![0, 1]);
        assert!(layout.unit_cells[2].is_empty());
        assert_eq!(layout.observed_cells.len(), 6);
        assert_eq!(layout.cell_unit[5], 2);
        assert_eq!(layout.unit_site(3), 1);

        let observations = SpeciesObservations::new(&detections);
        assert_eq!(observations.detected, vec![true, true, false, false]);
        assert_eq!(observations.initial_z(&layout), vec![1, 1, 1, 0]);
    }
}

//! Ordered nearest-neighbor sets for the NNGP approximation.
//!
//! Sites are ordered by their first coordinate (ties by the second coordinate, then by
//! input index). Each site at ordered position `i` conditions on up to `m` of the
//! positions `0..i`, chosen by Euclidean distance with ties broken by position.

use faer::Mat;

use super::SpatialError;
use crate::inference::ConfigurationError;
use crate::input::validate_coordinates;

/// Immutable neighbor structure over ordered site positions.
#[derive(Debug, Clone)]
pub struct NeighborIndex {
    max_neighbors: usize,
    order: Vec<usize>,
    position: Vec<usize>,
    points: Vec<[f64; 2]>,
    neighbors: Vec<Vec<usize>>,
    neighbor_distances: Vec<Vec<f64>>,
    neighbor_blocks: Vec<Vec<f64>>,
    reverse: Vec<Vec<(usize, usize)>>,
}

impl NeighborIndex {
    /// Build the index from an `n_sites x 2` coordinate matrix.
    ///
    /// # Errors
    ///
    /// Returns `SpatialError` if coordinates are malformed, non-finite, or duplicated, or if
    /// `max_neighbors` is zero or not smaller than the site count.
    pub fn build(coordinates: &Mat<f64>, max_neighbors: usize) -> Result<Self, SpatialError> {
        let n_sites = coordinates.nrows();
        validate_coordinates(coordinates, n_sites)?;
        if max_neighbors == 0 || max_neighbors >= n_sites {
            return Err(ConfigurationError::InvalidNeighborCount {
                neighbors: max_neighbors,
                sites: n_sites,
            }
            .into());
        }

        let mut order: Vec<usize> = (0..n_sites).collect();
        order.sort_by(|&a, &b| {
            coordinates[(a, 0)]
                .total_cmp(&coordinates[(b, 0)])
                .then(coordinates[(a, 1)].total_cmp(&coordinates[(b, 1)]))
                .then(a.cmp(&b))
        });
        let mut position = vec![0; n_sites];
        for (pos, &site) in order.iter().enumerate() {
            position[site] = pos;
        }
        let points: Vec<[f64; 2]> = order
            .iter()
            .map(|&site| [coordinates[(site, 0)], coordinates[(site, 1)]])
            .collect();

        let mut neighbors = Vec::with_capacity(n_sites);
        let mut neighbor_distances = Vec::with_capacity(n_sites);
        let mut neighbor_blocks = Vec::with_capacity(n_sites);
        let mut reverse = vec![Vec::new(); n_sites];
        for i in 0..n_sites {
            let selected = nearest_among(&points[..i], points[i], max_neighbors);
            for (slot, &(j, _)) in selected.iter().enumerate() {
                reverse[j].push((i, slot));
            }
            let block = distance_block(&points, selected.iter().map(|&(j, _)| j));
            neighbor_distances.push(selected.iter().map(|&(_, d)| d).collect());
            neighbors.push(selected.into_iter().map(|(j, _)| j).collect());
            neighbor_blocks.push(block);
        }

        Ok(Self {
            max_neighbors,
            order,
            position,
            points,
            neighbors,
            neighbor_distances,
            neighbor_blocks,
            reverse,
        })
    }

    #[must_use]
    pub fn n_sites(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub const fn max_neighbors(&self) -> usize {
        self.max_neighbors
    }

    /// Input site index at ordered position `pos`.
    #[must_use]
    pub fn site_at(&self, pos: usize) -> usize {
        self.order[pos]
    }

    /// Ordered position of input site `site`.
    #[must_use]
    pub fn position_of(&self, site: usize) -> usize {
        self.position[site]
    }

    /// Neighbor positions of position `pos`, nearest first.
    #[must_use]
    pub fn neighbors(&self, pos: usize) -> &[usize] {
        &self.neighbors[pos]
    }

    /// Distances from position `pos` to each of its neighbors.
    #[must_use]
    pub fn neighbor_distances(&self, pos: usize) -> &[f64] {
        &self.neighbor_distances[pos]
    }

    /// Row-major pairwise distances among the neighbors of `pos`.
    #[must_use]
    pub fn neighbor_block(&self, pos: usize) -> &[f64] {
        &self.neighbor_blocks[pos]
    }

    /// Later positions using `pos` as a neighbor, with the slot `pos` occupies there.
    #[must_use]
    pub fn reverse_neighbors(&self, pos: usize) -> &[(usize, usize)] {
        &self.reverse[pos]
    }

    /// Coordinates of position `pos`.
    #[must_use]
    pub fn point(&self, pos: usize) -> [f64; 2] {
        self.points[pos]
    }

    /// Up to `count` positions nearest to an arbitrary point, with their distances.
    #[must_use]
    pub fn nearest(&self, point: [f64; 2], count: usize) -> Vec<(usize, f64)> {
        nearest_among(&self.points, point, count)
    }

    /// Pairwise distances among arbitrary positions, row-major.
    #[must_use]
    pub fn distance_block(&self, positions: &[usize]) -> Vec<f64> {
        distance_block(&self.points, positions.iter().copied())
    }
}

/// Smallest and largest pairwise distances among the rows of a coordinate matrix.
#[must_use]
pub fn distance_extremes(coordinates: &Mat<f64>) -> (f64, f64) {
    let mut min = f64::INFINITY;
    let mut max = 0.0_f64;
    for i in 0..coordinates.nrows() {
        for j in (i + 1)..coordinates.nrows() {
            let d = euclidean(
                [coordinates[(i, 0)], coordinates[(i, 1)]],
                [coordinates[(j, 0)], coordinates[(j, 1)]],
            );
            min = min.min(d);
            max = max.max(d);
        }
    }
    (min, max)
}

#[must_use]
pub fn euclidean(a: [f64; 2], b: [f64; 2]) -> f64 {
    (a[0] - b[0]).hypot(a[1] - b[1])
}

fn nearest_among(points: &[[f64; 2]], target: [f64; 2], count: usize) -> Vec<(usize, f64)> {
    let mut candidates: Vec<(usize, f64)> = points
        .iter()
        .enumerate()
        .map(|(j, point)| (j, euclidean(*point, target)))
        .collect();
    let by_distance = |a: &(usize, f64), b: &(usize, f64)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
    if candidates.len() > count {
        candidates.select_nth_unstable_by(count, by_distance);
        candidates.truncate(count);
    }
    candidates.sort_by(by_distance);
    candidates
}

fn distance_block(points: &[[f64; 2]], positions: impl Iterator<Item = usize>) -> Vec<f64> {
    let selected: Vec<[f64; 2]> = positions.map(|pos| points[pos]).collect();
    let dim = selected.len();
    let mut block = vec![0.0; dim * dim];
    for a in 0..dim {
        for b in (a + 1)..dim {
            let d = euclidean(selected[a], selected[b]);
            block[a * dim + b] = d;
            block[b * dim + a] = d;
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::InputError;
    use crate::utils::usize_to_f64;

    fn grid(side: usize) -> Mat<f64> {
        Mat::from_fn(side * side, 2, |i, j| {
            if j == 0 {
                usize_to_f64(i % side)
            } else {
                usize_to_f64(i / side) + 0.01 * usize_to_f64(i % side)
            }
        })
    }

    #[test]
    fn neighbors_precede_each_site_and_are_sorted() {
        let coordinates = grid(5);
        let index = NeighborIndex::build(&coordinates, 4).expect("valid index");
        assert_eq!(index.neighbors(0).len(), 0);
        assert_eq!(index.neighbors(1).len(), 1);
        for pos in 0..index.n_sites() {
            let neighbors = index.neighbors(pos);
            assert!(neighbors.len() <= 4);
            assert!(neighbors.iter().all(|&j| j < pos));
            let distances = index.neighbor_distances(pos);
            assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn ordering_follows_first_coordinate() {
        let coordinates = grid(4);
        let index = NeighborIndex::build(&coordinates, 2).expect("valid index");
        for pos in 1..index.n_sites() {
            assert!(index.point(pos - 1)[0] <= index.point(pos)[0]);
        }
        for site in 0..index.n_sites() {
            assert_eq!(index.site_at(index.position_of(site)), site);
        }
    }

    #[test]
    fn reverse_map_mirrors_neighbor_lists() {
        let index = NeighborIndex::build(&grid(4), 3).expect("valid index");
        for pos in 0..index.n_sites() {
            for &(later, slot) in index.reverse_neighbors(pos) {
                assert!(later > pos);
                assert_eq!(index.neighbors(later)[slot], pos);
            }
        }
        let total_forward: usize = (0..index.n_sites()).map(|pos| index.neighbors(pos).len()).sum();
        let total_reverse: usize =
            (0..index.n_sites()).map(|pos| index.reverse_neighbors(pos).len()).sum();
        assert_eq!(total_forward, total_reverse);
    }

    #[test]
    fn build_is_deterministic() {
        let coordinates = grid(5);
        let first = NeighborIndex::build(&coordinates, 3).expect("valid index");
        let second = NeighborIndex::build(&coordinates, 3).expect("valid index");
        for pos in 0..first.n_sites() {
            assert_eq!(first.neighbors(pos), second.neighbors(pos));
        }
    }

    #[test]
    fn build_rejects_neighbor_count_at_site_count() {
        let coordinates = grid(2);
        let result = NeighborIndex::build(&coordinates, 4);
        assert_eq!(
            result.err(),
            Some(SpatialError::Configuration(
                ConfigurationError::InvalidNeighborCount { neighbors: 4, sites: 4 }
            ))
        );
        assert!(NeighborIndex::build(&coordinates, 0).is_err());
    }

    #[test]
    fn build_rejects_non_finite_coordinates() {
        let mut coordinates = grid(2);
        coordinates[(1, 1)] = f64::NAN;
        assert_eq!(
            NeighborIndex::build(&coordinates, 1).err(),
            Some(SpatialError::Input(InputError::NonFiniteCoordinates))
        );
    }

    #[test]
    fn nearest_returns_closest_positions() {
        let index = NeighborIndex::build(&grid(3), 2).expect("valid index");
        let nearest = index.nearest([0.0, 0.0], 1);
        assert_eq!(nearest.len(), 1);
        assert_eq!(index.point(nearest[0].0), [0.0, 0.0]);
        assert!(nearest[0].1.abs() < f64::EPSILON);
    }

    #[test]
    fn distance_extremes_cover_all_pairs() {
        let coordinates = Mat::from_fn(3, 2, |i, j| if j == 0 { usize_to_f64(i * i) } else { 0.0 });
        let (min, max) = distance_extremes(&coordinates);
        assert!((min - 1.0).abs() < f64::EPSILON);
        assert!((max - 4.0).abs() < f64::EPSILON);
    }
}

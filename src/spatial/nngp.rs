//! NNGP conditional factors, full conditionals, and kriging weights.
//!
//! On the correlation scale each ordered position `i` has
//! `w_i | w_N(i) ~ N(B_i · w_N(i), σ² F_i)` with `B_i = C_N⁻¹ c` and `F_i = 1 - c · B_i`,
//! where `C_N` is the correlation among the neighbors and `c` the correlation between
//! `i` and its neighbors.

use faer::Mat;

use super::kernel::CovarianceModel;
use super::neighbors::{NeighborIndex, euclidean};
use crate::utils::solve_positive_definite;

const LN_TAU: f64 = 1.837_877_066_409_345_3;

/// Conditional regression weights `B` and variances `F` for one decay value.
#[derive(Debug, Clone)]
pub struct NngpFactors {
    weights: Vec<Vec<f64>>,
    variances: Vec<f64>,
}

/// Weights for predicting the field at a new location from its nearest sites.
#[derive(Debug, Clone)]
pub struct KrigingWeights {
    /// Ordered positions of the conditioning sites.
    pub neighbors: Vec<usize>,
    pub weights: Vec<f64>,
    /// Conditional variance on the correlation scale.
    pub variance: f64,
}

impl NngpFactors {
    /// Compute `B` and `F` for every position; `None` if a neighbor block is singular.
    #[must_use]
    pub fn compute(index: &NeighborIndex, model: CovarianceModel, phi: f64) -> Option<Self> {
        let n_sites = index.n_sites();
        let mut weights = Vec::with_capacity(n_sites);
        let mut variances = Vec::with_capacity(n_sites);
        for pos in 0..n_sites {
            let (b, f) = conditional_weights(
                model,
                phi,
                index.neighbor_block(pos),
                index.neighbor_distances(pos),
            )?;
            weights.push(b);
            variances.push(f);
        }
        Some(Self { weights, variances })
    }

    #[must_use]
    pub fn weights(&self, pos: usize) -> &[f64] {
        &self.weights[pos]
    }

    #[must_use]
    pub fn variance(&self, pos: usize) -> f64 {
        self.variances[pos]
    }

    /// `Σ ln F_i`.
    #[must_use]
    pub fn log_det(&self) -> f64 {
        self.variances.iter().map(|f| f.ln()).sum()
    }

    /// Residual `w_i - B_i · w_N(i)` for a field stored in ordered positions.
    #[must_use]
    pub fn residual(&self, index: &NeighborIndex, field: &[f64], pos: usize) -> f64 {
        let prediction = self.weights[pos]
            .iter()
            .zip(index.neighbors(pos))
            .map(|(b, &j)| b * field[j])
            .sum::<f64>();
        field[pos] - prediction
    }

    /// `Σ (w_i - B_i · w_N(i))² / F_i`.
    #[must_use]
    pub fn quadratic_form(&self, index: &NeighborIndex, field: &[f64]) -> f64 {
        (0..field.len())
            .map(|pos| {
                let residual = self.residual(index, field, pos);
                residual * residual / self.variances[pos]
            })
            .sum()
    }

    /// NNGP log density of `field` (ordered positions) with variance `sigma_sq`.
    #[must_use]
    pub fn log_density(&self, index: &NeighborIndex, field: &[f64], sigma_sq: f64) -> f64 {
        let n = crate::utils::usize_to_f64(field.len());
        -0.5 * (n * (LN_TAU + sigma_sq.ln())
            + self.log_det()
            + self.quadratic_form(index, field) / sigma_sq)
    }

    /// Prior precision and linear term of `w_pos` given all other field values.
    ///
    /// The full conditional is proportional to `exp(-½ precision w² + linear w)`; data
    /// terms are added by the caller.
    #[must_use]
    pub fn full_conditional(
        &self,
        index: &NeighborIndex,
        field: &[f64],
        pos: usize,
        sigma_sq: f64,
    ) -> (f64, f64) {
        let own_scale = 1.0 / (sigma_sq * self.variances[pos]);
        let own_mean = self.weights[pos]
            .iter()
            .zip(index.neighbors(pos))
            .map(|(b, &j)| b * field[j])
            .sum::<f64>();
        let mut precision = own_scale;
        let mut linear = own_mean * own_scale;
        for &(later, slot) in index.reverse_neighbors(pos) {
            let b = &self.weights[later];
            let scale = 1.0 / (sigma_sq * self.variances[later]);
            let others = b
                .iter()
                .zip(index.neighbors(later))
                .enumerate()
                .filter(|(k, _)| *k != slot)
                .map(|(_, (weight, &j))| weight * field[j])
                .sum::<f64>();
            precision += b[slot] * b[slot] * scale;
            linear += b[slot] * (field[later] - others) * scale;
        }
        (precision, linear)
    }
}

/// Kriging weights for a new point from its `count` nearest indexed sites.
#[must_use]
pub fn kriging_weights(
    index: &NeighborIndex,
    model: CovarianceModel,
    phi: f64,
    point: [f64; 2],
    count: usize,
) -> Option<KrigingWeights> {
    let nearest = index.nearest(point, count);
    let positions: Vec<usize> = nearest.iter().map(|&(pos, _)| pos).collect();
    let distances: Vec<f64> = nearest.iter().map(|&(_, d)| d).collect();
    if distances.first().is_some_and(|d| *d == 0.0) {
        let mut weights = vec![0.0; positions.len()];
        weights[0] = 1.0;
        return Some(KrigingWeights {
            neighbors: positions,
            weights,
            variance: 0.0,
        });
    }
    let block = index.distance_block(&positions);
    let (weights, variance) = conditional_weights(model, phi, &block, &distances)?;
    Some(KrigingWeights {
        neighbors: positions,
        weights,
        variance,
    })
}

/// Exact Gaussian-process log density of a field given by site coordinates.
#[must_use]
pub fn exact_log_density(
    coordinates: &[[f64; 2]],
    field: &[f64],
    model: CovarianceModel,
    sigma_sq: f64,
    phi: f64,
) -> Option<f64> {
    let n = coordinates.len();
    let covariance = Mat::from_fn(n, n, |i, j| {
        model.covariance(euclidean(coordinates[i], coordinates[j]), sigma_sq, phi)
    });
    let lower = crate::utils::cholesky_lower(&covariance)?;
    let half = crate::utils::forward_substitution(&lower, field);
    let log_det = (0..n).map(|i| lower[(i, i)].ln()).sum::<f64>() * 2.0;
    let quad = half.iter().map(|v| v * v).sum::<f64>();
    Some(-0.5 * (crate::utils::usize_to_f64(n) * LN_TAU + log_det + quad))
}

fn conditional_weights(
    model: CovarianceModel,
    phi: f64,
    block: &[f64],
    distances: &[f64],
) -> Option<(Vec<f64>, f64)> {
    let dim = distances.len();
    if dim == 0 {
        return Some((Vec::new(), 1.0));
    }
    let neighbor_corr = Mat::from_fn(dim, dim, |a, b| model.correlation(block[a * dim + b], phi));
    let cross: Vec<f64> = distances
        .iter()
        .map(|&d| model.correlation(d, phi))
        .collect();
    let weights = solve_positive_definite(&neighbor_corr, &cross)?;
    let explained = weights.iter().zip(&cross).map(|(b, c)| b * c).sum::<f64>();
    let variance = 1.0 - explained;
    (variance > 0.0 && variance.is_finite()).then_some((weights, variance))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::usize_to_f64;
    use approx::assert_relative_eq;

    fn scattered(n: usize) -> Mat<f64> {
        Mat::from_fn(n, 2, |i, j| {
            let t = usize_to_f64(i);
            if j == 0 {
                (t * 0.618_034).fract()
            } else {
                (t * 0.414_214 + 0.1).fract()
            }
        })
    }

    fn ordered_field(index: &NeighborIndex) -> Vec<f64> {
        (0..index.n_sites())
            .map(|pos| {
                let point = index.point(pos);
                (3.0 * point[0]).sin() + point[1]
            })
            .collect()
    }

    #[test]
    fn conditional_variances_shrink_with_more_neighbors() {
        let coordinates = scattered(30);
        let mut previous = f64::INFINITY;
        for m in 1..=10 {
            let index = NeighborIndex::build(&coordinates, m).expect("valid index");
            let factors =
                NngpFactors::compute(&index, CovarianceModel::Exponential, 3.0).expect("factors");
            let log_det = factors.log_det();
            assert!(log_det <= previous + 1.0e-9, "m = {m}");
            previous = log_det;
        }
    }

    #[test]
    fn full_neighbor_set_recovers_exact_density() {
        let n = 12;
        let coordinates = scattered(n);
        let index = NeighborIndex::build(&coordinates, n - 1).expect("valid index");
        let model = CovarianceModel::Exponential;
        let factors = NngpFactors::compute(&index, model, 2.5).expect("factors");
        let field = ordered_field(&index);
        let points: Vec<[f64; 2]> = (0..n).map(|pos| index.point(pos)).collect();
        let exact = exact_log_density(&points, &field, model, 1.7, 2.5).expect("exact density");
        assert_relative_eq!(factors.log_density(&index, &field, 1.7), exact, epsilon = 1.0e-8);
    }

    #[test]
    fn full_conditional_matches_density_curvature() {
        let coordinates = scattered(15);
        let index = NeighborIndex::build(&coordinates, 4).expect("valid index");
        let factors = NngpFactors::compute(&index, CovarianceModel::Exponential, 4.0).expect("factors");
        let mut field = ordered_field(&index);
        let sigma_sq = 0.8;
        let pos = 3;
        let (precision, linear) = factors.full_conditional(&index, &field, pos, sigma_sq);

        // log density is quadratic in w_pos: check it against -½ P w² + L w up to a constant
        let mut values = Vec::new();
        for w in [-1.0, 0.0, 1.0] {
            field[pos] = w;
            values.push(factors.log_density(&index, &field, sigma_sq));
        }
        let curvature = values[0] - 2.0 * values[1] + values[2];
        let slope = 0.5 * (values[2] - values[0]);
        assert_relative_eq!(curvature, -precision, epsilon = 1.0e-9);
        assert_relative_eq!(slope, linear, epsilon = 1.0e-9);
    }

    #[test]
    fn kriging_at_an_indexed_site_returns_its_value() {
        let coordinates = scattered(10);
        let index = NeighborIndex::build(&coordinates, 3).expect("valid index");
        let point = index.point(4);
        let kriging =
            kriging_weights(&index, CovarianceModel::Exponential, 2.0, point, 3).expect("weights");
        assert_eq!(kriging.neighbors[0], 4);
        assert_relative_eq!(kriging.weights[0], 1.0);
        assert_relative_eq!(kriging.variance, 0.0);
    }

    #[test]
    fn kriging_variance_is_between_zero_and_one() {
        let coordinates = scattered(20);
        let index = NeighborIndex::build(&coordinates, 5).expect("valid index");
        let kriging = kriging_weights(&index, CovarianceModel::Gaussian, 3.0, [0.5, 0.5], 5)
            .expect("weights");
        assert_eq!(kriging.weights.len(), 5);
        assert!(kriging.variance > 0.0 && kriging.variance < 1.0);
    }
}

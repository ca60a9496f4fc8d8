use nalgebra::{Cholesky, DMatrix, Dyn};
use ndarray::{Array2, ArrayView1, Axis};

use crate::error::{MatchingError, Result};

// Pivots this small relative to the largest variance mean the covariance is
// singular up to rounding.
const SINGULARITY_TOLERANCE: f64 = 1e-12;

// Sample covariance (n - 1 denominator) of the rows of `x`.
pub fn covariance(x: &Array2<f64>) -> Option<Array2<f64>> {
    let n = x.nrows();
    if n < 2 {
        return None;
    }
    let mean = x.mean_axis(Axis(0))?;
    let centered = x - &mean;
    Some(centered.t().dot(&centered) / (n - 1) as f64)
}

// Pooled within-group covariance: each group is centred on its own mean.
pub fn pooled_covariance(a: &Array2<f64>, b: &Array2<f64>) -> Option<Array2<f64>> {
    let (na, nb) = (a.nrows(), b.nrows());
    if na + nb < 3 || na == 0 || nb == 0 {
        return None;
    }
    let scatter = |x: &Array2<f64>| -> Option<Array2<f64>> {
        let mean = x.mean_axis(Axis(0))?;
        let centered = x - &mean;
        Some(centered.t().dot(&centered))
    };
    Some((scatter(a)? + scatter(b)?) / (na + nb - 2) as f64)
}

// Mahalanobis distance
//
// Holds the Cholesky factor L of the covariance matrix (Σ = L Lᵀ). Points
// are whitened with L⁻¹, after which Mahalanobis distance is plain
// Euclidean distance: d(a, b) = ‖L⁻¹a − L⁻¹b‖ = sqrt((a−b)ᵀ Σ⁻¹ (a−b)).
#[derive(Debug, Clone)]
pub struct MahalanobisMetric {
    factor: Cholesky<f64, Dyn>,
}

impl MahalanobisMetric {
    pub fn new(cov: &Array2<f64>, covariates: &[String]) -> Result<Self> {
        let singular = || MatchingError::SingularCovariance {
            covariates: covariates.to_vec(),
        };
        let p = cov.nrows();
        if p == 0 || cov.ncols() != p || cov.iter().any(|v| !v.is_finite()) {
            return Err(singular().into());
        }
        let sigma = DMatrix::from_fn(p, p, |i, j| cov[[i, j]]);
        let scale = sigma.diagonal().max();
        let factor = Cholesky::new(sigma).ok_or_else(singular)?;
        let l = factor.l_dirty();
        let smallest_pivot = (0..p).map(|i| l[(i, i)] * l[(i, i)]).fold(f64::INFINITY, f64::min);
        if !(scale > 0.0) || smallest_pivot <= SINGULARITY_TOLERANCE * scale {
            return Err(singular().into());
        }
        Ok(MahalanobisMetric { factor })
    }

    // Whiten each row of `x`: z = L⁻¹ x.
    pub fn whiten(&self, x: &Array2<f64>) -> Array2<f64> {
        let (n, p) = x.dim();
        let rhs = DMatrix::from_fn(p, n, |r, i| x[[i, r]]);
        let z = self.factor.l_dirty().solve_lower_triangular_unchecked(&rhs);
        Array2::from_shape_fn((n, p), |(i, r)| z[(r, i)])
    }

    pub fn distance(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let diff = (&a - &b).insert_axis(Axis(0));
        let z = self.whiten(&diff);
        z.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}

// Nearest neighbours of one whitened point
//
// Scans the whitened `pool` rows still marked `available` and returns up to
// `k` of them as `(row, distance)`, nearest first. Equal distances resolve to
// the lower row index, so the result never depends on anything but the
// input order. Candidates beyond `caliper` are skipped.
pub fn find_nn(
    target: ArrayView1<f64>,
    pool: &Array2<f64>,
    available: &[bool],
    k: usize,
    caliper: Option<f64>,
) -> Vec<(usize, f64)> {
    let mut candidates: Vec<(usize, f64)> = pool
        .outer_iter()
        .enumerate()
        .filter(|(j, _)| available[*j])
        .map(|(j, row)| {
            let d2: f64 = row.iter().zip(target.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
            (j, d2.sqrt())
        })
        .filter(|(_, d)| caliper.map_or(true, |c| *d <= c))
        .collect();
    let nearest_first = |a: &(usize, f64), b: &(usize, f64)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
    if k > 0 && candidates.len() > k {
        candidates.select_nth_unstable_by(k - 1, nearest_first);
    }
    candidates.truncate(k);
    candidates.sort_by(nearest_first);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("x{i}")).collect()
    }

    #[test]
    fn covariance_matches_hand_computation() {
        let x = array![[1.0, 2.0], [3.0, 6.0], [5.0, 7.0]];
        let cov = covariance(&x).unwrap();
        assert_abs_diff_eq!(cov[[0, 0]], 4.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[0, 1]], 5.0, epsilon = 1e-12);
        assert_abs_diff_eq!(cov[[1, 1]], 7.0, epsilon = 1e-12);
        assert!(covariance(&array![[1.0, 2.0]]).is_none());
    }

    #[test]
    fn pooled_covariance_matches_hand_computation() {
        // group means (2, 1) and (4, 2); scatters [[2, 2], [2, 2]] and
        // [[32, 12], [12, 6]] over 2 + 3 - 2 degrees of freedom
        let a = array![[1.0, 0.0], [3.0, 2.0]];
        let b = array![[0.0, 1.0], [4.0, 1.0], [8.0, 4.0]];
        let pooled = pooled_covariance(&a, &b).unwrap();
        let expected = array![[34.0, 14.0], [14.0, 8.0]] / 3.0;
        for (got, want) in pooled.iter().zip(&expected) {
            assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
        }

        // differs from the covariance of the stacked rows
        let stacked = ndarray::concatenate![Axis(0), a, b];
        let full = covariance(&stacked).unwrap();
        assert!((full[[1, 1]] - pooled[[1, 1]]).abs() > 0.1);

        assert!(pooled_covariance(&a, &Array2::zeros((0, 2))).is_none());
        assert!(pooled_covariance(&array![[1.0, 0.0]], &array![[2.0, 1.0]]).is_none());
    }

    #[test]
    fn whitened_rows_map_back_through_the_factor() {
        let cov = array![[4.0, 2.0], [2.0, 3.0]];
        let metric = MahalanobisMetric::new(&cov, &names(2)).unwrap();
        let x = array![[1.0, 2.0], [-3.0, 0.5], [0.0, 0.0]];
        let z = metric.whiten(&x);
        // L = [[2, 0], [1, sqrt(2)]]
        let l = array![[2.0, 0.0], [1.0, 2.0_f64.sqrt()]];
        for (back, orig) in z.dot(&l.t()).iter().zip(&x) {
            assert_abs_diff_eq!(*back, *orig, epsilon = 1e-12);
        }
    }

    #[test]
    fn mahalanobis_with_identity_is_euclidean() {
        let metric = MahalanobisMetric::new(&Array2::eye(2), &names(2)).unwrap();
        let d = metric.distance(array![0.0, 0.0].view(), array![3.0, 4.0].view());
        assert_abs_diff_eq!(d, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn mahalanobis_matches_quadratic_form() {
        let cov = array![[4.0, 2.0], [2.0, 3.0]];
        let metric = MahalanobisMetric::new(&cov, &names(2)).unwrap();
        let (a, b) = (array![1.0, 2.0], array![-1.0, 0.5]);
        // Σ⁻¹ = 1/8 [[3, -2], [-2, 4]], diff = (2, 1.5)
        let expected: f64 = ((3.0 * 4.0 - 2.0 * 2.0 * 2.0 * 1.5 + 4.0 * 2.25) / 8.0_f64).sqrt();
        assert_abs_diff_eq!(metric.distance(a.view(), b.view()), expected, epsilon = 1e-12);
    }

    #[test]
    fn singular_covariance_is_reported() {
        // second column is exactly twice the first
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0], [4.0, 8.0]];
        let cov = covariance(&x).unwrap();
        match MahalanobisMetric::new(&cov, &names(2)) {
            Err(Error::Matching(MatchingError::SingularCovariance { covariates })) => {
                assert_eq!(covariates, names(2));
            }
            other => panic!("expected singular covariance, got {other:?}"),
        }
    }

    #[test]
    fn find_nn_breaks_ties_by_row() {
        let pool = array![[2.0], [0.0], [-1.0], [1.0]];
        let nn = find_nn(array![0.5].view(), &pool, &[true; 4], 2, None);
        assert_eq!(nn.iter().map(|(j, _)| *j).collect::<Vec<_>>(), vec![1, 3]);

        let nn = find_nn(array![0.5].view(), &pool, &[true, false, true, true], 1, None);
        assert_eq!(nn[0].0, 3);

        let nn = find_nn(array![10.0].view(), &pool, &[true; 4], 1, Some(1.0));
        assert!(nn.is_empty());
    }
}

use ndarray::{Array2, Axis};
use polars::prelude::{ChunkCompare, DataFrame, NamedFrom, Series};
use tracing::{info, warn};

use crate::config::{CovarianceSample, MatchingConfig};
use crate::data::{covariate_matrix, row_labels, treatment_indicator};
use crate::distance::{covariance, find_nn, pooled_covariance, MahalanobisMetric};
use crate::error::{MatchingError, Result};

pub const MATCH_WEIGHT: &str = "match_weight";

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedControl {
    pub row: usize,
    pub id: String,
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchedPair {
    pub treated_row: usize,
    pub treated_id: String,
    pub controls: Vec<MatchedControl>,
}

// Outcome of a matching run over a whole frame.
//
// `weights` is aligned with the input rows: matched treated units carry 1,
// controls carry their share of match events, everything else carries 0.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pairs: Vec<MatchedPair>,
    weights: Vec<f64>,
    unmatched_treated: Vec<usize>,
}

impl MatchResult {
    fn empty(n: usize) -> Self {
        MatchResult {
            pairs: Vec::new(),
            weights: vec![0.0; n],
            unmatched_treated: Vec::new(),
        }
    }

    // Pairs ordered by treated row.
    pub fn pairs(&self) -> &[MatchedPair] {
        &self.pairs
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn unmatched_treated(&self) -> &[usize] {
        &self.unmatched_treated
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn n_treated_matched(&self) -> usize {
        self.pairs.len()
    }

    // Distinct controls used at least once.
    pub fn n_controls_used(&self) -> usize {
        let mut rows: Vec<usize> = self
            .pairs
            .iter()
            .flat_map(|p| p.controls.iter().map(|c| c.row))
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows.len()
    }

    // The matched rows of `data` with a `match_weight` column. Rows that
    // never took part in a match are dropped.
    pub fn matched_frame(&self, data: &DataFrame) -> Result<DataFrame> {
        if self.pairs.is_empty() {
            return Err(MatchingError::NoMatches.into());
        }
        let mut out = data.clone();
        out.with_column(Series::new(MATCH_WEIGHT, self.weights.clone()))?;
        let mask = out.column(MATCH_WEIGHT)?.gt(0.0)?;
        Ok(out.filter(&mask)?)
    }
}

fn select_rows(x: &Array2<f64>, rows: &[usize]) -> Array2<f64> {
    x.select(Axis(0), rows)
}

// Covariance of the confounders over the configured sample.
pub fn matching_covariance(
    x: &Array2<f64>,
    treated: &[bool],
    sample: CovarianceSample,
) -> Option<Array2<f64>> {
    let rows = |flag: bool| -> Vec<usize> {
        treated
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == flag)
            .map(|(i, _)| i)
            .collect()
    };
    match sample {
        CovarianceSample::Full => covariance(x),
        CovarianceSample::Treated => covariance(&select_rows(x, &rows(true))),
        CovarianceSample::Control => covariance(&select_rows(x, &rows(false))),
        CovarianceSample::Pooled => pooled_covariance(
            &select_rows(x, &rows(true)),
            &select_rows(x, &rows(false)),
        ),
    }
}

// Nearest neighbour covariate matching
//
// Every treated row, in ascending row order, takes the `ratio` closest
// available controls by Mahalanobis distance over `covariates`. Without
// replacement a chosen control leaves the pool, so late treated rows can end
// up unmatched. Ties go to the lower control row.
pub fn nn_match(
    data: &DataFrame,
    treatment: &str,
    covariates: &[String],
    config: &MatchingConfig,
) -> Result<MatchResult> {
    let treated = treatment_indicator(data, treatment)?;
    let x = covariate_matrix(data, covariates)?;
    let n = treated.len();

    let treated_rows: Vec<usize> = (0..n).filter(|i| treated[*i]).collect();
    let control_rows: Vec<usize> = (0..n).filter(|i| !treated[*i]).collect();
    if treated_rows.is_empty() || control_rows.is_empty() {
        warn!(
            treated = treated_rows.len(),
            controls = control_rows.len(),
            "empty pool, nothing to match"
        );
        return Ok(MatchResult::empty(n));
    }

    let cov = matching_covariance(&x, &treated, config.covariance).ok_or_else(|| {
        MatchingError::SingularCovariance {
            covariates: covariates.to_vec(),
        }
    })?;
    let metric = MahalanobisMetric::new(&cov, covariates)?;
    let z = metric.whiten(&x);
    let z_control = select_rows(&z, &control_rows);

    let ids = row_labels(data)?;
    let mut available = vec![true; control_rows.len()];
    let mut weights = vec![0.0; n];
    let mut pairs = Vec::with_capacity(treated_rows.len());
    let mut unmatched = Vec::new();

    for &t in &treated_rows {
        let nearest = find_nn(z.row(t), &z_control, &available, config.ratio, config.caliper);
        if nearest.is_empty() {
            unmatched.push(t);
            continue;
        }
        let share = 1.0 / nearest.len() as f64;
        let mut controls = Vec::with_capacity(nearest.len());
        for (j, distance) in nearest {
            let row = control_rows[j];
            weights[row] += share;
            if !config.replace {
                available[j] = false;
            }
            controls.push(MatchedControl {
                row,
                id: ids[row].clone(),
                distance,
            });
        }
        weights[t] = 1.0;
        pairs.push(MatchedPair {
            treated_row: t,
            treated_id: ids[t].clone(),
            controls,
        });
    }

    if !unmatched.is_empty() {
        warn!(unmatched = unmatched.len(), "treated units left without a match");
    }
    let result = MatchResult {
        pairs,
        weights,
        unmatched_treated: unmatched,
    };
    info!(
        treated_matched = result.n_treated_matched(),
        controls_used = result.n_controls_used(),
        replace = config.replace,
        ratio = config.ratio,
        "matched treated units to controls"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::column_f64;
    use crate::error::Error;
    use approx::assert_abs_diff_eq;
    use polars::df;

    fn frame() -> DataFrame {
        df!(
            "id" => &[10_i64, 11, 12, 13, 14, 15, 16, 17],
            "t" => &[1_i64, 1, 1, 0, 0, 0, 0, 0],
            "a" => &[1.0, 1.1, 5.0, 1.05, 4.0, 9.0, 0.0, 6.0],
            "b" => &[2.0, 2.1, 1.0, 2.0, 1.5, 7.0, -3.0, 0.0]
        )
        .unwrap()
    }

    fn covs() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    fn control_weight_sum(result: &MatchResult, data: &DataFrame) -> f64 {
        let t = treatment_indicator(data, "t").unwrap();
        result
            .weights()
            .iter()
            .zip(t)
            .filter(|(_, t)| !*t)
            .map(|(w, _)| *w)
            .sum()
    }

    #[test]
    fn with_replacement_reuses_close_controls() {
        let data = frame();
        let result = nn_match(&data, "t", &covs(), &MatchingConfig::default()).unwrap();
        assert_eq!(result.n_treated_matched(), 3);
        // rows 0 and 1 both sit next to row 3
        assert_eq!(result.pairs()[0].controls[0].row, 3);
        assert_eq!(result.pairs()[1].controls[0].row, 3);
        assert_eq!(result.pairs()[0].treated_id, "10");
        assert_eq!(result.pairs()[0].controls[0].id, "13");
        assert_abs_diff_eq!(result.weights()[3], 2.0);
        assert_abs_diff_eq!(control_weight_sum(&result, &data), 3.0);
    }

    #[test]
    fn one_to_one_without_replacement_has_unit_weights() {
        let data = frame();
        let config = MatchingConfig {
            replace: false,
            ..MatchingConfig::default()
        };
        let result = nn_match(&data, "t", &covs(), &config).unwrap();
        assert_eq!(result.n_treated_matched(), 3);
        assert_eq!(result.n_controls_used(), 3);
        let matched = result.matched_frame(&data).unwrap();
        assert_eq!(matched.height(), 6);
        assert!(column_f64(&matched, MATCH_WEIGHT).unwrap().iter().all(|w| *w == 1.0));
    }

    #[test]
    fn exhausted_pool_leaves_treated_unmatched() {
        let data = df!(
            "t" => &[1_i64, 1, 0],
            "a" => &[0.0, 1.0, 0.2],
            "b" => &[1.0, 0.0, 0.5]
        )
        .unwrap();
        let config = MatchingConfig {
            replace: false,
            ..MatchingConfig::default()
        };
        let result = nn_match(&data, "t", &covs(), &config).unwrap();
        assert_eq!(result.n_treated_matched(), 1);
        assert_eq!(result.unmatched_treated().len(), 1);
        assert_abs_diff_eq!(control_weight_sum(&result, &data), 1.0);
    }

    #[test]
    fn ratio_shares_weight_between_controls() {
        let data = frame();
        let config = MatchingConfig {
            ratio: 2,
            ..MatchingConfig::default()
        };
        let result = nn_match(&data, "t", &covs(), &config).unwrap();
        assert!(result.pairs().iter().all(|p| p.controls.len() == 2));
        assert_abs_diff_eq!(control_weight_sum(&result, &data), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn caliper_drops_distant_treated() {
        let data = frame();
        let config = MatchingConfig {
            caliper: Some(0.2),
            ..MatchingConfig::default()
        };
        let result = nn_match(&data, "t", &covs(), &config).unwrap();
        assert!(result.unmatched_treated().contains(&2));
        assert!(result.pairs().iter().all(|p| p.controls[0].distance <= 0.2));
    }

    #[test]
    fn empty_control_pool_gives_empty_result() {
        let data = df!("t" => &[1_i64, 1], "a" => &[0.0, 1.0], "b" => &[1.0, 3.0]).unwrap();
        let result = nn_match(&data, "t", &covs(), &MatchingConfig::default()).unwrap();
        assert!(result.is_empty());
        assert!(matches!(
            result.matched_frame(&data),
            Err(Error::Matching(MatchingError::NoMatches))
        ));
    }

    #[test]
    fn collinear_covariates_fail_loudly() {
        let data = df!(
            "t" => &[1_i64, 0, 1, 0],
            "a" => &[1.0, 2.0, 3.0, 4.0],
            "b" => &[2.0, 4.0, 6.0, 8.0]
        )
        .unwrap();
        assert!(matches!(
            nn_match(&data, "t", &covs(), &MatchingConfig::default()),
            Err(Error::Matching(MatchingError::SingularCovariance { .. }))
        ));
    }

    #[test]
    fn control_covariance_changes_the_chosen_control() {
        // treated rows spread along `a`, controls along `b`: the full sample
        // makes `a` cheap, the control sample makes it expensive
        let data = df!(
            "t" => &[1_i64, 1, 1, 0, 0, 0, 0, 0],
            "a" => &[0.0, -10.0, 10.0, 1.0, 0.0, 0.2, -0.2, 0.0],
            "b" => &[0.0, 0.0, 0.0, 0.0, 1.0, -3.0, 3.0, -1.0]
        )
        .unwrap();
        let full = nn_match(&data, "t", &covs(), &MatchingConfig::default()).unwrap();
        let control = nn_match(
            &data,
            "t",
            &covs(),
            &MatchingConfig {
                covariance: CovarianceSample::Control,
                ..MatchingConfig::default()
            },
        )
        .unwrap();
        assert_eq!(full.pairs()[0].controls[0].row, 3);
        assert_eq!(control.pairs()[0].controls[0].row, 4);
        // control covariance [[0.22, -0.3], [-0.3, 5]], difference (0, 1)
        assert_abs_diff_eq!(
            control.pairs()[0].controls[0].distance,
            (0.22_f64 / 1.01).sqrt(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn matching_is_deterministic() {
        let data = frame();
        let a = nn_match(&data, "t", &covs(), &MatchingConfig::default()).unwrap();
        let b = nn_match(&data, "t", &covs(), &MatchingConfig::default()).unwrap();
        assert_eq!(a, b);
    }
}

// Weighted least squares.
//
// One routine serves every model in the comparison; the naive, matched and
// IPW fits differ only in the weight vector handed to `wls`.

use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::Array2;
use polars::prelude::DataFrame;
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::data::{column_f64, covariate_matrix};
use crate::error::{Error, Result, WeightError};

pub const INTERCEPT: &str = "(Intercept)";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coefficient {
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
    pub t_value: f64,
    pub p_value: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegressionFit {
    pub coefficients: Vec<Coefficient>,
    // Rows with a positive weight.
    pub n_obs: usize,
    pub df_residual: usize,
    pub r_squared: f64,
}

impl RegressionFit {
    pub fn term(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.term == name)
    }

    pub fn estimate(&self, name: &str) -> Option<f64> {
        self.term(name).map(|c| c.estimate)
    }
}

// Regress `outcome` on `predictors` (plus an intercept), optionally
// weighting rows by the `weights` column.
pub fn fit(
    data: &DataFrame,
    outcome: &str,
    predictors: &[&str],
    weights: Option<&str>,
) -> Result<RegressionFit> {
    let x = covariate_matrix(data, predictors)?;
    let y = column_f64(data, outcome)?;
    let w = weights.map(|name| column_f64(data, name)).transpose()?;
    let names: Vec<String> = predictors.iter().map(|p| p.to_string()).collect();
    wls(&x, &y, w.as_deref(), &names)
}

// Weighted least squares with an intercept. `weights = None` is the
// all-ones case.
pub fn wls(
    x: &Array2<f64>,
    y: &[f64],
    weights: Option<&[f64]>,
    names: &[String],
) -> Result<RegressionFit> {
    let (n, k) = x.dim();
    if y.len() != n {
        return Err(Error::Regression(format!(
            "outcome has {} rows but design has {n}",
            y.len()
        )));
    }
    if names.len() != k {
        return Err(Error::Regression(format!(
            "{} names given for {k} predictors",
            names.len()
        )));
    }
    let ones;
    let w = match weights {
        Some(w) => {
            if w.len() != n {
                return Err(Error::Regression(format!(
                    "weights have {} rows but design has {n}",
                    w.len()
                )));
            }
            if let Some((row, &weight)) =
                w.iter().enumerate().find(|(_, w)| !(w.is_finite() && **w >= 0.0))
            {
                return Err(WeightError::InvalidWeight { row, weight }.into());
            }
            w
        }
        None => {
            ones = vec![1.0; n];
            &ones[..]
        }
    };
    if let Some(row) = y.iter().position(|v| !v.is_finite()) {
        return Err(Error::Regression(format!("outcome at row {row} is not finite")));
    }

    let p = k + 1;
    let n_obs = w.iter().filter(|w| **w > 0.0).count();
    if n_obs <= p {
        return Err(Error::Regression(format!(
            "{n_obs} weighted observations are not enough for {p} coefficients"
        )));
    }

    let design = DMatrix::from_fn(n, p, |i, j| if j == 0 { 1.0 } else { x[[i, j - 1]] });
    let mut xtwx = DMatrix::<f64>::zeros(p, p);
    let mut xtwy = DVector::<f64>::zeros(p);
    for i in 0..n {
        if w[i] == 0.0 {
            continue;
        }
        let row = design.row(i);
        for a in 0..p {
            xtwy[a] += w[i] * row[a] * y[i];
            for b in 0..p {
                xtwx[(a, b)] += w[i] * row[a] * row[b];
            }
        }
    }

    let chol = Cholesky::new(xtwx)
        .ok_or_else(|| Error::Regression("design matrix is rank deficient".to_string()))?;
    let beta = chol.solve(&xtwy);
    let cov_unscaled = chol.inverse();

    let fitted = &design * &beta;
    let sum_w: f64 = w.iter().sum();
    let y_bar = w.iter().zip(y).map(|(w, y)| w * y).sum::<f64>() / sum_w;
    let (mut sse, mut sst) = (0.0, 0.0);
    for i in 0..n {
        sse += w[i] * (y[i] - fitted[i]).powi(2);
        sst += w[i] * (y[i] - y_bar).powi(2);
    }
    let df_residual = n_obs - p;
    let sigma2 = sse / df_residual as f64;
    let r_squared = if sst > 0.0 { 1.0 - sse / sst } else { 0.0 };

    let t_dist = StudentsT::new(0.0, 1.0, df_residual as f64)
        .map_err(|e| Error::Regression(e.to_string()))?;
    let t_crit = t_dist.inverse_cdf(0.975);

    let mut terms = Vec::with_capacity(p);
    terms.push(INTERCEPT.to_string());
    terms.extend(names.iter().cloned());
    let coefficients = terms
        .into_iter()
        .enumerate()
        .map(|(j, term)| {
            let estimate = beta[j];
            let std_error = (sigma2 * cov_unscaled[(j, j)]).max(0.0).sqrt();
            let t_value = estimate / std_error;
            let p_value = 2.0 * (1.0 - t_dist.cdf(t_value.abs()));
            Coefficient {
                term,
                estimate,
                std_error,
                t_value,
                p_value,
                conf_low: estimate - t_crit * std_error,
                conf_high: estimate + t_crit * std_error,
            }
        })
        .collect();

    Ok(RegressionFit {
        coefficients,
        n_obs,
        df_residual,
        r_squared,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use polars::df;
    use polars::prelude::NamedFrom;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn binary_predictor_recovers_mean_difference() {
        let x = array![[1.0], [1.0], [1.0], [0.0], [0.0], [0.0]];
        let y = [10.0, 12.0, 14.0, 20.0, 21.0, 25.0];
        let fit = wls(&x, &y, None, &names(&["t"])).unwrap();
        assert_abs_diff_eq!(fit.estimate(INTERCEPT).unwrap(), 22.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.estimate("t").unwrap(), -10.0, epsilon = 1e-10);
        assert_eq!(fit.df_residual, 4);
        // pooled residual variance (8 + 14) / 4, se = sqrt(s2 * (1/3 + 1/3))
        let se = (5.5_f64 * (2.0 / 3.0)).sqrt();
        assert_abs_diff_eq!(fit.term("t").unwrap().std_error, se, epsilon = 1e-10);
        let c = fit.term("t").unwrap();
        assert!(c.conf_low < -10.0 && c.conf_high > -10.0);
        assert!(c.p_value > 0.0 && c.p_value < 0.05);
    }

    #[test]
    fn unit_weights_equal_unweighted() {
        let x = array![[1.0, 0.3], [0.0, 1.2], [1.0, -0.7], [0.0, 2.2], [1.0, 0.1], [0.0, 0.9]];
        let y = [3.0, 1.5, 2.0, 4.1, 3.3, 0.2];
        let plain = wls(&x, &y, None, &names(&["t", "z"])).unwrap();
        let weighted = wls(&x, &y, Some(&[1.0; 6]), &names(&["t", "z"])).unwrap();
        for (a, b) in plain.coefficients.iter().zip(&weighted.coefficients) {
            assert_abs_diff_eq!(a.estimate, b.estimate, epsilon = 1e-12);
            assert_abs_diff_eq!(a.std_error, b.std_error, epsilon = 1e-12);
        }
    }

    #[test]
    fn integer_weights_match_duplicated_rows() {
        let x = array![[1.0], [0.0], [0.0], [1.0], [0.0]];
        let y = [5.0, 1.0, 2.0, 7.0, 4.0];
        let weighted = wls(&x, &y, Some(&[1.0, 2.0, 1.0, 1.0, 1.0]), &names(&["t"])).unwrap();
        let dup_x = array![[1.0], [0.0], [0.0], [0.0], [1.0], [0.0]];
        let dup_y = [5.0, 1.0, 1.0, 2.0, 7.0, 4.0];
        let duplicated = wls(&dup_x, &dup_y, None, &names(&["t"])).unwrap();
        assert_abs_diff_eq!(
            weighted.estimate("t").unwrap(),
            duplicated.estimate("t").unwrap(),
            epsilon = 1e-12
        );
    }

    #[test]
    fn zero_weights_drop_rows() {
        let x = array![[1.0], [1.0], [0.0], [0.0], [0.0], [1.0]];
        let y = [1.0, 3.0, 0.0, 2.0, 100.0, 2.0];
        let fit = wls(&x, &y, Some(&[1.0, 1.0, 1.0, 1.0, 0.0, 1.0]), &names(&["t"])).unwrap();
        assert_eq!(fit.n_obs, 5);
        assert_eq!(fit.df_residual, 3);
        assert_abs_diff_eq!(fit.estimate("t").unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_negative_and_non_finite_weights() {
        let x = Array2::from_shape_vec((4, 1), vec![1.0, 0.0, 1.0, 0.0]).unwrap();
        let y = [1.0, 2.0, 3.0, 4.0];
        assert!(matches!(
            wls(&x, &y, Some(&[1.0, -1.0, 1.0, 1.0]), &names(&["t"])),
            Err(Error::Weight(WeightError::InvalidWeight { row: 1, .. }))
        ));
        assert!(wls(&x, &y, Some(&[1.0, 1.0, f64::INFINITY, 1.0]), &names(&["t"])).is_err());
    }

    #[test]
    fn constant_predictor_is_rank_deficient() {
        let x = array![[1.0], [1.0], [1.0], [1.0]];
        let y = [1.0, 2.0, 3.0, 4.0];
        assert!(matches!(wls(&x, &y, None, &names(&["t"])), Err(Error::Regression(_))));
    }

    #[test]
    fn fits_frame_columns() {
        let data = df!(
            "y" => &[2.0, 4.0, 6.0, 1.0, 2.0],
            "t" => &[1_i64, 1, 1, 0, 0],
            "w" => &[1.0, 1.0, 1.0, 2.0, 2.0]
        )
        .unwrap();
        let fit = fit(&data, "y", &["t"], Some("w")).unwrap();
        assert_abs_diff_eq!(fit.estimate("t").unwrap(), 2.5, epsilon = 1e-12);
    }
}

use polars::prelude::DataFrame;
use serde::Serialize;

use crate::data::{column_f64, treatment_indicator};
use crate::error::{MatchingError, Result};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Balance {
    pub covariate: String,
    pub mean_treated: f64,
    pub mean_control: f64,
    // Weighted mean difference over the unweighted pooled standard
    // deviation `sqrt((s²_t + s²_c) / 2)`.
    pub smd: f64,
}

fn weighted_mean(values: &[f64], weights: &[f64]) -> f64 {
    let total: f64 = weights.iter().sum();
    values.iter().zip(weights).map(|(v, w)| v * w).sum::<f64>() / total
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

// Standardized mean differences of `covariates`, optionally weighted by the
// `weights` column. Rows with zero weight still count towards the pooled
// standard deviation.
pub fn standardized_mean_differences(
    data: &DataFrame,
    treatment: &str,
    covariates: &[String],
    weights: Option<&str>,
) -> Result<Vec<Balance>> {
    let treated = treatment_indicator(data, treatment)?;
    let n_treated = treated.iter().filter(|t| **t).count();
    if n_treated < 2 {
        return Err(MatchingError::EmptyGroup { group: "treated" }.into());
    }
    if treated.len() - n_treated < 2 {
        return Err(MatchingError::EmptyGroup { group: "control" }.into());
    }
    let w = match weights {
        Some(name) => column_f64(data, name)?,
        None => vec![1.0; treated.len()],
    };

    covariates
        .iter()
        .map(|name| {
            let x = column_f64(data, name)?;
            let split = |flag: bool| -> (Vec<f64>, Vec<f64>) {
                x.iter()
                    .zip(&w)
                    .zip(&treated)
                    .filter(|(_, t)| **t == flag)
                    .map(|((x, w), _)| (*x, *w))
                    .unzip()
            };
            let (xt, wt) = split(true);
            let (xc, wc) = split(false);
            let mean_treated = weighted_mean(&xt, &wt);
            let mean_control = weighted_mean(&xc, &wc);
            let pooled = ((variance(&xt) + variance(&xc)) / 2.0).sqrt();
            let smd = if pooled > 0.0 {
                (mean_treated - mean_control) / pooled
            } else {
                0.0
            };
            Ok(Balance {
                covariate: name.clone(),
                mean_treated,
                mean_control,
                smd,
            })
        })
        .collect()
}

use polars::prelude::{DataFrame, NamedFrom, Series};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::IpwConfig;
use crate::data::{column_f64, treatment_indicator};
use crate::error::{Result, WeightError};

pub const IPW: &str = "ipw";
pub const IPW_TRUNCATED: &str = "ipw_truncated";

// Population the weights target. A run uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Estimand {
    // `T/p + (1-T)/(1-p)`
    #[default]
    Ate,
    // `T + (1-T) p/(1-p)`
    Att,
    // `T (1-p)/p + (1-T)`
    Atc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Truncation {
    None,
    // Hard cap: `min(w, c)`.
    Cap(f64),
    // Hard cap at the empirical quantile of the weights.
    Quantile(f64),
}

// Weight for a single row. `row` is only used for error reporting.
pub fn ipw_weight(
    row: usize,
    treated: bool,
    propensity: f64,
    estimand: Estimand,
) -> std::result::Result<f64, WeightError> {
    if !(propensity > 0.0 && propensity < 1.0) {
        return Err(WeightError::DegeneratePropensity { row, propensity });
    }
    let p = propensity;
    let w = match (estimand, treated) {
        (Estimand::Ate, true) => 1.0 / p,
        (Estimand::Ate, false) => 1.0 / (1.0 - p),
        (Estimand::Att, true) => 1.0,
        (Estimand::Att, false) => p / (1.0 - p),
        (Estimand::Atc, true) => (1.0 - p) / p,
        (Estimand::Atc, false) => 1.0,
    };
    if !w.is_finite() {
        return Err(WeightError::DegeneratePropensity { row, propensity });
    }
    Ok(w)
}

// Weights for every row. With `clip` set, propensities are first clamped
// to `[clip, 1 - clip]`; otherwise a score of exactly 0 or 1 is an error.
pub fn compute_weights(
    treated: &[bool],
    propensities: &[f64],
    estimand: Estimand,
    clip: Option<f64>,
) -> Result<Vec<f64>> {
    let mut clipped = 0;
    let weights = treated
        .iter()
        .zip(propensities)
        .enumerate()
        .map(|(row, (&t, &p))| {
            let p = match clip {
                Some(eps) if p.is_finite() => {
                    let c = p.clamp(eps, 1.0 - eps);
                    if c != p {
                        clipped += 1;
                    }
                    c
                }
                _ => p,
            };
            ipw_weight(row, t, p, estimand)
        })
        .collect::<std::result::Result<Vec<f64>, WeightError>>()?;
    if clipped > 0 {
        warn!(clipped, "propensity scores clipped before weighting");
    }
    Ok(weights)
}

// Cap every weight at `cap`.
pub fn truncate(weights: &[f64], cap: f64) -> Result<Vec<f64>> {
    if !(cap.is_finite() && cap > 0.0) {
        return Err(WeightError::InvalidCap { cap }.into());
    }
    Ok(weights.iter().map(|&w| w.min(cap)).collect())
}

// Empirical quantile with linear interpolation between order statistics.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let h = q * (sorted.len() - 1) as f64;
    let lo = h.floor() as usize;
    let hi = h.ceil() as usize;
    Some(sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo]))
}

pub fn apply_truncation(weights: &[f64], policy: Truncation) -> Result<Vec<f64>> {
    match policy {
        Truncation::None => Ok(weights.to_vec()),
        Truncation::Cap(cap) => truncate(weights, cap),
        Truncation::Quantile(q) => {
            let cap = quantile(weights, q).ok_or(WeightError::InvalidCap { cap: q })?;
            truncate(weights, cap)
        }
    }
}

// Attach `ipw` and `ipw_truncated` to a copy of `data`, which must already
// carry a propensity column. Without a truncation policy the two columns
// are equal.
pub fn inverse_probability_weights(
    data: &DataFrame,
    treatment: &str,
    propensity: &str,
    config: &IpwConfig,
) -> Result<DataFrame> {
    let treated = treatment_indicator(data, treatment)?;
    let scores = column_f64(data, propensity)?;
    let weights = compute_weights(&treated, &scores, config.estimand, config.clip_propensity)?;
    let policy = config.truncation()?;

    let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    info!(estimand = ?config.estimand, max_weight = max, "computed inverse probability weights");

    let truncated = apply_truncation(&weights, policy)?;
    if policy != Truncation::None {
        let capped = weights.iter().zip(&truncated).filter(|(w, t)| w != t).count();
        info!(?policy, capped, "truncated weights");
    }

    let mut out = data.clone();
    out.with_column(Series::new(IPW, weights))?;
    out.with_column(Series::new(IPW_TRUNCATED, truncated))?;
    Ok(out)
}

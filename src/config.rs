// Analysis configuration, read from TOML.
//
// Every field has a default so an empty file (or no file at all) runs the
// standard mosquito-net analysis.

use serde::Deserialize;
use std::path::Path;

use crate::error::{Error, Result};
use crate::ipw::{Estimand, Truncation};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub treatment: String,
    pub outcome: String,
    // Overrides the set derived from the causal graph when present.
    pub adjustment_set: Option<Vec<String>>,
    pub matching: MatchingConfig,
    pub propensity: PropensityConfig,
    pub ipw: IpwConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            treatment: "net_num".to_string(),
            outcome: "malaria_risk".to_string(),
            adjustment_set: None,
            matching: MatchingConfig::default(),
            propensity: PropensityConfig::default(),
            ipw: IpwConfig::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: AnalysisConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.matching.ratio == 0 {
            return Err(Error::Config("matching.ratio must be at least 1".to_string()));
        }
        if let Some(c) = self.matching.caliper {
            if !(c.is_finite() && c > 0.0) {
                return Err(Error::Config(format!("matching.caliper must be positive, got {c}")));
            }
        }
        if self.propensity.max_iterations == 0 {
            return Err(Error::Config(
                "propensity.max_iterations must be at least 1".to_string(),
            ));
        }
        if !(self.propensity.tolerance > 0.0) {
            return Err(Error::Config("propensity.tolerance must be positive".to_string()));
        }
        if let Some(set) = &self.adjustment_set {
            if set.is_empty() {
                return Err(Error::Config("adjustment_set must not be empty".to_string()));
            }
        }
        self.ipw.truncation()?;
        if let Some(eps) = self.ipw.clip_propensity {
            if !(eps > 0.0 && eps < 0.5) {
                return Err(Error::Config(format!(
                    "ipw.clip_propensity must lie in (0, 0.5), got {eps}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceKind {
    Mahalanobis,
}

// Which rows the Mahalanobis covariance is estimated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CovarianceSample {
    #[default]
    Full,
    // Pooled within-group covariance of treated and control rows.
    Pooled,
    Treated,
    Control,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    pub method: MatchMethod,
    pub distance: DistanceKind,
    pub replace: bool,
    // Number of controls matched to each treated unit.
    pub ratio: usize,
    // Maximum Mahalanobis distance for an acceptable match.
    pub caliper: Option<f64>,
    pub covariance: CovarianceSample,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        MatchingConfig {
            method: MatchMethod::Nearest,
            distance: DistanceKind::Mahalanobis,
            replace: true,
            ratio: 1,
            caliper: None,
            covariance: CovarianceSample::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Solver {
    #[default]
    Irls,
    Lbfgs,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PropensityConfig {
    pub solver: Solver,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub standardize: bool,
    // Any fitted coefficient larger than this in magnitude is treated as
    // separation.
    pub max_coefficient: f64,
}

impl Default for PropensityConfig {
    fn default() -> Self {
        PropensityConfig {
            solver: Solver::Irls,
            max_iterations: 100,
            tolerance: 1e-8,
            standardize: true,
            max_coefficient: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IpwConfig {
    pub estimand: Estimand,
    // `false` leaves the truncated weights equal to the raw ones whatever
    // the cap keys say.
    pub truncate: bool,
    pub truncate_at: Option<f64>,
    pub truncate_quantile: Option<f64>,
    pub clip_propensity: Option<f64>,
}

impl Default for IpwConfig {
    fn default() -> Self {
        IpwConfig {
            estimand: Estimand::Ate,
            truncate: true,
            truncate_at: Some(10.0),
            truncate_quantile: None,
            clip_propensity: None,
        }
    }
}

impl IpwConfig {
    // Resolve the truncation keys into a single policy. A quantile cap takes
    // precedence over the fixed cap, which always has a default, so turning
    // truncation off takes `truncate = false`.
    pub fn truncation(&self) -> Result<Truncation> {
        if !self.truncate {
            return Ok(Truncation::None);
        }
        match (self.truncate_quantile, self.truncate_at) {
            (Some(q), _) => {
                if q > 0.0 && q <= 1.0 {
                    Ok(Truncation::Quantile(q))
                } else {
                    Err(Error::Config(format!(
                        "ipw.truncate_quantile must lie in (0, 1], got {q}"
                    )))
                }
            }
            (None, Some(cap)) => {
                if cap.is_finite() && cap > 0.0 {
                    Ok(Truncation::Cap(cap))
                } else {
                    Err(Error::Config(format!("ipw.truncate_at must be positive, got {cap}")))
                }
            }
            (None, None) => Ok(Truncation::None),
        }
    }
}

// Error types for the estimation pipeline.
//
// Every failure is deterministic given identical input and configuration,
// so there is nothing to retry: callers either abort or inspect the variant.

use polars::prelude::PolarsError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Malformed or out-of-range input row.
    #[error("invalid household at row {row} (id {id}): {reason}")]
    Data { row: usize, id: String, reason: String },

    #[error("matching failed: {0}")]
    Matching(#[from] MatchingError),

    #[error("propensity model failed: {0}")]
    Convergence(#[from] ConvergenceError),

    #[error("invalid weights: {0}")]
    Weight(#[from] WeightError),

    #[error("expected {expected} covariates, got {got}")]
    Dimension { expected: usize, got: usize },

    #[error("regression failed: {0}")]
    Regression(String),

    #[error("causal graph: {0}")]
    Graph(String),

    #[error("configuration: {0}")]
    Config(String),

    // Errors bubbled up from linfa fits and transformers.
    #[error("solver: {0}")]
    Solver(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatchingError {
    // Covariance of the confounders is not positive definite.
    #[error("covariance matrix of {covariates:?} is singular; Mahalanobis distance is undefined")]
    SingularCovariance { covariates: Vec<String> },

    #[error("no treated unit could be matched to a control")]
    NoMatches,

    #[error("{group} group is empty")]
    EmptyGroup { group: &'static str },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConvergenceError {
    #[error(
        "no convergence after {iterations} iterations (max |coefficient| = {max_abs_coefficient:.3e})"
    )]
    NotConverged { iterations: usize, max_abs_coefficient: f64 },

    // Coefficients diverging because some covariate pattern predicts
    // treatment perfectly.
    #[error(
        "separation detected after {iterations} iterations (max |coefficient| = {max_abs_coefficient:.3e})"
    )]
    Separation { iterations: usize, max_abs_coefficient: f64 },

    #[error("information matrix is singular at iteration {iterations}")]
    SingularHessian { iterations: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("row {row}: propensity {propensity} is outside the open interval (0, 1)")]
    DegeneratePropensity { row: usize, propensity: f64 },

    #[error("row {row}: weight {weight} must be finite and non-negative")]
    InvalidWeight { row: usize, weight: f64 },

    #[error("truncation cap {cap} must be positive and finite")]
    InvalidCap { cap: f64 },
}

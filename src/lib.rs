// Effect of mosquito nets on malaria risk, estimated from household survey
// data by Mahalanobis nearest-neighbour matching and inverse probability
// weighting.
//
// `run_analysis` chains the stages; each module can also be used on its
// own.

pub mod balance;
pub mod config;
pub mod data;
pub mod distance;
pub mod error;
pub mod graph;
pub mod ipw;
pub mod matching;
pub mod pipeline;
pub mod propensity;
pub mod regression;
pub mod report;
pub mod simulate;

pub use config::AnalysisConfig;
pub use error::{Error, Result};
pub use pipeline::{run_analysis, Analysis};
pub use report::{CoefficientRow, Comparison, ModelKind};

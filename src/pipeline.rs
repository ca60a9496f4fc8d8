// The full analysis: adjustment set, matching, propensity weighting and the
// comparison of every model's treatment estimate.
//
// Each stage takes the frame it needs and returns a new one; the input
// frame is never modified.

use polars::prelude::DataFrame;
use tracing::{debug, info, info_span, warn};

use crate::balance::{standardized_mean_differences, Balance};
use crate::config::AnalysisConfig;
use crate::data::{treat_control_split, validate_households};
use crate::error::{Error, Result};
use crate::graph::CausalGraph;
use crate::ipw::{inverse_probability_weights, IPW, IPW_TRUNCATED};
use crate::matching::{nn_match, MatchResult, MATCH_WEIGHT};
use crate::propensity::{estimate_propensities, PropensityModel, PROPENSITY};
use crate::regression::fit;
use crate::report::{Comparison, ModelEstimate, ModelKind};

// Covariate balance at each stage of the analysis.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BalanceReport {
    pub before: Vec<Balance>,
    pub matched: Vec<Balance>,
    pub weighted: Vec<Balance>,
}

#[derive(Debug)]
pub struct Analysis {
    pub adjustment_set: Vec<String>,
    pub matches: MatchResult,
    pub propensity: PropensityModel,
    pub balance: BalanceReport,
    pub comparison: Comparison,
}

// The configured override, or the minimal backdoor set of the mosquito-net
// graph.
pub fn resolve_adjustment_set(config: &AnalysisConfig) -> Result<Vec<String>> {
    match &config.adjustment_set {
        Some(set) if set.is_empty() => Err(Error::Config("adjustment_set is empty".to_string())),
        Some(set) => Ok(set.clone()),
        None => Ok(CausalGraph::mosquito_nets()?
            .adjustment_set()?
            .into_iter()
            .collect()),
    }
}

fn balance_at(
    stage: &str,
    data: &DataFrame,
    treatment: &str,
    covariates: &[String],
    weights: Option<&str>,
) -> Vec<Balance> {
    match standardized_mean_differences(data, treatment, covariates, weights) {
        Ok(balance) => {
            for b in &balance {
                debug!(
                    stage,
                    covariate = %b.covariate,
                    mean_treated = b.mean_treated,
                    mean_control = b.mean_control,
                    smd = b.smd,
                    "balance"
                );
            }
            balance
        }
        Err(e) => {
            warn!(stage, error = %e, "balance not computed");
            Vec::new()
        }
    }
}

pub fn run_analysis(data: &DataFrame, config: &AnalysisConfig) -> Result<Analysis> {
    config.validate()?;
    let treatment = config.treatment.as_str();
    let outcome = config.outcome.as_str();
    let predictors = [treatment];

    {
        let _span = info_span!("validate", rows = data.height()).entered();
        validate_households(data)?;
        let (treat, control) = treat_control_split(data, treatment)?;
        info!(treated = treat.height(), control = control.height(), "treatment groups");
    }

    let adjustment_set = {
        let _span = info_span!("adjustment_set").entered();
        let set = resolve_adjustment_set(config)?;
        info!(covariates = ?set, overridden = config.adjustment_set.is_some(), "adjustment set");
        set
    };
    let before = balance_at("before", data, treatment, &adjustment_set, None);

    let naive = {
        let _span = info_span!("naive").entered();
        fit(data, outcome, &predictors, None)?
    };

    let (matches, matched, matched_weighted, matched_balance) = {
        let _span = info_span!("matching", replace = config.matching.replace).entered();
        let matches = nn_match(data, treatment, &adjustment_set, &config.matching)?;
        let matched_data = matches.matched_frame(data)?;
        let matched = fit(&matched_data, outcome, &predictors, None)?;
        let weighted = fit(&matched_data, outcome, &predictors, Some(MATCH_WEIGHT))?;
        let balance = balance_at(
            "matched",
            &matched_data,
            treatment,
            &adjustment_set,
            Some(MATCH_WEIGHT),
        );
        (matches, matched, weighted, balance)
    };

    let (scored, propensity) = {
        let _span = info_span!("propensity", solver = ?config.propensity.solver).entered();
        estimate_propensities(data, treatment, &adjustment_set, &config.propensity)?
    };

    let (ipw, ipw_truncated, weighted_balance) = {
        let _span = info_span!("ipw", estimand = ?config.ipw.estimand).entered();
        let weighted = inverse_probability_weights(&scored, treatment, PROPENSITY, &config.ipw)?;
        let raw = fit(&weighted, outcome, &predictors, Some(IPW))?;
        let truncated = fit(&weighted, outcome, &predictors, Some(IPW_TRUNCATED))?;
        let balance = balance_at("weighted", &weighted, treatment, &adjustment_set, Some(IPW));
        (raw, truncated, balance)
    };

    let comparison = Comparison::new(
        treatment,
        vec![
            ModelEstimate { kind: ModelKind::Naive, fit: naive },
            ModelEstimate { kind: ModelKind::Matched, fit: matched },
            ModelEstimate { kind: ModelKind::MatchedWeighted, fit: matched_weighted },
            ModelEstimate { kind: ModelKind::Ipw, fit: ipw },
            ModelEstimate { kind: ModelKind::IpwTruncated, fit: ipw_truncated },
        ],
    );
    for kind in ModelKind::ALL {
        if let Some(effect) = comparison.treatment_effect(kind) {
            info!(
                model = kind.name(),
                estimate = effect.estimate,
                std_error = effect.std_error,
                "treatment effect"
            );
        }
    }

    Ok(Analysis {
        adjustment_set,
        matches,
        propensity,
        balance: BalanceReport {
            before,
            matched: matched_balance,
            weighted: weighted_balance,
        },
        comparison,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_supplies_default_adjustment_set() {
        let set = resolve_adjustment_set(&AnalysisConfig::default()).unwrap();
        assert_eq!(set, vec!["health", "income", "temperature"]);
    }

    #[test]
    fn override_replaces_graph_set() {
        let config = AnalysisConfig {
            adjustment_set: Some(vec!["income".to_string()]),
            ..AnalysisConfig::default()
        };
        assert_eq!(resolve_adjustment_set(&config).unwrap(), vec!["income"]);
        let empty = AnalysisConfig {
            adjustment_set: Some(Vec::new()),
            ..AnalysisConfig::default()
        };
        assert!(matches!(resolve_adjustment_set(&empty), Err(Error::Config(_))));
    }
}

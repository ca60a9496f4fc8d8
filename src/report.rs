use serde::Serialize;
use std::fmt;

use crate::error::Result;
use crate::regression::{Coefficient, RegressionFit};

// The models compared in a run, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ModelKind {
    Naive,
    Matched,
    MatchedWeighted,
    Ipw,
    IpwTruncated,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Naive,
        ModelKind::Matched,
        ModelKind::MatchedWeighted,
        ModelKind::Ipw,
        ModelKind::IpwTruncated,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Naive => "Naive",
            ModelKind::Matched => "Matched",
            ModelKind::MatchedWeighted => "Matched+weights",
            ModelKind::Ipw => "IPW",
            ModelKind::IpwTruncated => "IPW-truncated",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// One line of the comparison table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoefficientRow {
    pub model_name: String,
    pub term: String,
    pub estimate: f64,
    pub std_error: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEstimate {
    pub kind: ModelKind,
    pub fit: RegressionFit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    treatment: String,
    models: Vec<ModelEstimate>,
}

impl Comparison {
    // Models are reordered into `ModelKind::ALL` order whatever order
    // they arrive in.
    pub fn new(treatment: &str, mut models: Vec<ModelEstimate>) -> Self {
        models.sort_by_key(|m| m.kind);
        Comparison {
            treatment: treatment.to_string(),
            models,
        }
    }

    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    pub fn models(&self) -> &[ModelEstimate] {
        &self.models
    }

    pub fn fit(&self, kind: ModelKind) -> Option<&RegressionFit> {
        self.models.iter().find(|m| m.kind == kind).map(|m| &m.fit)
    }

    // The treatment coefficient of one model.
    pub fn treatment_effect(&self, kind: ModelKind) -> Option<&Coefficient> {
        self.fit(kind).and_then(|fit| fit.term(&self.treatment))
    }

    pub fn rows(&self) -> Vec<CoefficientRow> {
        self.models
            .iter()
            .flat_map(|m| {
                m.fit.coefficients.iter().map(move |c| CoefficientRow {
                    model_name: m.kind.name().to_string(),
                    term: c.term.clone(),
                    estimate: c.estimate,
                    std_error: c.std_error,
                })
            })
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.rows())?)
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "NETFX ========================================\n\n\
            Treatment: {}\n\n\
            {:<16} {:<14} {:>10} {:>10} {:>8}\n",
            self.treatment, "Model", "Term", "Estimate", "Std. Err.", "N"
        )?;
        for m in &self.models {
            for c in &m.fit.coefficients {
                writeln!(
                    f,
                    "{:<16} {:<14} {:>10.3} {:>10.3} {:>8}",
                    m.kind.name(),
                    c.term,
                    c.estimate,
                    c.std_error,
                    m.fit.n_obs
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::wls;
    use ndarray::array;

    fn fit(shift: f64) -> RegressionFit {
        let x = array![[1.0], [1.0], [1.0], [0.0], [0.0], [0.0]];
        let y = [1.0 + shift, 2.0 + shift, 3.0 + shift, 1.0, 2.0, 4.0];
        wls(&x, &y, None, &["net_num".to_string()]).unwrap()
    }

    fn comparison() -> Comparison {
        let models = vec![
            ModelEstimate { kind: ModelKind::Ipw, fit: fit(3.0) },
            ModelEstimate { kind: ModelKind::Naive, fit: fit(1.0) },
            ModelEstimate { kind: ModelKind::Matched, fit: fit(2.0) },
        ];
        Comparison::new("net_num", models)
    }

    #[test]
    fn models_come_out_in_fixed_order() {
        let kinds: Vec<ModelKind> = comparison().models().iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![ModelKind::Naive, ModelKind::Matched, ModelKind::Ipw]);
        let names: Vec<&str> = ModelKind::ALL.iter().map(|k| k.name()).collect();
        assert_eq!(
            names,
            vec!["Naive", "Matched", "Matched+weights", "IPW", "IPW-truncated"]
        );
    }

    #[test]
    fn rows_carry_every_term() {
        let rows = comparison().rows();
        assert_eq!(rows.len(), 6);
        assert_eq!(rows[0].model_name, "Naive");
        assert_eq!(rows[0].term, "(Intercept)");
        assert_eq!(rows[1].term, "net_num");
        assert_eq!(rows[5].model_name, "IPW");
    }

    #[test]
    fn treatment_effect_reads_the_treatment_term() {
        let c = comparison();
        let naive = c.treatment_effect(ModelKind::Naive).unwrap();
        assert!((naive.estimate - (2.0 - 7.0 / 3.0 + 1.0)).abs() < 1e-12);
        assert!(c.treatment_effect(ModelKind::IpwTruncated).is_none());
    }

    #[test]
    fn json_and_text_output() {
        let c = comparison();
        let json: serde_json::Value = serde_json::from_str(&c.to_json().unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 6);
        assert_eq!(json[3]["model_name"], "Matched");
        let text = c.to_string();
        assert!(text.starts_with("NETFX"));
        assert!(text.contains("Matched"));
    }
}

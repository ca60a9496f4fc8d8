use linfa::dataset::Dataset;
use linfa::traits::{Fit, Transformer};
use linfa_logistic::LogisticRegression;
use linfa_preprocessing::linear_scaling::LinearScaler;
use nalgebra::{Cholesky, DMatrix, DVector};
use ndarray::{s, Array1, Array2, Axis};
use polars::prelude::{DataFrame, NamedFrom, Series};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::{PropensityConfig, Solver};
use crate::data::{covariate_matrix, treatment_indicator};
use crate::error::{ConvergenceError, Error, Result};
use crate::regression::INTERCEPT;

pub const PROPENSITY: &str = "propensity";

// Fitted probabilities this close to the observed class count as perfectly
// predicted.
const SATURATION: f64 = 1e-10;

// Largest per-observation score an L-BFGS fit may leave behind.
const LBFGS_SCORE_TOLERANCE: f64 = 1e-3;

// Per-observation gradient norm at which linfa's L-BFGS stops. linfa sums
// the loss over rows, so this is scaled by n before being handed over.
const LBFGS_GRADIENT_TOLERANCE: f64 = 1e-6;

const MAX_STEP_HALVINGS: usize = 30;

// A fitted logistic model of treatment given the confounders.
//
// When fitted on standardized confounders the scaler is kept and applied to
// every prediction, so callers always pass raw covariate values.
pub struct PropensityModel {
    names: Vec<String>,
    intercept: f64,
    coefficients: Array1<f64>,
    scaler: Option<LinearScaler<f64>>,
    solver: Solver,
    iterations: Option<usize>,
}

impl fmt::Debug for PropensityModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PropensityModel")
            .field("names", &self.names)
            .field("intercept", &self.intercept)
            .field("coefficients", &self.coefficients)
            .field("standardized", &self.scaler.is_some())
            .field("solver", &self.solver)
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl PropensityModel {
    // `(term, value)` pairs, intercept first. Values are on the
    // standardized scale when the model was fitted with a scaler.
    pub fn coefficients(&self) -> Vec<(String, f64)> {
        terms(&self.names, self.intercept, &self.coefficients)
    }

    // Coefficients on the scale of the raw covariates. The scaler maps
    // `x` to `(x - offset) * scale`, so each slope picks up its scale and
    // the intercept absorbs the offsets.
    pub fn raw_coefficients(&self) -> Vec<(String, f64)> {
        match &self.scaler {
            Some(scaler) => {
                let slopes = &self.coefficients * scaler.scales();
                let intercept = self.intercept - slopes.dot(scaler.offsets());
                terms(&self.names, intercept, &slopes)
            }
            None => self.coefficients(),
        }
    }

    pub fn is_standardized(&self) -> bool {
        self.scaler.is_some()
    }

    // Solver iterations, when the solver reports them.
    pub fn iterations(&self) -> Option<usize> {
        self.iterations
    }

    pub fn solver(&self) -> Solver {
        self.solver
    }

    pub fn covariates(&self) -> &[String] {
        &self.names
    }

    // `P(treated | x)` for every row of raw covariates.
    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        Ok(self.linear_predictor(x)?.mapv(sigmoid))
    }

    // Probability for a single covariate vector.
    pub fn predict_one(&self, x: &[f64]) -> Result<f64> {
        let row = Array2::from_shape_fn((1, x.len()), |(_, j)| x[j]);
        Ok(self.predict(&row)?[0])
    }

    fn linear_predictor(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.names.len() {
            return Err(Error::Dimension {
                expected: self.names.len(),
                got: x.ncols(),
            });
        }
        let x = match &self.scaler {
            Some(scaler) => scaler.transform(x.to_owned()),
            None => x.to_owned(),
        };
        Ok(x.dot(&self.coefficients) + self.intercept)
    }
}

fn terms(names: &[String], intercept: f64, slopes: &Array1<f64>) -> Vec<(String, f64)> {
    std::iter::once((INTERCEPT.to_string(), intercept))
        .chain(names.iter().cloned().zip(slopes.iter().copied()))
        .collect()
}

pub fn sigmoid(eta: f64) -> f64 {
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

// log(1 + exp(x)) without overflow.
fn log1pexp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

// Binomial deviance at linear predictor `eta`.
fn deviance(eta: &Array1<f64>, t: &[bool]) -> f64 {
    2.0 * eta
        .iter()
        .zip(t)
        .map(|(&e, &t)| if t { log1pexp(-e) } else { log1pexp(e) })
        .sum::<f64>()
}

fn with_intercept(x: &Array2<f64>) -> Array2<f64> {
    let mut design = Array2::ones((x.nrows(), x.ncols() + 1));
    design.slice_mut(s![.., 1..]).assign(x);
    design
}

fn max_abs(beta: &Array1<f64>) -> f64 {
    beta.iter().fold(0.0_f64, |m, b| if b.is_finite() { m.max(b.abs()) } else { f64::INFINITY })
}

// Separation check shared by both solvers
//
// Diverging or huge coefficients, or a model that predicts every
// observation's class to within SATURATION, mean some covariate pattern
// separates treated from control and the MLE does not exist.
fn check_separation(
    design: &Array2<f64>,
    t: &[bool],
    beta: &Array1<f64>,
    iterations: usize,
    config: &PropensityConfig,
) -> Result<()> {
    let max_abs_coefficient = max_abs(beta);
    let eta = design.dot(beta);
    let saturated = eta.iter().zip(t).all(|(&e, &t)| {
        let p = sigmoid(e);
        if t {
            1.0 - p < SATURATION
        } else {
            p < SATURATION
        }
    });
    if !max_abs_coefficient.is_finite() || max_abs_coefficient > config.max_coefficient || saturated {
        warn!(iterations, max_abs_coefficient, "propensity model shows separation");
        return Err(ConvergenceError::Separation {
            iterations,
            max_abs_coefficient,
        }
        .into());
    }
    Ok(())
}

// Newton-Raphson / IRLS on the Bernoulli log-likelihood. Steps are halved
// whenever the deviance would increase. Converged once the relative change
// in deviance falls below the tolerance.
fn fit_irls(design: &Array2<f64>, t: &[bool], config: &PropensityConfig) -> Result<(Array1<f64>, usize)> {
    let (n, p) = design.dim();
    let y: Array1<f64> = t.iter().map(|&t| if t { 1.0 } else { 0.0 }).collect();
    let mut beta = Array1::<f64>::zeros(p);
    let mut dev = deviance(&design.dot(&beta), t);

    for iteration in 1..=config.max_iterations {
        let eta = design.dot(&beta);
        let mu = eta.mapv(sigmoid);
        let w = &mu * &(1.0 - &mu);

        let mut info = DMatrix::<f64>::zeros(p, p);
        let mut score = DVector::<f64>::zeros(p);
        for i in 0..n {
            let row = design.row(i);
            let r = y[i] - mu[i];
            for a in 0..p {
                score[a] += row[a] * r;
                for b in 0..p {
                    info[(a, b)] += w[i] * row[a] * row[b];
                }
            }
        }
        let step = match Cholesky::new(info) {
            Some(chol) => chol.solve(&score),
            None => {
                check_separation(design, t, &beta, iteration, config)?;
                return Err(ConvergenceError::SingularHessian { iterations: iteration }.into());
            }
        };
        let step = Array1::from_iter(step.iter().copied());

        let mut scale = 1.0;
        let mut candidate = &beta + &step;
        let mut candidate_dev = deviance(&design.dot(&candidate), t);
        let mut halvings = 0;
        while !(candidate_dev.is_finite() && candidate_dev <= dev) && halvings < MAX_STEP_HALVINGS {
            scale *= 0.5;
            candidate = &beta + &(&step * scale);
            candidate_dev = deviance(&design.dot(&candidate), t);
            halvings += 1;
        }
        beta = candidate;
        debug!(iteration, deviance = candidate_dev, halvings, "irls step");

        check_separation(design, t, &beta, iteration, config)?;
        let converged = (dev - candidate_dev).abs() / (candidate_dev.abs() + 0.1) < config.tolerance;
        dev = candidate_dev;
        if converged {
            return Ok((beta, iteration));
        }
    }
    Err(ConvergenceError::NotConverged {
        iterations: config.max_iterations,
        max_abs_coefficient: max_abs(&beta),
    }
    .into())
}

// Unpenalized L-BFGS fit through linfa-logistic. linfa does not report
// whether its optimizer converged, so the score equations are checked here.
//
// linfa-logistic 0.6 assigns its -1/+1 targets by flipping the sign each
// time the label differs from the last class it has seen, which only comes
// out right when rows arrive grouped by class. Controls go first, so the
// smaller label (0) is the negative class and the fitted parameters
// describe P(treated).
fn fit_lbfgs(x: &Array2<f64>, t: &[bool], config: &PropensityConfig) -> Result<Array1<f64>> {
    let order: Vec<usize> = (0..t.len())
        .filter(|&i| !t[i])
        .chain((0..t.len()).filter(|&i| t[i]))
        .collect();
    let targets: Array1<i64> = order.iter().map(|&i| t[i] as i64).collect();
    let train = Dataset::new(x.select(Axis(0), &order), targets);
    let model = LogisticRegression::default()
        .with_intercept(true)
        .alpha(0.0)
        .max_iterations(config.max_iterations as u64)
        .gradient_tolerance(x.nrows() as f64 * LBFGS_GRADIENT_TOLERANCE)
        .fit(&train)
        .map_err(|e| Error::Solver(e.to_string()))?;

    let mut beta = Array1::zeros(x.ncols() + 1);
    beta[0] = model.intercept();
    beta.slice_mut(s![1..]).assign(model.params());

    let design = with_intercept(x);
    let mu = design.dot(&beta).mapv(sigmoid);
    let residual: Array1<f64> = t.iter().zip(mu.iter()).map(|(&t, &m)| t as u8 as f64 - m).collect();
    let score = design.t().dot(&residual) / x.nrows() as f64;
    let worst = score.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
    debug!(worst_score = worst, "lbfgs fit");
    if !(worst < LBFGS_SCORE_TOLERANCE) {
        return Err(ConvergenceError::NotConverged {
            iterations: config.max_iterations,
            max_abs_coefficient: max_abs(&beta),
        }
        .into());
    }
    Ok(beta)
}

// Fit `treatment ~ confounders` by maximum likelihood.
pub fn fit_logistic(
    x: &Array2<f64>,
    t: &[bool],
    names: &[String],
    config: &PropensityConfig,
) -> Result<PropensityModel> {
    if x.nrows() != t.len() || x.ncols() != names.len() {
        return Err(Error::Solver(format!(
            "design is {}x{} but {} labels and {} names were given",
            x.nrows(),
            x.ncols(),
            t.len(),
            names.len()
        )));
    }
    let n_treated = t.iter().filter(|t| **t).count();
    if n_treated == 0 || n_treated == t.len() {
        // an all-one or all-zero outcome drives the intercept to infinity
        return Err(ConvergenceError::Separation {
            iterations: 0,
            max_abs_coefficient: f64::INFINITY,
        }
        .into());
    }

    let scaler = if config.standardize {
        let labels: Array1<usize> = t.iter().map(|&t| t as usize).collect();
        let dataset = Dataset::new(x.clone(), labels);
        Some(
            LinearScaler::standard()
                .fit(&dataset)
                .map_err(|e| Error::Solver(e.to_string()))?,
        )
    } else {
        None
    };
    let xs = match &scaler {
        Some(s) => s.transform(x.clone()),
        None => x.clone(),
    };
    let design = with_intercept(&xs);

    let (beta, iterations) = match config.solver {
        Solver::Irls => {
            let (beta, iterations) = fit_irls(&design, t, config)?;
            (beta, Some(iterations))
        }
        Solver::Lbfgs => {
            let beta = fit_lbfgs(&xs, t, config)?;
            check_separation(&design, t, &beta, config.max_iterations, config)?;
            (beta, None)
        }
    };

    let model = PropensityModel {
        names: names.to_vec(),
        intercept: beta[0],
        coefficients: beta.slice(s![1..]).to_owned(),
        scaler,
        solver: config.solver,
        iterations,
    };
    info!(
        solver = ?config.solver,
        iterations = ?model.iterations,
        coefficients = ?model.raw_coefficients(),
        "fitted propensity model"
    );
    Ok(model)
}

pub fn fit_propensity(
    data: &DataFrame,
    treatment: &str,
    confounders: &[String],
    config: &PropensityConfig,
) -> Result<PropensityModel> {
    let x = covariate_matrix(data, confounders)?;
    let t = treatment_indicator(data, treatment)?;
    fit_logistic(&x, &t, confounders, config)
}

// Estimate propensity scores
//
// Fits the propensity model on `confounders` and returns a copy of `data`
// with a `propensity` column next to the fitted model.
pub fn estimate_propensities(
    data: &DataFrame,
    treatment: &str,
    confounders: &[String],
    config: &PropensityConfig,
) -> Result<(DataFrame, PropensityModel)> {
    let model = fit_propensity(data, treatment, confounders, config)?;
    let x = covariate_matrix(data, confounders)?;
    let scores = model.predict(&x)?;
    let range = scores
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(*p), hi.max(*p)));
    debug!(min = range.0, max = range.1, mean = ?scores.mean(), "propensity range");

    let mut out = data.clone();
    out.with_column(Series::new(PROPENSITY, scores.to_vec()))?;
    Ok((out, model))
}

// Synthetic household surveys with a known net effect.
//
// Income, health and temperature push both net use and malaria risk, so a
// naive comparison of households with and without nets is confounded.
// Resistance only moves risk; household size and income set eligibility.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::data::Household;
use crate::error::{Error, Result};
use crate::propensity::sigmoid;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub n: usize,
    pub seed: u64,
    // Change in malaria risk caused by using a net.
    pub effect: f64,
    // When false, net use is a coin flip independent of every covariate.
    pub confounding: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            n: 2000,
            seed: 1234,
            effect: -10.0,
            confounding: true,
        }
    }
}

fn normal(mean: f64, sd: f64) -> Result<Normal<f64>> {
    Normal::new(mean, sd).map_err(|e| Error::Config(format!("normal({mean}, {sd}): {e}")))
}

pub fn simulate_households(config: &SimulationConfig) -> Result<Vec<Household>> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let income_dist = normal(900.0, 200.0)?;
    let temperature_dist = normal(24.0, 4.0)?;
    let health_noise = normal(0.0, 10.0)?;
    let risk_noise = normal(0.0, 4.0)?;

    let mut households = Vec::with_capacity(config.n);
    for i in 0..config.n {
        let income = income_dist.sample(&mut rng).max(100.0);
        let temperature = temperature_dist.sample(&mut rng);
        let health = (50.0 + 0.02 * (income - 900.0) + health_noise.sample(&mut rng)).clamp(0.0, 100.0);
        let household_size: i64 = rng.gen_range(1..=8);
        let resistance: f64 = rng.gen_range(10.0..90.0);
        let eligible = income < 700.0 && household_size >= 4;

        let p_net = if config.confounding {
            sigmoid(
                -0.3 + 0.003 * (income - 900.0) + 0.02 * (health - 50.0)
                    - 0.1 * (temperature - 24.0),
            )
        } else {
            0.4
        };
        let net = rng.gen_bool(p_net);

        let treated_shift = if net { config.effect } else { 0.0 };
        let risk = 40.0 + treated_shift - 0.05 * (income - 900.0) - 0.25 * (health - 50.0)
            + 1.5 * (temperature - 24.0)
            + 0.1 * (resistance - 50.0)
            + risk_noise.sample(&mut rng);

        households.push(Household {
            id: i as i64 + 1,
            malaria_risk: risk.clamp(0.0, 100.0),
            net,
            eligible,
            income,
            temperature,
            health,
            household_size,
            resistance,
        });
    }
    Ok(households)
}

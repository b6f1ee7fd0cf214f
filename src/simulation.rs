//! Synthetic GIV panels generated from a market-clearing model.
//!
//! Every entity `i` demands `q_it = c_i p_t + x_itᵀβ + λ_iᵀη_t + u_it`, and the
//! common price `p_t` adjusts so that size-weighted demand sums to zero in every
//! period. Idiosyncratic shocks of large entities therefore move the price,
//! which is the variation the estimator exploits.

use log::debug;
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::panel::{Observation, Panel, PanelBuilder};

/// Parameters of the simulated economy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimParam {
    pub n_entities: usize,
    pub n_time: usize,
    /// Number of latent common factors.
    pub n_factors: usize,
    /// Cross-sectional mean of the price coefficients.
    pub mean_coefficient: f64,
    /// Log-scale dispersion of the price coefficients; each keeps the sign of the mean.
    pub coefficient_dispersion: f64,
    /// Power-law exponent of the size distribution; zero gives equal sizes.
    pub size_concentration: f64,
    /// Scale of the idiosyncratic shocks; entity `i` gets a multiple between 0.5 and 1.5.
    pub idiosyncratic_scale: f64,
    /// Standard deviation of each factor.
    pub factor_scale: f64,
    /// Number of pooled exogenous regressors, named `x1`, `x2`, ...
    pub n_exogenous: usize,
    /// Share of cells whose outcome is marked missing.
    pub missing_share: f64,
    pub seed: u64,
}

impl Default for SimParam {
    fn default() -> Self {
        Self {
            n_entities: 10,
            n_time: 100,
            n_factors: 2,
            mean_coefficient: -2.0,
            coefficient_dispersion: 0.5,
            size_concentration: 1.0,
            idiosyncratic_scale: 1.0,
            factor_scale: 1.0,
            n_exogenous: 0,
            missing_share: 0.0,
            seed: 42,
        }
    }
}

impl SimParam {
    pub fn with_entities(mut self, n_entities: usize) -> Self {
        self.n_entities = n_entities;
        self
    }

    pub fn with_periods(mut self, n_time: usize) -> Self {
        self.n_time = n_time;
        self
    }

    pub fn with_factors(mut self, n_factors: usize) -> Self {
        self.n_factors = n_factors;
        self
    }

    pub fn with_mean_coefficient(mut self, mean: f64) -> Self {
        self.mean_coefficient = mean;
        self
    }

    pub fn with_dispersion(mut self, dispersion: f64) -> Self {
        self.coefficient_dispersion = dispersion;
        self
    }

    pub fn with_size_concentration(mut self, concentration: f64) -> Self {
        self.size_concentration = concentration;
        self
    }

    pub fn with_idiosyncratic_scale(mut self, scale: f64) -> Self {
        self.idiosyncratic_scale = scale;
        self
    }

    pub fn with_factor_scale(mut self, scale: f64) -> Self {
        self.factor_scale = scale;
        self
    }

    pub fn with_exogenous(mut self, n_exogenous: usize) -> Self {
        self.n_exogenous = n_exogenous;
        self
    }

    pub fn with_missing_share(mut self, share: f64) -> Self {
        self.missing_share = share;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.n_entities < 2 || self.n_time < 2 {
            return Err(GivError::invalid_configuration(
                "simulation needs at least two entities and two periods",
            ));
        }
        if self.n_factors >= self.n_entities.min(self.n_time) {
            return Err(GivError::InvalidFactorCount {
                requested: self.n_factors,
                max: self.n_entities.min(self.n_time) - 1,
            });
        }
        if !(0.0..1.0).contains(&self.missing_share) {
            return Err(GivError::invalid_configuration(format!(
                "missing_share must lie in [0, 1), found {}",
                self.missing_share
            )));
        }
        let scales = [
            self.mean_coefficient,
            self.coefficient_dispersion,
            self.size_concentration,
            self.idiosyncratic_scale,
            self.factor_scale,
        ];
        if scales.iter().any(|value| !value.is_finite()) {
            return Err(GivError::invalid_configuration(
                "simulation parameters must be finite",
            ));
        }
        Ok(())
    }
}

/// A simulated panel together with the parameters that generated it.
#[derive(Clone, Debug)]
pub struct SimulatedPanel {
    pub panel: Panel,
    /// True price coefficient of every entity.
    pub coefficients: DVector<f64>,
    /// True pooled coefficients, one per exogenous regressor.
    pub pooled_coefficients: DVector<f64>,
    /// Size weights, summing to one.
    pub weights: DVector<f64>,
    /// Factor values, `time × factor`.
    pub factors: DMatrix<f64>,
    /// Factor loadings, `entity × factor`.
    pub loadings: DMatrix<f64>,
}

/// Draws a panel from the market-clearing model described by `param`.
pub fn simulate_data(param: &SimParam) -> Result<SimulatedPanel> {
    param.validate()?;
    let n = param.n_entities;
    let t = param.n_time;
    let k = param.n_factors;
    let mut rng = SmallRng::seed_from_u64(param.seed);

    let raw_sizes = DVector::from_fn(n, |i, _| ((i + 1) as f64).powf(-param.size_concentration));
    let weights = &raw_sizes / raw_sizes.sum();

    let coefficients = DVector::from_fn(n, |_, _| {
        let draw: f64 = StandardNormal.sample(&mut rng);
        let dispersion = param.coefficient_dispersion;
        param.mean_coefficient * (dispersion * draw - 0.5 * dispersion * dispersion).exp()
    });
    let aggregate = weights.dot(&coefficients);
    if aggregate.abs() < 1e-8 {
        return Err(GivError::invalid_configuration(
            "size-weighted price coefficient is zero, so the market cannot clear",
        ));
    }

    let factors =
        orthonormal_columns(&mut rng, t, k, true) * (param.factor_scale * (t as f64).sqrt());
    let loadings = orthonormal_columns(&mut rng, n, k, false) * (n as f64).sqrt();
    let pooled_coefficients = DVector::from_fn(param.n_exogenous, |j, _| 0.5 * (j + 1) as f64);
    let exogenous: Vec<DMatrix<f64>> = (0..param.n_exogenous)
        .map(|_| gaussian(&mut rng, n, t))
        .collect();
    let shocks = gaussian(&mut rng, n, t);

    // Demand at a zero price, then the price that clears the market.
    let mut demand_shift = &loadings * factors.transpose();
    for i in 0..n {
        let scale = param.idiosyncratic_scale * (0.5 + i as f64 / n as f64);
        for s in 0..t {
            let exog: f64 = exogenous
                .iter()
                .zip(pooled_coefficients.iter())
                .map(|(x, beta)| beta * x[(i, s)])
                .sum();
            demand_shift[(i, s)] += exog + scale * shocks[(i, s)];
        }
    }
    let prices = DVector::from_fn(t, |s, _| -weights.dot(&demand_shift.column(s)) / aggregate);
    debug!(
        "simulated {n}x{t} panel with {k} factors, aggregate coefficient {:.4}",
        aggregate
    );

    let names: Vec<String> = (1..=param.n_exogenous).map(|j| format!("x{j}")).collect();
    let mut rows = Vec::with_capacity(n * t);
    for i in 0..n {
        for s in 0..t {
            let mut outcome = coefficients[i] * prices[s] + demand_shift[(i, s)];
            if param.missing_share > 0.0 && rng.gen::<f64>() < param.missing_share {
                outcome = f64::NAN;
            }
            let values = exogenous.iter().map(|x| x[(i, s)]).collect();
            let id = (i + 1).to_string();
            rows.push(
                Observation::new(id, (s + 1) as i64, outcome, prices[s], weights[i])
                    .with_exogenous(values),
            );
        }
    }
    let panel = PanelBuilder::new(names).observations(rows).build()?;

    Ok(SimulatedPanel {
        panel,
        coefficients,
        pooled_coefficients,
        weights,
        factors,
        loadings,
    })
}

fn gaussian(rng: &mut SmallRng, rows: usize, columns: usize) -> DMatrix<f64> {
    DMatrix::from_fn(rows, columns, |_, _| StandardNormal.sample(&mut *rng))
}

/// `rows × columns` matrix with orthonormal (and optionally zero-mean) columns.
fn orthonormal_columns(
    rng: &mut SmallRng,
    rows: usize,
    columns: usize,
    centered: bool,
) -> DMatrix<f64> {
    if columns == 0 {
        return DMatrix::<f64>::zeros(rows, 0);
    }
    let mut draws = gaussian(rng, rows, columns);
    if centered {
        for mut column in draws.column_iter_mut() {
            let mean = column.mean();
            column.add_scalar_mut(-mean);
        }
    }
    draws.qr().q()
}

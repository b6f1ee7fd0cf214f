//! GIV moment conditions built from leave-one-out peer instruments.
//!
//! For every active entity `i` the outcome, price and pooled regressors are
//! projected off the entity-specific design (fixed effect, entity-specific
//! exogenous terms and factor values), so the entity-specific coefficients never
//! enter the moment equations. Pooled coefficients are concentrated out by
//! size-weighted least squares, which leaves the price coefficients as the only
//! unknowns. The instrument of entity `i` is the weighted sum of every *other*
//! entity's residual in the same period, and the moment is its cross product
//! with entity `i`'s own residual.
//!
//! Instruments either move with the coefficients, which makes the moments
//! quadratic, or are held at their values under a starting point, which makes
//! the system linear and its root a closed-form IV estimate.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::formula::{FormulaSpec, ResolvedFormula};
use crate::heteropca::FactorModel;
use crate::panel::Panel;

/// Relative size below which an entity's price is considered uninstrumented.
const WEAK_INSTRUMENT_RATIO: f64 = 1e-10;

/// How peer residuals are aggregated into an instrument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerWeighting {
    /// Peers weighted by their size weight `S`.
    Size,
    /// Every active peer weighted equally.
    Equal,
}

/// Observed data of one entity and its entity-specific design.
#[derive(Clone, Debug)]
struct EntityBlock {
    entity: usize,
    periods: Vec<usize>,
    design: DMatrix<f64>,
    gram_inverse: DMatrix<f64>,
    outcome: DVector<f64>,
    price: DVector<f64>,
    pooled: DMatrix<f64>,
}

impl EntityBlock {
    fn new(
        panel: &Panel,
        formula: &ResolvedFormula,
        factors: Option<&FactorModel>,
        entity: usize,
    ) -> Result<Self> {
        let periods: Vec<usize> = (0..panel.time_count())
            .filter(|&t| panel.is_observed(entity, t))
            .collect();
        let n_pcs = factors.map_or(0, FactorModel::n_pcs);
        let width = usize::from(formula.fixed_effects) + formula.entity_specific.len() + n_pcs;
        let singular = || GivError::singular_entity(panel.entity_ids()[entity].clone());

        if periods.len() <= width {
            return Err(singular());
        }

        let offset = usize::from(formula.fixed_effects);
        let design = DMatrix::from_fn(periods.len(), width, |row, column| {
            let t = periods[row];
            if column < offset {
                1.0
            } else if column < offset + formula.entity_specific.len() {
                panel.exogenous(formula.entity_specific[column - offset])[(entity, t)]
            } else {
                let k = column - offset - formula.entity_specific.len();
                factors.map_or(0.0, |model| model.factors()[(t, k)])
            }
        });

        let gram_inverse = if width == 0 {
            DMatrix::<f64>::zeros(0, 0)
        } else {
            Cholesky::new(design.transpose() * &design)
                .ok_or_else(singular)?
                .inverse()
        };

        let outcome = DVector::from_iterator(
            periods.len(),
            periods.iter().map(|&t| panel.outcome()[(entity, t)]),
        );
        let price = DVector::from_iterator(
            periods.len(),
            periods.iter().map(|&t| panel.price()[(entity, t)]),
        );
        let pooled = DMatrix::from_fn(periods.len(), formula.pooled.len(), |row, column| {
            panel.exogenous(formula.pooled[column])[(entity, periods[row])]
        });

        Ok(Self {
            entity,
            periods,
            design,
            gram_inverse,
            outcome,
            price,
            pooled,
        })
    }

    /// Residual of `v` after least squares on the entity-specific design.
    fn project(&self, v: &DVector<f64>) -> DVector<f64> {
        if self.design.ncols() == 0 {
            return v.clone();
        }
        let coefficients = &self.gram_inverse * (self.design.transpose() * v);
        v - &self.design * coefficients
    }

    /// Entity-specific coefficients for the target `v`.
    fn coefficients(&self, v: &DVector<f64>) -> DVector<f64> {
        if self.design.ncols() == 0 {
            return DVector::<f64>::zeros(0);
        }
        &self.gram_inverse * (self.design.transpose() * v)
    }
}

/// Moments, residuals and instruments evaluated at one coefficient vector.
#[derive(Clone, Debug)]
pub struct MomentEvaluation {
    pub(crate) coefficients: DVector<f64>,
    pub(crate) pooled: DVector<f64>,
    pub(crate) residuals: DMatrix<f64>,
    pub(crate) instruments: Vec<DMatrix<f64>>,
    pub(crate) moments: DVector<f64>,
}

impl MomentEvaluation {
    /// Stacked moment conditions (entity-major, then peer weighting).
    pub fn moments(&self) -> &DVector<f64> {
        &self.moments
    }

    /// Price coefficient of each active entity.
    pub fn coefficients(&self) -> &DVector<f64> {
        &self.coefficients
    }

    /// Concentrated pooled coefficients.
    pub fn pooled(&self) -> &DVector<f64> {
        &self.pooled
    }

    /// Projected residuals, `active entity × time`, zero where unobserved.
    pub fn residuals(&self) -> &DMatrix<f64> {
        &self.residuals
    }

    /// Leave-one-out instruments for the `index`-th peer weighting.
    pub fn instruments(&self, index: usize) -> &DMatrix<f64> {
        &self.instruments[index]
    }
}

/// Coefficients and residuals mapped back onto the full panel.
#[derive(Clone, Debug)]
pub(crate) struct Recovery {
    /// Price coefficient per entity, `NaN` for excluded entities.
    pub(crate) price: DVector<f64>,
    pub(crate) pooled: DVector<f64>,
    /// Entity-specific coefficients, `entity × design column`.
    pub(crate) entity: DMatrix<f64>,
    /// Residuals, `NaN` where unobserved.
    pub(crate) residuals: DMatrix<f64>,
    /// Residuals with the factor component added back, input to factor extraction.
    pub(crate) factor_free: DMatrix<f64>,
}

/// The GIV moment system for a fixed set of factors and active entities.
#[derive(Clone, Debug)]
pub struct MomentSystem {
    n_entities: usize,
    n_time: usize,
    n_pcs: usize,
    heterogeneous: bool,
    weightings: Vec<PeerWeighting>,
    blocks: Vec<EntityBlock>,
    excluded: Vec<EntityBlock>,
    outcome: DMatrix<f64>,
    price: DMatrix<f64>,
    pooled: Vec<DMatrix<f64>>,
    observed: DMatrix<bool>,
    peer_weights: Vec<DMatrix<f64>>,
    pooled_gram_inverse: DMatrix<f64>,
    pooled_base: DVector<f64>,
    pooled_slopes: DMatrix<f64>,
    fixed_instruments: Option<Vec<DMatrix<f64>>>,
}

impl MomentSystem {
    /// Projects the panel and assembles the moment system.
    ///
    /// `excluded[i]` removes entity `i` from the moments; its coefficients are
    /// still recovered where possible. Per-entity projections run in parallel.
    pub(crate) fn build(
        panel: &Panel,
        formula: &ResolvedFormula,
        factors: Option<&FactorModel>,
        excluded: &[bool],
        weightings: &[PeerWeighting],
    ) -> Result<Self> {
        if excluded.len() != panel.entity_count() {
            return Err(GivError::dimension_mismatch(
                "exclusion mask",
                panel.entity_count(),
                excluded.len(),
            ));
        }
        let active: Vec<usize> = (0..panel.entity_count())
            .filter(|&i| !excluded[i])
            .collect();
        if active.len() < 2 {
            return Err(GivError::insufficient(format!(
                "peer instruments need at least two active entities, found {}",
                active.len()
            )));
        }

        let blocks = active
            .par_iter()
            .map(|&i| EntityBlock::new(panel, formula, factors, i))
            .collect::<Vec<_>>()
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        let excluded_blocks = (0..panel.entity_count())
            .filter(|&i| excluded[i])
            .filter_map(|i| EntityBlock::new(panel, formula, factors, i).ok())
            .collect();

        let n_active = active.len();
        let t = panel.time_count();
        let k = formula.pooled.len();
        let mut outcome = DMatrix::<f64>::zeros(n_active, t);
        let mut price = DMatrix::<f64>::zeros(n_active, t);
        let mut pooled = vec![DMatrix::<f64>::zeros(n_active, t); k];
        let mut observed = DMatrix::from_element(n_active, t, false);
        let mut size = DMatrix::<f64>::zeros(n_active, t);

        let mut pooled_gram = DMatrix::<f64>::zeros(k, k);
        let mut pooled_base = DVector::<f64>::zeros(k);
        let mut pooled_slopes = DMatrix::<f64>::zeros(k, n_active);

        for (e, block) in blocks.iter().enumerate() {
            let a = block.project(&block.outcome);
            let b = block.project(&block.price);
            let mut g = DMatrix::<f64>::zeros(block.periods.len(), k);
            for column in 0..k {
                let projected = block.project(&block.pooled.column(column).into_owned());
                g.set_column(column, &projected);
            }
            let w = DVector::from_iterator(
                block.periods.len(),
                block
                    .periods
                    .iter()
                    .map(|&t| panel.weights()[(block.entity, t)]),
            );

            for (row, &period) in block.periods.iter().enumerate() {
                outcome[(e, period)] = a[row];
                price[(e, period)] = b[row];
                observed[(e, period)] = true;
                size[(e, period)] = w[row];
                for column in 0..k {
                    pooled[column][(e, period)] = g[(row, column)];
                }
            }

            if k > 0 {
                let weighted = DMatrix::from_fn(g.nrows(), k, |row, column| {
                    w[row] * g[(row, column)]
                });
                pooled_gram += weighted.transpose() * &g;
                pooled_base += weighted.transpose() * &a;
                pooled_slopes.set_column(e, &(weighted.transpose() * &b));
            }
        }

        let pooled_gram_inverse = if k == 0 {
            DMatrix::<f64>::zeros(0, 0)
        } else {
            Cholesky::new(pooled_gram)
                .ok_or_else(|| GivError::singular("pooled regressor Gram matrix"))?
                .inverse()
        };

        let equal = 1.0 / n_active as f64;
        let peer_weights = weightings
            .iter()
            .map(|weighting| match weighting {
                PeerWeighting::Size => size.clone(),
                PeerWeighting::Equal => observed.map(|seen| if seen { equal } else { 0.0 }),
            })
            .collect();

        Ok(Self {
            n_entities: panel.entity_count(),
            n_time: t,
            n_pcs: factors.map_or(0, FactorModel::n_pcs),
            heterogeneous: formula.heterogeneous,
            weightings: weightings.to_vec(),
            blocks,
            excluded: excluded_blocks,
            outcome,
            price,
            pooled,
            observed,
            peer_weights,
            pooled_gram_inverse,
            pooled_base,
            pooled_slopes,
            fixed_instruments: None,
        })
    }

    /// Holds the instruments at their values under `theta`.
    pub(crate) fn fix_instruments(&mut self, theta: &DVector<f64>) -> Result<()> {
        self.fixed_instruments = None;
        let evaluation = self.evaluate(theta)?;
        self.fixed_instruments = Some(evaluation.instruments);
        Ok(())
    }

    /// Whether the moments are linear in the price coefficients.
    pub fn has_fixed_instruments(&self) -> bool {
        self.fixed_instruments.is_some()
    }

    /// Number of entities entering the moments.
    pub fn active_count(&self) -> usize {
        self.blocks.len()
    }

    /// Panel indices of the active entities, in order.
    pub fn active_entities(&self) -> Vec<usize> {
        self.blocks.iter().map(|block| block.entity).collect()
    }

    /// Number of unknown price coefficients.
    pub fn parameter_count(&self) -> usize {
        if self.heterogeneous {
            self.active_count()
        } else {
            1
        }
    }

    /// Number of stacked moment conditions.
    pub fn moment_count(&self) -> usize {
        self.parameter_count() * self.weightings.len()
    }

    pub fn weightings(&self) -> &[PeerWeighting] {
        &self.weightings
    }

    pub fn is_heterogeneous(&self) -> bool {
        self.heterogeneous
    }

    /// Expands the parameter vector to one price coefficient per active entity.
    fn price_coefficients(&self, theta: &DVector<f64>) -> DVector<f64> {
        if self.heterogeneous {
            theta.clone()
        } else {
            DVector::from_element(self.active_count(), theta[0])
        }
    }

    /// Size-weighted least squares pooled coefficients given the price coefficients.
    fn pooled_coefficients(&self, prices: &DVector<f64>) -> DVector<f64> {
        if self.pooled.is_empty() {
            return DVector::<f64>::zeros(0);
        }
        &self.pooled_gram_inverse * (&self.pooled_base - &self.pooled_slopes * prices)
    }

    /// `a − c·b − Σ βₖ gₖ` on the active panel.
    fn residual_matrix(&self, prices: &DVector<f64>, pooled: &DVector<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(self.outcome.nrows(), self.n_time, |e, t| {
            self.outcome[(e, t)] - prices[e] * self.price[(e, t)] - self.pooled_fit(pooled, e, t)
        })
    }

    fn pooled_fit(&self, pooled: &DVector<f64>, e: usize, t: usize) -> f64 {
        self.pooled
            .iter()
            .zip(pooled.iter())
            .map(|(column, beta)| beta * column[(e, t)])
            .sum()
    }

    /// `z₋ᵢₜ = Σ_{j≠i} wⱼₜ uⱼₜ`, zero where entity `i` is unobserved.
    fn leave_one_out(&self, weights: &DMatrix<f64>, values: &DMatrix<f64>) -> DMatrix<f64> {
        let weighted = weights.component_mul(values);
        let totals = weighted.row_sum();
        DMatrix::from_fn(values.nrows(), values.ncols(), |e, t| {
            if self.observed[(e, t)] {
                totals[t] - weighted[(e, t)]
            } else {
                0.0
            }
        })
    }

    fn accumulate(&self, moments: &mut DVector<f64>, e: usize, f: usize, value: f64) {
        let families = self.weightings.len();
        if self.heterogeneous {
            moments[e * families + f] += value;
        } else {
            moments[f] += value;
        }
    }

    /// Evaluates the stacked moments at the parameter vector `theta`.
    pub fn evaluate(&self, theta: &DVector<f64>) -> Result<MomentEvaluation> {
        if theta.len() != self.parameter_count() {
            return Err(GivError::dimension_mismatch(
                "moment parameters",
                self.parameter_count(),
                theta.len(),
            ));
        }
        let coefficients = self.price_coefficients(theta);
        let pooled = self.pooled_coefficients(&coefficients);
        let residuals = self.residual_matrix(&coefficients, &pooled);
        let instruments: Vec<DMatrix<f64>> = match &self.fixed_instruments {
            Some(fixed) => fixed.clone(),
            None => self
                .peer_weights
                .iter()
                .map(|weights| self.leave_one_out(weights, &residuals))
                .collect(),
        };

        let scale = 1.0 / self.n_time as f64;
        let mut moments = DVector::<f64>::zeros(self.moment_count());
        for (f, z) in instruments.iter().enumerate() {
            for e in 0..self.active_count() {
                let value = residuals.row(e).dot(&z.row(e)) * scale;
                self.accumulate(&mut moments, e, f, value);
            }
        }
        if moments.iter().any(|value| !value.is_finite()) {
            return Err(GivError::NumericalError {
                context: "moment evaluation",
            });
        }

        Ok(MomentEvaluation {
            coefficients,
            pooled,
            residuals,
            instruments,
            moments,
        })
    }

    /// Analytic Jacobian of the stacked moments, `moments × parameters`.
    ///
    /// Columns are independent and computed in parallel.
    pub fn jacobian(&self, evaluation: &MomentEvaluation) -> DMatrix<f64> {
        let columns: Vec<DVector<f64>> = (0..self.parameter_count())
            .into_par_iter()
            .map(|parameter| self.jacobian_column(parameter, evaluation))
            .collect();
        let mut jacobian = DMatrix::<f64>::zeros(self.moment_count(), self.parameter_count());
        for (index, column) in columns.iter().enumerate() {
            jacobian.set_column(index, column);
        }
        jacobian
    }

    fn jacobian_column(&self, parameter: usize, evaluation: &MomentEvaluation) -> DVector<f64> {
        let n_active = self.active_count();
        let direction = if self.heterogeneous {
            let mut unit = DVector::<f64>::zeros(n_active);
            unit[parameter] = 1.0;
            unit
        } else {
            DVector::from_element(n_active, 1.0)
        };

        let pooled_direction = if self.pooled.is_empty() {
            DVector::<f64>::zeros(0)
        } else {
            -(&self.pooled_gram_inverse * (&self.pooled_slopes * &direction))
        };
        let d_residuals = DMatrix::from_fn(n_active, self.n_time, |e, t| {
            -direction[e] * self.price[(e, t)] - self.pooled_fit(&pooled_direction, e, t)
        });

        let scale = 1.0 / self.n_time as f64;
        let mut column = DVector::<f64>::zeros(self.moment_count());
        for (f, weights) in self.peer_weights.iter().enumerate() {
            let d_instruments = self
                .fixed_instruments
                .is_none()
                .then(|| self.leave_one_out(weights, &d_residuals));
            let z = &evaluation.instruments[f];
            for e in 0..n_active {
                let own = d_residuals.row(e).dot(&z.row(e));
                let peers = d_instruments
                    .as_ref()
                    .map_or(0.0, |dz| evaluation.residuals.row(e).dot(&dz.row(e)));
                self.accumulate(&mut column, e, f, (own + peers) * scale);
            }
        }
        column
    }

    /// Active entities whose price is (numerically) orthogonal to its own instrument.
    pub fn weak_entities(&self, evaluation: &MomentEvaluation) -> Vec<usize> {
        if !self.heterogeneous {
            return Vec::new();
        }
        let z = &evaluation.instruments[0];
        self.blocks
            .iter()
            .enumerate()
            .filter(|(e, _)| {
                let price = self.price.row(*e);
                let instrument = z.row(*e);
                let scale = price.norm() * instrument.norm();
                scale == 0.0 || price.dot(&instrument).abs() <= WEAK_INSTRUMENT_RATIO * scale
            })
            .map(|(_, block)| block.entity)
            .collect()
    }

    /// Maps the solution back onto the panel: every coefficient and residual.
    pub(crate) fn recover(&self, theta: &DVector<f64>, design_width: usize) -> Result<Recovery> {
        let evaluation = self.evaluate(theta)?;
        let n = self.n_entities;
        let t = self.n_time;
        let mut recovery = Recovery {
            price: DVector::from_element(n, f64::NAN),
            pooled: evaluation.pooled.clone(),
            entity: DMatrix::from_element(n, design_width, f64::NAN),
            residuals: DMatrix::from_element(n, t, f64::NAN),
            factor_free: DMatrix::from_element(n, t, f64::NAN),
        };

        for (e, block) in self.blocks.iter().enumerate() {
            let price = evaluation.coefficients[e];
            recovery.price[block.entity] = price;
            let target = &block.outcome - &block.price * price - &block.pooled * &evaluation.pooled;
            self.write_entity(&mut recovery, block, &target);
        }
        for block in &self.excluded {
            let target = &block.outcome - &block.pooled * &evaluation.pooled;
            self.write_entity(&mut recovery, block, &target);
        }
        Ok(recovery)
    }

    fn write_entity(&self, recovery: &mut Recovery, block: &EntityBlock, target: &DVector<f64>) {
        let gamma = block.coefficients(target);
        let fitted = &block.design * &gamma;
        let width = block.design.ncols();
        let factor_part = if self.n_pcs > 0 {
            block.design.columns(width - self.n_pcs, self.n_pcs)
                * gamma.rows(width - self.n_pcs, self.n_pcs)
        } else {
            DVector::<f64>::zeros(block.periods.len())
        };
        for (column, value) in gamma.iter().enumerate() {
            recovery.entity[(block.entity, column)] = *value;
        }
        for (row, &period) in block.periods.iter().enumerate() {
            let residual = target[row] - fitted[row];
            recovery.residuals[(block.entity, period)] = residual;
            recovery.factor_free[(block.entity, period)] = residual + factor_part[row];
        }
    }
}

/// Evaluates the GIV moments for per-entity price coefficients.
///
/// `coefficients` holds one value per panel entity; a homogeneous formula uses
/// the first value. Every entity takes part, and the call has no side effects.
pub fn build(
    panel: &Panel,
    formula: &FormulaSpec,
    coefficients: &DVector<f64>,
    factors: Option<&FactorModel>,
    weighting: PeerWeighting,
) -> Result<MomentEvaluation> {
    if coefficients.len() != panel.entity_count() {
        return Err(GivError::dimension_mismatch(
            "coefficients",
            panel.entity_count(),
            coefficients.len(),
        ));
    }
    let resolved = formula.resolve(panel)?;
    let excluded = vec![false; panel.entity_count()];
    let system = MomentSystem::build(panel, &resolved, factors, &excluded, &[weighting])?;
    let theta = if system.is_heterogeneous() {
        coefficients.clone()
    } else {
        DVector::from_element(1, coefficients[0])
    };
    system.evaluate(&theta)
}

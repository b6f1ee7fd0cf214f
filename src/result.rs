//! Estimation results and the augmented panel.

use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::estimation::{IterationSnapshot, SolverState};
use crate::heteropca::FactorModel;

/// Named coefficients.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CoefficientVector {
    pub names: Vec<String>,
    pub values: DVector<f64>,
}

impl CoefficientVector {
    /// Value of the coefficient called `name`.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| self.values[index])
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Why an entity was left out of the coefficient update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// The endogenous regressor never moves for this entity.
    ZeroPriceVariation,
    /// Too few periods, or a rank-deficient entity-specific design.
    SingularProjection,
    /// The projected price is orthogonal to the entity's own instrument.
    Uninstrumented,
}

/// Diagnostic attached to an excluded entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityNote {
    pub entity_id: String,
    pub reason: ExclusionReason,
    pub message: String,
}

/// One input row with its estimated quantities.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AugmentedObservation {
    pub entity_id: String,
    pub time_id: i64,
    pub outcome: f64,
    pub price: f64,
    pub weight: f64,
    /// Price coefficient of the row's entity.
    pub coefficient: f64,
    /// Outcome minus residual; `NaN` where the cell is unobserved.
    pub fitted: f64,
    pub residual: f64,
    /// Factor values of the row's period.
    pub pcs: Vec<f64>,
}

/// The input panel, row by row, extended with estimates.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AugmentedPanel {
    pub pc_names: Vec<String>,
    pub rows: Vec<AugmentedObservation>,
}

impl AugmentedPanel {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[AugmentedObservation] {
        &self.rows
    }
}

/// Outcome of a GIV estimation run.
#[derive(Clone, Debug, Serialize)]
pub struct ModelResult {
    pub(crate) formula: String,
    pub(crate) entity_ids: Vec<String>,
    pub(crate) time_ids: Vec<i64>,
    pub(crate) state: SolverState,
    pub(crate) iterations: usize,
    pub(crate) price_coefficients: DVector<f64>,
    pub(crate) pooled: CoefficientVector,
    pub(crate) design_names: Vec<String>,
    pub(crate) entity_coefficients: DMatrix<f64>,
    pub(crate) factor_model: Option<FactorModel>,
    pub(crate) residuals: DMatrix<f64>,
    pub(crate) aggregate_coefficient: f64,
    pub(crate) objective: f64,
    pub(crate) notes: Vec<EntityNote>,
    pub(crate) history: Vec<IterationSnapshot>,
    pub(crate) augmented: Option<AugmentedPanel>,
}

impl ModelResult {
    /// Formula in conventional notation.
    pub fn formula(&self) -> &str {
        &self.formula
    }

    pub fn converged(&self) -> bool {
        self.state == SolverState::Converged
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Number of outer iterations performed.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn entity_ids(&self) -> &[String] {
        &self.entity_ids
    }

    pub fn time_ids(&self) -> &[i64] {
        &self.time_ids
    }

    /// Number of factors in the final fit (0 without a `pc(k)` term).
    pub fn n_pcs(&self) -> usize {
        self.factor_model.as_ref().map_or(0, FactorModel::n_pcs)
    }

    pub fn factor_model(&self) -> Option<&FactorModel> {
        self.factor_model.as_ref()
    }

    /// Factor values, `time × factor`.
    pub fn pc_factors(&self) -> Option<&DMatrix<f64>> {
        self.factor_model.as_ref().map(FactorModel::factors)
    }

    /// HeteroPCA loadings, `entity × factor`, orthonormal over the active entities.
    pub fn pc_loadings(&self) -> Option<&DMatrix<f64>> {
        self.factor_model.as_ref().map(FactorModel::loadings)
    }

    /// Each entity's regression coefficients on the factor columns of its
    /// design, `entity × factor`.
    pub fn factor_coefficients(&self) -> Option<DMatrix<f64>> {
        let k = self.n_pcs();
        if k == 0 {
            return None;
        }
        let width = self.entity_coefficients.ncols();
        Some(self.entity_coefficients.columns(width - k, k).into_owned())
    }

    /// Price coefficient per entity; `NaN` for excluded entities.
    pub fn coefficients(&self) -> &DVector<f64> {
        &self.price_coefficients
    }

    pub fn price_coefficient(&self, entity_id: &str) -> Option<f64> {
        self.entity_position(entity_id)
            .map(|index| self.price_coefficients[index])
    }

    pub fn pooled_coefficients(&self) -> &CoefficientVector {
        &self.pooled
    }

    pub fn pooled_coefficient(&self, name: &str) -> Option<f64> {
        self.pooled.get(name)
    }

    /// Column names of [`entity_coefficients`](Self::entity_coefficients).
    pub fn entity_coefficient_names(&self) -> &[String] {
        &self.design_names
    }

    /// Entity-specific coefficients, `entity × term` (fixed effect, entity-specific
    /// exogenous terms, then factor loadings).
    pub fn entity_coefficients(&self) -> &DMatrix<f64> {
        &self.entity_coefficients
    }

    pub fn entity_coefficient(&self, entity_id: &str, name: &str) -> Option<f64> {
        let row = self.entity_position(entity_id)?;
        let column = self.design_names.iter().position(|term| term == name)?;
        Some(self.entity_coefficients[(row, column)])
    }

    /// Size-weighted mean price coefficient over the estimated entities.
    pub fn aggregate_coefficient(&self) -> f64 {
        self.aggregate_coefficient
    }

    /// Residuals, `entity × time`; `NaN` where unobserved.
    pub fn residuals(&self) -> &DMatrix<f64> {
        &self.residuals
    }

    /// Mean squared residual of every entity over its observed periods.
    pub fn residual_variance(&self) -> DVector<f64> {
        DVector::from_fn(self.residuals.nrows(), |i, _| {
            let observed: Vec<f64> = self
                .residuals
                .row(i)
                .iter()
                .copied()
                .filter(|value| value.is_finite())
                .collect();
            if observed.is_empty() {
                f64::NAN
            } else {
                observed.iter().map(|value| value * value).sum::<f64>() / observed.len() as f64
            }
        })
    }

    /// Weighted moment objective at the final root.
    pub fn objective(&self) -> f64 {
        self.objective
    }

    pub fn notes(&self) -> &[EntityNote] {
        &self.notes
    }

    /// Per-iteration diagnostics of the outer loop.
    pub fn history(&self) -> &[IterationSnapshot] {
        &self.history
    }

    /// Present when the options asked for it.
    pub fn augmented_panel(&self) -> Option<&AugmentedPanel> {
        self.augmented.as_ref()
    }

    fn entity_position(&self, entity_id: &str) -> Option<usize> {
        self.entity_ids.iter().position(|id| id == entity_id)
    }
}

//! High-level GIV estimation pipeline.
//!
//! [`GivSolver`] alternates two steps. It solves the moment system for the
//! price coefficients given the current factors, then re-extracts the factors
//! from the factor-free residuals with HeteroPCA. It stops once both the
//! coefficients and the loading space settle. Refreshed factors are shifted
//! along the mean price so that they carry none of the aggregate residual.
//! Without a `pc(k)` term the instruments are fixed at the guess and a single
//! linear solve gives the IV estimate; with [`FactorSchedule::Once`] a single
//! moment solve also suffices.

use log::{debug, info, warn};
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::formula::{FormulaSpec, ResolvedFormula};
use crate::heteropca::{projector_change, FactorModel, HeteroPca};
use crate::moments::{MomentEvaluation, MomentSystem, PeerWeighting, Recovery};
use crate::options::{FactorSchedule, GivOptions, WeightingMatrix};
use crate::panel::Panel;
use crate::result::{
    AugmentedObservation, AugmentedPanel, CoefficientVector, EntityNote, ExclusionReason,
    ModelResult,
};
use crate::solving::{solve_moments, RootSolution, RootSummary};

/// Starting values for the price coefficients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Guess {
    /// One value, broadcast to every entity.
    Scalar(f64),
    /// One value per entity. Homogeneous models also take a single value, and
    /// reduce a per-entity guess to its size-weighted mean.
    PerEntity(Vec<f64>),
}

impl Guess {
    /// Starting coefficients: `n` of them for a heterogeneous model, one otherwise.
    fn resolve(
        &self,
        n: usize,
        heterogeneous: bool,
        shares: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let values = match self {
            Guess::Scalar(value) if heterogeneous => DVector::from_element(n, *value),
            Guess::Scalar(value) => DVector::from_element(1, *value),
            Guess::PerEntity(values) if values.len() == n => {
                let values = DVector::from_column_slice(values);
                if heterogeneous {
                    values
                } else {
                    DVector::from_element(1, shares.dot(&values))
                }
            }
            Guess::PerEntity(values) if values.len() == 1 && !heterogeneous => {
                DVector::from_column_slice(values)
            }
            Guess::PerEntity(values) => {
                return Err(GivError::GuessDimension {
                    expected: n,
                    found: values.len(),
                })
            }
        };
        if values.iter().any(|value| !value.is_finite()) {
            return Err(GivError::invalid_configuration("guess values must be finite"));
        }
        Ok(values)
    }
}

impl Default for Guess {
    fn default() -> Self {
        Guess::Scalar(0.0)
    }
}

impl From<f64> for Guess {
    fn from(value: f64) -> Self {
        Guess::Scalar(value)
    }
}

impl From<Vec<f64>> for Guess {
    fn from(values: Vec<f64>) -> Self {
        Guess::PerEntity(values)
    }
}

/// Lifecycle of the outer iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverState {
    Initialized,
    Iterating,
    Converged,
    MaxIterReached,
    Failed,
}

impl SolverState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SolverState::Converged | SolverState::MaxIterReached | SolverState::Failed
        )
    }
}

/// Diagnostics of one outer iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IterationSnapshot {
    pub iteration: usize,
    /// Largest absolute change of any price or pooled coefficient.
    pub coefficient_change: f64,
    /// Relative change of the loading projector, when factors were re-extracted.
    pub factor_change: Option<f64>,
    pub root: RootSummary,
    pub n_pcs: usize,
    /// Entities excluded so far.
    pub excluded: usize,
}

/// A panel paired with a validated formula.
#[derive(Clone, Debug)]
pub struct GivProblem {
    panel: Panel,
    formula: FormulaSpec,
    resolved: ResolvedFormula,
}

impl GivProblem {
    /// Resolves `formula` against the panel's columns.
    pub fn new(panel: Panel, formula: FormulaSpec) -> Result<Self> {
        let resolved = formula.resolve(&panel)?;
        Ok(Self {
            panel,
            formula,
            resolved,
        })
    }

    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    pub fn formula(&self) -> &FormulaSpec {
        &self.formula
    }

    /// Prepares a solver that can be stepped manually.
    pub fn solver(&self, guess: &Guess, options: &GivOptions) -> Result<GivSolver<'_>> {
        GivSolver::new(self, guess, options)
    }

    /// Runs the outer iteration to completion.
    pub fn estimate(&self, guess: &Guess, options: &GivOptions) -> Result<ModelResult> {
        self.solver(guess, options)?.run()
    }
}

/// Estimates `formula` on `panel` starting from `guess`.
pub fn estimate(
    panel: &Panel,
    formula: &FormulaSpec,
    guess: &Guess,
    options: &GivOptions,
) -> Result<ModelResult> {
    GivProblem::new(panel.clone(), formula.clone())?.estimate(guess, options)
}

/// Output of the most recent moment solve.
#[derive(Clone, Debug)]
struct Fit {
    recovery: Recovery,
    factors: Option<FactorModel>,
    root: RootSummary,
}

/// Explicit state machine driving the outer iteration.
#[derive(Debug)]
pub struct GivSolver<'a> {
    problem: &'a GivProblem,
    options: GivOptions,
    state: SolverState,
    iteration: usize,
    guess: DVector<f64>,
    coefficients: DVector<f64>,
    pooled: Option<DVector<f64>>,
    excluded: Vec<bool>,
    notes: Vec<EntityNote>,
    factors: Option<FactorModel>,
    fit: Option<Fit>,
    history: Vec<IterationSnapshot>,
}

impl<'a> GivSolver<'a> {
    /// Validates the guess and the factor count before any computation.
    pub fn new(problem: &'a GivProblem, guess: &Guess, options: &GivOptions) -> Result<Self> {
        options.validate()?;
        let panel = &problem.panel;
        let n = panel.entity_count();
        let heterogeneous = problem.resolved.heterogeneous;
        let guess = guess.resolve(n, heterogeneous, &panel.weight_shares())?;

        let k = problem.resolved.n_pcs;
        let max = n.min(panel.time_count()).saturating_sub(1);
        if k > max {
            return Err(GivError::InvalidFactorCount { requested: k, max });
        }

        let coefficients = if heterogeneous {
            guess.clone()
        } else {
            DVector::from_element(n, guess[0])
        };

        let mut solver = Self {
            problem,
            options: options.clone(),
            state: SolverState::Initialized,
            iteration: 0,
            guess,
            coefficients,
            pooled: None,
            excluded: vec![false; n],
            notes: Vec::new(),
            factors: None,
            fit: None,
            history: Vec::new(),
        };
        for i in 0..n {
            if !solver.price_varies(i) {
                solver.exclude(
                    i,
                    ExclusionReason::ZeroPriceVariation,
                    "endogenous regressor has no variation over the observed periods",
                );
            }
        }
        Ok(solver)
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn history(&self) -> &[IterationSnapshot] {
        &self.history
    }

    pub fn notes(&self) -> &[EntityNote] {
        &self.notes
    }

    /// Current price coefficient of every entity.
    pub fn coefficients(&self) -> &DVector<f64> {
        &self.coefficients
    }

    /// Performs one outer iteration and returns the new state.
    ///
    /// Terminal states are sticky; stepping them again is a no-op.
    pub fn step(&mut self) -> Result<SolverState> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }
        match self.advance() {
            Ok(state) => {
                self.state = state;
                Ok(state)
            }
            Err(error) => {
                self.state = SolverState::Failed;
                Err(error)
            }
        }
    }

    /// Steps until a terminal state and assembles the result.
    pub fn run(mut self) -> Result<ModelResult> {
        info!(
            "estimating `{}` on {} entities x {} periods",
            self.problem.formula,
            self.problem.panel.entity_count(),
            self.problem.panel.time_count()
        );
        while !self.state.is_terminal() {
            self.step()?;
        }
        self.into_result()
    }

    fn advance(&mut self) -> Result<SolverState> {
        self.iteration += 1;
        let k = self.problem.resolved.n_pcs;
        if k > 0 && self.factors.is_none() {
            let residuals = self.residuals_at_guess()?;
            self.factors = Some(self.extract_factors(&residuals, k)?);
        }

        let factors = self.factors.clone();
        let (system, solution) = self.solve(factors.as_ref())?;
        let width = self
            .problem
            .resolved
            .design_names(factors.as_ref().map_or(0, FactorModel::n_pcs))
            .len();
        let recovery = system.recover(&solution.parameters, width)?;

        let coefficient_change = self.coefficient_change(&recovery);
        self.coefficients = recovery.price.clone();
        self.pooled = Some(recovery.pooled.clone());

        let coupled = k > 0 && self.options.factor_schedule == FactorSchedule::EveryIteration;
        let mut factor_change = None;
        if coupled {
            if let Some(previous) = &factors {
                let mut refreshed = self.extract_factors(&recovery.factor_free, k)?;
                // Coefficients and factors trade off along the aggregate price; pin the factors.
                let (shock, price) = self.aggregate_shocks(&recovery.residuals);
                refreshed.orthogonalize(&price, &shock);
                factor_change = Some(projector_change(
                    &previous.projector(),
                    &refreshed.projector(),
                ));
                self.factors = Some(refreshed);
            }
        }

        let root = solution.summary.clone();
        let snapshot = IterationSnapshot {
            iteration: self.iteration,
            coefficient_change,
            factor_change,
            root: root.clone(),
            n_pcs: factors.as_ref().map_or(0, FactorModel::n_pcs),
            excluded: self.excluded.iter().filter(|flag| **flag).count(),
        };
        debug!(
            "iteration {}: coefficient change {:.3e}, factor change {:?}, root converged {}",
            snapshot.iteration, coefficient_change, factor_change, root.converged
        );
        self.history.push(snapshot);
        self.fit = Some(Fit {
            recovery,
            factors,
            root: root.clone(),
        });

        let tolerance = self.options.tolerance;
        let settled = !coupled
            || (coefficient_change < tolerance
                && factor_change.map_or(true, |change| change < tolerance));
        if root.converged && settled {
            info!("converged after {} iterations", self.iteration);
            return Ok(SolverState::Converged);
        }
        if !coupled || self.iteration >= self.options.max_iter {
            if self.options.is_strict() {
                return Err(GivError::NotConverged {
                    iterations: self.iteration,
                    coefficient_change,
                });
            }
            warn!(
                "stopped after {} iterations without convergence (coefficient change {:.3e})",
                self.iteration, coefficient_change
            );
            return Ok(SolverState::MaxIterReached);
        }
        Ok(SolverState::Iterating)
    }

    /// Builds the moment system, excluding degenerate entities until it is well posed.
    fn build_system(
        &mut self,
        factors: Option<&FactorModel>,
    ) -> Result<(MomentSystem, DVector<f64>, MomentEvaluation)> {
        loop {
            let weightings = self.peer_weightings();
            let system = match MomentSystem::build(
                &self.problem.panel,
                &self.problem.resolved,
                factors,
                &self.excluded,
                &weightings,
            ) {
                Ok(system) => system,
                Err(GivError::SingularMomentMatrix { entity }) if !self.options.is_strict() => {
                    let index = self.entity_index(&entity)?;
                    self.exclude(
                        index,
                        ExclusionReason::SingularProjection,
                        "entity-specific design is rank deficient for the observed periods",
                    );
                    continue;
                }
                Err(error) => return Err(error),
            };

            let start = self.start_parameters(&system);
            let evaluation = system.evaluate(&start)?;
            let weak = system.weak_entities(&evaluation);
            if weak.is_empty() {
                return Ok((system, start, evaluation));
            }
            if self.options.is_strict() {
                return Err(GivError::singular_entity(
                    self.problem.panel.entity_ids()[weak[0]].clone(),
                ));
            }
            for index in weak {
                self.exclude(
                    index,
                    ExclusionReason::Uninstrumented,
                    "projected price is orthogonal to the peer instrument",
                );
            }
        }
    }

    fn solve(&mut self, factors: Option<&FactorModel>) -> Result<(MomentSystem, RootSolution)> {
        let (mut system, start, evaluation) = self.build_system(factors)?;
        if self.problem.resolved.n_pcs == 0 {
            // Instruments built at the guess turn the moments into a one-shot linear IV.
            system.fix_instruments(&start)?;
        }
        let weighting = self.weighting_matrix(&system, &evaluation)?;
        let solution = solve_moments(&system, &start, &weighting, &self.options.root)?;
        Ok((system, solution))
    }

    /// Factor-free residuals at the starting coefficients.
    fn residuals_at_guess(&mut self) -> Result<DMatrix<f64>> {
        let (system, start, _) = self.build_system(None)?;
        let width = self.problem.resolved.design_names(0).len();
        Ok(system.recover(&start, width)?.residuals)
    }

    /// Runs HeteroPCA on the residuals of the active entities.
    fn extract_factors(&self, residuals: &DMatrix<f64>, k: usize) -> Result<FactorModel> {
        let active: Vec<usize> = (0..self.excluded.len())
            .filter(|&i| !self.excluded[i])
            .collect();
        let t = residuals.ncols();
        let data = DMatrix::from_fn(active.len(), t, |row, column| {
            residuals[(active[row], column)]
        });
        let observed = DMatrix::from_fn(active.len(), t, |row, column| {
            self.problem.panel.is_observed(active[row], column)
                && residuals[(active[row], column)].is_finite()
        });
        let model = HeteroPca::new(self.options.pca.clone()).fit(&data, &observed, k)?;
        if model.n_pcs() < k {
            warn!("factor rank reduced from {k} to {}", model.n_pcs());
        }
        Ok(model.expand_rows(&active, self.excluded.len()))
    }

    /// Size-weighted aggregate residual and mean price per period, over active entities.
    fn aggregate_shocks(&self, residuals: &DMatrix<f64>) -> (DVector<f64>, DVector<f64>) {
        let panel = &self.problem.panel;
        let t = panel.time_count();
        let mut shock = DVector::<f64>::zeros(t);
        let mut price = DVector::<f64>::zeros(t);
        for column in 0..t {
            let mut mass = 0.0;
            for i in (0..panel.entity_count()).filter(|&i| !self.excluded[i]) {
                if !panel.is_observed(i, column) {
                    continue;
                }
                let weight = panel.weights()[(i, column)];
                let residual = residuals[(i, column)];
                if residual.is_finite() {
                    shock[column] += weight * residual;
                }
                price[column] += weight * panel.price()[(i, column)];
                mass += weight;
            }
            if mass > 0.0 {
                price[column] /= mass;
            }
        }
        (shock, price)
    }

    /// Instrument families for the current active set.
    ///
    /// With equal sizes the equal-weighted instrument duplicates the size-weighted one.
    fn peer_weightings(&self) -> Vec<PeerWeighting> {
        let families = self.options.algorithm.peer_weightings();
        if families.len() > 1 && self.sizes_are_equal() {
            debug!("sizes are equal across entities; using the size-weighted instrument only");
            return vec![PeerWeighting::Size];
        }
        families.to_vec()
    }

    fn sizes_are_equal(&self) -> bool {
        let panel = &self.problem.panel;
        let mut low = f64::INFINITY;
        let mut high = f64::NEG_INFINITY;
        for i in (0..panel.entity_count()).filter(|&i| !self.excluded[i]) {
            for t in (0..panel.time_count()).filter(|&t| panel.is_observed(i, t)) {
                low = low.min(panel.weights()[(i, t)]);
                high = high.max(panel.weights()[(i, t)]);
            }
        }
        high - low <= 1e-12 * high.abs()
    }

    fn weighting_matrix(
        &self,
        system: &MomentSystem,
        evaluation: &MomentEvaluation,
    ) -> Result<DMatrix<f64>> {
        let m = system.moment_count();
        if self.options.weighting == WeightingMatrix::Identity {
            return Ok(DMatrix::identity(m, m));
        }

        let families = system.weightings().len();
        let t = self.problem.panel.time_count() as f64;
        let active = system.active_entities();
        let groups: Vec<Vec<usize>> = if system.is_heterogeneous() {
            (0..active.len()).map(|e| vec![e]).collect()
        } else {
            vec![(0..active.len()).collect()]
        };

        let mut weighting = DMatrix::<f64>::zeros(m, m);
        for (block, members) in groups.iter().enumerate() {
            let ztz = DMatrix::from_fn(families, families, |f, g| {
                members
                    .iter()
                    .map(|&e| {
                        evaluation
                            .instruments(f)
                            .row(e)
                            .dot(&evaluation.instruments(g).row(e))
                    })
                    .sum::<f64>()
                    / t
            });
            let inverse = Cholesky::new(ztz)
                .ok_or_else(|| {
                    if system.is_heterogeneous() {
                        GivError::singular_entity(
                            self.problem.panel.entity_ids()[active[block]].clone(),
                        )
                    } else {
                        GivError::singular("Z'Z inversion")
                    }
                })?
                .inverse();
            weighting
                .view_mut((block * families, block * families), (families, families))
                .copy_from(&inverse);
        }
        Ok(weighting)
    }

    fn start_parameters(&self, system: &MomentSystem) -> DVector<f64> {
        let active = system.active_entities();
        if system.is_heterogeneous() {
            DVector::from_iterator(
                active.len(),
                active.iter().map(|&i| {
                    if self.coefficients[i].is_finite() {
                        self.coefficients[i]
                    } else {
                        self.guess[i]
                    }
                }),
            )
        } else {
            let value = active
                .iter()
                .map(|&i| self.coefficients[i])
                .find(|value| value.is_finite())
                .unwrap_or(self.guess[0]);
            DVector::from_element(1, value)
        }
    }

    /// Largest change of any finite coefficient since the previous iteration.
    fn coefficient_change(&self, recovery: &Recovery) -> f64 {
        let mut change = recovery
            .price
            .iter()
            .zip(self.coefficients.iter())
            .filter(|(new, old)| new.is_finite() && old.is_finite())
            .map(|(new, old)| (new - old).abs())
            .fold(0.0, f64::max);
        if let Some(previous) = &self.pooled {
            change = previous
                .iter()
                .zip(recovery.pooled.iter())
                .map(|(old, new)| (new - old).abs())
                .fold(change, f64::max);
        }
        change
    }

    fn price_varies(&self, entity: usize) -> bool {
        let slice = self.problem.panel.entity_slice(entity);
        let low = slice.price.iter().copied().fold(f64::INFINITY, f64::min);
        let high = slice.price.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        slice.price.len() >= 2 && high - low > f64::EPSILON * high.abs().max(low.abs()).max(1.0)
    }

    fn exclude(&mut self, entity: usize, reason: ExclusionReason, message: &str) {
        let entity_id = self.problem.panel.entity_ids()[entity].clone();
        warn!("excluding entity `{entity_id}`: {message}");
        self.excluded[entity] = true;
        self.coefficients[entity] = f64::NAN;
        self.notes.push(EntityNote {
            entity_id,
            reason,
            message: message.to_string(),
        });
    }

    fn entity_index(&self, entity_id: &str) -> Result<usize> {
        self.problem
            .panel
            .entity_index(entity_id)
            .ok_or_else(|| GivError::singular_entity(entity_id))
    }

    fn into_result(self) -> Result<ModelResult> {
        let fit = self.fit.ok_or_else(|| {
            GivError::insufficient("the solver stopped before completing an iteration")
        })?;
        let panel = &self.problem.panel;
        let resolved = &self.problem.resolved;
        let n_pcs = fit.factors.as_ref().map_or(0, FactorModel::n_pcs);
        let recovery = fit.recovery;

        let shares = panel.weight_shares();
        let (weighted, mass) = recovery
            .price
            .iter()
            .zip(shares.iter())
            .filter(|(coefficient, _)| coefficient.is_finite())
            .fold((0.0, 0.0), |(sum, total), (coefficient, share)| {
                (sum + coefficient * share, total + share)
            });
        let aggregate_coefficient = if mass > 0.0 { weighted / mass } else { f64::NAN };

        let augmented = self
            .options
            .save_panel
            .then(|| augment(panel, &recovery, fit.factors.as_ref()));

        Ok(ModelResult {
            formula: self.problem.formula.to_string(),
            entity_ids: panel.entity_ids().to_vec(),
            time_ids: panel.time_ids().to_vec(),
            state: self.state,
            iterations: self.iteration,
            price_coefficients: recovery.price,
            pooled: CoefficientVector {
                names: resolved.pooled_names.clone(),
                values: recovery.pooled,
            },
            design_names: resolved.design_names(n_pcs),
            entity_coefficients: recovery.entity,
            factor_model: fit.factors,
            residuals: recovery.residuals,
            aggregate_coefficient,
            objective: fit.root.objective,
            notes: self.notes,
            history: self.history,
            augmented,
        })
    }
}

fn augment(panel: &Panel, recovery: &Recovery, factors: Option<&FactorModel>) -> AugmentedPanel {
    let n_pcs = factors.map_or(0, FactorModel::n_pcs);
    let rows = panel
        .rows()
        .iter()
        .map(|&(i, t)| {
            let outcome = panel.outcome()[(i, t)];
            let residual = recovery.residuals[(i, t)];
            AugmentedObservation {
                entity_id: panel.entity_ids()[i].clone(),
                time_id: panel.time_ids()[t],
                outcome,
                price: panel.price()[(i, t)],
                weight: panel.weights()[(i, t)],
                coefficient: recovery.price[i],
                fitted: outcome - residual,
                residual,
                pcs: factors.map_or_else(Vec::new, |model| {
                    model.factors().row(t).iter().copied().collect()
                }),
            }
        })
        .collect();
    AugmentedPanel {
        pc_names: (1..=n_pcs).map(|k| format!("pc_{k}")).collect(),
        rows,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::options::Strictness;
    use crate::panel::{Observation, PanelBuilder};
    use crate::simulation::{simulate_data, SimParam};

    fn simulated(param: SimParam) -> Panel {
        simulate_data(&param).unwrap().panel
    }

    #[test]
    fn guess_length_must_match_entities() {
        let panel = simulated(SimParam::default().with_factors(0));
        let problem = GivProblem::new(panel, FormulaSpec::new("q", "p").heterogeneous()).unwrap();
        let result = problem.solver(&Guess::from(vec![1.0; 9]), &GivOptions::default());
        assert!(matches!(
            result,
            Err(GivError::GuessDimension {
                expected: 10,
                found: 9
            })
        ));

        let homogeneous =
            GivProblem::new(problem.panel().clone(), FormulaSpec::new("q", "p")).unwrap();
        assert!(matches!(
            homogeneous.solver(&Guess::from(vec![1.0, 2.0]), &GivOptions::default()),
            Err(GivError::GuessDimension {
                expected: 10,
                found: 2
            })
        ));
        let single = homogeneous
            .solver(&Guess::from(vec![1.5]), &GivOptions::default())
            .unwrap();
        assert!(single.coefficients().iter().all(|value| *value == 1.5));

        let per_entity: Vec<f64> = (0..10).map(|i| -1.0 - 0.1 * i as f64).collect();
        let shares = homogeneous.panel().weight_shares();
        let mean: f64 = per_entity.iter().zip(shares.iter()).map(|(c, s)| c * s).sum();
        let reduced = homogeneous
            .solver(&Guess::from(per_entity), &GivOptions::default())
            .unwrap();
        assert!(reduced.coefficients().iter().all(|value| (value - mean).abs() < 1e-12));
    }

    #[test]
    fn no_factors_takes_a_single_iteration() {
        let panel = simulated(SimParam::default().with_factors(0).with_exogenous(1));
        let formula = FormulaSpec::new("q", "p")
            .heterogeneous()
            .pooled("x1")
            .fixed_effects();
        let result =
            estimate(&panel, &formula, &Guess::Scalar(-2.0), &GivOptions::default()).unwrap();

        assert!(result.converged());
        assert_eq!(result.iterations(), 1);
        assert_eq!(result.n_pcs(), 0);
        assert!(result.pc_factors().is_none());
        assert!(result.pc_loadings().is_none());
        assert_eq!(result.history().len(), 1);
        assert!(result.pooled_coefficient("x1").is_some());
        assert!(result.entity_coefficient("1", "fe").is_some());
    }

    fn rows_of(panel: &Panel) -> Vec<Observation> {
        panel
            .rows()
            .iter()
            .map(|&(i, t)| {
                let exogenous = (0..panel.exogenous_names().len())
                    .map(|column| panel.exogenous(column)[(i, t)])
                    .collect();
                Observation::new(
                    panel.entity_ids()[i].clone(),
                    panel.time_ids()[t],
                    panel.outcome()[(i, t)],
                    panel.price()[(i, t)],
                    panel.weights()[(i, t)],
                )
                .with_exogenous(exogenous)
            })
            .collect()
    }

    #[test]
    fn constant_price_entity_is_excluded_with_note() {
        let base = simulated(SimParam::default().with_factors(0).with_seed(21));
        let mut rows = rows_of(&base);
        for &time in base.time_ids() {
            rows.push(Observation::new("flat", time, (time as f64).cos(), 1.0, 0.05));
        }
        let panel = PanelBuilder::new(Vec::<String>::new())
            .observations(rows)
            .build()
            .unwrap();
        let formula = FormulaSpec::new("q", "p").heterogeneous();
        let result =
            estimate(&panel, &formula, &Guess::Scalar(-2.0), &GivOptions::default()).unwrap();

        assert!(result.price_coefficient("flat").unwrap().is_nan());
        assert_eq!(result.notes().len(), 1);
        assert_eq!(result.notes()[0].entity_id, "flat");
        assert_eq!(result.notes()[0].reason, ExclusionReason::ZeroPriceVariation);
        assert!(result.price_coefficient("1").unwrap().is_finite());
        assert!(result.aggregate_coefficient().is_finite());
    }

    #[test]
    fn strict_mode_rejects_singular_entities() {
        let base = simulated(SimParam::default().with_factors(0).with_exogenous(2).with_seed(4));
        let mut rows = rows_of(&base);
        for time in 1..=2i64 {
            rows.push(
                Observation::new("short", time, 0.5, time as f64, 0.05)
                    .with_exogenous(vec![1.0, 2.0 + time as f64]),
            );
        }
        let panel = PanelBuilder::new(["x1", "x2"]).observations(rows).build().unwrap();
        let formula = FormulaSpec::new("q", "p")
            .heterogeneous()
            .fixed_effects()
            .entity_specific("x1")
            .entity_specific("x2");

        let strict = GivOptions::default().with_strictness(Strictness::Strict);
        let error = estimate(&panel, &formula, &Guess::Scalar(-2.0), &strict).unwrap_err();
        assert!(matches!(
            error,
            GivError::SingularMomentMatrix { ref entity } if entity == "short"
        ));

        let lenient =
            estimate(&panel, &formula, &Guess::Scalar(-2.0), &GivOptions::default()).unwrap();
        assert!(lenient.price_coefficient("short").unwrap().is_nan());
        assert_eq!(lenient.notes()[0].reason, ExclusionReason::SingularProjection);
        assert!(lenient.entity_coefficient("short", "x1").unwrap().is_nan());
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let panel = simulated(SimParam::default().with_entities(12).with_periods(60).with_seed(3));
        let formula = FormulaSpec::new("q", "p").heterogeneous().fixed_effects().pc(2);
        let options = GivOptions::default().with_max_iter(5);
        let first = estimate(&panel, &formula, &Guess::Scalar(-2.0), &options).unwrap();
        let second = estimate(&panel, &formula, &Guess::Scalar(-2.0), &options).unwrap();

        assert_eq!(first.coefficients(), second.coefficients());
        assert_eq!(first.pc_factors(), second.pc_factors());
        assert_eq!(first.iterations(), second.iterations());
    }

    #[test]
    fn stepping_exposes_the_state_machine() {
        let panel = simulated(SimParam::default().with_entities(12).with_periods(80).with_seed(8));
        let formula = FormulaSpec::new("q", "p").pc(1);
        let problem = GivProblem::new(panel, formula).unwrap();
        let options = GivOptions::default().with_max_iter(3);
        let mut solver = problem.solver(&Guess::Scalar(-2.0), &options).unwrap();
        assert_eq!(solver.state(), SolverState::Initialized);

        let state = solver.step().unwrap();
        assert!(matches!(
            state,
            SolverState::Iterating | SolverState::Converged
        ));
        assert_eq!(solver.history().len(), 1);
        assert!(solver.history()[0].factor_change.is_some());

        while !solver.state().is_terminal() {
            solver.step().unwrap();
        }
        assert!(solver.iteration() <= 3);
        let terminal = solver.state();
        assert_eq!(solver.step().unwrap(), terminal);
    }

    #[test]
    fn aggregate_coefficient_weights_by_size() {
        let simulated =
            simulate_data(&SimParam::default().with_factors(0).with_dispersion(0.0)).unwrap();
        let formula = FormulaSpec::new("q", "p");
        let result = estimate(
            &simulated.panel,
            &formula,
            &Guess::Scalar(-2.0),
            &GivOptions::default().with_save_panel(true),
        )
        .unwrap();
        let c = result.coefficients()[0];
        assert!(result.coefficients().iter().all(|value| *value == c));
        assert_relative_eq!(result.aggregate_coefficient(), c, epsilon = 1e-12);

        let augmented = result.augmented_panel().unwrap();
        assert_eq!(augmented.len(), simulated.panel.row_count());
        let row = &augmented.rows()[0];
        assert_relative_eq!(row.fitted + row.residual, row.outcome, epsilon = 1e-12);
    }
}

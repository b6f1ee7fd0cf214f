//! Root solver for the GIV moment system and its diagnostics.
//!
//! Exactly identified systems take Newton steps through an LU factorization
//! of the Jacobian. Over-identified systems take Gauss-Newton steps on the
//! weighted objective `mᵀ W m`. Both halve the step until the objective stops
//! increasing.

use log::debug;
use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::moments::{MomentEvaluation, MomentSystem};

/// Configuration for the inner root solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RootOptions {
    /// Supremum norm of the parameter step below which the solve stops.
    pub tolerance: f64,
    /// Maximum number of steps allowed before giving up.
    pub max_iterations: usize,
    /// Maximum number of times a step is halved during the line search.
    pub max_step_halvings: usize,
}

impl Default for RootOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 200,
            max_step_halvings: 30,
        }
    }
}

impl RootOptions {
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(GivError::invalid_configuration(format!(
                "root tolerance must be positive, found {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(GivError::invalid_configuration(
                "root max_iterations must be positive",
            ));
        }
        Ok(())
    }
}

/// Diagnostics returned alongside the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RootSummary {
    /// Number of steps performed.
    pub iterations: usize,
    /// Supremum norm of the final step.
    pub max_step: f64,
    /// Weighted objective `mᵀ W m` at the root.
    pub objective: f64,
    pub converged: bool,
}

/// Parameters, moments and diagnostics at the end of a root solve.
#[derive(Clone, Debug)]
pub struct RootSolution {
    pub parameters: DVector<f64>,
    pub evaluation: MomentEvaluation,
    pub summary: RootSummary,
}

/// Weighted quadratic form `mᵀ W m`.
pub fn objective(moments: &DVector<f64>, weighting: &DMatrix<f64>) -> f64 {
    moments.dot(&(weighting * moments))
}

/// Solves the moment system starting from `start` with a fixed weighting matrix.
pub fn solve_moments(
    system: &MomentSystem,
    start: &DVector<f64>,
    weighting: &DMatrix<f64>,
    options: &RootOptions,
) -> Result<RootSolution> {
    if weighting.nrows() != system.moment_count() || !weighting.is_square() {
        return Err(GivError::dimension_mismatch(
            "weighting rows",
            system.moment_count(),
            weighting.nrows(),
        ));
    }

    let mut parameters = start.clone();
    let mut evaluation = system.evaluate(&parameters)?;
    let mut current = objective(&evaluation.moments, weighting);
    let mut summary = RootSummary {
        iterations: 0,
        max_step: f64::INFINITY,
        objective: current,
        converged: false,
    };

    for iteration in 1..=options.max_iterations {
        summary.iterations = iteration;
        let jacobian = system.jacobian(&evaluation);
        let step = newton_step(&jacobian, &evaluation.moments, weighting)?;
        if step.iter().any(|value| !value.is_finite()) {
            return Err(GivError::NumericalError {
                context: "root step",
            });
        }

        let mut scale = 1.0;
        let mut accepted = None;
        for _ in 0..=options.max_step_halvings {
            let candidate = &parameters + &step * scale;
            if let Ok(next) = system.evaluate(&candidate) {
                let value = objective(&next.moments, weighting);
                if value <= current {
                    accepted = Some((candidate, next, value));
                    break;
                }
            }
            scale *= 0.5;
        }

        let Some((candidate, next, value)) = accepted else {
            // No decrease along the step; the objective is at its numerical floor.
            summary.max_step = step.amax();
            summary.converged = summary.max_step < options.tolerance;
            break;
        };

        summary.max_step = (&candidate - &parameters).amax();
        parameters = candidate;
        evaluation = next;
        current = value;
        summary.objective = current;
        debug!(
            "root iteration {iteration}: step {:.3e}, objective {:.3e}",
            summary.max_step,
            current
        );

        if summary.max_step < options.tolerance {
            summary.converged = true;
            break;
        }
    }

    debug!(
        "root solve finished after {} iterations (converged: {}, objective {:.3e})",
        summary.iterations, summary.converged, summary.objective
    );
    Ok(RootSolution {
        parameters,
        evaluation,
        summary,
    })
}

fn newton_step(
    jacobian: &DMatrix<f64>,
    moments: &DVector<f64>,
    weighting: &DMatrix<f64>,
) -> Result<DVector<f64>> {
    let rhs = -moments;
    if jacobian.is_square() {
        return jacobian
            .clone()
            .lu()
            .solve(&rhs)
            .ok_or_else(|| GivError::singular("moment Jacobian"));
    }
    let jtw = jacobian.transpose() * weighting;
    let normal = &jtw * jacobian;
    let cholesky = Cholesky::new(normal).ok_or_else(|| GivError::singular("J'WJ"))?;
    Ok(cholesky.solve(&(jtw * rhs)))
}

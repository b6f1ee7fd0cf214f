//! Heteroskedastic PCA for entity-by-time matrices with missing cells.
//!
//! Plain PCA on a sample covariance is biased when idiosyncratic noise has
//! entity-specific variance, because that variance piles up on the diagonal.
//! HeteroPCA deletes the diagonal and re-estimates it from the low-rank
//! structure alone. The deflated variant builds the covariance from contiguous
//! time blocks, centering each entity within a block, which also strips slow
//! entity-level drifts that are unrelated to the common factors.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};

/// Relative change of the loading projector that stops iterative imputation.
const LOADING_TOLERANCE: f64 = 1e-6;
/// Relative change of the re-estimated diagonal that stops the HeteroPCA sweeps.
const DIAGONAL_TOLERANCE: f64 = 1e-6;
/// Relative size below which a direction counts as orthogonal.
const ALIGNMENT_TOLERANCE: f64 = 1e-8;

/// How missing cells are filled before the covariance is formed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputeMethod {
    /// Missing cells are set to zero.
    Zero,
    /// Missing cells take the entity's observed mean.
    Mean,
    /// Start from the entity mean, then refill from the fitted low-rank approximation.
    Iterative,
}

/// Factor-extraction algorithm.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PcaAlgorithm {
    /// Full-sample covariance with diagonal deletion.
    #[serde(rename = "HeteroPCA")]
    HeteroPca,
    /// Block covariance over `t_block` periods with diagonal deletion and a
    /// condition-number guard.
    #[serde(rename = "DeflatedHeteroPCA")]
    DeflatedHeteroPca,
}

/// Options consumed by [`PcaAlgorithm::DeflatedHeteroPca`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmOptions {
    /// Number of consecutive periods per covariance block.
    pub t_block: usize,
    /// Largest admissible ratio between the first and the last retained eigenvalue.
    pub condition_number_threshold: f64,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        Self {
            t_block: 10,
            condition_number_threshold: 4.0,
        }
    }
}

/// What to do when the retained eigenvalues are too spread out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditioningPolicy {
    /// Drop the weakest factor and retry.
    ReduceRank,
    /// Return [`GivError::PoorlyConditionedFactors`].
    Fail,
}

/// Configuration of the factor-extraction step.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub impute_method: ImputeMethod,
    /// Subtract each entity's mean before forming the covariance.
    pub demean: bool,
    /// Cap on both the diagonal re-estimation sweeps and the imputation rounds.
    pub maxiter: usize,
    pub algorithm: PcaAlgorithm,
    pub algorithm_options: AlgorithmOptions,
    pub conditioning: ConditioningPolicy,
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            impute_method: ImputeMethod::Zero,
            demean: true,
            maxiter: 50,
            algorithm: PcaAlgorithm::DeflatedHeteroPca,
            algorithm_options: AlgorithmOptions::default(),
            conditioning: ConditioningPolicy::ReduceRank,
        }
    }
}

impl PcaConfig {
    /// Checks that every option is inside its admissible range.
    pub fn validate(&self) -> Result<()> {
        if self.maxiter == 0 {
            return Err(GivError::invalid_configuration("maxiter must be positive"));
        }
        if self.algorithm_options.t_block == 0 {
            return Err(GivError::invalid_configuration("t_block must be positive"));
        }
        let threshold = self.algorithm_options.condition_number_threshold;
        if threshold.is_nan() || threshold <= 0.0 {
            return Err(GivError::invalid_configuration(format!(
                "condition_number_threshold must be positive, found {threshold}"
            )));
        }
        Ok(())
    }

    pub fn with_impute_method(mut self, method: ImputeMethod) -> Self {
        self.impute_method = method;
        self
    }

    pub fn with_demean(mut self, demean: bool) -> Self {
        self.demean = demean;
        self
    }

    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    pub fn with_algorithm(mut self, algorithm: PcaAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_algorithm_options(mut self, options: AlgorithmOptions) -> Self {
        self.algorithm_options = options;
        self
    }

    pub fn with_conditioning(mut self, conditioning: ConditioningPolicy) -> Self {
        self.conditioning = conditioning;
        self
    }

    fn condition_limit(&self) -> f64 {
        match self.algorithm {
            PcaAlgorithm::HeteroPca => f64::INFINITY,
            PcaAlgorithm::DeflatedHeteroPca => self.algorithm_options.condition_number_threshold,
        }
    }
}

/// Extracted latent factors and loadings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FactorModel {
    factors: DMatrix<f64>,
    loadings: DMatrix<f64>,
    eigenvalues: DVector<f64>,
    iterations: usize,
    converged: bool,
}

impl FactorModel {
    /// Number of extracted factors (always at least one).
    pub fn n_pcs(&self) -> usize {
        self.loadings.ncols()
    }

    /// Factor values, `time × k`.
    pub fn factors(&self) -> &DMatrix<f64> {
        &self.factors
    }

    /// Orthonormal loadings, `entity × k`.
    pub fn loadings(&self) -> &DMatrix<f64> {
        &self.loadings
    }

    /// Retained eigenvalues of the denoised covariance, descending.
    pub fn eigenvalues(&self) -> &DVector<f64> {
        &self.eigenvalues
    }

    /// Ratio of the largest to the smallest retained eigenvalue.
    pub fn condition_number(&self) -> f64 {
        let last = self.eigenvalues[self.eigenvalues.len() - 1];
        self.eigenvalues[0] / last
    }

    /// Diagonal sweeps (non-iterative imputation) or imputation rounds performed.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    /// Rotation-invariant projector `L Lᵀ` onto the loading space.
    pub fn projector(&self) -> DMatrix<f64> {
        &self.loadings * self.loadings.transpose()
    }

    /// Low-rank fit `L Fᵀ`, `entity × time`.
    pub fn fitted(&self) -> DMatrix<f64> {
        &self.loadings * self.factors.transpose()
    }

    /// Shifts every factor along `direction` until it is orthogonal to `target`.
    ///
    /// A factor that the shift would cancel is left as it is.
    pub(crate) fn orthogonalize(&mut self, direction: &DVector<f64>, target: &DVector<f64>) {
        let alignment = direction.dot(target);
        if alignment.abs() <= ALIGNMENT_TOLERANCE * direction.norm() * target.norm() {
            return;
        }
        for column in 0..self.factors.ncols() {
            let factor = self.factors.column(column).clone_owned();
            let shifted = &factor - direction * (factor.dot(target) / alignment);
            if shifted.norm() > ALIGNMENT_TOLERANCE * factor.norm() {
                self.factors.set_column(column, &shifted);
            }
        }
    }

    /// Places the loadings of a sub-panel at `rows` of an `n`-entity panel; other rows are zero.
    pub(crate) fn expand_rows(&self, rows: &[usize], n: usize) -> FactorModel {
        let mut loadings = DMatrix::<f64>::zeros(n, self.n_pcs());
        for (source, &target) in rows.iter().enumerate() {
            loadings.set_row(target, &self.loadings.row(source));
        }
        FactorModel {
            factors: self.factors.clone(),
            loadings,
            eigenvalues: self.eigenvalues.clone(),
            iterations: self.iterations,
            converged: self.converged,
        }
    }
}

/// Relative Frobenius distance between two projectors.
pub(crate) fn projector_change(previous: &DMatrix<f64>, current: &DMatrix<f64>) -> f64 {
    (current - previous).norm() / previous.norm().max(f64::EPSILON)
}

#[derive(Clone, Debug)]
struct Spectrum {
    values: DVector<f64>,
    vectors: DMatrix<f64>,
    sweeps: usize,
    converged: bool,
}

/// Heteroskedastic PCA estimator.
#[derive(Clone, Debug, Default)]
pub struct HeteroPca {
    config: PcaConfig,
}

impl HeteroPca {
    pub fn new(config: PcaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PcaConfig {
        &self.config
    }

    /// Extracts `n_pcs` factors from an `entity × time` matrix.
    ///
    /// `observed` flags usable cells; values of unobserved cells are ignored.
    pub fn fit(
        &self,
        data: &DMatrix<f64>,
        observed: &DMatrix<bool>,
        n_pcs: usize,
    ) -> Result<FactorModel> {
        self.config.validate()?;
        let (n, t) = data.shape();
        if observed.nrows() != n {
            return Err(GivError::dimension_mismatch(
                "observation mask rows",
                n,
                observed.nrows(),
            ));
        }
        if observed.ncols() != t {
            return Err(GivError::dimension_mismatch(
                "observation mask columns",
                t,
                observed.ncols(),
            ));
        }
        let max = n.min(t).saturating_sub(1);
        if n_pcs == 0 || n_pcs > max {
            return Err(GivError::InvalidFactorCount {
                requested: n_pcs,
                max,
            });
        }
        for i in 0..n {
            if !observed.row(i).iter().any(|cell| *cell) {
                return Err(GivError::insufficient(format!(
                    "entity row {i} has no observed cells"
                )));
            }
        }
        for j in 0..t {
            if !observed.column(j).iter().any(|cell| *cell) {
                return Err(GivError::insufficient(format!(
                    "time column {j} has no observed cells"
                )));
            }
        }
        if data
            .iter()
            .zip(observed.iter())
            .any(|(value, seen)| *seen && !value.is_finite())
        {
            return Err(GivError::NumericalError {
                context: "factor extraction input",
            });
        }

        let iterative = self.config.impute_method == ImputeMethod::Iterative;
        let rounds = if iterative { self.config.maxiter } else { 1 };
        let mut filled = self.initial_fill(data, observed);
        let mut rank = n_pcs;
        let mut previous: Option<DMatrix<f64>> = None;
        let mut imputation_converged = !iterative;
        let mut performed = 0usize;
        let mut last = None;

        for round in 1..=rounds {
            performed = round;
            let (centered, means) = self.center(&filled);
            let covariance = self.covariance(&centered);
            let spectrum = self.extract(&covariance, rank)?;
            rank = spectrum.values.len();

            let projector = &spectrum.vectors * spectrum.vectors.transpose();
            let change = previous
                .as_ref()
                .map(|old| projector_change(old, &projector));

            if iterative {
                let low_rank = &projector * &centered;
                for j in 0..t {
                    for i in 0..n {
                        if !observed[(i, j)] {
                            filled[(i, j)] = means[i] + low_rank[(i, j)];
                        }
                    }
                }
                debug!(
                    "heteropca imputation round {round}: rank {rank}, projector change {:?}",
                    change
                );
            }

            last = Some((centered, spectrum));
            if change.is_some_and(|value| value < LOADING_TOLERANCE) {
                imputation_converged = true;
                break;
            }
            previous = Some(projector);
        }

        let (centered, spectrum) = last.ok_or_else(|| {
            GivError::invalid_configuration("maxiter must be positive")
        })?;
        let factors = centered.transpose() * &spectrum.vectors;
        let iterations = if iterative { performed } else { spectrum.sweeps };

        Ok(FactorModel {
            factors,
            loadings: spectrum.vectors,
            eigenvalues: spectrum.values,
            iterations,
            converged: spectrum.converged && imputation_converged,
        })
    }

    fn initial_fill(&self, data: &DMatrix<f64>, observed: &DMatrix<bool>) -> DMatrix<f64> {
        let (n, t) = data.shape();
        let mut filled = data.clone();
        for i in 0..n {
            let fill = match self.config.impute_method {
                ImputeMethod::Zero => 0.0,
                ImputeMethod::Mean | ImputeMethod::Iterative => {
                    let (sum, count) = (0..t)
                        .filter(|&j| observed[(i, j)])
                        .fold((0.0, 0usize), |(sum, count), j| {
                            (sum + data[(i, j)], count + 1)
                        });
                    sum / count as f64
                }
            };
            for j in 0..t {
                if !observed[(i, j)] {
                    filled[(i, j)] = fill;
                }
            }
        }
        filled
    }

    fn center(&self, filled: &DMatrix<f64>) -> (DMatrix<f64>, DVector<f64>) {
        if !self.config.demean {
            return (filled.clone(), DVector::<f64>::zeros(filled.nrows()));
        }
        let means = filled.column_mean();
        let mut centered = filled.clone();
        for (i, mut row) in centered.row_iter_mut().enumerate() {
            row.add_scalar_mut(-means[i]);
        }
        (centered, means)
    }

    fn covariance(&self, centered: &DMatrix<f64>) -> DMatrix<f64> {
        let t = centered.ncols();
        match self.config.algorithm {
            PcaAlgorithm::HeteroPca => centered * centered.transpose() / t as f64,
            PcaAlgorithm::DeflatedHeteroPca => {
                let block = self.config.algorithm_options.t_block;
                let starts: Vec<usize> = (0..t).step_by(block).collect();
                let demean = self.config.demean;
                let blocks: Vec<DMatrix<f64>> = starts
                    .par_iter()
                    .map(|&start| {
                        let len = block.min(t - start);
                        let mut slice = centered.columns(start, len).into_owned();
                        if demean {
                            let means = slice.column_mean();
                            for (i, mut row) in slice.row_iter_mut().enumerate() {
                                row.add_scalar_mut(-means[i]);
                            }
                        }
                        &slice * slice.transpose()
                    })
                    .collect();

                let n = centered.nrows();
                let mut total = DMatrix::<f64>::zeros(n, n);
                for cov in &blocks {
                    total += cov;
                }
                total / t as f64
            }
        }
    }

    /// Deflates the covariance and returns a well-conditioned top-`rank` spectrum.
    fn extract(&self, covariance: &DMatrix<f64>, rank: usize) -> Result<Spectrum> {
        let mut deflated = covariance.clone();
        deflated.fill_diagonal(0.0);

        let limit = self.config.condition_limit();
        let mut rank = rank;
        loop {
            let spectrum = self.refine(&deflated, rank);
            let first = spectrum.values[0];
            let last = spectrum.values[rank - 1];
            let condition = if last > 0.0 {
                first / last
            } else {
                f64::INFINITY
            };
            if last > 0.0 && condition <= limit {
                return Ok(spectrum);
            }

            match self.config.conditioning {
                ConditioningPolicy::ReduceRank if rank > 1 => {
                    warn!(
                        "factor spectrum with {rank} components has condition number \
                         {condition:.3e} above {limit}; retrying with {} components",
                        rank - 1
                    );
                    rank -= 1;
                }
                _ => {
                    return Err(GivError::PoorlyConditionedFactors {
                        n_pcs: rank,
                        condition_number: condition,
                        threshold: limit,
                    })
                }
            }
        }
    }

    /// HeteroPCA sweeps: refill the deleted diagonal from the rank-`rank` approximation.
    fn refine(&self, deflated: &DMatrix<f64>, rank: usize) -> Spectrum {
        let mut current = deflated.clone();
        let mut converged = false;
        let mut sweeps = 0usize;

        for sweep in 1..=self.config.maxiter {
            sweeps = sweep;
            let (values, vectors) = top_eigen(&current, rank);
            let low_rank = &vectors * DMatrix::from_diagonal(&values) * vectors.transpose();
            let diagonal = low_rank.diagonal();
            let previous = current.diagonal();
            let change = (&diagonal - &previous).norm() / previous.norm().max(f64::EPSILON);
            current.set_diagonal(&diagonal);
            if change < DIAGONAL_TOLERANCE {
                converged = true;
                break;
            }
        }
        debug!("heteropca diagonal refinement: {sweeps} sweeps, converged {converged}");

        let (values, vectors) = top_eigen(&current, rank);
        Spectrum {
            values,
            vectors,
            sweeps,
            converged,
        }
    }
}

/// Top-`k` eigenpairs of a symmetric matrix, eigenvalues descending.
///
/// Each eigenvector is signed so that its largest-magnitude entry is positive.
fn top_eigen(matrix: &DMatrix<f64>, k: usize) -> (DVector<f64>, DMatrix<f64>) {
    let eigen = SymmetricEigen::new(matrix.clone());
    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));

    let values = DVector::from_iterator(k, order.iter().take(k).map(|&i| eigen.eigenvalues[i]));
    let mut vectors = DMatrix::<f64>::zeros(matrix.nrows(), k);
    for (column, &index) in order.iter().take(k).enumerate() {
        let mut vector = eigen.eigenvectors.column(index).into_owned();
        let pivot = vector
            .iter()
            .copied()
            .fold(0.0f64, |best, value| if value.abs() > best.abs() { value } else { best });
        if pivot < 0.0 {
            vector.neg_mut();
        }
        vectors.set_column(column, &vector);
    }
    (values, vectors)
}

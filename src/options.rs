//! Configuration structures for the GIV estimator.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial JSON or
//! TOML document only needs to name the options it overrides.

use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::heteropca::PcaConfig;
use crate::moments::PeerWeighting;
use crate::solving::RootOptions;

/// Moment system solved for the price coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Exactly identified: one size-weighted peer instrument per entity.
    #[default]
    Iv,
    /// Over-identified: size-weighted and equal-weighted peer instruments,
    /// combined by the GMM weighting matrix.
    Gmm,
}

impl Algorithm {
    /// Peer aggregations that generate one moment each per entity.
    pub fn peer_weightings(self) -> &'static [PeerWeighting] {
        match self {
            Algorithm::Iv => &[PeerWeighting::Size],
            Algorithm::Gmm => &[PeerWeighting::Size, PeerWeighting::Equal],
        }
    }
}

/// Choice of weighting matrix used in the GMM objective.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightingMatrix {
    /// Block-diagonal inverse of the instrument second moments, refreshed at
    /// every outer iteration.
    #[default]
    #[serde(rename = "inverse_ztz")]
    InverseZTZ,
    /// Identity weighting.
    #[serde(rename = "identity")]
    Identity,
}

/// When latent factors are re-extracted from the residuals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorSchedule {
    /// Alternate coefficient updates and factor extraction until both settle.
    #[default]
    EveryIteration,
    /// Extract factors once from the residuals at the initial guess.
    Once,
}

/// Reaction to degenerate entities and to hitting the iteration cap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    /// Exclude degenerate entities with a note and report non-convergence in the result.
    #[default]
    Lenient,
    /// Fail on the first degenerate entity or on non-convergence.
    Strict,
}

/// Aggregated estimator configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GivOptions {
    pub algorithm: Algorithm,
    /// Coefficient and factor change below which the outer iteration stops.
    pub tolerance: f64,
    /// Maximum number of outer iterations.
    pub max_iter: usize,
    pub strictness: Strictness,
    pub factor_schedule: FactorSchedule,
    pub weighting: WeightingMatrix,
    /// Inner root-solver settings.
    pub root: RootOptions,
    /// Factor-extraction settings.
    #[serde(alias = "pca_option")]
    pub pca: PcaConfig,
    /// Attach the augmented panel (coefficients, fitted values, residuals) to the result.
    #[serde(alias = "save_df")]
    pub save_panel: bool,
}

impl Default for GivOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Iv,
            tolerance: 1e-6,
            max_iter: 100,
            strictness: Strictness::Lenient,
            factor_schedule: FactorSchedule::EveryIteration,
            weighting: WeightingMatrix::InverseZTZ,
            root: RootOptions::default(),
            pca: PcaConfig::default(),
            save_panel: false,
        }
    }
}

impl GivOptions {
    /// Checks that every option is inside its admissible range.
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(GivError::invalid_configuration(format!(
                "tolerance must be positive, found {}",
                self.tolerance
            )));
        }
        if self.max_iter == 0 {
            return Err(GivError::invalid_configuration("max_iter must be positive"));
        }
        self.root.validate()?;
        self.pca.validate()
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Set the maximum number of outer iterations.
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn with_factor_schedule(mut self, schedule: FactorSchedule) -> Self {
        self.factor_schedule = schedule;
        self
    }

    pub fn with_weighting(mut self, weighting: WeightingMatrix) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn with_root(mut self, root: RootOptions) -> Self {
        self.root = root;
        self
    }

    /// Override the factor-extraction settings.
    pub fn with_pca(mut self, pca: PcaConfig) -> Self {
        self.pca = pca;
        self
    }

    pub fn with_save_panel(mut self, save_panel: bool) -> Self {
        self.save_panel = save_panel;
        self
    }

    pub(crate) fn is_strict(&self) -> bool {
        self.strictness == Strictness::Strict
    }
}

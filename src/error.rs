use thiserror::Error;

/// Unified error type for `givrs` operations.
#[derive(Debug, Error)]
pub enum GivError {
    /// Raised when the panel violates a structural invariant.
    #[error("malformed panel: {reason}")]
    MalformedPanel { reason: String },

    /// Raised when a formula refers to unknown columns or repeats a term.
    #[error("invalid formula: {reason}")]
    InvalidFormula { reason: String },

    /// Raised when an option value is outside its admissible range.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// Raised when more latent factors are requested than the panel can identify.
    #[error("requested {requested} factors but at most {max} can be extracted")]
    InvalidFactorCount { requested: usize, max: usize },

    /// Raised when a row or column carries no usable observation.
    #[error("insufficient data: {context}")]
    InsufficientData { context: String },

    /// Raised when the extracted factors are numerically unstable and the
    /// configuration forbids reducing the rank.
    #[error(
        "factor extraction with {n_pcs} components is poorly conditioned \
         (condition number {condition_number}, threshold {threshold})"
    )]
    PoorlyConditionedFactors {
        n_pcs: usize,
        condition_number: f64,
        threshold: f64,
    },

    /// Raised when a per-entity starting guess does not match the entity count.
    #[error("guess has {found} values but {expected} are required")]
    GuessDimension { expected: usize, found: usize },

    /// Raised when the moment equations of a single entity cannot be solved.
    #[error("moment matrix for entity `{entity}` is singular")]
    SingularMomentMatrix { entity: String },

    /// Raised when a panel-wide linear system is singular.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        found: usize,
    },

    /// Raised when numerical routines produce NaN or infinities.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Raised in strict mode when the solver stops at the iteration cap.
    #[error(
        "GIV estimation did not converge after {iterations} iterations; \
         last coefficient change {coefficient_change}"
    )]
    NotConverged {
        iterations: usize,
        coefficient_change: f64,
    },
}

impl GivError {
    /// Helper to format a [`MalformedPanel`](GivError::MalformedPanel) error.
    pub fn malformed<S: Into<String>>(reason: S) -> Self {
        Self::MalformedPanel {
            reason: reason.into(),
        }
    }

    /// Helper to format an [`InvalidFormula`](GivError::InvalidFormula) error.
    pub fn invalid_formula<S: Into<String>>(reason: S) -> Self {
        Self::InvalidFormula {
            reason: reason.into(),
        }
    }

    /// Helper to format an [`InvalidConfiguration`](GivError::InvalidConfiguration) error.
    pub fn invalid_configuration<S: Into<String>>(reason: S) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    /// Helper to raise when a row or column has nothing left to work with.
    pub fn insufficient<S: Into<String>>(context: S) -> Self {
        Self::InsufficientData {
            context: context.into(),
        }
    }

    /// Helper to format a [`DimensionMismatch`](GivError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper naming the entity whose moment equations could not be solved.
    pub fn singular_entity<S: Into<String>>(entity: S) -> Self {
        Self::SingularMomentMatrix {
            entity: entity.into(),
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, GivError>;

//! Generalized instrumental variables (GIV) estimation for panel data.
//!
//! GIV identifies how strongly each entity's outcome responds to an endogenous
//! aggregate (a price) by instrumenting it with the size-weighted idiosyncratic
//! shocks of all *other* entities. When common shocks contaminate those
//! residuals, latent factors are extracted from them with heteroskedastic PCA
//! and added to every entity's design as `pc(k)` regressors.
//!
//! The crate is organised as
//!
//! - validated entity-by-time panels (`panel` module),
//! - formula terms mapped onto panel columns (`formula` module),
//! - HeteroPCA and DeflatedHeteroPCA factor extraction (`heteropca` module),
//! - leave-one-out moment conditions and their Jacobian (`moments` module),
//! - the Newton / Gauss-Newton root solver (`solving` module),
//! - the outer estimation loop and its state machine (`estimation` module),
//! - estimation results (`result` module), and
//! - a market-clearing data simulator (`simulation` module).
//!
//! # Quick start
//!
//! ```no_run
//! use givrs::simulation::{simulate_data, SimParam};
//! use givrs::{estimate, FormulaSpec, GivOptions, Guess};
//!
//! let param = SimParam::default().with_exogenous(1);
//! let simulated = simulate_data(&param).expect("valid parameters");
//!
//! // q + id & endog(p) ~ x1 + id + pc(2)
//! let formula = FormulaSpec::new("q", "p")
//!     .heterogeneous()
//!     .pooled("x1")
//!     .fixed_effects()
//!     .pc(2);
//!
//! let result = estimate(&simulated.panel, &formula, &Guess::Scalar(-2.0), &GivOptions::default())
//!     .expect("estimation succeeds");
//! println!("converged: {}", result.converged());
//! println!("price coefficients: {}", result.coefficients());
//! if let Some(factors) = result.pc_factors() {
//!     println!("factors: {} x {}", factors.nrows(), factors.ncols());
//! }
//! ```

pub mod error;
pub mod estimation;
pub mod formula;
pub mod heteropca;
pub mod moments;
pub mod options;
pub mod panel;
pub mod result;
pub mod simulation;
pub mod solving;

pub use error::{GivError, Result};
pub use estimation::{estimate, GivProblem, GivSolver, Guess, IterationSnapshot, SolverState};
pub use formula::{CoefficientScope, FormulaSpec, TermScope};
pub use heteropca::{FactorModel, HeteroPca, PcaConfig};
pub use options::{Algorithm, FactorSchedule, GivOptions, Strictness, WeightingMatrix};
pub use panel::{Observation, Panel, PanelBuilder};
pub use result::ModelResult;
pub use solving::{RootOptions, RootSummary};

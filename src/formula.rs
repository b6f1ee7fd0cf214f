//! Structural description of a GIV specification.
//!
//! Formula strings such as `"q + id & endog(p) ~ x1 + pc(2)"` are parsed by the
//! caller; this type records the resolved intent so the estimator can map
//! terms onto panel columns.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};
use crate::panel::Panel;

/// Whether the price coefficient is shared or entity-specific.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientScope {
    /// One coefficient for every entity (`endog(p)`).
    Homogeneous,
    /// One coefficient per entity (`id & endog(p)`).
    Heterogeneous,
}

/// Whether an exogenous term has a panel-wide or per-entity coefficient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermScope {
    Pooled,
    EntitySpecific,
}

/// An exogenous regressor referenced by panel column name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExogenousTerm {
    pub name: String,
    pub scope: TermScope,
}

/// Represents a resolved GIV formula.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormulaSpec {
    outcome: String,
    endogenous: String,
    price_scope: CoefficientScope,
    exogenous: Vec<ExogenousTerm>,
    fixed_effects: bool,
    n_pcs: usize,
}

impl FormulaSpec {
    /// Creates a specification with a homogeneous price coefficient and no other terms.
    pub fn new<S: Into<String>, P: Into<String>>(outcome: S, endogenous: P) -> Self {
        Self {
            outcome: outcome.into(),
            endogenous: endogenous.into(),
            price_scope: CoefficientScope::Homogeneous,
            exogenous: Vec::new(),
            fixed_effects: false,
            n_pcs: 0,
        }
    }

    /// Estimates one price coefficient per entity.
    pub fn heterogeneous(mut self) -> Self {
        self.price_scope = CoefficientScope::Heterogeneous;
        self
    }

    /// Adds an exogenous regressor with a panel-wide coefficient.
    pub fn pooled<S: Into<String>>(mut self, name: S) -> Self {
        self.exogenous.push(ExogenousTerm {
            name: name.into(),
            scope: TermScope::Pooled,
        });
        self
    }

    /// Adds an exogenous regressor with entity-specific coefficients.
    pub fn entity_specific<S: Into<String>>(mut self, name: S) -> Self {
        self.exogenous.push(ExogenousTerm {
            name: name.into(),
            scope: TermScope::EntitySpecific,
        });
        self
    }

    /// Adds an entity fixed effect (entity-specific intercept).
    pub fn fixed_effects(mut self) -> Self {
        self.fixed_effects = true;
        self
    }

    /// Requests `k` latent factors.
    pub fn pc(mut self, k: usize) -> Self {
        self.n_pcs = k;
        self
    }

    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    pub fn endogenous(&self) -> &str {
        &self.endogenous
    }

    pub fn price_scope(&self) -> CoefficientScope {
        self.price_scope
    }

    pub fn exogenous_terms(&self) -> &[ExogenousTerm] {
        &self.exogenous
    }

    pub fn has_fixed_effects(&self) -> bool {
        self.fixed_effects
    }

    /// Number of latent factors requested by the `pc(k)` term (0 when absent).
    pub fn n_pcs(&self) -> usize {
        self.n_pcs
    }

    /// Maps term names onto panel columns.
    pub(crate) fn resolve(&self, panel: &Panel) -> Result<ResolvedFormula> {
        let mut seen = HashSet::new();
        let mut resolved = ResolvedFormula {
            heterogeneous: self.price_scope == CoefficientScope::Heterogeneous,
            pooled: Vec::new(),
            pooled_names: Vec::new(),
            entity_specific: Vec::new(),
            entity_names: Vec::new(),
            fixed_effects: self.fixed_effects,
            n_pcs: self.n_pcs,
        };

        for term in &self.exogenous {
            if !seen.insert(term.name.as_str()) {
                return Err(GivError::invalid_formula(format!(
                    "term `{}` appears more than once",
                    term.name
                )));
            }
            let column = panel.exogenous_index(&term.name).ok_or_else(|| {
                GivError::invalid_formula(format!("unknown exogenous column `{}`", term.name))
            })?;
            match term.scope {
                TermScope::Pooled => {
                    resolved.pooled.push(column);
                    resolved.pooled_names.push(term.name.clone());
                }
                TermScope::EntitySpecific => {
                    resolved.entity_specific.push(column);
                    resolved.entity_names.push(term.name.clone());
                }
            }
        }

        Ok(resolved)
    }
}

impl fmt::Display for FormulaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} + ", self.outcome)?;
        if self.price_scope == CoefficientScope::Heterogeneous {
            write!(f, "id & ")?;
        }
        write!(f, "endog({}) ~ ", self.endogenous)?;

        let mut terms = Vec::new();
        if self.fixed_effects {
            terms.push("id".to_string());
        }
        for term in &self.exogenous {
            match term.scope {
                TermScope::Pooled => terms.push(term.name.clone()),
                TermScope::EntitySpecific => terms.push(format!("id & {}", term.name)),
            }
        }
        if self.n_pcs > 0 {
            terms.push(format!("pc({})", self.n_pcs));
        }
        if terms.is_empty() {
            write!(f, "0")
        } else {
            write!(f, "{}", terms.join(" + "))
        }
    }
}

/// Formula terms mapped onto panel column indices.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedFormula {
    pub(crate) heterogeneous: bool,
    pub(crate) pooled: Vec<usize>,
    pub(crate) pooled_names: Vec<String>,
    pub(crate) entity_specific: Vec<usize>,
    pub(crate) entity_names: Vec<String>,
    pub(crate) fixed_effects: bool,
    pub(crate) n_pcs: usize,
}

impl ResolvedFormula {
    /// Column names of the entity-specific design for `n_pcs` factors.
    pub(crate) fn design_names(&self, n_pcs: usize) -> Vec<String> {
        let mut names = Vec::new();
        if self.fixed_effects {
            names.push("fe".to_string());
        }
        names.extend(self.entity_names.iter().cloned());
        names.extend((1..=n_pcs).map(|k| format!("pc_{k}")));
        names
    }
}

//! Entity-by-time panel containers and validation utilities used by the GIV estimator.

use std::collections::{BTreeSet, HashMap, HashSet};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{GivError, Result};

/// A single `(entity, time)` record.
///
/// `NaN` in the outcome, price or any exogenous value marks the cell as missing
/// while keeping the row (and its weight) in the panel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub time_id: i64,
    /// Outcome `q`.
    pub outcome: f64,
    /// Endogenous regressor `p`.
    pub price: f64,
    /// Size weight `S`, strictly positive.
    pub weight: f64,
    /// Exogenous regressors, ordered as the builder's column names.
    pub exogenous: Vec<f64>,
}

impl Observation {
    /// Creates an observation without exogenous regressors.
    pub fn new<S: Into<String>>(
        entity_id: S,
        time_id: i64,
        outcome: f64,
        price: f64,
        weight: f64,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            time_id,
            outcome,
            price,
            weight,
            exogenous: Vec::new(),
        }
    }

    /// Attaches exogenous regressor values.
    pub fn with_exogenous(mut self, exogenous: Vec<f64>) -> Self {
        self.exogenous = exogenous;
        self
    }

    fn is_complete(&self) -> bool {
        self.outcome.is_finite()
            && self.price.is_finite()
            && self.exogenous.iter().all(|value| value.is_finite())
    }
}

/// Validated panel stored as dense `entity × time` matrices.
#[derive(Clone, Debug)]
pub struct Panel {
    entity_ids: Vec<String>,
    time_ids: Vec<i64>,
    exogenous_names: Vec<String>,
    outcome: DMatrix<f64>,
    price: DMatrix<f64>,
    weight: DMatrix<f64>,
    exogenous: Vec<DMatrix<f64>>,
    present: DMatrix<bool>,
    observed: DMatrix<bool>,
    rows: Vec<(usize, usize)>,
}

impl Panel {
    /// Number of entities.
    pub fn entity_count(&self) -> usize {
        self.entity_ids.len()
    }

    /// Number of distinct time periods.
    pub fn time_count(&self) -> usize {
        self.time_ids.len()
    }

    /// Number of input rows, including rows whose cell is null-marked.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of observed (non-missing) cells.
    pub fn observation_count(&self) -> usize {
        self.observed.iter().filter(|cell| **cell).count()
    }

    /// Entity identifiers in first-appearance order.
    pub fn entity_ids(&self) -> &[String] {
        &self.entity_ids
    }

    /// Time identifiers in ascending order.
    pub fn time_ids(&self) -> &[i64] {
        &self.time_ids
    }

    /// Names of the exogenous columns.
    pub fn exogenous_names(&self) -> &[String] {
        &self.exogenous_names
    }

    /// Position of an entity identifier.
    pub fn entity_index(&self, entity_id: &str) -> Option<usize> {
        self.entity_ids.iter().position(|id| id == entity_id)
    }

    /// Position of an exogenous column.
    pub fn exogenous_index(&self, name: &str) -> Option<usize> {
        self.exogenous_names.iter().position(|column| column == name)
    }

    /// Outcome matrix (`NaN` where missing).
    pub fn outcome(&self) -> &DMatrix<f64> {
        &self.outcome
    }

    /// Endogenous regressor matrix (`NaN` where missing).
    pub fn price(&self) -> &DMatrix<f64> {
        &self.price
    }

    /// Weight matrix (zero where no row exists).
    pub fn weights(&self) -> &DMatrix<f64> {
        &self.weight
    }

    /// Exogenous column `index` as an `entity × time` matrix.
    pub fn exogenous(&self, index: usize) -> &DMatrix<f64> {
        &self.exogenous[index]
    }

    /// Whether the `(entity, time)` cell is usable for estimation.
    pub fn is_observed(&self, entity: usize, time: usize) -> bool {
        self.observed[(entity, time)]
    }

    /// Observation mask (`true` = observed).
    pub fn observed(&self) -> &DMatrix<bool> {
        &self.observed
    }

    /// Missing-value mask (`true` = missing), covering absent cells and null markers.
    pub fn missing_mask(&self) -> DMatrix<bool> {
        self.observed.map(|cell| !cell)
    }

    /// `(entity, time)` cell of every input row, in input order.
    pub fn rows(&self) -> &[(usize, usize)] {
        &self.rows
    }

    /// Whether an input row exists for the cell, even if it is null-marked.
    pub fn has_row(&self, entity: usize, time: usize) -> bool {
        self.present[(entity, time)]
    }

    /// Observed periods of one entity.
    pub fn entity_slice(&self, entity: usize) -> PanelSlice {
        let indices = (0..self.time_count())
            .filter(|&t| self.observed[(entity, t)])
            .collect::<Vec<_>>();
        PanelSlice {
            outcome: indices.iter().map(|&t| self.outcome[(entity, t)]).collect(),
            price: indices.iter().map(|&t| self.price[(entity, t)]).collect(),
            weight: indices.iter().map(|&t| self.weight[(entity, t)]).collect(),
            indices,
        }
    }

    /// Observed entities of one period.
    pub fn time_slice(&self, time: usize) -> PanelSlice {
        let indices = (0..self.entity_count())
            .filter(|&i| self.observed[(i, time)])
            .collect::<Vec<_>>();
        PanelSlice {
            outcome: indices.iter().map(|&i| self.outcome[(i, time)]).collect(),
            price: indices.iter().map(|&i| self.price[(i, time)]).collect(),
            weight: indices.iter().map(|&i| self.weight[(i, time)]).collect(),
            indices,
        }
    }

    /// Time-averaged weights normalized to sum to one.
    pub fn weight_shares(&self) -> DVector<f64> {
        let mut shares = DVector::<f64>::zeros(self.entity_count());
        for i in 0..self.entity_count() {
            let mut total = 0.0;
            let mut count = 0usize;
            for t in 0..self.time_count() {
                if self.present[(i, t)] {
                    total += self.weight[(i, t)];
                    count += 1;
                }
            }
            if count > 0 {
                shares[i] = total / count as f64;
            }
        }
        let sum = shares.sum();
        shares / sum
    }
}

/// Observed values along one entity or one period.
#[derive(Clone, Debug, PartialEq)]
pub struct PanelSlice {
    /// Time indices (entity slice) or entity indices (time slice).
    pub indices: Vec<usize>,
    pub outcome: Vec<f64>,
    pub price: Vec<f64>,
    pub weight: Vec<f64>,
}

/// Builder that validates keys, weights and widths before constructing a [`Panel`].
#[derive(Debug, Default)]
pub struct PanelBuilder {
    exogenous_names: Vec<String>,
    observations: Vec<Observation>,
    entities: Option<Vec<String>>,
}

impl PanelBuilder {
    /// Start building a panel with the given exogenous column names.
    pub fn new<I, S>(exogenous_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exogenous_names: exogenous_names.into_iter().map(Into::into).collect(),
            observations: Vec::new(),
            entities: None,
        }
    }

    /// Adds one observation.
    pub fn observation(mut self, observation: Observation) -> Self {
        self.observations.push(observation);
        self
    }

    /// Adds a batch of observations.
    pub fn observations<I: IntoIterator<Item = Observation>>(mut self, observations: I) -> Self {
        self.observations.extend(observations);
        self
    }

    /// Declares the entity universe; every declared entity must have a row.
    pub fn entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    /// Finalizes construction after validating the panel invariants.
    pub fn build(self) -> Result<Panel> {
        if self.observations.is_empty() {
            return Err(GivError::malformed("panel has no observations"));
        }
        let width = self.exogenous_names.len();

        let mut entity_ids: Vec<String> = Vec::new();
        let mut entity_lookup: HashMap<String, usize> = HashMap::new();
        if let Some(declared) = &self.entities {
            for id in declared {
                if entity_lookup.contains_key(id) {
                    return Err(GivError::malformed(format!(
                        "entity `{id}` is declared twice"
                    )));
                }
                entity_lookup.insert(id.clone(), entity_ids.len());
                entity_ids.push(id.clone());
            }
        }

        let mut times = BTreeSet::new();
        let mut weight_sum = 0.0f64;
        for (index, obs) in self.observations.iter().enumerate() {
            if obs.exogenous.len() != width {
                return Err(GivError::malformed(format!(
                    "observation {index} has {} exogenous values, expected {width}",
                    obs.exogenous.len()
                )));
            }
            if !obs.weight.is_finite() || obs.weight <= 0.0 {
                return Err(GivError::malformed(format!(
                    "weight at observation {index} must be positive, found {}",
                    obs.weight
                )));
            }
            weight_sum += obs.weight;
            if !entity_lookup.contains_key(&obs.entity_id) {
                if self.entities.is_some() {
                    return Err(GivError::malformed(format!(
                        "entity `{}` is not declared",
                        obs.entity_id
                    )));
                }
                entity_lookup.insert(obs.entity_id.clone(), entity_ids.len());
                entity_ids.push(obs.entity_id.clone());
            }
            times.insert(obs.time_id);
        }
        if !weight_sum.is_finite() || weight_sum <= 0.0 {
            return Err(GivError::malformed("weights are not sum-normalizable"));
        }

        let time_ids: Vec<i64> = times.into_iter().collect();
        let time_lookup: HashMap<i64, usize> = time_ids
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, index))
            .collect();

        let n = entity_ids.len();
        let t = time_ids.len();
        let mut outcome = DMatrix::from_element(n, t, f64::NAN);
        let mut price = DMatrix::from_element(n, t, f64::NAN);
        let mut weight = DMatrix::<f64>::zeros(n, t);
        let mut exogenous = vec![DMatrix::from_element(n, t, f64::NAN); width];
        let mut present = DMatrix::from_element(n, t, false);
        let mut observed = DMatrix::from_element(n, t, false);
        let mut rows = Vec::with_capacity(self.observations.len());
        let mut seen = HashSet::new();

        for obs in &self.observations {
            let i = entity_lookup[&obs.entity_id];
            let j = time_lookup[&obs.time_id];
            if !seen.insert((i, j)) {
                return Err(GivError::malformed(format!(
                    "duplicate observation for entity `{}` at time {}",
                    obs.entity_id, obs.time_id
                )));
            }
            outcome[(i, j)] = obs.outcome;
            price[(i, j)] = obs.price;
            weight[(i, j)] = obs.weight;
            for (column, value) in exogenous.iter_mut().zip(&obs.exogenous) {
                column[(i, j)] = *value;
            }
            present[(i, j)] = true;
            observed[(i, j)] = obs.is_complete();
            rows.push((i, j));
        }

        for (i, id) in entity_ids.iter().enumerate() {
            if !present.row(i).iter().any(|cell| *cell) {
                return Err(GivError::malformed(format!(
                    "entity `{id}` has no observations"
                )));
            }
        }

        Ok(Panel {
            entity_ids,
            time_ids,
            exogenous_names: self.exogenous_names,
            outcome,
            price,
            weight,
            exogenous,
            present,
            observed,
            rows,
        })
    }
}

// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::DEFAULT_POLICY;
use crate::error::{UrnError, UrnResult};
use crate::rng::{RngState, StudyRng};
use crate::urn::UrnTable;

/// Breaks a tie between equally imbalanced urns.
pub trait UrnSelectionPolicy: Send + Sync {
    /// `tied` holds at least two indices into `table`, in table order.
    fn choose(&self, table: &UrnTable, tied: &[usize], rng: &mut StudyRng) -> UrnResult<usize>;
}

/// Picks uniformly among the tied urns.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiasedTowardMax;

impl UrnSelectionPolicy for BiasedTowardMax {
    fn choose(&self, _table: &UrnTable, tied: &[usize], rng: &mut StudyRng) -> UrnResult<usize> {
        let pick = rng.uniform_index(tied.len())?;
        tied.get(pick).copied().ok_or(UrnError::EmptyChoice)
    }
}

/// Picks uniformly among every urn in the table.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniform;

impl UrnSelectionPolicy for Uniform {
    fn choose(&self, table: &UrnTable, _tied: &[usize], rng: &mut StudyRng) -> UrnResult<usize> {
        rng.uniform_index(table.len())
    }
}

/// Named selection policies. Studies refer to a policy by name, so a
/// name must stay bound to the same behaviour for a study's lifetime.
#[derive(Clone)]
pub struct PolicyRegistry {
    policies: BTreeMap<String, Arc<dyn UrnSelectionPolicy>>,
}

impl PolicyRegistry {
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        policy: Arc<dyn UrnSelectionPolicy>,
    ) -> UrnResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(UrnError::validation("policy name must be non-empty"));
        }
        if self.policies.contains_key(&name) {
            return Err(UrnError::validation(format!(
                "policy {name:?} is already registered"
            )));
        }
        self.policies.insert(name, policy);
        Ok(())
    }

    pub fn get(&self, name: &str) -> UrnResult<Arc<dyn UrnSelectionPolicy>> {
        self.policies
            .get(name)
            .cloned()
            .ok_or_else(|| UrnError::validation(format!("unknown urn selection policy {name:?}")))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut policies: BTreeMap<String, Arc<dyn UrnSelectionPolicy>> = BTreeMap::new();
        policies.insert(DEFAULT_POLICY.to_string(), Arc::new(BiasedTowardMax));
        policies.insert("uniform".to_string(), Arc::new(Uniform));
        Self { policies }
    }
}

impl std::fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.policies.keys()).finish()
    }
}

/// Outcome of one selection. Nothing is committed until the caller has
/// persisted the row; dropping an `Assignment` leaves the study as it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub urn: usize,
    pub factor: String,
    pub level: String,
    pub treatment: String,
    pub next_state: RngState,
}

/// Chooses an urn and draws a treatment ball from it, starting from
/// `state`. When one urn is strictly most imbalanced no draw is spent on
/// urn selection.
pub fn assign(
    table: &UrnTable,
    policy: &dyn UrnSelectionPolicy,
    state: &RngState,
) -> UrnResult<Assignment> {
    let tied = table.most_imbalanced();
    let mut rng = StudyRng::restore(state);
    let urn_idx = match tied.as_slice() {
        [] => return Err(UrnError::EmptyChoice),
        [only] => *only,
        _ => policy.choose(table, &tied, &mut rng)?,
    };
    let urn = table.urns.get(urn_idx).ok_or(UrnError::EmptyChoice)?;
    let balls = urn.balls();
    let ball = if urn.total_balls == 0 {
        rng.uniform_index(urn.rows.len())?
    } else {
        rng.weighted_index(&balls)?
    };
    let treatment = urn
        .rows
        .get(ball)
        .map(|r| r.treatment.clone())
        .ok_or(UrnError::EmptyChoice)?;
    Ok(Assignment {
        urn: urn_idx,
        factor: urn.factor.clone(),
        level: urn.level.clone(),
        treatment,
        next_state: rng.snapshot(),
    })
}

// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::Serialize;

use crate::config::StudyConfig;
use crate::error::{UrnError, UrnResult};
use crate::imbalance::{evaluate, Imbalance};
use crate::participant::{FactorLevels, ParticipantRow};
use crate::store::ParticipantStore;

/// Ball count of one treatment inside one urn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrnRow {
    pub treatment: String,
    pub n_assignments: u64,
    pub balls: u64,
}

/// One `(factor, level)` urn, annotated with its imbalance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Urn {
    pub factor: String,
    pub level: String,
    pub rows: Vec<UrnRow>,
    pub total_balls: u64,
    pub d: Imbalance,
}

impl Urn {
    fn build(config: &StudyConfig, factor: &str, level: &str, counts: &[u64]) -> UrnResult<Self> {
        let k_urn: u64 = counts.iter().sum();
        let mut rows = Vec::with_capacity(counts.len());
        for (treatment, &n) in config.treatments.iter().zip(counts) {
            rows.push(UrnRow {
                treatment: treatment.clone(),
                n_assignments: n,
                balls: ball_count(config, n, k_urn - n)?,
            });
        }
        let weights: Vec<u64> = rows.iter().map(|r| r.balls).collect();
        let total_balls = weights
            .iter()
            .try_fold(0u64, |acc, b| acc.checked_add(*b))
            .ok_or_else(|| UrnError::validation("ball counts too large to score"))?;
        let d = evaluate(config.imbalance_rule, &weights)?;
        Ok(Self {
            factor: factor.to_string(),
            level: level.to_string(),
            rows,
            total_balls,
            d,
        })
    }

    pub fn balls(&self) -> Vec<u64> {
        self.rows.iter().map(|r| r.balls).collect()
    }
}

/// `w + alpha * n_same + beta * n_other`.
pub fn ball_count(config: &StudyConfig, n_same: u64, n_other: u64) -> UrnResult<u64> {
    config
        .alpha
        .checked_mul(n_same)
        .and_then(|same| config.beta.checked_mul(n_other).map(|other| (same, other)))
        .and_then(|(same, other)| config.w.checked_add(same)?.checked_add(other))
        .ok_or_else(|| UrnError::validation("ball counts too large to score"))
}

/// The urns relevant to one participant, ascending by factor name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrnTable {
    pub urns: Vec<Urn>,
}

impl UrnTable {
    pub fn len(&self) -> usize {
        self.urns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urns.is_empty()
    }

    /// Indices of the urns sharing the maximum `d`, in table order.
    pub fn most_imbalanced(&self) -> Vec<usize> {
        let Some(max) = self.urns.iter().map(|u| u.d).max() else {
            return Vec::new();
        };
        self.urns
            .iter()
            .enumerate()
            .filter(|(_, u)| u.d == max)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Builds the table for `levels` from the study's current history. One
/// filtered query per factor; callers hold the study gate so the reads
/// see a single history.
pub fn aggregate(
    config: &StudyConfig,
    levels: &FactorLevels,
    store: &dyn ParticipantStore,
) -> UrnResult<UrnTable> {
    config.check_levels(levels)?;
    let mut urns = Vec::with_capacity(config.factors.len());
    for (factor, level) in levels {
        let filter = FactorLevels::from([(factor.clone(), level.clone())]);
        let mut counts = vec![0u64; config.treatments.len()];
        for row in store.list(&config.name, &filter)? {
            let idx = config.treatment_index(&row.trt).ok_or_else(|| {
                UrnError::Storage(format!(
                    "row {} carries unknown treatment {:?}",
                    row.id, row.trt
                ))
            })?;
            counts[idx] += 1;
        }
        urns.push(Urn::build(config, factor, level, &counts)?);
    }
    tracing::debug!(target: "urnrand.urn", study = %config.name, ?urns, "urn table");
    Ok(UrnTable { urns })
}

/// Running per-urn treatment counts, advanced one row at a time. Used to
/// replay a history without re-querying the store for every row.
#[derive(Debug, Default)]
pub struct UrnCounts {
    by_urn: HashMap<(String, String), Vec<u64>>,
}

impl UrnCounts {
    pub fn record(&mut self, config: &StudyConfig, row: &ParticipantRow) -> UrnResult<()> {
        let idx = config.treatment_index(&row.trt).ok_or_else(|| {
            UrnError::validation(format!("row {} carries unknown treatment {:?}", row.id, row.trt))
        })?;
        for (factor, level) in &row.levels {
            let counts = self
                .by_urn
                .entry((factor.clone(), level.clone()))
                .or_insert_with(|| vec![0; config.treatments.len()]);
            counts[idx] += 1;
        }
        Ok(())
    }

    pub fn table(&self, config: &StudyConfig, levels: &FactorLevels) -> UrnResult<UrnTable> {
        config.check_levels(levels)?;
        let empty = vec![0u64; config.treatments.len()];
        let urns = levels
            .iter()
            .map(|(factor, level)| {
                let counts = self
                    .by_urn
                    .get(&(factor.clone(), level.clone()))
                    .unwrap_or(&empty);
                Urn::build(config, factor, level, counts)
            })
            .collect::<UrnResult<Vec<_>>>()?;
        Ok(UrnTable { urns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{two_arm_site_study, ImbalanceRule};
    use crate::store::tests::row;
    use crate::store::MemoryParticipantStore;
    use proptest::prelude::*;

    fn north() -> FactorLevels {
        FactorLevels::from([("site".to_string(), "north".to_string())])
    }

    #[test]
    fn empty_history_yields_initial_composition() {
        let config = two_arm_site_study("s");
        let store = MemoryParticipantStore::default();
        store.init_study("s").unwrap();
        let table = aggregate(&config, &north(), &store).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.urns[0].balls(), vec![1, 1]);
        assert_eq!(table.urns[0].total_balls, 2);
        assert!(table.urns[0].d.is_zero());
    }

    #[test]
    fn one_prior_assignment_reshapes_the_urn() {
        let config = two_arm_site_study("s");
        let store = MemoryParticipantStore::default();
        store.init_study("s").unwrap();
        store.append("s", row("p1", "north", "A")).unwrap();
        store.append("s", row("p2", "south", "B")).unwrap();
        let table = aggregate(&config, &north(), &store).unwrap();
        let urn = &table.urns[0];
        assert_eq!(urn.level, "north");
        assert_eq!(urn.balls(), vec![3, 2]);
        assert_eq!(urn.rows[0].n_assignments, 1);
        assert_eq!(urn.rows[1].n_assignments, 0);
        assert_eq!(urn.total_balls, 5);
    }

    #[test]
    fn incremental_counts_agree_with_store_aggregation() {
        let config = two_arm_site_study("s");
        let store = MemoryParticipantStore::default();
        store.init_study("s").unwrap();
        let mut counts = UrnCounts::default();
        for (i, (site, trt)) in [("north", "A"), ("north", "B"), ("south", "A"), ("north", "A")]
            .iter()
            .enumerate()
        {
            let r = row(&format!("p{i}"), site, trt);
            counts.record(&config, &r).unwrap();
            store.append("s", r).unwrap();
        }
        assert_eq!(
            counts.table(&config, &north()).unwrap(),
            aggregate(&config, &north(), &store).unwrap()
        );
    }

    #[test]
    fn ties_are_reported_in_factor_order() {
        let mut config = two_arm_site_study("s");
        config
            .factors
            .insert("arm".into(), vec!["x".into(), "y".into()]);
        let levels = FactorLevels::from([
            ("site".to_string(), "north".to_string()),
            ("arm".to_string(), "x".to_string()),
        ]);
        let table = UrnCounts::default().table(&config, &levels).unwrap();
        assert_eq!(table.urns[0].factor, "arm");
        assert_eq!(table.most_imbalanced(), vec![0, 1]);
    }

    #[test]
    fn unknown_factor_is_rejected_before_reading() {
        let config = two_arm_site_study("s");
        let store = MemoryParticipantStore::default();
        let levels = FactorLevels::from([
            ("site".to_string(), "north".to_string()),
            ("age".to_string(), "old".to_string()),
        ]);
        assert_eq!(
            aggregate(&config, &levels, &store),
            Err(UrnError::UnknownFactor("age".into()))
        );
    }

    proptest! {
        #[test]
        fn ball_count_law_holds(
            w in 0u64..5, alpha in 0u64..5, beta in 0u64..5,
            picks in proptest::collection::vec(0usize..3, 0..40),
        ) {
            let mut config = two_arm_site_study("s");
            config.w = w;
            config.alpha = alpha;
            config.beta = beta;
            config.imbalance_rule = ImbalanceRule::Variance;
            config.treatments = vec!["A".into(), "B".into(), "C".into()];
            let mut counts = UrnCounts::default();
            for (i, p) in picks.iter().enumerate() {
                let r = row(&format!("p{i}"), "north", &config.treatments[*p]);
                counts.record(&config, &r).unwrap();
            }
            let k_urn = picks.len() as u64;
            let urn = counts.table(&config, &north()).unwrap().urns.remove(0);
            for (t, urn_row) in urn.rows.iter().enumerate() {
                let n_t = picks.iter().filter(|p| **p == t).count() as u64;
                prop_assert_eq!(urn_row.n_assignments, n_t);
                prop_assert_eq!(urn_row.balls, w + alpha * n_t + beta * (k_urn - n_t));
            }
        }
    }
}

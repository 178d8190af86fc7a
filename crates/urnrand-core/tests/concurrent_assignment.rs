// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Several coordinators, and several threads per coordinator, assigning
//! into one data directory. The persisted chain must stay a single
//! sequence: no id twice, every row drawn from its predecessor's state.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::thread;

use urnrand_core::config::DEFAULT_POLICY;
use urnrand_core::{Coordinator, FactorLevels, ImbalanceRule, NewParticipant, StudyConfig, UrnError};

const AFTER_P1: &str = "55524e524e4701014d41f891641d4be558290df62995ad732d7f954c2df451584f8167f77e7b0514";
const AFTER_P2: &str = "55524e524e470101ee169b0f049c79908d25a636788331192d7f954c2df451584f8167f77e7b0514";

fn reference_study(name: &str) -> StudyConfig {
    StudyConfig {
        name: name.to_string(),
        w: 1,
        alpha: 2,
        beta: 1,
        starting_seed: Some(42),
        imbalance_rule: ImbalanceRule::Range,
        urn_selection_policy: DEFAULT_POLICY.to_string(),
        treatments: vec!["A".to_string(), "B".to_string()],
        factors: BTreeMap::from([(
            "site".to_string(),
            vec!["north".to_string(), "south".to_string()],
        )]),
    }
}

fn at(site: &str) -> FactorLevels {
    FactorLevels::from([("site".to_string(), site.to_string())])
}

fn open(dir: &Path) -> Coordinator {
    Coordinator::open_data_dir(dir, false).unwrap()
}

#[test]
fn second_coordinator_continues_the_first_ones_chain() {
    let dir = tempfile::tempdir().unwrap();
    let a = open(dir.path());
    let b = open(dir.path());
    a.create(reference_study("trial")).unwrap();
    assert_eq!(b.status("trial").unwrap().rows, 0);

    let first = a
        .randomize("trial", NewParticipant::new("p1", "nurse", at("north")))
        .unwrap();
    assert_eq!(first.bg_state.unwrap().to_hex(), AFTER_P1);

    assert_eq!(
        b.randomize("trial", NewParticipant::new("p1", "nurse", at("south"))),
        Err(UrnError::DuplicateParticipantId("p1".into()))
    );
    let second = b
        .randomize("trial", NewParticipant::new("p2", "nurse", at("north")))
        .unwrap();
    assert_eq!(second.trt, "B");
    assert_eq!(second.bg_state.unwrap().to_hex(), AFTER_P2);

    let reopened = open(dir.path());
    let ids: Vec<String> = reopened
        .export_history("trial")
        .unwrap()
        .map(|r| r.id.clone())
        .collect();
    assert_eq!(ids, vec!["p1", "p2"]);
    let report = reopened.verify_history("trial").unwrap();
    assert_eq!(report.verified, 2);
    assert!(report.is_clean());
}

#[test]
fn creating_the_same_study_from_two_coordinators_succeeds_once() {
    let dir = tempfile::tempdir().unwrap();
    let a = open(dir.path());
    let b = open(dir.path());
    a.create(reference_study("trial")).unwrap();
    assert!(matches!(
        b.create(reference_study("trial")),
        Err(UrnError::Validation(_))
    ));
}

#[test]
fn concurrent_writers_keep_one_totally_ordered_chain() {
    const PER_THREAD: usize = 10;
    const CONTESTED: usize = 5;

    let dir = tempfile::tempdir().unwrap();
    let shared = Arc::new(open(dir.path()));
    shared.create(reference_study("trial")).unwrap();

    let mut workers = Vec::new();
    for worker in 0..4usize {
        let coordinator = if worker < 2 {
            Arc::clone(&shared)
        } else {
            Arc::new(open(dir.path()))
        };
        workers.push(thread::spawn(move || {
            let mut won = 0usize;
            for i in 0..PER_THREAD {
                let site = if (worker + i) % 2 == 0 { "north" } else { "south" };
                coordinator
                    .randomize(
                        "trial",
                        NewParticipant::new(format!("w{worker}-{i}"), "nurse", at(site)),
                    )
                    .unwrap();
                if i < CONTESTED {
                    match coordinator.randomize(
                        "trial",
                        NewParticipant::new(format!("shared-{i}"), "nurse", at(site)),
                    ) {
                        Ok(_) => won += 1,
                        Err(UrnError::DuplicateParticipantId(_)) => {}
                        Err(other) => panic!("unexpected error: {other:?}"),
                    }
                }
            }
            won
        }));
    }
    let won: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(won, CONTESTED);

    let total = 4 * PER_THREAD + CONTESTED;
    let reopened = open(dir.path());
    let ids: Vec<String> = reopened
        .export_history("trial")
        .unwrap()
        .map(|r| r.id.clone())
        .collect();
    assert_eq!(ids.len(), total);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), total);

    let status = reopened.status("trial").unwrap();
    assert_eq!(status.rows, total as u64);
    assert_eq!(status.treatment_totals.values().sum::<u64>(), total as u64);

    let report = reopened.verify_history("trial").unwrap();
    assert_eq!(report.verified, total as u64);
    assert!(report.is_clean(), "{:?}", report.divergence);
    assert_eq!(shared.status("trial").unwrap().history_root_hex, status.history_root_hex);
}

// Copyright [2026] [urnrand Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

//! Study-level orchestration. Every operation that reads the latest
//! generator state and appends rows runs under the study's gate and the
//! participant store's study lock, so the persisted state chain is totally
//! ordered per study even with several coordinators on one data directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use time::OffsetDateTime;

use crate::audit::Hash32;
use crate::clock::{Clock, SystemClock};
use crate::config::{keys, StudyConfig};
use crate::config_store::{ConfigStore, FileConfigStore};
use crate::error::{UrnError, UrnResult};
use crate::participant::{
    check_participant_id, FactorLevels, HistoryRow, NewParticipant, ParticipantRow,
};
use crate::participant_log::FileParticipantStore;
use crate::rng::{fresh_seed, DummyRng, RngState};
use crate::selection::{assign, PolicyRegistry, UrnSelectionPolicy};
use crate::store::{ParticipantStore, RowStream};
use crate::urn::{aggregate, UrnCounts, UrnTable};

/// Largest cohort one `generate_dummies` call will synthesise.
pub const MAX_DUMMY_COHORT: usize = 100_000;

/// Cached per-study state: the validated configuration, its resolved
/// policy, and the gate serializing state-chain updates.
struct StudyHandle {
    config: StudyConfig,
    policy: Arc<dyn UrnSelectionPolicy>,
    seed_state: Option<RngState>,
    gate: Mutex<()>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub imported: u64,
    /// Rows stored without a generator snapshot; they cannot be replayed.
    pub without_snapshot: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub index: usize,
    pub id: String,
    pub error: UrnError,
}

/// Result of a batch upload. Rows before `failed.index` are committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub assigned: Vec<ParticipantRow>,
    pub failed: Option<UploadFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudyStatus {
    pub study: String,
    pub rows: u64,
    pub treatment_totals: BTreeMap<String, u64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_assigned_at: Option<OffsetDateTime>,
    pub history_root_hex: String,
    /// First row from which every row carries a snapshot; `None` when the
    /// newest row has none.
    pub reproducible_from_row: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub row: u64,
    pub id: String,
    pub recorded_trt: String,
    pub replayed_trt: String,
    pub state_matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub study: String,
    pub rows: u64,
    pub verified: u64,
    pub skipped: u64,
    pub divergence: Option<Divergence>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.divergence.is_none()
    }
}

pub struct Coordinator {
    configs: Arc<dyn ConfigStore>,
    participants: Arc<dyn ParticipantStore>,
    policies: PolicyRegistry,
    clock: Arc<dyn Clock>,
    studies: RwLock<HashMap<String, Arc<StudyHandle>>>,
}

impl Coordinator {
    pub fn new(configs: Arc<dyn ConfigStore>, participants: Arc<dyn ParticipantStore>) -> Self {
        Self {
            configs,
            participants,
            policies: PolicyRegistry::default(),
            clock: Arc::new(SystemClock),
            studies: RwLock::new(HashMap::new()),
        }
    }

    /// File-backed stores rooted at `data_dir`.
    pub fn open_data_dir(data_dir: &Path, fsync: bool) -> UrnResult<Self> {
        let configs = FileConfigStore::open(data_dir)?;
        let participants = FileParticipantStore::open(data_dir, fsync)?;
        Ok(Self::new(Arc::new(configs), Arc::new(participants)))
    }

    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn studies(&self) -> UrnResult<Vec<String>> {
        self.configs.studies()
    }

    /// Validates and persists a new study. A study without a starting seed
    /// gets one from the OS so that it stays reproducible.
    pub fn create(&self, mut config: StudyConfig) -> UrnResult<StudyConfig> {
        config.validate()?;
        let policy = self.policies.get(&config.urn_selection_policy)?;
        let mut studies = self.studies.write();
        self.participants.init_study(&config.name)?;
        let _store = self.participants.lock_study(&config.name)?;
        if studies.contains_key(&config.name) || self.configs.get(&config.name, keys::W)?.is_some() {
            return Err(UrnError::validation(format!(
                "study {:?} already exists",
                config.name
            )));
        }
        if config.starting_seed.is_none() {
            config.starting_seed = Some(fresh_seed());
        }
        self.configs.set_all(&config.name, &config.to_entries()?)?;
        tracing::info!(
            target: "urnrand.study",
            event = "study_created",
            study = %config.name,
            treatments = config.treatments.len(),
            factors = config.factors.len(),
            rule = %config.imbalance_rule,
            policy = %config.urn_selection_policy,
            "created study"
        );
        let handle = Arc::new(StudyHandle::new(config.clone(), policy));
        studies.insert(config.name.clone(), handle);
        Ok(config)
    }

    fn handle(&self, study: &str) -> UrnResult<Arc<StudyHandle>> {
        if let Some(handle) = self.studies.read().get(study) {
            return Ok(Arc::clone(handle));
        }
        let mut studies = self.studies.write();
        if let Some(handle) = studies.get(study) {
            return Ok(Arc::clone(handle));
        }
        let config = StudyConfig::load(study, self.configs.as_ref())?;
        let policy = self.policies.get(&config.urn_selection_policy)?;
        self.participants.init_study(study)?;
        let handle = Arc::new(StudyHandle::new(config, policy));
        studies.insert(study.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    pub fn config(&self, study: &str) -> UrnResult<StudyConfig> {
        Ok(self.handle(study)?.config.clone())
    }

    /// Assigns a treatment to one participant and persists the row.
    pub fn randomize(&self, study: &str, participant: NewParticipant) -> UrnResult<ParticipantRow> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        self.randomize_locked(&handle, participant)
    }

    fn randomize_locked(
        &self,
        handle: &StudyHandle,
        participant: NewParticipant,
    ) -> UrnResult<ParticipantRow> {
        let config = &handle.config;
        participant.check_id()?;
        config.check_levels(&participant.levels)?;
        if self.participants.contains(&config.name, &participant.id)? {
            return Err(UrnError::DuplicateParticipantId(participant.id));
        }
        let state = self.current_state(handle)?;
        let table = aggregate(config, &participant.levels, self.participants.as_ref())?;
        let assignment = assign(&table, handle.policy.as_ref(), &state)?;
        let row = ParticipantRow {
            id: participant.id,
            user: participant.user,
            levels: participant.levels,
            trt: assignment.treatment,
            datetime: self.clock.now_utc(),
            bg_state: Some(assignment.next_state.to_blob()),
        };
        let index = self.participants.append(&config.name, row.clone())?;
        tracing::info!(
            target: "urnrand.assign",
            event = "participant_randomized",
            study = %config.name,
            participant = %row.id,
            factor = %assignment.factor,
            level = %assignment.level,
            treatment = %row.trt,
            row = index,
            "assigned treatment"
        );
        Ok(row)
    }

    /// State the next draw starts from: the newest row's snapshot, or the
    /// starting seed for an empty study.
    fn current_state(&self, handle: &StudyHandle) -> UrnResult<RngState> {
        let study = &handle.config.name;
        match self.participants.latest_rng_state(study)? {
            Some(blob) => RngState::from_blob(&blob),
            None if self.participants.count(study)? == 0 => handle.seed_state(),
            None => Err(UrnError::IncompatibleRngState(format!(
                "newest row of study {study} has no generator snapshot"
            ))),
        }
    }

    /// Appends a history produced elsewhere, all rows or none. When the
    /// final row has no snapshot it is given the starting-seed state so the
    /// study can continue; earlier rows without one stay unreproducible.
    pub fn import_history(&self, study: &str, rows: Vec<HistoryRow>) -> UrnResult<ImportSummary> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        let config = &handle.config;
        let now = self.clock.now_utc();
        let last = rows.len().checked_sub(1);
        let mut seen = HashSet::with_capacity(rows.len());
        let mut prepared = Vec::with_capacity(rows.len());
        for (idx, row) in rows.into_iter().enumerate() {
            check_participant_id(&row.id)?;
            config.check_levels(&row.levels)?;
            if config.treatment_index(&row.trt).is_none() {
                return Err(UrnError::validation(format!(
                    "row {idx} ({}): unknown treatment {:?}",
                    row.id, row.trt
                )));
            }
            if !seen.insert(row.id.clone()) || self.participants.contains(study, &row.id)? {
                return Err(UrnError::DuplicateParticipantId(row.id));
            }
            let bg_state = match row.bg_state {
                Some(blob) => {
                    RngState::from_blob(&blob)?;
                    Some(blob)
                }
                None if Some(idx) == last => Some(handle.seed_state()?.to_blob()),
                None => None,
            };
            prepared.push(ParticipantRow {
                id: row.id,
                user: row.user,
                levels: row.levels,
                trt: row.trt,
                datetime: row.datetime.unwrap_or(now),
                bg_state,
            });
        }
        let summary = ImportSummary {
            imported: prepared.len() as u64,
            without_snapshot: prepared.iter().filter(|r| r.bg_state.is_none()).count() as u64,
        };
        self.participants.bulk_import(study, prepared)?;
        if summary.without_snapshot > 0 {
            tracing::warn!(
                target: "urnrand.import",
                event = "lossy_import",
                study,
                rows_without_snapshot = summary.without_snapshot,
                "imported rows without generator snapshots; they cannot be replayed"
            );
        }
        tracing::info!(
            target: "urnrand.import",
            event = "history_imported",
            study,
            rows = summary.imported,
            "imported assignment history"
        );
        Ok(summary)
    }

    /// Randomizes each participant in order, stopping at the first failure.
    pub fn upload_new_participants(
        &self,
        study: &str,
        participants: Vec<NewParticipant>,
    ) -> UrnResult<UploadOutcome> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        let mut assigned = Vec::with_capacity(participants.len());
        for (index, participant) in participants.into_iter().enumerate() {
            let id = participant.id.clone();
            match self.randomize_locked(&handle, participant) {
                Ok(row) => assigned.push(row),
                Err(error) => {
                    tracing::warn!(
                        target: "urnrand.assign",
                        event = "upload_stopped",
                        study,
                        index,
                        participant = %id,
                        error = %error,
                        "upload stopped at failing row"
                    );
                    return Ok(UploadOutcome {
                        assigned,
                        failed: Some(UploadFailure { index, id, error }),
                    });
                }
            }
        }
        Ok(UploadOutcome {
            assigned,
            failed: None,
        })
    }

    /// Routes `n` synthetic participants through `randomize`. Their levels
    /// come from a generator seeded with `seed`, never from the study's.
    /// `n` is capped at [`MAX_DUMMY_COHORT`].
    pub fn generate_dummies(
        &self,
        study: &str,
        n: usize,
        seed: u64,
    ) -> UrnResult<Vec<ParticipantRow>> {
        if n > MAX_DUMMY_COHORT {
            return Err(UrnError::validation(format!(
                "dummy cohort of {n} exceeds the limit of {MAX_DUMMY_COHORT}"
            )));
        }
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        let mut dummy_rng = DummyRng::new(seed);
        let mut next_id = self.participants.count(study)?;
        let mut rows = Vec::with_capacity(n);
        for _ in 0..n {
            let id = loop {
                let candidate = format!("dummy-{next_id}");
                next_id += 1;
                if !self.participants.contains(study, &candidate)? {
                    break candidate;
                }
            };
            let mut levels = FactorLevels::new();
            for (factor, permitted) in &handle.config.factors {
                levels.insert(factor.clone(), dummy_rng.pick(permitted)?.clone());
            }
            let participant = NewParticipant::new(id, "dummy", levels);
            rows.push(self.randomize_locked(&handle, participant)?);
        }
        tracing::info!(
            target: "urnrand.assign",
            event = "dummies_generated",
            study,
            count = rows.len(),
            seed,
            "generated dummy cohort"
        );
        Ok(rows)
    }

    /// Every row of the study in insertion order.
    pub fn export_history(&self, study: &str) -> UrnResult<RowStream> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        self.participants.list(study, &FactorLevels::new())
    }

    pub fn status(&self, study: &str) -> UrnResult<StudyStatus> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        let mut treatment_totals: BTreeMap<String, u64> = handle
            .config
            .treatments
            .iter()
            .map(|t| (t.clone(), 0))
            .collect();
        let mut rows = 0u64;
        let mut last_assigned_at = None;
        let mut reproducible_from_row = Some(0);
        for row in self.participants.list(study, &FactorLevels::new())? {
            *treatment_totals.entry(row.trt.clone()).or_default() += 1;
            if row.bg_state.is_none() {
                reproducible_from_row = None;
            } else if reproducible_from_row.is_none() {
                reproducible_from_row = Some(rows);
            }
            last_assigned_at = Some(row.datetime);
            rows += 1;
        }
        let root: Hash32 = self.participants.history_root(study)?;
        Ok(StudyStatus {
            study: study.to_string(),
            rows,
            treatment_totals,
            last_assigned_at,
            history_root_hex: hex::encode(root),
            reproducible_from_row,
        })
    }

    /// The urn table a participant with `levels` would be scored against.
    pub fn urn_table(&self, study: &str, levels: &FactorLevels) -> UrnResult<UrnTable> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        aggregate(&handle.config, levels, self.participants.as_ref())
    }

    /// Replays the history and compares every replayable row against what
    /// the engine would have assigned from its predecessor's state. Rows
    /// without a snapshot, rows following one, and import anchors (rows
    /// holding the starting-seed state) are skipped.
    pub fn verify_history(&self, study: &str) -> UrnResult<VerifyReport> {
        let handle = self.handle(study)?;
        let _gate = handle.gate.lock();
        let _store = self.participants.lock_study(study)?;
        let config = &handle.config;
        let seed_state = handle.seed_state()?;
        let mut counts = UrnCounts::default();
        let mut prev = Some(seed_state);
        let mut report = VerifyReport {
            study: study.to_string(),
            rows: 0,
            verified: 0,
            skipped: 0,
            divergence: None,
        };
        for row in self.participants.list(study, &FactorLevels::new())? {
            let index = report.rows;
            report.rows += 1;
            let recorded = row.bg_state.as_ref().map(RngState::from_blob).transpose()?;
            match (prev, recorded) {
                (Some(before), Some(after)) if after != seed_state => {
                    let table = counts.table(config, &row.levels)?;
                    let replayed = assign(&table, handle.policy.as_ref(), &before)?;
                    if replayed.treatment != row.trt || replayed.next_state != after {
                        report.divergence = Some(Divergence {
                            row: index,
                            id: row.id.clone(),
                            recorded_trt: row.trt.clone(),
                            replayed_trt: replayed.treatment,
                            state_matches: replayed.next_state == after,
                        });
                        break;
                    }
                    report.verified += 1;
                }
                _ => report.skipped += 1,
            }
            counts.record(config, &row)?;
            prev = recorded;
        }
        if let Some(d) = &report.divergence {
            tracing::warn!(
                target: "urnrand.audit",
                event = "history_diverged",
                study,
                row = d.row,
                participant = %d.id,
                "history does not replay"
            );
        }
        Ok(report)
    }
}

impl StudyHandle {
    fn new(config: StudyConfig, policy: Arc<dyn UrnSelectionPolicy>) -> Self {
        let seed_state = config.starting_seed.map(RngState::from_seed);
        Self {
            config,
            policy,
            seed_state,
            gate: Mutex::new(()),
        }
    }

    fn seed_state(&self) -> UrnResult<RngState> {
        self.seed_state.ok_or_else(|| {
            UrnError::IncompatibleRngState(format!(
                "study {} has no starting seed",
                self.config.name
            ))
        })
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("policies", &self.policies)
            .field("open_studies", &self.studies.read().len())
            .finish()
    }
}

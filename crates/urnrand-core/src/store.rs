// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::audit::{history_root, leaf_hash, record_bytes, Hash32};
use crate::error::{UrnError, UrnResult};
use crate::participant::{FactorLevels, ParticipantRow};
use crate::rng::RngBlob;

/// Lazily consumed rows. The iterator reads from a snapshot taken when
/// `list` was called, so concurrent appends are not observed.
pub type RowStream = Box<dyn Iterator<Item = Arc<ParticipantRow>> + Send>;

/// Exclusive hold on one study's history. Released on drop.
pub struct StudyGuard(Option<Box<dyn Send>>);

impl StudyGuard {
    /// A guard for stores that have no other writers to exclude.
    pub fn unshared() -> Self {
        Self(None)
    }

    pub(crate) fn holding(inner: impl Send + 'static) -> Self {
        Self(Some(Box::new(inner)))
    }
}

impl std::fmt::Debug for StudyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyGuard")
            .field("held", &self.0.is_some())
            .finish()
    }
}

/// Append-only record of assignments, partitioned by study.
pub trait ParticipantStore: Send + Sync {
    /// Registers a study. Idempotent.
    fn init_study(&self, study: &str) -> UrnResult<()>;
    /// Excludes every other writer of `study`, including other processes
    /// sharing the same storage, until the guard is dropped. Rows
    /// committed before the call are visible to reads made under it.
    fn lock_study(&self, study: &str) -> UrnResult<StudyGuard>;
    fn append(&self, study: &str, row: ParticipantRow) -> UrnResult<u64>;
    fn list(&self, study: &str, filter: &FactorLevels) -> UrnResult<RowStream>;
    fn latest_rng_state(&self, study: &str) -> UrnResult<Option<RngBlob>>;
    fn count(&self, study: &str) -> UrnResult<u64>;
    fn contains(&self, study: &str, id: &str) -> UrnResult<bool>;
    /// Appends every row or none of them.
    fn bulk_import(&self, study: &str, rows: Vec<ParticipantRow>) -> UrnResult<()>;
    fn history_root(&self, study: &str) -> UrnResult<Hash32>;
    /// Initialised studies, sorted by name.
    fn studies(&self) -> UrnResult<Vec<String>>;
}

/// In-memory view of one study's history, shared by both store backends.
#[derive(Debug, Default)]
pub(crate) struct StudyLedger {
    rows: Vec<Arc<ParticipantRow>>,
    ids: HashSet<String>,
    leaves: Vec<Hash32>,
}

impl StudyLedger {
    pub(crate) fn len(&self) -> u64 {
        self.rows.len() as u64
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Rejects ids already present, and ids repeated within `rows`.
    pub(crate) fn check_new(&self, rows: &[ParticipantRow]) -> UrnResult<()> {
        let mut batch = HashSet::with_capacity(rows.len());
        for row in rows {
            if self.ids.contains(&row.id) || !batch.insert(row.id.as_str()) {
                return Err(UrnError::DuplicateParticipantId(row.id.clone()));
            }
        }
        Ok(())
    }

    pub(crate) fn push(&mut self, row: ParticipantRow, record: &[u8]) -> u64 {
        let idx = self.len();
        self.leaves.push(leaf_hash(record));
        self.ids.insert(row.id.clone());
        self.rows.push(Arc::new(row));
        idx
    }

    pub(crate) fn stream(&self, filter: &FactorLevels) -> RowStream {
        let snapshot = self.rows.clone();
        if filter.is_empty() {
            return Box::new(snapshot.into_iter());
        }
        let filter = filter.clone();
        Box::new(snapshot.into_iter().filter(move |row| row.matches(&filter)))
    }

    pub(crate) fn latest_rng_state(&self) -> Option<RngBlob> {
        self.rows.last().and_then(|row| row.bg_state.clone())
    }

    pub(crate) fn root(&self) -> Hash32 {
        history_root(&self.leaves)
    }
}

fn unknown_study(study: &str) -> UrnError {
    UrnError::NotFound(format!("study {study}"))
}

#[derive(Debug, Default)]
pub struct MemoryParticipantStore {
    studies: RwLock<HashMap<String, StudyLedger>>,
}

impl MemoryParticipantStore {
    fn read<T>(&self, study: &str, f: impl FnOnce(&StudyLedger) -> T) -> UrnResult<T> {
        let guard = self.studies.read();
        let ledger = guard.get(study).ok_or_else(|| unknown_study(study))?;
        Ok(f(ledger))
    }
}

impl ParticipantStore for MemoryParticipantStore {
    fn init_study(&self, study: &str) -> UrnResult<()> {
        self.studies.write().entry(study.to_string()).or_default();
        Ok(())
    }

    fn lock_study(&self, study: &str) -> UrnResult<StudyGuard> {
        self.read(study, |_| StudyGuard::unshared())
    }

    fn append(&self, study: &str, row: ParticipantRow) -> UrnResult<u64> {
        let record = record_bytes(&row)?;
        let mut guard = self.studies.write();
        let ledger = guard.get_mut(study).ok_or_else(|| unknown_study(study))?;
        ledger.check_new(std::slice::from_ref(&row))?;
        Ok(ledger.push(row, &record))
    }

    fn list(&self, study: &str, filter: &FactorLevels) -> UrnResult<RowStream> {
        self.read(study, |l| l.stream(filter))
    }

    fn latest_rng_state(&self, study: &str) -> UrnResult<Option<RngBlob>> {
        self.read(study, StudyLedger::latest_rng_state)
    }

    fn count(&self, study: &str) -> UrnResult<u64> {
        self.read(study, StudyLedger::len)
    }

    fn contains(&self, study: &str, id: &str) -> UrnResult<bool> {
        self.read(study, |l| l.contains(id))
    }

    fn bulk_import(&self, study: &str, rows: Vec<ParticipantRow>) -> UrnResult<()> {
        let records = rows.iter().map(record_bytes).collect::<UrnResult<Vec<_>>>()?;
        let mut guard = self.studies.write();
        let ledger = guard.get_mut(study).ok_or_else(|| unknown_study(study))?;
        ledger.check_new(&rows)?;
        for (row, record) in rows.into_iter().zip(records) {
            ledger.push(row, &record);
        }
        Ok(())
    }

    fn history_root(&self, study: &str) -> UrnResult<Hash32> {
        self.read(study, StudyLedger::root)
    }

    fn studies(&self) -> UrnResult<Vec<String>> {
        let mut names: Vec<String> = self.studies.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    pub(crate) fn row(id: &str, site: &str, trt: &str) -> ParticipantRow {
        ParticipantRow {
            id: id.to_string(),
            user: "tester".to_string(),
            levels: FactorLevels::from([("site".to_string(), site.to_string())]),
            trt: trt.to_string(),
            datetime: datetime!(2026-01-05 12:00:00 UTC),
            bg_state: None,
        }
    }

    #[test]
    fn unknown_study_is_not_found() {
        let store = MemoryParticipantStore::default();
        assert!(matches!(store.count("nope"), Err(UrnError::NotFound(_))));
        assert!(matches!(
            store.append("nope", row("p1", "north", "A")),
            Err(UrnError::NotFound(_))
        ));
    }

    #[test]
    fn lock_requires_a_known_study() {
        let store = MemoryParticipantStore::default();
        assert!(matches!(store.lock_study("nope"), Err(UrnError::NotFound(_))));
        store.init_study("s").expect("init");
        let _guard = store.lock_study("s").expect("lock");
        store.append("s", row("p1", "north", "A")).expect("append under guard");
    }

    #[test]
    fn append_rejects_duplicate_ids() {
        let store = MemoryParticipantStore::default();
        store.init_study("s").expect("init");
        assert_eq!(store.append("s", row("p1", "north", "A")).expect("append"), 0);
        assert_eq!(
            store.append("s", row("p1", "south", "B")),
            Err(UrnError::DuplicateParticipantId("p1".into()))
        );
        assert_eq!(store.count("s").expect("count"), 1);
    }

    #[test]
    fn list_filters_and_ignores_later_appends() {
        let store = MemoryParticipantStore::default();
        store.init_study("s").expect("init");
        store.append("s", row("p1", "north", "A")).expect("append");
        store.append("s", row("p2", "south", "B")).expect("append");
        let filter = FactorLevels::from([("site".to_string(), "north".to_string())]);
        let stream = store.list("s", &filter).expect("list");
        store.append("s", row("p3", "north", "B")).expect("append");
        let ids: Vec<String> = stream.map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec!["p1"]);
        assert_eq!(store.list("s", &FactorLevels::new()).expect("list").count(), 3);
    }

    #[test]
    fn bulk_import_is_all_or_nothing() {
        let store = MemoryParticipantStore::default();
        store.init_study("s").expect("init");
        store.append("s", row("p1", "north", "A")).expect("append");
        let err = store
            .bulk_import(
                "s",
                vec![row("p2", "north", "A"), row("p3", "south", "B"), row("p2", "south", "A")],
            )
            .expect_err("duplicate in batch");
        assert_eq!(err, UrnError::DuplicateParticipantId("p2".into()));
        assert_eq!(store.count("s").expect("count"), 1);
        assert!(!store.contains("s", "p3").expect("contains"));
    }

    #[test]
    fn latest_state_tracks_last_row() {
        let store = MemoryParticipantStore::default();
        store.init_study("s").expect("init");
        assert_eq!(store.latest_rng_state("s").expect("state"), None);
        let mut r = row("p1", "north", "A");
        r.bg_state = Some(RngBlob::from_bytes(vec![1, 2, 3]));
        store.append("s", r).expect("append");
        assert_eq!(
            store.latest_rng_state("s").expect("state"),
            Some(RngBlob::from_bytes(vec![1, 2, 3]))
        );
    }
}

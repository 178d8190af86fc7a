// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{UrnError, UrnResult};
use crate::rng::RngBlob;

/// Factor name to level. Also used as a conjunctive filter over rows.
pub type FactorLevels = BTreeMap<String, String>;

/// A participant awaiting assignment: the caller supplies identity and
/// strata, the engine supplies everything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewParticipant {
    pub id: String,
    pub user: String,
    pub levels: FactorLevels,
}

impl NewParticipant {
    pub fn new(id: impl Into<String>, user: impl Into<String>, levels: FactorLevels) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            levels,
        }
    }

    pub(crate) fn check_id(&self) -> UrnResult<()> {
        check_participant_id(&self.id)
    }
}

/// A persisted assignment. `bg_state` is the generator state after this
/// row's draw; it is `None` only for rows imported without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRow {
    pub id: String,
    pub user: String,
    pub levels: FactorLevels,
    pub trt: String,
    #[serde(with = "time::serde::rfc3339")]
    pub datetime: OffsetDateTime,
    #[serde(default)]
    pub bg_state: Option<RngBlob>,
}

impl ParticipantRow {
    pub fn matches(&self, filter: &FactorLevels) -> bool {
        filter
            .iter()
            .all(|(factor, level)| self.levels.get(factor) == Some(level))
    }

    pub fn level(&self, factor: &str) -> Option<&str> {
        self.levels.get(factor).map(String::as_str)
    }
}

/// A row of pre-existing history offered for import. Timestamps and
/// generator snapshots are optional in foreign histories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub id: String,
    pub user: String,
    pub levels: FactorLevels,
    pub trt: String,
    pub datetime: Option<OffsetDateTime>,
    pub bg_state: Option<RngBlob>,
}

impl From<ParticipantRow> for HistoryRow {
    fn from(row: ParticipantRow) -> Self {
        Self {
            id: row.id,
            user: row.user,
            levels: row.levels,
            trt: row.trt,
            datetime: Some(row.datetime),
            bg_state: row.bg_state,
        }
    }
}

pub(crate) fn check_participant_id(id: &str) -> UrnResult<()> {
    if id.trim().is_empty() {
        return Err(UrnError::validation("participant id must be non-empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn row() -> ParticipantRow {
        ParticipantRow {
            id: "p1".into(),
            user: "nurse".into(),
            levels: FactorLevels::from([
                ("arm".to_string(), "x".to_string()),
                ("site".to_string(), "north".to_string()),
            ]),
            trt: "A".into(),
            datetime: datetime!(2026-03-01 09:30:00 UTC),
            bg_state: None,
        }
    }

    #[test]
    fn filter_is_conjunctive() {
        let r = row();
        assert!(r.matches(&FactorLevels::new()));
        assert!(r.matches(&FactorLevels::from([("site".into(), "north".into())])));
        assert!(!r.matches(&FactorLevels::from([
            ("site".into(), "north".into()),
            ("arm".into(), "y".into()),
        ])));
        assert!(!r.matches(&FactorLevels::from([("age".into(), "old".into())])));
    }

    #[test]
    fn row_json_uses_rfc3339_and_hex_state() {
        let mut r = row();
        r.bg_state = Some(RngBlob::from_bytes(vec![0xab, 0xcd]));
        let json = serde_json::to_value(&r).expect("json");
        assert_eq!(json["datetime"], "2026-03-01T09:30:00Z");
        assert_eq!(json["bg_state"], "abcd");
        let back: ParticipantRow = serde_json::from_value(json).expect("parse");
        assert_eq!(back, r);
    }

    #[test]
    fn blank_ids_are_rejected() {
        assert!(check_participant_id("  ").is_err());
        assert!(NewParticipant::new("p", "u", FactorLevels::new())
            .check_id()
            .is_ok());
    }
}

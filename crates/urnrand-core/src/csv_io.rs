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

//! CSV history format:
//!
//! ```text
//! id,user,f_<factor>...,trt,datetime,bg_state
//! ```
//!
//! Factor columns follow the factor names in ascending order. `datetime`
//! is RFC 3339 UTC and `bg_state` is the hex-encoded generator snapshot.
//! On import `datetime` and `bg_state` may be absent or empty. Header
//! names and those two machine-written cells are trimmed; every other cell
//! is taken verbatim, so ids and labels survive an export round trip.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::StudyConfig;
use crate::error::{UrnError, UrnResult};
use crate::participant::{FactorLevels, HistoryRow, NewParticipant, ParticipantRow};
use crate::rng::RngBlob;

const FACTOR_PREFIX: &str = "f_";

pub fn header(config: &StudyConfig) -> Vec<String> {
    let mut cols = vec!["id".to_string(), "user".to_string()];
    cols.extend(config.factor_names().map(|f| format!("{FACTOR_PREFIX}{f}")));
    cols.extend(["trt", "datetime", "bg_state"].map(String::from));
    cols
}

fn write_err(e: impl std::fmt::Display) -> UrnError {
    UrnError::Storage(format!("write csv: {e}"))
}

/// Writes `rows` with a header line and returns the number of rows.
pub fn write_history<W: Write>(
    config: &StudyConfig,
    rows: impl IntoIterator<Item = Arc<ParticipantRow>>,
    out: W,
) -> UrnResult<u64> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(header(config)).map_err(write_err)?;
    let mut written = 0u64;
    for row in rows {
        let mut record = Vec::with_capacity(config.factors.len() + 5);
        record.push(row.id.clone());
        record.push(row.user.clone());
        for factor in config.factor_names() {
            record.push(row.level(factor).unwrap_or_default().to_string());
        }
        record.push(row.trt.clone());
        record.push(row.datetime.format(&Rfc3339).map_err(write_err)?);
        record.push(row.bg_state.as_ref().map(RngBlob::to_hex).unwrap_or_default());
        writer.write_record(&record).map_err(write_err)?;
        written += 1;
    }
    writer.flush().map_err(|e| UrnError::io("flush csv", e))?;
    Ok(written)
}

/// Column positions resolved from a header line.
struct Columns {
    id: usize,
    user: usize,
    factors: BTreeMap<String, usize>,
    trt: Option<usize>,
    datetime: Option<usize>,
    bg_state: Option<usize>,
}

impl Columns {
    fn resolve(config: &StudyConfig, headers: &csv::StringRecord) -> UrnResult<Self> {
        let mut id = None;
        let mut user = None;
        let mut factors = BTreeMap::new();
        let mut trt = None;
        let mut datetime = None;
        let mut bg_state = None;
        for (pos, name) in headers.iter().enumerate() {
            let slot = match name {
                "id" => &mut id,
                "user" => &mut user,
                "trt" => &mut trt,
                "datetime" => &mut datetime,
                "bg_state" => &mut bg_state,
                other => match other.strip_prefix(FACTOR_PREFIX) {
                    Some(factor) if config.factors.contains_key(factor) => {
                        if factors.insert(factor.to_string(), pos).is_some() {
                            return Err(UrnError::validation(format!("duplicate column {other:?}")));
                        }
                        continue;
                    }
                    Some(factor) => return Err(UrnError::UnknownFactor(factor.to_string())),
                    None => {
                        return Err(UrnError::validation(format!("unexpected column {other:?}")))
                    }
                },
            };
            if slot.replace(pos).is_some() {
                return Err(UrnError::validation(format!("duplicate column {name:?}")));
            }
        }
        if let Some(missing) = config.factor_names().find(|f| !factors.contains_key(*f)) {
            return Err(UrnError::validation(format!(
                "missing column {FACTOR_PREFIX}{missing}"
            )));
        }
        let required = |col: Option<usize>, name: &str| {
            col.ok_or_else(|| UrnError::validation(format!("missing column {name}")))
        };
        Ok(Self {
            id: required(id, "id")?,
            user: required(user, "user")?,
            factors,
            trt,
            datetime,
            bg_state,
        })
    }
}

fn field(record: &csv::StringRecord, pos: Option<usize>) -> Option<&str> {
    pos.and_then(|p| record.get(p)).filter(|v| !v.is_empty())
}

fn trimmed_field(record: &csv::StringRecord, pos: Option<usize>) -> Option<&str> {
    field(record, pos).map(str::trim).filter(|v| !v.is_empty())
}

fn line_of(record: &csv::StringRecord) -> u64 {
    record.position().map_or(0, csv::Position::line)
}

/// Identity and factor levels shared by both import shapes.
fn participant_fields(cols: &Columns, record: &csv::StringRecord) -> (String, String, FactorLevels) {
    let id = field(record, Some(cols.id)).unwrap_or_default().to_string();
    let user = field(record, Some(cols.user)).unwrap_or_default().to_string();
    let levels = cols
        .factors
        .iter()
        .map(|(factor, pos)| {
            let level = field(record, Some(*pos)).unwrap_or_default();
            (factor.clone(), level.to_string())
        })
        .collect();
    (id, user, levels)
}

fn records<R: Read>(input: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(input)
}

fn read_err(e: csv::Error) -> UrnError {
    UrnError::validation(format!("read csv: {e}"))
}

/// Parses an exported history for `import_history`.
pub fn read_history<R: Read>(config: &StudyConfig, input: R) -> UrnResult<Vec<HistoryRow>> {
    let mut reader = records(input);
    let cols = Columns::resolve(config, reader.headers().map_err(read_err)?)?;
    if cols.trt.is_none() {
        return Err(UrnError::validation("missing column trt"));
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_err)?;
        let line = line_of(&record);
        let (id, user, levels) = participant_fields(&cols, &record);
        let trt = field(&record, cols.trt)
            .ok_or_else(|| UrnError::validation(format!("line {line}: empty trt")))?
            .to_string();
        let datetime = trimmed_field(&record, cols.datetime)
            .map(|raw| {
                OffsetDateTime::parse(raw, &Rfc3339).map_err(|e| {
                    UrnError::validation(format!("line {line}: datetime {raw:?}: {e}"))
                })
            })
            .transpose()?;
        let bg_state = trimmed_field(&record, cols.bg_state)
            .map(RngBlob::from_hex)
            .transpose()?;
        rows.push(HistoryRow {
            id,
            user,
            levels,
            trt,
            datetime,
            bg_state,
        });
    }
    Ok(rows)
}

/// Parses unassigned participants for `upload_new_participants`. Export
/// columns may be present but must be empty.
pub fn read_new_participants<R: Read>(
    config: &StudyConfig,
    input: R,
) -> UrnResult<Vec<NewParticipant>> {
    let mut reader = records(input);
    let cols = Columns::resolve(config, reader.headers().map_err(read_err)?)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(read_err)?;
        let assigned = [
            ("trt", cols.trt),
            ("datetime", cols.datetime),
            ("bg_state", cols.bg_state),
        ];
        for (name, pos) in assigned {
            if trimmed_field(&record, pos).is_some() {
                return Err(UrnError::validation(format!(
                    "line {}: {name} is assigned by the engine and must be empty",
                    line_of(&record)
                )));
            }
        }
        let (id, user, levels) = participant_fields(&cols, &record);
        rows.push(NewParticipant { id, user, levels });
    }
    Ok(rows)
}

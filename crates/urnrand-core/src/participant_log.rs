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

//! Durable participant store. Each study is one append-only file of
//! length-prefixed JSON records:
//!
//! ```text
//! [len: u32 LE][ParticipantRow as JSON; len bytes] ...
//! ```
//!
//! A failed write truncates the file back to its previous length, so a
//! batch lands completely or not at all.
//!
//! Writers on the same data directory serialise on an advisory lock held
//! on the `<study>.lock` sidecar. Each handle caches the replayed log and
//! reads only the bytes appended since it last looked.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs4::fs_std::FileExt;
use parking_lot::{Mutex, RwLock};

use crate::audit::{record_bytes, Hash32};
use crate::config::validate_study_name;
use crate::error::{UrnError, UrnResult};
use crate::participant::{FactorLevels, ParticipantRow};
use crate::rng::RngBlob;
use crate::store::{ParticipantStore, RowStream, StudyGuard, StudyLedger};

fn frame_len(len: usize) -> UrnResult<u32> {
    u32::try_from(len).map_err(|_| UrnError::Storage(format!("record of {len} bytes too large")))
}

/// Reads every record of a log. A torn tail is reported, not skipped.
pub fn read_records(mut reader: impl Read) -> UrnResult<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    let mut offset = 0u64;
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            // A partial prefix also lands here; callers compare the
            // consumed length against the file size.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(UrnError::io("read record length", e)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut data = Vec::new();
        reader
            .by_ref()
            .take(len as u64)
            .read_to_end(&mut data)
            .map_err(|e| UrnError::io("read record", e))?;
        if data.len() != len {
            return Err(UrnError::Storage(format!(
                "truncated record at offset {offset}"
            )));
        }
        offset = offset.saturating_add(4 + len as u64);
        records.push(data);
    }
    Ok(records)
}

#[derive(Debug)]
struct StudyLog {
    path: PathBuf,
    file: File,
    ledger: StudyLedger,
    /// Bytes of the file already replayed into `ledger`.
    synced: u64,
}

impl StudyLog {
    fn open(path: PathBuf, create: bool) -> UrnResult<Self> {
        let file = OpenOptions::new()
            .create(create)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| UrnError::io(&format!("open {}", path.display()), e))?;
        let mut log = Self {
            path,
            file,
            ledger: StudyLedger::default(),
            synced: 0,
        };
        log.refresh()?;
        tracing::debug!(
            target: "urnrand.store",
            path = %log.path.display(),
            rows = log.ledger.len(),
            "participant log opened"
        );
        Ok(log)
    }

    /// Replays records another handle appended after `synced`.
    fn refresh(&mut self) -> UrnResult<()> {
        let len = self
            .file
            .metadata()
            .map_err(|e| UrnError::io(&format!("stat {}", self.path.display()), e))?
            .len();
        if len == self.synced {
            return Ok(());
        }
        if len < self.synced {
            return Err(UrnError::Storage(format!(
                "{}: shrank from {} to {len} bytes",
                self.path.display(),
                self.synced
            )));
        }
        let mut reader = File::open(&self.path)
            .map_err(|e| UrnError::io(&format!("open {}", self.path.display()), e))?;
        reader
            .seek(SeekFrom::Start(self.synced))
            .map_err(|e| UrnError::io(&format!("seek {}", self.path.display()), e))?;
        let tail = len - self.synced;
        let records = read_records(BufReader::new(reader).take(tail))?;
        let consumed: u64 = records.iter().map(|r| 4 + r.len() as u64).sum();
        if consumed != tail {
            return Err(UrnError::Storage(format!(
                "{}: trailing {} bytes after last record",
                self.path.display(),
                tail - consumed
            )));
        }
        let before = self.ledger.len();
        let mut fresh = HashSet::with_capacity(records.len());
        let mut rows = Vec::with_capacity(records.len());
        for (idx, record) in records.iter().enumerate() {
            let at = before + idx as u64;
            let row: ParticipantRow = serde_json::from_slice(record).map_err(|e| {
                UrnError::Storage(format!("{}: record {at}: {e}", self.path.display()))
            })?;
            if self.ledger.contains(&row.id) || !fresh.insert(row.id.clone()) {
                return Err(UrnError::Storage(format!(
                    "{}: record {at}: participant id {} already recorded",
                    self.path.display(),
                    row.id
                )));
            }
            rows.push(row);
        }
        for (row, record) in rows.into_iter().zip(&records) {
            self.ledger.push(row, record);
        }
        self.synced = len;
        if before > 0 {
            tracing::debug!(
                target: "urnrand.store",
                path = %self.path.display(),
                rows = self.ledger.len() - before,
                "replayed rows written by another handle"
            );
        }
        Ok(())
    }

    fn write_batch(&mut self, records: &[Vec<u8>], fsync: bool) -> UrnResult<()> {
        let mut buf = Vec::with_capacity(records.iter().map(|r| 4 + r.len()).sum());
        for record in records {
            buf.extend_from_slice(&frame_len(record.len())?.to_le_bytes());
            buf.extend_from_slice(record);
        }
        let start = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| UrnError::io("seek participant log", e))?;
        let written = self.file.write_all(&buf).and_then(|()| {
            if fsync {
                self.file.sync_data()
            } else {
                self.file.flush()
            }
        });
        if let Err(e) = written {
            if let Err(trunc) = self.file.set_len(start) {
                tracing::error!(
                    target: "urnrand.store",
                    path = %self.path.display(),
                    error = %trunc,
                    "failed to roll back partial write"
                );
            }
            return Err(UrnError::io(&format!("append {}", self.path.display()), e));
        }
        self.synced = start + buf.len() as u64;
        Ok(())
    }
}

/// Participant histories under `<data_dir>/participants/<study>.log`.
#[derive(Debug)]
pub struct FileParticipantStore {
    dir: PathBuf,
    fsync: bool,
    logs: RwLock<HashMap<String, Arc<Mutex<StudyLog>>>>,
}

impl FileParticipantStore {
    pub fn open(data_dir: &Path, fsync: bool) -> UrnResult<Self> {
        let dir = data_dir.join("participants");
        fs::create_dir_all(&dir).map_err(|e| UrnError::io("create participant dir", e))?;
        Ok(Self {
            dir,
            fsync,
            logs: RwLock::new(HashMap::new()),
        })
    }

    fn path_for(&self, study: &str) -> UrnResult<PathBuf> {
        validate_study_name(study)?;
        Ok(self.dir.join(format!("{study}.log")))
    }

    /// Takes the OS lock on `<study>.lock`. A second handle, in this process
    /// or another, blocks here until the first guard is dropped. The kernel
    /// drops the lock if its holder dies.
    fn exclusive(&self, study: &str, create: bool) -> UrnResult<File> {
        let path = self.path_for(study)?;
        if !create && !path.exists() {
            return Err(UrnError::NotFound(format!("study {study}")));
        }
        let lock_path = path.with_extension("lock");
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| UrnError::io(&format!("open {}", lock_path.display()), e))?;
        lock.lock_exclusive()
            .map_err(|e| UrnError::io(&format!("lock {}", lock_path.display()), e))?;
        Ok(lock)
    }

    fn log(&self, study: &str, create: bool) -> UrnResult<Arc<Mutex<StudyLog>>> {
        if let Some(log) = self.logs.read().get(study) {
            return Ok(Arc::clone(log));
        }
        let path = self.path_for(study)?;
        let mut logs = self.logs.write();
        if let Some(log) = logs.get(study) {
            return Ok(Arc::clone(log));
        }
        if !create && !path.exists() {
            return Err(UrnError::NotFound(format!("study {study}")));
        }
        let log = Arc::new(Mutex::new(StudyLog::open(path, create)?));
        logs.insert(study.to_string(), Arc::clone(&log));
        Ok(log)
    }

    fn append_rows(&self, study: &str, rows: Vec<ParticipantRow>) -> UrnResult<u64> {
        let records = rows.iter().map(record_bytes).collect::<UrnResult<Vec<_>>>()?;
        let log = self.log(study, false)?;
        let mut log = log.lock();
        log.refresh()?;
        log.ledger.check_new(&rows)?;
        log.write_batch(&records, self.fsync)?;
        let first = log.ledger.len();
        for (row, record) in rows.into_iter().zip(&records) {
            log.ledger.push(row, record);
        }
        Ok(first)
    }
}

impl ParticipantStore for FileParticipantStore {
    fn init_study(&self, study: &str) -> UrnResult<()> {
        let _lock = self.exclusive(study, true)?;
        self.log(study, true).map(|_| ())
    }

    fn lock_study(&self, study: &str) -> UrnResult<StudyGuard> {
        let lock = self.exclusive(study, false)?;
        self.log(study, false)?.lock().refresh()?;
        Ok(StudyGuard::holding(lock))
    }

    fn append(&self, study: &str, row: ParticipantRow) -> UrnResult<u64> {
        self.append_rows(study, vec![row])
    }

    fn list(&self, study: &str, filter: &FactorLevels) -> UrnResult<RowStream> {
        Ok(self.log(study, false)?.lock().ledger.stream(filter))
    }

    fn latest_rng_state(&self, study: &str) -> UrnResult<Option<RngBlob>> {
        Ok(self.log(study, false)?.lock().ledger.latest_rng_state())
    }

    fn count(&self, study: &str) -> UrnResult<u64> {
        Ok(self.log(study, false)?.lock().ledger.len())
    }

    fn contains(&self, study: &str, id: &str) -> UrnResult<bool> {
        Ok(self.log(study, false)?.lock().ledger.contains(id))
    }

    fn bulk_import(&self, study: &str, rows: Vec<ParticipantRow>) -> UrnResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.append_rows(study, rows).map(|_| ())
    }

    fn history_root(&self, study: &str) -> UrnResult<Hash32> {
        Ok(self.log(study, false)?.lock().ledger.root())
    }

    fn studies(&self) -> UrnResult<Vec<String>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| UrnError::io("list participant dir", e))?;
        for entry in entries {
            let path = entry.map_err(|e| UrnError::io("list participant dir", e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) if validate_study_name(stem).is_ok() => out.push(stem.to_string()),
                _ => {}
            }
        }
        out.sort();
        Ok(out)
    }
}

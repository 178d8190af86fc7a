// Copyright (c) 2026 urnrand Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use crate::config::validate_study_name;
use crate::error::{UrnError, UrnResult};

/// Small-blob key/value store keyed by `(study, parameter)`.
pub trait ConfigStore: Send + Sync {
    fn get(&self, study: &str, key: &str) -> UrnResult<Option<String>>;
    fn set(&self, study: &str, key: &str, value: &str) -> UrnResult<()>;
    /// Writes several keys so that readers observe either none or all of them.
    fn set_all(&self, study: &str, entries: &[(&str, String)]) -> UrnResult<()>;
    fn studies(&self) -> UrnResult<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    entries: RwLock<BTreeMap<String, BTreeMap<String, String>>>,
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, study: &str, key: &str) -> UrnResult<Option<String>> {
        Ok(self
            .entries
            .read()
            .get(study)
            .and_then(|m| m.get(key))
            .cloned())
    }

    fn set(&self, study: &str, key: &str, value: &str) -> UrnResult<()> {
        self.entries
            .write()
            .entry(study.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn set_all(&self, study: &str, entries: &[(&str, String)]) -> UrnResult<()> {
        let mut guard = self.entries.write();
        let map = guard.entry(study.to_string()).or_default();
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn studies(&self) -> UrnResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// One JSON document per study under `<data_dir>/studies/`.
#[derive(Debug)]
pub struct FileConfigStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn open(data_dir: &Path) -> UrnResult<Self> {
        let dir = data_dir.join("studies");
        fs::create_dir_all(&dir).map_err(|e| UrnError::io("create config dir", e))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, study: &str) -> UrnResult<PathBuf> {
        validate_study_name(study)?;
        Ok(self.dir.join(format!("{study}.json")))
    }

    fn read_map(&self, study: &str) -> UrnResult<BTreeMap<String, String>> {
        let path = self.path_for(study)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(UrnError::io(&format!("read {}", path.display()), e)),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| UrnError::Storage(format!("parse {}: {e}", path.display())))
    }

    fn write_map(&self, study: &str, map: &BTreeMap<String, String>) -> UrnResult<()> {
        let path = self.path_for(study)?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(map)
            .map_err(|e| UrnError::Storage(format!("encode config: {e}")))?;
        let mut file = fs::File::create(&tmp)
            .map_err(|e| UrnError::io(&format!("create {}", tmp.display()), e))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| UrnError::io(&format!("write {}", tmp.display()), e))?;
        fs::rename(&tmp, &path).map_err(|e| UrnError::io(&format!("rename {}", path.display()), e))
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, study: &str, key: &str) -> UrnResult<Option<String>> {
        Ok(self.read_map(study)?.remove(key))
    }

    fn set(&self, study: &str, key: &str, value: &str) -> UrnResult<()> {
        self.set_all(study, &[(key, value.to_string())])
    }

    fn set_all(&self, study: &str, entries: &[(&str, String)]) -> UrnResult<()> {
        let _guard = self.write_lock.lock();
        let mut map = self.read_map(study)?;
        for (key, value) in entries {
            map.insert((*key).to_string(), value.clone());
        }
        self.write_map(study, &map)
    }

    fn studies(&self) -> UrnResult<Vec<String>> {
        let mut out = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| UrnError::io("list config dir", e))?;
        for entry in entries {
            let entry = entry.map_err(|e| UrnError::io("list config dir", e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
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
